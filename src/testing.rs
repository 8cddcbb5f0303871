//! In-memory mailbox and relay used by unit tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::mailbox::{Connector, MailboxConnection};
use crate::models::{FolderInfo, Message, RecentMessages, WatchOutcome};
use crate::relay::Relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
}

impl StoredMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Server-side state shared by every fake session
#[derive(Debug, Default)]
pub struct ServerState {
    pub folders: BTreeMap<String, Vec<StoredMessage>>,
    /// UIDNEXT per folder
    pub uid_next: BTreeMap<String, u32>,
    pub next_uid: u32,
    /// Connect attempts, successful or not
    pub connect_attempts: u32,
    /// Upcoming connect attempts that fail
    pub fail_connects: u32,
    /// Upcoming fetches that never complete
    pub hang_fetches: u32,
    /// Upcoming watches that never complete
    pub hang_watches: u32,
    /// UIDs whose flag update is refused
    pub refuse_flag_uids: Vec<u32>,
    /// A change is pending for the next watch
    pub pending_change: bool,
    pub live_sessions: u32,
    pub max_live_sessions: u32,
    pub fetches: u32,
    pub selects: u32,
    pub watches: u32,
    pub expunges: u32,
}

impl ServerState {
    fn store(&mut self, folder: &str, flags: Vec<String>, raw: Vec<u8>) -> u32 {
        self.next_uid += 1;
        let uid = self.next_uid;
        self.uid_next.insert(folder.to_owned(), uid + 1);
        self.folders
            .entry(folder.to_owned())
            .or_default()
            .push(StoredMessage { uid, flags, raw });
        uid
    }

    fn folder_info(&self, folder: &str) -> AppResult<FolderInfo> {
        let messages = self
            .folders
            .get(folder)
            .ok_or_else(|| AppError::Mailbox(format!("no mailbox '{folder}'")))?;
        Ok(FolderInfo {
            exists: messages.len() as u32,
            uid_validity: Some(1),
            uid_next: Some(self.uid_next.get(folder).copied().unwrap_or(1)),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("fake server state poisoned")
    }

    /// Deliver a message with no flags; returns its UID
    pub fn deliver(&self, folder: &str, raw: &str) -> u32 {
        self.deliver_with_flags(folder, raw, &[])
    }

    pub fn deliver_with_flags(&self, folder: &str, raw: &str, flags: &[&str]) -> u32 {
        self.state().store(
            folder,
            flags.iter().map(|f| (*f).to_owned()).collect(),
            raw.as_bytes().to_vec(),
        )
    }

    pub fn messages(&self, folder: &str) -> Vec<StoredMessage> {
        self.state().folders.get(folder).cloned().unwrap_or_default()
    }
}

pub struct FakeConnection {
    server: Arc<FakeServer>,
    selected: Option<String>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        let mut state = self.server.state();
        state.live_sessions = state.live_sessions.saturating_sub(1);
    }
}

impl FakeConnection {
    fn selected(&self) -> AppResult<String> {
        self.selected
            .clone()
            .ok_or_else(|| AppError::Mailbox("no folder selected".to_owned()))
    }
}

#[async_trait]
impl MailboxConnection for FakeConnection {
    async fn select_folder(&mut self, folder: &str) -> AppResult<FolderInfo> {
        let info = {
            let mut state = self.server.state();
            state.selects += 1;
            state.folder_info(folder)?
        };
        self.selected = Some(folder.to_owned());
        Ok(info)
    }

    async fn fetch_recent(&mut self, folder: &str, max_count: u32) -> AppResult<RecentMessages> {
        let info = self.select_folder(folder).await?;
        let hang = {
            let mut state = self.server.state();
            state.fetches += 1;
            if state.hang_fetches > 0 {
                state.hang_fetches -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        let state = self.server.state();
        let messages = &state.folders[folder];
        let skip = messages.len().saturating_sub(max_count as usize);
        Ok(RecentMessages {
            folder: info,
            messages: messages
                .iter()
                .skip(skip)
                .map(|m| Message {
                    uid: m.uid,
                    flags: m.flags.clone(),
                    raw: m.raw.clone(),
                })
                .collect(),
        })
    }

    async fn set_flag(&mut self, uid: u32, flag: &str) -> AppResult<()> {
        let folder = self.selected()?;
        let mut state = self.server.state();
        if state.refuse_flag_uids.contains(&uid) {
            return Err(AppError::Message(format!("STORE refused for uid {uid}")));
        }
        let message = state
            .folders
            .get_mut(&folder)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.uid == uid))
            .ok_or_else(|| AppError::Message(format!("uid {uid} not found")))?;
        if !message.flags.iter().any(|f| f == flag) {
            message.flags.push(flag.to_owned());
        }
        Ok(())
    }

    async fn append_message(
        &mut self,
        folder: &str,
        flags: &[String],
        raw: &[u8],
    ) -> AppResult<()> {
        self.server.state().store(folder, flags.to_vec(), raw.to_vec());
        Ok(())
    }

    async fn mark_deleted_and_expunge(&mut self, uid: u32) -> AppResult<()> {
        let folder = self.selected()?;
        let mut state = self.server.state();
        state.expunges += 1;
        let messages = state
            .folders
            .get_mut(&folder)
            .ok_or_else(|| AppError::Message(format!("no mailbox '{folder}'")))?;
        messages.retain(|m| m.uid != uid);
        Ok(())
    }

    async fn wait_for_change(&mut self, timeout: Duration) -> AppResult<WatchOutcome> {
        self.selected()?;
        let (hang, changed) = {
            let mut state = self.server.state();
            state.watches += 1;
            let hang = state.hang_watches > 0;
            if hang {
                state.hang_watches -= 1;
            }
            (hang, std::mem::take(&mut state.pending_change))
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if changed {
            return Ok(WatchOutcome::Changed);
        }
        tokio::time::sleep(timeout).await;
        Ok(WatchOutcome::TimedOut)
    }
}

pub struct FakeConnector {
    pub server: Arc<FakeServer>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> AppResult<FakeConnection> {
        let mut state = self.server.state();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(AppError::Connect("connection refused".to_owned()));
        }
        state.live_sessions += 1;
        state.max_live_sessions = state.max_live_sessions.max(state.live_sessions);
        Ok(FakeConnection {
            server: Arc::clone(&self.server),
            selected: None,
        })
    }

    fn endpoint(&self) -> String {
        "fake:993".to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub sender: Option<String>,
    pub recipient: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CapturingRelay {
    pub sent: Mutex<Vec<Forwarded>>,
    pub refuse: bool,
}

impl CapturingRelay {
    pub fn sent(&self) -> Vec<Forwarded> {
        self.sent.lock().expect("relay log poisoned").clone()
    }
}

#[async_trait]
impl Relay for CapturingRelay {
    async fn submit(&self, sender: Option<&str>, recipient: &str, raw: &[u8]) -> AppResult<()> {
        if self.refuse {
            return Err(AppError::Relay("550 relaying denied".to_owned()));
        }
        self.sent.lock().expect("relay log poisoned").push(Forwarded {
            sender: sender.map(str::to_owned),
            recipient: recipient.to_owned(),
            raw: raw.to_vec(),
        });
        Ok(())
    }
}
