//! IMAP transport and session operations
//!
//! Implements [`MailboxConnection`] on top of `async-imap`. Connections are
//! TLS-only, every command is bounded by the socket timeout, and folder
//! names are sent in modified UTF-7.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{ImapAccount, Settings};
use crate::errors::{AppError, AppResult};
use crate::mailbox::{Connector, MailboxConnection};
use crate::models::{FolderInfo, Message, RecentMessages, WatchOutcome};

/// TLS stream every production session runs over
pub type TlsTransport = tokio_rustls::client::TlsStream<TcpStream>;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<TlsTransport>;

/// Byte stream an IMAP session can run over
pub trait ImapTransport: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send> ImapTransport for T {}

/// Servers may drop an IDLE older than 30 minutes, so long waits re-issue it
const IDLE_REFRESH: Duration = Duration::from_secs(29 * 60);

/// Items fetched per message; `BODY.PEEK` leaves `\Seen` alone
const FETCH_ITEMS: &str = "(UID FLAGS BODY.PEEK[])";

/// Opens sessions for one receiving account
pub struct ImapConnector {
    account: ImapAccount,
    settings: Settings,
}

impl ImapConnector {
    pub fn new(account: ImapAccount, settings: Settings) -> Self {
        Self { account, settings }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    type Connection = ImapConnection;

    async fn connect(&self) -> AppResult<ImapConnection> {
        let mut session = connect_authenticated(&self.settings, &self.account).await?;
        let idle_supported = capabilities(self.settings.socket_timeout, &mut session)
            .await?
            .has_str("IDLE");
        debug!(account = %self.account.name, idle_supported, "session established");
        if !idle_supported {
            warn!(
                account = %self.account.name,
                server = %self.endpoint(),
                "server does not advertise IDLE, falling back to polling"
            );
        }
        Ok(ImapConnection {
            session: Some(session),
            socket_timeout: self.settings.socket_timeout,
            poll_interval: self.settings.poll_interval,
            idle_refresh: IDLE_REFRESH,
            idle_supported,
            selected: None,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.account.host, self.account.port)
    }
}

/// One live session
///
/// Dropping it closes the socket without LOGOUT. `session` is only `None`
/// after an IDLE was abandoned midway, in which case every call fails and
/// the worker reconnects.
pub struct ImapConnection<T: ImapTransport = TlsTransport> {
    session: Option<Session<T>>,
    socket_timeout: Duration,
    poll_interval: Duration,
    idle_refresh: Duration,
    idle_supported: bool,
    /// Last selected folder and the state SELECT reported for it
    selected: Option<(String, FolderInfo)>,
}

impl<T: ImapTransport> ImapConnection<T> {
    fn session(&mut self) -> AppResult<&mut Session<T>> {
        self.session
            .as_mut()
            .ok_or_else(|| AppError::Mailbox("session lost during IDLE".to_owned()))
    }

    /// Wait using IMAP IDLE, re-issuing it before servers drop it
    async fn idle_wait(&mut self, limit: Duration) -> AppResult<WatchOutcome> {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(WatchOutcome::TimedOut);
            }

            let slice = remaining.min(self.idle_refresh);

            let session = self
                .session
                .take()
                .ok_or_else(|| AppError::Mailbox("session lost during IDLE".to_owned()))?;
            let mut handle = session.idle();
            timeout(self.socket_timeout, handle.init())
                .await
                .map_err(|_| AppError::Timeout("IDLE init timed out".to_owned()))
                .and_then(|r| r.map_err(|e| AppError::Mailbox(format!("IDLE failed: {e}"))))?;

            // The library timer restarts on every keepalive, so the slice is
            // bounded here as well.
            let response = {
                let (wait, _stop) = handle.wait_with_timeout(slice);
                match timeout(slice, wait).await {
                    Ok(response) => response
                        .map_err(|e| AppError::Mailbox(format!("IDLE wait failed: {e}")))?,
                    Err(_) => IdleResponse::Timeout,
                }
            };

            let session = timeout(self.socket_timeout, handle.done())
                .await
                .map_err(|_| AppError::Timeout("IDLE DONE timed out".to_owned()))
                .and_then(|r| r.map_err(|e| AppError::Mailbox(format!("IDLE DONE failed: {e}"))))?;
            self.session = Some(session);

            match response {
                IdleResponse::NewData(_) | IdleResponse::ManualInterrupt => {
                    return Ok(WatchOutcome::Changed);
                }
                IdleResponse::Timeout => debug!("IDLE slice elapsed"),
            }
        }
    }

    /// Wait by re-selecting the folder until new mail shows up
    ///
    /// The baseline is the state of the last SELECT, so mail that arrived
    /// before the wait started is reported on the first poll.
    async fn poll_wait(&mut self, limit: Duration) -> AppResult<WatchOutcome> {
        let (folder, baseline) = self
            .selected
            .clone()
            .ok_or_else(|| AppError::Mailbox("no folder selected to watch".to_owned()))?;
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(WatchOutcome::TimedOut);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
            if self.select_folder(&folder).await?.moved_on_from(&baseline) {
                return Ok(WatchOutcome::Changed);
            }
        }
    }
}

#[async_trait]
impl<T: ImapTransport> MailboxConnection for ImapConnection<T> {
    async fn select_folder(&mut self, folder: &str) -> AppResult<FolderInfo> {
        let socket = self.socket_timeout;
        let encoded = encode_folder(folder);
        let selected = timeout(socket, self.session()?.select(&encoded))
            .await
            .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::Mailbox(format!("cannot select mailbox '{folder}': {e}")))
            })?;
        let info = FolderInfo {
            exists: selected.exists,
            uid_validity: selected.uid_validity,
            uid_next: selected.uid_next,
        };
        self.selected = Some((folder.to_owned(), info));
        Ok(info)
    }

    async fn fetch_recent(&mut self, folder: &str, max_count: u32) -> AppResult<RecentMessages> {
        let info = self.select_folder(folder).await?;
        let Some(range) = recent_range(info.exists, max_count) else {
            return Ok(RecentMessages {
                folder: info,
                messages: Vec::new(),
            });
        };

        let socket = self.socket_timeout;
        let session = self.session()?;
        let stream = timeout(socket, session.fetch(range, FETCH_ITEMS))
            .await
            .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Mailbox(format!("fetch failed: {e}"))))?;
        let fetches: Vec<Fetch> = timeout(socket, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("FETCH stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Mailbox(format!("fetch stream failed: {e}"))))?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                warn!(seq = fetch.message, "server returned message without UID, skipping");
                continue;
            };
            let Some(body) = fetch.body() else {
                warn!(uid, "server returned no message body, skipping");
                continue;
            };
            messages.push(Message {
                uid,
                flags: flags_to_strings(fetch),
                raw: body.to_vec(),
            });
        }
        Ok(RecentMessages {
            folder: info,
            messages,
        })
    }

    async fn set_flag(&mut self, uid: u32, flag: &str) -> AppResult<()> {
        let socket = self.socket_timeout;
        uid_store(socket, self.session()?, uid, &format!("+FLAGS.SILENT ({flag})")).await
    }

    async fn append_message(
        &mut self,
        folder: &str,
        flags: &[String],
        raw: &[u8],
    ) -> AppResult<()> {
        let socket = self.socket_timeout;
        let encoded = encode_folder(folder);
        let flag_list = (!flags.is_empty()).then(|| format!("({})", flags.join(" ")));
        timeout(
            socket,
            self.session()?
                .append(&encoded, flag_list.as_deref(), None, raw),
        )
        .await
        .map_err(|_| AppError::Timeout("APPEND timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Message(format!("APPEND to '{folder}' failed: {e}"))))
    }

    async fn mark_deleted_and_expunge(&mut self, uid: u32) -> AppResult<()> {
        let socket = self.socket_timeout;
        let session = self.session()?;
        uid_store(socket, session, uid, "+FLAGS.SILENT (\\Deleted)").await?;
        let stream = timeout(socket, session.expunge())
            .await
            .map_err(|_| AppError::Timeout("EXPUNGE timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Message(format!("EXPUNGE failed: {e}"))))?;
        let _: Vec<u32> = timeout(socket, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("EXPUNGE stream timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Message(format!("EXPUNGE stream failed: {e}"))))?;
        Ok(())
    }

    async fn wait_for_change(&mut self, limit: Duration) -> AppResult<WatchOutcome> {
        if self.idle_supported {
            self.idle_wait(limit).await
        } else {
            self.poll_wait(limit).await
        }
    }
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with webpki root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Connect` for TCP, TLS, SNI or greeting failures
pub async fn connect_authenticated(
    settings: &Settings,
    account: &ImapAccount,
) -> AppResult<ImapSession> {
    let tcp = timeout(
        settings.connect_timeout,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connect(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::Connect("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(settings.greeting_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connect(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(settings.greeting_timeout, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connect(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Connect(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(
        settings.greeting_timeout,
        client.login(account.user.as_str(), pass),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                AppError::AuthFailed(msg)
            } else {
                AppError::Connect(msg)
            }
        })
    })?;

    Ok(session)
}

/// Query server capabilities
async fn capabilities<T: ImapTransport>(
    socket: Duration,
    session: &mut Session<T>,
) -> AppResult<async_imap::types::Capabilities> {
    timeout(socket, session.capabilities())
        .await
        .map_err(|_| AppError::Timeout("CAPABILITY timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connect(format!("CAPABILITY failed: {e}"))))
}

/// Store flags on a message
///
/// Runs `UID STORE` with a flag query string such as `+FLAGS.SILENT (x)`.
async fn uid_store<T: ImapTransport>(
    socket: Duration,
    session: &mut Session<T>,
    uid: u32,
    query: &str,
) -> AppResult<()> {
    let stream = timeout(socket, session.uid_store(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Message(format!("uid store failed: {e}"))))?;
    let _: Vec<Fetch> = timeout(socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Message(format!("uid store stream failed: {e}"))))?;
    Ok(())
}

/// Sequence range covering the `max_count` most recent of `exists` messages
fn recent_range(exists: u32, max_count: u32) -> Option<String> {
    if exists == 0 || max_count == 0 {
        return None;
    }
    let from = exists.saturating_sub(max_count) + 1;
    Some(format!("{from}:{exists}"))
}

/// Encode a folder name as IMAP modified UTF-7
fn encode_folder(folder: &str) -> String {
    utf7_imap::encode_utf7_imap(folder.to_owned())
}

/// Convert fetch flags to their wire spelling
fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(flag_to_string).collect()
}

fn flag_to_string(flag: Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_owned(),
        Flag::Answered => "\\Answered".to_owned(),
        Flag::Flagged => "\\Flagged".to_owned(),
        Flag::Deleted => "\\Deleted".to_owned(),
        Flag::Draft => "\\Draft".to_owned(),
        Flag::Recent => "\\Recent".to_owned(),
        Flag::MayCreate => "\\*".to_owned(),
        Flag::Custom(name) => name.into_owned(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_imap::Client;
    use async_imap::types::Flag;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::time::Instant;

    use super::{IDLE_REFRESH, ImapConnection, encode_folder, flag_to_string, recent_range};
    use crate::mailbox::MailboxConnection;
    use crate::models::WatchOutcome;

    /// Scripted behaviour of the in-memory server
    #[derive(Clone)]
    struct Script {
        /// `(EXISTS, UIDNEXT)` reported by successive SELECTs; the last repeats
        selects: Vec<(u32, u32)>,
        /// Untagged line pushed periodically while idling
        push: Option<(Duration, &'static str)>,
    }

    #[derive(Default)]
    struct Seen {
        selects: AtomicU32,
        idles: AtomicU32,
    }

    async fn serve(io: DuplexStream, script: Script, seen: Arc<Seen>) -> std::io::Result<()> {
        let (read, mut write) = tokio::io::split(io);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"* OK [CAPABILITY IMAP4rev1 IDLE] mock ready\r\n")
            .await?;
        while let Some(line) = lines.next_line().await? {
            let (tag, command) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let verb = command
                .split(' ')
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            match verb.as_str() {
                "SELECT" => {
                    let n = seen.selects.fetch_add(1, Ordering::SeqCst) as usize;
                    let (exists, uid_next) = script.selects[n.min(script.selects.len() - 1)];
                    let reply = format!(
                        "* {exists} EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n\
                         * OK [UIDNEXT {uid_next}] ok\r\n{tag} OK [READ-WRITE] SELECT completed\r\n"
                    );
                    write.write_all(reply.as_bytes()).await?;
                }
                "IDLE" => {
                    seen.idles.fetch_add(1, Ordering::SeqCst);
                    write.write_all(b"+ idling\r\n").await?;
                    let (every, pushed) = script.push.unwrap_or((Duration::from_secs(86_400), ""));
                    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                    loop {
                        tokio::select! {
                            line = lines.next_line() => match line? {
                                Some(done) if done.eq_ignore_ascii_case("DONE") => {
                                    let reply = format!("{tag} OK IDLE terminated\r\n");
                                    write.write_all(reply.as_bytes()).await?;
                                    break;
                                }
                                Some(_) => {}
                                None => return Ok(()),
                            },
                            _ = ticker.tick() => {
                                write.write_all(format!("{pushed}\r\n").as_bytes()).await?;
                            }
                        }
                    }
                }
                _ => {
                    let reply = format!("{tag} OK {verb} completed\r\n");
                    write.write_all(reply.as_bytes()).await?;
                }
            }
        }
        Ok(())
    }

    async fn connect(
        script: Script,
        idle_supported: bool,
    ) -> (ImapConnection<DuplexStream>, Arc<Seen>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let seen = Arc::new(Seen::default());
        tokio::spawn(serve(server_io, script, Arc::clone(&seen)));

        let mut client = Client::new(client_io);
        client
            .read_response()
            .await
            .expect("greeting")
            .expect("greeting line");
        let session = client
            .login("robot", "secret")
            .await
            .map_err(|(e, _)| e)
            .expect("login");
        let conn = ImapConnection {
            session: Some(session),
            socket_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            idle_refresh: IDLE_REFRESH,
            idle_supported,
            selected: None,
        };
        (conn, seen)
    }

    fn keepalive_every(every: Duration) -> Script {
        Script {
            selects: vec![(3, 10)],
            push: Some((every, "* OK Still here")),
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn idle_ends_at_the_deadline_despite_keepalives() {
        let (mut conn, seen) = connect(keepalive_every(2 * MINUTE), true).await;
        let info = conn.select_folder("INBOX").await.expect("select");
        assert_eq!((info.exists, info.uid_validity, info.uid_next), (3, Some(7), Some(10)));

        let started = Instant::now();
        let outcome = conn.wait_for_change(10 * MINUTE).await.expect("wait");
        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert!(started.elapsed() >= 10 * MINUTE);
        assert!(started.elapsed() < 11 * MINUTE);
        assert_eq!(seen.idles.load(Ordering::SeqCst), 1);

        conn.select_folder("INBOX").await.expect("session still usable");
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_reissue_idle_before_the_server_drops_it() {
        let (mut conn, seen) = connect(keepalive_every(2 * MINUTE), true).await;
        conn.select_folder("INBOX").await.expect("select");

        let started = Instant::now();
        let outcome = conn.wait_for_change(60 * MINUTE).await.expect("wait");
        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert!(started.elapsed() < 61 * MINUTE);
        assert_eq!(seen.idles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exists_during_idle_reports_a_change() {
        let script = Script {
            selects: vec![(3, 10)],
            push: Some((5 * MINUTE, "* 4 EXISTS")),
        };
        let (mut conn, seen) = connect(script, true).await;
        conn.select_folder("INBOX").await.expect("select");

        let started = Instant::now();
        let outcome = conn.wait_for_change(60 * MINUTE).await.expect("wait");
        assert_eq!(outcome, WatchOutcome::Changed);
        assert!(started.elapsed() < 6 * MINUTE);
        assert_eq!(seen.idles.load(Ordering::SeqCst), 1);

        conn.select_folder("INBOX").await.expect("session still usable");
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reports_new_mail_against_the_last_select() {
        let script = Script {
            selects: vec![(3, 10), (3, 10), (3, 10), (4, 11)],
            push: None,
        };
        let (mut conn, seen) = connect(script, false).await;
        conn.select_folder("INBOX").await.expect("select");

        let started = Instant::now();
        let outcome = conn.wait_for_change(60 * MINUTE).await.expect("wait");
        assert_eq!(outcome, WatchOutcome::Changed);
        assert!(started.elapsed() >= 3 * MINUTE);
        assert!(started.elapsed() < 4 * MINUTE);
        assert_eq!(seen.selects.load(Ordering::SeqCst), 4);
        assert_eq!(seen.idles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_ignores_expunges_and_times_out() {
        let script = Script {
            selects: vec![(3, 10), (2, 10)],
            push: None,
        };
        let (mut conn, seen) = connect(script, false).await;
        conn.select_folder("INBOX").await.expect("select");

        let outcome = conn.wait_for_change(5 * MINUTE).await.expect("wait");
        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert_eq!(seen.selects.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn waiting_without_a_selected_folder_fails_when_polling() {
        let script = Script {
            selects: vec![(0, 1)],
            push: None,
        };
        let (mut conn, _seen) = connect(script, false).await;
        assert!(conn.wait_for_change(MINUTE).await.is_err());
    }

    #[test]
    fn recent_range_is_bounded_to_most_recent() {
        assert_eq!(recent_range(37, 10).as_deref(), Some("28:37"));
        assert_eq!(recent_range(10, 10).as_deref(), Some("1:10"));
        assert_eq!(recent_range(3, 10).as_deref(), Some("1:3"));
        assert_eq!(recent_range(0, 10), None);
    }

    #[test]
    fn flags_use_wire_spelling() {
        assert_eq!(flag_to_string(Flag::Seen), "\\Seen");
        assert_eq!(flag_to_string(Flag::Deleted), "\\Deleted");
        assert_eq!(
            flag_to_string(Flag::Custom(Cow::Borrowed("usp-helpdesk"))),
            "usp-helpdesk"
        );
    }

    #[test]
    fn folder_names_are_modified_utf7() {
        assert_eq!(encode_folder("INBOX"), "INBOX");
        assert_eq!(encode_folder("Entwürfe"), "Entw&APw-rfe");
    }
}
