//! Mailbox capability seams
//!
//! The scanner, watcher and worker only talk to a mailbox through these
//! traits. [`crate::imap`] provides the network implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::models::{FolderInfo, RecentMessages, WatchOutcome};

/// One authenticated session to one mailbox server
///
/// No business logic lives behind this trait. Every call may block on the
/// network; callers bound them with [`crate::race::race_with_timeout`].
#[async_trait]
pub trait MailboxConnection: Send {
    /// Select `folder` read-write
    async fn select_folder(&mut self, folder: &str) -> AppResult<FolderInfo>;

    /// Select `folder` and fetch at most `max_count` of its most recent
    /// messages, oldest first, along with the folder state they were read at
    async fn fetch_recent(&mut self, folder: &str, max_count: u32)
    -> AppResult<RecentMessages>;

    /// Add `flag` to the message with `uid` in the selected folder
    async fn set_flag(&mut self, uid: u32, flag: &str) -> AppResult<()>;

    /// Append `raw` to `folder` carrying `flags`
    async fn append_message(&mut self, folder: &str, flags: &[String], raw: &[u8])
    -> AppResult<()>;

    /// Mark the message deleted and expunge the selected folder
    async fn mark_deleted_and_expunge(&mut self, uid: u32) -> AppResult<()>;

    /// Block until the selected folder changes or `timeout` elapses
    async fn wait_for_change(&mut self, timeout: Duration) -> AppResult<WatchOutcome>;
}

/// Opens sessions for one account
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: MailboxConnection + 'static;

    async fn connect(&self) -> AppResult<Self::Connection>;

    /// Server address, for logs
    fn endpoint(&self) -> String;
}
