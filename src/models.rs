//! Task and message data model
//!
//! Declarative task settings are immutable once loaded. The only mutable
//! per-task state is the live connection, which lives in [`TaskRuntime`] and
//! is owned by exactly one worker.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Prefix shared by all processed-flags written by this agent
pub const PROCESSED_FLAG_PREFIX: &str = "usp-";

/// Tag used in ticket subjects when a task does not set `rtTag`
pub const DEFAULT_TICKET_TAG: &str = "UnSpammer";

/// Message-selection filter applied before the pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SelectFilter {
    /// Only messages the spam classifier flagged
    Spam,
    /// Only messages the spam classifier did not flag
    Ham,
    /// Every message
    All,
}

/// Transform applied to the message copy before routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EditMode {
    /// Prefix the subject with `[<tag> - <ticket-id>]`
    RtTag,
    /// Restore the pre-classifier subject and strip classifier headers
    UnSpam,
    /// Leave the message untouched
    No,
}

/// Validated, immutable task definition
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Task name (unique, also used in the processed-flag and counter file name)
    pub name: String,
    /// Receiving account reference
    pub imap_account: String,
    /// Relay account reference (required when `forward_to` is set)
    pub smtp_account: Option<String>,
    /// Folder watched and scanned
    pub watch_folder: String,
    /// Spam/ham/all gate
    pub select: SelectFilter,
    /// Edit-copy mode
    pub edit: EditMode,
    /// Folder receiving the (possibly transformed) copy
    pub archive_folder: Option<String>,
    /// Address receiving a forwarded copy
    pub forward_to: Option<String>,
    /// Remove the original after processing
    pub delete_original: bool,
    /// Ticket tag label
    pub tag: Option<String>,
}

impl TaskConfig {
    /// Flag marking a message as processed by this task
    pub fn processed_flag(&self) -> String {
        processed_flag(&self.name)
    }

    /// Tag used for ticket subjects, falling back to the default label
    pub fn ticket_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TICKET_TAG)
    }
}

/// Build the processed-flag for a task name
pub fn processed_flag(task_name: &str) -> String {
    format!("{PROCESSED_FLAG_PREFIX}{task_name}")
}

/// Mutable per-task state, owned by a single worker
///
/// `connection` is `None` while disconnected. It never holds more than one
/// session, and every disconnect path empties it before the worker sleeps.
#[derive(Debug)]
pub struct TaskRuntime<C> {
    /// Task name, for logs
    pub name: String,
    /// Live authenticated session, if any
    pub connection: Option<C>,
}

impl<C> TaskRuntime<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: None,
        }
    }

    /// Drop the live session without a graceful logout
    ///
    /// Returns `true` when a session was actually discarded.
    pub fn abort_connection(&mut self) -> bool {
        self.connection.take().is_some()
    }
}

/// One fetched message
///
/// Transient: fetched per scan and discarded after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message UID within the selected folder
    pub uid: u32,
    /// Flags (system flags with leading backslash, keywords verbatim)
    pub flags: Vec<String>,
    /// Full RFC822 source
    pub raw: Vec<u8>,
}

impl Message {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Folder state returned by SELECT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderInfo {
    /// Number of messages in the folder
    pub exists: u32,
    /// UIDVALIDITY, when the server reports it
    pub uid_validity: Option<u32>,
    /// UIDNEXT, when the server reports it
    pub uid_next: Option<u32>,
}

impl FolderInfo {
    /// Whether messages arrived since `earlier`
    ///
    /// UIDNEXT only moves on arrival, so expunges do not count and an
    /// arrival hidden by an expunge still does. Without UIDNEXT any change
    /// in the message count is taken as a change.
    pub fn moved_on_from(&self, earlier: &FolderInfo) -> bool {
        if self.uid_validity != earlier.uid_validity {
            return true;
        }
        match (self.uid_next, earlier.uid_next) {
            (Some(now), Some(then)) => now != then,
            _ => self.exists != earlier.exists,
        }
    }
}

/// Most recent messages of a folder, with the folder state they were read at
#[derive(Debug, Clone, Default)]
pub struct RecentMessages {
    pub folder: FolderInfo,
    pub messages: Vec<Message>,
}

/// Result of waiting for a folder change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The server reported a change
    Changed,
    /// The wait elapsed without a change
    TimedOut,
}
