//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Variants follow the
//! stage at which a failure happens, because the stage decides the recovery:
//! session-level failures drop the connection and back off, per-message
//! failures skip one message, configuration failures stop before any task runs.

use thiserror::Error;

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be read, parsed or validated
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Session could not be established (TCP, TLS, greeting)
    #[error("connect failed: {0}")]
    Connect(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response, scan, watch)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Folder select, batch fetch or change-notification failure
    #[error("mailbox error: {0}")]
    Mailbox(String),
    /// Failure handling a single message (parse, flag, store, delete)
    #[error("message error: {0}")]
    Message(String),
    /// Ticket counter file unreadable, corrupt or not writable
    #[error("ticket counter error: {0}")]
    Counter(String),
    /// Forwarding submission failure
    #[error("relay error: {0}")]
    Relay(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Config`
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the live session must be discarded after this error
    ///
    /// Per-message, counter and relay failures leave the IMAP session usable;
    /// everything else means the session state is unknown.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::Message(_) | Self::Counter(_) | Self::Relay(_))
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
