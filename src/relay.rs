//! Outbound forwarding
//!
//! Forwarded copies are submitted raw through the task's relay account, with
//! an explicit envelope so the message bytes are sent exactly as rewritten.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;

use crate::config::SmtpAccount;
use crate::errors::{AppError, AppResult};

/// Submission capability used by the scanner
#[async_trait]
pub trait Relay: Send + Sync {
    /// Submit `raw` with envelope sender `sender` (`None` is the null sender)
    /// to `recipient`
    async fn submit(&self, sender: Option<&str>, recipient: &str, raw: &[u8]) -> AppResult<()>;
}

/// SMTP relay over `lettre`
///
/// Uses STARTTLS when the server offers it and authenticates only when the
/// account carries credentials.
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    endpoint: String,
}

impl SmtpRelay {
    /// Build a transport for `account`
    ///
    /// # Errors
    ///
    /// - `Config` if TLS parameters cannot be built for the host
    pub fn new(account: &SmtpAccount, timeout: Duration) -> AppResult<Self> {
        let tls = TlsParameters::new(account.host.clone()).map_err(|e| {
            AppError::Config(format!("smtp account '{}': TLS setup failed: {e}", account.name))
        })?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.host)
            .port(account.port)
            .tls(Tls::Opportunistic(tls))
            .timeout(Some(timeout));
        if let (Some(user), Some(pass)) = (&account.user, &account.pass) {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                pass.expose_secret().to_owned(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            endpoint: format!("{}:{}", account.host, account.port),
        })
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn submit(&self, sender: Option<&str>, recipient: &str, raw: &[u8]) -> AppResult<()> {
        let envelope = build_envelope(sender, recipient)?;
        self.transport
            .send_raw(&envelope, raw)
            .await
            .map_err(|e| AppError::Relay(format!("submission via {} failed: {e}", self.endpoint)))?;
        Ok(())
    }
}

/// Build the SMTP envelope for a forwarded copy
fn build_envelope(sender: Option<&str>, recipient: &str) -> AppResult<Envelope> {
    let from = sender
        .map(|s| {
            s.parse::<Address>()
                .map_err(|e| AppError::Relay(format!("invalid envelope sender '{s}': {e}")))
        })
        .transpose()?;
    let to = recipient
        .parse::<Address>()
        .map_err(|e| AppError::Relay(format!("invalid recipient '{recipient}': {e}")))?;
    Envelope::new(from, vec![to]).map_err(|e| AppError::Relay(format!("invalid envelope: {e}")))
}
