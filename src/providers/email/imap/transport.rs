//! Outgoing mail for the IMAP driver.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::domain::AuthConfig;
use crate::providers::email::{ProviderError, Result};

/// Submits a built message for delivery.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: lettre::Message) -> Result<()>;
}

/// SMTP submission with the connection's credentials.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpTransport {
    /// Implicit TLS when the connection asks for it, STARTTLS otherwise.
    pub fn from_auth(auth: &AuthConfig, timeout: Duration) -> Result<Self> {
        let host = auth
            .smtp_host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProviderError::InvalidRequest("SMTP host is not configured".into()))?
            .to_string();
        let username = if auth.email.is_empty() {
            auth.user_id.clone()
        } else {
            auth.email.clone()
        };
        let credentials = SmtpCredentials::new(username, auth.access_token.clone());

        let builder = if auth.smtp_secure() {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
        }
        .map_err(|e| ProviderError::Connection(format!("SMTP relay error: {e}")))?;

        let mailer = builder
            .credentials(credentials)
            .port(auth.smtp_port())
            .timeout(Some(timeout))
            .build();

        Ok(Self { mailer, host })
    }
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, message: lettre::Message) -> Result<()> {
        let response = self.mailer.send(message).await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(format!("SMTP send: {e}"))
            } else {
                ProviderError::SendFailure(format!("SMTP send failed: {e}"))
            }
        })?;

        tracing::info!(
            host = %self.host,
            code = %response.code(),
            "message submitted via SMTP"
        );
        Ok(())
    }
}
