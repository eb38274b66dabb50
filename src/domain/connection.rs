//! Connection domain types.
//!
//! A connection is one authorized mailbox on one provider, together with the
//! credential material the driver needs to reach it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ConnectionId;

/// Default IMAP port (implicit TLS).
pub const DEFAULT_IMAP_PORT: u16 = 993;
/// Default SMTP submission port (STARTTLS).
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail-shaped REST API.
    Google,
    /// Plain IMAP for reading and SMTP for sending.
    Imap,
    /// Microsoft Graph. Registered, not implemented.
    Microsoft,
}

impl ProviderKind {
    /// Canonical provider identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Imap => "imap",
            Self::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a provider identifier is not registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(Self::Google),
            "imap" => Ok(Self::Imap),
            "microsoft" | "outlook" => Ok(Self::Microsoft),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Credential material and server settings for a connection.
///
/// IMAP/SMTP fields are optional; ports default to 993/587 and the TLS mode
/// is inferred from the port when not given.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// OAuth access token, or the password for IMAP/SMTP.
    pub access_token: String,
    /// OAuth refresh token.
    #[serde(default)]
    pub refresh_token: String,
    /// Mailbox address; also the IMAP/SMTP login.
    pub email: String,
    /// Owning user id.
    #[serde(default)]
    pub user_id: String,
    /// IMAP host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// IMAP port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// IMAP implicit TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    /// SMTP host; defaults to the IMAP host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    /// SMTP port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    /// SMTP implicit TLS. `false` means STARTTLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_secure: Option<bool>,
}

impl AuthConfig {
    /// IMAP port, defaulting to 993.
    pub fn imap_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_IMAP_PORT)
    }

    /// Whether IMAP uses implicit TLS.
    pub fn imap_secure(&self) -> bool {
        self.secure.unwrap_or(self.imap_port() == 993)
    }

    /// SMTP host, falling back to the IMAP host.
    pub fn smtp_host(&self) -> Option<&str> {
        self.smtp_host.as_deref().or(self.host.as_deref())
    }

    /// SMTP port, defaulting to 587.
    pub fn smtp_port(&self) -> u16 {
        self.smtp_port.unwrap_or(DEFAULT_SMTP_PORT)
    }

    /// Whether SMTP uses implicit TLS rather than STARTTLS.
    pub fn smtp_secure(&self) -> bool {
        self.smtp_secure.unwrap_or(self.smtp_port() == 465)
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "[REDACTED]"
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("email", &self.email)
            .field("user_id", &self.user_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_secure", &self.smtp_secure)
            .finish()
    }
}

/// An authorized mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection id.
    pub id: ConnectionId,
    /// Provider family.
    pub provider: ProviderKind,
    /// Credentials and server settings.
    pub auth: AuthConfig,
}

impl Connection {
    /// Mailbox address.
    pub fn email(&self) -> &str {
        &self.auth.email
    }

    /// Returns a copy with a refreshed access token; nothing else may change.
    pub fn with_access_token(&self, access_token: impl Into<String>) -> Self {
        let mut refreshed = self.clone();
        refreshed.auth.access_token = access_token.into();
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!("gmail".parse::<ProviderKind>(), Ok(ProviderKind::Google));
        assert_eq!(" IMAP ".parse::<ProviderKind>(), Ok(ProviderKind::Imap));
        assert_eq!("outlook".parse::<ProviderKind>(), Ok(ProviderKind::Microsoft));
        assert_eq!(
            "yahoo".parse::<ProviderKind>(),
            Err(UnknownProvider("yahoo".into()))
        );
    }

    #[test]
    fn ports_and_security_defaults() {
        let auth = AuthConfig {
            host: Some("mail.example.com".into()),
            ..Default::default()
        };
        assert_eq!(auth.imap_port(), 993);
        assert!(auth.imap_secure());
        assert_eq!(auth.smtp_port(), 587);
        assert!(!auth.smtp_secure());
        assert_eq!(auth.smtp_host(), Some("mail.example.com"));
    }

    #[test]
    fn security_is_inferred_from_port() {
        let auth = AuthConfig {
            port: Some(143),
            smtp_port: Some(465),
            ..Default::default()
        };
        assert!(!auth.imap_secure());
        assert!(auth.smtp_secure());

        let explicit = AuthConfig {
            port: Some(143),
            secure: Some(true),
            ..Default::default()
        };
        assert!(explicit.imap_secure());
    }

    #[test]
    fn auth_config_uses_camel_case_keys() {
        let auth: AuthConfig = serde_json::from_value(serde_json::json!({
            "accessToken": "at",
            "refreshToken": "rt",
            "email": "me@example.com",
            "userId": "u1",
            "smtpHost": "smtp.example.com",
            "smtpPort": 465
        }))
        .unwrap();
        assert_eq!(auth.access_token, "at");
        assert_eq!(auth.smtp_host(), Some("smtp.example.com"));
        assert!(auth.smtp_secure());
    }

    #[test]
    fn debug_redacts_tokens() {
        let auth = AuthConfig {
            access_token: "secret-access".into(),
            refresh_token: "secret-refresh".into(),
            email: "me@example.com".into(),
            ..Default::default()
        };
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("me@example.com"));
    }

    #[test]
    fn refreshing_token_keeps_identity() {
        let connection = Connection {
            id: ConnectionId::from("c-1"),
            provider: ProviderKind::Google,
            auth: AuthConfig {
                access_token: "old".into(),
                email: "me@example.com".into(),
                ..Default::default()
            },
        };
        let refreshed = connection.with_access_token("new");
        assert_eq!(refreshed.auth.access_token, "new");
        assert_eq!(refreshed.id, connection.id);
        assert_eq!(refreshed.email(), "me@example.com");
    }
}
