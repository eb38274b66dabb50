//! Provider id to driver resolution.

use std::sync::Arc;

use super::envelope::{LoggingTeardown, SessionTeardown};
use super::gmail::GmailProvider;
use super::imap::ImapProvider;
use super::outlook::OutlookProvider;
use super::traits::MailManager;
use super::{ProviderError, Result};
use crate::config::{GoogleSettings, ImapSettings, Settings};
use crate::domain::{AuthConfig, Connection, ConnectionId, ProviderKind};

/// Everything a driver needs besides its provider id.
#[derive(Clone)]
pub struct DriverConfig {
    pub connection_id: ConnectionId,
    pub auth: AuthConfig,
    pub google: GoogleSettings,
    pub imap: ImapSettings,
    pub teardown: Arc<dyn SessionTeardown>,
}

impl DriverConfig {
    /// Default provider settings and a logging-only teardown.
    pub fn new(connection_id: impl Into<ConnectionId>, auth: AuthConfig) -> Self {
        Self {
            connection_id: connection_id.into(),
            auth,
            google: GoogleSettings::default(),
            imap: ImapSettings::default(),
            teardown: Arc::new(LoggingTeardown),
        }
    }

    /// The configured connection and its provider id.
    pub fn from_settings(settings: &Settings) -> Result<(String, Self)> {
        let connection = settings.connection.as_ref().ok_or_else(|| {
            ProviderError::InvalidRequest("settings have no connection section".to_string())
        })?;
        let config = Self {
            google: settings.google.clone(),
            imap: settings.imap,
            ..Self::new(connection.id.as_str(), connection.auth.clone())
        };
        Ok((connection.provider.clone(), config))
    }

    pub fn with_teardown(mut self, teardown: Arc<dyn SessionTeardown>) -> Self {
        self.teardown = teardown;
        self
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("connection_id", &self.connection_id)
            .field("auth", &self.auth)
            .field("imap", &self.imap)
            .finish_non_exhaustive()
    }
}

/// Builds the driver registered under `provider_id`.
///
/// Ids are matched case-insensitively (`gmail` is an alias of `google`,
/// `outlook` of `microsoft`). Anything else is
/// [`ProviderError::UnsupportedProvider`].
pub fn create_driver(provider_id: &str, config: DriverConfig) -> Result<Arc<dyn MailManager>> {
    let kind: ProviderKind = provider_id
        .parse()
        .map_err(|e: crate::domain::UnknownProvider| ProviderError::UnsupportedProvider(e.0))?;

    let DriverConfig {
        connection_id,
        auth,
        google,
        imap,
        teardown,
    } = config;
    let connection = Connection {
        id: connection_id,
        provider: kind,
        auth,
    };

    tracing::debug!(
        connection_id = %connection.id,
        provider = %kind,
        "creating mail driver"
    );

    let driver: Arc<dyn MailManager> = match kind {
        ProviderKind::Google => Arc::new(GmailProvider::new(connection, google, teardown)?),
        ProviderKind::Imap => Arc::new(ImapProvider::new(connection, &imap, teardown)?),
        ProviderKind::Microsoft => Arc::new(OutlookProvider::new(connection, teardown)),
    };
    Ok(driver)
}
