//! Runtime settings.
//!
//! Settings are a JSON document, by default at the platform config directory
//! (`~/.config/mailmux/settings.json` on Linux). Every section has defaults,
//! so a partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::AuthConfig;

/// Errors raised while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no platform config directory available")]
    NoConfigDir,
}

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Mailbox to drive, if configured.
    pub connection: Option<ConnectionSettings>,
    /// OAuth client and endpoints for the REST driver.
    pub google: GoogleSettings,
    /// IMAP timeouts.
    pub imap: ImapSettings,
    /// Rate-limit retry policy.
    pub retry: RetrySettings,
    /// Thread synchronization.
    pub sync: SyncSettings,
    /// Cache locations.
    pub storage: StorageSettings,
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("settings.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Reads settings, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "mailmux", "mailmux")
}

/// The mailbox the binary syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    /// Connection id; also the blob key prefix.
    pub id: String,
    /// Provider identifier (`google`, `imap`, `microsoft`).
    pub provider: String,
    /// Credential material.
    pub auth: AuthConfig,
}

/// OAuth client and endpoint configuration for the REST driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleSettings {
    /// OAuth client id, needed for token refresh.
    pub client_id: Option<String>,
    /// OAuth client secret, needed for token refresh.
    pub client_secret: Option<String>,
    /// Mail API base, ending in `/users/me`.
    pub api_base: String,
    /// OAuth token endpoint.
    pub token_url: String,
    /// OAuth revocation endpoint.
    pub revoke_url: String,
    /// OpenID userinfo endpoint.
    pub userinfo_url: String,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v3/userinfo".to_string(),
        }
    }
}

/// IMAP connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    /// Bound on TCP connect, TLS handshake and LOGIN.
    pub connect_timeout_secs: u64,
    /// Bound on every individual IMAP command.
    pub command_timeout_secs: u64,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
        }
    }
}

/// Fixed-delay retry policy for rate-limited calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first call.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 60_000,
        }
    }
}

/// Thread synchronization behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Threads requested per `list` page.
    pub page_size: u32,
    /// Pause between pages in milliseconds.
    pub page_delay_ms: u64,
    /// Follow `nextPageToken` until exhausted; when false only the first page is synced.
    pub loop_pages: bool,
    /// Threads fetched concurrently while syncing a folder.
    pub thread_concurrency: usize,
    /// Re-sync affected threads after label changes, sends and deletes.
    pub refresh_after_mutation: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            page_delay_ms: 2_000,
            loop_pages: true,
            thread_concurrency: 4,
            refresh_after_mutation: true,
        }
    }
}

/// Where the thread cache lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite file for cache rows.
    pub database_path: PathBuf,
    /// Root directory for thread blobs.
    pub blob_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".mailmux"));

        Self {
            database_path: data_dir.join("threads.db"),
            blob_dir: data_dir.join("blobs"),
        }
    }
}
