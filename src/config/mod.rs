//! Configuration and settings management.
//!
//! Settings are stored as JSON in the user's config directory.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, GoogleSettings, ImapSettings, RetrySettings, Settings,
    StorageSettings, SyncSettings,
};
