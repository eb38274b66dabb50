//! Mail drivers.
//!
//! Every provider implements the [`MailManager`] capability set:
//!
//! - [`GmailProvider`] - Gmail-shaped REST API with OAuth 2.0
//! - [`ImapProvider`] - IMAP for reading, SMTP for sending
//! - [`OutlookProvider`] - registered placeholder, every call is `NotImplemented`
//!
//! # Architecture
//!
//! Drivers are resolved from a provider id by [`create_driver`]. Each
//! operation runs inside an [`ErrorEnvelope`], which logs a sanitized
//! context, tears the session down on fatal credential errors and returns a
//! uniform [`ProviderError::Operation`]. Throttling is classified by
//! [`is_rate_limit`] and retried by [`RetryPolicy`] at the caller.
//!
//! # Example
//!
//! ```ignore
//! use mailmux::providers::email::{create_driver, DriverConfig, ListParams};
//!
//! async fn list_inbox(config: DriverConfig) -> mailmux::providers::email::Result<()> {
//!     let driver = create_driver("imap", config)?;
//!     let page = driver.list(ListParams::folder("inbox").max_results(25)).await?;
//!     for stub in page.threads {
//!         println!("{}", stub.id);
//!     }
//!     Ok(())
//! }
//! ```

mod address;
mod compose;
pub mod envelope;
mod error;
mod factory;
mod gmail;
pub mod imap;
mod outlook;
pub mod rate_limit;
mod traits;

pub use compose::{build_message, new_message_id, ComposeOptions};
pub use envelope::{
    is_fatal, sanitize_context, ErrorEnvelope, LoggingTeardown, ProtocolSession, SessionTeardown,
};
pub use error::{ErrorCode, OperationError, ProviderError, Result};
pub use factory::{create_driver, DriverConfig};
pub use gmail::GmailProvider;
pub use imap::ImapProvider;
pub use outlook::OutlookProvider;
pub use rate_limit::{is_rate_limit, RetryPolicy};
pub use traits::{
    Draft, DraftPage, DraftRequest, EmailAlias, HistoryPage, HistoryRecord, LabelChange,
    ListParams, MailManager, OutgoingAttachment, OutgoingMessage, SentMessage, ThreadPage,
    UserInfo, DEFAULT_MAX_RESULTS,
};
