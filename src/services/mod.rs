//! Services layer.
//!
//! Services sit between callers and the infrastructure layer:
//!
//! ```text
//!    Binary / embedding application
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Drivers, Storage)
//! ```
//!
//! - [`SyncService`]: keeps the local thread cache of one connection current

mod guards;
#[cfg(test)]
pub(crate) mod scripted;
mod sync_service;

pub use sync_service::{SyncError, SyncOutcome, SyncReport, SyncService, ThreadSyncOutcome};
