//! mailmux - one mailbox API over several wire protocols
//!
//! This crate provides a uniform mail driver interface over a REST provider
//! and IMAP/SMTP, a standardized error envelope with bounded rate-limit
//! retries, and a sync engine that keeps a local two-tier thread cache.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;
