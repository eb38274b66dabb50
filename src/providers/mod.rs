//! External mail services.
//!
//! - [`email`] - mail drivers (Gmail API, IMAP/SMTP, Outlook placeholder)

pub mod email;
