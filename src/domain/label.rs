//! Label domain types.
//!
//! A label is a tag for the REST provider and a folder path for IMAP.

use serde::{Deserialize, Serialize};

use super::LabelId;

/// A label (tag or folder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Provider label id.
    pub id: LabelId,
    /// Display name.
    pub name: String,
    /// System or user label.
    #[serde(rename = "type")]
    pub label_type: LabelType,
    /// Optional color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<LabelColor>,
}

impl Label {
    /// Returns the `{id, name}` reference used inside threads.
    pub fn to_ref(&self) -> LabelRef {
        LabelRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Whether a label is owned by the provider or by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    /// Provider-defined (INBOX, SENT, ...).
    System,
    /// Created by the user or by automated labeling.
    User,
}

/// Label colors as background/text hex pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelColor {
    /// Background color, e.g. `#16a766`.
    pub background_color: String,
    /// Text color, e.g. `#ffffff`.
    pub text_color: String,
}

/// Lightweight `{id, name}` label reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelRef {
    /// Label id.
    pub id: LabelId,
    /// Display name.
    pub name: String,
}

/// Input for creating or updating a label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSpec {
    /// New display name (folder path for IMAP).
    pub name: String,
    /// Optional color; ignored by providers without color support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<LabelColor>,
}

impl LabelSpec {
    /// Creates a spec with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }
}

/// Message and unread counts for one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelCount {
    /// Label id.
    pub label: LabelId,
    /// Total messages (or threads, for providers that count threads).
    pub total: u32,
    /// Unread messages.
    pub unread: u32,
}

/// Well-known system label ids shared by both providers.
pub mod system_labels {
    /// Inbox.
    pub const INBOX: &str = "INBOX";
    /// Sent mail.
    pub const SENT: &str = "SENT";
    /// Drafts.
    pub const DRAFT: &str = "DRAFT";
    /// Trash.
    pub const TRASH: &str = "TRASH";
    /// Spam / junk.
    pub const SPAM: &str = "SPAM";
    /// Pseudo-label marking unread messages.
    pub const UNREAD: &str = "UNREAD";
    /// Starred / flagged.
    pub const STARRED: &str = "STARRED";

    /// Canonical key for a folder name.
    ///
    /// Standard folder names and their aliases map case-insensitively to the
    /// system label id (`inbox` and `INBOX` both give `INBOX`, `bin` gives
    /// `TRASH`). Other names are only trimmed, since user folders are
    /// case-sensitive on IMAP servers.
    pub fn folder_key(name: &str) -> String {
        let name = name.trim();
        let canonical = match name.to_ascii_lowercase().as_str() {
            "inbox" => INBOX,
            "sent" => SENT,
            "drafts" | "draft" => DRAFT,
            "trash" | "bin" => TRASH,
            "junk" | "spam" => SPAM,
            "starred" => STARRED,
            _ => return name.to_string(),
        };
        canonical.to_string()
    }
}
