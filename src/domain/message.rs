//! Message domain types.
//!
//! A [`Message`] is built once from a provider payload and never patched in
//! place; mutations re-fetch the owning thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LabelId, MessageId, ThreadId};

/// A single email message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Provider-assigned message id.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub thread_id: ThreadId,
    /// RFC 5322 threading headers.
    pub headers: ThreadingHeaders,
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients (only known for sent mail).
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// When the provider received (or the sender dated) the message.
    pub received_on: DateTime<Utc>,
    /// Whether the message is unread.
    pub unread: bool,
    /// Whether the message is a draft.
    pub is_draft: bool,
    /// Short plain-text preview.
    pub snippet: String,
    /// Raw and decoded body content.
    pub body: MessageBody,
    /// Attachment metadata. Content is fetched separately.
    pub attachments: Vec<Attachment>,
    /// Provider label ids (folder path for IMAP).
    pub label_ids: Vec<LabelId>,
}

/// Threading headers used to group messages into conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadingHeaders {
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    /// `References` chain, oldest first, without angle brackets.
    pub references: Vec<String>,
    /// `In-Reply-To` without angle brackets.
    pub in_reply_to: Option<String>,
}

impl ThreadingHeaders {
    /// Derives the conversation id from the headers.
    ///
    /// The first id in `References` wins, then `In-Reply-To`, then the
    /// message's own `Message-ID`.
    pub fn thread_root(&self) -> Option<&str> {
        self.references
            .first()
            .or(self.in_reply_to.as_ref())
            .or(self.message_id.as_ref())
            .map(String::as_str)
    }
}

/// Strips surrounding whitespace and angle brackets from a message id.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Splits a `References`-style header into normalized message ids.
pub fn split_message_ids(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

/// Body content in both provider-raw and decoded forms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    /// Body as delivered by the provider, before decoding.
    pub raw: Option<String>,
    /// Decoded plain-text part.
    pub text: Option<String>,
    /// Decoded HTML part.
    pub html: Option<String>,
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
}

impl Address {
    /// Creates an address without a display name.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates an address with a display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Placeholder used when a message carries no parseable sender.
    pub fn unknown() -> Self {
        Self::new("unknown@unknown.invalid")
    }

    /// Returns "Name <email>" or just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Attachment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Provider attachment id. IMAP uses `"<uid>:<filename-or-index>"`.
    pub id: String,
    /// Original filename, empty when the part has none.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentData {
    /// Attachment metadata.
    pub attachment: Attachment,
    /// Raw bytes.
    #[serde(with = "crate::domain::base64_serde")]
    pub data: Vec<u8>,
}
