//! Thread domain types.
//!
//! A thread groups the messages of one conversation in chronological order.

use serde::{Deserialize, Serialize};

use super::{LabelRef, Message, ThreadId};

/// A complete conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Conversation id, usually the id of its root message.
    pub id: ThreadId,
    /// Messages ordered oldest first.
    pub messages: Vec<Message>,
    /// Most recent non-draft message, or the most recent draft when nothing else exists.
    pub latest: Option<Message>,
    /// Whether any message is unread.
    pub has_unread: bool,
    /// Number of messages after the first.
    pub total_replies: u32,
    /// Labels across all messages.
    pub labels: Vec<LabelRef>,
}

impl Thread {
    /// Builds a thread from messages in any order, deriving the aggregates.
    pub fn from_messages(id: ThreadId, mut messages: Vec<Message>, labels: Vec<LabelRef>) -> Self {
        messages.sort_by(|a, b| a.received_on.cmp(&b.received_on));

        let latest = messages
            .iter()
            .rev()
            .find(|m| !m.is_draft)
            .or_else(|| messages.last())
            .cloned();
        let has_unread = messages.iter().any(|m| m.unread);
        let total_replies = messages.len().saturating_sub(1) as u32;

        Self {
            id,
            messages,
            latest,
            has_unread,
            total_replies,
            labels,
        }
    }
}

/// One entry of a thread listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadStub {
    /// Conversation id, usable with `get`.
    pub id: ThreadId,
    /// Provider listing payload for this entry, when the provider returns one.
    #[serde(rename = "$raw", skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl ThreadStub {
    /// Creates a stub without a raw payload.
    pub fn new(id: impl Into<ThreadId>) -> Self {
        Self {
            id: id.into(),
            raw: None,
        }
    }
}
