//! The uniform mail driver interface.
//!
//! This module defines the [`MailManager`] trait that every provider driver
//! implements, plus the request and response types that cross it. Drivers
//! translate these calls into one wire protocol and normalize the results
//! into the entities of [`crate::domain`].

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use super::Result;
use crate::domain::{
    strip_thread_prefix, Address, AttachmentData, ConnectionId, Label, LabelCount, LabelSpec,
    Message, ProviderKind, Thread, ThreadId, ThreadStub,
};

/// Default page size when the caller does not give one.
pub const DEFAULT_MAX_RESULTS: u32 = 50;

/// Parameters for [`MailManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Folder or standard folder name (`inbox`, `sent`, ...).
    pub folder: String,
    /// Provider search query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Page size.
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Restrict to these label ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
    /// Cursor from a previous page. Numeric tokens are accepted and kept as strings.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub page_token: Option<String>,
}

fn default_max_results() -> u32 {
    DEFAULT_MAX_RESULTS
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Token>::deserialize(deserializer)?.map(|token| match token {
        Token::Text(s) => s,
        Token::Number(n) => n.to_string(),
    }))
}

impl ListParams {
    /// Lists a folder with the default page size.
    pub fn folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            query: None,
            max_results: DEFAULT_MAX_RESULTS,
            label_ids: Vec::new(),
            page_token: None,
        }
    }

    /// Sets the page size.
    pub fn max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    /// Sets the search query.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Restricts the listing to labels.
    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    /// Continues from a page token.
    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }
}

/// One page of [`MailManager::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    /// Thread stubs, newest first, unique by id within the page.
    pub threads: Vec<ThreadStub>,
    /// Cursor for the next page, `None` when exhausted.
    pub next_page_token: Option<String>,
}

/// A message to send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    #[serde(default)]
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients.
    #[serde(default)]
    pub bcc: Vec<Address>,
    /// Subject.
    pub subject: String,
    /// Plain text body.
    #[serde(default)]
    pub body_text: String,
    /// HTML body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    /// Conversation this message replies into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    /// Message-ID being replied to, without angle brackets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Reference chain, without angle brackets.
    #[serde(default)]
    pub references: Vec<String>,
    /// Attachments.
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingMessage {
    /// Creates a plain-text message to the given recipients.
    pub fn new(to: Vec<Address>, subject: impl Into<String>, body_text: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            body_text: body_text.into(),
            ..Default::default()
        }
    }
}

/// An attachment on an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingAttachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Raw content.
    #[serde(with = "crate::domain::base64_serde")]
    pub data: Vec<u8>,
}

/// Result of sending a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    /// Provider id of the sent message.
    pub id: String,
    /// Conversation the message landed in, when known.
    pub thread_id: Option<ThreadId>,
}

/// Label changes for [`MailManager::modify_labels`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelChange {
    /// Labels to add.
    #[serde(default)]
    pub add_labels: Vec<String>,
    /// Labels to remove.
    #[serde(default)]
    pub remove_labels: Vec<String>,
}

impl LabelChange {
    /// Adds labels.
    pub fn add<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            add_labels: labels.into_iter().map(Into::into).collect(),
            remove_labels: Vec::new(),
        }
    }

    /// Removes labels.
    pub fn remove<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            add_labels: Vec::new(),
            remove_labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

/// Creates a draft, or replaces the draft with `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    /// Existing draft to replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Draft content.
    pub message: OutgoingMessage,
}

/// A stored draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    /// Draft id.
    pub id: String,
    /// Parsed draft message, when the provider returned it.
    pub message: Option<Message>,
}

/// One page of drafts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPage {
    /// Drafts on this page.
    pub drafts: Vec<Draft>,
    /// Cursor for the next page.
    pub next_page_token: Option<String>,
}

/// A send-as identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAlias {
    /// Address.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
    /// Whether this is the account's primary address.
    pub primary: bool,
}

/// Profile of the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Primary address.
    pub address: String,
    /// Display name.
    pub name: Option<String>,
    /// Avatar URL.
    pub photo: Option<String>,
}

/// Mailbox changes since a history cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Change records, oldest first.
    pub records: Vec<HistoryRecord>,
    /// Cursor to pass next time.
    pub history_id: Option<String>,
    /// Cursor for the next page of this listing.
    pub next_page_token: Option<String>,
}

/// One mailbox change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryRecord {
    /// A message arrived.
    MessageAdded {
        /// Message id.
        message_id: String,
        /// Conversation id.
        thread_id: ThreadId,
    },
    /// A message was deleted.
    MessageDeleted {
        /// Message id.
        message_id: String,
        /// Conversation id.
        thread_id: ThreadId,
    },
    /// Labels were added to a message.
    LabelsAdded {
        /// Message id.
        message_id: String,
        /// Conversation id.
        thread_id: ThreadId,
        /// Added label ids.
        label_ids: Vec<String>,
    },
    /// Labels were removed from a message.
    LabelsRemoved {
        /// Message id.
        message_id: String,
        /// Conversation id.
        thread_id: ThreadId,
        /// Removed label ids.
        label_ids: Vec<String>,
    },
}

impl HistoryRecord {
    /// Conversation the change touches.
    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::MessageAdded { thread_id, .. }
            | Self::MessageDeleted { thread_id, .. }
            | Self::LabelsAdded { thread_id, .. }
            | Self::LabelsRemoved { thread_id, .. } => thread_id,
        }
    }
}

/// Uniform capability set every mail driver implements.
///
/// All fallible methods run through the driver's error envelope, so errors
/// arrive as [`super::ProviderError::Operation`] carrying the operation name,
/// a sanitized context and the original error.
///
/// # Example
///
/// ```ignore
/// use mailmux::providers::email::{ListParams, MailManager};
///
/// async fn newest_subjects(driver: &dyn MailManager) -> mailmux::providers::email::Result<()> {
///     let page = driver.list(ListParams::folder("inbox").max_results(10)).await?;
///     for stub in page.threads {
///         let thread = driver.get(stub.id.as_str()).await?;
///         if let Some(latest) = thread.latest {
///             println!("{}", latest.subject.unwrap_or_default());
///         }
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait MailManager: Send + Sync {
    /// Provider family of this driver.
    fn provider(&self) -> ProviderKind;

    /// Connection this driver serves.
    fn connection_id(&self) -> &ConnectionId;

    /// Lists thread stubs in a folder, newest first.
    ///
    /// Stubs are unique by id within a page. `next_page_token` is `None`
    /// once the listing is exhausted.
    async fn list(&self, params: ListParams) -> Result<ThreadPage>;

    /// Fetches a full thread by thread or message id, with or without a `thread:` prefix.
    ///
    /// # Errors
    ///
    /// `NotFound` when no lookup strategy resolves the id.
    async fn get(&self, id: &str) -> Result<Thread>;

    /// Sends a new message.
    ///
    /// # Errors
    ///
    /// `SendFailure` when the transport rejects the message.
    async fn create(&self, message: &OutgoingMessage) -> Result<SentMessage>;

    /// Moves threads to the trash.
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Adds and removes labels on threads.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` when the provider cannot represent the change.
    async fn modify_labels(&self, ids: &[String], change: &LabelChange) -> Result<()>;

    /// Marks threads read.
    async fn mark_as_read(&self, ids: &[String]) -> Result<()>;

    /// Marks threads unread.
    async fn mark_as_unread(&self, ids: &[String]) -> Result<()>;

    /// Creates a label.
    async fn create_label(&self, label: &LabelSpec) -> Result<Label>;

    /// Renames or recolors a label.
    async fn update_label(&self, id: &str, label: &LabelSpec) -> Result<Label>;

    /// Deletes a label.
    async fn delete_label(&self, id: &str) -> Result<()>;

    /// Fetches one label.
    async fn get_label(&self, id: &str) -> Result<Label>;

    /// Lists all labels. Cached until the next label mutation.
    async fn get_user_labels(&self) -> Result<Vec<Label>>;

    /// Creates a draft. A request with an id deletes that draft and creates a new one.
    async fn create_draft(&self, draft: &DraftRequest) -> Result<Draft>;

    /// Fetches a draft.
    async fn get_draft(&self, id: &str) -> Result<Draft>;

    /// Lists drafts.
    async fn list_drafts(&self, max_results: u32, page_token: Option<String>) -> Result<DraftPage>;

    /// Sends a stored draft.
    async fn send_draft(&self, id: &str) -> Result<SentMessage>;

    /// Downloads attachment content.
    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentData>;

    /// Message and unread counts per label.
    async fn count(&self) -> Result<Vec<LabelCount>>;

    /// Send-as identities.
    async fn get_email_aliases(&self) -> Result<Vec<EmailAlias>>;

    /// Profile of the mailbox owner.
    async fn get_user_info(&self) -> Result<UserInfo>;

    /// Changes since a history cursor.
    async fn list_history(&self, history_id: &str) -> Result<HistoryPage>;

    /// Revokes the refresh token. Returns whether the provider confirmed it.
    async fn revoke_refresh_token(&self) -> Result<bool>;

    /// Strips `thread:` prefixes so ids can be passed to the provider.
    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .map(|id| strip_thread_prefix(id).to_string())
            .collect()
    }

    /// Releases protocol resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
