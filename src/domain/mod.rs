//! Domain types shared by drivers, the sync engine and storage.
//!
//! Connections, messages, threads and labels, plus the identifier newtypes
//! that keep them apart.

mod connection;
mod label;
mod message;
mod thread;
mod types;

pub use connection::{
    AuthConfig, Connection, ProviderKind, UnknownProvider, DEFAULT_IMAP_PORT, DEFAULT_SMTP_PORT,
};
pub use label::{system_labels, Label, LabelColor, LabelCount, LabelRef, LabelSpec, LabelType};
pub use message::{
    normalize_message_id, split_message_ids, Address, Attachment, AttachmentData, Message,
    MessageBody, ThreadingHeaders,
};
pub use thread::{Thread, ThreadStub};
pub use types::{strip_thread_prefix, ConnectionId, LabelId, MessageId, ThreadId, THREAD_ID_PREFIX};

pub(crate) mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}
