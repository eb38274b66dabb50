//! Core identifier types for domain entities.
//!
//! Newtype wrappers keep connection, thread, message and label identifiers
//! from being mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identifier of a mailbox connection (one authorized account on one provider).
    ConnectionId
);

string_id!(
    /// Identifier of a conversation.
    ///
    /// For the REST provider this is the provider's thread id. For IMAP it is
    /// derived from the threading headers of the messages it groups.
    ThreadId
);

string_id!(
    /// Provider-assigned identifier of a single message.
    MessageId
);

string_id!(
    /// Identifier of a label. For IMAP this is the folder path.
    LabelId
);

/// Prefix some callers attach to thread ids.
pub const THREAD_ID_PREFIX: &str = "thread:";

/// Strips an optional `thread:` prefix from an id.
pub fn strip_thread_prefix(id: &str) -> &str {
    id.strip_prefix(THREAD_ID_PREFIX).unwrap_or(id)
}
