//! Turning fetched IMAP messages into domain messages.
//!
//! Header-only fetches go through `mailparse`, which is enough for threading
//! and lookup verification. Full messages go through `mail-parser` for bodies
//! and attachments.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use mailparse::MailHeaderMap;

use super::ops::{FetchedMessage, DRAFT, SEEN};
use crate::domain::{
    normalize_message_id, split_message_ids, system_labels, Address, Attachment, LabelId, Message,
    MessageBody, MessageId, ThreadId, ThreadingHeaders,
};
use crate::providers::email::address::parse_address;
use crate::providers::email::traits::{OutgoingAttachment, OutgoingMessage};

const SNIPPET_CHARS: usize = 200;

/// The header fields lookup and listing need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    pub threading: ThreadingHeaders,
    pub subject: Option<String>,
    pub from: Option<Address>,
    pub date: Option<DateTime<Utc>>,
}

/// Parses a raw header block (or full message) with `mailparse`.
pub fn parse_header_block(raw: &[u8]) -> HeaderSummary {
    let headers = match mailparse::parse_headers(raw) {
        Ok((headers, _)) => headers,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable header block");
            return HeaderSummary::default();
        }
    };

    HeaderSummary {
        threading: ThreadingHeaders {
            message_id: headers
                .get_first_value("Message-ID")
                .map(|v| normalize_message_id(&v))
                .filter(|v| !v.is_empty()),
            references: headers
                .get_first_value("References")
                .map(|v| split_message_ids(&v))
                .unwrap_or_default(),
            in_reply_to: headers
                .get_first_value("In-Reply-To")
                .and_then(|v| split_message_ids(&v).into_iter().next()),
        },
        subject: headers.get_first_value("Subject"),
        from: headers.get_first_value("From").map(|v| parse_address(&v)),
        date: headers
            .get_first_value("Date")
            .and_then(|v| mailparse::dateparse(&v).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
    }
}

/// Conversation id for a message: its thread root, else its UID.
pub fn thread_id_for(headers: &ThreadingHeaders, uid: u32) -> ThreadId {
    headers
        .thread_root()
        .map(ThreadId::from)
        .unwrap_or_else(|| ThreadId::from(uid.to_string()))
}

/// Id of the attachment at `index` named `filename` in message `uid`.
pub fn attachment_id(uid: u32, filename: Option<&str>, index: usize) -> String {
    match filename.filter(|f| !f.is_empty()) {
        Some(name) => format!("{uid}:{name}"),
        None => format!("{uid}:{index}"),
    }
}

/// Splits an attachment id into UID and filename-or-index matcher.
pub fn parse_attachment_id(id: &str) -> Option<(u32, &str)> {
    let (uid, matcher) = id.split_once(':')?;
    Some((uid.parse().ok()?, matcher))
}

fn header_ids(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => split_message_ids(text),
        HeaderValue::TextList(list) => list.iter().flat_map(|t| split_message_ids(t)).collect(),
        _ => Vec::new(),
    }
}

fn addresses(value: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    let Some(value) = value else {
        return Vec::new();
    };
    let convert = |addr: &mail_parser::Addr<'_>| {
        addr.address().map(|email| Address {
            email: email.to_string(),
            name: addr.name().map(str::to_string),
        })
    };
    match (value.as_list(), value.as_group()) {
        (Some(list), _) => list.iter().filter_map(convert).collect(),
        (None, Some(groups)) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .filter_map(convert)
            .collect(),
        _ => Vec::new(),
    }
}

fn snippet(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_CHARS)
        .collect()
}

/// Parses a fully fetched message found in `mailbox`.
pub fn parse_full(fetched: &FetchedMessage, mailbox: &str) -> Option<Message> {
    let parsed = MessageParser::default().parse(&fetched.source)?;

    let headers = ThreadingHeaders {
        message_id: parsed.message_id().map(normalize_message_id),
        references: header_ids(parsed.references()),
        in_reply_to: header_ids(parsed.in_reply_to()).into_iter().next(),
    };

    let received_on = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .or(fetched.internal_date)
        .unwrap_or_else(Utc::now);

    let text = parsed.body_text(0).map(|s| s.to_string());
    let html = parsed.body_html(0).map(|s| s.to_string());

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let filename = part.attachment_name();
            Attachment {
                id: attachment_id(fetched.uid, filename, index),
                filename: filename.map_or_else(|| format!("attachment-{index}"), str::to_string),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: part.contents().len() as u64,
            }
        })
        .collect();

    let unread = !fetched.has_flag(SEEN);
    let mut label_ids = vec![LabelId::from(mailbox)];
    if unread {
        label_ids.push(LabelId::from(system_labels::UNREAD));
    }

    Some(Message {
        id: MessageId::from(
            headers
                .message_id
                .clone()
                .unwrap_or_else(|| fetched.uid.to_string()),
        ),
        thread_id: thread_id_for(&headers, fetched.uid),
        headers,
        from: addresses(parsed.from())
            .into_iter()
            .next()
            .unwrap_or_else(Address::unknown),
        to: addresses(parsed.to()),
        cc: addresses(parsed.cc()),
        bcc: addresses(parsed.bcc()),
        subject: parsed.subject().map(str::to_string),
        received_on,
        unread,
        is_draft: fetched.has_flag(DRAFT),
        snippet: text.as_deref().map(snippet).unwrap_or_default(),
        body: MessageBody {
            raw: Some(String::from_utf8_lossy(&fetched.source).into_owned()),
            text,
            html,
        },
        attachments,
        label_ids,
    })
}

/// Finds an attachment by filename or index and returns its metadata and bytes.
pub fn extract_attachment(fetched: &FetchedMessage, matcher: &str) -> Option<(Attachment, Vec<u8>)> {
    let parsed = MessageParser::default().parse(&fetched.source)?;
    parsed
        .attachments()
        .enumerate()
        .find(|(index, part)| {
            part.attachment_name() == Some(matcher) || index.to_string() == matcher
        })
        .map(|(index, part)| {
            let filename = part.attachment_name();
            let attachment = Attachment {
                id: attachment_id(fetched.uid, filename, index),
                filename: filename.map_or_else(|| format!("attachment-{index}"), str::to_string),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: part.contents().len() as u64,
            };
            (attachment, part.contents().to_vec())
        })
}

/// Rebuilds a sendable message from a stored draft.
pub fn outgoing_from_source(source: &[u8]) -> Option<OutgoingMessage> {
    let parsed = MessageParser::default().parse(source)?;
    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| OutgoingAttachment {
            filename: part
                .attachment_name()
                .map_or_else(|| format!("attachment-{index}"), str::to_string),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data: part.contents().to_vec(),
        })
        .collect();

    Some(OutgoingMessage {
        to: addresses(parsed.to()),
        cc: addresses(parsed.cc()),
        bcc: addresses(parsed.bcc()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        body_text: parsed.body_text(0).map(|s| s.to_string()).unwrap_or_default(),
        body_html: parsed.body_html(0).map(|s| s.to_string()),
        thread_id: None,
        in_reply_to: header_ids(parsed.in_reply_to()).into_iter().next(),
        references: header_ids(parsed.references()),
        attachments,
    })
}
