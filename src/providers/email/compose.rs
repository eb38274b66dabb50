//! RFC 5322 message assembly shared by the drivers.

use lettre::message::header::ContentType;
use lettre::message::{Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart};
use lettre::Message as MimeMessage;

use super::traits::OutgoingMessage;
use super::{ProviderError, Result};
use crate::domain::{normalize_message_id, Address};

/// Options for [`build_message`].
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    /// Message-ID to stamp, without angle brackets. Generated when `None`.
    pub message_id: Option<String>,
    /// Keep the `Bcc` header in the formatted output.
    pub keep_bcc: bool,
}

fn mailbox(addr: &Address, field: &str) -> Result<Mailbox> {
    let email = addr
        .email
        .parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid {field} address: {e}")))?;
    Ok(Mailbox::new(addr.name.clone(), email))
}

fn bracketed(id: &str) -> String {
    format!("<{}>", normalize_message_id(id))
}

/// Creates a fresh Message-ID in the sender's domain.
pub fn new_message_id(from: &Address) -> String {
    let domain = from
        .email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .unwrap_or("mailmux.local");
    format!("{}@{}", uuid::Uuid::new_v4(), domain)
}

/// Assembles a MIME message from `from` and `message`.
///
/// `In-Reply-To` and `References` are written when the message replies into
/// a conversation.
pub fn build_message(
    from: &Address,
    message: &OutgoingMessage,
    options: &ComposeOptions,
) -> Result<MimeMessage> {
    if message.to.is_empty() && message.cc.is_empty() && message.bcc.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "message has no recipients".to_string(),
        ));
    }

    let message_id = options
        .message_id
        .clone()
        .unwrap_or_else(|| new_message_id(from));

    let mut builder = MimeMessage::builder()
        .from(mailbox(from, "from")?)
        .subject(message.subject.clone())
        .message_id(Some(bracketed(&message_id)));

    for addr in &message.to {
        builder = builder.to(mailbox(addr, "to")?);
    }
    for addr in &message.cc {
        builder = builder.cc(mailbox(addr, "cc")?);
    }
    for addr in &message.bcc {
        builder = builder.bcc(mailbox(addr, "bcc")?);
    }
    if options.keep_bcc {
        builder = builder.keep_bcc();
    }

    if let Some(reply_to) = &message.in_reply_to {
        builder = builder.in_reply_to(bracketed(reply_to));
    }
    if !message.references.is_empty() {
        let references: Vec<String> = message.references.iter().map(|id| bracketed(id)).collect();
        builder = builder.references(references.join(" "));
    }

    let body = match &message.body_html {
        Some(html) => MultiPart::alternative()
            .singlepart(SinglePart::plain(message.body_text.clone()))
            .singlepart(SinglePart::html(html.clone())),
        None => MultiPart::mixed().singlepart(SinglePart::plain(message.body_text.clone())),
    };

    let body = if message.attachments.is_empty() {
        body
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                ProviderError::InvalidRequest(format!(
                    "invalid content type for {}: {e}",
                    attachment.filename
                ))
            })?;
            mixed = mixed.singlepart(
                AttachmentPart::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        mixed
    };

    builder
        .multipart(body)
        .map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {e}")))
}
