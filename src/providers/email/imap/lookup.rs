//! Resolving opaque ids to messages and collecting conversation members.
//!
//! IMAP has no stable cross-folder message id, so an id is tried against the
//! `Message-ID`, `References` and `In-Reply-To` headers in that order, each
//! over every folder (common folders first), and finally as a raw UID.
//! Server-side HEADER search is a substring match, so every hit is verified
//! against the parsed headers before it counts.

use super::folders::{resolve_folder, search_order, StandardFolder};
use super::ops::{FetchedMessage, ImapOps, MailboxInfo, SearchCriteria};
use super::parse::{parse_header_block, thread_id_for, HeaderSummary};
use crate::domain::{normalize_message_id, strip_thread_prefix, ThreadingHeaders};
use crate::providers::email::{ProviderError, Result};

/// Where a message lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub mailbox: String,
    pub uid: u32,
    pub headers: HeaderSummary,
}

impl Located {
    /// Conversation this message belongs to.
    pub fn thread_root(&self) -> String {
        thread_id_for(&self.headers.threading, self.uid).0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    MessageId,
    References,
    InReplyTo,
}

impl Strategy {
    const ORDER: [Strategy; 3] = [Self::MessageId, Self::References, Self::InReplyTo];

    fn header(&self) -> &'static str {
        match self {
            Self::MessageId => "Message-ID",
            Self::References => "References",
            Self::InReplyTo => "In-Reply-To",
        }
    }

    fn verify(&self, headers: &ThreadingHeaders, id: &str) -> bool {
        match self {
            Self::MessageId => headers.message_id.as_deref() == Some(id),
            Self::References => headers.references.iter().any(|r| r == id),
            Self::InReplyTo => headers.in_reply_to.as_deref() == Some(id),
        }
    }
}

/// Selects `mailbox` and fetches headers of the messages matching `criteria`.
///
/// A mailbox that disappeared since listing yields no hits.
async fn search_headers<S>(
    session: &mut S,
    mailbox: &str,
    criteria: &SearchCriteria,
) -> Result<Vec<FetchedMessage>>
where
    S: ImapOps + ?Sized,
{
    match session.select(mailbox).await {
        Ok(_) => {}
        Err(ProviderError::NotFound(_)) => {
            tracing::debug!(mailbox, "mailbox vanished during lookup");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    }
    let uids = session.uid_search(criteria).await?;
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    session.uid_fetch_headers(&uids).await
}

/// Finds the message an id refers to.
///
/// Leaves an arbitrary mailbox selected.
pub async fn locate<S>(session: &mut S, id: &str, mailboxes: &[MailboxInfo]) -> Result<Option<Located>>
where
    S: ImapOps + ?Sized,
{
    let id = normalize_message_id(strip_thread_prefix(id));
    if id.is_empty() {
        return Ok(None);
    }
    let folders = search_order(mailboxes);

    for strategy in Strategy::ORDER {
        let criteria = SearchCriteria::header(strategy.header(), &id);
        for mailbox in &folders {
            let hit = search_headers(session, mailbox, &criteria)
                .await?
                .into_iter()
                .map(|f| (f.uid, parse_header_block(&f.source)))
                .filter(|(_, headers)| strategy.verify(&headers.threading, &id))
                .min_by_key(|(uid, _)| *uid);

            if let Some((uid, headers)) = hit {
                tracing::debug!(id = %id, mailbox = %mailbox, uid, strategy = ?strategy, "message located");
                return Ok(Some(Located {
                    mailbox: mailbox.clone(),
                    uid,
                    headers,
                }));
            }
        }
    }

    if let Ok(uid) = id.parse::<u32>() {
        for folder in StandardFolder::COMMON {
            let Some(mailbox) = resolve_folder(folder.system_label(), mailboxes) else {
                continue;
            };
            let hit = search_headers(session, &mailbox, &SearchCriteria::Uid(uid))
                .await?
                .into_iter()
                .find(|f| f.uid == uid);
            if let Some(fetched) = hit {
                tracing::debug!(id = %id, mailbox = %mailbox, "message located by UID");
                return Ok(Some(Located {
                    mailbox,
                    uid,
                    headers: parse_header_block(&fetched.source),
                }));
            }
        }
    }

    tracing::debug!(id = %id, "no lookup strategy matched");
    Ok(None)
}

/// Messages of one conversation, grouped by mailbox in search order.
pub async fn thread_members<S>(
    session: &mut S,
    root: &str,
    mailboxes: &[MailboxInfo],
) -> Result<Vec<(String, Vec<u32>)>>
where
    S: ImapOps + ?Sized,
{
    let criteria = SearchCriteria::Or(vec![
        SearchCriteria::header("Message-ID", root),
        SearchCriteria::header("References", root),
        SearchCriteria::header("In-Reply-To", root),
    ]);

    let mut groups = Vec::new();
    for mailbox in search_order(mailboxes) {
        let mut uids: Vec<u32> = search_headers(session, &mailbox, &criteria)
            .await?
            .into_iter()
            .filter(|f| thread_id_for(&parse_header_block(&f.source).threading, f.uid).as_str() == root)
            .map(|f| f.uid)
            .collect();
        if !uids.is_empty() {
            uids.sort_unstable();
            groups.push((mailbox, uids));
        }
    }
    Ok(groups)
}
