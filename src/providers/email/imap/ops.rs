//! The IMAP command surface the driver needs, and its `async-imap` binding.

use std::fmt::Debug;

use async_imap::types::{Fetch, Flag, NameAttribute};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncRead, AsyncWrite, TryStreamExt};

use crate::providers::email::{ProviderError, Result};

/// Message flag `\Seen`.
pub const SEEN: &str = "\\Seen";
/// Message flag `\Deleted`.
pub const DELETED: &str = "\\Deleted";
/// Message flag `\Draft`.
pub const DRAFT: &str = "\\Draft";
/// Message flag `\Flagged`.
pub const FLAGGED: &str = "\\Flagged";

const HEADER_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER])";
const FULL_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// One entry of a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Full mailbox path.
    pub name: String,
    /// Hierarchy delimiter.
    pub delimiter: Option<String>,
    /// Mailbox carries `\Noselect`.
    pub no_select: bool,
}

impl MailboxInfo {
    /// A selectable mailbox with `/` as delimiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delimiter: Some("/".to_string()),
            no_select: false,
        }
    }
}

/// State reported by SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedMailbox {
    /// Number of messages (`EXISTS`).
    pub exists: u32,
}

/// Counts reported by STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages.
    pub messages: u32,
    /// Number of messages without `\Seen`.
    pub unseen: u32,
}

/// A fetched message. `source` holds the header block or the whole message,
/// depending on the fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub source: Vec<u8>,
}

impl FetchedMessage {
    /// Whether the message carries `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// UID SEARCH criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Every message.
    All,
    /// Header field contains the value.
    Header(String, String),
    /// Any of the criteria.
    Or(Vec<SearchCriteria>),
    /// Header or body contains the value.
    Text(String),
    /// Exactly this UID.
    Uid(u32),
}

impl SearchCriteria {
    /// Header criterion.
    pub fn header(name: &str, value: &str) -> Self {
        Self::Header(name.to_string(), value.to_string())
    }

    /// Renders the criteria as an IMAP search key.
    pub fn to_query(&self) -> String {
        match self {
            Self::All => "ALL".to_string(),
            Self::Header(name, value) => format!("HEADER {} {}", name, quote(value)),
            Self::Text(value) => format!("TEXT {}", quote(value)),
            Self::Uid(uid) => format!("UID {uid}"),
            Self::Or(items) => match items.split_first() {
                None => "ALL".to_string(),
                Some((first, [])) => first.to_query(),
                Some((first, rest)) => {
                    format!("OR {} {}", first.to_query(), Self::Or(rest.to_vec()).to_query())
                }
            },
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// IMAP commands over one authenticated session.
///
/// Every method acts on the currently selected mailbox where IMAP does, so
/// callers must hold the session exclusively between SELECT and the commands
/// that depend on it.
#[async_trait]
pub trait ImapOps: Send {
    async fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>>;
    async fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox>;
    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus>;
    async fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>>;
    /// Fetches headers for a sequence-number range.
    async fn fetch_headers(&mut self, start: u32, end: u32) -> Result<Vec<FetchedMessage>>;
    async fn uid_fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>>;
    async fn uid_fetch_full(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>>;
    /// Adds (`add`) or removes flags.
    async fn uid_store_flags(&mut self, uids: &[u32], flags: &[&str], add: bool) -> Result<()>;
    /// Moves messages, falling back to COPY, `\Deleted` and UID EXPUNGE without MOVE.
    async fn uid_move(&mut self, uids: &[u32], target: &str) -> Result<()>;
    /// Permanently removes the given `\Deleted` messages.
    ///
    /// Servers without UIDPLUS only offer a plain EXPUNGE, which also removes
    /// any other `\Deleted` message in the selected mailbox.
    async fn uid_expunge(&mut self, uids: &[u32]) -> Result<()>;
    async fn create_mailbox(&mut self, name: &str) -> Result<()>;
    async fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<()>;
    async fn delete_mailbox(&mut self, name: &str) -> Result<()>;
    async fn append(&mut self, mailbox: &str, flags: &[&str], content: &[u8]) -> Result<()>;
    async fn logout(&mut self) -> Result<()>;
}

/// Response codes servers use for throttling (`[THROTTLED]` is Gmail's,
/// `[LIMIT]` is RFC 5530).
const THROTTLE_CODES: &[&str] = &["[THROTTLED]", "[LIMIT]"];

fn is_throttle_response(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    THROTTLE_CODES.iter().any(|code| upper.contains(code))
}

fn imap_error(command: &str) -> impl Fn(async_imap::error::Error) -> ProviderError + '_ {
    move |e| match e {
        async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg)
            if is_throttle_response(&msg) =>
        {
            tracing::debug!(command, response = %msg, "server throttled command");
            ProviderError::RateLimited {
                status: 429,
                retry_after_secs: None,
            }
        }
        async_imap::error::Error::No(msg) if command == "SELECT" || command == "STATUS" => {
            ProviderError::NotFound(format!("{command}: {msg}"))
        }
        async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
            ProviderError::InvalidRequest(format!("{command} rejected: {msg}"))
        }
        other => ProviderError::Connection(format!("{command} failed: {other}")),
    }
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

fn convert_fetch(fetch: &Fetch, full: bool) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let source = if full { fetch.body() } else { fetch.header() }?;
    Some(FetchedMessage {
        uid,
        flags: fetch.flags().map(|f| flag_name(&f)).collect(),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        source: source.to_vec(),
    })
}

/// [`ImapOps`] over a live `async-imap` session.
pub struct AsyncImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: async_imap::Session<T>,
}

impl<T> AsyncImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    pub fn new(session: async_imap::Session<T>) -> Self {
        Self { session }
    }

    async fn fetch(&mut self, set: &str, uid: bool, full: bool) -> Result<Vec<FetchedMessage>> {
        let query = if full { FULL_QUERY } else { HEADER_QUERY };
        let fetches: Vec<Fetch> = if uid {
            self.session
                .uid_fetch(set, query)
                .await
                .map_err(imap_error("UID FETCH"))?
                .try_collect()
                .await
                .map_err(imap_error("UID FETCH"))?
        } else {
            self.session
                .fetch(set, query)
                .await
                .map_err(imap_error("FETCH"))?
                .try_collect()
                .await
                .map_err(imap_error("FETCH"))?
        };
        Ok(fetches.iter().filter_map(|f| convert_fetch(f, full)).collect())
    }
}

#[async_trait]
impl<T> ImapOps for AsyncImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    async fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>> {
        let names: Vec<_> = self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(imap_error("LIST"))?
            .try_collect()
            .await
            .map_err(imap_error("LIST"))?;

        Ok(names
            .iter()
            .map(|name| MailboxInfo {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(str::to_string),
                no_select: name
                    .attributes()
                    .iter()
                    .any(|a| matches!(a, NameAttribute::NoSelect)),
            })
            .collect())
    }

    async fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox> {
        let selected = self
            .session
            .select(mailbox)
            .await
            .map_err(imap_error("SELECT"))?;
        Ok(SelectedMailbox {
            exists: selected.exists,
        })
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let status = self
            .session
            .status(mailbox, "(MESSAGES UNSEEN)")
            .await
            .map_err(imap_error("STATUS"))?;
        Ok(MailboxStatus {
            messages: status.exists,
            unseen: status.unseen.unwrap_or(0),
        })
    }

    async fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let uids = self
            .session
            .uid_search(criteria.to_query())
            .await
            .map_err(imap_error("UID SEARCH"))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_headers(&mut self, start: u32, end: u32) -> Result<Vec<FetchedMessage>> {
        self.fetch(&format!("{start}:{end}"), false, false).await
    }

    async fn uid_fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(&uid_set(uids), true, false).await
    }

    async fn uid_fetch_full(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(&uid_set(uids), true, true).await
    }

    async fn uid_store_flags(&mut self, uids: &[u32], flags: &[&str], add: bool) -> Result<()> {
        let sign = if add { '+' } else { '-' };
        let query = format!("{sign}FLAGS ({})", flags.join(" "));
        self.session
            .uid_store(uid_set(uids), query)
            .await
            .map_err(imap_error("UID STORE"))?
            .try_for_each(|_| futures::future::ready(Ok(())))
            .await
            .map_err(imap_error("UID STORE"))
    }

    async fn uid_move(&mut self, uids: &[u32], target: &str) -> Result<()> {
        let set = uid_set(uids);
        if let Err(e) = self.session.uid_mv(&set, target).await {
            tracing::debug!(error = %e, target, "UID MOVE unavailable, copying instead");
            self.session
                .uid_copy(&set, target)
                .await
                .map_err(imap_error("UID COPY"))?;
            self.uid_store_flags(uids, &[DELETED], true).await?;
            self.uid_expunge(uids).await?;
        }
        Ok(())
    }

    async fn uid_expunge(&mut self, uids: &[u32]) -> Result<()> {
        let scoped = match self.session.uid_expunge(uid_set(uids)).await {
            Ok(stream) => stream
                .try_for_each(|_| futures::future::ready(Ok(())))
                .await
                .map_err(imap_error("UID EXPUNGE")),
            Err(e) => Err(imap_error("UID EXPUNGE")(e)),
        };
        if let Err(e) = scoped {
            tracing::debug!(error = %e, "UID EXPUNGE unavailable, expunging mailbox");
            self.session
                .expunge()
                .await
                .map_err(imap_error("EXPUNGE"))?
                .try_for_each(|_| futures::future::ready(Ok(())))
                .await
                .map_err(imap_error("EXPUNGE"))?;
        }
        Ok(())
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<()> {
        self.session.create(name).await.map_err(imap_error("CREATE"))
    }

    async fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<()> {
        self.session
            .rename(from, to)
            .await
            .map_err(imap_error("RENAME"))
    }

    async fn delete_mailbox(&mut self, name: &str) -> Result<()> {
        self.session.delete(name).await.map_err(imap_error("DELETE"))
    }

    async fn append(&mut self, mailbox: &str, flags: &[&str], content: &[u8]) -> Result<()> {
        let flags = format!("({})", flags.join(" "));
        self.session
            .append(mailbox, Some(flags.as_str()), None, content)
            .await
            .map_err(imap_error("APPEND"))
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await.map_err(imap_error("LOGOUT"))
    }
}
