//! IMAP/SMTP driver.
//!
//! Reads go through one IMAP session per connection; writes that leave the
//! mailbox (new mail, sent drafts) go out over SMTP and a copy is filed in
//! the Sent folder.
//!
//! IMAP has no conversations, so a thread is the set of messages whose
//! threading headers derive the same root id (see
//! [`ThreadingHeaders::thread_root`]). Labels are folders: a message lives in
//! exactly one, which is why adding a label moves and removing one is
//! refused.
//!
//! The session holds a single selected mailbox. Every operation takes the
//! session lock for its whole command sequence, so concurrent callers queue
//! instead of stealing each other's selection.

mod folders;
mod lookup;
mod ops;
mod paging;
mod parse;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use self::folders::{resolve_folder, resolve_standard, standard_role};
use self::lookup::{locate, thread_members};
use self::paging::{page_slice, page_window, parse_token};
use self::parse::{
    extract_attachment, outgoing_from_source, parse_attachment_id, parse_full, parse_header_block,
    thread_id_for,
};
use super::compose::{build_message, new_message_id, ComposeOptions};
use super::envelope::{ErrorEnvelope, ProtocolSession, SessionTeardown};
use super::traits::{
    Draft, DraftPage, DraftRequest, EmailAlias, HistoryPage, LabelChange, ListParams, MailManager,
    OutgoingMessage, SentMessage, ThreadPage, UserInfo, DEFAULT_MAX_RESULTS,
};
use super::{ProviderError, Result};
use crate::config::ImapSettings;
use crate::domain::{
    normalize_message_id, strip_thread_prefix, system_labels, Address, AttachmentData, Connection,
    ConnectionId, Label, LabelCount, LabelId, LabelRef, LabelSpec, LabelType, Message,
    ProviderKind, Thread, ThreadId, ThreadStub, ThreadingHeaders,
};

pub use self::folders::StandardFolder;
pub use self::ops::{
    AsyncImapSession, FetchedMessage, ImapOps, MailboxInfo, MailboxStatus, SearchCriteria,
    SelectedMailbox, DELETED, DRAFT, FLAGGED, SEEN,
};
pub use self::session::{ImapConnection, ImapConnector, NetworkConnector, TimedSession};
pub use self::transport::{MailTransport, SmtpTransport};

/// Messages grouped by the mailbox they live in.
type MailboxGroups = Vec<(String, Vec<u32>)>;

fn include(groups: &mut MailboxGroups, mailbox: &str, uid: u32) {
    match groups.iter_mut().find(|(name, _)| name == mailbox) {
        Some((_, uids)) => {
            if !uids.contains(&uid) {
                uids.push(uid);
                uids.sort_unstable();
            }
        }
        None => groups.push((mailbox.to_string(), vec![uid])),
    }
}

fn label_for(path: &str, mailboxes: &[MailboxInfo]) -> Label {
    let label_type = if standard_role(path, mailboxes).is_some() {
        LabelType::System
    } else {
        LabelType::User
    };
    Label {
        id: LabelId::from(path),
        name: path.to_string(),
        label_type,
        color: None,
    }
}

fn folder_ref(path: &str) -> LabelRef {
    LabelRef {
        id: LabelId::from(path),
        name: path.to_string(),
    }
}

/// Flag and folder changes derived from a [`LabelChange`].
#[derive(Debug, Default, PartialEq, Eq)]
struct FlagPlan {
    /// `Some(true)` sets `\Seen`, `Some(false)` clears it.
    seen: Option<bool>,
    flagged: Option<bool>,
    /// Label naming the folder to move into.
    target: Option<String>,
}

fn plan_label_change(change: &LabelChange) -> Result<FlagPlan> {
    let mut plan = FlagPlan::default();

    for label in &change.remove_labels {
        match label.to_ascii_uppercase().as_str() {
            system_labels::UNREAD => plan.seen = Some(true),
            system_labels::STARRED => plan.flagged = Some(false),
            _ => {
                return Err(ProviderError::UnsupportedOperation(format!(
                    "removing label {label} has no IMAP equivalent; move the thread to another folder instead"
                )))
            }
        }
    }

    let mut folders = Vec::new();
    for label in &change.add_labels {
        match label.to_ascii_uppercase().as_str() {
            system_labels::UNREAD => plan.seen = Some(false),
            system_labels::STARRED => plan.flagged = Some(true),
            _ => folders.push(label.clone()),
        }
    }
    if folders.len() > 1 {
        tracing::warn!(
            ignored = ?&folders[1..],
            "IMAP messages live in one folder; moving to the first label only"
        );
    }
    plan.target = folders.into_iter().next();
    Ok(plan)
}

fn drafts_folder(mailboxes: &[MailboxInfo]) -> Result<String> {
    resolve_standard(StandardFolder::Drafts, mailboxes)
        .ok_or_else(|| ProviderError::NotFound("no Drafts folder on this server".to_string()))
}

/// Finds a draft by Message-ID, or by UID when the id is numeric.
///
/// Leaves the Drafts folder selected.
async fn find_draft<S>(session: &mut S, drafts: &str, id: &str) -> Result<u32>
where
    S: ImapOps + ?Sized,
{
    let id = normalize_message_id(strip_thread_prefix(id));
    session.select(drafts).await?;

    let hits = session
        .uid_search(&SearchCriteria::header("Message-ID", &id))
        .await?;
    let fetched = session.uid_fetch_headers(&hits).await?;
    if let Some(found) = fetched.iter().find(|f| {
        parse_header_block(&f.source).threading.message_id.as_deref() == Some(id.as_str())
    }) {
        return Ok(found.uid);
    }

    if let Ok(uid) = id.parse::<u32>() {
        if session
            .uid_search(&SearchCriteria::Uid(uid))
            .await?
            .contains(&uid)
        {
            return Ok(uid);
        }
    }

    Err(ProviderError::NotFound(format!("draft {id}")))
}

/// IMAP reading plus SMTP sending for one connection.
pub struct ImapProvider {
    connection: Connection,
    imap: Arc<ImapConnection>,
    transport: Arc<dyn MailTransport>,
    mailboxes: RwLock<Option<Vec<MailboxInfo>>>,
    envelope: ErrorEnvelope,
}

impl ImapProvider {
    /// Creates a driver that talks to the servers named in the connection.
    ///
    /// Nothing is dialed until the first operation.
    pub fn new(
        connection: Connection,
        settings: &ImapSettings,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Result<Self> {
        let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        let command_timeout = Duration::from_secs(settings.command_timeout_secs);
        let connector = NetworkConnector::from_auth(&connection.auth, connect_timeout)?;
        let transport = SmtpTransport::from_auth(&connection.auth, command_timeout)?;

        Ok(Self::with_parts(
            connection,
            Arc::new(connector),
            Arc::new(transport),
            command_timeout,
            teardown,
        ))
    }

    /// Creates a driver over explicit session and transport implementations.
    pub fn with_parts(
        connection: Connection,
        connector: Arc<dyn ImapConnector>,
        transport: Arc<dyn MailTransport>,
        command_timeout: Duration,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Self {
        let imap = Arc::new(ImapConnection::new(connector, command_timeout));
        let envelope =
            ErrorEnvelope::new(connection.id.clone(), teardown).with_session(imap.clone());

        Self {
            connection,
            imap,
            transport,
            mailboxes: RwLock::new(None),
            envelope,
        }
    }

    fn sender(&self) -> Result<Address> {
        let email = self.connection.email();
        if email.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "connection has no email address to send from".to_string(),
            ));
        }
        Ok(Address::new(email))
    }

    /// Mailbox list, cached until the next folder mutation.
    async fn mailboxes<S>(&self, session: &mut S) -> Result<Vec<MailboxInfo>>
    where
        S: ImapOps + ?Sized,
    {
        if let Some(cached) = self.mailboxes.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let listed = session.list_mailboxes().await?;
        tracing::debug!(
            connection_id = %self.connection.id,
            count = listed.len(),
            "mailbox list refreshed"
        );
        *self.mailboxes.write().await = Some(listed.clone());
        Ok(listed)
    }

    async fn invalidate_mailboxes(&self) {
        *self.mailboxes.write().await = None;
    }

    /// Every message of every thread named by `ids`.
    async fn thread_groups<S>(
        &self,
        session: &mut S,
        ids: &[String],
        mailboxes: &[MailboxInfo],
    ) -> Result<MailboxGroups>
    where
        S: ImapOps + ?Sized,
    {
        let mut groups = MailboxGroups::new();
        for id in self.normalize_ids(ids) {
            let located = locate(&mut *session, &id, mailboxes)
                .await?
                .ok_or_else(|| ProviderError::NotFound(format!("thread {id}")))?;
            let root = located.thread_root();
            for (mailbox, uids) in thread_members(&mut *session, &root, mailboxes).await? {
                for uid in uids {
                    include(&mut groups, &mailbox, uid);
                }
            }
            include(&mut groups, &located.mailbox, located.uid);
        }
        Ok(groups)
    }

    /// Sends over SMTP, then files a copy (with Bcc) in Sent.
    ///
    /// A failed Sent copy is logged, not returned: the message is already out.
    async fn deliver<S>(
        &self,
        session: &mut S,
        mailboxes: &[MailboxInfo],
        message: &OutgoingMessage,
    ) -> Result<SentMessage>
    where
        S: ImapOps + ?Sized,
    {
        let from = self.sender()?;
        let mut message = message.clone();
        if let Some(thread_id) = &message.thread_id {
            let root = normalize_message_id(strip_thread_prefix(thread_id.as_str()));
            if !root.is_empty() {
                if message.references.is_empty() {
                    message.references = vec![root.clone()];
                }
                if message.in_reply_to.is_none() {
                    message.in_reply_to = Some(root);
                }
            }
        }

        let message_id = new_message_id(&from);
        let outgoing = build_message(
            &from,
            &message,
            &ComposeOptions {
                message_id: Some(message_id.clone()),
                keep_bcc: false,
            },
        )?;
        let sent_copy = build_message(
            &from,
            &message,
            &ComposeOptions {
                message_id: Some(message_id.clone()),
                keep_bcc: true,
            },
        )?
        .formatted();

        self.transport.send(outgoing).await?;
        tracing::info!(connection_id = %self.connection.id, message_id = %message_id, "message sent");

        match resolve_standard(StandardFolder::Sent, mailboxes) {
            Some(sent) => {
                if let Err(e) = session.append(&sent, &[SEEN], &sent_copy).await {
                    tracing::warn!(
                        connection_id = %self.connection.id,
                        folder = %sent,
                        error = %e,
                        "failed to file sent copy"
                    );
                }
            }
            None => tracing::warn!(
                connection_id = %self.connection.id,
                "no Sent folder, sent copy not stored"
            ),
        }

        let headers = ThreadingHeaders {
            message_id: Some(message_id.clone()),
            references: message
                .references
                .iter()
                .map(|r| normalize_message_id(r))
                .collect(),
            in_reply_to: message.in_reply_to.as_deref().map(normalize_message_id),
        };
        Ok(SentMessage {
            thread_id: headers.thread_root().map(ThreadId::from),
            id: message_id,
        })
    }

    async fn list_inner(&self, params: &ListParams) -> Result<ThreadPage> {
        let folder_name = if params.folder.is_empty() {
            params
                .label_ids
                .first()
                .cloned()
                .unwrap_or_else(|| system_labels::INBOX.to_string())
        } else {
            params.folder.clone()
        };
        let page_size = if params.max_results == 0 {
            DEFAULT_MAX_RESULTS
        } else {
            params.max_results
        };

        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let folder = resolve_folder(&folder_name, &mailboxes)
            .ok_or_else(|| ProviderError::NotFound(format!("folder {folder_name}")))?;
        let selected = session.select(&folder).await?;

        let query = params
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let (mut fetched, next_page_token) = match query {
            Some(query) => {
                let mut uids = session
                    .uid_search(&SearchCriteria::Text(query.to_string()))
                    .await?;
                uids.reverse();
                let offset = parse_token(params.page_token.as_deref())?;
                let (page, next) = page_slice(&uids, page_size, offset);
                (session.uid_fetch_headers(page).await?, next)
            }
            None => {
                let token = parse_token(params.page_token.as_deref())?;
                match page_window(selected.exists, page_size, token) {
                    Some(window) => (
                        session.fetch_headers(window.start, window.end).await?,
                        window.next_token(),
                    ),
                    None => (Vec::new(), None),
                }
            }
        };
        drop(session);

        fetched.sort_by(|a, b| b.uid.cmp(&a.uid));
        let mut seen = HashSet::new();
        let threads = fetched
            .iter()
            .filter_map(|f| {
                let summary = parse_header_block(&f.source);
                let id = thread_id_for(&summary.threading, f.uid);
                if !seen.insert(id.clone()) {
                    return None;
                }
                Some(ThreadStub {
                    id,
                    raw: Some(json!({
                        "uid": f.uid,
                        "folder": folder,
                        "messageId": summary.threading.message_id,
                        "subject": summary.subject,
                        "from": summary.from.map(|a| a.email),
                        "date": summary.date.map(|d| d.to_rfc3339()),
                        "unread": !f.has_flag(SEEN),
                    })),
                })
            })
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token,
        })
    }

    async fn get_inner(&self, id: &str) -> Result<Thread> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;

        let located = locate(&mut *session, id, &mailboxes)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("thread {id}")))?;
        let root = located.thread_root();
        let mut groups = thread_members(&mut *session, &root, &mailboxes).await?;
        include(&mut groups, &located.mailbox, located.uid);

        let mut messages: Vec<Message> = Vec::new();
        let mut labels = Vec::new();
        for (mailbox, uids) in &groups {
            session.select(mailbox).await?;
            for fetched in session.uid_fetch_full(uids).await? {
                let Some(message) = parse_full(&fetched, mailbox) else {
                    tracing::warn!(mailbox = %mailbox, uid = fetched.uid, "skipping unparseable message");
                    continue;
                };
                // The same message can sit in several folders (e.g. an all-mail folder).
                match messages.iter_mut().find(|m| m.id == message.id) {
                    Some(existing) => {
                        for label in message.label_ids {
                            if label.as_str() != system_labels::UNREAD
                                && !existing.label_ids.contains(&label)
                            {
                                existing.label_ids.push(label);
                            }
                        }
                    }
                    None => messages.push(message),
                }
            }
            labels.push(folder_ref(mailbox));
        }

        Ok(Thread::from_messages(ThreadId::from(root), messages, labels))
    }

    async fn create_inner(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        self.deliver(&mut *session, &mailboxes, message).await
    }

    async fn delete_inner(&self, ids: &[String]) -> Result<()> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let trash = resolve_standard(StandardFolder::Trash, &mailboxes);
        let groups = self.thread_groups(&mut *session, ids, &mailboxes).await?;

        for (mailbox, uids) in &groups {
            match &trash {
                // Members already in Trash stay there.
                Some(trash) if trash == mailbox => continue,
                Some(trash) => {
                    session.select(mailbox).await?;
                    session.uid_move(uids, trash).await?;
                }
                None => {
                    session.select(mailbox).await?;
                    session.uid_store_flags(uids, &[DELETED], true).await?;
                    session.uid_expunge(uids).await?;
                }
            }
        }
        tracing::info!(connection_id = %self.connection.id, threads = ids.len(), "threads deleted");
        Ok(())
    }

    async fn modify_inner(&self, ids: &[String], change: &LabelChange) -> Result<()> {
        let plan = plan_label_change(change)?;

        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let target = plan
            .target
            .as_deref()
            .map(|label| {
                resolve_folder(label, &mailboxes)
                    .ok_or_else(|| ProviderError::NotFound(format!("folder {label}")))
            })
            .transpose()?;
        let groups = self.thread_groups(&mut *session, ids, &mailboxes).await?;

        for (mailbox, uids) in &groups {
            session.select(mailbox).await?;
            if let Some(seen) = plan.seen {
                session.uid_store_flags(uids, &[SEEN], seen).await?;
            }
            if let Some(flagged) = plan.flagged {
                session.uid_store_flags(uids, &[FLAGGED], flagged).await?;
            }
            if let Some(target) = target.as_deref().filter(|t| *t != mailbox.as_str()) {
                session.uid_move(uids, target).await?;
            }
        }
        Ok(())
    }

    async fn labels_inner(&self) -> Result<Vec<Label>> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        Ok(mailboxes
            .iter()
            .filter(|m| !m.no_select)
            .map(|m| label_for(&m.name, &mailboxes))
            .collect())
    }

    async fn create_label_inner(&self, spec: &LabelSpec) -> Result<Label> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ProviderError::InvalidRequest("label name is empty".to_string()));
        }
        let mut session = self.imap.session().await?;
        session.create_mailbox(name).await?;
        self.invalidate_mailboxes().await;
        let mailboxes = self.mailboxes(&mut *session).await?;
        Ok(label_for(name, &mailboxes))
    }

    async fn update_label_inner(&self, id: &str, spec: &LabelSpec) -> Result<Label> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ProviderError::InvalidRequest("label name is empty".to_string()));
        }
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        if !mailboxes.iter().any(|m| m.name == id) {
            return Err(ProviderError::NotFound(format!("label {id}")));
        }
        if name != id {
            session.rename_mailbox(id, name).await?;
            tracing::info!(connection_id = %self.connection.id, from = id, to = name, "folder renamed");
        }
        self.invalidate_mailboxes().await;
        let mailboxes = self.mailboxes(&mut *session).await?;
        Ok(label_for(name, &mailboxes))
    }

    async fn delete_label_inner(&self, id: &str) -> Result<()> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        if !mailboxes.iter().any(|m| m.name == id) {
            return Err(ProviderError::NotFound(format!("label {id}")));
        }
        session.delete_mailbox(id).await?;
        self.invalidate_mailboxes().await;
        Ok(())
    }

    async fn create_draft_inner(&self, request: &DraftRequest) -> Result<Draft> {
        let from = self.sender()?;
        let message_id = new_message_id(&from);
        let raw = build_message(
            &from,
            &request.message,
            &ComposeOptions {
                message_id: Some(message_id.clone()),
                keep_bcc: true,
            },
        )?
        .formatted();

        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let drafts = drafts_folder(&mailboxes)?;

        if let Some(existing) = &request.id {
            let uid = find_draft(&mut *session, &drafts, existing).await?;
            session.uid_store_flags(&[uid], &[DELETED], true).await?;
            session.uid_expunge(&[uid]).await?;
            tracing::debug!(draft_id = %existing, "replaced draft removed");
        }

        session.append(&drafts, &[DRAFT, SEEN], &raw).await?;

        let uid = find_draft(&mut *session, &drafts, &message_id).await?;
        let fetched = session.uid_fetch_full(&[uid]).await?;
        Ok(Draft {
            id: message_id,
            message: fetched.first().and_then(|f| parse_full(f, &drafts)),
        })
    }

    async fn get_draft_inner(&self, id: &str) -> Result<Draft> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let drafts = drafts_folder(&mailboxes)?;

        let uid = find_draft(&mut *session, &drafts, id).await?;
        let fetched = session.uid_fetch_full(&[uid]).await?;
        let message = fetched.first().and_then(|f| parse_full(f, &drafts));
        Ok(Draft {
            id: message
                .as_ref()
                .map(|m| m.id.0.clone())
                .unwrap_or_else(|| normalize_message_id(id)),
            message,
        })
    }

    async fn list_drafts_inner(&self, max_results: u32, page_token: Option<String>) -> Result<DraftPage> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let drafts = drafts_folder(&mailboxes)?;
        let selected = session.select(&drafts).await?;

        let token = parse_token(page_token.as_deref())?;
        let page_size = if max_results == 0 {
            DEFAULT_MAX_RESULTS
        } else {
            max_results
        };
        let Some(window) = page_window(selected.exists, page_size, token) else {
            return Ok(DraftPage {
                drafts: Vec::new(),
                next_page_token: None,
            });
        };

        let mut fetched = session.fetch_headers(window.start, window.end).await?;
        fetched.sort_by(|a, b| b.uid.cmp(&a.uid));
        Ok(DraftPage {
            drafts: fetched
                .iter()
                .map(|f| Draft {
                    id: parse_header_block(&f.source)
                        .threading
                        .message_id
                        .unwrap_or_else(|| f.uid.to_string()),
                    message: None,
                })
                .collect(),
            next_page_token: window.next_token(),
        })
    }

    async fn send_draft_inner(&self, id: &str) -> Result<SentMessage> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let drafts = drafts_folder(&mailboxes)?;

        let uid = find_draft(&mut *session, &drafts, id).await?;
        let fetched = session.uid_fetch_full(&[uid]).await?;
        let outgoing = fetched
            .first()
            .and_then(|f| outgoing_from_source(&f.source))
            .ok_or_else(|| ProviderError::InvalidRequest(format!("draft {id} cannot be parsed")))?;

        let sent = self.deliver(&mut *session, &mailboxes, &outgoing).await?;

        session.select(&drafts).await?;
        session.uid_store_flags(&[uid], &[DELETED], true).await?;
        session.uid_expunge(&[uid]).await?;
        Ok(sent)
    }

    async fn get_attachment_inner(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentData> {
        let (_, matcher) = parse_attachment_id(attachment_id).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("malformed attachment id {attachment_id}"))
        })?;

        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;
        let located = locate(&mut *session, message_id, &mailboxes)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("message {message_id}")))?;

        session.select(&located.mailbox).await?;
        let fetched = session.uid_fetch_full(&[located.uid]).await?;
        let (attachment, data) = fetched
            .first()
            .and_then(|f| extract_attachment(f, matcher))
            .ok_or_else(|| ProviderError::NotFound(format!("attachment {attachment_id}")))?;
        Ok(AttachmentData { attachment, data })
    }

    async fn count_inner(&self) -> Result<Vec<LabelCount>> {
        let mut session = self.imap.session().await?;
        let mailboxes = self.mailboxes(&mut *session).await?;

        let mut counts: Vec<LabelCount> = Vec::new();
        for folder in StandardFolder::ALL {
            let Some(path) = resolve_standard(folder, &mailboxes) else {
                continue;
            };
            if counts.iter().any(|c| c.label.as_str() == path) {
                continue;
            }
            let status = session.status(&path).await?;
            counts.push(LabelCount {
                label: LabelId::from(path),
                total: status.messages,
                unread: status.unseen,
            });
        }
        Ok(counts)
    }
}

impl std::fmt::Debug for ImapProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapProvider")
            .field("connection_id", &self.connection.id)
            .field("imap", &self.imap)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MailManager for ImapProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    async fn list(&self, params: ListParams) -> Result<ThreadPage> {
        let context = json!({
            "folder": params.folder,
            "query": params.query,
            "maxResults": params.max_results,
            "pageToken": params.page_token,
        });
        self.envelope
            .run("list", context, self.list_inner(&params))
            .await
    }

    async fn get(&self, id: &str) -> Result<Thread> {
        self.envelope
            .run("get", json!({ "id": id }), self.get_inner(id))
            .await
    }

    async fn create(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let context = json!({
            "to": message.to.iter().map(|a| a.email.as_str()).collect::<Vec<_>>(),
            "subject": message.subject,
            "threadId": message.thread_id,
        });
        self.envelope
            .run("create", context, self.create_inner(message))
            .await
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.envelope
            .run("delete", json!({ "ids": ids }), self.delete_inner(ids))
            .await
    }

    async fn modify_labels(&self, ids: &[String], change: &LabelChange) -> Result<()> {
        let context = json!({
            "ids": ids,
            "addLabels": change.add_labels,
            "removeLabels": change.remove_labels,
        });
        self.envelope
            .run("modify_labels", context, self.modify_inner(ids, change))
            .await
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        let change = LabelChange::remove([system_labels::UNREAD]);
        self.envelope
            .run("mark_as_read", json!({ "ids": ids }), self.modify_inner(ids, &change))
            .await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        let change = LabelChange::add([system_labels::UNREAD]);
        self.envelope
            .run("mark_as_unread", json!({ "ids": ids }), self.modify_inner(ids, &change))
            .await
    }

    async fn create_label(&self, label: &LabelSpec) -> Result<Label> {
        self.envelope
            .run(
                "create_label",
                json!({ "name": label.name }),
                self.create_label_inner(label),
            )
            .await
    }

    async fn update_label(&self, id: &str, label: &LabelSpec) -> Result<Label> {
        self.envelope
            .run(
                "update_label",
                json!({ "id": id, "name": label.name }),
                self.update_label_inner(id, label),
            )
            .await
    }

    async fn delete_label(&self, id: &str) -> Result<()> {
        self.envelope
            .run("delete_label", json!({ "id": id }), self.delete_label_inner(id))
            .await
    }

    async fn get_label(&self, id: &str) -> Result<Label> {
        self.envelope
            .run("get_label", json!({ "id": id }), async {
                self.labels_inner()
                    .await?
                    .into_iter()
                    .find(|label| label.id.as_str() == id)
                    .ok_or_else(|| ProviderError::NotFound(format!("label {id}")))
            })
            .await
    }

    async fn get_user_labels(&self) -> Result<Vec<Label>> {
        self.envelope
            .run("get_user_labels", json!({}), self.labels_inner())
            .await
    }

    async fn create_draft(&self, draft: &DraftRequest) -> Result<Draft> {
        let context = json!({ "id": draft.id, "subject": draft.message.subject });
        self.envelope
            .run("create_draft", context, self.create_draft_inner(draft))
            .await
    }

    async fn get_draft(&self, id: &str) -> Result<Draft> {
        self.envelope
            .run("get_draft", json!({ "id": id }), self.get_draft_inner(id))
            .await
    }

    async fn list_drafts(&self, max_results: u32, page_token: Option<String>) -> Result<DraftPage> {
        let context = json!({ "maxResults": max_results, "pageToken": page_token });
        self.envelope
            .run(
                "list_drafts",
                context,
                self.list_drafts_inner(max_results, page_token.clone()),
            )
            .await
    }

    async fn send_draft(&self, id: &str) -> Result<SentMessage> {
        self.envelope
            .run("send_draft", json!({ "id": id }), self.send_draft_inner(id))
            .await
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentData> {
        let context = json!({ "messageId": message_id, "attachmentId": attachment_id });
        self.envelope
            .run(
                "get_attachment",
                context,
                self.get_attachment_inner(message_id, attachment_id),
            )
            .await
    }

    async fn count(&self) -> Result<Vec<LabelCount>> {
        self.envelope.run("count", json!({}), self.count_inner()).await
    }

    async fn get_email_aliases(&self) -> Result<Vec<EmailAlias>> {
        self.envelope
            .run("get_email_aliases", json!({}), async {
                Ok(vec![EmailAlias {
                    email: self.sender()?.email,
                    name: None,
                    primary: true,
                }])
            })
            .await
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        self.envelope
            .run("get_user_info", json!({}), async {
                Ok(UserInfo {
                    address: self.sender()?.email,
                    name: None,
                    photo: None,
                })
            })
            .await
    }

    async fn list_history(&self, history_id: &str) -> Result<HistoryPage> {
        self.envelope
            .run("list_history", json!({ "historyId": history_id }), async {
                Err(ProviderError::not_implemented("IMAP has no history feed"))
            })
            .await
    }

    async fn revoke_refresh_token(&self) -> Result<bool> {
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        self.envelope
            .run("close", json!({}), self.imap.disconnect())
            .await
    }
}
