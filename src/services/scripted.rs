//! In-memory [`MailManager`] for sync engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::domain::{
    Address, AttachmentData, ConnectionId, Label, LabelCount, LabelId, LabelSpec, Message,
    MessageBody, MessageId, ProviderKind, Thread, ThreadId, ThreadStub, ThreadingHeaders,
};
use crate::providers::email::{
    Draft, DraftPage, DraftRequest, EmailAlias, HistoryPage, LabelChange, ListParams, MailManager,
    OutgoingMessage, ProviderError, Result, SentMessage, ThreadPage, UserInfo,
};

pub fn message(id: &str, thread_id: &str, minute: u32, labels: &[&str]) -> Message {
    Message {
        id: MessageId::from(id),
        thread_id: ThreadId::from(thread_id),
        headers: ThreadingHeaders {
            message_id: Some(id.to_string()),
            ..ThreadingHeaders::default()
        },
        from: Address::with_name("ann@example.com", "Ann"),
        to: vec![Address::new("me@example.com")],
        cc: vec![],
        bcc: vec![],
        subject: Some(format!("Subject {id}")),
        received_on: Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap(),
        unread: false,
        is_draft: false,
        snippet: String::new(),
        body: MessageBody::default(),
        attachments: vec![],
        label_ids: labels.iter().map(|l| LabelId::from(*l)).collect(),
    }
}

pub fn thread(id: &str, minute: u32, labels: &[&str]) -> Thread {
    Thread::from_messages(ThreadId::from(id), vec![message(id, id, minute, labels)], vec![])
}

pub fn thread_with_reply(root: &str, reply: &str) -> Thread {
    Thread::from_messages(
        ThreadId::from(root),
        vec![message(root, root, 1, &["INBOX"]), message(reply, root, 2, &["INBOX"])],
        vec![],
    )
}

pub fn empty_thread(id: &str) -> Thread {
    Thread::from_messages(ThreadId::from(id), vec![], vec![])
}

fn rebuild(thread: &Thread, edit: impl Fn(&mut Message)) -> Thread {
    let mut messages = thread.messages.clone();
    messages.iter_mut().for_each(edit);
    Thread::from_messages(thread.id.clone(), messages, thread.labels.clone())
}

/// Serves a fixed list of threads, newest first, with numeric page tokens.
pub struct ScriptedDriver {
    connection_id: ConnectionId,
    threads: Mutex<Vec<Thread>>,
    get_delay: Duration,
    failing: HashSet<String>,
    fail_list: bool,
    throttled_gets: AtomicU32,
    list_calls: AtomicU32,
    get_calls: AtomicU32,
    modified: Mutex<Vec<Vec<String>>>,
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl ScriptedDriver {
    pub fn new(threads: Vec<Thread>) -> Self {
        Self {
            connection_id: ConnectionId::from("conn-1"),
            threads: Mutex::new(threads),
            get_delay: Duration::ZERO,
            failing: HashSet::new(),
            fail_list: false,
            throttled_gets: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            get_calls: AtomicU32::new(0),
            modified: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    /// `get` of this id fails with an internal error.
    pub fn failing_on(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Every `list` fails with a connection error.
    pub fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    /// The next `count` calls to `get` answer 429.
    pub fn throttled_gets(self, count: u32) -> Self {
        self.throttled_gets.store(count, Ordering::SeqCst);
        self
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn modified_ids(&self) -> Vec<Vec<String>> {
        self.modified.lock().unwrap().clone()
    }

    pub fn sent_subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }

    fn update(&self, ids: &[String], edit: impl Fn(&mut Message)) {
        let mut threads = self.threads.lock().unwrap();
        for thread in threads.iter_mut().filter(|t| ids.contains(&t.id.0)) {
            *thread = rebuild(thread, &edit);
        }
    }
}

#[async_trait]
impl MailManager for ScriptedDriver {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn list(&self, params: ListParams) -> Result<ThreadPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(ProviderError::Connection("listing refused".into()));
        }

        let offset: usize = params
            .page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let threads = self.threads.lock().unwrap();
        let end = (offset + params.max_results as usize).min(threads.len());
        let stubs = threads
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|t| ThreadStub::new(t.id.clone()))
            .collect();

        Ok(ThreadPage {
            threads: stubs,
            next_page_token: (end < threads.len()).then(|| end.to_string()),
        })
    }

    async fn get(&self, id: &str) -> Result<Thread> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        if self.throttled_gets.load(Ordering::SeqCst) > 0 {
            self.throttled_gets.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::RateLimited {
                status: 429,
                retry_after_secs: None,
            });
        }
        if self.failing.contains(id) {
            return Err(ProviderError::Internal(format!("cannot fetch {id}")));
        }

        self.threads
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id.as_str() == id || t.messages.iter().any(|m| m.id.as_str() == id))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn create(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        let id = format!("sent-{}", sent.len());

        let mut stored = crate::services::scripted::message(&id, &id, 30, &["SENT"]);
        stored.subject = Some(message.subject.clone());
        stored.from = Address::new("me@example.com");
        stored.to = message.to.clone();
        self.threads.lock().unwrap().insert(
            0,
            Thread::from_messages(ThreadId::from(id.as_str()), vec![stored], vec![]),
        );

        Ok(SentMessage {
            id: id.clone(),
            thread_id: Some(ThreadId::from(id)),
        })
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.threads
            .lock()
            .unwrap()
            .retain(|t| !ids.contains(&t.id.0));
        Ok(())
    }

    async fn modify_labels(&self, ids: &[String], change: &LabelChange) -> Result<()> {
        self.modified.lock().unwrap().push(ids.to_vec());
        self.update(ids, |m| {
            m.label_ids
                .retain(|l| !change.remove_labels.contains(&l.0));
            for label in &change.add_labels {
                let label = LabelId::from(label.as_str());
                if !m.label_ids.contains(&label) {
                    m.label_ids.push(label);
                }
            }
        });
        Ok(())
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        self.update(ids, |m| m.unread = false);
        Ok(())
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        self.update(ids, |m| m.unread = true);
        Ok(())
    }

    async fn create_label(&self, _label: &LabelSpec) -> Result<Label> {
        Err(ProviderError::not_implemented("create_label"))
    }

    async fn update_label(&self, _id: &str, _label: &LabelSpec) -> Result<Label> {
        Err(ProviderError::not_implemented("update_label"))
    }

    async fn delete_label(&self, _id: &str) -> Result<()> {
        Err(ProviderError::not_implemented("delete_label"))
    }

    async fn get_label(&self, _id: &str) -> Result<Label> {
        Err(ProviderError::not_implemented("get_label"))
    }

    async fn get_user_labels(&self) -> Result<Vec<Label>> {
        Ok(Vec::new())
    }

    async fn create_draft(&self, _draft: &DraftRequest) -> Result<Draft> {
        Err(ProviderError::not_implemented("create_draft"))
    }

    async fn get_draft(&self, _id: &str) -> Result<Draft> {
        Err(ProviderError::not_implemented("get_draft"))
    }

    async fn list_drafts(&self, _max_results: u32, _page_token: Option<String>) -> Result<DraftPage> {
        Ok(DraftPage::default())
    }

    async fn send_draft(&self, _id: &str) -> Result<SentMessage> {
        Err(ProviderError::not_implemented("send_draft"))
    }

    async fn get_attachment(&self, _message_id: &str, _attachment_id: &str) -> Result<AttachmentData> {
        Err(ProviderError::not_implemented("get_attachment"))
    }

    async fn count(&self) -> Result<Vec<LabelCount>> {
        Ok(Vec::new())
    }

    async fn get_email_aliases(&self) -> Result<Vec<EmailAlias>> {
        Ok(Vec::new())
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        Err(ProviderError::not_implemented("get_user_info"))
    }

    async fn list_history(&self, _history_id: &str) -> Result<HistoryPage> {
        Err(ProviderError::not_implemented("list_history"))
    }

    async fn revoke_refresh_token(&self) -> Result<bool> {
        Ok(false)
    }
}
