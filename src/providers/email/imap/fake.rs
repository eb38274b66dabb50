//! In-memory IMAP server and SMTP transport for driver tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mailparse::MailHeaderMap;

use super::ops::{
    FetchedMessage, ImapOps, MailboxInfo, MailboxStatus, SearchCriteria, SelectedMailbox, DELETED,
    SEEN,
};
use super::session::ImapConnector;
use super::transport::MailTransport;
use crate::providers::email::{ProviderError, Result};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub source: Vec<u8>,
}

impl StoredMessage {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

#[derive(Debug, Default)]
struct FakeMailbox {
    next_uid: u32,
    messages: Vec<StoredMessage>,
}

impl FakeMailbox {
    fn new() -> Self {
        Self {
            next_uid: 1,
            messages: Vec::new(),
        }
    }

    fn push(&mut self, flags: Vec<String>, source: Vec<u8>) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.push(StoredMessage { uid, flags, source });
        uid
    }
}

#[derive(Debug, Default)]
struct ServerState {
    mailboxes: BTreeMap<String, FakeMailbox>,
    order: Vec<String>,
    commands: Vec<String>,
    hang: Option<String>,
    reject_logins: bool,
    no_move: bool,
    logouts: usize,
}

/// Shared mailbox state. Clones observe the same server.
#[derive(Debug, Clone, Default)]
pub struct FakeImapServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeImapServer {
    pub fn with_mailboxes(names: &[&str]) -> Self {
        let server = Self::default();
        {
            let mut state = server.state.lock().unwrap();
            for name in names {
                state.mailboxes.insert(name.to_string(), FakeMailbox::new());
                state.order.push(name.to_string());
            }
        }
        server
    }

    /// Stores a message and returns its UID.
    pub fn add_message(&self, mailbox: &str, flags: &[&str], source: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        state
            .mailboxes
            .get_mut(mailbox)
            .unwrap_or_else(|| panic!("no mailbox {mailbox}"))
            .push(
                flags.iter().map(|f| f.to_string()).collect(),
                source.as_bytes().to_vec(),
            )
    }

    pub fn messages(&self, mailbox: &str) -> Vec<StoredMessage> {
        let state = self.state.lock().unwrap();
        state
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.clone())
            .unwrap_or_default()
    }

    pub fn mailbox_names(&self) -> Vec<String> {
        self.state.lock().unwrap().order.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// The next command with this name never completes.
    pub fn hang_next(&self, command: &str) {
        self.state.lock().unwrap().hang = Some(command.to_string());
    }

    pub fn reject_logins(&self) {
        self.state.lock().unwrap().reject_logins = true;
    }

    /// Makes UID MOVE fail so callers exercise the copy fallback.
    pub fn disable_move(&self) {
        self.state.lock().unwrap().no_move = true;
    }

    pub fn logouts(&self) -> usize {
        self.state.lock().unwrap().logouts
    }
}

/// Hands out sessions on a [`FakeImapServer`] and counts them.
#[derive(Debug)]
pub struct FakeConnector {
    server: FakeImapServer,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(server: FakeImapServer) -> Self {
        Self {
            server,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImapConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn ImapOps>> {
        if self.server.state.lock().unwrap().reject_logins {
            return Err(ProviderError::Authentication(
                "IMAP login failed: [AUTHENTICATIONFAILED] Invalid credentials".into(),
            ));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
            selected: None,
        }))
    }
}

struct FakeSession {
    server: FakeImapServer,
    selected: Option<String>,
}

fn header_block(source: &[u8]) -> Vec<u8> {
    match source.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => source[..pos + 4].to_vec(),
        None => source.to_vec(),
    }
}

fn matches(message: &StoredMessage, criteria: &SearchCriteria) -> bool {
    match criteria {
        SearchCriteria::All => true,
        SearchCriteria::Uid(uid) => message.uid == *uid,
        SearchCriteria::Or(items) => items.iter().any(|c| matches(message, c)),
        SearchCriteria::Text(needle) => String::from_utf8_lossy(&message.source)
            .to_lowercase()
            .contains(&needle.to_lowercase()),
        SearchCriteria::Header(name, needle) => mailparse::parse_headers(&message.source)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value(name))
            .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
    }
}

impl FakeSession {
    async fn begin(&self, command: &str) {
        let hang = {
            let mut state = self.server.state.lock().unwrap();
            state.commands.push(command.to_string());
            if state.hang.as_deref() == Some(command) {
                state.hang.take().is_some()
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }

    fn with_selected<T>(&self, f: impl FnOnce(&mut FakeMailbox) -> Result<T>) -> Result<T> {
        let selected = self
            .selected
            .clone()
            .ok_or_else(|| ProviderError::InvalidRequest("no mailbox selected".into()))?;
        let mut state = self.server.state.lock().unwrap();
        let mailbox = state
            .mailboxes
            .get_mut(&selected)
            .ok_or_else(|| ProviderError::InvalidRequest("selected mailbox vanished".into()))?;
        f(mailbox)
    }

    fn fetch_uids(&self, uids: &[u32], full: bool) -> Result<Vec<FetchedMessage>> {
        self.with_selected(|mailbox| {
            Ok(mailbox
                .messages
                .iter()
                .filter(|m| uids.contains(&m.uid))
                .map(|m| FetchedMessage {
                    uid: m.uid,
                    flags: m.flags.clone(),
                    internal_date: None,
                    source: if full {
                        m.source.clone()
                    } else {
                        header_block(&m.source)
                    },
                })
                .collect())
        })
    }
}

#[async_trait]
impl ImapOps for FakeSession {
    async fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>> {
        self.begin("LIST").await;
        Ok(self
            .server
            .mailbox_names()
            .into_iter()
            .map(MailboxInfo::new)
            .collect())
    }

    async fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox> {
        self.begin("SELECT").await;
        let state = self.server.state.lock().unwrap();
        let found = state
            .mailboxes
            .get(mailbox)
            .ok_or_else(|| ProviderError::NotFound(format!("SELECT: no mailbox {mailbox}")))?;
        let exists = found.messages.len() as u32;
        drop(state);
        self.selected = Some(mailbox.to_string());
        Ok(SelectedMailbox { exists })
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        self.begin("STATUS").await;
        let state = self.server.state.lock().unwrap();
        let found = state
            .mailboxes
            .get(mailbox)
            .ok_or_else(|| ProviderError::NotFound(format!("STATUS: no mailbox {mailbox}")))?;
        Ok(MailboxStatus {
            messages: found.messages.len() as u32,
            unseen: found.messages.iter().filter(|m| !m.has_flag(SEEN)).count() as u32,
        })
    }

    async fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        self.begin("UID SEARCH").await;
        self.with_selected(|mailbox| {
            Ok(mailbox
                .messages
                .iter()
                .filter(|m| matches(m, criteria))
                .map(|m| m.uid)
                .collect())
        })
    }

    async fn fetch_headers(&mut self, start: u32, end: u32) -> Result<Vec<FetchedMessage>> {
        self.begin("FETCH").await;
        let uids = self.with_selected(|mailbox| {
            Ok(mailbox
                .messages
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    let seq = *i as u32 + 1;
                    seq >= start && seq <= end
                })
                .map(|(_, m)| m.uid)
                .collect::<Vec<_>>())
        })?;
        self.fetch_uids(&uids, false)
    }

    async fn uid_fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        self.begin("UID FETCH").await;
        self.fetch_uids(uids, false)
    }

    async fn uid_fetch_full(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        self.begin("UID FETCH").await;
        self.fetch_uids(uids, true)
    }

    async fn uid_store_flags(&mut self, uids: &[u32], flags: &[&str], add: bool) -> Result<()> {
        self.begin("UID STORE").await;
        self.with_selected(|mailbox| {
            for message in mailbox.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                for flag in flags {
                    let present = message.has_flag(flag);
                    if add && !present {
                        message.flags.push(flag.to_string());
                    } else if !add {
                        message.flags.retain(|f| !f.eq_ignore_ascii_case(flag));
                    }
                }
            }
            Ok(())
        })
    }

    async fn uid_move(&mut self, uids: &[u32], target: &str) -> Result<()> {
        self.begin("UID MOVE").await;
        let selected = self
            .selected
            .clone()
            .ok_or_else(|| ProviderError::InvalidRequest("no mailbox selected".into()))?;
        let mut state = self.server.state.lock().unwrap();
        if state.no_move {
            state.commands.push("UID COPY".into());
        }
        if !state.mailboxes.contains_key(target) {
            return Err(ProviderError::InvalidRequest(format!(
                "UID MOVE rejected: [TRYCREATE] no mailbox {target}"
            )));
        }
        let moved: Vec<StoredMessage> = match state.mailboxes.get_mut(&selected) {
            Some(source) => {
                let (moved, kept) = source
                    .messages
                    .drain(..)
                    .partition(|m| uids.contains(&m.uid));
                source.messages = kept;
                moved
            }
            None => Vec::new(),
        };
        if let Some(dest) = state.mailboxes.get_mut(target) {
            for message in moved {
                let flags = message
                    .flags
                    .into_iter()
                    .filter(|f| !f.eq_ignore_ascii_case(DELETED))
                    .collect();
                dest.push(flags, message.source);
            }
        }
        Ok(())
    }

    async fn uid_expunge(&mut self, uids: &[u32]) -> Result<()> {
        self.begin("UID EXPUNGE").await;
        self.with_selected(|mailbox| {
            mailbox
                .messages
                .retain(|m| !(uids.contains(&m.uid) && m.has_flag(DELETED)));
            Ok(())
        })
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<()> {
        self.begin("CREATE").await;
        let mut state = self.server.state.lock().unwrap();
        if state.mailboxes.contains_key(name) {
            return Err(ProviderError::InvalidRequest(format!(
                "CREATE rejected: mailbox {name} exists"
            )));
        }
        state.mailboxes.insert(name.to_string(), FakeMailbox::new());
        state.order.push(name.to_string());
        Ok(())
    }

    async fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<()> {
        self.begin("RENAME").await;
        let mut state = self.server.state.lock().unwrap();
        let mailbox = state.mailboxes.remove(from).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("RENAME rejected: no mailbox {from}"))
        })?;
        state.mailboxes.insert(to.to_string(), mailbox);
        for name in state.order.iter_mut().filter(|n| n.as_str() == from) {
            *name = to.to_string();
        }
        Ok(())
    }

    async fn delete_mailbox(&mut self, name: &str) -> Result<()> {
        self.begin("DELETE").await;
        let mut state = self.server.state.lock().unwrap();
        state.mailboxes.remove(name).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("DELETE rejected: no mailbox {name}"))
        })?;
        state.order.retain(|n| n != name);
        Ok(())
    }

    async fn append(&mut self, mailbox: &str, flags: &[&str], content: &[u8]) -> Result<()> {
        self.begin("APPEND").await;
        let mut state = self.server.state.lock().unwrap();
        let target = state.mailboxes.get_mut(mailbox).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("APPEND rejected: [TRYCREATE] {mailbox}"))
        })?;
        target.push(flags.iter().map(|f| f.to_string()).collect(), content.to_vec());
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.begin("LOGOUT").await;
        self.server.state.lock().unwrap().logouts += 1;
        Ok(())
    }
}

/// Captures submitted messages instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    reject: Mutex<Option<String>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect()
    }

    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, message: lettre::Message) -> Result<()> {
        if let Some(reason) = self.reject.lock().unwrap().clone() {
            return Err(ProviderError::SendFailure(reason));
        }
        self.sent.lock().unwrap().push(message.formatted());
        Ok(())
    }
}
