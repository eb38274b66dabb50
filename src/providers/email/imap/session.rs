//! IMAP session lifecycle: connecting, per-command deadlines and reconnects.
//!
//! [`ImapConnection`] owns at most one authenticated session. The session is
//! opened on first use, every command on it runs under the command timeout,
//! and a session that timed out or lost its transport is dropped so the next
//! operation reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::ops::{
    AsyncImapSession, FetchedMessage, ImapOps, MailboxInfo, MailboxStatus, SearchCriteria,
    SelectedMailbox,
};
use crate::domain::AuthConfig;
use crate::providers::email::envelope::ProtocolSession;
use crate::providers::email::{ProviderError, Result};

/// Opens authenticated IMAP sessions.
#[async_trait]
pub trait ImapConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ImapOps>>;
}

/// Connects over TCP, with implicit TLS when configured, and logs in.
#[derive(Clone)]
pub struct NetworkConnector {
    host: String,
    port: u16,
    secure: bool,
    username: String,
    password: String,
    connect_timeout: Duration,
}

impl NetworkConnector {
    /// Builds a connector from connection credentials.
    ///
    /// The login is the mailbox address, or the user id when no address is
    /// set; the access token is the password.
    pub fn from_auth(auth: &AuthConfig, connect_timeout: Duration) -> Result<Self> {
        let host = auth
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProviderError::InvalidRequest("IMAP host is not configured".into()))?;
        let username = if auth.email.is_empty() {
            auth.user_id.clone()
        } else {
            auth.email.clone()
        };

        Ok(Self {
            host,
            port: auth.imap_port(),
            secure: auth.imap_secure(),
            username,
            password: auth.access_token.clone(),
            connect_timeout,
        })
    }

    async fn open(&self) -> Result<Box<dyn ImapOps>> {
        let tcp_stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ProviderError::Connection(format!("TCP connect failed: {e}")))?;

        if !self.secure {
            let client = async_imap::Client::new(tcp_stream.compat());
            let session = client
                .login(&self.username, &self.password)
                .await
                .map_err(|(e, _)| ProviderError::Authentication(format!("IMAP login failed: {e}")))?;
            return Ok(Box::new(AsyncImapSession::new(session)));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ProviderError::Connection(format!("invalid server name: {e}")))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ProviderError::Connection(format!("TLS handshake failed: {e}")))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = client
            .login(&self.username, &self.password)
            .await
            .map_err(|(e, _)| ProviderError::Authentication(format!("IMAP login failed: {e}")))?;
        Ok(Box::new(AsyncImapSession::new(session)))
    }
}

impl std::fmt::Debug for NetworkConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ImapConnector for NetworkConnector {
    async fn connect(&self) -> Result<Box<dyn ImapOps>> {
        tracing::debug!(host = %self.host, port = self.port, secure = self.secure, "opening IMAP session");
        match tokio::time::timeout(self.connect_timeout, self.open()).await {
            Ok(session) => session,
            Err(_) => Err(ProviderError::Timeout(format!(
                "IMAP connect to {}:{} exceeded {}s",
                self.host,
                self.port,
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

async fn timed<T, F>(limit: Duration, command: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{command} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

/// A session whose commands each run under a deadline.
///
/// A timeout or transport failure marks the session broken; it must not be
/// reused because the server may still be answering the abandoned command.
pub struct TimedSession {
    inner: Box<dyn ImapOps>,
    timeout: Duration,
    broken: bool,
}

impl TimedSession {
    pub fn new(inner: Box<dyn ImapOps>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            broken: false,
        }
    }

    /// Whether a previous command left the session unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ProviderError::Timeout(_) | ProviderError::Connection(_)) = &result {
            self.broken = true;
        }
        result
    }
}

#[async_trait]
impl ImapOps for TimedSession {
    async fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>> {
        let result = timed(self.timeout, "LIST", self.inner.list_mailboxes()).await;
        self.observe(result)
    }

    async fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox> {
        let result = timed(self.timeout, "SELECT", self.inner.select(mailbox)).await;
        self.observe(result)
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let result = timed(self.timeout, "STATUS", self.inner.status(mailbox)).await;
        self.observe(result)
    }

    async fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let result = timed(self.timeout, "UID SEARCH", self.inner.uid_search(criteria)).await;
        self.observe(result)
    }

    async fn fetch_headers(&mut self, start: u32, end: u32) -> Result<Vec<FetchedMessage>> {
        let result = timed(self.timeout, "FETCH", self.inner.fetch_headers(start, end)).await;
        self.observe(result)
    }

    async fn uid_fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        let result = timed(self.timeout, "UID FETCH", self.inner.uid_fetch_headers(uids)).await;
        self.observe(result)
    }

    async fn uid_fetch_full(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        let result = timed(self.timeout, "UID FETCH", self.inner.uid_fetch_full(uids)).await;
        self.observe(result)
    }

    async fn uid_store_flags(&mut self, uids: &[u32], flags: &[&str], add: bool) -> Result<()> {
        let result = timed(
            self.timeout,
            "UID STORE",
            self.inner.uid_store_flags(uids, flags, add),
        )
        .await;
        self.observe(result)
    }

    async fn uid_move(&mut self, uids: &[u32], target: &str) -> Result<()> {
        let result = timed(self.timeout, "UID MOVE", self.inner.uid_move(uids, target)).await;
        self.observe(result)
    }

    async fn uid_expunge(&mut self, uids: &[u32]) -> Result<()> {
        let result = timed(self.timeout, "UID EXPUNGE", self.inner.uid_expunge(uids)).await;
        self.observe(result)
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<()> {
        let result = timed(self.timeout, "CREATE", self.inner.create_mailbox(name)).await;
        self.observe(result)
    }

    async fn rename_mailbox(&mut self, from: &str, to: &str) -> Result<()> {
        let result = timed(self.timeout, "RENAME", self.inner.rename_mailbox(from, to)).await;
        self.observe(result)
    }

    async fn delete_mailbox(&mut self, name: &str) -> Result<()> {
        let result = timed(self.timeout, "DELETE", self.inner.delete_mailbox(name)).await;
        self.observe(result)
    }

    async fn append(&mut self, mailbox: &str, flags: &[&str], content: &[u8]) -> Result<()> {
        let result = timed(
            self.timeout,
            "APPEND",
            self.inner.append(mailbox, flags, content),
        )
        .await;
        self.observe(result)
    }

    async fn logout(&mut self) -> Result<()> {
        let result = timed(self.timeout, "LOGOUT", self.inner.logout()).await;
        self.observe(result)
    }
}

/// Lazily connected, self-healing IMAP session holder.
pub struct ImapConnection {
    connector: Arc<dyn ImapConnector>,
    session: Mutex<Option<TimedSession>>,
    command_timeout: Duration,
}

impl ImapConnection {
    pub fn new(connector: Arc<dyn ImapConnector>, command_timeout: Duration) -> Self {
        Self {
            connector,
            session: Mutex::new(None),
            command_timeout,
        }
    }

    /// Locks the session, connecting first when there is none or the last
    /// one broke.
    ///
    /// The guard serializes every command sequence on this connection.
    pub async fn session(&self) -> Result<MappedMutexGuard<'_, TimedSession>> {
        let mut guard = self.session.lock().await;

        if guard.as_ref().is_some_and(TimedSession::is_broken) {
            tracing::warn!("discarding broken IMAP session");
            *guard = None;
        }

        if guard.is_none() {
            let inner = self.connector.connect().await?;
            tracing::info!("IMAP session established");
            *guard = Some(TimedSession::new(inner, self.command_timeout));
        }

        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| ProviderError::Internal("IMAP session vanished while locked".into()))
    }

    /// Whether a usable session is currently held.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_broken())
    }
}

impl std::fmt::Debug for ImapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnection")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProtocolSession for ImapConnection {
    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(mut session) if !session.is_broken() => {
                tracing::info!("logging out of IMAP session");
                session.logout().await
            }
            _ => Ok(()),
        }
    }
}
