//! Thread synchronization engine.
//!
//! The [`SyncService`] keeps the local cache of one connection current. It
//! pages through a folder, fetches every listed thread through the driver and
//! writes it to both cache tiers: the full thread as a blob and its
//! latest-message projection as a row.
//!
//! The cache is a projection of the provider, never the source of truth.
//! Mutations go to the driver first and the affected threads are re-synced
//! afterward.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::guards::{GuardSet, GuardToken};
use crate::config::SyncSettings;
use crate::domain::{
    strip_thread_prefix, system_labels, ConnectionId, Thread, ThreadId, ThreadStub,
};
use crate::providers::email::{
    ErrorCode, LabelChange, ListParams, MailManager, OutgoingMessage, ProviderError, RetryPolicy,
    SentMessage, ThreadPage,
};
use crate::storage::queries::threads;
use crate::storage::{
    thread_blob_key, BlobError, DatabaseError, StorageLayer, ThreadQuery, ThreadRow,
};

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cache database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("thread serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Neither the cache nor one re-sync produced the thread.
    #[error("thread not found: {0}")]
    NotFound(ThreadId),
}

impl SyncError {
    /// True for a local miss or a provider `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Provider(err) => err.code() == ErrorCode::NotFound,
            _ => false,
        }
    }
}

/// Aggregate result of one folder sync.
///
/// Per-thread failures are counted here and logged, never returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Threads written to the cache.
    pub synced: u32,
    /// Threads without a latest message, or already being synced elsewhere.
    pub skipped: u32,
    /// Threads whose fetch or write failed.
    pub failed: u32,
    /// Listing pages fetched.
    pub pages: u32,
}

/// Result of [`SyncService::sync_threads`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another sync of the same folder is running; nothing was done.
    AlreadyInProgress,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AlreadyInProgress => None,
        }
    }
}

/// Result of [`SyncService::sync_thread`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadSyncOutcome {
    /// Written to the cache under the provider's canonical thread id.
    Synced(ThreadId),
    /// The thread has no latest message; the cache was left alone.
    Skipped,
    /// Another call for the same id is outstanding.
    InProgress,
}

#[derive(Debug)]
struct PageCursor {
    token: Option<String>,
    first: bool,
    done: bool,
}

/// Synchronization engine for one connection.
///
/// The folder and thread guard sets are owned by the service, so engines
/// for different connections never see each other's markers.
///
/// # Example
///
/// ```ignore
/// let service = SyncService::new(driver, storage, RetryPolicy::default(), settings.sync);
///
/// if let SyncOutcome::Completed(report) = service.sync_threads("inbox").await? {
///     tracing::info!(synced = report.synced, "inbox cached");
/// }
/// let thread = service.get_thread_from_db("thread:abc").await?;
/// ```
pub struct SyncService {
    driver: Arc<dyn MailManager>,
    storage: StorageLayer,
    retry: RetryPolicy,
    settings: SyncSettings,
    folders_in_sync: GuardSet<String>,
    threads_in_progress: GuardSet<ThreadId>,
}

impl SyncService {
    pub fn new(
        driver: Arc<dyn MailManager>,
        storage: StorageLayer,
        retry: RetryPolicy,
        settings: SyncSettings,
    ) -> Self {
        Self {
            driver,
            storage,
            retry,
            settings,
            folders_in_sync: GuardSet::new(),
            threads_in_progress: GuardSet::new(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.driver.connection_id()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn driver(&self) -> &Arc<dyn MailManager> {
        &self.driver
    }

    fn page_delay(&self) -> Duration {
        Duration::from_millis(self.settings.page_delay_ms)
    }

    /// Pages of a folder listing, fetched lazily with retry.
    ///
    /// Stops after the page without a next token, after the first page when
    /// looping is off, after a listing error, or once `guard` is cleared.
    fn page_stream<'a>(
        &'a self,
        folder: &'a str,
        query: Option<&'a str>,
        guard: Option<&'a GuardToken<'a, String>>,
    ) -> impl Stream<Item = Result<ThreadPage, SyncError>> + 'a {
        let cursor = PageCursor {
            token: None,
            first: true,
            done: false,
        };

        stream::unfold(cursor, move |mut cursor| async move {
            if cursor.done {
                return None;
            }
            if !cursor.first && !self.page_delay().is_zero() {
                tokio::time::sleep(self.page_delay()).await;
            }
            if guard.is_some_and(|g| !g.is_held()) {
                return None;
            }
            cursor.first = false;

            let mut params = ListParams::folder(folder)
                .max_results(self.settings.page_size)
                .page_token(cursor.token.take());
            if let Some(query) = query {
                params = params.query(query);
            }

            match self.retry.run("list", || self.driver.list(params.clone())).await {
                Ok(page) => {
                    cursor.token = page.next_page_token.clone();
                    cursor.done = cursor.token.is_none() || !self.settings.loop_pages;
                    tracing::debug!(
                        folder,
                        threads = page.threads.len(),
                        more = !cursor.done,
                        "listing page fetched"
                    );
                    Some((Ok(page), cursor))
                }
                Err(err) => {
                    cursor.done = true;
                    Some((Err(err.into()), cursor))
                }
            }
        })
    }

    /// Streams the thread stubs of a folder one at a time.
    ///
    /// Only one page is held in memory. Pages after the first are fetched
    /// after the configured page delay.
    pub fn stream_threads<'a>(
        &'a self,
        folder: &'a str,
        query: Option<&'a str>,
    ) -> impl Stream<Item = Result<ThreadStub, SyncError>> + 'a {
        self.page_stream(folder, query, None)
            .map_ok(|page| stream::iter(page.threads.into_iter().map(Ok::<_, SyncError>)))
            .try_flatten()
    }

    /// Syncs every thread listed in `folder` into the cache.
    ///
    /// Returns [`SyncOutcome::AlreadyInProgress`] without doing anything when
    /// the folder is already syncing. Thread failures are logged and counted;
    /// a listing failure that survives the retry policy ends the sync with an
    /// error. The folder marker is released on every exit path.
    pub async fn sync_threads(&self, folder: &str) -> Result<SyncOutcome, SyncError> {
        let key = system_labels::folder_key(folder);
        let Some(guard) = self.folders_in_sync.try_acquire(&key) else {
            tracing::debug!(folder, "folder sync already running");
            return Ok(SyncOutcome::AlreadyInProgress);
        };

        tracing::info!(connection_id = %self.connection_id(), folder, "folder sync started");

        let pages = AtomicU32::new(0);
        let mut report = SyncReport::default();
        {
            let results = self
                .page_stream(folder, None, Some(&guard))
                .inspect_ok(|_| {
                    pages.fetch_add(1, Ordering::Relaxed);
                })
                .map_ok(|page| stream::iter(page.threads.into_iter().map(Ok::<_, SyncError>)))
                .try_flatten()
                .take_while(|_| future::ready(guard.is_held()))
                .map(|item| async move {
                    let stub = item?;
                    let outcome = self.sync_thread(stub.id.as_str()).await;
                    Ok::<_, SyncError>((stub.id, outcome))
                })
                .buffer_unordered(self.settings.thread_concurrency.max(1));
            futures::pin_mut!(results);

            while let Some(result) = results.next().await {
                match result {
                    Ok((_, Ok(ThreadSyncOutcome::Synced(_)))) => report.synced += 1,
                    Ok((_, Ok(_))) => report.skipped += 1,
                    Ok((thread_id, Err(err))) => {
                        report.failed += 1;
                        tracing::warn!(%thread_id, error = %err, "thread sync failed");
                    }
                    Err(err) => {
                        tracing::error!(folder, error = %err, "folder listing failed");
                        return Err(err);
                    }
                }
            }
        }
        report.pages = pages.load(Ordering::Relaxed);

        if !guard.is_held() {
            tracing::info!(folder, "folder sync stopped");
        }
        tracing::info!(
            connection_id = %self.connection_id(),
            folder,
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed,
            pages = report.pages,
            "folder sync finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Fetches one thread and writes it to the cache.
    ///
    /// Concurrent calls for the same id collapse into one provider fetch;
    /// the others return [`ThreadSyncOutcome::InProgress`].
    pub async fn sync_thread(&self, id: &str) -> Result<ThreadSyncOutcome, SyncError> {
        let requested = ThreadId::from(strip_thread_prefix(id));
        let Some(_guard) = self.threads_in_progress.try_acquire(&requested) else {
            tracing::debug!(thread_id = %requested, "thread sync already in progress");
            return Ok(ThreadSyncOutcome::InProgress);
        };

        let thread = self
            .retry
            .run("get", || self.driver.get(requested.as_str()))
            .await?;

        let Some(row) = ThreadRow::from_thread(self.connection_id(), self.driver.provider(), &thread)
        else {
            tracing::debug!(thread_id = %requested, "thread has no latest message, skipping");
            return Ok(ThreadSyncOutcome::Skipped);
        };

        // Blob before row, so a listed row always has its thread.
        let blob = serde_json::to_vec(&thread)?;
        self.storage
            .blobs()
            .put(&thread_blob_key(self.connection_id(), &thread.id), blob)
            .await?;
        threads::upsert(self.storage.db(), &row).await?;

        tracing::debug!(thread_id = %thread.id, messages = thread.messages.len(), "thread cached");
        Ok(ThreadSyncOutcome::Synced(thread.id))
    }

    /// Reads a full thread from the cache, syncing it once on a miss.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] when the thread is still missing after the
    /// single re-sync.
    pub async fn get_thread_from_db(&self, id: &str) -> Result<Thread, SyncError> {
        let mut thread_id = ThreadId::from(strip_thread_prefix(id));
        let mut last_attempt = false;

        loop {
            if let Some(thread) = self.load_cached(&thread_id).await? {
                return Ok(thread);
            }
            if last_attempt {
                return Err(SyncError::NotFound(thread_id));
            }
            last_attempt = true;

            tracing::debug!(%thread_id, "cache miss, syncing thread");
            match self.sync_thread(thread_id.as_str()).await {
                Ok(ThreadSyncOutcome::Synced(canonical)) => thread_id = canonical,
                Ok(_) => {}
                Err(err) if err.is_not_found() => return Err(SyncError::NotFound(thread_id)),
                Err(err) => return Err(err),
            }
        }
    }

    async fn load_cached(&self, thread_id: &ThreadId) -> Result<Option<Thread>, SyncError> {
        let row = threads::get(self.storage.db(), self.connection_id(), thread_id).await?;
        if row.is_none() {
            return Ok(None);
        }

        let key = thread_blob_key(self.connection_id(), thread_id);
        match self.storage.blobs().get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => {
                tracing::warn!(key, "cache row has no blob");
                Ok(None)
            }
        }
    }

    /// Lists cached rows of this connection. The query's connection id is ignored.
    pub async fn list_cached_threads(&self, query: ThreadQuery) -> Result<Vec<ThreadRow>, SyncError> {
        let query = ThreadQuery {
            connection_id: self.connection_id().clone(),
            ..query
        };
        Ok(threads::list(self.storage.db(), &query).await?)
    }

    pub fn is_folder_syncing(&self, folder: &str) -> bool {
        self.folders_in_sync.contains(&system_labels::folder_key(folder))
    }

    pub fn is_thread_syncing(&self, id: &str) -> bool {
        self.threads_in_progress
            .contains(&ThreadId::from(strip_thread_prefix(id)))
    }

    /// Clears the folder marker. A running sync stops before its next page
    /// or thread; calls already on the wire finish.
    pub fn stop_folder_sync(&self, folder: &str) -> bool {
        let cleared = self.folders_in_sync.clear(&system_labels::folder_key(folder));
        if cleared {
            tracing::info!(folder, "folder sync stop requested");
        }
        cleared
    }

    /// Clears a stuck thread marker so the thread can be synced again.
    pub fn clear_thread_guard(&self, id: &str) -> bool {
        self.threads_in_progress
            .clear(&ThreadId::from(strip_thread_prefix(id)))
    }

    pub async fn modify_labels(&self, ids: &[String], change: &LabelChange) -> Result<(), SyncError> {
        let ids = self.driver.normalize_ids(ids);
        self.retry
            .run("modify_labels", || self.driver.modify_labels(&ids, change))
            .await?;
        self.refresh(&ids).await;
        Ok(())
    }

    pub async fn mark_as_read(&self, ids: &[String]) -> Result<(), SyncError> {
        let ids = self.driver.normalize_ids(ids);
        self.retry
            .run("mark_as_read", || self.driver.mark_as_read(&ids))
            .await?;
        self.refresh(&ids).await;
        Ok(())
    }

    pub async fn mark_as_unread(&self, ids: &[String]) -> Result<(), SyncError> {
        let ids = self.driver.normalize_ids(ids);
        self.retry
            .run("mark_as_unread", || self.driver.mark_as_unread(&ids))
            .await?;
        self.refresh(&ids).await;
        Ok(())
    }

    /// Trashes threads. Threads the provider no longer returns are evicted
    /// from the cache on refresh.
    pub async fn delete_threads(&self, ids: &[String]) -> Result<(), SyncError> {
        let ids = self.driver.normalize_ids(ids);
        self.retry
            .run("delete", || self.driver.delete(&ids))
            .await?;
        self.refresh(&ids).await;
        Ok(())
    }

    /// Sends a message, then caches the thread it landed in.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<SentMessage, SyncError> {
        let sent = self
            .retry
            .run("create", || self.driver.create(message))
            .await?;
        if let Some(thread_id) = &sent.thread_id {
            self.refresh(&[thread_id.to_string()]).await;
        }
        Ok(sent)
    }

    async fn refresh(&self, ids: &[String]) {
        if !self.settings.refresh_after_mutation {
            return;
        }
        for id in ids {
            match self.sync_thread(id).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    if let Err(err) = self.evict(&ThreadId::from(id.as_str())).await {
                        tracing::warn!(thread_id = %id, error = %err, "cache eviction failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(thread_id = %id, error = %err, "refresh after mutation failed");
                }
            }
        }
    }

    async fn evict(&self, thread_id: &ThreadId) -> Result<(), SyncError> {
        let removed = threads::delete(self.storage.db(), self.connection_id(), thread_id).await?;
        self.storage
            .blobs()
            .delete(&thread_blob_key(self.connection_id(), thread_id))
            .await?;
        tracing::debug!(%thread_id, removed, "thread evicted from cache");
        Ok(())
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("connection_id", self.connection_id())
            .field("provider", &self.driver.provider())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, LabelId};
    use crate::services::scripted::{empty_thread, thread, thread_with_reply, ScriptedDriver};
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    fn settings(page_size: u32) -> SyncSettings {
        SyncSettings {
            page_size,
            page_delay_ms: 0,
            loop_pages: true,
            thread_concurrency: 4,
            refresh_after_mutation: true,
        }
    }

    async fn service(driver: ScriptedDriver, settings: SyncSettings) -> (SyncService, Arc<ScriptedDriver>) {
        let driver = Arc::new(driver);
        let storage = StorageLayer::in_memory().await.unwrap();
        let service = SyncService::new(
            driver.clone(),
            storage,
            RetryPolicy::new(3, Duration::from_secs(1)),
            settings,
        );
        (service, driver)
    }

    fn five_threads() -> ScriptedDriver {
        ScriptedDriver::new((1..=5).rev().map(|n| thread(&format!("t{n}"), n, &["INBOX"])).collect())
    }

    async fn cached_ids(service: &SyncService) -> Vec<String> {
        service
            .list_cached_threads(ThreadQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.thread_id.0)
            .collect()
    }

    #[tokio::test]
    async fn sync_threads_caches_every_page() {
        let (service, driver) = service(five_threads(), settings(2)).await;

        let outcome = service.sync_threads("inbox").await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Completed(SyncReport {
                synced: 5,
                skipped: 0,
                failed: 0,
                pages: 3,
            })
        );
        assert_eq!(driver.list_calls(), 3);
        assert_eq!(cached_ids(&service).await, vec!["t5", "t4", "t3", "t2", "t1"]);
        assert!(!service.is_folder_syncing("inbox"));
    }

    #[tokio::test]
    async fn non_looping_sync_stops_after_first_page() {
        let mut settings = settings(2);
        settings.loop_pages = false;
        let (service, driver) = service(five_threads(), settings).await;

        let outcome = service.sync_threads("inbox").await.unwrap();

        assert_eq!(outcome.report().unwrap().synced, 2);
        assert_eq!(driver.list_calls(), 1);
    }

    #[tokio::test]
    async fn stream_threads_yields_stubs_in_listing_order() {
        let (service, _) = service(five_threads(), settings(2)).await;

        let ids: Vec<String> = service
            .stream_threads("inbox", None)
            .map_ok(|stub| stub.id.0)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(ids, vec!["t5", "t4", "t3", "t2", "t1"]);
    }

    #[tokio::test]
    async fn threads_without_latest_message_are_skipped() {
        let driver = ScriptedDriver::new(vec![thread("t1", 1, &["INBOX"]), empty_thread("t2")]);
        let (service, _) = service(driver, settings(10)).await;

        let outcome = service.sync_threads("inbox").await.unwrap();

        let report = outcome.report().unwrap();
        assert_eq!((report.synced, report.skipped), (1, 1));
        assert_eq!(cached_ids(&service).await, vec!["t1"]);
    }

    #[tokio::test]
    async fn thread_failures_are_counted_not_returned() {
        let driver = five_threads().failing_on("t3");
        let (service, _) = service(driver, settings(10)).await;

        let outcome = service.sync_threads("inbox").await.unwrap();

        let report = outcome.report().unwrap();
        assert_eq!((report.synced, report.failed), (4, 1));
        assert!(!cached_ids(&service).await.contains(&"t3".to_string()));
    }

    #[tokio::test]
    async fn listing_failure_ends_sync_and_releases_folder() {
        let driver = five_threads().failing_list();
        let (service, _) = service(driver, settings(10)).await;

        let err = service.sync_threads("inbox").await.unwrap_err();

        assert!(matches!(err, SyncError::Provider(_)));
        assert!(!service.is_folder_syncing("inbox"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_folder_sync_is_a_no_op() {
        let driver = five_threads().with_get_delay(Duration::from_millis(100));
        let (service, driver) = service(driver, settings(10)).await;

        let (first, second) = tokio::join!(service.sync_threads("inbox"), service.sync_threads("inbox"));

        assert_eq!(first.unwrap().report().unwrap().synced, 5);
        assert_eq!(second.unwrap(), SyncOutcome::AlreadyInProgress);
        assert_eq!(driver.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn folder_names_differing_in_case_share_one_sync() {
        let driver = five_threads().with_get_delay(Duration::from_millis(100));
        let (service, driver) = service(driver, settings(10)).await;

        let watch = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            (service.is_folder_syncing("Inbox"), service.is_folder_syncing("Projects"))
        };
        let (first, second, seen) = tokio::join!(
            service.sync_threads("inbox"),
            service.sync_threads("INBOX"),
            watch
        );

        assert_eq!(first.unwrap().report().unwrap().synced, 5);
        assert_eq!(second.unwrap(), SyncOutcome::AlreadyInProgress);
        assert_eq!(seen, (true, false));
        assert_eq!(driver.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_thread_syncs_fetch_once() {
        let driver = five_threads().with_get_delay(Duration::from_millis(100));
        let (service, driver) = service(driver, settings(10)).await;

        let outcomes = future::join_all((0..5).map(|_| service.sync_thread("t1"))).await;

        let synced = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ThreadSyncOutcome::Synced(_))))
            .count();
        let in_progress = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ThreadSyncOutcome::InProgress)))
            .count();
        assert_eq!((synced, in_progress), (1, 4));
        assert_eq!(driver.get_calls(), 1);
        assert!(!service.is_thread_syncing("t1"));
    }

    #[tokio::test]
    async fn repeated_sync_keeps_one_identical_row() {
        let (service, _) = service(five_threads(), settings(10)).await;

        service.sync_thread("t2").await.unwrap();
        let first = service.list_cached_threads(ThreadQuery::default()).await.unwrap();
        service.sync_thread("thread:t2").await.unwrap();
        let second = service.list_cached_threads(ThreadQuery::default()).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].created_at, first[0].created_at);
        assert_eq!(second[0].latest_label_ids, first[0].latest_label_ids);
        assert_eq!(second[0].latest_subject, first[0].latest_subject);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_fetch_is_retried_with_fixed_delay() {
        let driver = five_threads().throttled_gets(2);
        let (service, driver) = service(driver, settings(10)).await;
        let started = Instant::now();

        let outcome = service.sync_thread("t1").await.unwrap();

        assert_eq!(outcome, ThreadSyncOutcome::Synced(ThreadId::from("t1")));
        assert_eq!(driver.get_calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_past_the_ceiling_propagates() {
        let driver = five_threads().throttled_gets(u32::MAX);
        let (service, driver) = service(driver, settings(10)).await;
        let started = Instant::now();

        let err = service.sync_thread("t1").await.unwrap_err();

        assert!(matches!(&err, SyncError::Provider(e) if e.code() == ErrorCode::RateLimited));
        assert_eq!(driver.get_calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cold_read_syncs_once_then_serves_from_cache() {
        let (service, driver) = service(five_threads(), settings(10)).await;

        let thread = service.get_thread_from_db("t4").await.unwrap();
        assert_eq!(thread.id.as_str(), "t4");
        assert_eq!(driver.get_calls(), 1);

        let again = service.get_thread_from_db("thread:t4").await.unwrap();
        assert_eq!(again, thread);
        assert_eq!(driver.get_calls(), 1);
    }

    #[tokio::test]
    async fn read_by_reply_id_resolves_to_canonical_thread() {
        let driver = ScriptedDriver::new(vec![thread_with_reply("root@x", "reply@x")]);
        let (service, _) = service(driver, settings(10)).await;

        let thread = service.get_thread_from_db("reply@x").await.unwrap();

        assert_eq!(thread.id.as_str(), "root@x");
        assert_eq!(thread.messages.len(), 2);
    }

    #[tokio::test]
    async fn unknown_thread_fails_after_one_sync() {
        let (service, driver) = service(five_threads(), settings(10)).await;

        let err = service.get_thread_from_db("missing").await.unwrap_err();

        assert!(matches!(err, SyncError::NotFound(ref id) if id.as_str() == "missing"));
        assert_eq!(driver.get_calls(), 1);
    }

    #[tokio::test]
    async fn thread_without_messages_fails_after_one_sync() {
        let driver = ScriptedDriver::new(vec![empty_thread("t-empty")]);
        let (service, driver) = service(driver, settings(10)).await;

        let err = service.get_thread_from_db("t-empty").await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(driver.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_folder_marker_stops_the_sync() {
        let mut settings = settings(1);
        settings.page_delay_ms = 1_000;
        let (service, driver) = service(five_threads(), settings).await;

        let (outcome, stopped) = tokio::join!(service.sync_threads("inbox"), async {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            service.stop_folder_sync("inbox")
        });

        assert!(stopped);
        let report = *outcome.unwrap().report().unwrap();
        assert_eq!((report.synced, report.pages), (2, 2));
        assert_eq!(driver.list_calls(), 2);
        assert!(!service.stop_folder_sync("inbox"));
    }

    #[tokio::test]
    async fn cleared_thread_guard_allows_a_new_sync() {
        let (service, _) = service(five_threads(), settings(10)).await;
        assert!(!service.clear_thread_guard("t1"));

        let guard = service.threads_in_progress.try_acquire(&ThreadId::from("t1"));
        assert!(service.is_thread_syncing("thread:t1"));
        assert_eq!(service.sync_thread("t1").await.unwrap(), ThreadSyncOutcome::InProgress);

        assert!(service.clear_thread_guard("t1"));
        assert!(matches!(
            service.sync_thread("t1").await.unwrap(),
            ThreadSyncOutcome::Synced(_)
        ));
        drop(guard);
    }

    #[tokio::test]
    async fn label_change_goes_to_driver_then_refreshes_row() {
        let (service, driver) = service(five_threads(), settings(10)).await;
        service.sync_threads("inbox").await.unwrap();

        service
            .modify_labels(&["thread:t1".to_string()], &LabelChange::add(["STARRED"]))
            .await
            .unwrap();

        assert_eq!(driver.modified_ids(), vec![vec!["t1".to_string()]]);
        let starred = service
            .list_cached_threads(ThreadQuery::default().label("STARRED"))
            .await
            .unwrap();
        assert_eq!(starred.len(), 1);
        assert!(starred[0].latest_label_ids.contains(&LabelId::from("STARRED")));
    }

    #[tokio::test]
    async fn mutations_leave_cache_alone_when_refresh_is_off() {
        let mut settings = settings(10);
        settings.refresh_after_mutation = false;
        let (service, driver) = service(five_threads(), settings).await;
        service.sync_thread("t1").await.unwrap();

        service
            .modify_labels(&["t1".to_string()], &LabelChange::add(["STARRED"]))
            .await
            .unwrap();

        assert_eq!(driver.modified_ids().len(), 1);
        let rows = service.list_cached_threads(ThreadQuery::default()).await.unwrap();
        assert_eq!(rows[0].latest_label_ids, vec![LabelId::from("INBOX")]);
    }

    #[tokio::test]
    async fn deleted_threads_are_evicted() {
        let (service, _) = service(five_threads(), settings(10)).await;
        service.sync_threads("inbox").await.unwrap();

        service
            .delete_threads(&["t2".to_string(), "t3".to_string()])
            .await
            .unwrap();

        assert_eq!(cached_ids(&service).await, vec!["t5", "t4", "t1"]);
        assert!(service.get_thread_from_db("t2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn sent_message_lands_in_cache() {
        let (service, driver) = service(ScriptedDriver::new(Vec::new()), settings(10)).await;

        let sent = service
            .send(&OutgoingMessage::new(vec![Address::new("a@b.com")], "Hi", "Hello"))
            .await
            .unwrap();

        assert_eq!(driver.sent_subjects(), vec!["Hi".to_string()]);
        let rows = service
            .list_cached_threads(ThreadQuery::default().search("hi"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(Some(&rows[0].thread_id), sent.thread_id.as_ref());
    }

    #[tokio::test]
    async fn read_state_changes_refresh_rows() {
        let (service, _) = service(five_threads(), settings(10)).await;
        service.sync_thread("t1").await.unwrap();

        service.mark_as_unread(&["t1".to_string()]).await.unwrap();
        let unread = service.get_thread_from_db("t1").await.unwrap();
        assert!(unread.has_unread);

        service.mark_as_read(&["t1".to_string()]).await.unwrap();
        let read = service.get_thread_from_db("t1").await.unwrap();
        assert!(!read.has_unread);
    }
}
