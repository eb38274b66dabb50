//! Integration tests for the sync engine over real storage.
//!
//! These tests wire settings, the driver factory, on-disk storage and the
//! sync service together. Each module carries its own unit tests for the
//! detailed logic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use mailmux::config::{ConnectionSettings, Settings, StorageSettings, SyncSettings};
use mailmux::domain::{
    Address, AttachmentData, AuthConfig, ConnectionId, Label, LabelCount, LabelId, LabelSpec,
    Message, MessageBody, MessageId, ProviderKind, Thread, ThreadId, ThreadStub, ThreadingHeaders,
};
use mailmux::providers::email::{
    create_driver, Draft, DraftPage, DraftRequest, DriverConfig, EmailAlias, ErrorCode,
    HistoryPage, LabelChange, ListParams, MailManager, OutgoingMessage, ProviderError, Result,
    RetryPolicy, SentMessage, ThreadPage, UserInfo,
};
use mailmux::services::{SyncError, SyncService};
use mailmux::storage::{thread_blob_key, StorageLayer, ThreadQuery};

// ============================================================================
// Test driver
// ============================================================================

fn message(id: &str, thread: &str, minute: u32, subject: &str) -> Message {
    Message {
        id: MessageId::from(id),
        thread_id: ThreadId::from(thread),
        headers: ThreadingHeaders {
            message_id: Some(id.to_string()),
            ..ThreadingHeaders::default()
        },
        from: Address::with_name("bob@example.com", "Bob"),
        to: vec![Address::new("me@example.com")],
        cc: vec![],
        bcc: vec![],
        subject: Some(subject.to_string()),
        received_on: Utc.with_ymd_and_hms(2024, 6, 3, 10, minute, 0).unwrap(),
        unread: true,
        is_draft: false,
        snippet: String::new(),
        body: MessageBody::default(),
        attachments: vec![],
        label_ids: vec![LabelId::from("INBOX"), LabelId::from("UNREAD")],
    }
}

/// Serves a handful of inbox threads, two per page.
struct InboxDriver {
    connection_id: ConnectionId,
    threads: Vec<Thread>,
    gets: AtomicU32,
}

impl InboxDriver {
    fn new(connection_id: &str) -> Self {
        let threads = [("t3", 30, "Release notes"), ("t2", 20, "Lunch?"), ("t1", 10, "Welcome")]
            .into_iter()
            .map(|(id, minute, subject)| {
                Thread::from_messages(
                    ThreadId::from(id),
                    vec![message(&format!("{id}-m1"), id, minute, subject)],
                    vec![],
                )
            })
            .collect();
        Self {
            connection_id: ConnectionId::from(connection_id),
            threads,
            gets: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MailManager for InboxDriver {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn list(&self, params: ListParams) -> Result<ThreadPage> {
        let offset = params
            .page_token
            .as_deref()
            .map_or(Ok(0), str::parse::<usize>)
            .map_err(|_| ProviderError::InvalidRequest("bad page token".into()))?;
        let end = (offset + params.max_results as usize).min(self.threads.len());
        Ok(ThreadPage {
            threads: self.threads[offset..end]
                .iter()
                .map(|t| ThreadStub::new(t.id.clone()))
                .collect(),
            next_page_token: (end < self.threads.len()).then(|| end.to_string()),
        })
    }

    async fn get(&self, id: &str) -> Result<Thread> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.threads
            .iter()
            .find(|t| t.id.as_str() == id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn create(&self, _message: &OutgoingMessage) -> Result<SentMessage> {
        Err(ProviderError::not_implemented("create"))
    }

    async fn delete(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn modify_labels(&self, _ids: &[String], _change: &LabelChange) -> Result<()> {
        Ok(())
    }

    async fn mark_as_read(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn mark_as_unread(&self, _ids: &[String]) -> Result<()> {
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

fn sync_settings() -> SyncSettings {
    SyncSettings {
        page_size: 2,
        page_delay_ms: 0,
        ..SyncSettings::default()
    }
}

fn storage_settings(root: &std::path::Path) -> StorageSettings {
    StorageSettings {
        database_path: root.join("cache.db"),
        blob_dir: root.join("blobs"),
    }
}

// ============================================================================
// Sync over on-disk storage
// ============================================================================

#[tokio::test]
async fn synced_threads_survive_reopening_storage() {
    let dir = tempfile::tempdir().unwrap();
    let settings = storage_settings(dir.path());

    {
        let storage = tokio_test::assert_ok!(StorageLayer::open(&settings).await);
        let service = SyncService::new(
            Arc::new(InboxDriver::new("work")),
            storage,
            RetryPolicy::new(2, Duration::from_millis(1)),
            sync_settings(),
        );

        let outcome = tokio_test::assert_ok!(service.sync_threads("inbox").await);
        let report = *outcome.report().unwrap();
        assert_eq!((report.synced, report.pages), (3, 2));
    }

    let blob = thread_blob_key(&ConnectionId::from("work"), &ThreadId::from("t2"));
    assert_eq!(blob, "work/t2.json");
    assert!(settings.blob_dir.join("work").join("t2.json").exists());

    let driver = Arc::new(InboxDriver::new("work"));
    let reopened = StorageLayer::open(&settings).await.unwrap();
    let service = SyncService::new(driver.clone(), reopened, RetryPolicy::default(), sync_settings());

    let rows = service
        .list_cached_threads(ThreadQuery::default().search("lunch"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].thread_id, ThreadId::from("t2"));
    assert_eq!(rows[0].latest_sender.name.as_deref(), Some("Bob"));

    let thread = service.get_thread_from_db("thread:t2").await.unwrap();
    assert_eq!(thread.latest.unwrap().subject.as_deref(), Some("Lunch?"));
    assert_eq!(driver.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connections_do_not_share_cache_rows() {
    let storage = StorageLayer::in_memory().await.unwrap();
    let work = SyncService::new(
        Arc::new(InboxDriver::new("work")),
        storage.clone(),
        RetryPolicy::default(),
        sync_settings(),
    );
    let home = SyncService::new(
        Arc::new(InboxDriver::new("home")),
        storage,
        RetryPolicy::default(),
        sync_settings(),
    );

    work.sync_threads("inbox").await.unwrap();

    assert_eq!(work.list_cached_threads(ThreadQuery::default()).await.unwrap().len(), 3);
    assert!(home.list_cached_threads(ThreadQuery::default()).await.unwrap().is_empty());
    assert!(!home.is_folder_syncing("inbox"));
}

// ============================================================================
// Settings and driver factory
// ============================================================================

#[tokio::test]
async fn settings_file_drives_factory_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    let settings = Settings {
        connection: Some(ConnectionSettings {
            id: "personal".into(),
            provider: "imap".into(),
            auth: AuthConfig {
                email: "me@example.com".into(),
                access_token: "app-password".into(),
                host: Some("imap.example.com".into()),
                ..AuthConfig::default()
            },
        }),
        storage: storage_settings(dir.path()),
        ..Settings::default()
    };
    settings.save(&path).unwrap();

    let loaded = Settings::load(&path).unwrap();
    assert_eq!(loaded, settings);

    let (provider_id, config) = DriverConfig::from_settings(&loaded).unwrap();
    let driver = create_driver(&provider_id, config).unwrap();
    assert_eq!(driver.provider(), ProviderKind::Imap);
    assert_eq!(driver.connection_id().as_str(), "personal");
}

#[tokio::test]
async fn placeholder_provider_fails_sync_with_not_implemented() {
    let auth = AuthConfig {
        email: "me@example.com".into(),
        access_token: "token".into(),
        ..AuthConfig::default()
    };
    let driver = create_driver("outlook", DriverConfig::new("ms", auth)).unwrap();
    let service = SyncService::new(
        driver,
        StorageLayer::in_memory().await.unwrap(),
        RetryPolicy::default(),
        sync_settings(),
    );

    let err = service.sync_threads("inbox").await.unwrap_err();

    match err {
        SyncError::Provider(e) => assert_eq!(e.code(), ErrorCode::NotImplemented),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        service.sync_threads("inbox").await,
        Err(SyncError::Provider(_))
    ));
}

#[test]
fn unknown_provider_is_rejected() {
    let err = create_driver("carrier-pigeon", DriverConfig::new("c", AuthConfig::default()))
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::UnsupportedProvider);
}
