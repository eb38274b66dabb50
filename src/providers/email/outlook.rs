//! Microsoft Graph driver placeholder.
//!
//! The provider id is registered so configurations naming it resolve, but
//! every operation fails with [`ProviderError::NotImplemented`] through the
//! error envelope.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::envelope::{ErrorEnvelope, SessionTeardown};
use super::traits::{
    Draft, DraftPage, DraftRequest, EmailAlias, HistoryPage, LabelChange, ListParams, MailManager,
    OutgoingMessage, SentMessage, ThreadPage, UserInfo,
};
use super::{ProviderError, Result};
use crate::domain::{
    AttachmentData, Connection, ConnectionId, Label, LabelCount, LabelSpec, ProviderKind, Thread,
};

/// Stub driver for Outlook / Microsoft 365 mailboxes.
pub struct OutlookProvider {
    connection: Connection,
    envelope: ErrorEnvelope,
}

impl OutlookProvider {
    pub fn new(connection: Connection, teardown: Arc<dyn SessionTeardown>) -> Self {
        let envelope = ErrorEnvelope::new(connection.id.clone(), teardown);
        Self {
            connection,
            envelope,
        }
    }

    async fn unavailable<T>(&self, operation: &'static str) -> Result<T> {
        self.envelope
            .run(operation, json!({ "provider": "microsoft" }), async {
                Err(ProviderError::not_implemented(operation))
            })
            .await
    }
}

impl std::fmt::Debug for OutlookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlookProvider")
            .field("connection_id", &self.connection.id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MailManager for OutlookProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Microsoft
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    async fn list(&self, _params: ListParams) -> Result<ThreadPage> {
        self.unavailable("list").await
    }

    async fn get(&self, _id: &str) -> Result<Thread> {
        self.unavailable("get").await
    }

    async fn create(&self, _message: &OutgoingMessage) -> Result<SentMessage> {
        self.unavailable("create").await
    }

    async fn delete(&self, _ids: &[String]) -> Result<()> {
        self.unavailable("delete").await
    }

    async fn modify_labels(&self, _ids: &[String], _change: &LabelChange) -> Result<()> {
        self.unavailable("modify_labels").await
    }

    async fn mark_as_read(&self, _ids: &[String]) -> Result<()> {
        self.unavailable("mark_as_read").await
    }

    async fn mark_as_unread(&self, _ids: &[String]) -> Result<()> {
        self.unavailable("mark_as_unread").await
    }

    async fn create_label(&self, _label: &LabelSpec) -> Result<Label> {
        self.unavailable("create_label").await
    }

    async fn update_label(&self, _id: &str, _label: &LabelSpec) -> Result<Label> {
        self.unavailable("update_label").await
    }

    async fn delete_label(&self, _id: &str) -> Result<()> {
        self.unavailable("delete_label").await
    }

    async fn get_label(&self, _id: &str) -> Result<Label> {
        self.unavailable("get_label").await
    }

    async fn get_user_labels(&self) -> Result<Vec<Label>> {
        self.unavailable("get_user_labels").await
    }

    async fn create_draft(&self, _draft: &DraftRequest) -> Result<Draft> {
        self.unavailable("create_draft").await
    }

    async fn get_draft(&self, _id: &str) -> Result<Draft> {
        self.unavailable("get_draft").await
    }

    async fn list_drafts(&self, _max_results: u32, _page_token: Option<String>) -> Result<DraftPage> {
        self.unavailable("list_drafts").await
    }

    async fn send_draft(&self, _id: &str) -> Result<SentMessage> {
        self.unavailable("send_draft").await
    }

    async fn get_attachment(&self, _message_id: &str, _attachment_id: &str) -> Result<AttachmentData> {
        self.unavailable("get_attachment").await
    }

    async fn count(&self) -> Result<Vec<LabelCount>> {
        self.unavailable("count").await
    }

    async fn get_email_aliases(&self) -> Result<Vec<EmailAlias>> {
        self.unavailable("get_email_aliases").await
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        self.unavailable("get_user_info").await
    }

    async fn list_history(&self, _history_id: &str) -> Result<HistoryPage> {
        self.unavailable("list_history").await
    }

    async fn revoke_refresh_token(&self) -> Result<bool> {
        self.unavailable("revoke_refresh_token").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuthConfig;
    use crate::providers::email::envelope::MockSessionTeardown;
    use crate::providers::email::ErrorCode;

    #[tokio::test]
    async fn every_operation_is_not_implemented() {
        let mut teardown = MockSessionTeardown::new();
        teardown.expect_sign_out().never();
        teardown.expect_delete_connection().never();

        let provider = OutlookProvider::new(
            Connection {
                id: ConnectionId::from("conn-ms"),
                provider: ProviderKind::Microsoft,
                auth: AuthConfig::default(),
            },
            Arc::new(teardown),
        );

        let err = provider.list(ListParams::folder("inbox")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotImplemented);
        assert!(err.to_string().contains("list"));

        let err = provider.get_user_labels().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotImplemented);

        assert!(provider.revoke_refresh_token().await.is_err());
        assert_eq!(provider.provider(), ProviderKind::Microsoft);
        assert!(provider.close().await.is_ok());
    }
}
