//! Gmail REST driver.
//!
//! Maps the [`MailManager`] operations 1:1 onto Gmail API v1 endpoints.
//! Labels are first-class tags, so label changes are direct `modify` calls
//! and page tokens are passed through untouched.
//!
//! # Authentication
//!
//! Requests carry the connection's OAuth access token. On HTTP 401 the driver
//! exchanges the refresh token for a new access token once and replays the
//! request, provided an OAuth client id and secret are configured. A token
//! endpoint answering `invalid_grant` surfaces as a fatal
//! [`ProviderError::Authentication`], which the error envelope turns into a
//! session teardown.
//!
//! # Endpoints
//!
//! - `users.threads.list` / `users.threads.get` for listing and reading
//! - `users.threads.modify` / `users.threads.trash` for label changes and deletes
//! - `users.messages.send` and `users.drafts.*` for outgoing mail
//! - `users.labels.*` for label lifecycle and counts
//! - `users.history.list` for incremental change feeds

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{OnceCell, RwLock};
use url::Url;

use super::address::{parse_address, parse_address_list};
use super::compose::{build_message, ComposeOptions};
use super::envelope::{ErrorEnvelope, SessionTeardown};
use super::rate_limit::{is_rate_limit, QUOTA_REASONS};
use super::traits::{
    Draft, DraftPage, DraftRequest, EmailAlias, HistoryPage, HistoryRecord, LabelChange,
    ListParams, MailManager, OutgoingMessage, SentMessage, ThreadPage, UserInfo,
};
use super::{ProviderError, Result};
use crate::config::GoogleSettings;
use crate::domain::{
    normalize_message_id, split_message_ids, strip_thread_prefix, system_labels, Address,
    Attachment, AttachmentData, Connection, ConnectionId, Label, LabelColor, LabelCount, LabelId,
    LabelRef, LabelSpec, LabelType, Message, MessageBody, MessageId, ProviderKind, Thread,
    ThreadId, ThreadStub, ThreadingHeaders,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const COUNT_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    #[serde(default)]
    threads: Vec<Value>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    id: String,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    payload: Option<GmailPart>,
    internal_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    size: Option<u64>,
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
    color: Option<GmailLabelColor>,
    messages_total: Option<u32>,
    messages_unread: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabelColor {
    background_color: String,
    text_color: String,
}

#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentResponse {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailDraft {
    id: String,
    message: Option<GmailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftListResponse {
    #[serde(default)]
    drafts: Vec<GmailDraft>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAsResponse {
    #[serde(default)]
    send_as: Vec<GmailSendAs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSendAs {
    send_as_email: String,
    display_name: Option<String>,
    #[serde(default)]
    is_primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<GmailHistory>,
    history_id: Option<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    #[serde(default)]
    messages_added: Vec<HistoryMessage>,
    #[serde(default)]
    messages_deleted: Vec<HistoryMessage>,
    #[serde(default)]
    labels_added: Vec<HistoryLabels>,
    #[serde(default)]
    labels_removed: Vec<HistoryLabels>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryLabels {
    message: MessageRef,
    #[serde(default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Maps a Gmail error response to a [`ProviderError`].
///
/// Understands both the API shape `{"error": {"errors": [{"reason"}], "message"}}`
/// and the OAuth shape `{"error": "invalid_grant", "error_description"}`.
pub fn classify_api_error(status: u16, retry_after_secs: Option<u64>, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let (reason, message) = match error {
        Some(Value::String(code)) => {
            let description = parsed
                .as_ref()
                .and_then(|v| v.get("error_description"))
                .and_then(Value::as_str)
                .unwrap_or(code);
            (Some(code.clone()), format!("{code}: {description}"))
        }
        Some(obj @ Value::Object(_)) => {
            let reason = obj
                .pointer("/errors/0/reason")
                .and_then(Value::as_str)
                .or_else(|| obj.get("status").and_then(Value::as_str))
                .map(str::to_string);
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(body)
                .to_string();
            (reason, message)
        }
        _ => (None, body.to_string()),
    };

    let quota = reason
        .as_deref()
        .is_some_and(|reason| QUOTA_REASONS.contains(&reason));

    match status {
        429 => ProviderError::RateLimited {
            status,
            retry_after_secs,
        },
        403 if quota => ProviderError::RateLimited {
            status,
            retry_after_secs,
        },
        401 => ProviderError::Authentication(message),
        404 => ProviderError::NotFound(message),
        _ => ProviderError::Api {
            status,
            reason,
            message,
        },
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    let body = response.text().await.unwrap_or_default();
    Err(classify_api_error(status.as_u16(), retry_after, &body))
}

async fn json_body<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| ProviderError::Internal(format!("parse response: {e}")))
}

/// Send errors become `SendFailure` unless they are auth or throttling problems.
fn into_send_failure(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Authentication(_) | ProviderError::Timeout(_) => err,
        err if is_rate_limit(&err) => err,
        err => ProviderError::SendFailure(err.to_string()),
    }
}

fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
}

/// Label id a standard folder name lists from. `None` lists everything.
fn folder_label(folder: &str) -> Option<String> {
    match folder.to_ascii_lowercase().as_str() {
        "" | "all" | "archive" => None,
        "inbox" => Some(system_labels::INBOX.to_string()),
        "sent" => Some(system_labels::SENT.to_string()),
        "draft" | "drafts" => Some(system_labels::DRAFT.to_string()),
        "trash" | "bin" => Some(system_labels::TRASH.to_string()),
        "spam" | "junk" => Some(system_labels::SPAM.to_string()),
        "starred" => Some(system_labels::STARRED.to_string()),
        _ => Some(folder.to_string()),
    }
}

#[derive(Default)]
struct BodyParts {
    text: Option<String>,
    html: Option<String>,
    raw: Option<String>,
    attachments: Vec<Attachment>,
}

fn walk_parts(part: &GmailPart, out: &mut BodyParts) {
    let mime = part.mime_type.as_deref().unwrap_or("");
    let filename = part.filename.as_deref().unwrap_or("");

    if let Some(body) = &part.body {
        if let Some(attachment_id) = &body.attachment_id {
            if !filename.is_empty() {
                out.attachments.push(Attachment {
                    id: attachment_id.clone(),
                    filename: filename.to_string(),
                    content_type: mime.to_string(),
                    size_bytes: body.size.unwrap_or(0),
                });
            }
        } else if let Some(data) = &body.data {
            let decoded = decode_base64url(data).map(|b| String::from_utf8_lossy(&b).into_owned());
            match mime {
                "text/html" if out.html.is_none() => {
                    out.html = decoded;
                    out.raw = Some(data.clone());
                }
                "text/plain" | "" if out.text.is_none() => {
                    out.text = decoded;
                    if out.raw.is_none() {
                        out.raw = Some(data.clone());
                    }
                }
                _ => {}
            }
        }
    }

    for child in &part.parts {
        walk_parts(child, out);
    }
}

fn convert_message(msg: &GmailMessage) -> Message {
    let payload = msg.payload.as_ref();
    let header = |name: &str| -> Option<&str> {
        payload.and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    };

    let mut parts = BodyParts::default();
    if let Some(payload) = payload {
        walk_parts(payload, &mut parts);
    }

    let received_on = msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Message {
        id: MessageId::from(msg.id.clone()),
        thread_id: ThreadId::from(msg.thread_id.clone()),
        headers: ThreadingHeaders {
            message_id: header("Message-ID").map(normalize_message_id),
            references: header("References").map(split_message_ids).unwrap_or_default(),
            in_reply_to: header("In-Reply-To").map(normalize_message_id),
        },
        from: header("From").map(parse_address).unwrap_or_else(Address::unknown),
        to: header("To").map(parse_address_list).unwrap_or_default(),
        cc: header("Cc").map(parse_address_list).unwrap_or_default(),
        bcc: header("Bcc").map(parse_address_list).unwrap_or_default(),
        subject: header("Subject").map(str::to_string),
        received_on,
        unread: msg.label_ids.iter().any(|l| l == system_labels::UNREAD),
        is_draft: msg.label_ids.iter().any(|l| l == system_labels::DRAFT),
        snippet: msg.snippet.clone().unwrap_or_default(),
        body: MessageBody {
            raw: parts.raw,
            text: parts.text,
            html: parts.html,
        },
        attachments: parts.attachments,
        label_ids: msg.label_ids.iter().cloned().map(LabelId::from).collect(),
    }
}

fn convert_label(label: GmailLabel) -> Label {
    Label {
        id: LabelId::from(label.id),
        name: label.name,
        label_type: match label.label_type.as_deref() {
            Some("system") => LabelType::System,
            _ => LabelType::User,
        },
        color: label.color.map(|c| LabelColor {
            background_color: c.background_color,
            text_color: c.text_color,
        }),
    }
}

fn label_body(spec: &LabelSpec) -> Value {
    let mut body = json!({
        "name": spec.name,
        "labelListVisibility": "labelShow",
        "messageListVisibility": "show",
    });
    if let Some(color) = &spec.color {
        body["color"] = json!({
            "backgroundColor": color.background_color,
            "textColor": color.text_color,
        });
    }
    body
}

fn convert_draft(draft: GmailDraft) -> Draft {
    let message = draft
        .message
        .filter(|m| m.payload.is_some())
        .map(|m| convert_message(&m));
    Draft {
        id: draft.id,
        message,
    }
}

/// Gmail REST API driver.
pub struct GmailProvider {
    connection: Connection,
    settings: GoogleSettings,
    client: reqwest::Client,
    access_token: RwLock<String>,
    sender: OnceCell<String>,
    labels: RwLock<Option<Vec<Label>>>,
    envelope: ErrorEnvelope,
}

impl GmailProvider {
    /// Creates a driver for one connection.
    pub fn new(
        connection: Connection,
        settings: GoogleSettings,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Internal(format!("http client: {e}")))?;
        let envelope = ErrorEnvelope::new(connection.id.clone(), teardown);

        Ok(Self {
            access_token: RwLock::new(connection.auth.access_token.clone()),
            connection,
            settings,
            client,
            sender: OnceCell::new(),
            labels: RwLock::new(None),
            envelope,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.settings.api_base)
            .map_err(|e| ProviderError::Internal(format!("invalid api base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Internal("api base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn can_refresh(&self) -> bool {
        self.settings.client_id.is_some()
            && self.settings.client_secret.is_some()
            && !self.connection.auth.refresh_token.is_empty()
    }

    async fn refresh_access_token(&self) -> Result<String> {
        let (Some(client_id), Some(client_secret)) =
            (&self.settings.client_id, &self.settings.client_secret)
        else {
            return Err(ProviderError::Authentication(
                "no OAuth client configured for token refresh".to_string(),
            ));
        };

        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", self.connection.auth.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.settings.token_url)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Authentication(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        let token: TokenResponse = json_body(response).await?;
        *self.access_token.write().await = token.access_token.clone();
        tracing::info!(connection_id = %self.connection.id, "access token refreshed");
        Ok(token.access_token)
    }

    /// Sends an authenticated request, refreshing the token once on 401.
    async fn execute<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let token = self.access_token.read().await.clone();
        let response = build(&token).send().await.map_err(transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED && self.can_refresh() {
            tracing::debug!(connection_id = %self.connection.id, "401 from API, refreshing token");
            let token = self.refresh_access_token().await?;
            let response = build(&token).send().await.map_err(transport_error)?;
            return check(response).await;
        }

        check(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .execute(|token| self.client.get(url.clone()).bearer_auth(token).query(query))
            .await?;
        json_body(response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &Value,
    ) -> Result<T> {
        let response = self
            .execute(|token| {
                self.client
                    .request(method.clone(), url.clone())
                    .bearer_auth(token)
                    .json(body)
            })
            .await?;
        json_body(response).await
    }

    async fn send_empty(&self, method: reqwest::Method, url: Url, body: Option<&Value>) -> Result<()> {
        self.execute(|token| {
            let request = self
                .client
                .request(method.clone(), url.clone())
                .bearer_auth(token);
            match body {
                Some(body) => request.json(body),
                None => request,
            }
        })
        .await?;
        Ok(())
    }

    async fn sender(&self) -> Result<Address> {
        if !self.connection.auth.email.is_empty() {
            return Ok(Address::new(self.connection.auth.email.clone()));
        }
        let email = self
            .sender
            .get_or_try_init(|| async {
                let profile: ProfileResponse = self.get_json(self.endpoint(&["profile"])?, &[]).await?;
                Ok::<_, ProviderError>(profile.email_address)
            })
            .await?;
        Ok(Address::new(email.clone()))
    }

    async fn raw_message(&self, message: &OutgoingMessage) -> Result<String> {
        let from = self.sender().await?;
        let options = ComposeOptions {
            message_id: None,
            keep_bcc: true,
        };
        let mime = build_message(&from, message, &options)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(mime.formatted()))
    }

    async fn cached_labels(&self) -> Result<Vec<Label>> {
        if let Some(labels) = self.labels.read().await.as_ref() {
            return Ok(labels.clone());
        }

        let response: LabelsListResponse = self.get_json(self.endpoint(&["labels"])?, &[]).await?;
        let labels: Vec<Label> = response.labels.into_iter().map(convert_label).collect();
        *self.labels.write().await = Some(labels.clone());
        Ok(labels)
    }

    async fn invalidate_labels(&self) {
        *self.labels.write().await = None;
    }

    async fn fetch_thread(&self, id: &str) -> Result<GmailThread> {
        let query = [("format", "full".to_string())];
        match self.get_json(self.endpoint(&["threads", id])?, &query).await {
            Err(ProviderError::NotFound(_)) => {
                // The id may name a message rather than a thread.
                let message: GmailMessage = self
                    .get_json(
                        self.endpoint(&["messages", id])?,
                        &[("format", "minimal".to_string())],
                    )
                    .await
                    .map_err(|e| match e {
                        ProviderError::NotFound(_) => {
                            ProviderError::NotFound(format!("no thread or message {id}"))
                        }
                        other => other,
                    })?;
                tracing::debug!(id, thread_id = %message.thread_id, "resolved message id to thread");
                self.get_json(self.endpoint(&["threads", &message.thread_id])?, &query)
                    .await
            }
            other => other,
        }
    }

    async fn thread_labels(&self, messages: &[Message]) -> Result<Vec<LabelRef>> {
        let known = self.cached_labels().await?;
        let mut seen = HashSet::new();
        Ok(messages
            .iter()
            .flat_map(|m| m.label_ids.iter())
            .filter(|id| seen.insert(id.as_str().to_string()))
            .map(|id| {
                known
                    .iter()
                    .find(|label| &label.id == id)
                    .map(Label::to_ref)
                    .unwrap_or_else(|| LabelRef {
                        id: id.clone(),
                        name: id.as_str().to_string(),
                    })
            })
            .collect())
    }

    async fn list_inner(&self, params: &ListParams) -> Result<ThreadPage> {
        let mut query: Vec<(&str, String)> = vec![("maxResults", params.max_results.to_string())];
        if let Some(label) = folder_label(&params.folder) {
            query.push(("labelIds", label));
        }
        for label in &params.label_ids {
            query.push(("labelIds", label.clone()));
        }
        if let Some(q) = params.query.as_deref().filter(|q| !q.is_empty()) {
            query.push(("q", q.to_string()));
        }
        if let Some(token) = &params.page_token {
            query.push(("pageToken", token.clone()));
        }

        let response: ThreadListResponse =
            self.get_json(self.endpoint(&["threads"])?, &query).await?;

        let mut seen = HashSet::new();
        let threads = response
            .threads
            .into_iter()
            .filter_map(|raw| {
                let id = raw.get("id")?.as_str()?.to_string();
                seen.insert(id.clone()).then(|| ThreadStub {
                    id: ThreadId::from(id),
                    raw: Some(raw),
                })
            })
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: response.next_page_token,
        })
    }

    async fn get_inner(&self, id: &str) -> Result<Thread> {
        let thread = self.fetch_thread(strip_thread_prefix(id)).await?;
        let messages: Vec<Message> = thread.messages.iter().map(convert_message).collect();
        let labels = self.thread_labels(&messages).await?;
        Ok(Thread::from_messages(ThreadId::from(thread.id), messages, labels))
    }

    async fn create_inner(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let raw = self.raw_message(message).await?;
        let mut body = json!({ "raw": raw });
        if let Some(thread_id) = &message.thread_id {
            body["threadId"] = json!(strip_thread_prefix(thread_id.as_str()));
        }

        let sent: SentResponse = self
            .send_json(reqwest::Method::POST, self.endpoint(&["messages", "send"])?, &body)
            .await
            .map_err(into_send_failure)?;

        tracing::info!(connection_id = %self.connection.id, message_id = %sent.id, "message sent");
        Ok(SentMessage {
            id: sent.id,
            thread_id: sent.thread_id.map(ThreadId::from),
        })
    }

    async fn modify_inner(&self, ids: &[String], change: &LabelChange) -> Result<()> {
        let body = json!({
            "addLabelIds": change.add_labels,
            "removeLabelIds": change.remove_labels,
        });
        let requests = self.normalize_ids(ids).into_iter().map(|id| {
            let body = &body;
            async move {
                let url = self.endpoint(&["threads", &id, "modify"])?;
                self.send_empty(reqwest::Method::POST, url, Some(body)).await
            }
        });
        futures::future::try_join_all(requests).await?;
        Ok(())
    }

    async fn delete_inner(&self, ids: &[String]) -> Result<()> {
        let requests = self.normalize_ids(ids).into_iter().map(|id| async move {
            let url = self.endpoint(&["threads", &id, "trash"])?;
            self.send_empty(reqwest::Method::POST, url, None).await
        });
        futures::future::try_join_all(requests).await?;
        Ok(())
    }

    async fn create_draft_inner(&self, request: &DraftRequest) -> Result<Draft> {
        if let Some(existing) = &request.id {
            self.send_empty(
                reqwest::Method::DELETE,
                self.endpoint(&["drafts", existing])?,
                None,
            )
            .await?;
            tracing::debug!(draft_id = %existing, "replaced draft deleted");
        }

        let raw = self.raw_message(&request.message).await?;
        let mut message = json!({ "raw": raw });
        if let Some(thread_id) = &request.message.thread_id {
            message["threadId"] = json!(strip_thread_prefix(thread_id.as_str()));
        }

        let draft: GmailDraft = self
            .send_json(
                reqwest::Method::POST,
                self.endpoint(&["drafts"])?,
                &json!({ "message": message }),
            )
            .await?;
        Ok(convert_draft(draft))
    }

    async fn get_attachment_inner(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentData> {
        let content_url = self.endpoint(&["messages", message_id, "attachments", attachment_id])?;
        let message_url = self.endpoint(&["messages", message_id])?;
        let full = [("format", "full".to_string())];
        let (content, message) = futures::try_join!(
            self.get_json::<AttachmentResponse>(content_url, &[]),
            self.get_json::<GmailMessage>(message_url, &full),
        )?;

        let data = decode_base64url(&content.data)
            .ok_or_else(|| ProviderError::Internal("attachment is not valid base64".to_string()))?;
        let attachment = convert_message(&message)
            .attachments
            .into_iter()
            .find(|a| a.id == attachment_id)
            .unwrap_or_else(|| Attachment {
                id: attachment_id.to_string(),
                filename: attachment_id.to_string(),
                content_type: "application/octet-stream".to_string(),
                size_bytes: data.len() as u64,
            });

        Ok(AttachmentData { attachment, data })
    }

    async fn count_inner(&self) -> Result<Vec<LabelCount>> {
        let labels = self.cached_labels().await?;
        futures::stream::iter(labels)
            .map(|label| async move {
                let details: GmailLabel = self
                    .get_json(self.endpoint(&["labels", label.id.as_str()])?, &[])
                    .await?;
                Ok::<_, ProviderError>(LabelCount {
                    label: label.id,
                    total: details.messages_total.unwrap_or(0),
                    unread: details.messages_unread.unwrap_or(0),
                })
            })
            .buffered(COUNT_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn list_history_inner(&self, history_id: &str) -> Result<HistoryPage> {
        let response: HistoryListResponse = self
            .get_json(
                self.endpoint(&["history"])?,
                &[("startHistoryId", history_id.to_string())],
            )
            .await?;

        let mut records = Vec::new();
        for entry in response.history {
            records.extend(entry.messages_added.into_iter().map(|m| HistoryRecord::MessageAdded {
                message_id: m.message.id,
                thread_id: ThreadId::from(m.message.thread_id),
            }));
            records.extend(entry.messages_deleted.into_iter().map(|m| {
                HistoryRecord::MessageDeleted {
                    message_id: m.message.id,
                    thread_id: ThreadId::from(m.message.thread_id),
                }
            }));
            records.extend(entry.labels_added.into_iter().map(|l| HistoryRecord::LabelsAdded {
                message_id: l.message.id,
                thread_id: ThreadId::from(l.message.thread_id),
                label_ids: l.label_ids,
            }));
            records.extend(entry.labels_removed.into_iter().map(|l| {
                HistoryRecord::LabelsRemoved {
                    message_id: l.message.id,
                    thread_id: ThreadId::from(l.message.thread_id),
                    label_ids: l.label_ids,
                }
            }));
        }

        Ok(HistoryPage {
            records,
            history_id: response.history_id,
            next_page_token: response.next_page_token,
        })
    }

    async fn revoke_inner(&self) -> Result<bool> {
        let token = if self.connection.auth.refresh_token.is_empty() {
            self.access_token.read().await.clone()
        } else {
            self.connection.auth.refresh_token.clone()
        };

        let response = self
            .client
            .post(&self.settings.revoke_url)
            .form(&[("token", token.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let revoked = response.status().is_success();
        if !revoked {
            tracing::warn!(
                connection_id = %self.connection.id,
                status = %response.status(),
                "token revocation rejected"
            );
        }
        Ok(revoked)
    }
}

#[async_trait]
impl MailManager for GmailProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
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
        let context = json!({ "subject": message.subject, "to": message.to.len() });
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
        let context = json!({ "ids": ids, "change": change });
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
            .run("create_label", json!({ "name": label.name }), async {
                let created: GmailLabel = self
                    .send_json(reqwest::Method::POST, self.endpoint(&["labels"])?, &label_body(label))
                    .await?;
                self.invalidate_labels().await;
                Ok(convert_label(created))
            })
            .await
    }

    async fn update_label(&self, id: &str, label: &LabelSpec) -> Result<Label> {
        self.envelope
            .run("update_label", json!({ "id": id, "name": label.name }), async {
                let updated: GmailLabel = self
                    .send_json(
                        reqwest::Method::PATCH,
                        self.endpoint(&["labels", id])?,
                        &label_body(label),
                    )
                    .await?;
                self.invalidate_labels().await;
                Ok(convert_label(updated))
            })
            .await
    }

    async fn delete_label(&self, id: &str) -> Result<()> {
        self.envelope
            .run("delete_label", json!({ "id": id }), async {
                self.send_empty(reqwest::Method::DELETE, self.endpoint(&["labels", id])?, None)
                    .await?;
                self.invalidate_labels().await;
                Ok(())
            })
            .await
    }

    async fn get_label(&self, id: &str) -> Result<Label> {
        self.envelope
            .run("get_label", json!({ "id": id }), async {
                let label: GmailLabel = self.get_json(self.endpoint(&["labels", id])?, &[]).await?;
                Ok(convert_label(label))
            })
            .await
    }

    async fn get_user_labels(&self) -> Result<Vec<Label>> {
        self.envelope
            .run("get_user_labels", json!({}), self.cached_labels())
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
            .run("get_draft", json!({ "id": id }), async {
                let draft: GmailDraft = self
                    .get_json(
                        self.endpoint(&["drafts", id])?,
                        &[("format", "full".to_string())],
                    )
                    .await?;
                Ok(convert_draft(draft))
            })
            .await
    }

    async fn list_drafts(&self, max_results: u32, page_token: Option<String>) -> Result<DraftPage> {
        let context = json!({ "maxResults": max_results, "pageToken": page_token });
        self.envelope
            .run("list_drafts", context, async {
                let mut query = vec![("maxResults", max_results.to_string())];
                if let Some(token) = &page_token {
                    query.push(("pageToken", token.clone()));
                }
                let response: DraftListResponse =
                    self.get_json(self.endpoint(&["drafts"])?, &query).await?;
                Ok(DraftPage {
                    drafts: response.drafts.into_iter().map(convert_draft).collect(),
                    next_page_token: response.next_page_token,
                })
            })
            .await
    }

    async fn send_draft(&self, id: &str) -> Result<SentMessage> {
        self.envelope
            .run("send_draft", json!({ "id": id }), async {
                let sent: SentResponse = self
                    .send_json(
                        reqwest::Method::POST,
                        self.endpoint(&["drafts", "send"])?,
                        &json!({ "id": id }),
                    )
                    .await
                    .map_err(into_send_failure)?;
                Ok(SentMessage {
                    id: sent.id,
                    thread_id: sent.thread_id.map(ThreadId::from),
                })
            })
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
                let response: SendAsResponse = self
                    .get_json(self.endpoint(&["settings", "sendAs"])?, &[])
                    .await?;
                Ok(response
                    .send_as
                    .into_iter()
                    .map(|alias| EmailAlias {
                        email: alias.send_as_email,
                        name: alias.display_name.filter(|n| !n.is_empty()),
                        primary: alias.is_primary,
                    })
                    .collect())
            })
            .await
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        self.envelope
            .run("get_user_info", json!({}), async {
                let url = Url::parse(&self.settings.userinfo_url)
                    .map_err(|e| ProviderError::Internal(format!("invalid userinfo url: {e}")))?;
                let info: UserInfoResponse = self.get_json(url, &[]).await?;
                Ok(UserInfo {
                    address: info.email,
                    name: info.name,
                    photo: info.picture,
                })
            })
            .await
    }

    async fn list_history(&self, history_id: &str) -> Result<HistoryPage> {
        self.envelope
            .run(
                "list_history",
                json!({ "historyId": history_id }),
                self.list_history_inner(history_id),
            )
            .await
    }

    async fn revoke_refresh_token(&self) -> Result<bool> {
        self.envelope
            .run("revoke_refresh_token", json!({}), self.revoke_inner())
            .await
    }
}
