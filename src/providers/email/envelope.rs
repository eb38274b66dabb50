//! Standardized error envelope around driver operations.
//!
//! Every driver method runs through [`ErrorEnvelope::run`]. On failure the
//! envelope sanitizes the call context, logs it, tears the session down when
//! the error means the credentials are dead, and returns a uniform
//! [`OperationError`]. Non-fatal errors are returned without side effects so
//! the caller can decide whether to retry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::rate_limit::is_rate_limit;
use super::{ErrorCode, OperationError, ProviderError, Result};
use crate::domain::ConnectionId;

/// Markers that identify credential failures no retry can fix.
pub const FATAL_ERROR_MARKERS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "authenticationfailed",
    "invalid credentials",
];

/// Context keys whose values never reach the logs.
///
/// Keys are compared lowercased with `_` and `-` removed.
pub const REDACTED_KEYS: &[&str] = &[
    "accesstoken",
    "refreshtoken",
    "idtoken",
    "token",
    "password",
    "secret",
    "clientsecret",
    "authorization",
    "code",
    "raw",
    "data",
];

const REDACTED: &str = "[REDACTED]";

/// Returns true when the error means the connection's credentials are unusable.
pub fn is_fatal(err: &ProviderError) -> bool {
    let root = err.root();
    let text = match root {
        ProviderError::Authentication(_) | ProviderError::Api { .. } => root.to_string(),
        _ => return false,
    };
    let text = text.to_ascii_lowercase();
    FATAL_ERROR_MARKERS.iter().any(|marker| text.contains(marker))
}

fn is_redacted_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    REDACTED_KEYS.contains(&normalized.as_str())
}

/// Returns a copy of `context` with sensitive values replaced, at any depth.
pub fn sanitize_context(context: &Value) -> Value {
    match context {
        Value::Object(map) => {
            let sanitized: Map<String, Value> = map
                .iter()
                .map(|(key, value)| {
                    let value = if is_redacted_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        sanitize_context(value)
                    };
                    (key.clone(), value)
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_context).collect()),
        other => other.clone(),
    }
}

/// Application-side teardown run when a connection's credentials die.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    /// Signs the owning user out.
    async fn sign_out(&self, connection_id: &ConnectionId) -> anyhow::Result<()>;

    /// Deletes the stored connection.
    async fn delete_connection(&self, connection_id: &ConnectionId) -> anyhow::Result<()>;
}

/// Teardown that only records what would have happened.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTeardown;

#[async_trait]
impl SessionTeardown for LoggingTeardown {
    async fn sign_out(&self, connection_id: &ConnectionId) -> anyhow::Result<()> {
        tracing::warn!(connection_id = %connection_id, "signing out after fatal error");
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &ConnectionId) -> anyhow::Result<()> {
        tracing::warn!(connection_id = %connection_id, "connection marked for deletion");
        Ok(())
    }
}

/// A live protocol session the envelope can close.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Closes the session. Safe to call when already closed.
    async fn disconnect(&self) -> Result<()>;
}

/// Wraps driver operations with logging, classification and teardown.
pub struct ErrorEnvelope {
    connection_id: ConnectionId,
    teardown: Arc<dyn SessionTeardown>,
    session: Option<Arc<dyn ProtocolSession>>,
}

impl ErrorEnvelope {
    /// Creates an envelope for one connection.
    pub fn new(connection_id: ConnectionId, teardown: Arc<dyn SessionTeardown>) -> Self {
        Self {
            connection_id,
            teardown,
            session: None,
        }
    }

    /// Attaches the protocol session closed during teardown.
    pub fn with_session(mut self, session: Arc<dyn ProtocolSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Connection this envelope guards.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Runs one driver operation.
    pub async fn run<T, Fut>(&self, operation: &'static str, context: Value, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail(operation, &context, err).await),
        }
    }

    async fn fail(&self, operation: &'static str, context: &Value, err: ProviderError) -> ProviderError {
        if matches!(err, ProviderError::Operation(_)) {
            return err;
        }

        let context = sanitize_context(context);
        let fatal = is_fatal(&err);
        let code = if fatal {
            ErrorCode::Unauthorized
        } else {
            err.code()
        };

        if fatal {
            tracing::error!(
                connection_id = %self.connection_id,
                operation,
                code = %code,
                context = %context,
                error = ?err,
                "fatal mail error, tearing down session"
            );
            self.tear_down().await;
        } else if is_rate_limit(&err) {
            tracing::warn!(
                connection_id = %self.connection_id,
                operation,
                code = %code,
                context = %context,
                error = %err,
                "mail operation rate limited"
            );
        } else {
            tracing::error!(
                connection_id = %self.connection_id,
                operation,
                code = %code,
                context = %context,
                error = ?err,
                "mail operation failed"
            );
        }

        OperationError {
            code,
            operation: operation.to_string(),
            context,
            source: err,
        }
        .into()
    }

    /// Signs out, deletes the connection and closes the session concurrently.
    ///
    /// Every step runs even when another fails. Returns true only when all
    /// steps succeeded.
    pub async fn tear_down(&self) -> bool {
        let id = &self.connection_id;
        let disconnect = async {
            match &self.session {
                Some(session) => session.disconnect().await.map_err(anyhow::Error::from),
                None => Ok(()),
            }
        };

        let (sign_out, delete, close) = futures::join!(
            self.teardown.sign_out(id),
            self.teardown.delete_connection(id),
            disconnect
        );

        let mut all_ok = true;
        for (step, result) in [
            ("sign_out", sign_out),
            ("delete_connection", delete),
            ("disconnect", close),
        ] {
            if let Err(e) = result {
                all_ok = false;
                tracing::warn!(connection_id = %id, step, error = %e, "teardown step failed");
            }
        }

        tracing::info!(connection_id = %id, all_ok, "session teardown finished");
        all_ok
    }
}

impl std::fmt::Debug for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorEnvelope")
            .field("connection_id", &self.connection_id)
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}
