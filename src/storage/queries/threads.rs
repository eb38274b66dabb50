//! Thread cache rows.
//!
//! A row is a projection of the latest message of a thread, rebuilt from the
//! provider whenever the thread is synchronized. It is never edited in place.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, ConnectionId, LabelId, ProviderKind, Thread, ThreadId};
use crate::storage::database::{Database, Result};

const COLUMNS: &str = "connection_id, thread_id, provider_id, latest_sender, latest_sender_name, \
     latest_received_on, latest_subject, latest_label_ids, created_at, updated_at";

/// Cached summary of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRow {
    pub connection_id: ConnectionId,
    pub thread_id: ThreadId,
    pub provider: ProviderKind,
    pub latest_sender: Address,
    pub latest_subject: Option<String>,
    pub latest_received_on: DateTime<Utc>,
    pub latest_label_ids: Vec<LabelId>,
    /// Set on first insert and kept across upserts.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRow {
    /// Projects a thread, or `None` when it has no latest message.
    pub fn from_thread(connection_id: &ConnectionId, provider: ProviderKind, thread: &Thread) -> Option<Self> {
        let latest = thread.latest.as_ref()?;
        let now = Utc::now();
        Some(Self {
            connection_id: connection_id.clone(),
            thread_id: thread.id.clone(),
            provider,
            latest_sender: latest.from.clone(),
            latest_subject: latest.subject.clone(),
            latest_received_on: latest.received_on,
            latest_label_ids: latest.label_ids.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Primary key of this row.
    pub fn key(&self) -> String {
        row_key(&self.connection_id, &self.thread_id)
    }
}

/// Primary key for a thread: `"{connection_id}/{thread_id}"`.
pub fn row_key(connection_id: &ConnectionId, thread_id: &ThreadId) -> String {
    format!("{}/{}", connection_id, thread_id)
}

/// Filters for [`list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadQuery {
    pub connection_id: ConnectionId,
    /// Only rows whose latest message carries this label.
    pub label: Option<String>,
    /// Case-insensitive substring of subject, sender address or sender name.
    pub search: Option<String>,
    /// `0` means no limit.
    pub limit: u32,
    pub offset: u32,
}

impl ThreadQuery {
    pub fn for_connection(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..Self::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Inserts the row or replaces an existing one with the same key.
///
/// `created_at` of an existing row survives the replace.
pub async fn upsert(db: &Database, row: &ThreadRow) -> Result<()> {
    let row = row.clone();

    db.with_conn(move |conn| {
        let labels = serde_json::to_string(&row.latest_label_ids)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        conn.execute(
            r#"
            INSERT INTO threads (
                id, connection_id, thread_id, provider_id, latest_sender, latest_sender_name,
                latest_received_on, latest_subject, latest_label_ids, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                provider_id = excluded.provider_id,
                latest_sender = excluded.latest_sender,
                latest_sender_name = excluded.latest_sender_name,
                latest_received_on = excluded.latest_received_on,
                latest_subject = excluded.latest_subject,
                latest_label_ids = excluded.latest_label_ids,
                updated_at = excluded.updated_at
            "#,
            params![
                row.key(),
                row.connection_id.as_str(),
                row.thread_id.as_str(),
                row.provider.as_str(),
                row.latest_sender.email,
                row.latest_sender.name,
                timestamp(&row.latest_received_on),
                row.latest_subject,
                labels,
                timestamp(&row.created_at),
                timestamp(&row.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Fetches one row.
pub async fn get(db: &Database, connection_id: &ConnectionId, thread_id: &ThreadId) -> Result<Option<ThreadRow>> {
    let key = row_key(connection_id, thread_id);

    db.with_conn(move |conn| {
        let sql = format!("SELECT {COLUMNS} FROM threads WHERE id = ?1");
        Ok(conn.query_row(&sql, [&key], row_to_thread).optional()?)
    })
    .await
}

/// Rows of one connection, newest first.
pub async fn list(db: &Database, query: &ThreadQuery) -> Result<Vec<ThreadRow>> {
    let query = query.clone();

    db.with_conn(move |conn| {
        let label = query.label.as_ref().map(|l| format!("%\"{}\"%", escape_like(l)));
        let search = query
            .search
            .as_ref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));
        let limit = if query.limit == 0 { -1 } else { i64::from(query.limit) };

        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM threads
            WHERE connection_id = ?1
              AND (?2 IS NULL OR latest_label_ids LIKE ?2 ESCAPE '\')
              AND (?3 IS NULL
                   OR latest_subject LIKE ?3 ESCAPE '\'
                   OR latest_sender LIKE ?3 ESCAPE '\'
                   OR latest_sender_name LIKE ?3 ESCAPE '\')
            ORDER BY latest_received_on DESC, thread_id
            LIMIT ?4 OFFSET ?5
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![query.connection_id.as_str(), label, search, limit, query.offset],
            row_to_thread,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Number of cached threads for a connection.
pub async fn count(db: &Database, connection_id: &ConnectionId) -> Result<u32> {
    let connection_id = connection_id.clone();

    db.with_conn(move |conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE connection_id = ?1",
            [connection_id.as_str()],
            |row| row.get(0),
        )?)
    })
    .await
}

/// Removes a row. Returns whether one existed.
pub async fn delete(db: &Database, connection_id: &ConnectionId, thread_id: &ThreadId) -> Result<bool> {
    let key = row_key(connection_id, thread_id);

    db.with_conn(move |conn| {
        let removed = conn.execute("DELETE FROM threads WHERE id = ?1", [&key])?;
        Ok(removed > 0)
    })
    .await
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn parse_time(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<ThreadRow> {
    let provider: String = row.get(2)?;
    let labels: String = row.get(7)?;

    Ok(ThreadRow {
        connection_id: ConnectionId(row.get(0)?),
        thread_id: ThreadId(row.get(1)?),
        provider: ProviderKind::from_str(&provider).map_err(|e| conversion_error(2, e))?,
        latest_sender: Address {
            email: row.get(3)?,
            name: row.get(4)?,
        },
        latest_received_on: parse_time(row, 5)?,
        latest_subject: row.get(6)?,
        latest_label_ids: serde_json::from_str(&labels).map_err(|e| conversion_error(7, e))?,
        created_at: parse_time(row, 8)?,
        updated_at: parse_time(row, 9)?,
    })
}
