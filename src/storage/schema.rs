//! SQL schema for the thread cache.
//!
//! Migrations are applied in order and tracked through `PRAGMA user_version`,
//! so each statement runs once per database file.

/// Cache projection of one thread per connection.
///
/// `id` is `"{connection_id}/{thread_id}"`.
pub const CREATE_THREADS: &str = r#"
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    latest_sender TEXT NOT NULL,
    latest_sender_name TEXT,
    latest_received_on TEXT NOT NULL,
    latest_subject TEXT,
    latest_label_ids TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Listing is always per connection, newest first.
pub const CREATE_THREAD_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_threads_connection_received
    ON threads(connection_id, latest_received_on DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_connection_thread
    ON threads(connection_id, thread_id)
"#;

/// Returns every migration in application order.
pub fn all_migrations() -> &'static [&'static str] {
    &[CREATE_THREADS, CREATE_THREAD_INDEXES]
}
