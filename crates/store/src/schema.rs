use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;

/// Every DDL statement is idempotent so startup can run them unconditionally.
const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE(owner_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        app_id TEXT NOT NULL REFERENCES apps(id),
        content TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        state TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT,
        archived_at TEXT,
        deleted_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS memory_categories (
        memory_id TEXT NOT NULL REFERENCES memories(id),
        category_id TEXT NOT NULL REFERENCES categories(id),
        PRIMARY KEY (memory_id, category_id)
    )",
    "CREATE TABLE IF NOT EXISTS attachments (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS memory_status_history (
        id TEXT PRIMARY KEY,
        memory_id TEXT NOT NULL,
        changed_by TEXT NOT NULL,
        old_state TEXT NOT NULL,
        new_state TEXT NOT NULL,
        changed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS memory_access_logs (
        id TEXT PRIMARY KEY,
        memory_id TEXT NOT NULL,
        app_id TEXT NOT NULL,
        access_type TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        accessed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS access_controls (
        id TEXT PRIMARY KEY,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT,
        effect TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_memories_state ON memories(state)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_created ON attachments(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_history_memory ON memory_status_history(memory_id)",
    "CREATE INDEX IF NOT EXISTS idx_access_logs_memory ON memory_access_logs(memory_id)",
    "CREATE INDEX IF NOT EXISTS idx_access_controls_subject ON access_controls(subject_id)",
];

pub(crate) async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings (microsecond
/// precision, `Z` suffix) so that lexicographic comparison in SQL equals
/// chronological comparison.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::bad_request(format!("invalid timestamp {raw:?}: {err}")))
}

pub(crate) fn fmt_unix_seconds(secs: i64) -> String {
    let ts = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(Utc::now);
    fmt_ts(ts)
}

/// Upper bound for an inclusive unix-second range: the last representable
/// instant inside that second.
pub(crate) fn fmt_unix_seconds_end(secs: i64) -> String {
    let ts = DateTime::<Utc>::from_timestamp(secs, 999_999_000).unwrap_or_else(Utc::now);
    fmt_ts(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_timestamps_sort_lexicographically() {
        let early = fmt_unix_seconds(1_700_000_000);
        let late = fmt_unix_seconds(1_700_000_001);
        assert!(early < late);
    }

    #[test]
    fn inclusive_end_bound_covers_the_whole_second() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 500_000_000).unwrap();
        let formatted = fmt_ts(ts);
        assert!(formatted >= fmt_unix_seconds(1_700_000_000));
        assert!(formatted <= fmt_unix_seconds_end(1_700_000_000));
    }

    #[test]
    fn timestamps_round_trip() {
        let now = chrono::Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
