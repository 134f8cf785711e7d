//! OpsStore: connection pool and embedded schema for the operations database.

use crate::OpsError;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Timestamp format used everywhere in the operations database.
///
/// Matches SQLite's `datetime('now')` output so Rust-generated stamps and
/// SQL-generated stamps compare correctly as text.
const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a UTC instant as an operations-database timestamp.
pub fn stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Current UTC time as an operations-database timestamp.
pub fn now_stamp() -> String {
    stamp(Utc::now())
}

/// Parse an operations-database timestamp. Accepts RFC 3339 as a fallback for
/// values written by external tooling.
pub fn parse_stamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, STAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Wraps a dedicated SQLite connection pool for the operations database.
///
/// One writer, one reader. The executors that actually run tasks share this
/// database, so writes keep WAL mode and a generous busy timeout to ride out
/// their bursts.
pub struct OpsStore {
    pool: SqlitePool,
}

impl OpsStore {
    /// Connect to (or create) the operations database at the given path.
    ///
    /// Runs embedded migrations, enables WAL mode, and configures a small
    /// pool.
    pub async fn connect(path: &Path) -> Result<Arc<Self>, OpsError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| OpsError::Engine(format!("invalid db path: {error}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// Run the embedded operations schema. Raw SQL rather than sqlx::migrate!
    /// because the executors open this file too and both sides must tolerate
    /// either having created it first.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), OpsError> {
        sqlx::raw_sql(SCHEMA_V1).execute(pool).await?;
        Ok(())
    }

    /// Expose pool for sub-modules that need direct query access.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a key-value pair to the ops_state table (upsert).
    pub async fn set_state(&self, key: &str, value: impl Into<String>) -> Result<(), OpsError> {
        let value = value.into();
        sqlx::query(
            "INSERT INTO ops_state (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a value from the ops_state table.
    pub async fn get_state(&self, key: &str) -> Result<Option<String>, OpsError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM ops_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Remove a key from the ops_state table.
    pub async fn clear_state(&self, key: &str) -> Result<(), OpsError> {
        sqlx::query("DELETE FROM ops_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append an operations event to the audit trail.
    pub async fn log_event(
        &self,
        event_type: &str,
        summary: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), OpsError> {
        let id = uuid::Uuid::new_v4().to_string();
        let details_json = details.map(|d| d.to_string());
        sqlx::query(
            "INSERT INTO events (id, event_type, summary, details, created_at) VALUES (?, ?, ?, ?, datetime('now'))",
        )
        .bind(&id)
        .bind(event_type)
        .bind(summary)
        .bind(&details_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent audit events, optionally filtered by type.
    pub async fn recent_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<OpsEvent>, OpsError> {
        let rows: Vec<OpsEvent> = match event_type {
            Some(event_type) => {
                sqlx::query_as(
                    "SELECT id, event_type, summary, details, created_at FROM events
                     WHERE event_type = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(event_type)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, event_type, summary, details, created_at FROM events
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}

impl std::fmt::Debug for OpsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsStore").finish_non_exhaustive()
    }
}

/// A row from the events audit trail.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpsEvent {
    pub id: String,
    pub event_type: String,
    pub summary: String,
    pub details: Option<String>,
    pub created_at: String,
}

impl OpsEvent {
    /// Parse the details column as JSON, if present and well-formed.
    pub fn details_json(&self) -> Option<serde_json::Value> {
        self.details
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Embedded schema for the operations database v1.
///
/// All statements use `IF NOT EXISTS` so re-running is safe. Later versions
/// add tables via additional migration constants (SCHEMA_V2, etc.).
const SCHEMA_V1: &str = r#"
-- Work items owned by the dispatcher
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    task_type TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    priority TEXT NOT NULL DEFAULT 'P1',
    retry_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}',
    next_run_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks(status, next_run_at);

-- Initiatives (multi-phase projects driven by the orchestrator)
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_type TEXT NOT NULL DEFAULT 'initiative',
    description TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    current_phase TEXT,
    execution_mode TEXT NOT NULL DEFAULT 'autonomous',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);

-- Task executions (one row per attempt, heartbeated by the executor)
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    reason TEXT,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    heartbeat_at TEXT NOT NULL DEFAULT (datetime('now')),
    ended_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, heartbeat_at);
CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id, started_at);

-- Deduplicated failure fingerprints
CREATE TABLE IF NOT EXISTS failure_signatures (
    signature TEXT PRIMARY KEY,
    layer TEXT NOT NULL,
    step TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_seen_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Learned remediation policies keyed by failure signature
CREATE TABLE IF NOT EXISTS absorption_policies (
    policy_id TEXT PRIMARY KEY,
    signature TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'probation',
    policy_type TEXT NOT NULL DEFAULT 'absorption',
    policy_json TEXT NOT NULL,
    risk_level TEXT NOT NULL DEFAULT 'low',
    created_by TEXT NOT NULL,
    disabled_reason TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_policies_signature ON absorption_policies(signature, status);
CREATE INDEX IF NOT EXISTS idx_policies_status ON absorption_policies(status, created_at);

-- Append-only record of every policy decision
CREATE TABLE IF NOT EXISTS policy_evaluations (
    id TEXT PRIMARY KEY,
    policy_id TEXT NOT NULL,
    run_id TEXT,
    signature TEXT NOT NULL,
    mode TEXT NOT NULL,
    decision TEXT NOT NULL,
    verification_result TEXT NOT NULL DEFAULT 'unknown',
    latency_ms INTEGER NOT NULL DEFAULT 0,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_evaluations_policy ON policy_evaluations(policy_id, created_at);
CREATE INDEX IF NOT EXISTS idx_evaluations_mode ON policy_evaluations(mode, created_at);
CREATE INDEX IF NOT EXISTS idx_evaluations_unverified ON policy_evaluations(verification_result);

-- Operations events log (audit trail)
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, created_at);

-- Operations engine state (KV for pauses/heartbeats/cursors)
CREATE TABLE IF NOT EXISTS ops_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
