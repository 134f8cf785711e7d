//! Task records: the dispatcher's unit of work.
//!
//! Tasks live in the shared `tasks` table. The executors own the happy path
//! (claim, run, complete); this layer only ever moves tasks between statuses
//! with conditional writes so a racing executor always wins.

use crate::classifier::FailureClassification;
use crate::quarantine::QuarantineInfo;
use crate::store::OpsStore;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status and priority
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the orchestrator but held back from dispatch until the
    /// initiative's decomposition is approved.
    Draft,
    Queued,
    InProgress,
    Completed,
    Failed,
    Quarantined,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Quarantined => "quarantined",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Parse a task status from its storage form.
pub fn parse_status(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "draft" => TaskStatus::Draft,
        "queued" => TaskStatus::Queued,
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "quarantined" => TaskStatus::Quarantined,
        "cancelled" => TaskStatus::Cancelled,
        other => bail!("unknown task status: {other}"),
    })
}

/// Dispatch priority. P0 preempts P1 preempts P2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        };
        write!(f, "{s}")
    }
}

/// Parse a priority from its storage form.
pub fn parse_priority(s: &str) -> Result<Priority> {
    Ok(match s {
        "P0" => Priority::P0,
        "P1" => Priority::P1,
        "P2" => Priority::P2,
        other => bail!("unknown priority: {other}"),
    })
}

impl Priority {
    /// Parse the looser vocabulary used by policies and humans.
    pub fn from_keyword(word: &str) -> Option<Priority> {
        match word {
            "P0" | "high" => Some(Priority::P0),
            "P1" | "normal" => Some(Priority::P1),
            "P2" | "low" => Some(Priority::P2),
            _ => None,
        }
    }

    /// One level less urgent. P2 stays P2.
    pub fn lowered(self) -> Priority {
        match self {
            Priority::P0 => Priority::P1,
            Priority::P1 | Priority::P2 => Priority::P2,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Structured error captured by the executor when a run fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetails {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

/// The task's JSON payload column.
///
/// Executors and this layer both write here, so unknown keys are preserved
/// round-trip via the flattened map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_classification: Option<FailureClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_info: Option<QuarantineInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    /// Step the executor last reported, used for failure fingerprinting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Set when classification decides a human has to look at this task.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub needs_human_review: bool,
    /// Review child output: "approved" or "needs_revision".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    /// Verify child output: whether every definition-of-done check passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_dod_passed: Option<bool>,
    /// Executor parameters. Policies with an adjust_params action edit these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Policy id when a skip or kill action absorbed this failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absorbed_by_policy: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskPayload {
    pub fn error_message(&self) -> Option<&str> {
        self.error_details
            .as_ref()
            .map(|details| details.message.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// A task as read from the operations database.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub project_id: Option<String>,
    pub task_type: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub retry_count: i64,
    pub failure_count: i64,
    pub payload: TaskPayload,
    pub next_run_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl Task {
    /// Timestamp at which the task finished, however it finished. Failed
    /// tasks carry no completed_at, so fall back to the last update.
    pub fn finished_at(&self) -> &str {
        self.completed_at.as_deref().unwrap_or(&self.updated_at)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project_id: Option<String>,
    task_type: String,
    title: String,
    description: Option<String>,
    status: String,
    priority: String,
    retry_count: i64,
    failure_count: i64,
    payload: String,
    next_run_at: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let payload: TaskPayload = serde_json::from_str(&self.payload).unwrap_or_else(|error| {
            tracing::warn!(task_id = %self.id, %error, "unparseable task payload, treating as empty");
            TaskPayload::default()
        });
        Ok(Task {
            status: parse_status(&self.status)?,
            priority: parse_priority(&self.priority)?,
            id: self.id,
            project_id: self.project_id,
            task_type: self.task_type,
            title: self.title,
            description: self.description,
            retry_count: self.retry_count,
            failure_count: self.failure_count,
            payload,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, project_id, task_type, title, description, status, priority, \
     retry_count, failure_count, payload, next_run_at, created_at, started_at, completed_at, updated_at";

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Fields for a new task. Everything not set falls back to a queued P1 task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: Option<String>,
    pub task_type: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub next_run_at: Option<String>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            project_id: None,
            task_type: "generic".to_string(),
            title: String::new(),
            description: None,
            status: TaskStatus::Queued,
            priority: Priority::P1,
            payload: TaskPayload::default(),
            next_run_at: None,
        }
    }
}

/// Insert a task and return its generated id.
pub async fn insert_task(store: &OpsStore, new: &NewTask) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&new.payload).context("serialize task payload")?;
    sqlx::query(
        r#"
        INSERT INTO tasks (id, project_id, task_type, title, description, status, priority, payload, next_run_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.project_id)
    .bind(&new.task_type)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.status.to_string())
    .bind(new.priority.to_string())
    .bind(&payload)
    .bind(&new.next_run_at)
    .execute(store.pool())
    .await
    .context("insert task")?;
    Ok(id)
}

/// Partial update applied by [`update_task`]. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub retry_count: Option<i64>,
    pub failure_count: Option<i64>,
    pub payload: Option<TaskPayload>,
    pub next_run_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Apply a partial update to a task. Unconditional; use [`transition_status`]
/// when the write must lose races against the executor.
pub async fn update_task(store: &OpsStore, task_id: &str, update: &TaskUpdate) -> Result<()> {
    let payload = match &update.payload {
        Some(payload) => Some(serde_json::to_string(payload).context("serialize task payload")?),
        None => None,
    };
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = COALESCE(?, status),
            priority = COALESCE(?, priority),
            retry_count = COALESCE(?, retry_count),
            failure_count = COALESCE(?, failure_count),
            payload = COALESCE(?, payload),
            next_run_at = COALESCE(?, next_run_at),
            started_at = COALESCE(?, started_at),
            completed_at = COALESCE(?, completed_at),
            updated_at = datetime('now')
        WHERE id = ?
        "#,
    )
    .bind(update.status.map(|s| s.to_string()))
    .bind(update.priority.map(|p| p.to_string()))
    .bind(update.retry_count)
    .bind(update.failure_count)
    .bind(payload)
    .bind(&update.next_run_at)
    .bind(&update.started_at)
    .bind(&update.completed_at)
    .bind(task_id)
    .execute(store.pool())
    .await
    .context("update task")?;
    Ok(())
}

/// Rewrite just the payload column.
pub async fn save_payload(store: &OpsStore, task_id: &str, payload: &TaskPayload) -> Result<()> {
    let payload = serde_json::to_string(payload).context("serialize task payload")?;
    sqlx::query("UPDATE tasks SET payload = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(&payload)
        .bind(task_id)
        .execute(store.pool())
        .await
        .context("save task payload")?;
    Ok(())
}

/// Conditionally move a task from one status to another.
///
/// Returns false when the task was no longer in the expected status, meaning
/// someone else (usually an executor) won the race. Callers treat false as a
/// no-op, never an error.
pub async fn transition_status(
    store: &OpsStore,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<bool> {
    let completed_at = matches!(to, TaskStatus::Completed).then(crate::store::now_stamp);
    let result = sqlx::query(
        r#"
        UPDATE tasks SET
            status = ?,
            started_at = CASE WHEN ? = 'in_progress' THEN COALESCE(started_at, datetime('now')) ELSE started_at END,
            completed_at = COALESCE(?, completed_at),
            updated_at = datetime('now')
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.to_string())
    .bind(to.to_string())
    .bind(completed_at)
    .bind(task_id)
    .bind(from.to_string())
    .execute(store.pool())
    .await
    .context("transition task status")?;
    Ok(result.rows_affected() > 0)
}

/// Requeue a failed task for another attempt. Conditional on the task still
/// being failed.
pub async fn requeue_failed(
    store: &OpsStore,
    task_id: &str,
    next_run_at: Option<&str>,
    bump_retry: bool,
    priority: Option<Priority>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET
            status = 'queued',
            retry_count = retry_count + ?,
            next_run_at = ?,
            priority = COALESCE(?, priority),
            updated_at = datetime('now')
        WHERE id = ? AND status = 'failed'
        "#,
    )
    .bind(if bump_retry { 1 } else { 0 })
    .bind(next_run_at)
    .bind(priority.map(|p| p.to_string()))
    .bind(task_id)
    .execute(store.pool())
    .await
    .context("requeue failed task")?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn get_task(store: &OpsStore, task_id: &str) -> Result<Option<Task>> {
    let row: Option<TaskRow> =
        sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(task_id)
            .fetch_optional(store.pool())
            .await
            .context("load task")?;
    row.map(TaskRow::into_task).transpose()
}

/// All tasks belonging to an initiative, oldest first.
pub async fn tasks_for_project(store: &OpsStore, project_id: &str) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(project_id)
    .fetch_all(store.pool())
    .await
    .context("load tasks for project")?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

/// Failed tasks whose last update falls inside the lookback window.
pub async fn failed_tasks_since(store: &OpsStore, window_mins: i64) -> Result<Vec<Task>> {
    let modifier = format!("-{window_mins} minutes");
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = 'failed' AND updated_at >= datetime('now', ?)
         ORDER BY updated_at ASC"
    ))
    .bind(&modifier)
    .fetch_all(store.pool())
    .await
    .context("load recent failed tasks")?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

/// Every currently quarantined task.
pub async fn quarantined_tasks(store: &OpsStore) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'quarantined' ORDER BY updated_at ASC"
    ))
    .fetch_all(store.pool())
    .await
    .context("load quarantined tasks")?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

pub async fn count_with_status(store: &OpsStore, status: TaskStatus) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
        .bind(status.to_string())
        .fetch_one(store.pool())
        .await
        .context("count tasks by status")?;
    Ok(count)
}
