//! Stuck run detection and escalation.
//!
//! Executors heartbeat their run row while working. A running row whose
//! heartbeat goes quiet past the threshold is presumed dead: the monitor
//! fails the run on the executor's behalf and walks the task up an
//! escalation ladder keyed on how often this has happened before.

use crate::config::AutonomicConfig;
use crate::quarantine::QuarantineManager;
use crate::store::OpsStore;
use crate::task::{self, Priority, TaskStatus};

use anyhow::{bail, Context, Result};

use std::sync::Arc;

// Reason codes written onto runs the monitor kills, so a dead executor is
// never mistaken for a task that failed on its own. One per ladder rung.
pub const MONITOR_RESTART: &str = "MONITOR_RESTART";
pub const MONITOR_RETRY: &str = "MONITOR_RETRY";
pub const MONITOR_QUARANTINE: &str = "MONITOR_QUARANTINE";
/// Written when a stuck run's task no longer exists.
pub const MONITOR_ORPHANED: &str = "MONITOR_ORPHANED";

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

pub fn parse_run_status(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        other => bail!("unknown run status: {other}"),
    })
}

/// One execution attempt of a task.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub started_at: String,
    pub heartbeat_at: String,
    pub ended_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    task_id: String,
    status: String,
    reason: Option<String>,
    started_at: String,
    heartbeat_at: String,
    ended_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            status: parse_run_status(&self.status)?,
            id: self.id,
            task_id: self.task_id,
            reason: self.reason,
            started_at: self.started_at,
            heartbeat_at: self.heartbeat_at,
            ended_at: self.ended_at,
        })
    }
}

/// Record the start of an execution attempt. Called by the executor when it
/// claims a task.
pub async fn insert_run(store: &OpsStore, task_id: &str) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO runs (id, task_id) VALUES (?, ?)")
        .bind(&id)
        .bind(task_id)
        .execute(store.pool())
        .await
        .context("insert run")?;
    Ok(id)
}

/// Refresh a run's heartbeat. Executors call this while working.
pub async fn record_heartbeat(store: &OpsStore, run_id: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET heartbeat_at = datetime('now') WHERE id = ? AND status = 'running'")
        .bind(run_id)
        .execute(store.pool())
        .await
        .context("record run heartbeat")?;
    Ok(())
}

/// Mark a run completed. Conditional on it still running.
pub async fn complete_run(store: &OpsStore, run_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'completed', ended_at = datetime('now')
         WHERE id = ? AND status = 'running'",
    )
    .bind(run_id)
    .execute(store.pool())
    .await
    .context("complete run")?;
    Ok(result.rows_affected() > 0)
}

/// Running rows whose heartbeat is older than the threshold.
pub async fn stuck_runs(store: &OpsStore, threshold_secs: i64) -> Result<Vec<Run>> {
    let modifier = format!("-{threshold_secs} seconds");
    let rows: Vec<RunRow> = sqlx::query_as(
        "SELECT id, task_id, status, reason, started_at, heartbeat_at, ended_at FROM runs
         WHERE status = 'running' AND heartbeat_at < datetime('now', ?)
         ORDER BY heartbeat_at ASC",
    )
    .bind(&modifier)
    .fetch_all(store.pool())
    .await
    .context("load stuck runs")?;
    rows.into_iter().map(RunRow::into_run).collect()
}

async fn mark_run_failed(store: &OpsStore, run_id: &str, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'failed', reason = ?, ended_at = datetime('now')
         WHERE id = ? AND status = 'running'",
    )
    .bind(reason)
    .bind(run_id)
    .execute(store.pool())
    .await
    .context("mark run failed")?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// What the sweep did about one stuck run.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    Requeued { task_id: String, priority: Priority },
    Quarantined { task_id: String },
    /// The executor finished (or someone else intervened) between detection
    /// and escalation. Nothing was changed.
    LostRace { task_id: String },
}

/// Detects silently dead executions and escalates their tasks.
pub struct StuckMonitor {
    store: Arc<OpsStore>,
}

impl StuckMonitor {
    pub fn new(store: Arc<OpsStore>) -> Self {
        Self { store }
    }

    /// One detection and escalation pass.
    ///
    /// Every write along the way is conditional, so a run that completes or
    /// a task an executor touches mid-sweep is left alone.
    pub async fn sweep(
        &self,
        quarantine: &QuarantineManager,
        config: &AutonomicConfig,
    ) -> Result<Vec<EscalationOutcome>> {
        let stuck = stuck_runs(&self.store, config.stuck_heartbeat_secs).await?;
        let mut outcomes = Vec::new();

        for run in stuck {
            let Some(task_record) = task::get_task(&self.store, &run.task_id).await? else {
                tracing::warn!(run_id = %run.id, task_id = %run.task_id, "stuck run has no task");
                mark_run_failed(&self.store, &run.id, MONITOR_ORPHANED).await?;
                continue;
            };

            let reason = match task_record.retry_count {
                0 => MONITOR_RESTART,
                1 => MONITOR_RETRY,
                _ => MONITOR_QUARANTINE,
            };
            if !mark_run_failed(&self.store, &run.id, reason).await? {
                // Finished after detection. Not stuck after all.
                outcomes.push(EscalationOutcome::LostRace {
                    task_id: run.task_id,
                });
                continue;
            }

            let outcome = self
                .escalate(&task_record, &run.id, quarantine, config)
                .await?;

            if let Err(error) = self
                .store
                .log_event(
                    "stuck_run_escalated",
                    &format!(
                        "run {} stuck ({}s without heartbeat), task {} escalated",
                        run.id, config.stuck_heartbeat_secs, run.task_id
                    ),
                    Some(&serde_json::json!({
                        "run_id": run.id,
                        "task_id": run.task_id,
                        "retry_count": task_record.retry_count,
                        "outcome": format!("{outcome:?}"),
                    })),
                )
                .await
            {
                tracing::warn!(%error, run_id = %run.id, "failed to log escalation event");
            }

            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// The escalation ladder. Rung is the task's retry count so far:
    /// requeue, then requeue at lowered priority, then quarantine.
    async fn escalate(
        &self,
        task_record: &task::Task,
        run_id: &str,
        quarantine: &QuarantineManager,
        config: &AutonomicConfig,
    ) -> Result<EscalationOutcome> {
        let task_id = task_record.id.clone();

        match task_record.retry_count {
            0 => self
                .requeue_stuck(&task_id, task_record.priority)
                .await
                .map(|applied| {
                    if applied {
                        EscalationOutcome::Requeued {
                            task_id,
                            priority: task_record.priority,
                        }
                    } else {
                        EscalationOutcome::LostRace { task_id }
                    }
                }),
            1 => {
                let lowered = task_record.priority.lowered();
                self.requeue_stuck(&task_id, lowered).await.map(|applied| {
                    if applied {
                        EscalationOutcome::Requeued {
                            task_id,
                            priority: lowered,
                        }
                    } else {
                        EscalationOutcome::LostRace { task_id }
                    }
                })
            }
            _ => {
                let applied = quarantine
                    .quarantine_task(
                        &task_id,
                        "stuck_repeatedly",
                        Some(&serde_json::json!({ "run_id": run_id })),
                        config,
                    )
                    .await?;
                if applied {
                    Ok(EscalationOutcome::Quarantined { task_id })
                } else {
                    Ok(EscalationOutcome::LostRace { task_id })
                }
            }
        }
    }

    /// Put a stuck task back in the queue, burning one retry. Conditional on
    /// it still being in progress.
    async fn requeue_stuck(&self, task_id: &str, priority: Priority) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, priority = ?,
                    next_run_at = NULL, updated_at = datetime('now')
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(priority.to_string())
        .bind(task_id)
        .execute(self.store.pool())
        .await
        .context("requeue stuck task")?;
        Ok(result.rows_affected() > 0)
    }
}
