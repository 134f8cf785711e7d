//! Task quarantine: TTL-based isolation for repeat offenders, plus the
//! systemic failure check that tells an unlucky task apart from a broken
//! platform.
//!
//! Quarantine is deliberately boring. A task goes in with a reason and a
//! TTL, sits out of the dispatcher's reach, and comes back automatically
//! once the TTL elapses. No human involvement on either edge.

use crate::classifier::{self, FailureClass};
use crate::config::AutonomicConfig;
use crate::store::{self, OpsStore};
use crate::task::{self, Task, TaskStatus};

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::Arc;

/// Quarantine metadata stored in the task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineInfo {
    pub reason: String,
    pub quarantined_at: String,
    pub ttl_ms: u64,
    pub release_at: String,
}

/// Outcome of the systemic failure check.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemicReport {
    pub is_systemic: bool,
    /// The dominant class when systemic, None otherwise.
    pub failure_class: Option<FailureClass>,
    /// Distinct failed tasks of the dominant class inside the window.
    pub count: i64,
    pub window_mins: i64,
}

impl SystemicReport {
    fn quiet(window_mins: i64) -> Self {
        Self {
            is_systemic: false,
            failure_class: None,
            count: 0,
            window_mins,
        }
    }
}

/// Count failed tasks per class and flag the dominant class when it crosses
/// the systemic threshold.
///
/// Counting is per task, not per attempt: one task failing five times is one
/// data point. A systemic problem shows up as many distinct tasks failing
/// the same way.
pub fn detect_systemic_pattern(failed: &[Task], config: &AutonomicConfig) -> SystemicReport {
    let mut counts: HashMap<FailureClass, i64> = HashMap::new();
    for task_record in failed {
        let class = match &task_record.payload.failure_classification {
            Some(classification) => classification.class,
            None => classifier::classify_text(task_record.payload.error_message().unwrap_or("")),
        };
        *counts.entry(class).or_insert(0) += 1;
    }

    // Walk precedence order so ties resolve deterministically.
    let mut dominant: Option<(FailureClass, i64)> = None;
    for class in FailureClass::ALL {
        let count = counts.get(&class).copied().unwrap_or(0);
        if count > dominant.map(|(_, c)| c).unwrap_or(0) {
            dominant = Some((class, count));
        }
    }

    match dominant {
        Some((class, count)) if count >= config.systemic_class_threshold => SystemicReport {
            is_systemic: true,
            failure_class: Some(class),
            count,
            window_mins: config.systemic_window_mins,
        },
        Some((_, count)) => SystemicReport {
            count,
            ..SystemicReport::quiet(config.systemic_window_mins)
        },
        None => SystemicReport::quiet(config.systemic_window_mins),
    }
}

/// Moves tasks in and out of quarantine.
pub struct QuarantineManager {
    store: Arc<OpsStore>,
}

impl QuarantineManager {
    pub fn new(store: Arc<OpsStore>) -> Self {
        Self { store }
    }

    /// Quarantine a task with a reason-specific TTL.
    ///
    /// Idempotent: quarantining an already quarantined task is a no-op and
    /// returns false without extending the existing TTL.
    pub async fn quarantine_task(
        &self,
        task_id: &str,
        reason: &str,
        details: Option<&serde_json::Value>,
        config: &AutonomicConfig,
    ) -> Result<bool> {
        let Some(task_record) = task::get_task(&self.store, task_id).await? else {
            bail!("task {task_id} not found");
        };
        if task_record.status == TaskStatus::Quarantined {
            tracing::debug!(task_id, reason, "task already quarantined, skipping");
            return Ok(false);
        }

        let now = Utc::now();
        let ttl_ms = config.quarantine_ttl_for(reason);
        let release_at = now + Duration::milliseconds(ttl_ms as i64);
        let info = QuarantineInfo {
            reason: reason.to_string(),
            quarantined_at: store::stamp(now),
            ttl_ms,
            release_at: store::stamp(release_at),
        };

        let mut payload = task_record.payload.clone();
        payload.quarantine_info = Some(info.clone());
        let payload_json = serde_json::to_string(&payload).context("serialize task payload")?;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'quarantined', payload = ?, updated_at = datetime('now')
             WHERE id = ? AND status != 'quarantined'",
        )
        .bind(&payload_json)
        .bind(task_id)
        .execute(self.store.pool())
        .await
        .context("quarantine task")?;

        if result.rows_affected() == 0 {
            // Someone else quarantined it between our read and write.
            return Ok(false);
        }

        let mut event = serde_json::json!({
            "task_id": task_id,
            "reason": reason,
            "ttl_ms": ttl_ms,
            "release_at": info.release_at,
        });
        if let Some(details) = details {
            event["details"] = details.clone();
        }
        if let Err(error) = self
            .store
            .log_event(
                "task_quarantined",
                &format!("task {task_id} quarantined ({reason})"),
                Some(&event),
            )
            .await
        {
            tracing::warn!(%error, task_id, "failed to log quarantine event");
        }

        tracing::info!(task_id, reason, ttl_ms, "task quarantined");
        Ok(true)
    }

    /// Release every quarantined task whose TTL has elapsed.
    ///
    /// Released tasks go back to queued. Retry counters are left untouched,
    /// so a released task that keeps failing re-quarantines on the next
    /// cycle. A quarantined task missing its quarantine metadata is released
    /// immediately rather than held forever.
    pub async fn check_expired_quarantine_tasks(&self) -> Result<Vec<String>> {
        let now = store::now_stamp();
        let mut released = Vec::new();

        for task_record in task::quarantined_tasks(&self.store).await? {
            let reason = match &task_record.payload.quarantine_info {
                Some(info) => {
                    if info.release_at.as_str() > now.as_str() {
                        continue;
                    }
                    info.reason.clone()
                }
                None => {
                    tracing::warn!(
                        task_id = %task_record.id,
                        "quarantined task has no quarantine metadata, releasing"
                    );
                    "unknown".to_string()
                }
            };

            let mut payload = task_record.payload.clone();
            payload.quarantine_info = None;
            payload.failure_classification = None;
            let payload_json =
                serde_json::to_string(&payload).context("serialize task payload")?;

            let result = sqlx::query(
                "UPDATE tasks SET status = 'queued', next_run_at = NULL,
                        payload = ?, updated_at = datetime('now')
                 WHERE id = ? AND status = 'quarantined'",
            )
            .bind(&payload_json)
            .bind(&task_record.id)
            .execute(self.store.pool())
            .await
            .context("release quarantined task")?;

            if result.rows_affected() == 0 {
                continue;
            }

            if let Err(error) = self
                .store
                .log_event(
                    "quarantine_released",
                    &format!("task {} released from quarantine ({reason})", task_record.id),
                    Some(&serde_json::json!({ "task_id": task_record.id, "reason": reason })),
                )
                .await
            {
                tracing::warn!(%error, task_id = %task_record.id, "failed to log release event");
            }

            tracing::info!(task_id = %task_record.id, reason, "quarantine released");
            released.push(task_record.id);
        }

        Ok(released)
    }

    /// Check the recent failure window for a systemic pattern.
    pub async fn check_systemic_failure_pattern(
        &self,
        config: &AutonomicConfig,
    ) -> Result<SystemicReport> {
        let failed = task::failed_tasks_since(&self.store, config.systemic_window_mins).await?;
        let report = detect_systemic_pattern(&failed, config);
        if report.is_systemic {
            tracing::warn!(
                class = %report.failure_class.map(|c| c.to_string()).unwrap_or_default(),
                count = report.count,
                window_mins = report.window_mins,
                "systemic failure pattern detected"
            );
        }
        Ok(report)
    }
}
