//! Threshold health checks over the task tables.
//!
//! Four independent checks, each fail-open: a check that cannot run reports
//! itself healthy rather than raising the alert level, so a monitoring
//! fault never looks like an outage. Every run is persisted as a
//! `layer2_health` event, healthy or not, to keep a continuous trend in
//! the audit trail.

use crate::config::AutonomicConfig;
use crate::store::{now_stamp, parse_stamp, OpsStore};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// One check's outcome. `value` is absent when the underlying query could
/// not run or has nothing to measure.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: &'static str,
    pub ok: bool,
    pub value: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub level: HealthLevel,
    pub checks: Vec<HealthCheck>,
    pub failing: Vec<&'static str>,
    pub checked_at: String,
}

pub struct HealthMonitor {
    store: Arc<OpsStore>,
}

impl HealthMonitor {
    pub fn new(store: Arc<OpsStore>) -> Self {
        Self { store }
    }

    /// Run all checks, aggregate the level, and persist the snapshot.
    pub async fn run_checks(&self, config: &AutonomicConfig) -> HealthCheckResult {
        let checks = vec![
            self.check_dispatched_last_hour(config).await,
            self.check_stuck_tasks(config).await,
            self.check_last_success(config).await,
            self.check_queue_depth(config).await,
        ];
        let failing: Vec<&'static str> = checks
            .iter()
            .filter(|check| !check.ok)
            .map(|check| check.name)
            .collect();
        let stuck = checks
            .iter()
            .find(|check| check.name == "stuck_tasks")
            .and_then(|check| check.value)
            .unwrap_or(0);

        let level = if stuck > config.health_stuck_critical || failing.len() >= 3 {
            HealthLevel::Critical
        } else if failing.is_empty() {
            HealthLevel::Healthy
        } else {
            HealthLevel::Warning
        };

        let result = HealthCheckResult {
            level,
            checks,
            failing,
            checked_at: now_stamp(),
        };
        self.persist(&result).await;
        if result.level != HealthLevel::Healthy {
            tracing::warn!(
                level = %result.level,
                failing = ?result.failing,
                "health degraded"
            );
        }
        result
    }

    /// Completions in the trailing hour. Quiet is only a failure once the
    /// system has been up long enough to have had work to do.
    async fn check_dispatched_last_hour(&self, config: &AutonomicConfig) -> HealthCheck {
        let counted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks
             WHERE status = 'completed' AND completed_at >= datetime('now', '-1 hour')",
        )
        .fetch_one(self.store.pool())
        .await;
        let count = match counted {
            Ok((count,)) => count,
            Err(error) => return absorbed("dispatched_1h", error.into()),
        };

        let mut ok = true;
        if count == 0 {
            match self.uptime_hours().await {
                Ok(Some(uptime)) => ok = uptime <= config.health_uptime_grace_hours,
                Ok(None) => {}
                Err(error) => return absorbed("dispatched_1h", error),
            }
        }
        HealthCheck {
            name: "dispatched_1h",
            ok,
            value: Some(count),
        }
    }

    /// Age of the oldest task, in whole hours. None when no tasks exist.
    async fn uptime_hours(&self) -> Result<Option<i64>> {
        let (oldest,): (Option<String>,) = sqlx::query_as("SELECT MIN(created_at) FROM tasks")
            .fetch_one(self.store.pool())
            .await?;
        Ok(oldest
            .as_deref()
            .and_then(parse_stamp)
            .map(|at| (Utc::now() - at).num_hours()))
    }

    /// Tasks sitting in progress past the stuck cutoff.
    async fn check_stuck_tasks(&self, config: &AutonomicConfig) -> HealthCheck {
        let cutoff = format!("-{} hours", config.health_stuck_hours);
        let counted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks
             WHERE status = 'in_progress'
               AND COALESCE(started_at, updated_at) <= datetime('now', ?)",
        )
        .bind(&cutoff)
        .fetch_one(self.store.pool())
        .await;
        match counted {
            Ok((count,)) => HealthCheck {
                name: "stuck_tasks",
                ok: count <= config.health_stuck_warn,
                value: Some(count),
            },
            Err(error) => absorbed("stuck_tasks", error.into()),
        }
    }

    /// Minutes since the most recent completion. A system that has never
    /// completed anything passes; that condition belongs to dispatched_1h.
    async fn check_last_success(&self, config: &AutonomicConfig) -> HealthCheck {
        let latest: Result<(Option<String>,), sqlx::Error> = sqlx::query_as(
            "SELECT MAX(completed_at) FROM tasks WHERE status = 'completed'",
        )
        .fetch_one(self.store.pool())
        .await;
        let latest = match latest {
            Ok((latest,)) => latest,
            Err(error) => return absorbed("last_success_ago_min", error.into()),
        };
        let Some(at) = latest.as_deref().and_then(parse_stamp) else {
            return HealthCheck {
                name: "last_success_ago_min",
                ok: true,
                value: None,
            };
        };
        let minutes = (Utc::now() - at).num_minutes();
        HealthCheck {
            name: "last_success_ago_min",
            ok: minutes <= config.health_last_success_warn_mins,
            value: Some(minutes),
        }
    }

    async fn check_queue_depth(&self, config: &AutonomicConfig) -> HealthCheck {
        let counted: Result<(i64,), sqlx::Error> =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'queued'")
                .fetch_one(self.store.pool())
                .await;
        match counted {
            Ok((depth,)) => HealthCheck {
                name: "queue_depth",
                ok: depth <= config.health_queue_depth_warn,
                value: Some(depth),
            },
            Err(error) => absorbed("queue_depth", error.into()),
        }
    }

    async fn persist(&self, result: &HealthCheckResult) {
        let details = json!({
            "level": result.level.to_string(),
            "failing": result.failing,
            "checks": result
                .checks
                .iter()
                .map(|check| json!({ "name": check.name, "ok": check.ok, "value": check.value }))
                .collect::<Vec<_>>(),
        });
        if let Err(error) = self
            .store
            .log_event(
                "layer2_health",
                &format!(
                    "health {}: {} of {} checks failing",
                    result.level,
                    result.failing.len(),
                    result.checks.len()
                ),
                Some(&details),
            )
            .await
        {
            tracing::warn!(%error, "failed to persist health snapshot");
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").finish_non_exhaustive()
    }
}

/// A check whose query failed never degrades the level.
fn absorbed(name: &'static str, error: anyhow::Error) -> HealthCheck {
    tracing::warn!(check = name, %error, "health check query failed");
    HealthCheck {
        name,
        ok: true,
        value: None,
    }
}
