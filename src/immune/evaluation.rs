//! Policy evaluations: the append-only record of every absorption decision.
//!
//! Rows are written at decision time with an unknown verification result.
//! The sweep comes back later, looks at what happened to the absorbed task,
//! and back-fills pass or fail exactly once. Promotion and demotion read
//! nothing but this table, so a policy's track record is always replayable.

use crate::store::OpsStore;
use crate::task::{self, TaskStatus};

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// How old an unknown evaluation may get before the sweep stops looking at
/// it. Tasks rarely resolve after a week; scanning forever is pointless.
const VERIFICATION_MAX_AGE_DAYS: i64 = 7;
const VERIFICATION_BATCH: i64 = 200;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// An active policy acted on the task.
    Enforce,
    /// A probation policy recorded what it would have done.
    Simulate,
    /// Bookkeeping row for a promotion.
    Promote,
    /// Bookkeeping row for a disable.
    Disable,
}

impl std::fmt::Display for EvalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvalMode::Enforce => "enforce",
            EvalMode::Simulate => "simulate",
            EvalMode::Promote => "promote",
            EvalMode::Disable => "disable",
        };
        write!(f, "{s}")
    }
}

pub fn parse_eval_mode(s: &str) -> Result<EvalMode> {
    Ok(match s {
        "enforce" => EvalMode::Enforce,
        "simulate" => EvalMode::Simulate,
        "promote" => EvalMode::Promote,
        "disable" => EvalMode::Disable,
        other => bail!("unknown evaluation mode: {other}"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Pass,
    Fail,
    Unknown,
}

impl std::fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationResult::Pass => "pass",
            VerificationResult::Fail => "fail",
            VerificationResult::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

pub fn parse_verification_result(s: &str) -> Result<VerificationResult> {
    Ok(match s {
        "pass" => VerificationResult::Pass,
        "fail" => VerificationResult::Fail,
        "unknown" => VerificationResult::Unknown,
        other => bail!("unknown verification result: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Fields for a new evaluation row.
#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub policy_id: String,
    pub run_id: Option<String>,
    pub signature: String,
    pub mode: EvalMode,
    pub decision: String,
    pub latency_ms: i64,
    /// Task the decision was about; the verification sweep follows this.
    pub task_id: Option<String>,
    pub details: Option<Value>,
}

/// Append an evaluation. The task id rides inside the details column so the
/// table keeps the shape shared with external reporting tools.
pub async fn record_evaluation(store: &OpsStore, new: &NewEvaluation) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();

    let mut details = match &new.details {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("detail".to_string(), other.clone());
            map
        }
        None => serde_json::Map::new(),
    };
    if let Some(task_id) = &new.task_id {
        details.insert("task_id".to_string(), task_id.clone().into());
    }
    let details_json = if details.is_empty() {
        None
    } else {
        Some(Value::Object(details).to_string())
    };

    sqlx::query(
        "INSERT INTO policy_evaluations (id, policy_id, run_id, signature, mode, decision, latency_ms, details)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.policy_id)
    .bind(&new.run_id)
    .bind(&new.signature)
    .bind(new.mode.to_string())
    .bind(&new.decision)
    .bind(new.latency_ms)
    .bind(&details_json)
    .execute(store.pool())
    .await
    .context("insert policy evaluation")?;
    Ok(id)
}

/// A stored evaluation.
#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub id: String,
    pub policy_id: String,
    pub run_id: Option<String>,
    pub signature: String,
    pub mode: EvalMode,
    pub decision: String,
    pub verification_result: VerificationResult,
    pub latency_ms: i64,
    pub details: Option<Value>,
    pub created_at: String,
}

impl PolicyEvaluation {
    pub fn task_id(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("task_id"))
            .and_then(Value::as_str)
    }
}

#[derive(sqlx::FromRow)]
struct EvaluationRow {
    id: String,
    policy_id: String,
    run_id: Option<String>,
    signature: String,
    mode: String,
    decision: String,
    verification_result: String,
    latency_ms: i64,
    details: Option<String>,
    created_at: String,
}

impl EvaluationRow {
    fn into_evaluation(self) -> Result<PolicyEvaluation> {
        let details = self
            .details
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        Ok(PolicyEvaluation {
            mode: parse_eval_mode(&self.mode)?,
            verification_result: parse_verification_result(&self.verification_result)?,
            id: self.id,
            policy_id: self.policy_id,
            run_id: self.run_id,
            signature: self.signature,
            decision: self.decision,
            latency_ms: self.latency_ms,
            details,
            created_at: self.created_at,
        })
    }
}

const EVALUATION_COLUMNS: &str =
    "id, policy_id, run_id, signature, mode, decision, verification_result, latency_ms, details, created_at";

/// Every evaluation for one policy, oldest first.
pub async fn evaluations_for_policy(
    store: &OpsStore,
    policy_id: &str,
) -> Result<Vec<PolicyEvaluation>> {
    let rows: Vec<EvaluationRow> = sqlx::query_as(&format!(
        "SELECT {EVALUATION_COLUMNS} FROM policy_evaluations
         WHERE policy_id = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(policy_id)
    .fetch_all(store.pool())
    .await
    .context("load evaluations for policy")?;
    rows.into_iter().map(EvaluationRow::into_evaluation).collect()
}

/// Verified simulate track record for one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulateStats {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
}

pub async fn simulate_stats(store: &OpsStore, policy_id: &str) -> Result<SimulateStats> {
    let (total, passed, failed): (i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN verification_result = 'pass' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN verification_result = 'fail' THEN 1 ELSE 0 END), 0)
         FROM policy_evaluations WHERE policy_id = ? AND mode = 'simulate'",
    )
    .bind(policy_id)
    .fetch_one(store.pool())
    .await
    .context("aggregate simulate stats")?;
    Ok(SimulateStats {
        total,
        passed,
        failed,
    })
}

// ---------------------------------------------------------------------------
// Verification sweep
// ---------------------------------------------------------------------------

/// Back-fill verification results for enforce and simulate evaluations
/// still marked unknown. Returns how many rows were resolved.
///
/// The write is guarded on the result still being unknown, so a concurrent
/// sweep can never flip an already verified row.
pub async fn run_verification_sweep(store: &OpsStore) -> Result<usize> {
    let age_limit = format!("-{VERIFICATION_MAX_AGE_DAYS} days");
    let rows: Vec<EvaluationRow> = sqlx::query_as(&format!(
        "SELECT {EVALUATION_COLUMNS} FROM policy_evaluations
         WHERE verification_result = 'unknown'
           AND mode IN ('enforce', 'simulate')
           AND created_at >= datetime('now', ?)
         ORDER BY created_at ASC LIMIT ?"
    ))
    .bind(&age_limit)
    .bind(VERIFICATION_BATCH)
    .fetch_all(store.pool())
    .await
    .context("load unverified evaluations")?;

    let mut resolved = 0;
    for row in rows {
        let evaluation = match row.into_evaluation() {
            Ok(evaluation) => evaluation,
            Err(error) => {
                tracing::warn!(%error, "skipping unreadable evaluation row");
                continue;
            }
        };
        let Some(task_id) = evaluation.task_id() else {
            continue;
        };
        let Some(task_record) = task::get_task(store, task_id).await? else {
            continue;
        };

        let verdict = judge_outcome(
            task_record.status,
            task_record.finished_at(),
            &evaluation.created_at,
        );
        if verdict == VerificationResult::Unknown {
            continue;
        }

        let result = sqlx::query(
            "UPDATE policy_evaluations SET verification_result = ?
             WHERE id = ? AND verification_result = 'unknown'",
        )
        .bind(verdict.to_string())
        .bind(&evaluation.id)
        .execute(store.pool())
        .await
        .context("back-fill verification result")?;
        if result.rows_affected() > 0 {
            resolved += 1;
        }
    }

    if resolved > 0 {
        tracing::debug!(resolved, "verification sweep resolved evaluations");
    }
    Ok(resolved)
}

/// Decide a verification verdict from the task's state relative to when the
/// evaluation was recorded. Only movement strictly after the evaluation
/// stamp counts: the failed state the evaluation was recorded against lands
/// in the same second and is not evidence either way. A task that has not
/// resolved yet stays unknown.
fn judge_outcome(
    status: TaskStatus,
    finished_at: &str,
    evaluated_at: &str,
) -> VerificationResult {
    let moved_since = finished_at > evaluated_at;
    match status {
        TaskStatus::Completed if moved_since => VerificationResult::Pass,
        TaskStatus::Failed | TaskStatus::Quarantined if moved_since => VerificationResult::Fail,
        _ => VerificationResult::Unknown,
    }
}
