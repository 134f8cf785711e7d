//! Policy promotion and demotion.
//!
//! Probation policies earn their way to active through verified simulate
//! evaluations, never through judgement calls. The bar: low risk, enough
//! simulations, a high verified pass rate, and room under the rolling
//! daily promotion cap. The same table drives the other direction; verified
//! failures and stale probation get disabled.

use crate::config::AutonomicConfig;
use crate::store::OpsStore;

use super::evaluation::simulate_stats;
use super::policy::{self, validate_policy_json, PolicyStatus, RiskLevel};

use anyhow::{bail, Context, Result};

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// The promotion criteria, kept pure so the exact boundary is testable.
///
/// Pass rate is computed over verified results only; unknowns neither help
/// nor hurt. A policy with no verified results at all never promotes.
pub fn promotion_gate(
    total_simulations: i64,
    verified_pass: i64,
    verified_fail: i64,
    config: &AutonomicConfig,
) -> bool {
    if total_simulations < config.promotion_min_simulations {
        return false;
    }
    let verified = verified_pass + verified_fail;
    if verified == 0 {
        return false;
    }
    verified_pass as f64 / verified as f64 >= config.promotion_pass_rate
}

/// A probation policy that currently clears the promotion gate.
#[derive(Debug, Clone)]
pub struct PromotionCandidate {
    pub policy_id: String,
    pub signature: String,
    pub simulations: i64,
    pub passed: i64,
    pub failed: i64,
}

impl PromotionCandidate {
    pub fn pass_rate(&self) -> f64 {
        let verified = self.passed + self.failed;
        if verified == 0 {
            0.0
        } else {
            self.passed as f64 / verified as f64
        }
    }
}

/// Probation policies eligible for promotion right now.
///
/// Only low-risk policies qualify, and the stored json must survive strict
/// validation; promoting a policy that enforcement would then reject is
/// pointless.
pub async fn find_promotion_candidates(
    store: &OpsStore,
    config: &AutonomicConfig,
) -> Result<Vec<PromotionCandidate>> {
    let mut candidates = Vec::new();
    for probationer in policy::load_by_status(store, PolicyStatus::Probation).await? {
        if probationer.risk_level != RiskLevel::Low {
            continue;
        }
        let stats = simulate_stats(store, &probationer.policy_id).await?;
        if !promotion_gate(stats.total, stats.passed, stats.failed, config) {
            continue;
        }
        if let Err(error) = validate_policy_json(&probationer.policy_json, true) {
            tracing::debug!(
                policy_id = %probationer.policy_id,
                %error,
                "candidate fails strict validation, skipping"
            );
            continue;
        }
        candidates.push(PromotionCandidate {
            policy_id: probationer.policy_id,
            signature: probationer.signature,
            simulations: stats.total,
            passed: stats.passed,
            failed: stats.failed,
        });
    }
    Ok(candidates)
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// Flip a policy to active and append its promote evaluation, both or
/// neither. Returns false when the policy was no longer in probation.
async fn promote_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    policy_id: &str,
    signature: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE absorption_policies SET status = 'active', updated_at = datetime('now')
         WHERE policy_id = ? AND status = 'probation'",
    )
    .bind(policy_id)
    .execute(&mut **tx)
    .await
    .context("activate policy")?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO policy_evaluations (id, policy_id, signature, mode, decision, latency_ms)
         VALUES (?, ?, ?, 'promote', 'applied', 0)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(policy_id)
    .bind(signature)
    .execute(&mut **tx)
    .await
    .context("record promote evaluation")?;
    Ok(true)
}

/// Promote one policy. The status flip and the promote evaluation land in a
/// single transaction; a failure of either write rolls both back.
pub async fn promote_to_active(store: &OpsStore, policy_id: &str) -> Result<bool> {
    let Some(policy) = policy::get_policy(store, policy_id).await? else {
        bail!("policy {policy_id} not found");
    };

    let mut tx = store.pool().begin().await.context("begin promotion")?;
    let applied = promote_in_tx(&mut tx, policy_id, &policy.signature).await?;
    tx.commit().await.context("commit promotion")?;

    if applied {
        log_promoted(store, policy_id, &policy.signature).await;
    }
    Ok(applied)
}

async fn log_promoted(store: &OpsStore, policy_id: &str, signature: &str) {
    if let Err(error) = store
        .log_event(
            "policy_promoted",
            &format!("policy {policy_id} promoted to active"),
            Some(&serde_json::json!({ "policy_id": policy_id, "signature": signature })),
        )
        .await
    {
        tracing::warn!(%error, policy_id, "failed to log promotion event");
    }
    tracing::info!(policy_id, signature, "policy promoted to active");
}

/// Outcome of one promotion job.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionSummary {
    pub promoted: Vec<String>,
    /// Promotion slots still open in the rolling window after this job.
    pub remaining_slots: i64,
}

/// Promote eligible candidates into whatever is left of the rolling daily
/// cap.
///
/// The cap count and the promotions run in one transaction, so two
/// overlapping jobs cannot both see a free slot and overshoot the cap.
pub async fn run_promotion_job(
    store: &OpsStore,
    config: &AutonomicConfig,
) -> Result<PromotionSummary> {
    let candidates = find_promotion_candidates(store, config).await?;

    let mut tx = store.pool().begin().await.context("begin promotion job")?;
    let (used,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM policy_evaluations
         WHERE mode = 'promote' AND created_at >= datetime('now', '-1 day')",
    )
    .fetch_one(&mut *tx)
    .await
    .context("count recent promotions")?;

    let slots = (config.promotion_daily_cap - used).max(0);
    let mut promoted = Vec::new();
    for candidate in candidates.iter().take(slots as usize) {
        if promote_in_tx(&mut tx, &candidate.policy_id, &candidate.signature).await? {
            promoted.push(candidate.policy_id.clone());
        }
    }
    tx.commit().await.context("commit promotion job")?;

    for policy_id in &promoted {
        let signature = candidates
            .iter()
            .find(|c| &c.policy_id == policy_id)
            .map(|c| c.signature.as_str())
            .unwrap_or_default();
        log_promoted(store, policy_id, signature).await;
    }

    Ok(PromotionSummary {
        remaining_slots: slots - promoted.len() as i64,
        promoted,
    })
}

// ---------------------------------------------------------------------------
// Demotion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DisableCandidate {
    pub policy_id: String,
    pub reason: String,
}

/// Policies that have lost the right to run.
pub async fn find_policies_to_disable(
    store: &OpsStore,
    config: &AutonomicConfig,
) -> Result<Vec<DisableCandidate>> {
    let mut candidates: Vec<DisableCandidate> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut push = |policy_id: String, reason: &str| {
        if seen.insert(policy_id.clone()) {
            candidates.push(DisableCandidate {
                policy_id,
                reason: reason.to_string(),
            });
        }
    };

    // An active policy gets no grace: one verified failure and it is out.
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT p.policy_id
         FROM absorption_policies p
         JOIN policy_evaluations e ON e.policy_id = p.policy_id
         WHERE p.status = 'active' AND e.verification_result = 'fail'",
    )
    .fetch_all(store.pool())
    .await
    .context("find failing active policies")?;
    for (policy_id,) in rows {
        push(policy_id, "verified_failure_while_active");
    }

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT p.policy_id
         FROM absorption_policies p
         JOIN policy_evaluations e ON e.policy_id = p.policy_id AND e.verification_result = 'fail'
         WHERE p.status = 'probation'
         GROUP BY p.policy_id
         HAVING COUNT(e.id) >= ?",
    )
    .bind(config.probation_fail_limit)
    .fetch_all(store.pool())
    .await
    .context("find failing probation policies")?;
    for (policy_id,) in rows {
        push(policy_id, "repeated_simulation_failures");
    }

    let age_modifier = format!("-{} days", config.probation_max_age_days);
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT policy_id FROM absorption_policies
         WHERE status = 'probation' AND created_at < datetime('now', ?)",
    )
    .bind(&age_modifier)
    .fetch_all(store.pool())
    .await
    .context("find stale probation policies")?;
    for (policy_id,) in rows {
        push(policy_id, "stale_probation");
    }

    Ok(candidates)
}

/// Disable a policy: status flip and the disable evaluation in one
/// transaction, then an audit event. Returns false if it was already
/// disabled.
pub async fn disable_policy(store: &OpsStore, policy_id: &str, reason: &str) -> Result<bool> {
    let Some(policy) = policy::get_policy(store, policy_id).await? else {
        bail!("policy {policy_id} not found");
    };

    let mut tx = store.pool().begin().await.context("begin disable")?;
    let result = sqlx::query(
        "UPDATE absorption_policies
         SET status = 'disabled', disabled_reason = ?, updated_at = datetime('now')
         WHERE policy_id = ? AND status != 'disabled'",
    )
    .bind(reason)
    .bind(policy_id)
    .execute(&mut *tx)
    .await
    .context("disable policy")?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO policy_evaluations (id, policy_id, signature, mode, decision, latency_ms, details)
         VALUES (?, ?, ?, 'disable', 'applied', 0, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(policy_id)
    .bind(&policy.signature)
    .bind(serde_json::json!({ "reason": reason }).to_string())
    .execute(&mut *tx)
    .await
    .context("record disable evaluation")?;
    tx.commit().await.context("commit disable")?;

    if let Err(error) = store
        .log_event(
            "policy_disabled",
            &format!("policy {policy_id} disabled ({reason})"),
            Some(&serde_json::json!({
                "policy_id": policy_id,
                "signature": policy.signature,
                "reason": reason,
            })),
        )
        .await
    {
        tracing::warn!(%error, policy_id, "failed to log disable event");
    }
    tracing::warn!(policy_id, reason, "policy disabled");
    Ok(true)
}

/// Disable everything [`find_policies_to_disable`] flagged.
pub async fn run_demotion_job(
    store: &OpsStore,
    config: &AutonomicConfig,
) -> Result<Vec<DisableCandidate>> {
    let candidates = find_policies_to_disable(store, config).await?;
    let mut disabled = Vec::new();
    for candidate in candidates {
        if disable_policy(store, &candidate.policy_id, &candidate.reason).await? {
            disabled.push(candidate);
        }
    }
    Ok(disabled)
}
