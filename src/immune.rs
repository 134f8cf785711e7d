//! The immune system: learned absorption of repeat failures.
//!
//! A failure that has been diagnosed once should not cost a full
//! investigation the second time. Failures hash to signatures; signatures
//! accumulate remediation policies; policies run in probation (decisions
//! recorded, task untouched) until a verified simulation track record
//! promotes them to active enforcement. Every decision lands in
//! `policy_evaluations`, so promotion and demotion work from evidence
//! rather than configuration.

pub mod evaluation;
pub mod policy;
pub mod promotion;
pub mod signature;

pub use evaluation::{EvalMode, NewEvaluation, PolicyEvaluation, VerificationResult};
pub use policy::{
    validate_policy_json, AbsorptionPolicy, NewPolicy, PolicyAction, PolicyStatus,
    PolicyValidationError, RiskLevel, ValidatedPolicy,
};
pub use promotion::{DisableCandidate, PromotionCandidate, PromotionSummary};
pub use signature::{components_for_task, FailureSignature, SignatureRecord};

use crate::config::AutonomicConfig;
use crate::rca::{extract_rca_result, DevDispatch, RcaResult, RootCauseAnalyzer};
use crate::store::{stamp, OpsStore};
use crate::task::{self, Priority, Task};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use evaluation::record_evaluation;
use policy::risk_for_action;

/// What absorption did with one failure.
#[derive(Debug, Clone, PartialEq)]
pub enum AbsorptionOutcome {
    /// An active policy handled the failure outright. No analysis runs.
    Enforced {
        policy_id: String,
        /// What the action did to the task ("requeued", "skipped", ...).
        applied: String,
    },
    /// No active policy fired; the failure went through analysis.
    Analyzed {
        /// Probation policy whose intended decision was recorded.
        simulated_policy: Option<String>,
        /// Dev task created for the proposed fix, when confidence cleared
        /// the auto-fix bar.
        dispatched_task: Option<String>,
        /// Probation policy seeded from the analyzer's proposed action.
        seeded_policy: Option<String>,
        confidence: f64,
    },
}

/// Counts from one maintenance pass over the policy tables.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceSummary {
    pub verified: usize,
    pub promoted: Vec<String>,
    pub remaining_slots: i64,
    pub disabled: Vec<DisableCandidate>,
}

/// Coordinates signatures, policies, and the RCA collaborators.
pub struct ImmuneSystem {
    store: Arc<OpsStore>,
    analyzer: Arc<dyn RootCauseAnalyzer>,
    dispatch: Arc<dyn DevDispatch>,
}

impl ImmuneSystem {
    pub fn new(
        store: Arc<OpsStore>,
        analyzer: Arc<dyn RootCauseAnalyzer>,
        dispatch: Arc<dyn DevDispatch>,
    ) -> Self {
        Self {
            store,
            analyzer,
            dispatch,
        }
    }

    /// [`absorb_failure`](Self::absorb_failure) with the signature
    /// components read off the task itself.
    pub async fn absorb_task_failure(
        &self,
        task: &Task,
        run_id: Option<&str>,
        config: &AutonomicConfig,
    ) -> Result<AbsorptionOutcome> {
        let (layer, step, reason_code) = components_for_task(task);
        self.absorb_failure(task, &layer, &step, &reason_code, run_id, config)
            .await
    }

    /// Run one failure through the absorption pipeline.
    ///
    /// Precedence: an active policy enforces and fully substitutes for
    /// analysis; a probation policy records what it would have done and the
    /// failure still goes to RCA; with neither, RCA alone decides whether a
    /// fix is dispatched and whether a new probation policy gets seeded.
    pub async fn absorb_failure(
        &self,
        task: &Task,
        layer: &str,
        step: &str,
        reason_code: &str,
        run_id: Option<&str>,
        config: &AutonomicConfig,
    ) -> Result<AbsorptionOutcome> {
        let sig = FailureSignature::derive(layer, step, reason_code);

        if let Some(active) = policy::active_policy_for(&self.store, &sig.signature).await? {
            let started = Instant::now();
            match validate_policy_json(&active.policy_json, true) {
                Ok(validated) => {
                    let applied = self.apply_action(task, &active, &validated.action).await?;
                    self.record(
                        &active,
                        run_id,
                        &sig,
                        EvalMode::Enforce,
                        "applied",
                        started,
                        Some(&task.id),
                        Some(json!({ "action": validated.action.name(), "outcome": applied })),
                    )
                    .await;
                    tracing::info!(
                        policy_id = %active.policy_id,
                        signature = %sig.signature,
                        task_id = %task.id,
                        action = validated.action.name(),
                        outcome = %applied,
                        "active policy absorbed failure"
                    );
                    return Ok(AbsorptionOutcome::Enforced {
                        policy_id: active.policy_id,
                        applied,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        policy_id = %active.policy_id,
                        %error,
                        "active policy failed strict validation, not enforcing"
                    );
                    self.record(
                        &active,
                        run_id,
                        &sig,
                        EvalMode::Enforce,
                        "rejected",
                        started,
                        Some(&task.id),
                        Some(json!({ "error": error.to_string() })),
                    )
                    .await;
                }
            }
        }

        let mut simulated_policy = None;
        if let Some(probation) = policy::probation_policy_for(&self.store, &sig.signature).await? {
            let started = Instant::now();
            match validate_policy_json(&probation.policy_json, false) {
                Ok(validated) => {
                    self.record(
                        &probation,
                        run_id,
                        &sig,
                        EvalMode::Simulate,
                        "simulated",
                        started,
                        Some(&task.id),
                        Some(json!({
                            "action": validated.action.name(),
                            "intended": validated.normalized_json(),
                        })),
                    )
                    .await;
                    simulated_policy = Some(probation.policy_id.clone());
                }
                Err(error) => {
                    tracing::warn!(
                        policy_id = %probation.policy_id,
                        %error,
                        "probation policy failed validation"
                    );
                    if let Err(log_error) = self
                        .store
                        .log_event(
                            "probation_policy_validation_failed",
                            &format!("policy {} rejected: {error}", probation.policy_id),
                            Some(&json!({
                                "policy_id": probation.policy_id,
                                "signature": sig.signature,
                                "error": error.to_string(),
                            })),
                        )
                        .await
                    {
                        tracing::warn!(%log_error, "failed to log validation event");
                    }
                }
            }
        }

        let occurrences = signature::record_occurrence(&self.store, &sig).await?;
        let context = json!({
            "signature": sig.signature,
            "layer": sig.layer,
            "step": sig.step,
            "reason_code": sig.reason_code,
            "occurrences": occurrences,
            "error": task.payload.error_message(),
            "run_id": run_id,
        });
        let analysis = self
            .analyzer
            .perform_rca(task, &context)
            .await
            .context("root cause analysis")?;
        let rca = extract_rca_result(&analysis);
        tracing::info!(
            signature = %sig.signature,
            task_id = %task.id,
            confidence = rca.confidence,
            root_cause = %rca.root_cause,
            "root cause analysis complete"
        );

        let mut dispatched_task = None;
        if rca.confidence >= config.auto_fix_confidence {
            match self.dispatch.dispatch_fix(task, &rca, &sig.signature).await {
                Ok(fix_task) => {
                    tracing::info!(
                        signature = %sig.signature,
                        fix_task = %fix_task,
                        "dispatched fix for diagnosed failure"
                    );
                    dispatched_task = Some(fix_task);
                }
                Err(error) => {
                    tracing::warn!(%error, signature = %sig.signature, "fix dispatch failed");
                }
            }
        }

        let seeded_policy = self.seed_policy_from_rca(&sig, &rca).await;

        Ok(AbsorptionOutcome::Analyzed {
            simulated_policy,
            dispatched_task,
            seeded_policy,
            confidence: rca.confidence,
        })
    }

    /// Apply an enforced action to the live task. Returns a short outcome
    /// label for the evaluation record.
    async fn apply_action(
        &self,
        task: &Task,
        policy: &AbsorptionPolicy,
        action: &PolicyAction,
    ) -> Result<String> {
        match action {
            PolicyAction::Requeue {
                delay_minutes,
                priority,
            } => {
                let mut payload = task.payload.clone();
                payload.failure_classification = None;
                payload.needs_human_review = false;
                task::save_payload(&self.store, &task.id, &payload).await?;
                let next_run_at = (*delay_minutes > 0.0).then(|| {
                    stamp(Utc::now() + Duration::seconds((delay_minutes * 60.0).round() as i64))
                });
                let requeued = task::requeue_failed(
                    &self.store,
                    &task.id,
                    next_run_at.as_deref(),
                    false,
                    Priority::from_keyword(priority),
                )
                .await?;
                Ok(if requeued { "requeued" } else { "lost_race" }.to_string())
            }
            PolicyAction::Skip { reason } => {
                let mut payload = task.payload.clone();
                payload.absorbed_by_policy = Some(policy.policy_id.clone());
                payload.needs_human_review = false;
                payload
                    .extra
                    .insert("absorb_reason".to_string(), json!(reason));
                task::save_payload(&self.store, &task.id, &payload).await?;
                Ok("skipped".to_string())
            }
            PolicyAction::AdjustParams {
                adjustments,
                merge_strategy,
            } => {
                let mut payload = task.payload.clone();
                let mut params = match (merge_strategy.as_str(), payload.params.take()) {
                    ("merge", Some(Value::Object(existing))) => existing,
                    _ => serde_json::Map::new(),
                };
                for (key, value) in adjustments {
                    params.insert(key.clone(), value.clone());
                }
                payload.params = Some(Value::Object(params));
                payload.failure_classification = None;
                payload.needs_human_review = false;
                task::save_payload(&self.store, &task.id, &payload).await?;
                let requeued =
                    task::requeue_failed(&self.store, &task.id, None, false, None).await?;
                Ok(if requeued { "params_adjusted" } else { "lost_race" }.to_string())
            }
            PolicyAction::Kill { reason } => {
                let mut payload = task.payload.clone();
                payload.absorbed_by_policy = Some(policy.policy_id.clone());
                payload.needs_human_review = false;
                payload
                    .extra
                    .insert("absorb_reason".to_string(), json!(reason));
                task::save_payload(&self.store, &task.id, &payload).await?;
                Ok("killed".to_string())
            }
        }
    }

    /// Record one evaluation, logging instead of failing; the action it
    /// describes has already happened.
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        policy: &AbsorptionPolicy,
        run_id: Option<&str>,
        sig: &FailureSignature,
        mode: EvalMode,
        decision: &str,
        started: Instant,
        task_id: Option<&str>,
        details: Option<Value>,
    ) {
        let new = NewEvaluation {
            policy_id: policy.policy_id.clone(),
            run_id: run_id.map(str::to_string),
            signature: sig.signature.clone(),
            mode,
            decision: decision.to_string(),
            latency_ms: started.elapsed().as_millis() as i64,
            task_id: task_id.map(str::to_string),
            details,
        };
        if let Err(error) = record_evaluation(&self.store, &new).await {
            tracing::warn!(
                %error,
                policy_id = %policy.policy_id,
                "failed to record policy evaluation"
            );
        }
    }

    /// Seed a probation policy from an analyzer's proposed action, when the
    /// action validates and the signature has no live policy yet.
    async fn seed_policy_from_rca(
        &self,
        sig: &FailureSignature,
        rca: &RcaResult,
    ) -> Option<String> {
        let proposed = rca.proposed_action.as_ref()?;
        let validated = match validate_policy_json(proposed, false) {
            Ok(validated) => validated,
            Err(error) => {
                tracing::debug!(
                    signature = %sig.signature,
                    %error,
                    "proposed action is not a usable policy"
                );
                return None;
            }
        };
        match policy::live_policy_exists(&self.store, &sig.signature).await {
            Ok(true) => return None,
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(%error, "could not check existing policies, not seeding");
                return None;
            }
        }

        let mut policy_json = validated.normalized_json();
        if validated.confidence.is_none() {
            if let Some(map) = policy_json.as_object_mut() {
                map.insert("confidence".to_string(), json!(rca.confidence));
            }
        }
        let new = NewPolicy {
            signature: sig.signature.clone(),
            policy_type: "absorption".to_string(),
            policy_json,
            risk_level: risk_for_action(&validated.action),
            created_by: "rca_pipeline".to_string(),
        };
        match policy::create_policy(&self.store, &new).await {
            Ok(policy_id) => Some(policy_id),
            Err(error) => {
                tracing::warn!(%error, signature = %sig.signature, "failed to seed policy");
                None
            }
        }
    }

    /// One pass of the background policy upkeep: verification back-fill,
    /// then promotion, then demotion. Each job's error is absorbed so the
    /// others still run.
    pub async fn run_maintenance(&self, config: &AutonomicConfig) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();
        match evaluation::run_verification_sweep(&self.store).await {
            Ok(verified) => summary.verified = verified,
            Err(error) => tracing::warn!(%error, "verification sweep failed"),
        }
        match promotion::run_promotion_job(&self.store, config).await {
            Ok(job) => {
                summary.promoted = job.promoted;
                summary.remaining_slots = job.remaining_slots;
            }
            Err(error) => tracing::warn!(%error, "promotion job failed"),
        }
        match promotion::run_demotion_job(&self.store, config).await {
            Ok(disabled) => summary.disabled = disabled,
            Err(error) => tracing::warn!(%error, "demotion job failed"),
        }
        summary
    }

    pub fn store(&self) -> &Arc<OpsStore> {
        &self.store
    }
}

impl std::fmt::Debug for ImmuneSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmuneSystem").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rca::RcaAnalysis;
    use crate::task::{get_task, insert_task, save_payload, NewTask, TaskStatus};

    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubAnalyzer {
        result: Value,
        calls: AtomicUsize,
    }

    impl StubAnalyzer {
        fn returning(result: Value) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RootCauseAnalyzer for StubAnalyzer {
        async fn perform_rca(&self, _task: &Task, _context: &Value) -> Result<RcaAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RcaAnalysis {
                analysis: self.result.clone(),
            })
        }
    }

    /// Fails the test if analysis is ever requested.
    struct NoRcaExpected;

    #[async_trait]
    impl RootCauseAnalyzer for NoRcaExpected {
        async fn perform_rca(&self, _task: &Task, _context: &Value) -> Result<RcaAnalysis> {
            panic!("rca must not run when an active policy enforces");
        }
    }

    struct StubDispatch {
        dispatched: Mutex<Vec<String>>,
    }

    impl StubDispatch {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dispatched: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DevDispatch for StubDispatch {
        async fn dispatch_fix(
            &self,
            failed_task: &Task,
            _rca: &RcaResult,
            signature: &str,
        ) -> Result<String> {
            self.dispatched
                .lock()
                .unwrap()
                .push(failed_task.id.clone());
            Ok(format!("fix-{signature}"))
        }
    }

    async fn setup() -> Arc<OpsStore> {
        let path =
            std::env::temp_dir().join(format!("autonomic_immune_{}.db", uuid::Uuid::new_v4()));
        OpsStore::connect(&path).await.unwrap()
    }

    async fn failed_task(store: &OpsStore) -> Task {
        let id = insert_task(
            store,
            &NewTask {
                title: "exporter".to_string(),
                status: TaskStatus::Failed,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        get_task(store, &id).await.unwrap().unwrap()
    }

    /// Signature a default-payload failed task maps to.
    fn default_sig() -> FailureSignature {
        FailureSignature::derive("execution", "generic", "unknown")
    }

    async fn seed_policy_for_default_task(store: &OpsStore, action_json: Value) -> String {
        policy::create_policy(
            store,
            &NewPolicy {
                signature: default_sig().signature,
                policy_type: "absorption".to_string(),
                policy_json: action_json,
                risk_level: RiskLevel::Low,
                created_by: "test".to_string(),
            },
        )
        .await
        .unwrap()
    }

    // -- analysis path --

    #[tokio::test]
    async fn test_confident_rca_dispatches_and_seeds_policy() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let analyzer = StubAnalyzer::returning(json!({
            "root_cause": "missing env var",
            "proposed_fix": "set EXPORT_BUCKET before launch",
            "confidence": 0.9,
            "proposed_action": { "action": "requeue", "delay_minutes": 5 },
        }));
        let dispatch = StubDispatch::new();
        let immune = ImmuneSystem::new(store.clone(), analyzer.clone(), dispatch.clone());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed {
            simulated_policy,
            dispatched_task,
            seeded_policy,
            confidence,
        } = outcome
        else {
            panic!("expected analysis outcome");
        };
        assert!(simulated_policy.is_none());
        assert_eq!(confidence, 0.9);
        assert_eq!(dispatch.count(), 1);
        assert_eq!(
            dispatched_task.as_deref(),
            Some(format!("fix-{}", default_sig().signature).as_str())
        );

        let seeded = policy::get_policy(&store, &seeded_policy.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seeded.status, PolicyStatus::Probation);
        assert_eq!(seeded.created_by, "rca_pipeline");
        assert_eq!(seeded.risk_level, RiskLevel::Low);

        let record = signature::get_signature(&store, &default_sig().signature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.occurrence_count, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_rca_does_not_dispatch() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let analyzer = StubAnalyzer::returning(json!({
            "root_cause": "unclear",
            "confidence": 0.4,
        }));
        let dispatch = StubDispatch::new();
        let immune = ImmuneSystem::new(store.clone(), analyzer, dispatch.clone());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed {
            dispatched_task,
            seeded_policy,
            ..
        } = outcome
        else {
            panic!("expected analysis outcome");
        };
        assert!(dispatched_task.is_none());
        assert!(seeded_policy.is_none());
        assert_eq!(dispatch.count(), 0);
    }

    #[tokio::test]
    async fn test_second_occurrence_simulates_earlier_seed() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let analyzer = StubAnalyzer::returning(json!({
            "root_cause": "flaky upstream",
            "confidence": 0.8,
            "proposed_action": { "action": "requeue", "delay_minutes": 2 },
        }));
        let dispatch = StubDispatch::new();
        let immune = ImmuneSystem::new(store.clone(), analyzer.clone(), dispatch.clone());
        let task = failed_task(&store).await;

        let first = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed { seeded_policy, .. } = first else {
            panic!("expected analysis outcome");
        };
        let seeded = seeded_policy.unwrap();

        let second = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed {
            simulated_policy,
            seeded_policy,
            ..
        } = second
        else {
            panic!("expected analysis outcome");
        };
        // The earlier seed now simulates, and no duplicate gets created.
        assert_eq!(simulated_policy.as_deref(), Some(seeded.as_str()));
        assert!(seeded_policy.is_none());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);

        let record = signature::get_signature(&store, &default_sig().signature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.occurrence_count, 2);
    }

    // -- enforcement --

    #[tokio::test]
    async fn test_active_policy_enforces_without_rca() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "requeue", "delay_minutes": 10, "priority": "high" }),
        )
        .await;
        promotion::promote_to_active(&store, &policy_id)
            .await
            .unwrap();

        let immune = ImmuneSystem::new(store.clone(), Arc::new(NoRcaExpected), StubDispatch::new());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, Some("run-7"), &config)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AbsorptionOutcome::Enforced {
                policy_id: policy_id.clone(),
                applied: "requeued".to_string(),
            }
        );

        let task = get_task(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, crate::task::Priority::P0);
        assert_eq!(task.retry_count, 0);
        assert!(task.next_run_at.is_some());

        let evals = evaluation::evaluations_for_policy(&store, &policy_id)
            .await
            .unwrap();
        assert_eq!(evals.len(), 2); // promote + enforce
        let enforce = evals
            .iter()
            .find(|e| e.mode == EvalMode::Enforce)
            .expect("enforce evaluation");
        assert_eq!(enforce.decision, "applied");
        assert_eq!(enforce.task_id(), Some(task.id.as_str()));
        assert_eq!(enforce.run_id.as_deref(), Some("run-7"));
    }

    #[tokio::test]
    async fn test_invalid_active_policy_rejects_and_falls_through() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "requeue", "delay_minutes": 1 }),
        )
        .await;
        promotion::promote_to_active(&store, &policy_id)
            .await
            .unwrap();
        // Valid when lenient, rejected under enforcement's strict validation.
        sqlx::query("UPDATE absorption_policies SET policy_json = ? WHERE policy_id = ?")
            .bind(
                json!({ "action": "requeue", "delay_minutes": 1, "priority": "normal", "confidence": 0.2 })
                    .to_string(),
            )
            .bind(&policy_id)
            .execute(store.pool())
            .await
            .unwrap();

        let analyzer = StubAnalyzer::returning(json!({ "root_cause": "x", "confidence": 0.1 }));
        let immune = ImmuneSystem::new(store.clone(), analyzer.clone(), StubDispatch::new());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        assert!(matches!(outcome, AbsorptionOutcome::Analyzed { .. }));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);

        // The task was not touched.
        let task = get_task(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let evals = evaluation::evaluations_for_policy(&store, &policy_id)
            .await
            .unwrap();
        let rejected = evals
            .iter()
            .find(|e| e.mode == EvalMode::Enforce)
            .expect("enforce evaluation");
        assert_eq!(rejected.decision, "rejected");
    }

    #[tokio::test]
    async fn test_skip_and_kill_leave_task_failed_with_marker() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "skip", "reason": "known benign timeout" }),
        )
        .await;
        promotion::promote_to_active(&store, &policy_id)
            .await
            .unwrap();

        let immune = ImmuneSystem::new(store.clone(), Arc::new(NoRcaExpected), StubDispatch::new());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AbsorptionOutcome::Enforced {
                policy_id: policy_id.clone(),
                applied: "skipped".to_string(),
            }
        );
        let task = get_task(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.payload.absorbed_by_policy.as_deref(), Some(policy_id.as_str()));
        assert_eq!(
            task.payload.extra.get("absorb_reason"),
            Some(&json!("known benign timeout"))
        );
    }

    #[tokio::test]
    async fn test_adjust_params_merges_and_requeues() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({
                "action": "adjust_params",
                "adjustments": { "model": "small", "timeout_secs": 120 },
            }),
        )
        .await;
        promotion::promote_to_active(&store, &policy_id)
            .await
            .unwrap();

        let immune = ImmuneSystem::new(store.clone(), Arc::new(NoRcaExpected), StubDispatch::new());
        let task = failed_task(&store).await;
        let mut payload = task.payload.clone();
        payload.params = Some(json!({ "model": "large", "retries": 1 }));
        save_payload(&store, &task.id, &payload).await.unwrap();
        let task = get_task(&store, &task.id).await.unwrap().unwrap();

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AbsorptionOutcome::Enforced {
                policy_id,
                applied: "params_adjusted".to_string(),
            }
        );
        let task = get_task(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(
            task.payload.params,
            Some(json!({ "model": "small", "retries": 1, "timeout_secs": 120 }))
        );
    }

    // -- probation --

    #[tokio::test]
    async fn test_probation_policy_simulates_without_touching_task() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "skip", "reason": "suspected benign" }),
        )
        .await;

        let analyzer = StubAnalyzer::returning(json!({ "root_cause": "x", "confidence": 0.2 }));
        let immune = ImmuneSystem::new(store.clone(), analyzer.clone(), StubDispatch::new());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed {
            simulated_policy, ..
        } = outcome
        else {
            panic!("expected analysis outcome");
        };
        assert_eq!(simulated_policy.as_deref(), Some(policy_id.as_str()));
        // Probation never mutates the task, and analysis still ran.
        let task = get_task(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.payload.absorbed_by_policy.is_none());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);

        let evals = evaluation::evaluations_for_policy(&store, &policy_id)
            .await
            .unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].mode, EvalMode::Simulate);
        assert_eq!(evals[0].decision, "simulated");
    }

    #[tokio::test]
    async fn test_invalid_probation_policy_logs_event_and_continues() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "skip", "reason": "placeholder" }),
        )
        .await;
        sqlx::query("UPDATE absorption_policies SET policy_json = ? WHERE policy_id = ?")
            .bind(json!({ "action": "explode" }).to_string())
            .bind(&policy_id)
            .execute(store.pool())
            .await
            .unwrap();

        let analyzer = StubAnalyzer::returning(json!({ "root_cause": "x", "confidence": 0.2 }));
        let immune = ImmuneSystem::new(store.clone(), analyzer.clone(), StubDispatch::new());
        let task = failed_task(&store).await;

        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        let AbsorptionOutcome::Analyzed {
            simulated_policy, ..
        } = outcome
        else {
            panic!("expected analysis outcome");
        };
        assert!(simulated_policy.is_none());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);

        let events = store
            .recent_events(Some("probation_policy_validation_failed"), 5)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    // -- maintenance --

    #[tokio::test]
    async fn test_maintenance_promotes_proven_policy() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "requeue", "delay_minutes": 5 }),
        )
        .await;
        for _ in 0..2 {
            let id = record_evaluation(
                &store,
                &NewEvaluation {
                    policy_id: policy_id.clone(),
                    run_id: None,
                    signature: default_sig().signature,
                    mode: EvalMode::Simulate,
                    decision: "simulated".to_string(),
                    latency_ms: 1,
                    task_id: None,
                    details: None,
                },
            )
            .await
            .unwrap();
            sqlx::query("UPDATE policy_evaluations SET verification_result = 'pass' WHERE id = ?")
                .bind(&id)
                .execute(store.pool())
                .await
                .unwrap();
        }

        let immune = ImmuneSystem::new(store.clone(), Arc::new(NoRcaExpected), StubDispatch::new());
        let summary = immune.run_maintenance(&config).await;
        assert_eq!(summary.promoted, vec![policy_id.clone()]);
        assert!(summary.disabled.is_empty());

        let promoted = policy::get_policy(&store, &policy_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(promoted.status, PolicyStatus::Active);
    }

    #[tokio::test]
    async fn test_skip_enforcement_is_not_verified_against_the_policy() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let policy_id = seed_policy_for_default_task(
            &store,
            json!({ "action": "skip", "reason": "known benign timeout" }),
        )
        .await;
        promotion::promote_to_active(&store, &policy_id)
            .await
            .unwrap();

        let immune = ImmuneSystem::new(store.clone(), Arc::new(NoRcaExpected), StubDispatch::new());
        let task = failed_task(&store).await;
        let outcome = immune
            .absorb_task_failure(&task, None, &config)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AbsorptionOutcome::Enforced {
                policy_id: policy_id.clone(),
                applied: "skipped".to_string(),
            }
        );

        // Skipping leaves the task in its absorbed failed state. That state
        // predates the enforce evaluation, so maintenance must not read it
        // as the policy failing.
        let summary = immune.run_maintenance(&config).await;
        assert_eq!(summary.verified, 0);
        assert!(summary.disabled.is_empty());

        let evals = evaluation::evaluations_for_policy(&store, &policy_id)
            .await
            .unwrap();
        let enforce = evals
            .iter()
            .find(|e| e.mode == EvalMode::Enforce)
            .expect("enforce evaluation");
        assert_eq!(enforce.verification_result, VerificationResult::Unknown);

        let policy = policy::get_policy(&store, &policy_id).await.unwrap().unwrap();
        assert_eq!(policy.status, PolicyStatus::Active);
    }
}
