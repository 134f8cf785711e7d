//! The autonomic tick driver.
//!
//! One [`CycleRunner`] owns every subsystem and walks them in a fixed order
//! each tick: stuck-run sweep, quarantine release, failure intake, immune
//! maintenance, health checks, resource snapshot, heartbeat. Every step is
//! fail-open: an error is logged at its call site and the rest of the cycle
//! still runs. An atomic guard drops ticks that fire while the previous
//! cycle is still working instead of queueing them.

use crate::classifier;
use crate::config::AutonomicConfig;
use crate::health::{HealthLevel, HealthMonitor};
use crate::immune::ImmuneSystem;
use crate::initiative::{InitiativeOrchestrator, OrchestratorReport};
use crate::quarantine::{QuarantineManager, SystemicReport};
use crate::rca::WorkerPool;
use crate::store::{now_stamp, OpsStore};
use crate::stuck::{EscalationOutcome, StuckMonitor};
use crate::task::{self, Task};

use anyhow::Result;
use arc_swap::ArcSwap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// ops_state key carrying the stamp of the last completed cycle.
const HEARTBEAT_KEY: &str = "autonomic_heartbeat";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Stuck runs escalated (requeued or quarantined, lost races excluded).
    pub escalated_runs: usize,
    pub released_from_quarantine: usize,
    /// Failed tasks that received a fresh classification this cycle.
    pub failures_classified: usize,
    /// Failures routed into the immune system by the systemic check.
    pub failures_absorbed: usize,
    pub tasks_requeued: usize,
    pub tasks_quarantined: usize,
    pub policies_promoted: usize,
    pub policies_disabled: usize,
    pub health: Option<HealthLevel>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Another cycle still held the guard; nothing ran.
    Skipped,
    Completed(CycleReport),
}

/// Clears the active flag when the cycle future finishes or is dropped
/// mid-await.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Owns the subsystems and drives them once per tick.
pub struct CycleRunner {
    store: Arc<OpsStore>,
    quarantine: QuarantineManager,
    stuck: StuckMonitor,
    immune: ImmuneSystem,
    health: HealthMonitor,
    orchestrator: InitiativeOrchestrator,
    pool: Arc<dyn WorkerPool>,
    cycle_active: AtomicBool,
}

impl CycleRunner {
    pub fn new(store: Arc<OpsStore>, immune: ImmuneSystem, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            quarantine: QuarantineManager::new(store.clone()),
            stuck: StuckMonitor::new(store.clone()),
            health: HealthMonitor::new(store.clone()),
            orchestrator: InitiativeOrchestrator::new(store.clone()),
            store,
            immune,
            pool,
            cycle_active: AtomicBool::new(false),
        }
    }

    /// Run one full cycle, unless the previous one is still running.
    pub async fn run_cycle(&self, config: &AutonomicConfig) -> CycleOutcome {
        if self
            .cycle_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("previous autonomic cycle still running, skipping tick");
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard {
            flag: &self.cycle_active,
        };

        CycleOutcome::Completed(self.run_cycle_inner(config).await)
    }

    /// One pass of the initiative orchestrator over all active initiatives.
    /// Runs on its own cadence, separate from the main cycle.
    pub async fn run_initiative_pass(&self, config: &AutonomicConfig) -> OrchestratorReport {
        self.orchestrator.run_orchestrator_pass(config).await
    }

    async fn run_cycle_inner(&self, config: &AutonomicConfig) -> CycleReport {
        let mut report = CycleReport::default();

        match self.stuck.sweep(&self.quarantine, config).await {
            Ok(outcomes) => {
                report.escalated_runs = outcomes
                    .iter()
                    .filter(|outcome| !matches!(outcome, EscalationOutcome::LostRace { .. }))
                    .count();
            }
            Err(error) => tracing::warn!(%error, "stuck run sweep failed"),
        }

        match self.quarantine.check_expired_quarantine_tasks().await {
            Ok(released) => report.released_from_quarantine = released.len(),
            Err(error) => tracing::warn!(%error, "quarantine release check failed"),
        }

        if let Err(error) = self.intake_failures(config, &mut report).await {
            tracing::warn!(%error, "failure intake failed");
        }

        let maintenance = self.immune.run_maintenance(config).await;
        report.policies_promoted = maintenance.promoted.len();
        report.policies_disabled = maintenance.disabled.len();

        report.health = Some(self.health.run_checks(config).await.level);

        self.record_resource_snapshot().await;

        if let Err(error) = self.store.set_state(HEARTBEAT_KEY, now_stamp()).await {
            tracing::warn!(%error, "failed to record cycle heartbeat");
        }

        tracing::debug!(
            escalated = report.escalated_runs,
            released = report.released_from_quarantine,
            classified = report.failures_classified,
            absorbed = report.failures_absorbed,
            requeued = report.tasks_requeued,
            quarantined = report.tasks_quarantined,
            "autonomic cycle complete"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Failure intake
    // -----------------------------------------------------------------------

    /// Classify and disposition every recently failed task that has no
    /// stored classification yet. A stored classification means an earlier
    /// cycle already handled the failure.
    ///
    /// When the window shows a systemic pattern, failures of the spiking
    /// class go to the immune system instead of the retry path: requeueing
    /// them would feed the spike.
    async fn intake_failures(
        &self,
        config: &AutonomicConfig,
        report: &mut CycleReport,
    ) -> Result<()> {
        let systemic = self.quarantine.check_systemic_failure_pattern(config).await?;

        let failed = task::failed_tasks_since(&self.store, config.systemic_window_mins).await?;
        for task_record in failed {
            if task_record.payload.failure_classification.is_some() {
                continue;
            }
            if let Err(error) = self
                .intake_one(&task_record, &systemic, config, report)
                .await
            {
                tracing::warn!(task_id = %task_record.id, %error, "failure intake for task failed");
            }
        }
        Ok(())
    }

    async fn intake_one(
        &self,
        task_record: &Task,
        systemic: &SystemicReport,
        config: &AutonomicConfig,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(classification) =
            classifier::handle_task_failure(&self.store, &task_record.id, config).await?
        else {
            // The task moved out of failed under us.
            return Ok(());
        };
        report.failures_classified += 1;

        if systemic.is_systemic && systemic.failure_class == Some(classification.class) {
            // Absorption fingerprints off the classification, which was
            // stored after this task was loaded.
            let mut absorbed = task_record.clone();
            absorbed.payload.failure_classification = Some(classification);
            self.immune
                .absorb_task_failure(&absorbed, None, config)
                .await?;
            report.failures_absorbed += 1;
            return Ok(());
        }

        if !classification.should_retry {
            // Auth and resource failures sit failed with the human-review
            // flag until an operator intervenes.
            return Ok(());
        }

        let exhausted = classification.class.counts_against_retries()
            && task_record.retry_count >= i64::from(config.max_retries);
        if exhausted {
            let details = json!({
                "class": classification.class.to_string(),
                "retry_count": task_record.retry_count,
            });
            let quarantined = self
                .quarantine
                .quarantine_task(&task_record.id, "repeated_failure", Some(&details), config)
                .await?;
            if quarantined {
                report.tasks_quarantined += 1;
            }
            return Ok(());
        }

        // Drop the stored classification before requeueing so the next
        // failure is judged fresh.
        task::save_payload(&self.store, &task_record.id, &task_record.payload).await?;
        let requeued = task::requeue_failed(
            &self.store,
            &task_record.id,
            classification.next_run_at.as_deref(),
            classification.class.counts_against_retries(),
            None,
        )
        .await?;
        if requeued {
            report.tasks_requeued += 1;
        } else {
            tracing::debug!(task_id = %task_record.id, "task no longer failed, requeue skipped");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resource snapshot
    // -----------------------------------------------------------------------

    async fn record_resource_snapshot(&self) {
        let active = self.pool.active_count();
        let seats = self.pool.max_seats();
        let details = json!({ "active": active, "max_seats": seats });
        if let Err(error) = self
            .store
            .log_event(
                "resource_snapshot",
                &format!("{active}/{seats} executor seats in use"),
                Some(&details),
            )
            .await
        {
            tracing::warn!(%error, "failed to record resource snapshot");
        }
    }
}

impl std::fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleRunner").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

/// Spawn the autonomic loop as a background task.
///
/// The loop re-reads the config snapshot every iteration, so thresholds and
/// cadences change without a restart. A disabled config idles the loop
/// without touching the database.
pub fn spawn_autonomic_loop(
    runner: Arc<CycleRunner>,
    config: Arc<ArcSwap<AutonomicConfig>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_autonomic_loop(runner, config))
}

async fn run_autonomic_loop(runner: Arc<CycleRunner>, config: Arc<ArcSwap<AutonomicConfig>>) {
    tracing::info!("autonomic loop started");
    let mut last_orchestrator_pass: Option<Instant> = None;

    loop {
        let snapshot = current(&config);
        if !snapshot.enabled {
            tokio::time::sleep(Duration::from_secs(60)).await;
            continue;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(snapshot.tick_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let snapshot = current(&config);
            if !snapshot.enabled {
                break;
            }

            runner.run_cycle(&snapshot).await;

            let orchestrator_due = last_orchestrator_pass
                .map(|at| {
                    at.elapsed() >= Duration::from_secs(snapshot.orchestrator_interval_secs)
                })
                .unwrap_or(true);
            if orchestrator_due {
                let pass = runner.run_initiative_pass(&snapshot).await;
                tracing::debug!(
                    stepped = pass.stepped,
                    errors = pass.errors,
                    "initiative orchestrator pass complete"
                );
                last_orchestrator_pass = Some(Instant::now());
            }
        }
    }
}

fn current(config: &ArcSwap<AutonomicConfig>) -> AutonomicConfig {
    (**config.load()).clone()
}
