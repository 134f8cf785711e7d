//! Initiative orchestration.
//!
//! An initiative is a composite work item driven through a plan, review,
//! dev, verify lifecycle. Each phase delegates the actual work to child
//! tasks (planning, decomposition review, development, verification) and
//! the orchestrator only decides, once per pass, what the phase needs next:
//! create a child, wait for one, move the phase, or end the initiative.
//!
//! The decision itself ([`next_step_for_initiative`]) is a pure function of
//! the initiative row and its child tasks, so every branch is testable
//! without a database. Phase mutation goes through a single conditional
//! UPDATE; a concurrent pass that already moved the phase turns the write
//! into a no-op, never an error.

use crate::config::AutonomicConfig;
use crate::store::{now_stamp, OpsStore};
use crate::task::{self, NewTask, Priority, Task, TaskStatus};

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::Arc;

/// Child task types the orchestrator creates and inspects.
pub const PLAN_TASK: &str = "initiative_plan";
pub const REVIEW_TASK: &str = "decomp_review";
pub const DEV_TASK: &str = "dev";
pub const VERIFY_TASK: &str = "initiative_verify";

// ---------------------------------------------------------------------------
// Phases and statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Review,
    Dev,
    Verify,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Plan => "plan",
            Phase::Review => "review",
            Phase::Dev => "dev",
            Phase::Verify => "verify",
        };
        write!(f, "{s}")
    }
}

pub fn parse_phase(s: &str) -> Result<Phase> {
    Ok(match s {
        "plan" => Phase::Plan,
        "review" => Phase::Review,
        "dev" => Phase::Dev,
        "verify" => Phase::Verify,
        other => bail!("unknown initiative phase: {other}"),
    })
}

/// The complete transition table. `None` is natural completion, reachable
/// only from verify. Anything not listed is rejected without a write.
pub fn phase_transition_allowed(from: Phase, to: Option<Phase>) -> bool {
    matches!(
        (from, to),
        (Phase::Plan, Some(Phase::Review))
            | (Phase::Review, Some(Phase::Dev))
            | (Phase::Review, Some(Phase::Plan))
            | (Phase::Dev, Some(Phase::Verify))
            | (Phase::Dev, Some(Phase::Plan))
            | (Phase::Verify, Some(Phase::Dev))
            | (Phase::Verify, None)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiativeStatus {
    Active,
    Completed,
    Cancelled,
    Blocked,
}

impl std::fmt::Display for InitiativeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InitiativeStatus::Active => "active",
            InitiativeStatus::Completed => "completed",
            InitiativeStatus::Cancelled => "cancelled",
            InitiativeStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

pub fn parse_initiative_status(s: &str) -> Result<InitiativeStatus> {
    Ok(match s {
        "active" => InitiativeStatus::Active,
        "completed" => InitiativeStatus::Completed,
        "cancelled" => InitiativeStatus::Cancelled,
        "blocked" => InitiativeStatus::Blocked,
        other => bail!("unknown initiative status: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Initiative {
    pub id: String,
    pub name: String,
    pub project_type: String,
    pub description: Option<String>,
    pub status: InitiativeStatus,
    pub current_phase: Option<Phase>,
    pub execution_mode: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct InitiativeRow {
    id: String,
    name: String,
    project_type: String,
    description: Option<String>,
    status: String,
    current_phase: Option<String>,
    execution_mode: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl InitiativeRow {
    fn into_initiative(self) -> Result<Initiative> {
        Ok(Initiative {
            status: parse_initiative_status(&self.status)?,
            current_phase: self.current_phase.as_deref().map(parse_phase).transpose()?,
            id: self.id,
            name: self.name,
            project_type: self.project_type,
            description: self.description,
            execution_mode: self.execution_mode,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

const INITIATIVE_COLUMNS: &str = "id, name, project_type, description, status, current_phase, \
     execution_mode, created_at, updated_at, completed_at";

/// Fields for a new initiative. Every initiative starts active in plan.
#[derive(Debug, Clone)]
pub struct NewInitiative {
    pub name: String,
    pub description: Option<String>,
    pub execution_mode: String,
}

impl Default for NewInitiative {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            execution_mode: "autonomous".to_string(),
        }
    }
}

pub async fn create_initiative(store: &OpsStore, new: &NewInitiative) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO projects (id, name, project_type, description, status, current_phase, execution_mode)
         VALUES (?, ?, 'initiative', ?, 'active', 'plan', ?)",
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.execution_mode)
    .execute(store.pool())
    .await
    .context("insert initiative")?;
    Ok(id)
}

pub async fn get_initiative(store: &OpsStore, initiative_id: &str) -> Result<Option<Initiative>> {
    let row: Option<InitiativeRow> = sqlx::query_as(&format!(
        "SELECT {INITIATIVE_COLUMNS} FROM projects WHERE id = ?"
    ))
    .bind(initiative_id)
    .fetch_optional(store.pool())
    .await
    .context("load initiative")?;
    row.map(InitiativeRow::into_initiative).transpose()
}

/// Initiatives the orchestrator drives: active, of initiative type.
pub async fn active_initiatives(store: &OpsStore) -> Result<Vec<Initiative>> {
    let rows: Vec<InitiativeRow> = sqlx::query_as(&format!(
        "SELECT {INITIATIVE_COLUMNS} FROM projects
         WHERE status = 'active' AND project_type = 'initiative'
         ORDER BY created_at ASC"
    ))
    .fetch_all(store.pool())
    .await
    .context("load active initiatives")?;
    rows.into_iter().map(InitiativeRow::into_initiative).collect()
}

// ---------------------------------------------------------------------------
// Decision function
// ---------------------------------------------------------------------------

/// What one orchestrator pass should do for one initiative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// A child task is in flight; check again next pass.
    Wait,
    /// Create a child task of this type.
    CreateTask(&'static str),
    /// Move the phase along the transition table.
    Transition(Phase),
    /// Review approved the decomposition: release drafts and enter dev.
    ApproveAndStartDev,
    /// Dev has pending drafts and nothing running; release them.
    PromoteDrafts,
    /// Review rejected the decomposition outright.
    CancelInitiative,
    /// Verification passed; close the initiative out.
    CompleteInitiative,
}

fn in_flight(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Queued | TaskStatus::InProgress)
}

fn of_type<'a>(children: &'a [Task], task_type: &str) -> Vec<&'a Task> {
    children
        .iter()
        .filter(|t| t.task_type == task_type)
        .collect()
}

fn latest_completed<'a>(tasks: &[&'a Task]) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .max_by(|a, b| a.finished_at().cmp(b.finished_at()))
        .copied()
}

/// Decide the next step for one initiative from its children.
///
/// Pure and side-effect free; the caller applies the step. A completed
/// child's output only counts for the round it belongs to: a completed
/// plan that a newer completed review has already judged, a review that
/// predates the newest completed plan, and a verify verdict older than the
/// newest finished dev task are all treated as consumed.
pub fn next_step_for_initiative(
    initiative: &Initiative,
    children: &[Task],
    config: &AutonomicConfig,
) -> NextStep {
    let Some(phase) = initiative.current_phase else {
        return NextStep::Wait;
    };
    match phase {
        Phase::Plan => plan_step(children),
        Phase::Review => review_step(children),
        Phase::Dev => dev_step(children, config),
        Phase::Verify => verify_step(children),
    }
}

fn plan_step(children: &[Task]) -> NextStep {
    let plans = of_type(children, PLAN_TASK);
    let reviews = of_type(children, REVIEW_TASK);

    if let Some(done) = latest_completed(&plans) {
        let consumed = latest_completed(&reviews)
            .is_some_and(|review| review.finished_at() > done.finished_at());
        if !consumed {
            return NextStep::Transition(Phase::Review);
        }
    }
    if plans.iter().copied().any(in_flight) {
        return NextStep::Wait;
    }
    NextStep::CreateTask(PLAN_TASK)
}

fn review_step(children: &[Task]) -> NextStep {
    let reviews = of_type(children, REVIEW_TASK);
    let plans = of_type(children, PLAN_TASK);

    if let Some(done) = latest_completed(&reviews) {
        let stale = latest_completed(&plans)
            .is_some_and(|plan| plan.finished_at() > done.finished_at());
        if !stale {
            return match done.payload.verdict.as_deref() {
                Some("approved") => NextStep::ApproveAndStartDev,
                Some("needs_revision") => NextStep::Transition(Phase::Plan),
                Some("rejected") => NextStep::CancelInitiative,
                // A completed review without a usable verdict stalls the
                // initiative; the health monitor surfaces the stall.
                _ => NextStep::Wait,
            };
        }
    }
    if reviews.iter().copied().any(in_flight) {
        return NextStep::Wait;
    }
    NextStep::CreateTask(REVIEW_TASK)
}

fn dev_step(children: &[Task], config: &AutonomicConfig) -> NextStep {
    let devs = of_type(children, DEV_TASK);

    // Replan health check comes before everything, including in-flight work.
    if devs.len() as i64 >= config.replan_window
        && recent_dev_failures(&devs, config.replan_window as usize)
            >= config.replan_failure_threshold
    {
        return NextStep::Transition(Phase::Plan);
    }
    if devs.iter().copied().any(in_flight) {
        return NextStep::Wait;
    }
    if devs.iter().any(|t| t.status == TaskStatus::Draft) {
        return NextStep::PromoteDrafts;
    }
    NextStep::Transition(Phase::Verify)
}

/// Failures among the `window` most recently finished dev tasks.
fn recent_dev_failures(devs: &[&Task], window: usize) -> i64 {
    let mut finished: Vec<&&Task> = devs
        .iter()
        .filter(|t| {
            matches!(
                t.status,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Quarantined
                    | TaskStatus::Cancelled
            )
        })
        .collect();
    finished.sort_by(|a, b| b.finished_at().cmp(a.finished_at()));
    finished
        .iter()
        .take(window)
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Quarantined))
        .count() as i64
}

fn verify_step(children: &[Task]) -> NextStep {
    let verifies = of_type(children, VERIFY_TASK);
    let devs = of_type(children, DEV_TASK);

    if let Some(done) = latest_completed(&verifies) {
        // Dev work finishing after the verdict invalidates it.
        let stale = devs
            .iter()
            .filter(|t| !in_flight(t) && t.status != TaskStatus::Draft)
            .any(|dev| dev.finished_at() > done.finished_at());
        if !stale {
            return if done.payload.all_dod_passed == Some(true) {
                NextStep::CompleteInitiative
            } else {
                NextStep::Transition(Phase::Dev)
            };
        }
    }
    if verifies.iter().copied().any(in_flight) {
        return NextStep::Wait;
    }
    NextStep::CreateTask(VERIFY_TASK)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Result of a guarded phase write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Another pass already moved the phase. A no-op, never an error.
    LostRace,
    /// The transition is not in the table. Nothing was written.
    Rejected,
}

/// Move an initiative's phase with a compare-and-swap on the current phase.
///
/// `to = None` is completion: it also stamps `completed_at` and flips the
/// lifecycle status in the same statement.
pub async fn handle_phase_transition(
    store: &OpsStore,
    initiative_id: &str,
    from: Phase,
    to: Option<Phase>,
) -> Result<TransitionOutcome> {
    if !phase_transition_allowed(from, to) {
        tracing::warn!(initiative_id, %from, ?to, "illegal phase transition rejected");
        return Ok(TransitionOutcome::Rejected);
    }

    let result = match to {
        Some(phase) => sqlx::query(
            "UPDATE projects SET current_phase = ?, updated_at = datetime('now')
             WHERE id = ? AND current_phase = ?",
        )
        .bind(phase.to_string())
        .bind(initiative_id)
        .bind(from.to_string())
        .execute(store.pool())
        .await
        .context("apply phase transition")?,
        None => sqlx::query(
            "UPDATE projects SET current_phase = NULL, status = 'completed',
                    completed_at = datetime('now'), updated_at = datetime('now')
             WHERE id = ? AND current_phase = ?",
        )
        .bind(initiative_id)
        .bind(from.to_string())
        .execute(store.pool())
        .await
        .context("complete initiative")?,
    };
    if result.rows_affected() == 0 {
        tracing::debug!(initiative_id, %from, "phase already moved by another pass");
        return Ok(TransitionOutcome::LostRace);
    }

    let to_label = to.map(|p| p.to_string());
    if let Err(error) = store
        .log_event(
            "initiative_phase_transition",
            &format!(
                "initiative {initiative_id}: {from} -> {}",
                to_label.as_deref().unwrap_or("completed")
            ),
            Some(&json!({
                "initiative_id": initiative_id,
                "from": from.to_string(),
                "to": to_label,
                "timestamp": now_stamp(),
            })),
        )
        .await
    {
        tracing::warn!(%error, initiative_id, "failed to log phase transition");
    }
    tracing::info!(initiative_id, %from, ?to, "initiative phase moved");
    Ok(TransitionOutcome::Applied)
}

/// Release an initiative's draft children for dispatch. Returns how many
/// moved.
pub async fn promote_draft_tasks(store: &OpsStore, initiative_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'queued', updated_at = datetime('now')
         WHERE project_id = ? AND status = 'draft'",
    )
    .bind(initiative_id)
    .execute(store.pool())
    .await
    .context("promote draft tasks")?;
    Ok(result.rows_affected())
}

/// Cancel an initiative and its not-yet-running children. Running children
/// belong to the executor and are left to finish.
pub async fn cancel_initiative(
    store: &OpsStore,
    initiative_id: &str,
    reason: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE projects SET status = 'cancelled', updated_at = datetime('now')
         WHERE id = ? AND status = 'active'",
    )
    .bind(initiative_id)
    .execute(store.pool())
    .await
    .context("cancel initiative")?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE tasks SET status = 'cancelled', updated_at = datetime('now')
         WHERE project_id = ? AND status IN ('draft', 'queued')",
    )
    .bind(initiative_id)
    .execute(store.pool())
    .await
    .context("cancel pending children")?;

    if let Err(error) = store
        .log_event(
            "initiative_cancelled",
            &format!("initiative {initiative_id} cancelled ({reason})"),
            Some(&json!({ "initiative_id": initiative_id, "reason": reason })),
        )
        .await
    {
        tracing::warn!(%error, initiative_id, "failed to log cancellation");
    }
    tracing::warn!(initiative_id, reason, "initiative cancelled");
    Ok(true)
}

// ---------------------------------------------------------------------------
// Orchestrator pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorReport {
    pub stepped: usize,
    pub errors: usize,
}

/// Drives every active initiative one decision forward per pass.
pub struct InitiativeOrchestrator {
    store: Arc<OpsStore>,
}

impl InitiativeOrchestrator {
    pub fn new(store: Arc<OpsStore>) -> Self {
        Self { store }
    }

    /// One pass over all active initiatives. A broken initiative is logged
    /// and skipped; it never blocks the rest.
    pub async fn run_orchestrator_pass(&self, config: &AutonomicConfig) -> OrchestratorReport {
        let initiatives = match active_initiatives(&self.store).await {
            Ok(list) => list,
            Err(error) => {
                tracing::warn!(%error, "failed to load active initiatives");
                return OrchestratorReport::default();
            }
        };

        let mut report = OrchestratorReport::default();
        for initiative in initiatives {
            match self.step_initiative(&initiative, config).await {
                Ok(_) => report.stepped += 1,
                Err(error) => {
                    tracing::warn!(
                        initiative_id = %initiative.id,
                        %error,
                        "initiative step failed"
                    );
                    report.errors += 1;
                }
            }
        }
        report
    }

    async fn step_initiative(
        &self,
        initiative: &Initiative,
        config: &AutonomicConfig,
    ) -> Result<NextStep> {
        let children = task::tasks_for_project(&self.store, &initiative.id).await?;
        let step = next_step_for_initiative(initiative, &children, config);
        tracing::debug!(
            initiative_id = %initiative.id,
            phase = ?initiative.current_phase,
            ?step,
            "orchestrator decision"
        );
        self.apply_step(initiative, &step).await?;
        Ok(step)
    }

    async fn apply_step(&self, initiative: &Initiative, step: &NextStep) -> Result<()> {
        let Some(phase) = initiative.current_phase else {
            return Ok(());
        };
        match step {
            NextStep::Wait => {}
            NextStep::CreateTask(task_type) => {
                self.create_child_task(initiative, task_type).await?;
            }
            NextStep::Transition(to) => {
                handle_phase_transition(&self.store, &initiative.id, phase, Some(*to)).await?;
            }
            NextStep::ApproveAndStartDev => {
                let released = promote_draft_tasks(&self.store, &initiative.id).await?;
                tracing::info!(
                    initiative_id = %initiative.id,
                    released,
                    "decomposition approved"
                );
                handle_phase_transition(&self.store, &initiative.id, phase, Some(Phase::Dev))
                    .await?;
            }
            NextStep::PromoteDrafts => {
                promote_draft_tasks(&self.store, &initiative.id).await?;
            }
            NextStep::CancelInitiative => {
                cancel_initiative(&self.store, &initiative.id, "decomposition rejected").await?;
            }
            NextStep::CompleteInitiative => {
                handle_phase_transition(&self.store, &initiative.id, phase, None).await?;
            }
        }
        Ok(())
    }

    async fn create_child_task(&self, initiative: &Initiative, task_type: &str) -> Result<String> {
        let title = match task_type {
            PLAN_TASK => format!("Plan: {}", initiative.name),
            REVIEW_TASK => format!("Review decomposition: {}", initiative.name),
            VERIFY_TASK => format!("Verify: {}", initiative.name),
            other => format!("{other}: {}", initiative.name),
        };
        let task_id = task::insert_task(
            &self.store,
            &NewTask {
                project_id: Some(initiative.id.clone()),
                task_type: task_type.to_string(),
                title,
                priority: Priority::P1,
                status: TaskStatus::Queued,
                ..Default::default()
            },
        )
        .await?;
        tracing::info!(
            initiative_id = %initiative.id,
            task_id,
            task_type,
            "created phase task"
        );
        Ok(task_id)
    }
}

impl std::fmt::Debug for InitiativeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiativeOrchestrator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    fn fixture_initiative(phase: Option<Phase>) -> Initiative {
        Initiative {
            id: "init-1".to_string(),
            name: "nightly exports".to_string(),
            project_type: "initiative".to_string(),
            description: None,
            status: InitiativeStatus::Active,
            current_phase: phase,
            execution_mode: "autonomous".to_string(),
            created_at: "2026-08-25 08:00:00".to_string(),
            updated_at: "2026-08-25 08:00:00".to_string(),
            completed_at: None,
        }
    }

    fn child(task_type: &str, status: TaskStatus, finished: &str) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: Some("init-1".to_string()),
            task_type: task_type.to_string(),
            title: String::new(),
            description: None,
            status,
            priority: Priority::P1,
            retry_count: 0,
            failure_count: 0,
            payload: TaskPayload::default(),
            next_run_at: None,
            created_at: "2026-08-25 08:00:00".to_string(),
            started_at: None,
            completed_at: (status == TaskStatus::Completed).then(|| finished.to_string()),
            updated_at: finished.to_string(),
        }
    }

    fn reviewed(verdict: &str, finished: &str) -> Task {
        let mut task = child(REVIEW_TASK, TaskStatus::Completed, finished);
        task.payload.verdict = Some(verdict.to_string());
        task
    }

    fn verified(passed: bool, finished: &str) -> Task {
        let mut task = child(VERIFY_TASK, TaskStatus::Completed, finished);
        task.payload.all_dod_passed = Some(passed);
        task
    }

    fn decide(phase: Phase, children: &[Task]) -> NextStep {
        next_step_for_initiative(
            &fixture_initiative(Some(phase)),
            children,
            &AutonomicConfig::default(),
        )
    }

    // -- transition table --

    #[test]
    fn test_phase_transition_table() {
        assert!(phase_transition_allowed(Phase::Plan, Some(Phase::Review)));
        assert!(phase_transition_allowed(Phase::Review, Some(Phase::Dev)));
        assert!(phase_transition_allowed(Phase::Review, Some(Phase::Plan)));
        assert!(phase_transition_allowed(Phase::Dev, Some(Phase::Verify)));
        assert!(phase_transition_allowed(Phase::Dev, Some(Phase::Plan)));
        assert!(phase_transition_allowed(Phase::Verify, Some(Phase::Dev)));
        assert!(phase_transition_allowed(Phase::Verify, None));

        assert!(!phase_transition_allowed(Phase::Plan, Some(Phase::Dev)));
        assert!(!phase_transition_allowed(Phase::Plan, Some(Phase::Verify)));
        assert!(!phase_transition_allowed(Phase::Plan, None));
        assert!(!phase_transition_allowed(Phase::Review, Some(Phase::Verify)));
        assert!(!phase_transition_allowed(Phase::Review, None));
        assert!(!phase_transition_allowed(Phase::Dev, Some(Phase::Review)));
        assert!(!phase_transition_allowed(Phase::Dev, None));
        assert!(!phase_transition_allowed(Phase::Verify, Some(Phase::Plan)));
        assert!(!phase_transition_allowed(Phase::Verify, Some(Phase::Review)));
    }

    // -- plan phase --

    #[test]
    fn test_plan_phase_decisions() {
        // Nothing yet: create a planner.
        assert_eq!(decide(Phase::Plan, &[]), NextStep::CreateTask(PLAN_TASK));

        // Planner running: wait.
        let children = vec![child(PLAN_TASK, TaskStatus::InProgress, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Plan, &children), NextStep::Wait);

        // Planner done: move to review.
        let children = vec![child(PLAN_TASK, TaskStatus::Completed, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Plan, &children), NextStep::Transition(Phase::Review));

        // All planners failed: try again.
        let children = vec![
            child(PLAN_TASK, TaskStatus::Failed, "2026-08-25 09:00:00"),
            child(PLAN_TASK, TaskStatus::Failed, "2026-08-25 09:10:00"),
        ];
        assert_eq!(decide(Phase::Plan, &children), NextStep::CreateTask(PLAN_TASK));
    }

    #[test]
    fn test_plan_consumed_by_revision_review_plans_again() {
        // Round one planned and was sent back for revision; the old plan
        // result must not bounce the phase straight back to review.
        let children = vec![
            child(PLAN_TASK, TaskStatus::Completed, "2026-08-25 09:00:00"),
            reviewed("needs_revision", "2026-08-25 09:30:00"),
        ];
        assert_eq!(decide(Phase::Plan, &children), NextStep::CreateTask(PLAN_TASK));

        // A fresh completed plan supersedes the old review.
        let mut children = children;
        children.push(child(PLAN_TASK, TaskStatus::Completed, "2026-08-25 10:00:00"));
        assert_eq!(decide(Phase::Plan, &children), NextStep::Transition(Phase::Review));
    }

    // -- review phase --

    #[test]
    fn test_review_phase_decisions() {
        assert_eq!(decide(Phase::Review, &[]), NextStep::CreateTask(REVIEW_TASK));

        let children = vec![child(REVIEW_TASK, TaskStatus::Queued, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Review, &children), NextStep::Wait);

        let children = vec![reviewed("approved", "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Review, &children), NextStep::ApproveAndStartDev);

        let children = vec![reviewed("needs_revision", "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Review, &children), NextStep::Transition(Phase::Plan));

        let children = vec![reviewed("rejected", "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Review, &children), NextStep::CancelInitiative);

        // No usable verdict: hold rather than guess.
        let children = vec![child(REVIEW_TASK, TaskStatus::Completed, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Review, &children), NextStep::Wait);
    }

    #[test]
    fn test_stale_review_triggers_new_review() {
        // The revision round completed a new plan after the old review.
        let children = vec![
            child(PLAN_TASK, TaskStatus::Completed, "2026-08-25 10:00:00"),
            reviewed("needs_revision", "2026-08-25 09:30:00"),
        ];
        assert_eq!(decide(Phase::Review, &children), NextStep::CreateTask(REVIEW_TASK));
    }

    #[test]
    fn test_latest_review_verdict_wins() {
        let children = vec![
            reviewed("needs_revision", "2026-08-25 09:00:00"),
            reviewed("approved", "2026-08-25 11:00:00"),
        ];
        assert_eq!(decide(Phase::Review, &children), NextStep::ApproveAndStartDev);
    }

    // -- dev phase --

    #[test]
    fn test_dev_phase_decisions() {
        // Running dev work: wait.
        let children = vec![
            child(DEV_TASK, TaskStatus::InProgress, "2026-08-25 09:00:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:00:00"),
        ];
        assert_eq!(decide(Phase::Dev, &children), NextStep::Wait);

        // Drafts left and nothing running: release them.
        let children = vec![
            child(DEV_TASK, TaskStatus::Draft, "2026-08-25 09:00:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:00:00"),
        ];
        assert_eq!(decide(Phase::Dev, &children), NextStep::PromoteDrafts);

        // Everything finished cleanly: on to verification.
        let children = vec![
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:00:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:30:00"),
        ];
        assert_eq!(decide(Phase::Dev, &children), NextStep::Transition(Phase::Verify));
    }

    #[test]
    fn test_dev_replan_beats_in_flight_work() {
        // Five finished devs with three failures, plus one still running:
        // the health check takes precedence over waiting.
        let mut children = vec![
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:01:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:02:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:03:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:04:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:05:00"),
        ];
        children.push(child(DEV_TASK, TaskStatus::InProgress, "2026-08-25 09:06:00"));
        assert_eq!(decide(Phase::Dev, &children), NextStep::Transition(Phase::Plan));
    }

    #[test]
    fn test_dev_replan_looks_only_at_recent_window() {
        // Three old failures pushed out of the window by five newer
        // successes: no replan.
        let children = vec![
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 08:01:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 08:02:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 08:03:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:01:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:02:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:03:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:04:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:05:00"),
        ];
        assert_eq!(decide(Phase::Dev, &children), NextStep::Transition(Phase::Verify));
    }

    #[test]
    fn test_dev_replan_needs_enough_tasks() {
        // Three failures but only four dev tasks in total: below the
        // window, not judged yet.
        let children = vec![
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:01:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:02:00"),
            child(DEV_TASK, TaskStatus::Failed, "2026-08-25 09:03:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 09:04:00"),
        ];
        assert_eq!(decide(Phase::Dev, &children), NextStep::Transition(Phase::Verify));
    }

    // -- verify phase --

    #[test]
    fn test_verify_phase_decisions() {
        assert_eq!(decide(Phase::Verify, &[]), NextStep::CreateTask(VERIFY_TASK));

        let children = vec![child(VERIFY_TASK, TaskStatus::Queued, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Verify, &children), NextStep::Wait);

        let children = vec![verified(true, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Verify, &children), NextStep::CompleteInitiative);

        // Failed definition-of-done goes back to dev for remediation.
        let children = vec![verified(false, "2026-08-25 09:00:00")];
        assert_eq!(decide(Phase::Verify, &children), NextStep::Transition(Phase::Dev));
    }

    #[test]
    fn test_dev_work_after_verify_forces_reverification() {
        let children = vec![
            verified(false, "2026-08-25 09:00:00"),
            child(DEV_TASK, TaskStatus::Completed, "2026-08-25 10:00:00"),
        ];
        assert_eq!(decide(Phase::Verify, &children), NextStep::CreateTask(VERIFY_TASK));
    }

    #[test]
    fn test_initiative_without_phase_waits() {
        assert_eq!(
            next_step_for_initiative(
                &fixture_initiative(None),
                &[],
                &AutonomicConfig::default()
            ),
            NextStep::Wait
        );
    }

    // -- guarded mutations --

    async fn setup() -> Arc<OpsStore> {
        let path =
            std::env::temp_dir().join(format!("autonomic_init_{}.db", uuid::Uuid::new_v4()));
        OpsStore::connect(&path).await.unwrap()
    }

    #[tokio::test]
    async fn test_phase_transition_is_guarded() {
        let store = setup().await;
        let id = create_initiative(&store, &NewInitiative::default()).await.unwrap();

        let outcome = handle_phase_transition(&store, &id, Phase::Plan, Some(Phase::Review))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        let initiative = get_initiative(&store, &id).await.unwrap().unwrap();
        assert_eq!(initiative.current_phase, Some(Phase::Review));

        // The same transition again lost the race: phase is no longer plan.
        let outcome = handle_phase_transition(&store, &id, Phase::Plan, Some(Phase::Review))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::LostRace);

        // Not in the table: rejected without touching the row.
        let outcome = handle_phase_transition(&store, &id, Phase::Review, None)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected);
        let initiative = get_initiative(&store, &id).await.unwrap().unwrap();
        assert_eq!(initiative.current_phase, Some(Phase::Review));

        let events = store
            .recent_events(Some("initiative_phase_transition"), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_stamps_and_closes() {
        let store = setup().await;
        let id = create_initiative(&store, &NewInitiative::default()).await.unwrap();
        sqlx::query("UPDATE projects SET current_phase = 'verify' WHERE id = ?")
            .bind(&id)
            .execute(store.pool())
            .await
            .unwrap();

        let outcome = handle_phase_transition(&store, &id, Phase::Verify, None)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);

        let initiative = get_initiative(&store, &id).await.unwrap().unwrap();
        assert_eq!(initiative.status, InitiativeStatus::Completed);
        assert_eq!(initiative.current_phase, None);
        assert!(initiative.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_initiative_cancels_pending_children() {
        let store = setup().await;
        let id = create_initiative(&store, &NewInitiative::default()).await.unwrap();
        let draft = task::insert_task(
            &store,
            &NewTask {
                project_id: Some(id.clone()),
                task_type: DEV_TASK.to_string(),
                status: TaskStatus::Draft,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let running = task::insert_task(
            &store,
            &NewTask {
                project_id: Some(id.clone()),
                task_type: DEV_TASK.to_string(),
                status: TaskStatus::InProgress,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(cancel_initiative(&store, &id, "decomposition rejected")
            .await
            .unwrap());
        // Second cancel is a no-op.
        assert!(!cancel_initiative(&store, &id, "again").await.unwrap());

        let initiative = get_initiative(&store, &id).await.unwrap().unwrap();
        assert_eq!(initiative.status, InitiativeStatus::Cancelled);
        let draft = task::get_task(&store, &draft).await.unwrap().unwrap();
        assert_eq!(draft.status, TaskStatus::Cancelled);
        // Running work is left for the executor to finish.
        let running = task::get_task(&store, &running).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_orchestrator_pass_creates_then_waits() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let id = create_initiative(
            &store,
            &NewInitiative {
                name: "nightly exports".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let orchestrator = InitiativeOrchestrator::new(store.clone());
        let report = orchestrator.run_orchestrator_pass(&config).await;
        assert_eq!(report, OrchestratorReport { stepped: 1, errors: 0 });

        let children = task::tasks_for_project(&store, &id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].task_type, PLAN_TASK);
        assert_eq!(children[0].status, TaskStatus::Queued);

        // The planner is in flight now; another pass must not duplicate it.
        orchestrator.run_orchestrator_pass(&config).await;
        let children = task::tasks_for_project(&store, &id).await.unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn test_approval_promotes_drafts_and_enters_dev() {
        let store = setup().await;
        let config = AutonomicConfig::default();
        let id = create_initiative(&store, &NewInitiative::default()).await.unwrap();
        sqlx::query("UPDATE projects SET current_phase = 'review' WHERE id = ?")
            .bind(&id)
            .execute(store.pool())
            .await
            .unwrap();

        let payload = TaskPayload {
            verdict: Some("approved".to_string()),
            ..Default::default()
        };
        task::insert_task(
            &store,
            &NewTask {
                project_id: Some(id.clone()),
                task_type: REVIEW_TASK.to_string(),
                status: TaskStatus::Completed,
                payload,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let draft = task::insert_task(
            &store,
            &NewTask {
                project_id: Some(id.clone()),
                task_type: DEV_TASK.to_string(),
                status: TaskStatus::Draft,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let orchestrator = InitiativeOrchestrator::new(store.clone());
        orchestrator.run_orchestrator_pass(&config).await;

        let initiative = get_initiative(&store, &id).await.unwrap().unwrap();
        assert_eq!(initiative.current_phase, Some(Phase::Dev));
        let draft = task::get_task(&store, &draft).await.unwrap().unwrap();
        assert_eq!(draft.status, TaskStatus::Queued);
    }
}
