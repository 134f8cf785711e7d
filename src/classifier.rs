//! Failure classification.
//!
//! Maps raw executor error text onto a small closed taxonomy and decides what
//! happens next: retry with backoff, pause dispatch globally, or hand the
//! task to a human. Classification itself is pure so the decision table can
//! be tested without a database; the handful of async wrappers at the bottom
//! persist the verdict.

use crate::config::AutonomicConfig;
use crate::store::{self, OpsStore};
use crate::task::{self, Task};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use std::sync::LazyLock;

/// ops_state key holding the global dispatch pause deadline.
pub const BILLING_PAUSE_KEY: &str = "billing_pause_until";

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Closed set of failure classes. Matching on this enum is always exhaustive
/// so adding a class forces every decision site to say what it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    BillingCap,
    RateLimit,
    Auth,
    Network,
    Resource,
    TaskError,
}

impl FailureClass {
    /// Every class, in precedence order.
    pub const ALL: [FailureClass; 6] = [
        FailureClass::BillingCap,
        FailureClass::RateLimit,
        FailureClass::Auth,
        FailureClass::Network,
        FailureClass::Resource,
        FailureClass::TaskError,
    ];
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureClass::BillingCap => "BILLING_CAP",
            FailureClass::RateLimit => "RATE_LIMIT",
            FailureClass::Auth => "AUTH",
            FailureClass::Network => "NETWORK",
            FailureClass::Resource => "RESOURCE",
            FailureClass::TaskError => "TASK_ERROR",
        };
        write!(f, "{s}")
    }
}

/// Parse a failure class from its storage form.
pub fn parse_failure_class(s: &str) -> Result<FailureClass> {
    Ok(match s {
        "BILLING_CAP" => FailureClass::BillingCap,
        "RATE_LIMIT" => FailureClass::RateLimit,
        "AUTH" => FailureClass::Auth,
        "NETWORK" => FailureClass::Network,
        "RESOURCE" => FailureClass::Resource,
        "TASK_ERROR" => FailureClass::TaskError,
        other => bail!("unknown failure class: {other}"),
    })
}

impl FailureClass {
    /// Whether a retry of this class consumes one of the task's bounded
    /// retry slots. Platform-level conditions (billing, rate limits, auth,
    /// resources) wait without burning retries.
    pub fn counts_against_retries(&self) -> bool {
        match self {
            FailureClass::BillingCap | FailureClass::RateLimit => false,
            FailureClass::Auth | FailureClass::Resource => false,
            FailureClass::Network | FailureClass::TaskError => true,
        }
    }
}

/// The classifier's verdict for one failure, persisted into the task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureClassification {
    pub class: FailureClass,
    pub should_retry: bool,
    /// Earliest time the dispatcher may hand the task out again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<String>,
    pub needs_human_review: bool,
    /// True only for billing caps: every executor pauses, not just this task.
    pub pauses_dispatch: bool,
    pub classified_at: String,
}

// ---------------------------------------------------------------------------
// Keyword tables
// ---------------------------------------------------------------------------

// Matched case-insensitively against the stored error text, first table that
// hits wins. Order encodes precedence: a billing message often also mentions
// limits, so billing markers are checked before rate-limit markers.

const BILLING_MARKERS: &[&str] = &[
    "usage cap",
    "usage limit",
    "billing",
    "spending cap",
    "credit balance",
    "insufficient credit",
    "payment required",
    "402",
];

const RATE_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate-limit",
    "rate_limit",
    "too many requests",
    "overloaded_error",
];

const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid x-api-key",
    "authentication_error",
    "permission denied",
];

const NETWORK_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "econnrefused",
    "econnreset",
    "connection refused",
    "connection reset",
    "socket hang up",
    "dns",
    "eai_again",
    "fetch failed",
    "network error",
];

const RESOURCE_MARKERS: &[&str] = &[
    "out of memory",
    "oom",
    "enomem",
    "no space left",
    "enospc",
    "disk full",
    "resource exhausted",
    "cannot allocate",
];

/// Classify raw error text into a failure class.
pub fn classify_text(error_text: &str) -> FailureClass {
    let lower = error_text.to_lowercase();
    let hit = |markers: &[&str]| markers.iter().any(|marker| lower.contains(marker));

    if hit(BILLING_MARKERS) {
        FailureClass::BillingCap
    } else if hit(RATE_MARKERS) {
        FailureClass::RateLimit
    } else if hit(AUTH_MARKERS) {
        FailureClass::Auth
    } else if hit(NETWORK_MARKERS) {
        FailureClass::Network
    } else if hit(RESOURCE_MARKERS) {
        FailureClass::Resource
    } else {
        FailureClass::TaskError
    }
}

// ---------------------------------------------------------------------------
// Backoff and reset parsing
// ---------------------------------------------------------------------------

/// Exponential backoff for rate limits: base doubles per attempt, capped.
pub fn rate_limit_backoff(attempt: u32, config: &AutonomicConfig) -> Duration {
    let attempt = attempt.max(1);
    let raw = config.rate_limit_base_secs as f64 * 2f64.powi(attempt as i32 - 1);
    let capped = raw.min(config.rate_limit_max_secs as f64);
    Duration::seconds(capped as i64)
}

/// Linear backoff for transient network and generic task errors.
pub fn linear_backoff(attempt: u32, config: &AutonomicConfig) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::seconds(config.retry_delay_secs.saturating_mul(attempt) as i64)
}

static RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "resets 11pm", "resets at 6:30am", "resets 23:00"
    Regex::new(r"(?i)\breset(?:s)?\b[^0-9]{0,12}(\d{1,2})(?::(\d{2}))?\s*(am|pm)?")
        .expect("hardcoded regex")
});

/// Parse a provider "resets <time>" phrase into the next UTC instant with
/// that wall-clock time. Returns None when no parseable time is present.
pub fn parse_reset_time(error_text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RESET_RE.captures(error_text)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);

    match caps.get(3).map(|m| m.as_str().to_lowercase()) {
        Some(meridiem) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            if meridiem == "am" {
                if hour == 12 {
                    hour = 0;
                }
            } else if hour != 12 {
                hour += 12;
            }
        }
        None => {
            if hour > 23 {
                return None;
            }
        }
    }
    if minute > 59 {
        return None;
    }

    let candidate = now.with_hour(hour)?.with_minute(minute)?.with_second(0)?;
    if candidate <= now {
        Some(candidate + Duration::days(1))
    } else {
        Some(candidate)
    }
}

// ---------------------------------------------------------------------------
// Decision table
// ---------------------------------------------------------------------------

/// Classify one failure and decide its disposition.
///
/// `attempt` is 1-based: how many times this task has now failed.
pub fn classify(
    error_text: &str,
    attempt: u32,
    now: DateTime<Utc>,
    config: &AutonomicConfig,
) -> FailureClassification {
    let class = classify_text(error_text);
    let classified_at = store::stamp(now);

    match class {
        FailureClass::BillingCap => {
            let resume_at = parse_reset_time(error_text, now)
                .unwrap_or(now + Duration::seconds(config.billing_pause_fallback_secs as i64));
            FailureClassification {
                class,
                should_retry: true,
                next_run_at: Some(store::stamp(resume_at)),
                needs_human_review: false,
                pauses_dispatch: true,
                classified_at,
            }
        }
        FailureClass::RateLimit => FailureClassification {
            class,
            should_retry: true,
            next_run_at: Some(store::stamp(now + rate_limit_backoff(attempt, config))),
            needs_human_review: false,
            pauses_dispatch: false,
            classified_at,
        },
        FailureClass::Auth => FailureClassification {
            class,
            should_retry: false,
            next_run_at: None,
            needs_human_review: true,
            pauses_dispatch: false,
            classified_at,
        },
        FailureClass::Network | FailureClass::TaskError => FailureClassification {
            class,
            should_retry: true,
            next_run_at: Some(store::stamp(now + linear_backoff(attempt, config))),
            needs_human_review: false,
            pauses_dispatch: false,
            classified_at,
        },
        FailureClass::Resource => FailureClassification {
            class,
            should_retry: false,
            next_run_at: None,
            needs_human_review: true,
            pauses_dispatch: false,
            classified_at,
        },
    }
}

/// Classify a failed task from its stored error details. The failure being
/// classified counts as one more attempt on top of the stored counters.
pub fn classify_failure(
    task: &Task,
    now: DateTime<Utc>,
    config: &AutonomicConfig,
) -> FailureClassification {
    let error_text = task.payload.error_message().unwrap_or("");
    let attempt = (task.failure_count.max(task.retry_count) + 1) as u32;
    classify(error_text, attempt, now, config)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Classify a failed task, persist the verdict into its payload, and when the
/// class is a billing cap, raise the global dispatch pause.
///
/// Returns `None` when the task left `failed` between being read and the
/// write landing; nothing is persisted in that case.
pub async fn handle_task_failure(
    store: &OpsStore,
    task_id: &str,
    config: &AutonomicConfig,
) -> Result<Option<FailureClassification>> {
    let Some(task_record) = task::get_task(store, task_id).await? else {
        bail!("task {task_id} not found");
    };

    let classification = classify_failure(&task_record, Utc::now(), config);

    let mut payload = task_record.payload.clone();
    payload.failure_classification = Some(classification.clone());
    if classification.needs_human_review {
        payload.needs_human_review = true;
    }
    if !store_classification(store, task_id, &payload).await? {
        tracing::debug!(task_id, "task no longer failed, classification skipped");
        return Ok(None);
    }

    if classification.pauses_dispatch {
        if let Some(until) = classification.next_run_at.as_deref() {
            pause_dispatch_until(store, until, task_id).await?;
        }
    }

    tracing::info!(
        task_id,
        class = %classification.class,
        should_retry = classification.should_retry,
        "classified task failure"
    );
    Ok(Some(classification))
}

/// Persist the verdict into the payload and count the handled failure, in
/// one statement. Conditional on the task still being failed.
async fn store_classification(
    store: &OpsStore,
    task_id: &str,
    payload: &task::TaskPayload,
) -> Result<bool> {
    let payload_json = serde_json::to_string(payload).context("serialize task payload")?;
    let result = sqlx::query(
        "UPDATE tasks SET payload = ?, failure_count = failure_count + 1,
                updated_at = datetime('now')
         WHERE id = ? AND status = 'failed'",
    )
    .bind(&payload_json)
    .bind(task_id)
    .execute(store.pool())
    .await
    .context("persist failure classification")?;
    Ok(result.rows_affected() > 0)
}

/// Raise the global dispatch pause. Extends, never shortens, an existing
/// pause.
async fn pause_dispatch_until(store: &OpsStore, until: &str, task_id: &str) -> Result<()> {
    if let Some(existing) = store.get_state(BILLING_PAUSE_KEY).await? {
        if existing.as_str() >= until {
            return Ok(());
        }
    }
    store.set_state(BILLING_PAUSE_KEY, until).await?;
    store
        .log_event(
            "dispatch_paused",
            &format!("dispatch paused until {until} by billing cap"),
            Some(&serde_json::json!({ "task_id": task_id, "until": until })),
        )
        .await?;
    tracing::warn!(until, task_id, "billing cap hit, pausing dispatch");
    Ok(())
}

/// Current dispatch pause deadline, if one is still in the future. An
/// expired pause is cleared on read.
pub async fn dispatch_paused_until(store: &OpsStore) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = store.get_state(BILLING_PAUSE_KEY).await? else {
        return Ok(None);
    };
    let Some(until) = store::parse_stamp(&raw) else {
        tracing::warn!(raw, "unparseable billing pause stamp, clearing");
        store.clear_state(BILLING_PAUSE_KEY).await?;
        return Ok(None);
    };
    if until <= Utc::now() {
        store.clear_state(BILLING_PAUSE_KEY).await?;
        store
            .log_event("dispatch_resumed", "billing pause expired", None)
            .await?;
        return Ok(None);
    }
    Ok(Some(until))
}
