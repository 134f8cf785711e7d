//! Collaborator seams and root-cause analysis plumbing.
//!
//! The operations layer never talks to a model or spawns a worker itself.
//! The host platform hands in implementations of these traits; everything
//! here stays testable with in-memory stubs.

use crate::task::Task;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Confidence assigned when an analysis carries no usable confidence of its
/// own. Low enough that it never seeds a policy on its own.
pub const DEFAULT_RCA_CONFIDENCE: f64 = 0.3;

/// Runs a root-cause investigation for a failed task.
#[async_trait]
pub trait RootCauseAnalyzer: Send + Sync {
    /// Investigate one failure. `context` carries whatever the caller knows:
    /// error details, recent sibling failures, the systemic report.
    async fn perform_rca(&self, task: &Task, context: &Value) -> Result<RcaAnalysis>;
}

/// Hands proposed fixes to the dev pipeline.
#[async_trait]
pub trait DevDispatch: Send + Sync {
    /// Create a dev task for the proposed fix. Returns the new task's id.
    async fn dispatch_fix(
        &self,
        failed_task: &Task,
        rca: &RcaResult,
        signature: &str,
    ) -> Result<String>;
}

/// Live executor capacity, read from the host's process table.
pub trait WorkerPool: Send + Sync {
    fn active_count(&self) -> usize;
    fn max_seats(&self) -> usize;
}

/// Raw analyzer output. Analyzers are allowed to return either a structured
/// object or free text; [`extract_rca_result`] normalizes both.
#[derive(Debug, Clone)]
pub struct RcaAnalysis {
    pub analysis: Value,
}

/// Normalized root-cause analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaResult {
    pub root_cause: String,
    pub proposed_fix: String,
    pub action_plan: Vec<String>,
    pub confidence: f64,
    pub evidence: Vec<String>,
    /// Machine-usable remediation, when the analyzer offered one. Shaped
    /// like a policy action object and validated before any use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<Value>,
}

/// Normalize an analysis into an [`RcaResult`].
///
/// Accepts a JSON object, a string containing a JSON object, or labelled
/// free text ("Root cause: ...", "Fix: ...", "Confidence: 70%"). Anything
/// unrecognizable comes back with [`DEFAULT_RCA_CONFIDENCE`] so downstream
/// gates treat it as a weak signal rather than an error.
pub fn extract_rca_result(analysis: &RcaAnalysis) -> RcaResult {
    match &analysis.analysis {
        Value::Object(map) => from_object(map),
        Value::String(text) => {
            // Some analyzers return JSON wrapped in a string.
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
                from_object(&map)
            } else {
                from_free_text(text)
            }
        }
        _ => RcaResult {
            root_cause: "unknown".to_string(),
            proposed_fix: String::new(),
            action_plan: Vec::new(),
            confidence: DEFAULT_RCA_CONFIDENCE,
            evidence: Vec::new(),
            proposed_action: None,
        },
    }
}

fn first_string(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn string_list(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn from_object(map: &serde_json::Map<String, Value>) -> RcaResult {
    let confidence = map
        .get("confidence")
        .and_then(Value::as_f64)
        .map(normalize_confidence)
        .unwrap_or(DEFAULT_RCA_CONFIDENCE);

    RcaResult {
        root_cause: first_string(map, &["root_cause", "rootCause"])
            .unwrap_or_else(|| "unknown".to_string()),
        proposed_fix: first_string(map, &["proposed_fix", "proposedFix", "fix"])
            .unwrap_or_default(),
        action_plan: string_list(map, &["action_plan", "actionPlan", "steps"]),
        confidence,
        evidence: string_list(map, &["evidence", "observations"]),
        proposed_action: ["proposed_action", "policy_action"]
            .iter()
            .find_map(|key| map.get(*key))
            .filter(|v| v.is_object())
            .cloned(),
    }
}

fn from_free_text(text: &str) -> RcaResult {
    let mut root_cause = None;
    let mut proposed_fix = None;
    let mut confidence = None;
    let mut action_plan = Vec::new();
    let mut evidence = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if let Some(rest) = strip_label(line, &lower, "root cause:") {
            root_cause = Some(rest);
        } else if let Some(rest) =
            strip_label(line, &lower, "proposed fix:").or_else(|| strip_label(line, &lower, "fix:"))
        {
            proposed_fix = Some(rest);
        } else if let Some(rest) = strip_label(line, &lower, "confidence:") {
            confidence = parse_confidence(&rest);
        } else if line
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
            && line.contains('.')
        {
            // Numbered plan step: "1. do the thing"
            if let Some((_, step)) = line.split_once('.') {
                action_plan.push(step.trim().to_string());
            }
        } else if let Some(item) = line.strip_prefix("- ") {
            evidence.push(item.trim().to_string());
        }
    }

    RcaResult {
        root_cause: root_cause.unwrap_or_else(|| {
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("unknown")
                .to_string()
        }),
        proposed_fix: proposed_fix.unwrap_or_default(),
        action_plan,
        confidence: confidence.unwrap_or(DEFAULT_RCA_CONFIDENCE),
        evidence,
        proposed_action: None,
    }
}

fn strip_label(line: &str, lower: &str, label: &str) -> Option<String> {
    lower
        .starts_with(label)
        .then(|| line[label.len()..].trim().to_string())
}

fn parse_confidence(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%');
    trimmed.parse::<f64>().ok().map(normalize_confidence)
}

/// Clamp to [0, 1], reading values above 1 as percentages.
fn normalize_confidence(value: f64) -> f64 {
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.clamp(0.0, 1.0)
}
