//! Absorption policies: stored remediations keyed by failure signature.
//!
//! A policy's behaviour lives in its policy_json column as a small tagged
//! object. Nothing is ever enforced straight from the database: every read
//! passes through [`validate_policy_json`], which rejects malformed actions
//! and fills in defaults, so a hand-edited or model-written row can degrade
//! the pipeline to analysis but never make it apply garbage.

use crate::store::OpsStore;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Status and risk
// ---------------------------------------------------------------------------

/// Policy lifecycle. New policies always start in probation and only the
/// promotion job moves them to active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Probation,
    Active,
    Disabled,
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyStatus::Probation => "probation",
            PolicyStatus::Active => "active",
            PolicyStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

pub fn parse_policy_status(s: &str) -> Result<PolicyStatus> {
    Ok(match s {
        "probation" => PolicyStatus::Probation,
        "active" => PolicyStatus::Active,
        "disabled" => PolicyStatus::Disabled,
        other => bail!("unknown policy status: {other}"),
    })
}

/// How much damage this policy can do if it is wrong. Only low-risk
/// policies are ever promoted automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

pub fn parse_risk_level(s: &str) -> Result<RiskLevel> {
    Ok(match s {
        "low" => RiskLevel::Low,
        "medium" => RiskLevel::Medium,
        "high" => RiskLevel::High,
        other => bail!("unknown risk level: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Actions and validation
// ---------------------------------------------------------------------------

const ALLOWED_PRIORITIES: &[&str] = &["low", "normal", "high", "P0", "P1", "P2"];
const ALLOWED_MERGE_STRATEGIES: &[&str] = &["merge", "replace"];
const COMMON_KEYS: &[&str] = &["action", "confidence", "notes"];

/// What a policy does when its signature fires. Fields are fully populated
/// after validation; defaults never survive only implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Put the failed task back in the queue after a delay.
    Requeue { delay_minutes: f64, priority: String },
    /// Mark the failure absorbed without another attempt.
    Skip { reason: String },
    /// Edit the task's executor parameters, then requeue immediately.
    AdjustParams {
        adjustments: serde_json::Map<String, Value>,
        merge_strategy: String,
    },
    /// Record the failure as terminal. The task stays failed.
    Kill { reason: String },
}

impl PolicyAction {
    /// Short name for logs and evaluation decisions.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyAction::Requeue { .. } => "requeue",
            PolicyAction::Skip { .. } => "skip",
            PolicyAction::AdjustParams { .. } => "adjust_params",
            PolicyAction::Kill { .. } => "kill",
        }
    }
}

/// Risk assigned when the RCA pipeline seeds a policy. Requeue and skip are
/// recoverable, parameter edits less so, kill least of all.
pub fn risk_for_action(action: &PolicyAction) -> RiskLevel {
    match action {
        PolicyAction::Requeue { .. } | PolicyAction::Skip { .. } => RiskLevel::Low,
        PolicyAction::AdjustParams { .. } => RiskLevel::Medium,
        PolicyAction::Kill { .. } => RiskLevel::High,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyValidationError {
    #[error("policy json must be an object")]
    NotAnObject,
    #[error("policy json has no action field")]
    MissingAction,
    #[error("unknown policy action: {0}")]
    UnknownAction(String),
    #[error("{action} action missing required parameter {param}")]
    MissingParameter {
        action: &'static str,
        param: &'static str,
    },
    #[error("invalid parameter {param}: {reason}")]
    InvalidParameter {
        param: &'static str,
        reason: String,
    },
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("rejected in strict mode: {0}")]
    Strict(String),
}

/// A policy_json value that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPolicy {
    pub action: PolicyAction,
    pub confidence: Option<f64>,
    pub warnings: Vec<String>,
}

impl ValidatedPolicy {
    /// Canonical storage form: the action with every default made explicit,
    /// plus confidence when present.
    pub fn normalized_json(&self) -> Value {
        let mut value = serde_json::to_value(&self.action).unwrap_or(Value::Null);
        if let (Some(confidence), Some(map)) = (self.confidence, value.as_object_mut()) {
            map.insert("confidence".to_string(), confidence.into());
        }
        value
    }
}

/// Validate a policy_json value.
///
/// Structural problems (unknown action, missing or mistyped required
/// parameters, out-of-range values) always reject. Soft problems (unknown
/// keys, low confidence, empty adjustments) are warnings, and `strict` turns
/// warnings into rejections.
pub fn validate_policy_json(
    value: &Value,
    strict: bool,
) -> Result<ValidatedPolicy, PolicyValidationError> {
    let map = value.as_object().ok_or(PolicyValidationError::NotAnObject)?;
    let action_name = map
        .get("action")
        .and_then(Value::as_str)
        .ok_or(PolicyValidationError::MissingAction)?;

    let mut warnings = Vec::new();

    let (action, known_keys): (PolicyAction, &[&str]) = match action_name {
        "requeue" => {
            let delay_minutes = match map.get("delay_minutes") {
                None => 0.0,
                Some(v) => v
                    .as_f64()
                    .ok_or(PolicyValidationError::InvalidParameter {
                        param: "delay_minutes",
                        reason: "must be a number".to_string(),
                    })?,
            };
            if !delay_minutes.is_finite() || delay_minutes < 0.0 {
                return Err(PolicyValidationError::InvalidParameter {
                    param: "delay_minutes",
                    reason: format!("must be finite and non-negative, got {delay_minutes}"),
                });
            }
            let priority = match map.get("priority") {
                None => "normal".to_string(),
                Some(v) => {
                    let word = v
                        .as_str()
                        .ok_or(PolicyValidationError::InvalidParameter {
                            param: "priority",
                            reason: "must be a string".to_string(),
                        })?;
                    if !ALLOWED_PRIORITIES.contains(&word) {
                        return Err(PolicyValidationError::InvalidParameter {
                            param: "priority",
                            reason: format!("must be one of {ALLOWED_PRIORITIES:?}, got {word:?}"),
                        });
                    }
                    word.to_string()
                }
            };
            (
                PolicyAction::Requeue {
                    delay_minutes,
                    priority,
                },
                &["delay_minutes", "priority"],
            )
        }
        "skip" => {
            let reason = match map.get("reason") {
                None => "absorbed by policy".to_string(),
                Some(v) => v
                    .as_str()
                    .ok_or(PolicyValidationError::InvalidParameter {
                        param: "reason",
                        reason: "must be a string".to_string(),
                    })?
                    .to_string(),
            };
            (PolicyAction::Skip { reason }, &["reason"])
        }
        "adjust_params" => {
            let adjustments = map
                .get("adjustments")
                .ok_or(PolicyValidationError::MissingParameter {
                    action: "adjust_params",
                    param: "adjustments",
                })?
                .as_object()
                .ok_or(PolicyValidationError::InvalidParameter {
                    param: "adjustments",
                    reason: "must be an object".to_string(),
                })?
                .clone();
            if adjustments.is_empty() {
                warnings.push("adjustments object is empty".to_string());
            }
            let merge_strategy = match map.get("merge_strategy") {
                None => "merge".to_string(),
                Some(v) => {
                    let word = v
                        .as_str()
                        .ok_or(PolicyValidationError::InvalidParameter {
                            param: "merge_strategy",
                            reason: "must be a string".to_string(),
                        })?;
                    if !ALLOWED_MERGE_STRATEGIES.contains(&word) {
                        return Err(PolicyValidationError::InvalidParameter {
                            param: "merge_strategy",
                            reason: format!(
                                "must be one of {ALLOWED_MERGE_STRATEGIES:?}, got {word:?}"
                            ),
                        });
                    }
                    word.to_string()
                }
            };
            (
                PolicyAction::AdjustParams {
                    adjustments,
                    merge_strategy,
                },
                &["adjustments", "merge_strategy"],
            )
        }
        "kill" => {
            let reason = map
                .get("reason")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or(PolicyValidationError::MissingParameter {
                    action: "kill",
                    param: "reason",
                })?
                .to_string();
            (PolicyAction::Kill { reason }, &["reason"])
        }
        other => return Err(PolicyValidationError::UnknownAction(other.to_string())),
    };

    let confidence = match map.get("confidence") {
        None => None,
        Some(v) => {
            let confidence = v
                .as_f64()
                .ok_or(PolicyValidationError::InvalidParameter {
                    param: "confidence",
                    reason: "must be a number".to_string(),
                })?;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(PolicyValidationError::ConfidenceOutOfRange(confidence));
            }
            if confidence < 0.5 {
                warnings.push(format!("confidence {confidence} below 0.5"));
            }
            Some(confidence)
        }
    };

    for key in map.keys() {
        if !COMMON_KEYS.contains(&key.as_str()) && !known_keys.contains(&key.as_str()) {
            warnings.push(format!("unknown key {key:?}"));
        }
    }

    if strict && !warnings.is_empty() {
        return Err(PolicyValidationError::Strict(warnings.join("; ")));
    }

    Ok(ValidatedPolicy {
        action,
        confidence,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// A stored policy.
#[derive(Debug, Clone)]
pub struct AbsorptionPolicy {
    pub policy_id: String,
    pub signature: String,
    pub status: PolicyStatus,
    pub policy_type: String,
    pub policy_json: Value,
    pub risk_level: RiskLevel,
    pub created_by: String,
    pub disabled_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    policy_id: String,
    signature: String,
    status: String,
    policy_type: String,
    policy_json: String,
    risk_level: String,
    created_by: String,
    disabled_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PolicyRow {
    fn into_policy(self) -> Result<AbsorptionPolicy> {
        let policy_json: Value = serde_json::from_str(&self.policy_json)
            .with_context(|| format!("unparseable policy_json for {}", self.policy_id))?;
        Ok(AbsorptionPolicy {
            status: parse_policy_status(&self.status)?,
            risk_level: parse_risk_level(&self.risk_level)?,
            policy_id: self.policy_id,
            signature: self.signature,
            policy_type: self.policy_type,
            policy_json,
            created_by: self.created_by,
            disabled_reason: self.disabled_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const POLICY_COLUMNS: &str = "policy_id, signature, status, policy_type, policy_json, risk_level, \
     created_by, disabled_reason, created_at, updated_at";

/// Fields for a new policy. Every new policy starts in probation.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub signature: String,
    pub policy_type: String,
    pub policy_json: Value,
    pub risk_level: RiskLevel,
    pub created_by: String,
}

/// Validate and store a new probation policy. The stored json is the
/// normalized form with defaults made explicit.
pub async fn create_policy(store: &OpsStore, new: &NewPolicy) -> Result<String> {
    let validated = validate_policy_json(&new.policy_json, false)
        .map_err(|error| anyhow::anyhow!("invalid policy json: {error}"))?;
    let mut normalized = validated.normalized_json();
    if let (Some(notes), Some(map)) = (new.policy_json.get("notes"), normalized.as_object_mut()) {
        map.insert("notes".to_string(), notes.clone());
    }

    let policy_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO absorption_policies (policy_id, signature, status, policy_type, policy_json, risk_level, created_by)
         VALUES (?, ?, 'probation', ?, ?, ?, ?)",
    )
    .bind(&policy_id)
    .bind(&new.signature)
    .bind(&new.policy_type)
    .bind(normalized.to_string())
    .bind(new.risk_level.to_string())
    .bind(&new.created_by)
    .execute(store.pool())
    .await
    .context("insert policy")?;

    tracing::info!(
        policy_id,
        signature = %new.signature,
        risk = %new.risk_level,
        created_by = %new.created_by,
        "created probation policy"
    );
    Ok(policy_id)
}

pub async fn get_policy(store: &OpsStore, policy_id: &str) -> Result<Option<AbsorptionPolicy>> {
    let row: Option<PolicyRow> = sqlx::query_as(&format!(
        "SELECT {POLICY_COLUMNS} FROM absorption_policies WHERE policy_id = ?"
    ))
    .bind(policy_id)
    .fetch_optional(store.pool())
    .await
    .context("load policy")?;
    row.map(PolicyRow::into_policy).transpose()
}

async fn newest_policy_with_status(
    store: &OpsStore,
    signature: &str,
    status: PolicyStatus,
) -> Result<Option<AbsorptionPolicy>> {
    let row: Option<PolicyRow> = sqlx::query_as(&format!(
        "SELECT {POLICY_COLUMNS} FROM absorption_policies
         WHERE signature = ? AND status = ?
         ORDER BY created_at DESC, policy_id DESC LIMIT 1"
    ))
    .bind(signature)
    .bind(status.to_string())
    .fetch_optional(store.pool())
    .await
    .context("load policy for signature")?;

    match row.map(PolicyRow::into_policy).transpose() {
        Ok(policy) => Ok(policy),
        Err(error) => {
            // A corrupt row reads as "no policy"; absorption falls back to
            // plain analysis.
            tracing::warn!(%error, signature, "skipping unreadable policy row");
            Ok(None)
        }
    }
}

/// Newest active policy for a signature.
pub async fn active_policy_for(
    store: &OpsStore,
    signature: &str,
) -> Result<Option<AbsorptionPolicy>> {
    newest_policy_with_status(store, signature, PolicyStatus::Active).await
}

/// Newest probation policy for a signature.
pub async fn probation_policy_for(
    store: &OpsStore,
    signature: &str,
) -> Result<Option<AbsorptionPolicy>> {
    newest_policy_with_status(store, signature, PolicyStatus::Probation).await
}

/// Whether any live (non-disabled) policy covers a signature. Used to stop
/// the RCA pipeline from seeding duplicates.
pub async fn live_policy_exists(store: &OpsStore, signature: &str) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM absorption_policies WHERE signature = ? AND status != 'disabled'",
    )
    .bind(signature)
    .fetch_one(store.pool())
    .await
    .context("count live policies")?;
    Ok(count > 0)
}

/// All policies in a status, oldest first.
pub async fn load_by_status(
    store: &OpsStore,
    status: PolicyStatus,
) -> Result<Vec<AbsorptionPolicy>> {
    let rows: Vec<PolicyRow> = sqlx::query_as(&format!(
        "SELECT {POLICY_COLUMNS} FROM absorption_policies WHERE status = ? ORDER BY created_at ASC"
    ))
    .bind(status.to_string())
    .fetch_all(store.pool())
    .await
    .context("load policies by status")?;

    let mut policies = Vec::with_capacity(rows.len());
    for row in rows {
        match row.into_policy() {
            Ok(policy) => policies.push(policy),
            Err(error) => tracing::warn!(%error, "skipping unreadable policy row"),
        }
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- validation: structure --

    #[test]
    fn test_requeue_defaults() {
        let validated = validate_policy_json(&json!({ "action": "requeue" }), false).unwrap();
        assert_eq!(
            validated.action,
            PolicyAction::Requeue {
                delay_minutes: 0.0,
                priority: "normal".to_string(),
            }
        );
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn test_requeue_full() {
        let validated = validate_policy_json(
            &json!({ "action": "requeue", "delay_minutes": 30, "priority": "high", "confidence": 0.8 }),
            true,
        )
        .unwrap();
        assert_eq!(
            validated.action,
            PolicyAction::Requeue {
                delay_minutes: 30.0,
                priority: "high".to_string(),
            }
        );
        assert_eq!(validated.confidence, Some(0.8));
    }

    #[test]
    fn test_rejects_malformed_shapes() {
        assert_eq!(
            validate_policy_json(&json!("requeue"), false).unwrap_err(),
            PolicyValidationError::NotAnObject
        );
        assert_eq!(
            validate_policy_json(&json!({ "delay_minutes": 5 }), false).unwrap_err(),
            PolicyValidationError::MissingAction
        );
        assert_eq!(
            validate_policy_json(&json!({ "action": "reboot_universe" }), false).unwrap_err(),
            PolicyValidationError::UnknownAction("reboot_universe".to_string())
        );
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(matches!(
            validate_policy_json(&json!({ "action": "requeue", "delay_minutes": -5 }), false),
            Err(PolicyValidationError::InvalidParameter { param: "delay_minutes", .. })
        ));
        assert!(matches!(
            validate_policy_json(&json!({ "action": "requeue", "delay_minutes": "soon" }), false),
            Err(PolicyValidationError::InvalidParameter { param: "delay_minutes", .. })
        ));
        assert!(matches!(
            validate_policy_json(&json!({ "action": "requeue", "priority": "urgent" }), false),
            Err(PolicyValidationError::InvalidParameter { param: "priority", .. })
        ));
    }

    #[test]
    fn test_skip_default_reason() {
        let validated = validate_policy_json(&json!({ "action": "skip" }), false).unwrap();
        assert_eq!(
            validated.action,
            PolicyAction::Skip {
                reason: "absorbed by policy".to_string()
            }
        );
    }

    #[test]
    fn test_adjust_params_requirements() {
        assert!(matches!(
            validate_policy_json(&json!({ "action": "adjust_params" }), false),
            Err(PolicyValidationError::MissingParameter { param: "adjustments", .. })
        ));
        assert!(matches!(
            validate_policy_json(
                &json!({ "action": "adjust_params", "adjustments": [1, 2] }),
                false
            ),
            Err(PolicyValidationError::InvalidParameter { param: "adjustments", .. })
        ));
        assert!(matches!(
            validate_policy_json(
                &json!({ "action": "adjust_params", "adjustments": {}, "merge_strategy": "clobber" }),
                false
            ),
            Err(PolicyValidationError::InvalidParameter { param: "merge_strategy", .. })
        ));

        let validated = validate_policy_json(
            &json!({ "action": "adjust_params", "adjustments": { "timeout_secs": 120 } }),
            false,
        )
        .unwrap();
        match validated.action {
            PolicyAction::AdjustParams {
                adjustments,
                merge_strategy,
            } => {
                assert_eq!(adjustments["timeout_secs"], 120);
                assert_eq!(merge_strategy, "merge");
            }
            other => panic!("expected adjust_params, got {other:?}"),
        }
    }

    #[test]
    fn test_kill_requires_reason() {
        assert!(matches!(
            validate_policy_json(&json!({ "action": "kill" }), false),
            Err(PolicyValidationError::MissingParameter { param: "reason", .. })
        ));
        assert!(matches!(
            validate_policy_json(&json!({ "action": "kill", "reason": "  " }), false),
            Err(PolicyValidationError::MissingParameter { param: "reason", .. })
        ));
        let validated =
            validate_policy_json(&json!({ "action": "kill", "reason": "known-bad input" }), false)
                .unwrap();
        assert_eq!(
            validated.action,
            PolicyAction::Kill {
                reason: "known-bad input".to_string()
            }
        );
    }

    // -- validation: confidence and strictness --

    #[test]
    fn test_confidence_rules() {
        assert!(matches!(
            validate_policy_json(&json!({ "action": "skip", "confidence": 1.4 }), false),
            Err(PolicyValidationError::ConfidenceOutOfRange(_))
        ));
        assert!(matches!(
            validate_policy_json(&json!({ "action": "skip", "confidence": -0.1 }), false),
            Err(PolicyValidationError::ConfidenceOutOfRange(_))
        ));

        // Low confidence is a warning when lenient, a rejection when strict.
        let validated =
            validate_policy_json(&json!({ "action": "skip", "confidence": 0.3 }), false).unwrap();
        assert_eq!(validated.warnings.len(), 1);
        assert!(matches!(
            validate_policy_json(&json!({ "action": "skip", "confidence": 0.3 }), true),
            Err(PolicyValidationError::Strict(_))
        ));
    }

    #[test]
    fn test_unknown_keys_warn_then_reject_in_strict() {
        let value = json!({ "action": "requeue", "delay_minutes": 5, "retries": 9 });
        let validated = validate_policy_json(&value, false).unwrap();
        assert_eq!(validated.warnings, vec!["unknown key \"retries\""]);
        assert!(matches!(
            validate_policy_json(&value, true),
            Err(PolicyValidationError::Strict(_))
        ));
    }

    #[test]
    fn test_normalized_json_is_strictly_valid() {
        let validated = validate_policy_json(
            &json!({ "action": "requeue", "confidence": 0.9 }),
            false,
        )
        .unwrap();
        let normalized = validated.normalized_json();
        assert_eq!(normalized["action"], "requeue");
        assert_eq!(normalized["delay_minutes"], 0.0);
        assert_eq!(normalized["priority"], "normal");

        // Normalized output re-validates cleanly even in strict mode.
        let revalidated = validate_policy_json(&normalized, true).unwrap();
        assert_eq!(revalidated.action, validated.action);
    }

    #[test]
    fn test_risk_for_action() {
        assert_eq!(
            risk_for_action(&PolicyAction::Requeue {
                delay_minutes: 1.0,
                priority: "normal".to_string()
            }),
            RiskLevel::Low
        );
        assert_eq!(
            risk_for_action(&PolicyAction::AdjustParams {
                adjustments: serde_json::Map::new(),
                merge_strategy: "merge".to_string()
            }),
            RiskLevel::Medium
        );
        assert_eq!(
            risk_for_action(&PolicyAction::Kill {
                reason: "r".to_string()
            }),
            RiskLevel::High
        );
    }

    // -- storage --

    async fn setup() -> std::sync::Arc<OpsStore> {
        let path =
            std::env::temp_dir().join(format!("autonomic_policy_{}.db", uuid::Uuid::new_v4()));
        OpsStore::connect(&path).await.unwrap()
    }

    fn requeue_policy(signature: &str) -> NewPolicy {
        NewPolicy {
            signature: signature.to_string(),
            policy_type: "absorption".to_string(),
            policy_json: json!({ "action": "requeue", "delay_minutes": 15 }),
            risk_level: RiskLevel::Low,
            created_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_stores_normalized_probation_policy() {
        let store = setup().await;
        let policy_id = create_policy(&store, &requeue_policy("sig-a")).await.unwrap();

        let policy = get_policy(&store, &policy_id).await.unwrap().unwrap();
        assert_eq!(policy.status, PolicyStatus::Probation);
        assert_eq!(policy.signature, "sig-a");
        // Defaults were made explicit on the way in.
        assert_eq!(policy.policy_json["priority"], "normal");
        assert_eq!(policy.policy_json["delay_minutes"], 15.0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_json() {
        let store = setup().await;
        let mut bad = requeue_policy("sig-a");
        bad.policy_json = json!({ "action": "explode" });
        assert!(create_policy(&store, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_by_signature_and_status() {
        let store = setup().await;
        let first = create_policy(&store, &requeue_policy("sig-a")).await.unwrap();
        let _other_sig = create_policy(&store, &requeue_policy("sig-b")).await.unwrap();

        assert!(active_policy_for(&store, "sig-a").await.unwrap().is_none());
        let probation = probation_policy_for(&store, "sig-a").await.unwrap().unwrap();
        assert_eq!(probation.policy_id, first);

        assert!(live_policy_exists(&store, "sig-a").await.unwrap());
        assert!(!live_policy_exists(&store, "sig-zzz").await.unwrap());

        sqlx::query("UPDATE absorption_policies SET status = 'active' WHERE policy_id = ?")
            .bind(&first)
            .execute(store.pool())
            .await
            .unwrap();
        let active = active_policy_for(&store, "sig-a").await.unwrap().unwrap();
        assert_eq!(active.policy_id, first);
        assert!(probation_policy_for(&store, "sig-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_policy_row_degrades_to_none() {
        let store = setup().await;
        let policy_id = create_policy(&store, &requeue_policy("sig-a")).await.unwrap();
        sqlx::query("UPDATE absorption_policies SET policy_json = 'not json' WHERE policy_id = ?")
            .bind(&policy_id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(probation_policy_for(&store, "sig-a").await.unwrap().is_none());
        assert!(load_by_status(&store, PolicyStatus::Probation)
            .await
            .unwrap()
            .is_empty());
    }
}
