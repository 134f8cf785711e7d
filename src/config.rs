//! Operations-layer configuration.
//!
//! A single flat struct of tunables, loaded from the host config file and
//! swapped atomically at runtime. Every threshold the subsystems consult
//! lives here so behaviour can be tuned without a rebuild.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tunables for the autonomic operations layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomicConfig {
    /// Master switch. When false the tick loop idles without touching the
    /// database.
    pub enabled: bool,

    /// Seconds between autonomic cycles.
    pub tick_interval_secs: u64,

    /// Seconds between initiative orchestrator passes. Runs less often than
    /// the main cycle because phase transitions are slow-moving.
    pub orchestrator_interval_secs: u64,

    // -- failure classification and retry --
    /// Maximum retry attempts before a task is quarantined instead of
    /// requeued.
    pub max_retries: u32,

    /// Base delay in seconds for linear retry backoff (network and generic
    /// task errors).
    pub retry_delay_secs: u64,

    /// Base delay in seconds for rate-limit exponential backoff.
    pub rate_limit_base_secs: u64,

    /// Cap in seconds for rate-limit exponential backoff.
    pub rate_limit_max_secs: u64,

    /// Fallback pause in seconds when a billing-cap message carries no
    /// parseable reset time.
    pub billing_pause_fallback_secs: u64,

    // -- systemic failure detection --
    /// Lookback window in minutes for the systemic failure check.
    pub systemic_window_mins: i64,

    /// Distinct failed tasks of one class inside the window that count as a
    /// systemic pattern.
    pub systemic_class_threshold: i64,

    // -- quarantine --
    /// Quarantine TTL per reason code, in milliseconds.
    pub quarantine_ttl_ms: HashMap<String, u64>,

    /// TTL in milliseconds for reasons not listed in `quarantine_ttl_ms`.
    pub default_quarantine_ttl_ms: u64,

    // -- stuck run detection --
    /// Seconds without a heartbeat before a running execution counts as
    /// stuck.
    pub stuck_heartbeat_secs: i64,

    // -- immune system --
    /// Minimum RCA confidence before a probation policy is seeded from an
    /// analysis.
    pub auto_fix_confidence: f64,

    /// Simulate evaluations required before a probation policy is eligible
    /// for promotion.
    pub promotion_min_simulations: i64,

    /// Verified pass rate required for promotion.
    pub promotion_pass_rate: f64,

    /// Maximum promotions in any rolling 24 hour window.
    pub promotion_daily_cap: i64,

    /// Verified failures that disable a probation policy.
    pub probation_fail_limit: i64,

    /// Days a probation policy may sit without promotion before it is
    /// disabled as stale.
    pub probation_max_age_days: i64,

    // -- initiative orchestration --
    /// Finished dev tasks inspected when judging dev-phase health.
    pub replan_window: i64,

    /// Failures inside the replan window that trigger a replan.
    pub replan_failure_threshold: i64,

    // -- health checks --
    /// Hours of uptime before the "no tasks dispatched" check may fail.
    pub health_uptime_grace_hours: i64,

    /// Hours in progress before a task counts as stuck for health purposes.
    pub health_stuck_hours: i64,

    /// Stuck task count that degrades health to warning.
    pub health_stuck_warn: i64,

    /// Stuck task count that degrades health to critical.
    pub health_stuck_critical: i64,

    /// Minutes since the last completed task before health degrades.
    pub health_last_success_warn_mins: i64,

    /// Queued task backlog that degrades health.
    pub health_queue_depth_warn: i64,
}

impl Default for AutonomicConfig {
    fn default() -> Self {
        let mut quarantine_ttl_ms = HashMap::new();
        quarantine_ttl_ms.insert("repeated_failure".to_string(), 24 * 60 * 60 * 1000);
        quarantine_ttl_ms.insert("resource_hog".to_string(), 60 * 60 * 1000);
        quarantine_ttl_ms.insert("stuck_repeatedly".to_string(), 6 * 60 * 60 * 1000);

        Self {
            enabled: true,
            tick_interval_secs: 30,
            orchestrator_interval_secs: 300,
            max_retries: 3,
            retry_delay_secs: 60,
            rate_limit_base_secs: 60,
            rate_limit_max_secs: 3600,
            billing_pause_fallback_secs: 3600,
            systemic_window_mins: 30,
            systemic_class_threshold: 3,
            quarantine_ttl_ms,
            default_quarantine_ttl_ms: 12 * 60 * 60 * 1000,
            stuck_heartbeat_secs: 300,
            auto_fix_confidence: 0.7,
            promotion_min_simulations: 2,
            promotion_pass_rate: 0.9,
            promotion_daily_cap: 3,
            probation_fail_limit: 2,
            probation_max_age_days: 7,
            replan_window: 5,
            replan_failure_threshold: 3,
            health_uptime_grace_hours: 3,
            health_stuck_hours: 2,
            health_stuck_warn: 3,
            health_stuck_critical: 10,
            health_last_success_warn_mins: 360,
            health_queue_depth_warn: 50,
        }
    }
}

impl AutonomicConfig {
    /// TTL in milliseconds for a quarantine reason, falling back to the
    /// default when the reason has no dedicated entry.
    pub fn quarantine_ttl_for(&self, reason: &str) -> u64 {
        self.quarantine_ttl_ms
            .get(reason)
            .copied()
            .unwrap_or(self.default_quarantine_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AutonomicConfig::default();
        assert!(config.enabled);
        assert!(config.tick_interval_secs > 0);
        assert!(config.promotion_pass_rate > 0.0 && config.promotion_pass_rate <= 1.0);
        assert!(config.health_stuck_critical > config.health_stuck_warn);
    }

    #[test]
    fn test_quarantine_ttl_lookup() {
        let config = AutonomicConfig::default();
        assert_eq!(
            config.quarantine_ttl_for("repeated_failure"),
            24 * 60 * 60 * 1000
        );
        assert_eq!(config.quarantine_ttl_for("resource_hog"), 60 * 60 * 1000);
        // Unlisted reasons use the default.
        assert_eq!(
            config.quarantine_ttl_for("manual"),
            config.default_quarantine_ttl_ms
        );
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: AutonomicConfig =
            serde_json::from_str(r#"{ "max_retries": 5 }"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.tick_interval_secs, 30);
    }
}
