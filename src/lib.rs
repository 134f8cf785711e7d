//! Autonomic operations core for an agent task platform.
//!
//! This crate keeps a fleet of background task executors healthy without a
//! human in the loop. It watches the shared operations database for failed
//! and stalled work, classifies failures into a small closed taxonomy,
//! quarantines repeat offenders, learns remediation policies from root-cause
//! analysis, and drives long-running initiatives through a plan, review,
//! dev, verify lifecycle.
//!
//! Everything hangs off [`OpsStore`] (a SQLite pool over the operations
//! database) and runs from a single periodic tick owned by
//! [`cycle::CycleRunner`]. Individual subsystems are fail-open: an error in
//! one check is logged and absorbed so the rest of the cycle still runs.

pub mod classifier;
pub mod config;
pub mod cycle;
pub mod health;
pub mod immune;
pub mod initiative;
pub mod quarantine;
pub mod rca;
pub mod store;
pub mod stuck;
pub mod task;

pub use classifier::{FailureClass, FailureClassification};
pub use config::AutonomicConfig;
pub use cycle::{spawn_autonomic_loop, CycleOutcome, CycleReport, CycleRunner};
pub use health::{HealthCheckResult, HealthLevel, HealthMonitor};
pub use immune::ImmuneSystem;
pub use initiative::InitiativeOrchestrator;
pub use quarantine::QuarantineManager;
pub use rca::{DevDispatch, RootCauseAnalyzer, WorkerPool};
pub use store::OpsStore;
pub use stuck::StuckMonitor;
pub use task::{Task, TaskStatus};

use thiserror::Error;

/// Errors produced by the operations layer.
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("operations database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("operations engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
