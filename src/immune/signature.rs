//! Failure signatures: stable fingerprints for recurring failures.
//!
//! A signature hashes where a failure happened (layer, step) and what kind
//! it was (reason code), not the raw error text, so two occurrences of the
//! same underlying problem land on the same row even when the messages
//! differ in detail.

use crate::store::OpsStore;
use crate::task::Task;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// A derived failure fingerprint plus the components it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureSignature {
    pub signature: String,
    pub layer: String,
    pub step: String,
    pub reason_code: String,
}

fn normalize(component: &str) -> String {
    component
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl FailureSignature {
    /// Derive a signature from its three components. Components are trimmed,
    /// lowercased, and whitespace-collapsed before hashing, then SHA-256
    /// truncated to 16 hex chars.
    pub fn derive(layer: &str, step: &str, reason_code: &str) -> Self {
        let layer = normalize(layer);
        let step = normalize(step);
        let reason_code = normalize(reason_code);
        let digest = Sha256::digest(format!("{layer}|{step}|{reason_code}").as_bytes());
        let mut signature = format!("{digest:x}");
        signature.truncate(16);
        Self {
            signature,
            layer,
            step,
            reason_code,
        }
    }
}

/// Best-effort signature components for a failed task. Executors that report
/// structured error details get precise fingerprints; the rest fall back to
/// task shape plus the classified failure class.
pub fn components_for_task(task: &Task) -> (String, String, String) {
    let details = task.payload.error_details.as_ref();
    let layer = details
        .and_then(|d| d.layer.clone())
        .unwrap_or_else(|| "execution".to_string());
    let step = details
        .and_then(|d| d.step.clone())
        .or_else(|| task.payload.current_step.clone())
        .unwrap_or_else(|| task.task_type.clone());
    let reason_code = details
        .and_then(|d| d.reason_code.clone())
        .or_else(|| {
            task.payload
                .failure_classification
                .as_ref()
                .map(|c| c.class.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    (layer, step, reason_code)
}

/// Signature aggregate as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignatureRecord {
    pub signature: String,
    pub layer: String,
    pub step: String,
    pub reason_code: String,
    pub occurrence_count: i64,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

/// Upsert one occurrence of a signature and return the running count.
pub async fn record_occurrence(store: &OpsStore, sig: &FailureSignature) -> Result<i64> {
    sqlx::query(
        "INSERT INTO failure_signatures (signature, layer, step, reason_code, occurrence_count)
         VALUES (?, ?, ?, ?, 1)
         ON CONFLICT(signature) DO UPDATE SET
             occurrence_count = occurrence_count + 1,
             last_seen_at = datetime('now')",
    )
    .bind(&sig.signature)
    .bind(&sig.layer)
    .bind(&sig.step)
    .bind(&sig.reason_code)
    .execute(store.pool())
    .await
    .context("record signature occurrence")?;

    let (count,): (i64,) =
        sqlx::query_as("SELECT occurrence_count FROM failure_signatures WHERE signature = ?")
            .bind(&sig.signature)
            .fetch_one(store.pool())
            .await
            .context("read signature count")?;
    Ok(count)
}

pub async fn get_signature(
    store: &OpsStore,
    signature: &str,
) -> Result<Option<SignatureRecord>> {
    let row = sqlx::query_as(
        "SELECT signature, layer, step, reason_code, occurrence_count, first_seen_at, last_seen_at
         FROM failure_signatures WHERE signature = ?",
    )
    .bind(signature)
    .fetch_optional(store.pool())
    .await
    .context("load signature")?;
    Ok(row)
}
