//! Durable per-run, per-stage progress markers.
//!
//! A checkpoint records the conclusion of one stage invocation for a
//! specific `(run, stage, idempotency key)`. Checkpoints are
//! append-only: the store never mutates one after write, which is what
//! makes crash-and-resume safe. The single sanctioned supersession is
//! FAILED being replaced on a later attempt.

use serde::{Deserialize, Serialize};

use crate::batch::RecordBatch;
use crate::ids::{RunId, StageName};

/// Terminal status of a stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

impl CheckpointStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one concluded stage invocation.
///
/// `output_batch` caches the stage's output for extract/transform
/// stages so a resumed run can rehydrate the in-flight batch without
/// re-invoking completed connectors. Load checkpoints carry counts
/// instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub stage_name: StageName,
    pub idempotency_key: String,
    pub status: CheckpointStatus,
    /// ISO-8601 UTC timestamp of when the checkpoint was recorded.
    pub recorded_at: String,
    /// Content digest of the stage's output (hex SHA-256).
    pub output_fingerprint: String,
    /// Attempts consumed by the invocation that produced this record.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_batch: Option<RecordBatch>,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default)]
    pub rows_skipped: u64,
}

impl Checkpoint {
    /// Completed checkpoint for a stage that produced a batch.
    #[must_use]
    pub fn completed_with_output(
        run_id: RunId,
        stage_name: StageName,
        idempotency_key: impl Into<String>,
        attempts: u32,
        output: &RecordBatch,
    ) -> Self {
        Self {
            run_id,
            stage_name,
            idempotency_key: idempotency_key.into(),
            status: CheckpointStatus::Completed,
            recorded_at: chrono::Utc::now().to_rfc3339(),
            output_fingerprint: output.fingerprint(),
            attempts,
            output_batch: Some(output.clone()),
            rows_written: 0,
            rows_skipped: 0,
        }
    }

    /// Completed checkpoint for a load stage.
    #[must_use]
    pub fn completed_load(
        run_id: RunId,
        stage_name: StageName,
        idempotency_key: impl Into<String>,
        attempts: u32,
        input_fingerprint: impl Into<String>,
        rows_written: u64,
        rows_skipped: u64,
    ) -> Self {
        Self {
            run_id,
            stage_name,
            idempotency_key: idempotency_key.into(),
            status: CheckpointStatus::Completed,
            recorded_at: chrono::Utc::now().to_rfc3339(),
            output_fingerprint: input_fingerprint.into(),
            attempts,
            output_batch: None,
            rows_written,
            rows_skipped,
        }
    }

    /// Failed checkpoint (fatal error or gate failure).
    #[must_use]
    pub fn failed(
        run_id: RunId,
        stage_name: StageName,
        idempotency_key: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            run_id,
            stage_name,
            idempotency_key: idempotency_key.into(),
            status: CheckpointStatus::Failed,
            recorded_at: chrono::Utc::now().to_rfc3339(),
            output_fingerprint: String::new(),
            attempts,
            output_batch: None,
            rows_written: 0,
            rows_skipped: 0,
        }
    }

    /// Identity triple used for conflict detection in stores.
    #[must_use]
    pub fn key(&self) -> (&RunId, &StageName, &str) {
        (&self.run_id, &self.stage_name, &self.idempotency_key)
    }

    /// Whether `other` records the same conclusion for the same key.
    /// Identical re-puts are idempotent no-ops in the store.
    #[must_use]
    pub fn same_conclusion(&self, other: &Self) -> bool {
        self.key() == other.key()
            && self.status == other.status
            && self.output_fingerprint == other.output_fingerprint
    }
}
