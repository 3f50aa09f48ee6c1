//! Connector capability traits and invocation context.
//!
//! Concrete connectors (CSV readers, database writers, HTTP fetchers)
//! live outside the engine; these traits are the narrow interface the
//! executor consumes. Connectors classify their own failures as
//! recoverable or fatal via [`StageError`] factories, and connectors
//! that write externally must deduplicate by the idempotency key the
//! context carries — the executor may invoke them more than once with
//! the same input.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use batchline_types::batch::RecordBatch;
use batchline_types::error::StageError;
use batchline_types::ids::{PipelineId, RunId, StageName};

/// How a load connector applies a batch to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Blind append; relies on the target tolerating duplicates.
    Append,
    /// Insert-or-update keyed by the idempotency key (the engine's
    /// default, and what makes re-runs safe).
    Upsert,
    /// Replace the target's contents.
    Overwrite,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Append => "append",
            Self::Upsert => "upsert",
            Self::Overwrite => "overwrite",
        };
        f.write_str(s)
    }
}

/// Outcome of one load connector write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub rows_written: u64,
    /// Rows not applied (e.g. deduplicated by key). Any skip demotes
    /// the run from SUCCEEDED to PARTIALLY_SUCCEEDED.
    pub rows_skipped: u64,
    /// Where the data landed (table name, file path, ...).
    pub target_ref: String,
}

impl WriteResult {
    /// Merge partition-level results into one stage-level result.
    #[must_use]
    pub fn merge(results: &[WriteResult]) -> Self {
        Self {
            rows_written: results.iter().map(|r| r.rows_written).sum(),
            rows_skipped: results.iter().map(|r| r.rows_skipped).sum(),
            target_ref: results
                .first()
                .map(|r| r.target_ref.clone())
                .unwrap_or_default(),
        }
    }
}

/// Everything a connector sees about the invocation at hand.
///
/// `config` is the stage's opaque options map from the pipeline
/// definition; `cancellation` must be observed by long-running
/// connectors so a cancelled run can stop within the grace period.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub stage_name: StageName,
    pub config: serde_json::Value,
    /// Stable key for this invocation; load connectors deduplicate
    /// writes by it.
    pub idempotency_key: String,
    /// Environment overrides from the run context.
    pub env: BTreeMap<String, String>,
    pub cancellation: CancellationToken,
}

/// Source capability: produce a batch from an external system.
/// Extract stages take no batch input, only their configured spec.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch one batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] classified by the connector
    /// (e.g. [`StageError::source_transient`] for a timeout,
    /// [`StageError::source_fatal`] for an auth failure).
    async fn fetch(&self, ctx: &StageContext) -> Result<RecordBatch, StageError>;
}

/// Transform capability: strict 1:1 batch in, batch out. Must not
/// mutate the input in place; produce a new batch.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Apply the transformation.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] classified by the connector.
    async fn apply(
        &self,
        batch: RecordBatch,
        ctx: &StageContext,
    ) -> Result<RecordBatch, StageError>;
}

/// Sink capability: consume a batch terminally.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Write the batch in the given mode. Must be idempotent per the
    /// context's idempotency key.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] classified by the connector.
    async fn write(
        &self,
        batch: &RecordBatch,
        mode: WriteMode,
        ctx: &StageContext,
    ) -> Result<WriteResult, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_result_merge_sums_counts() {
        let merged = WriteResult::merge(&[
            WriteResult {
                rows_written: 10,
                rows_skipped: 1,
                target_ref: "warehouse.customers".into(),
            },
            WriteResult {
                rows_written: 5,
                rows_skipped: 0,
                target_ref: "warehouse.customers".into(),
            },
        ]);
        assert_eq!(merged.rows_written, 15);
        assert_eq!(merged.rows_skipped, 1);
        assert_eq!(merged.target_ref, "warehouse.customers");
    }

    #[test]
    fn write_result_merge_empty() {
        let merged = WriteResult::merge(&[]);
        assert_eq!(merged.rows_written, 0);
        assert_eq!(merged.rows_skipped, 0);
        assert!(merged.target_ref.is_empty());
    }

    #[test]
    fn write_mode_serde() {
        assert_eq!(serde_json::to_string(&WriteMode::Upsert).unwrap(), "\"upsert\"");
        let back: WriteMode = serde_json::from_str("\"overwrite\"").unwrap();
        assert_eq!(back, WriteMode::Overwrite);
    }
}
