//! Idempotency key derivation.
//!
//! Keys must be stable across re-runs of the same run id: a resumed
//! run derives the same key for the same stage input, which is what
//! lets the checkpoint lookup skip completed work and lets load
//! connectors deduplicate writes. All hashing goes through SHA-256 so
//! keys are platform-independent.

use sha2::{Digest, Sha256};

use batchline_types::batch::{RecordBatch, Row};
use batchline_types::error::StageError;
use batchline_types::value::Value;

use crate::config::types::{IdempotencyKeySpec, StageDefinition};

/// Key for an extract stage, which has no input batch: a digest of the
/// stage's identity and its connector options. Changing the extraction
/// spec changes the key, so a re-run with edited config re-extracts.
#[must_use]
pub fn extract_key(stage: &StageDefinition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.name.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(stage.connector.as_bytes());
    hasher.update([0x1f]);
    hasher.update(stage.config.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for a stage consuming `batch`.
///
/// # Errors
///
/// Returns a fatal config error if a `Fields` spec names a field
/// absent from every row.
pub fn batch_key(spec: &IdempotencyKeySpec, batch: &RecordBatch) -> Result<String, StageError> {
    match spec {
        IdempotencyKeySpec::BatchSequence => Ok(format!("seq-{}", batch.batch_sequence)),
        IdempotencyKeySpec::Fields { fields } => {
            let known = batch.rows.iter().any(|row| {
                fields.iter().all(|f| row.contains_key(f))
            });
            if !batch.rows.is_empty() && !known {
                return Err(StageError::config(
                    "KEY_FIELDS_ABSENT",
                    format!("key fields {fields:?} absent from batch rows"),
                ));
            }
            let mut hasher = Sha256::new();
            for row in &batch.rows {
                hasher.update(row_key_material(fields, row).as_bytes());
                hasher.update([0x1e]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Per-row dedup key under a `Fields` spec.
#[must_use]
pub fn row_key(fields: &[String], row: &Row) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row_key_material(fields, row).as_bytes());
    hex::encode(hasher.finalize())
}

/// Partition index for a row so parallel load workers never share a
/// key: rows with equal key material always land in the same
/// partition.
#[must_use]
pub fn row_partition(fields: &[String], row: &Row, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(row_key_material(fields, row).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as usize
}

fn row_key_material(fields: &[String], row: &Row) -> String {
    fields
        .iter()
        .map(|f| row.get(f).map_or_else(|| "\u{0}".to_string(), Value::canonical))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}
