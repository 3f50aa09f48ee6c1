//! The unit of data moving through a pipeline.
//!
//! A [`RecordBatch`] is an ordered set of uniformly-schemed rows.
//! Transforms produce new batches rather than mutating in place; the
//! executor owns a batch while it is in flight between stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::Schema;
use crate::value::Value;

/// One row: field name to typed value. `BTreeMap` keeps serialization
/// order stable so fingerprints are deterministic.
pub type Row = BTreeMap<String, Value>;

/// An ordered sequence of rows with a shared schema and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub schema: Schema,
    pub rows: Vec<Row>,
    /// Provenance tag of the producing source.
    pub source_id: String,
    /// Monotonically increasing within a run; unique per run.
    pub batch_sequence: u64,
}

impl RecordBatch {
    /// Construct a batch.
    #[must_use]
    pub fn new(
        schema: Schema,
        rows: Vec<Row>,
        source_id: impl Into<String>,
        batch_sequence: u64,
    ) -> Self {
        Self {
            schema,
            rows,
            source_id: source_id.into(),
            batch_sequence,
        }
    }

    /// Number of rows in the batch.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch carries no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replace the rows, keeping schema and provenance. Used by
    /// transforms that filter or rewrite row content.
    #[must_use]
    pub fn with_rows(&self, rows: Vec<Row>) -> Self {
        Self {
            schema: self.schema.clone(),
            rows,
            source_id: self.source_id.clone(),
            batch_sequence: self.batch_sequence,
        }
    }

    /// Replace schema and rows together (shape-changing transforms).
    #[must_use]
    pub fn with_schema_and_rows(&self, schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows,
            source_id: self.source_id.clone(),
            batch_sequence: self.batch_sequence,
        }
    }

    /// Content fingerprint: SHA-256 over the canonical JSON encoding,
    /// hex-encoded. Identical content always yields the same digest,
    /// which is what checkpoint resume verification relies on.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        hex::encode(digest)
    }
}
