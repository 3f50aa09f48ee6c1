//! In-memory implementation of [`CheckpointStore`].
//!
//! Backed by an `RwLock`ed map: concurrent readers, serialized
//! writers. Used by tests and by embedders that don't need durability.

use std::collections::HashMap;
use std::sync::RwLock;

use batchline_types::checkpoint::{Checkpoint, CheckpointStatus};
use batchline_types::ids::{RunId, StageName};

use crate::error::{self, StateError};
use crate::store::CheckpointStore;

type Key = (RunId, StageName, String);

/// Non-durable checkpoint storage with the same append-only semantics
/// as the SQLite store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    // Insertion order kept alongside for list_for_run.
    inner: RwLock<(HashMap<Key, Checkpoint>, Vec<Key>)>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(
        &self,
        run_id: &RunId,
        stage_name: &StageName,
        key: &str,
    ) -> error::Result<Option<Checkpoint>> {
        let guard = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(guard
            .0
            .get(&(run_id.clone(), stage_name.clone(), key.to_string()))
            .cloned())
    }

    fn put(&self, checkpoint: &Checkpoint) -> error::Result<()> {
        let mut guard = self.inner.write().map_err(|_| StateError::LockPoisoned)?;
        let key: Key = (
            checkpoint.run_id.clone(),
            checkpoint.stage_name.clone(),
            checkpoint.idempotency_key.clone(),
        );

        if let Some(existing) = guard.0.get(&key) {
            if existing.same_conclusion(checkpoint) {
                return Ok(());
            }
            if existing.status == CheckpointStatus::Completed {
                return Err(StateError::Conflict {
                    run_id: checkpoint.run_id.as_str().to_string(),
                    stage: checkpoint.stage_name.as_str().to_string(),
                    key: checkpoint.idempotency_key.clone(),
                });
            }
        } else {
            guard.1.push(key.clone());
        }

        guard.0.insert(key, checkpoint.clone());
        Ok(())
    }

    fn list_for_run(&self, run_id: &RunId) -> error::Result<Vec<Checkpoint>> {
        let guard = self.inner.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(guard
            .1
            .iter()
            .filter(|(rid, _, _)| rid == run_id)
            .filter_map(|k| guard.0.get(k))
            .cloned()
            .collect())
    }
}
