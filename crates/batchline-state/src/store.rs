//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] defines the storage contract for per-run,
//! per-stage progress records. Model types live in
//! [`batchline_types::checkpoint`].

use batchline_types::checkpoint::Checkpoint;
use batchline_types::ids::{RunId, StageName};

use crate::error;

/// Storage contract for checkpoints.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn CheckpointStore>`, support concurrent readers, and
/// serialize writers per `(run, stage, key)`.
///
/// Semantics of [`put`](CheckpointStore::put) — append-only with one
/// sanctioned supersession:
/// - no existing record: insert;
/// - existing record with the same conclusion: idempotent no-op;
/// - existing FAILED record: replaced (a later attempt concluded);
/// - existing COMPLETED record and the incoming one differs:
///   [`StateError::Conflict`](crate::StateError::Conflict).
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a `(run, stage, key)` triple.
    ///
    /// Returns `Ok(None)` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get(
        &self,
        run_id: &RunId,
        stage_name: &StageName,
        key: &str,
    ) -> error::Result<Option<Checkpoint>>;

    /// Persist a checkpoint under the append-only rules above.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`](crate::StateError::Conflict)
    /// on a conflicting write, or another [`StateError`](crate::StateError)
    /// on storage failure.
    fn put(&self, checkpoint: &Checkpoint) -> error::Result<()>;

    /// All checkpoints recorded for a run, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn list_for_run(&self, run_id: &RunId) -> error::Result<Vec<Checkpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (used as `dyn CheckpointStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn CheckpointStore) {}
    }
}
