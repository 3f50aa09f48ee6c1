//! Checkpoint persistence for the batchline pipeline engine.
//!
//! Provides the [`CheckpointStore`] trait, a [`SqliteCheckpointStore`]
//! for durable file-backed state, and a [`MemoryCheckpointStore`] for
//! tests and embedding.

#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::StateError;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use store::CheckpointStore;
