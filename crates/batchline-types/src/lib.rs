//! Shared data model for the batchline pipeline engine.
//!
//! Pure data types used across the engine and state crates: typed
//! values, schemas, record batches, validation rules, checkpoints,
//! run reports, and the structured stage error model.

#![warn(clippy::pedantic)]

pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod ids;
pub mod report;
pub mod rule;
pub mod schema;
pub mod value;
