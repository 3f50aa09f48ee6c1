//! Pipeline execution engine.
//!
//! Runs declarative extract/transform/load chains with validation
//! gates between stages, checkpoint-based resume, and retry with
//! exponential backoff. Connectors plug in through the
//! [`connector`] traits and are resolved by tag from a
//! [`registry::ConnectorRegistry`]; run progress persists through any
//! [`batchline_state::CheckpointStore`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_panics_doc)]

pub mod config;
pub mod connector;
pub mod executor;
pub mod gate;
pub mod key;
pub mod registry;
pub mod retry;
pub mod transform;

pub use config::types::{
    IdempotencyKeySpec, PipelineDefinition, RetryConfig, StageDefinition, StageRole,
};
pub use connector::{Extractor, Loader, StageContext, Transformer, WriteMode, WriteResult};
pub use executor::{Executor, RunContext};
pub use registry::ConnectorRegistry;
