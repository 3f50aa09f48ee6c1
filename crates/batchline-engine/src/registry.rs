//! Connector registry: the type-tag to implementation mapping.
//!
//! An explicit object passed into the executor, scoped to process
//! lifetime — never ambient global state. Pipeline definitions refer
//! to connectors by type tag (e.g. `"csv"`, `"postgres"`); the
//! registry resolves tags at run time so the executor never branches
//! on connector type.

use std::collections::HashMap;
use std::sync::Arc;

use batchline_types::error::StageError;

use crate::connector::{Extractor, Loader, Transformer};
use crate::transform::{AggregateTransformer, CleanTransformer};

/// Registered connector implementations keyed by type tag.
#[derive(Default)]
pub struct ConnectorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
    transformers: HashMap<String, Arc<dyn Transformer>>,
    loaders: HashMap<String, Arc<dyn Loader>>,
}

impl ConnectorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the engine's built-in connectors:
    /// the `clean` and `aggregate` transformers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_transformer("clean", Arc::new(CleanTransformer));
        registry.register_transformer("aggregate", Arc::new(AggregateTransformer));
        registry
    }

    /// Register a source connector under `tag`, replacing any previous
    /// registration.
    pub fn register_extractor(&mut self, tag: impl Into<String>, connector: Arc<dyn Extractor>) {
        self.extractors.insert(tag.into(), connector);
    }

    /// Register a transform connector under `tag`.
    pub fn register_transformer(
        &mut self,
        tag: impl Into<String>,
        connector: Arc<dyn Transformer>,
    ) {
        self.transformers.insert(tag.into(), connector);
    }

    /// Register a sink connector under `tag`.
    pub fn register_loader(&mut self, tag: impl Into<String>, connector: Arc<dyn Loader>) {
        self.loaders.insert(tag.into(), connector);
    }

    /// Resolve a source connector.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`StageError::config`] for an unknown tag.
    pub fn extractor(&self, tag: &str) -> Result<Arc<dyn Extractor>, StageError> {
        self.extractors.get(tag).cloned().ok_or_else(|| {
            StageError::config("UNKNOWN_CONNECTOR", format!("no extractor registered for tag '{tag}'"))
        })
    }

    /// Resolve a transform connector.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`StageError::config`] for an unknown tag.
    pub fn transformer(&self, tag: &str) -> Result<Arc<dyn Transformer>, StageError> {
        self.transformers.get(tag).cloned().ok_or_else(|| {
            StageError::config(
                "UNKNOWN_CONNECTOR",
                format!("no transformer registered for tag '{tag}'"),
            )
        })
    }

    /// Resolve a sink connector.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`StageError::config`] for an unknown tag.
    pub fn loader(&self, tag: &str) -> Result<Arc<dyn Loader>, StageError> {
        self.loaders.get(tag).cloned().ok_or_else(|| {
            StageError::config("UNKNOWN_CONNECTOR", format!("no loader registered for tag '{tag}'"))
        })
    }
}
