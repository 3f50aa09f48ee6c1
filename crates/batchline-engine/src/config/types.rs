//! Pipeline definition types.
//!
//! The engine accepts these as plain in-memory structures; how they
//! are produced (YAML file, API call, scheduler payload) is an
//! external loader's concern. [`parser`](crate::config::parser)
//! provides the YAML path.

use serde::{Deserialize, Serialize};

use batchline_types::ids::{PipelineId, StageName};
use batchline_types::rule::ValidationRule;
use batchline_types::schema::Schema;

use crate::connector::WriteMode;

/// Role of a stage in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Extract,
    Transform,
    Load,
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Load => "load",
        };
        f.write_str(s)
    }
}

/// How the stable checkpoint/dedup key is derived from a batch.
///
/// Declarative (rather than an arbitrary closure) so definitions stay
/// serializable and a resumed run derives identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdempotencyKeySpec {
    /// Key from the batch's run-unique sequence number (default).
    #[default]
    BatchSequence,
    /// Key from the named fields' values, hashed across rows. Also
    /// the per-row partition key for parallel load writes.
    Fields { fields: Vec<String> },
}

/// Retry/backoff parameters for recoverable stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Uniform random fraction applied to each delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

/// One stage of the pipeline chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: StageName,
    pub role: StageRole,
    /// Registry type tag selecting the connector implementation.
    pub connector: String,
    /// Opaque options map handed to the connector.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: IdempotencyKeySpec,
    /// Rules the validation gate applies to this stage's output.
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Declared output shape; checked by the gate when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
    /// Load stages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_mode: Option<WriteMode>,
    /// Per-invocation timeout; `None` = unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StageDefinition {
    /// Minimal constructor; builder-style setters fill the rest.
    #[must_use]
    pub fn new(name: impl Into<StageName>, role: StageRole, connector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            connector: connector.into(),
            config: serde_json::Value::Null,
            idempotency_key: IdempotencyKeySpec::default(),
            validation_rules: Vec::new(),
            output_schema: None,
            write_mode: None,
            timeout_ms: None,
        }
    }

    /// Attach connector options.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Attach validation rules.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<ValidationRule>) -> Self {
        self.validation_rules = rules;
        self
    }

    /// Declare the output schema.
    #[must_use]
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set the write mode (load stages).
    #[must_use]
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = Some(mode);
        self
    }

    /// Set the key derivation spec.
    #[must_use]
    pub fn with_idempotency_key(mut self, spec: IdempotencyKeySpec) -> Self {
        self.idempotency_key = spec;
        self
    }

    /// Set the per-invocation timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// An ordered list of stage definitions plus run-wide policy.
///
/// The chain is linear per logical dataset: one extract, any number of
/// transforms, one or more trailing loads. Arbitrary DAG scheduling is
/// the external workflow scheduler's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(rename = "pipeline")]
    pub pipeline_id: PipelineId,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Worker bound for batch-internal load parallelism.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    pub stages: Vec<StageDefinition>,
}

fn default_parallelism() -> u32 {
    1
}

impl PipelineDefinition {
    /// Construct with default retry policy and no parallelism.
    #[must_use]
    pub fn new(pipeline_id: impl Into<PipelineId>, stages: Vec<StageDefinition>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            retry: RetryConfig::default(),
            parallelism: 1,
            stages,
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the load parallelism degree.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }
}
