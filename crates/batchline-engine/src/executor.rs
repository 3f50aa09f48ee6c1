//! The run executor: drives one pipeline run through its stage chain.
//!
//! Each stage goes through the same lifecycle: derive the idempotency
//! key, consult the checkpoint store (a prior COMPLETED record skips
//! the connector entirely), invoke the connector under the retry
//! policy, evaluate the validation gate, and persist the conclusion as
//! a checkpoint. A fatal failure halts the chain; downstream stages
//! are reported as not run.
//!
//! Re-running with the same run id resumes from the first stage
//! without a COMPLETED checkpoint. Extract and transform checkpoints
//! cache their output batch, so resuming rehydrates the in-flight data
//! without touching external systems.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchline_state::CheckpointStore;
use batchline_types::batch::{RecordBatch, Row};
use batchline_types::checkpoint::{Checkpoint, CheckpointStatus};
use batchline_types::error::StageError;
use batchline_types::ids::RunId;
use batchline_types::report::{
    ReportEntry, RunReport, RunState, StageOutcome, StageReport, ValidationSummary,
};
use batchline_types::rule::Severity;
use batchline_types::schema::Schema;

use crate::config::types::{IdempotencyKeySpec, PipelineDefinition, StageDefinition, StageRole};
use crate::config::validator::validate_definition;
use crate::connector::{Loader, StageContext, WriteMode, WriteResult};
use crate::gate::evaluate_gate;
use crate::key;
use crate::registry::ConnectorRegistry;
use crate::retry::RetryPolicy;

/// Default grace a cancelled stage gets to finish before being
/// abandoned.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Caller-supplied identity and control surface for one run.
///
/// Re-running with the same `run_id` resumes; a fresh `run_id` starts
/// from scratch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub cancellation: CancellationToken,
    /// Environment overrides surfaced to connectors.
    pub env: BTreeMap<String, String>,
    /// How long a cancelled in-flight stage may keep running before
    /// the executor abandons it. Defaults to 5 seconds.
    pub cancel_grace: Duration,
}

impl RunContext {
    #[must_use]
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            cancellation: CancellationToken::new(),
            env: BTreeMap::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Drives pipeline runs against a checkpoint store and a connector
/// registry.
pub struct Executor {
    store: Arc<dyn CheckpointStore>,
    registry: Arc<ConnectorRegistry>,
}

/// Everything one stage contributes back to the run report.
struct StageRun {
    report: StageReport,
    entries: Vec<ReportEntry>,
    /// Output to feed downstream (extract/transform only).
    output: Option<RecordBatch>,
    failed: bool,
}

impl Executor {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, registry: Arc<ConnectorRegistry>) -> Self {
        Self { store, registry }
    }

    /// Execute one run of `definition` to a terminal state.
    ///
    /// Never returns `Err`; every outcome, including definition
    /// errors, is a [`RunReport`].
    pub async fn run(&self, definition: &PipelineDefinition, ctx: &RunContext) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport {
            run_id: ctx.run_id.clone(),
            pipeline_id: definition.pipeline_id.clone(),
            final_state: RunState::Pending,
            started_at: Utc::now().to_rfc3339(),
            duration_secs: 0.0,
            stages: Vec::new(),
            entries: Vec::new(),
        };

        if let Err(err) = validate_definition(definition) {
            warn!(
                pipeline_id = %definition.pipeline_id,
                run_id = %ctx.run_id,
                error = %err,
                "run rejected by definition validation"
            );
            for stage in &definition.stages {
                report.stages.push(not_run_report(stage));
            }
            report.entries.push(ReportEntry {
                severity: Severity::Error,
                stage: definition
                    .stages
                    .first()
                    .map_or_else(|| "definition".into(), |s| s.name.clone()),
                field: None,
                message: err.to_string(),
            });
            report.final_state = RunState::Failed;
            report.duration_secs = started.elapsed().as_secs_f64();
            return report;
        }

        report.final_state = RunState::Running;
        info!(
            pipeline_id = %definition.pipeline_id,
            run_id = %ctx.run_id,
            stages = definition.stages.len(),
            "run started"
        );

        let policy = RetryPolicy::new(definition.retry.clone());
        // The in-flight batch. Producing stages replace it; load stages
        // read it without consuming, so several trailing loads can
        // write the same batch.
        let mut current: Option<RecordBatch> = None;
        let mut failed = false;
        let mut any_rows_skipped = false;

        for stage in &definition.stages {
            if failed {
                report.stages.push(not_run_report(stage));
                continue;
            }

            let mut run = self
                .run_stage(definition, stage, &policy, current.clone(), ctx)
                .await;

            any_rows_skipped |= run.report.rows_skipped > 0;
            failed |= run.failed;
            if let Some(output) = run.output.take() {
                current = Some(output);
            }
            report.entries.append(&mut run.entries);
            report.stages.push(run.report);
        }

        report.final_state = if failed {
            RunState::Failed
        } else if any_rows_skipped {
            RunState::PartiallySucceeded
        } else {
            RunState::Succeeded
        };
        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            pipeline_id = %definition.pipeline_id,
            run_id = %ctx.run_id,
            final_state = %report.final_state,
            duration_secs = report.duration_secs,
            "run finished"
        );
        report
    }

    async fn run_stage(
        &self,
        definition: &PipelineDefinition,
        stage: &StageDefinition,
        policy: &RetryPolicy,
        input: Option<RecordBatch>,
        ctx: &RunContext,
    ) -> StageRun {
        let stage_started = Instant::now();
        let rows_in = input.as_ref().map_or(0, |b| b.num_rows() as u64);

        // Key derivation can itself fail on a misconfigured Fields
        // spec; without a key there is nothing to checkpoint.
        let idempotency_key = match derive_key(stage, input.as_ref()) {
            Ok(k) => k,
            Err(err) => return fail_without_checkpoint(stage, err, rows_in, stage_started),
        };

        match self.store.get(&ctx.run_id, &stage.name, &idempotency_key) {
            Ok(Some(cp)) if cp.status == CheckpointStatus::Completed => {
                return skip_completed(stage, cp, rows_in, stage_started);
            }
            Ok(_) => {}
            Err(err) => {
                let err = StageError::internal("STATE_BACKEND", err.to_string());
                return fail_without_checkpoint(stage, err, rows_in, stage_started);
            }
        }

        // Load stages gate their inbound batch before any external
        // effect; the verdict is retry-invariant, so it is evaluated
        // once here rather than per attempt.
        let mut load_gate = ValidationSummary::default();
        let mut gate_entries: Vec<ReportEntry> = Vec::new();
        if stage.role == StageRole::Load {
            let Some(batch) = input.as_ref() else {
                let err = StageError::internal("NO_INPUT", "load stage has no input batch");
                return fail_without_checkpoint(stage, err, rows_in, stage_started);
            };
            let gate = evaluate_gate(
                &stage.name,
                &stage.validation_rules,
                stage.output_schema.as_ref(),
                batch,
            );
            load_gate = gate.summary;
            gate_entries = gate.entries;
            if load_gate.error_violations > 0 {
                let err = StageError::validation(
                    "GATE_FAILED",
                    format!(
                        "{} error violation(s) in input of '{}'",
                        load_gate.error_violations, stage.name
                    ),
                );
                return self.fail_stage(
                    stage, ctx, &idempotency_key, err, 0, rows_in, stage_started, gate_entries,
                );
            }
        }

        let stage_ctx = StageContext {
            pipeline_id: definition.pipeline_id.clone(),
            run_id: ctx.run_id.clone(),
            stage_name: stage.name.clone(),
            config: stage.config.clone(),
            idempotency_key: idempotency_key.clone(),
            env: ctx.env.clone(),
            cancellation: ctx.cancellation.clone(),
        };

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            if ctx.cancellation.is_cancelled() {
                break Err(StageError::cancelled("run cancelled before invocation"));
            }

            let result = self
                .invoke_once(definition, stage, input.as_ref(), &stage_ctx, ctx.cancel_grace)
                .await;

            match result {
                Ok(output) => break Ok(output),
                Err(err) if policy.should_retry(&err, attempts) => {
                    let delay = policy.delay(&err, attempts);
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %stage.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recoverable failure, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = ctx.cancellation.cancelled() => {
                            break Err(StageError::cancelled("run cancelled during backoff"));
                        }
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(StageOutput::Produced(batch)) => {
                // Producing stages gate their output between connector
                // success and checkpoint persistence. Gate failures are
                // deterministic and never retried.
                let gate = evaluate_gate(
                    &stage.name,
                    &stage.validation_rules,
                    stage.output_schema.as_ref(),
                    &batch,
                );
                let summary = gate.summary;
                let entries = gate.entries;
                if summary.error_violations > 0 {
                    let err = StageError::validation(
                        "GATE_FAILED",
                        format!(
                            "{} error violation(s) in output of '{}'",
                            summary.error_violations, stage.name
                        ),
                    );
                    return self.fail_stage(
                        stage, ctx, &idempotency_key, err, attempts, rows_in, stage_started,
                        entries,
                    );
                }

                // Lenient declared schemas drop undeclared extras (the
                // gate already recorded the warnings); strict schemas
                // have failed the gate instead.
                let batch = match &stage.output_schema {
                    Some(schema) if !schema.strict => project_to_schema(batch, schema),
                    _ => batch,
                };

                let cp = Checkpoint::completed_with_output(
                    ctx.run_id.clone(),
                    stage.name.clone(),
                    &idempotency_key,
                    attempts,
                    &batch,
                );
                if let Err(err) = self.persist(&cp) {
                    return self.fail_stage(
                        stage, ctx, &idempotency_key, err, attempts, rows_in, stage_started,
                        entries,
                    );
                }

                info!(
                    run_id = %ctx.run_id,
                    stage = %stage.name,
                    attempts,
                    rows_out = batch.num_rows(),
                    fingerprint = %cp.output_fingerprint,
                    "stage completed"
                );
                StageRun {
                    report: StageReport {
                        name: stage.name.clone(),
                        outcome: StageOutcome::Completed,
                        attempts,
                        duration_secs: stage_started.elapsed().as_secs_f64(),
                        rows_in,
                        rows_out: batch.num_rows() as u64,
                        rows_written: 0,
                        rows_skipped: 0,
                        output_fingerprint: Some(cp.output_fingerprint),
                        validation: summary,
                    },
                    entries,
                    output: Some(batch),
                    failed: false,
                }
            }
            Ok(StageOutput::Written(result)) => {
                let input_fingerprint =
                    input.as_ref().map(RecordBatch::fingerprint).unwrap_or_default();
                let cp = Checkpoint::completed_load(
                    ctx.run_id.clone(),
                    stage.name.clone(),
                    &idempotency_key,
                    attempts,
                    input_fingerprint,
                    result.rows_written,
                    result.rows_skipped,
                );
                if let Err(err) = self.persist(&cp) {
                    return self.fail_stage(
                        stage, ctx, &idempotency_key, err, attempts, rows_in, stage_started,
                        gate_entries,
                    );
                }

                info!(
                    run_id = %ctx.run_id,
                    stage = %stage.name,
                    attempts,
                    rows_written = result.rows_written,
                    rows_skipped = result.rows_skipped,
                    target = %result.target_ref,
                    "load completed"
                );
                StageRun {
                    report: StageReport {
                        name: stage.name.clone(),
                        outcome: StageOutcome::Completed,
                        attempts,
                        duration_secs: stage_started.elapsed().as_secs_f64(),
                        rows_in,
                        rows_out: 0,
                        rows_written: result.rows_written,
                        rows_skipped: result.rows_skipped,
                        output_fingerprint: Some(cp.output_fingerprint),
                        validation: load_gate,
                    },
                    entries: gate_entries,
                    output: None,
                    failed: false,
                }
            }
            Err(err) => self.fail_stage(
                stage, ctx, &idempotency_key, err, attempts, rows_in, stage_started, gate_entries,
            ),
        }
    }

    /// One guarded connector invocation: timeout and cancellation wrap
    /// the connector future.
    async fn invoke_once(
        &self,
        definition: &PipelineDefinition,
        stage: &StageDefinition,
        input: Option<&RecordBatch>,
        stage_ctx: &StageContext,
        cancel_grace: Duration,
    ) -> Result<StageOutput, StageError> {
        match stage.role {
            StageRole::Extract => {
                let extractor = self.registry.extractor(&stage.connector)?;
                let fut = extractor.fetch(stage_ctx);
                let batch =
                    guard(fut, stage.timeout_ms, &stage_ctx.cancellation, cancel_grace).await?;
                Ok(StageOutput::Produced(batch))
            }
            StageRole::Transform => {
                let transformer = self.registry.transformer(&stage.connector)?;
                let batch = input
                    .ok_or_else(|| {
                        StageError::internal("NO_INPUT", "transform stage has no input batch")
                    })?
                    .clone();
                let fut = transformer.apply(batch, stage_ctx);
                let batch =
                    guard(fut, stage.timeout_ms, &stage_ctx.cancellation, cancel_grace).await?;
                Ok(StageOutput::Produced(batch))
            }
            StageRole::Load => {
                let loader = self.registry.loader(&stage.connector)?;
                let batch = input.ok_or_else(|| {
                    StageError::internal("NO_INPUT", "load stage has no input batch")
                })?;
                let mode = stage.write_mode.ok_or_else(|| {
                    StageError::config("MISSING_WRITE_MODE", "load stage has no write mode")
                })?;
                let fut = write_batch(
                    loader,
                    batch,
                    mode,
                    stage_ctx,
                    &stage.idempotency_key,
                    definition.parallelism as usize,
                );
                let result =
                    guard(fut, stage.timeout_ms, &stage_ctx.cancellation, cancel_grace).await?;
                Ok(StageOutput::Written(result))
            }
        }
    }

    /// Record a FAILED checkpoint (best effort) and build the failure
    /// contribution.
    #[allow(clippy::too_many_arguments)]
    fn fail_stage(
        &self,
        stage: &StageDefinition,
        ctx: &RunContext,
        idempotency_key: &str,
        err: StageError,
        attempts: u32,
        rows_in: u64,
        stage_started: Instant,
        mut entries: Vec<ReportEntry>,
    ) -> StageRun {
        warn!(
            run_id = %ctx.run_id,
            stage = %stage.name,
            attempts,
            error = %err,
            "stage failed"
        );
        let failed_cp = Checkpoint::failed(
            ctx.run_id.clone(),
            stage.name.clone(),
            idempotency_key,
            attempts,
        );
        if let Err(state_err) = self.store.put(&failed_cp) {
            warn!(
                run_id = %ctx.run_id,
                stage = %stage.name,
                error = %state_err,
                "could not record failed checkpoint"
            );
        }
        entries.push(error_entry(stage, &err));
        StageRun {
            report: failed_report(stage, err, attempts, rows_in, stage_started),
            entries,
            output: None,
            failed: true,
        }
    }

    fn persist(&self, cp: &Checkpoint) -> Result<(), StageError> {
        self.store.put(cp).map_err(|err| {
            if err.is_conflict() {
                StageError::checkpoint_conflict(err.to_string())
            } else {
                StageError::internal("STATE_BACKEND", err.to_string())
            }
        })
    }
}

/// What a connector invocation produced.
enum StageOutput {
    Produced(RecordBatch),
    Written(WriteResult),
}

fn derive_key(stage: &StageDefinition, input: Option<&RecordBatch>) -> Result<String, StageError> {
    match (stage.role, input) {
        (StageRole::Extract, _) => Ok(key::extract_key(stage)),
        (_, Some(batch)) => key::batch_key(&stage.idempotency_key, batch),
        (_, None) => Err(StageError::internal(
            "NO_INPUT",
            format!("stage '{}' has no input batch to key on", stage.name),
        )),
    }
}

/// Replay a prior COMPLETED checkpoint without touching connectors.
fn skip_completed(
    stage: &StageDefinition,
    cp: Checkpoint,
    rows_in: u64,
    stage_started: Instant,
) -> StageRun {
    info!(
        run_id = %cp.run_id,
        stage = %stage.name,
        fingerprint = %cp.output_fingerprint,
        "checkpoint found, skipping stage"
    );
    let output = match stage.role {
        StageRole::Load => None,
        StageRole::Extract | StageRole::Transform => match cp.output_batch.clone() {
            Some(batch) if batch.fingerprint() == cp.output_fingerprint => Some(batch),
            Some(_) => {
                let err = StageError::internal(
                    "CHECKPOINT_CORRUPT",
                    "cached output does not match its recorded fingerprint",
                );
                return fail_without_checkpoint(stage, err, rows_in, stage_started);
            }
            None => {
                let err = StageError::internal(
                    "CHECKPOINT_CORRUPT",
                    "completed checkpoint is missing its cached output",
                );
                return fail_without_checkpoint(stage, err, rows_in, stage_started);
            }
        },
    };

    StageRun {
        report: StageReport {
            name: stage.name.clone(),
            outcome: StageOutcome::SkippedCompleted,
            attempts: 0,
            duration_secs: stage_started.elapsed().as_secs_f64(),
            rows_in,
            rows_out: output.as_ref().map_or(0, |b| b.num_rows() as u64),
            rows_written: cp.rows_written,
            rows_skipped: cp.rows_skipped,
            output_fingerprint: Some(cp.output_fingerprint),
            validation: ValidationSummary::default(),
        },
        entries: Vec::new(),
        output,
        failed: false,
    }
}

/// Failure before any checkpoint could be recorded (no key, or the
/// store itself is unreachable).
fn fail_without_checkpoint(
    stage: &StageDefinition,
    err: StageError,
    rows_in: u64,
    stage_started: Instant,
) -> StageRun {
    warn!(stage = %stage.name, error = %err, "stage failed");
    StageRun {
        entries: vec![error_entry(stage, &err)],
        report: failed_report(stage, err, 0, rows_in, stage_started),
        output: None,
        failed: true,
    }
}

/// Write a batch through a loader, splitting into key-disjoint
/// partitions when the pipeline allows parallelism and the stage keys
/// by fields. Rows sharing a key always land in the same partition, so
/// no two workers race on one key.
async fn write_batch(
    loader: Arc<dyn Loader>,
    batch: &RecordBatch,
    mode: WriteMode,
    stage_ctx: &StageContext,
    key_spec: &IdempotencyKeySpec,
    parallelism: usize,
) -> Result<WriteResult, StageError> {
    let fields = match key_spec {
        IdempotencyKeySpec::Fields { fields } if parallelism > 1 && batch.num_rows() > 1 => fields,
        _ => return loader.write(batch, mode, stage_ctx).await,
    };

    let mut buckets: Vec<Vec<Row>> = vec![Vec::new(); parallelism];
    for row in &batch.rows {
        buckets[key::row_partition(fields, row, parallelism)].push(row.clone());
    }

    let mut tasks: JoinSet<Result<WriteResult, StageError>> = JoinSet::new();
    for rows in buckets.into_iter().filter(|b| !b.is_empty()) {
        let loader = Arc::clone(&loader);
        let part = batch.with_rows(rows);
        let ctx = stage_ctx.clone();
        tasks.spawn(async move { loader.write(&part, mode, &ctx).await });
    }

    let mut results = Vec::new();
    let mut first_error: Option<StageError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                if first_error.is_none() {
                    first_error = Some(StageError::internal("TASK_JOIN", join_err.to_string()));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(WriteResult::merge(&results)),
    }
}

/// Wrap a connector future with the stage timeout and run
/// cancellation. A cancelled run gives the in-flight invocation a
/// short grace period to finish cleanly.
async fn guard<T>(
    fut: impl std::future::Future<Output = Result<T, StageError>>,
    timeout_ms: Option<u64>,
    cancellation: &CancellationToken,
    cancel_grace: Duration,
) -> Result<T, StageError> {
    let mut fut = pin!(async move {
        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
                .await
                .unwrap_or_else(|_| Err(StageError::timeout(format!("stage exceeded {ms}ms")))),
            None => fut.await,
        }
    });

    tokio::select! {
        res = &mut fut => res,
        () = cancellation.cancelled() => {
            match tokio::time::timeout(cancel_grace, &mut fut).await {
                Ok(res) => res,
                Err(_) => Err(StageError::cancelled("run cancelled mid-stage")),
            }
        }
    }
}

/// Keep only the declared fields of a lenient schema, and stamp the
/// batch with that schema.
fn project_to_schema(batch: RecordBatch, schema: &Schema) -> RecordBatch {
    let rows: Vec<Row> = batch
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter(|(name, _)| schema.has_field(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .collect();
    batch.with_schema_and_rows(schema.clone(), rows)
}

fn not_run_report(stage: &StageDefinition) -> StageReport {
    StageReport {
        name: stage.name.clone(),
        outcome: StageOutcome::NotRun,
        attempts: 0,
        duration_secs: 0.0,
        rows_in: 0,
        rows_out: 0,
        rows_written: 0,
        rows_skipped: 0,
        output_fingerprint: None,
        validation: ValidationSummary::default(),
    }
}

fn failed_report(
    stage: &StageDefinition,
    error: StageError,
    attempts: u32,
    rows_in: u64,
    started: Instant,
) -> StageReport {
    StageReport {
        name: stage.name.clone(),
        outcome: StageOutcome::Failed { error },
        attempts,
        duration_secs: started.elapsed().as_secs_f64(),
        rows_in,
        rows_out: 0,
        rows_written: 0,
        rows_skipped: 0,
        output_fingerprint: None,
        validation: ValidationSummary::default(),
    }
}

fn error_entry(stage: &StageDefinition, error: &StageError) -> ReportEntry {
    ReportEntry {
        severity: Severity::Error,
        stage: stage.name.clone(),
        field: None,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_context_builder() {
        let token = CancellationToken::new();
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        let ctx = RunContext::new("run-1")
            .with_cancellation(token.clone())
            .with_env(env);
        assert_eq!(ctx.run_id.as_str(), "run-1");
        assert_eq!(ctx.env["API_KEY"], "secret");
        assert_eq!(ctx.cancel_grace, DEFAULT_CANCEL_GRACE);
        token.cancel();
        assert!(ctx.cancellation.is_cancelled());

        let ctx = ctx.with_cancel_grace(Duration::from_millis(250));
        assert_eq!(ctx.cancel_grace, Duration::from_millis(250));
    }
}
