//! Validation gate between stages.
//!
//! After a stage produces its output batch, the gate evaluates the
//! stage's declared rules (and output schema, when present) before the
//! batch moves downstream. Error-severity violations block the batch;
//! warning-severity violations are recorded and let it pass. Gate
//! failures are deterministic on the same input, so they are never
//! retried.

use std::collections::HashSet;

use chrono::Utc;
use regex::Regex;

use batchline_types::batch::RecordBatch;
use batchline_types::ids::StageName;
use batchline_types::report::{ReportEntry, ValidationSummary};
use batchline_types::rule::{Predicate, Severity, ValidationRule};
use batchline_types::schema::{validate_schema, Schema, ViolationKind};
use batchline_types::value::Value;

/// Cap on recorded sample entries per rule. Counts stay exact; only
/// the per-row diagnostics are truncated so a million-row batch with a
/// broken field does not produce a million-entry report.
pub const MAX_SAMPLES_PER_RULE: usize = 100;

/// Result of evaluating one stage's gate against one batch.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub summary: ValidationSummary,
    /// Sampled per-violation diagnostics, capped per rule.
    pub entries: Vec<ReportEntry>,
    /// `true` when no error-severity violation occurred.
    pub passed: bool,
}

/// Evaluate `rules` (and `schema`, if declared) against `batch`.
#[must_use]
pub fn evaluate_gate(
    stage: &StageName,
    rules: &[ValidationRule],
    schema: Option<&Schema>,
    batch: &RecordBatch,
) -> GateReport {
    let mut entries = Vec::new();
    let mut error_violations = 0usize;
    let mut warning_violations = 0usize;

    if let Some(expected) = schema {
        for violation in validate_schema(batch, expected) {
            // Unknown extras are warning-grade unless the schema is
            // strict; structural problems always block.
            let severity = match violation.kind {
                ViolationKind::UnknownField if !expected.strict => Severity::Warning,
                _ => Severity::Error,
            };
            match severity {
                Severity::Error => error_violations += 1,
                Severity::Warning => warning_violations += 1,
            }
            entries.push(ReportEntry {
                severity,
                stage: stage.clone(),
                field: Some(violation.field),
                message: format!("schema: {}", violation.reason),
            });
        }
    }

    for rule in rules {
        let mut evaluator = RuleEvaluator::new(&rule.predicate);
        let mut sampled = 0usize;
        for (row_idx, row) in batch.rows.iter().enumerate() {
            let Some(detail) = evaluator.check(row.get(&rule.field)) else {
                continue;
            };
            match rule.severity {
                Severity::Error => error_violations += 1,
                Severity::Warning => warning_violations += 1,
            }
            if sampled < MAX_SAMPLES_PER_RULE {
                sampled += 1;
                entries.push(ReportEntry {
                    severity: rule.severity,
                    stage: stage.clone(),
                    field: Some(rule.field.clone()),
                    message: format!("{}: row {row_idx}: {detail}", rule.predicate.name()),
                });
            }
        }
    }

    GateReport {
        summary: ValidationSummary {
            rules_evaluated: rules.len(),
            error_violations,
            warning_violations,
        },
        entries,
        passed: error_violations == 0,
    }
}

/// Per-rule evaluation state: compiled pattern for regex rules, seen
/// set for uniqueness, the evaluation timestamp for `NotFuture`.
enum RuleEvaluator {
    NonNull,
    MatchesRegex(Option<Regex>),
    NumericRange { min: Option<f64>, max: Option<f64> },
    LengthRange { min: Option<usize>, max: Option<usize> },
    Unique(HashSet<String>),
    NotFuture(chrono::DateTime<Utc>),
}

impl RuleEvaluator {
    fn new(predicate: &Predicate) -> Self {
        match predicate {
            Predicate::NonNull => Self::NonNull,
            // Validated at definition load; a bad pattern surviving to
            // here flags every row rather than silently passing.
            Predicate::MatchesRegex { pattern } => Self::MatchesRegex(Regex::new(pattern).ok()),
            Predicate::NumericRange { min, max } => Self::NumericRange {
                min: *min,
                max: *max,
            },
            Predicate::LengthRange { min, max } => Self::LengthRange {
                min: *min,
                max: *max,
            },
            Predicate::Unique => Self::Unique(HashSet::new()),
            Predicate::NotFuture => Self::NotFuture(Utc::now()),
        }
    }

    /// Returns a violation detail for this row's value, or `None`.
    ///
    /// Except for `NonNull`, absent and null values pass; absence is
    /// its own rule.
    fn check(&mut self, value: Option<&Value>) -> Option<String> {
        let present = match value {
            None | Some(Value::Null) => {
                return match self {
                    Self::NonNull => Some("value is null or missing".to_string()),
                    _ => None,
                };
            }
            Some(v) => v,
        };

        match self {
            Self::NonNull => None,
            Self::MatchesRegex(None) => Some("rule pattern failed to compile".to_string()),
            Self::MatchesRegex(Some(re)) => match present.as_str() {
                Some(s) if re.is_match(s) => None,
                Some(s) => Some(format!("'{s}' does not match pattern")),
                None => Some(format!("expected string, got {present}")),
            },
            Self::NumericRange { min, max } => {
                let Some(n) = present.as_f64() else {
                    return Some(format!("expected number, got {present}"));
                };
                if min.is_some_and(|lo| n < lo) {
                    Some(format!("{n} below minimum {}", min.unwrap_or_default()))
                } else if max.is_some_and(|hi| n > hi) {
                    Some(format!("{n} above maximum {}", max.unwrap_or_default()))
                } else {
                    None
                }
            }
            Self::LengthRange { min, max } => {
                let Some(s) = present.as_str() else {
                    return Some(format!("expected string, got {present}"));
                };
                let len = s.chars().count();
                if min.is_some_and(|lo| len < lo) || max.is_some_and(|hi| len > hi) {
                    Some(format!("length {len} out of range"))
                } else {
                    None
                }
            }
            Self::Unique(seen) => {
                if seen.insert(present.canonical()) {
                    None
                } else {
                    Some(format!("duplicate value '{present}'"))
                }
            }
            Self::NotFuture(now) => match present {
                Value::Timestamp(ts) if *ts > *now => {
                    Some(format!("timestamp {} lies in the future", ts.to_rfc3339()))
                }
                Value::Timestamp(_) => None,
                other => Some(format!("expected timestamp, got {other}")),
            },
        }
    }
}
