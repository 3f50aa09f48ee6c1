//! Structured run outcome: the sole observability artifact the engine
//! produces. Consumed by external schedulers and dashboards.

use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::ids::{PipelineId, RunId, StageName};
use crate::rule::Severity;

/// Run state machine: `Pending -> Running -> terminal`. Terminal
/// states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    /// Every stage completed and no load stage skipped rows.
    Succeeded,
    /// Every stage completed but at least one load skipped rows;
    /// distinguished from success so operators can investigate
    /// without treating it as an outage.
    PartiallySucceeded,
    Failed,
}

impl RunState {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallySucceeded | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How one stage concluded within the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage ran and its checkpoint is COMPLETED.
    Completed,
    /// Prior COMPLETED checkpoint found; connector not re-invoked.
    SkippedCompleted,
    /// Stage ended in a FAILED checkpoint; the chain halted here.
    Failed { error: StageError },
    /// Upstream failure prevented this stage from running.
    NotRun,
}

/// Aggregate of gate evaluation for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub rules_evaluated: usize,
    pub error_violations: usize,
    pub warning_violations: usize,
}

/// Per-stage section of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: StageName,
    pub outcome: StageOutcome,
    pub attempts: u32,
    pub duration_secs: f64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub output_fingerprint: Option<String>,
    pub validation: ValidationSummary,
}

/// One flat diagnostic entry (error or warning) in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub severity: Severity,
    pub stage: StageName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

/// Final record of what happened during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub final_state: RunState,
    /// ISO-8601 UTC timestamp of run start.
    pub started_at: String,
    pub duration_secs: f64,
    pub stages: Vec<StageReport>,
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    /// Error-severity entries only.
    #[must_use]
    pub fn errors(&self) -> Vec<&ReportEntry> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .collect()
    }

    /// Warning-severity entries only.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ReportEntry> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Warning)
            .collect()
    }

    /// Look up one stage's section by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name.as_str() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(severity: Severity, msg: &str) -> ReportEntry {
        ReportEntry {
            severity,
            stage: StageName::new("validate"),
            field: Some("email".into()),
            message: msg.into(),
        }
    }

    fn report(entries: Vec<ReportEntry>) -> RunReport {
        RunReport {
            run_id: RunId::new("r1"),
            pipeline_id: PipelineId::new("p1"),
            final_state: RunState::Succeeded,
            started_at: "2026-01-15T10:00:00Z".into(),
            duration_secs: 1.25,
            stages: vec![],
            entries,
        }
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::PartiallySucceeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn errors_and_warnings_split() {
        let r = report(vec![
            entry(Severity::Error, "invalid email"),
            entry(Severity::Warning, "unknown field dropped"),
            entry(Severity::Warning, "age out of range"),
        ]);
        assert_eq!(r.errors().len(), 1);
        assert_eq!(r.warnings().len(), 2);
    }

    #[test]
    fn report_serializes_for_external_consumers() {
        let r = report(vec![entry(Severity::Error, "boom")]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["final_state"], "succeeded");
        assert_eq!(json["entries"][0]["severity"], "error");
    }

    #[test]
    fn stage_outcome_failed_carries_error() {
        let outcome = StageOutcome::Failed {
            error: StageError::validation("GATE_FAILED", "1 error violation"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "validation");
    }
}
