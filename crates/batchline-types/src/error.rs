//! Structured error model for stage invocations.
//!
//! [`StageError`] carries classification and retry metadata; the
//! executor's retry loop is a plain state check over the
//! recoverable/fatal split, never exception interception. Construct
//! via the taxonomy-specific factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an error in the engine taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source connector failure.
    Source,
    /// Sink connector failure.
    Sink,
    /// Data-quality gate failure (never retryable).
    Validation,
    /// Conflicting checkpoint write; indicates a concurrency bug or
    /// duplicate run id misuse.
    CheckpointConflict,
    /// Run cancelled by the caller.
    Cancelled,
    /// Structurally invalid pipeline definition.
    Config,
    /// Per-stage timeout expired (retryable).
    Timeout,
    /// Engine-internal fault (state backend, task join, etc.).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Validation => "validation",
            Self::CheckpointConflict => "checkpoint_conflict",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Recoverable errors are eligible for the retry policy; fatal errors
/// halt the stage (and the run's chain) immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Recoverable,
    Fatal,
}

/// Structured error from a stage invocation.
///
/// Connectors classify their own failures: timeouts, transient
/// connection errors, and rate limiting are recoverable; schema
/// mismatches, auth failures, and bad configuration are fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Explicit delay hint (e.g. from a rate-limit response); takes
    /// precedence over computed backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(
        kind: ErrorKind,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            details: None,
        }
    }

    /// Transient source failure (retryable).
    #[must_use]
    pub fn source_transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Source, true, code, message)
    }

    /// Permanent source failure (auth, malformed spec, ...).
    #[must_use]
    pub fn source_fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Source, false, code, message)
    }

    /// Transient sink failure (retryable).
    #[must_use]
    pub fn sink_transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sink, true, code, message)
    }

    /// Permanent sink failure.
    #[must_use]
    pub fn sink_fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sink, false, code, message)
    }

    /// Rate limiting by an upstream or downstream system (retryable,
    /// optionally carrying the server's retry-after hint).
    #[must_use]
    pub fn rate_limited(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::Sink, true, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Data-quality gate failure. Never retryable: re-running the same
    /// stage on the same bad input fails deterministically.
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, false, code, message)
    }

    /// Conflicting checkpoint write (fatal).
    #[must_use]
    pub fn checkpoint_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CheckpointConflict, false, "CHECKPOINT_CONFLICT", message)
    }

    /// Run cancelled by the caller (fatal).
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, false, "CANCELLED", message)
    }

    /// Structurally invalid pipeline definition (fatal, raised before
    /// any stage runs).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, false, code, message)
    }

    /// Stage invocation timeout (retryable).
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, true, "STAGE_TIMEOUT", message)
    }

    /// Engine-internal fault (fatal).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, false, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Tri-state classification driving the retry decision.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Recoverable
        } else {
            ErrorClass::Fatal
        }
    }

    /// Convenience: `class() == Recoverable`.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recoverable() {
        assert!(StageError::source_transient("CONN_RESET", "reset").is_recoverable());
        assert!(StageError::sink_transient("DEADLOCK", "deadlock").is_recoverable());
        assert!(StageError::timeout("30s elapsed").is_recoverable());
        assert!(StageError::rate_limited("THROTTLED", "slow down", Some(5000)).is_recoverable());
    }

    #[test]
    fn fatal_errors_are_not_recoverable() {
        assert_eq!(StageError::source_fatal("AUTH", "denied").class(), ErrorClass::Fatal);
        assert_eq!(StageError::validation("GATE", "bad email").class(), ErrorClass::Fatal);
        assert_eq!(
            StageError::checkpoint_conflict("duplicate run").class(),
            ErrorClass::Fatal
        );
        assert_eq!(StageError::cancelled("caller").class(), ErrorClass::Fatal);
        assert_eq!(StageError::config("DUP_STAGE", "dup").class(), ErrorClass::Fatal);
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = StageError::rate_limited("THROTTLED", "slow down", Some(7500));
        assert_eq!(err.retry_after_ms, Some(7500));
    }

    #[test]
    fn display_format() {
        let err = StageError::config("DUP_STAGE", "duplicate stage name 'load'");
        assert_eq!(err.to_string(), "[config] DUP_STAGE: duplicate stage name 'load'");
    }

    #[test]
    fn serde_roundtrip_with_details() {
        let err = StageError::sink_transient("IO", "broken pipe")
            .with_details(serde_json::json!({"target": "warehouse.customers"}));
        let json = serde_json::to_string(&err).unwrap();
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
