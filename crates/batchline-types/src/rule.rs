//! Data-quality rules evaluated by the validation gate.

use serde::{Deserialize, Serialize};

/// How a rule violation affects the run: errors block forward
/// progress, warnings are recorded and let the batch proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

/// Named check applied to one field across all rows of a batch.
///
/// Except for `NonNull`, predicates skip null values; pair them with a
/// `NonNull` rule when absence itself is a defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Value must be present and non-null.
    NonNull,
    /// String value must match the anchored regular expression.
    MatchesRegex { pattern: String },
    /// Numeric value must fall within the inclusive range.
    NumericRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// String length must fall within the inclusive range.
    LengthRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
    },
    /// Value must be unique across the batch (referential uniqueness).
    Unique,
    /// Timestamp must not lie in the future.
    NotFuture,
}

impl Predicate {
    /// Short name used in reports and log events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NonNull => "non_null",
            Self::MatchesRegex { .. } => "matches_regex",
            Self::NumericRange { .. } => "numeric_range",
            Self::LengthRange { .. } => "length_range",
            Self::Unique => "unique",
            Self::NotFuture => "not_future",
        }
    }
}

/// One data-quality rule: a predicate bound to a field with a severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    #[serde(flatten)]
    pub predicate: Predicate,
    pub severity: Severity,
}

impl ValidationRule {
    /// Construct a rule.
    #[must_use]
    pub fn new(field: impl Into<String>, predicate: Predicate, severity: Severity) -> Self {
        Self {
            field: field.into(),
            predicate,
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_yaml_shape() {
        let yaml = r"
field: email
type: matches_regex
pattern: '^[^@]+@[^@]+$'
severity: error
";
        let rule: ValidationRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.field, "email");
        assert_eq!(rule.severity, Severity::Error);
        assert!(matches!(rule.predicate, Predicate::MatchesRegex { .. }));
    }

    #[test]
    fn numeric_range_optional_bounds() {
        let yaml = r"
field: age
type: numeric_range
min: 18
severity: warning
";
        let rule: ValidationRule = serde_yaml::from_str(yaml).unwrap();
        match rule.predicate {
            Predicate::NumericRange { min, max } => {
                assert_eq!(min, Some(18.0));
                assert_eq!(max, None);
            }
            other => panic!("unexpected predicate: {other:?}"),
        }
    }

    #[test]
    fn predicate_names() {
        assert_eq!(Predicate::NonNull.name(), "non_null");
        assert_eq!(Predicate::Unique.name(), "unique");
        assert_eq!(Predicate::NotFuture.name(), "not_future");
    }

    #[test]
    fn serde_json_roundtrip() {
        let rule = ValidationRule::new(
            "amount",
            Predicate::NumericRange {
                min: Some(0.0),
                max: None,
            },
            Severity::Error,
        );
        let json = serde_json::to_string(&rule).unwrap();
        let back: ValidationRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }
}
