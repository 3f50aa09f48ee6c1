//! Schema declaration and structural validation.
//!
//! [`validate_schema`] is a pure function returning a violation list;
//! the caller decides how severe each violation is (unknown extra
//! fields are warning-grade unless the schema is strict).

use serde::{Deserialize, Serialize};

use crate::batch::RecordBatch;
use crate::value::FieldType;

/// One declared field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    /// Shorthand constructor for a nullable field.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    /// Mark the field non-nullable.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered field list with a strictness flag.
///
/// A strict schema rejects unknown extra fields outright; a lenient
/// one flags them as warnings and lets the engine drop them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
    #[serde(default)]
    pub strict: bool,
}

impl Schema {
    /// Build a lenient schema from fields.
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    /// Mark the schema strict.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Look up a declared field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether `name` is declared.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// Category of a schema violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Declared non-nullable field absent from a row.
    MissingField,
    /// Value does not conform to the declared type.
    TypeMismatch,
    /// Null in a non-nullable field.
    NullViolation,
    /// Field present in a row but not declared.
    UnknownField,
}

/// A single structural violation found by [`validate_schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub field: String,
    pub kind: ViolationKind,
    pub reason: String,
}

/// Check every row of `batch` against `expected`.
///
/// Pure; returns all violations (deduplicated per field/kind) instead
/// of failing on the first, so callers can classify severity.
#[must_use]
pub fn validate_schema(batch: &RecordBatch, expected: &Schema) -> Vec<SchemaViolation> {
    let mut violations: Vec<SchemaViolation> = Vec::new();
    let mut push_once = |v: SchemaViolation, out: &mut Vec<SchemaViolation>| {
        if !out.iter().any(|e| e.field == v.field && e.kind == v.kind) {
            out.push(v);
        }
    };

    for (row_idx, row) in batch.rows.iter().enumerate() {
        for field in &expected.fields {
            match row.get(&field.name) {
                None => {
                    if !field.nullable {
                        push_once(
                            SchemaViolation {
                                field: field.name.clone(),
                                kind: ViolationKind::MissingField,
                                reason: format!(
                                    "required field missing (first seen at row {row_idx})"
                                ),
                            },
                            &mut violations,
                        );
                    }
                }
                Some(value) if value.is_null() => {
                    if !field.nullable {
                        push_once(
                            SchemaViolation {
                                field: field.name.clone(),
                                kind: ViolationKind::NullViolation,
                                reason: format!(
                                    "null in non-nullable field (first seen at row {row_idx})"
                                ),
                            },
                            &mut violations,
                        );
                    }
                }
                Some(value) => {
                    if !value.conforms_to(field.field_type) {
                        push_once(
                            SchemaViolation {
                                field: field.name.clone(),
                                kind: ViolationKind::TypeMismatch,
                                reason: format!(
                                    "expected {}, got {} (first seen at row {row_idx})",
                                    field.field_type,
                                    value
                                        .field_type()
                                        .map_or_else(|| "null".to_string(), |t| t.to_string()),
                                ),
                            },
                            &mut violations,
                        );
                    }
                }
            }
        }

        for name in row.keys() {
            if !expected.has_field(name) {
                push_once(
                    SchemaViolation {
                        field: name.clone(),
                        kind: ViolationKind::UnknownField,
                        reason: format!("field not declared (first seen at row {row_idx})"),
                    },
                    &mut violations,
                );
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{RecordBatch, Row};
    use crate::value::Value;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).required(),
            Field::new("email", FieldType::String),
            Field::new("amount", FieldType::Float),
        ])
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn batch(rows: Vec<Row>) -> RecordBatch {
        RecordBatch::new(schema(), rows, "test-src", 1)
    }

    #[test]
    fn conforming_batch_has_no_violations() {
        let b = batch(vec![row(&[
            ("id", Value::Integer(1)),
            ("email", Value::String("a@x.com".into())),
            ("amount", Value::Integer(5)), // widening ok
        ])]);
        assert!(validate_schema(&b, &schema()).is_empty());
    }

    #[test]
    fn missing_required_field_flagged() {
        let b = batch(vec![row(&[("email", Value::String("a@x.com".into()))])]);
        let violations = validate_schema(&b, &schema());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::MissingField);
        assert_eq!(violations[0].field, "id");
    }

    #[test]
    fn null_in_required_field_flagged() {
        let b = batch(vec![row(&[("id", Value::Null)])]);
        let violations = validate_schema(&b, &schema());
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::NullViolation && v.field == "id"));
    }

    #[test]
    fn type_mismatch_flagged_once_across_rows() {
        let b = batch(vec![
            row(&[("id", Value::String("1".into()))]),
            row(&[("id", Value::String("2".into()))]),
        ]);
        let violations = validate_schema(&b, &schema());
        let mismatches: Vec<_> = violations
            .iter()
            .filter(|v| v.kind == ViolationKind::TypeMismatch)
            .collect();
        assert_eq!(mismatches.len(), 1);
    }

    #[test]
    fn unknown_field_flagged() {
        let b = batch(vec![row(&[
            ("id", Value::Integer(1)),
            ("surprise", Value::Bool(true)),
        ])]);
        let violations = validate_schema(&b, &schema());
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::UnknownField && v.field == "surprise"));
    }

    #[test]
    fn nullable_field_accepts_null_and_absence() {
        let b = batch(vec![row(&[("id", Value::Integer(1)), ("email", Value::Null)])]);
        assert!(validate_schema(&b, &schema()).is_empty());
    }
}
