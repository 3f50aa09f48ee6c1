//! Structural validation of pipeline definitions.
//!
//! Run before any stage executes; every failure here is a fatal
//! configuration error and the run report carries it without invoking
//! a single connector.

use std::collections::HashSet;

use regex::Regex;

use batchline_types::error::StageError;
use batchline_types::rule::Predicate;

use crate::config::types::{IdempotencyKeySpec, PipelineDefinition, StageRole};
use crate::connector::WriteMode;

/// Check a definition for structural problems.
///
/// # Errors
///
/// Returns a fatal [`StageError::config`] describing the first
/// problem found.
pub fn validate_definition(definition: &PipelineDefinition) -> Result<(), StageError> {
    if definition.stages.is_empty() {
        return Err(StageError::config("EMPTY_PIPELINE", "pipeline has no stages"));
    }

    let mut seen = HashSet::new();
    for stage in &definition.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(StageError::config(
                "DUPLICATE_STAGE",
                format!("duplicate stage name '{}'", stage.name),
            ));
        }
    }

    if definition.stages[0].role != StageRole::Extract {
        return Err(StageError::config(
            "FIRST_STAGE_NOT_EXTRACT",
            format!(
                "first stage '{}' must be an extract stage",
                definition.stages[0].name
            ),
        ));
    }

    // Linear chain shape: extract, transforms, then trailing loads.
    let mut loads_started = false;
    for stage in &definition.stages[1..] {
        match stage.role {
            StageRole::Extract => {
                return Err(StageError::config(
                    "EXTRACT_NOT_FIRST",
                    format!("extract stage '{}' must be the first stage", stage.name),
                ));
            }
            StageRole::Transform if loads_started => {
                return Err(StageError::config(
                    "TRANSFORM_AFTER_LOAD",
                    format!("transform stage '{}' follows a load stage", stage.name),
                ));
            }
            StageRole::Transform => {}
            StageRole::Load => loads_started = true,
        }
    }
    if !loads_started {
        return Err(StageError::config(
            "NO_LOAD_STAGE",
            "pipeline must end with at least one load stage",
        ));
    }

    for stage in &definition.stages {
        if stage.role == StageRole::Load {
            match stage.write_mode {
                None => {
                    return Err(StageError::config(
                        "MISSING_WRITE_MODE",
                        format!("load stage '{}' must declare a write mode", stage.name),
                    ));
                }
                Some(WriteMode::Upsert) => {
                    let has_key_fields = matches!(
                        &stage.idempotency_key,
                        IdempotencyKeySpec::Fields { fields } if !fields.is_empty()
                    );
                    if !has_key_fields {
                        return Err(StageError::config(
                            "UPSERT_REQUIRES_KEY_FIELDS",
                            format!(
                                "load stage '{}' uses upsert but declares no key fields",
                                stage.name
                            ),
                        ));
                    }
                }
                Some(_) => {}
            }
        }

        if let IdempotencyKeySpec::Fields { fields } = &stage.idempotency_key {
            if fields.is_empty() {
                return Err(StageError::config(
                    "EMPTY_KEY_FIELDS",
                    format!("stage '{}' declares an empty key field list", stage.name),
                ));
            }
        }

        for rule in &stage.validation_rules {
            if let Predicate::MatchesRegex { pattern } = &rule.predicate {
                if Regex::new(pattern).is_err() {
                    return Err(StageError::config(
                        "INVALID_RULE_PATTERN",
                        format!(
                            "stage '{}' rule on field '{}' has an invalid pattern",
                            stage.name, rule.field
                        ),
                    ));
                }
            }
        }

        if let Some(schema) = &stage.output_schema {
            for rule in &stage.validation_rules {
                if !schema.has_field(&rule.field) {
                    return Err(StageError::config(
                        "RULE_UNKNOWN_FIELD",
                        format!(
                            "stage '{}' rule references field '{}' not in its declared schema",
                            stage.name, rule.field
                        ),
                    ));
                }
            }
        }
    }

    if definition.retry.max_attempts == 0 {
        return Err(StageError::config(
            "INVALID_RETRY",
            "retry.max_attempts must be at least 1",
        ));
    }
    if definition.retry.backoff_multiplier < 1.0 {
        return Err(StageError::config(
            "INVALID_RETRY",
            "retry.backoff_multiplier must be >= 1.0",
        ));
    }
    if !(0.0..1.0).contains(&definition.retry.jitter) {
        return Err(StageError::config(
            "INVALID_RETRY",
            "retry.jitter must be in [0, 1)",
        ));
    }
    if definition.parallelism == 0 {
        return Err(StageError::config(
            "INVALID_PARALLELISM",
            "parallelism must be at least 1",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StageDefinition;
    use batchline_types::rule::{Predicate, Severity, ValidationRule};
    use batchline_types::schema::{Field, Schema};
    use batchline_types::value::FieldType;

    fn minimal() -> PipelineDefinition {
        PipelineDefinition::new(
            "p",
            vec![
                StageDefinition::new("extract", StageRole::Extract, "csv"),
                StageDefinition::new("load", StageRole::Load, "warehouse")
                    .with_write_mode(WriteMode::Append),
            ],
        )
    }

    fn code(result: Result<(), StageError>) -> String {
        result.unwrap_err().code
    }

    #[test]
    fn minimal_definition_is_valid() {
        assert!(validate_definition(&minimal()).is_ok());
    }

    #[test]
    fn empty_pipeline_rejected() {
        let def = PipelineDefinition::new("p", vec![]);
        assert_eq!(code(validate_definition(&def)), "EMPTY_PIPELINE");
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let mut def = minimal();
        def.stages.push(
            StageDefinition::new("load", StageRole::Load, "warehouse")
                .with_write_mode(WriteMode::Append),
        );
        assert_eq!(code(validate_definition(&def)), "DUPLICATE_STAGE");
    }

    #[test]
    fn first_stage_must_be_extract() {
        let def = PipelineDefinition::new(
            "p",
            vec![
                StageDefinition::new("t", StageRole::Transform, "clean"),
                StageDefinition::new("load", StageRole::Load, "warehouse")
                    .with_write_mode(WriteMode::Append),
            ],
        );
        assert_eq!(code(validate_definition(&def)), "FIRST_STAGE_NOT_EXTRACT");
    }

    #[test]
    fn second_extract_rejected() {
        let mut def = minimal();
        def.stages
            .insert(1, StageDefinition::new("extract2", StageRole::Extract, "csv"));
        assert_eq!(code(validate_definition(&def)), "EXTRACT_NOT_FIRST");
    }

    #[test]
    fn transform_after_load_rejected() {
        let mut def = minimal();
        def.stages
            .push(StageDefinition::new("late", StageRole::Transform, "clean"));
        assert_eq!(code(validate_definition(&def)), "TRANSFORM_AFTER_LOAD");
    }

    #[test]
    fn missing_load_rejected() {
        let def = PipelineDefinition::new(
            "p",
            vec![StageDefinition::new("extract", StageRole::Extract, "csv")],
        );
        assert_eq!(code(validate_definition(&def)), "NO_LOAD_STAGE");
    }

    #[test]
    fn load_requires_write_mode() {
        let mut def = minimal();
        def.stages[1].write_mode = None;
        assert_eq!(code(validate_definition(&def)), "MISSING_WRITE_MODE");
    }

    #[test]
    fn upsert_requires_key_fields() {
        let mut def = minimal();
        def.stages[1].write_mode = Some(WriteMode::Upsert);
        assert_eq!(code(validate_definition(&def)), "UPSERT_REQUIRES_KEY_FIELDS");

        def.stages[1].idempotency_key = IdempotencyKeySpec::Fields {
            fields: vec!["customer_id".into()],
        };
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn rule_must_reference_declared_field() {
        let mut def = minimal();
        def.stages[0] = def.stages[0]
            .clone()
            .with_output_schema(Schema::new(vec![Field::new("id", FieldType::Integer)]))
            .with_rules(vec![ValidationRule::new(
                "email",
                Predicate::NonNull,
                Severity::Error,
            )]);
        assert_eq!(code(validate_definition(&def)), "RULE_UNKNOWN_FIELD");
    }

    #[test]
    fn invalid_regex_pattern_rejected() {
        let mut def = minimal();
        def.stages[0] = def.stages[0].clone().with_rules(vec![ValidationRule::new(
            "email",
            Predicate::MatchesRegex {
                pattern: "[unclosed".into(),
            },
            Severity::Error,
        )]);
        assert_eq!(code(validate_definition(&def)), "INVALID_RULE_PATTERN");
    }

    #[test]
    fn retry_bounds_checked() {
        let mut def = minimal();
        def.retry.max_attempts = 0;
        assert_eq!(code(validate_definition(&def)), "INVALID_RETRY");

        let mut def = minimal();
        def.retry.jitter = 1.5;
        assert_eq!(code(validate_definition(&def)), "INVALID_RETRY");

        let mut def = minimal();
        def.retry.backoff_multiplier = 0.5;
        assert_eq!(code(validate_definition(&def)), "INVALID_RETRY");
    }
}
