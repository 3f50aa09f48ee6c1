//! Pipeline YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineDefinition;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            missing.push(caps[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("missing environment variable(s): {}", missing.join(", "));
    }

    Ok(substituted.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_definition_str(yaml_str: &str) -> Result<PipelineDefinition> {
    let substituted = substitute_env_vars(yaml_str)?;
    let definition: PipelineDefinition =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(definition)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_definition(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_definition_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{IdempotencyKeySpec, StageRole};
    use crate::connector::WriteMode;
    use batchline_types::rule::{Predicate, Severity};

    const SAMPLE: &str = r#"
pipeline: customer_summary
parallelism: 4
retry:
  max_attempts: 5
  base_delay_ms: 500
stages:
  - name: extract_customers
    role: extract
    connector: csv
    config:
      path: data/customers.csv
  - name: validate_emails
    role: transform
    connector: clean
    validation_rules:
      - field: email
        type: matches_regex
        pattern: '^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$'
        severity: error
      - field: age
        type: numeric_range
        min: 18
        max: 120
        severity: warning
  - name: load_summary
    role: load
    connector: warehouse
    write_mode: upsert
    idempotency_key:
      type: fields
      fields: [customer_id]
    timeout_ms: 30000
"#;

    #[test]
    fn parses_full_definition() {
        let def = parse_definition_str(SAMPLE).unwrap();
        assert_eq!(def.pipeline_id.as_str(), "customer_summary");
        assert_eq!(def.parallelism, 4);
        assert_eq!(def.retry.max_attempts, 5);
        assert_eq!(def.retry.base_delay_ms, 500);
        // Unspecified retry fields keep their defaults.
        assert_eq!(def.retry.max_delay_ms, 60_000);
        assert_eq!(def.stages.len(), 3);

        let validate = &def.stages[1];
        assert_eq!(validate.role, StageRole::Transform);
        assert_eq!(validate.validation_rules.len(), 2);
        assert_eq!(validate.validation_rules[0].severity, Severity::Error);
        assert!(matches!(
            validate.validation_rules[1].predicate,
            Predicate::NumericRange { .. }
        ));

        let load = &def.stages[2];
        assert_eq!(load.write_mode, Some(WriteMode::Upsert));
        assert_eq!(load.timeout_ms, Some(30_000));
        assert_eq!(
            load.idempotency_key,
            IdempotencyKeySpec::Fields {
                fields: vec!["customer_id".into()]
            }
        );
    }

    #[test]
    fn substitutes_env_vars() {
        std::env::set_var("BATCHLINE_TEST_TABLE", "warehouse.customers");
        let out = substitute_env_vars("target: ${BATCHLINE_TEST_TABLE}").unwrap();
        assert_eq!(out, "target: warehouse.customers");
    }

    #[test]
    fn substitutes_every_occurrence() {
        std::env::set_var("BATCHLINE_TEST_REGION", "eu-west-1");
        let out =
            substitute_env_vars("a: ${BATCHLINE_TEST_REGION}\nb: ${BATCHLINE_TEST_REGION}")
                .unwrap();
        assert_eq!(out, "a: eu-west-1\nb: eu-west-1");
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let err = substitute_env_vars("x: ${BATCHLINE_TEST_DEFINITELY_UNSET}").unwrap_err();
        assert!(err.to_string().contains("BATCHLINE_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(parse_definition_str("stages: [not a stage]").is_err());
    }
}
