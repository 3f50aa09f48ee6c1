//! Built-in transformers: `clean` and `aggregate`.
//!
//! `clean` covers the common hygiene steps most pipelines need before
//! loading: whitespace trimming, case normalization, dropping rows
//! missing required fields, and first-wins deduplication by key
//! fields. `aggregate` groups rows by key fields and computes
//! sum/avg/count summaries, optionally filtering groups below a
//! threshold. All steps are deterministic, so re-running a resumed
//! stage reproduces the same output fingerprint.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;

use batchline_types::batch::{RecordBatch, Row};
use batchline_types::error::StageError;
use batchline_types::schema::{Field, Schema};
use batchline_types::value::{FieldType, Value};

use crate::connector::{StageContext, Transformer};

/// Options accepted under the stage's `config` map.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CleanConfig {
    /// Fields whose string values are whitespace-trimmed.
    #[serde(default)]
    trim: Vec<String>,
    /// Fields lowercased after trimming (emails, usernames).
    #[serde(default)]
    lowercase: Vec<String>,
    /// Fields title-cased after trimming (person names).
    #[serde(default)]
    titlecase: Vec<String>,
    /// Rows missing any of these fields (or null) are dropped.
    #[serde(default)]
    require: Vec<String>,
    /// First-wins dedup key; rows repeating the key combination drop.
    #[serde(default)]
    dedupe_by: Vec<String>,
}

/// The engine's built-in data-hygiene transformer, registered under
/// the `clean` tag.
pub struct CleanTransformer;

#[async_trait]
impl Transformer for CleanTransformer {
    async fn apply(
        &self,
        batch: RecordBatch,
        ctx: &StageContext,
    ) -> Result<RecordBatch, StageError> {
        let config: CleanConfig = if ctx.config.is_null() {
            CleanConfig::default()
        } else {
            serde_json::from_value(ctx.config.clone()).map_err(|e| {
                StageError::config("INVALID_CLEAN_CONFIG", format!("bad clean options: {e}"))
            })?
        };

        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut out: Vec<Row> = Vec::with_capacity(batch.num_rows());

        for row in &batch.rows {
            let mut row = row.clone();
            for field in &config.trim {
                rewrite_string(&mut row, field, |s| s.trim().to_string());
            }
            for field in &config.lowercase {
                rewrite_string(&mut row, field, |s| s.to_lowercase());
            }
            for field in &config.titlecase {
                rewrite_string(&mut row, field, title_case);
            }

            let missing_required = config
                .require
                .iter()
                .any(|f| row.get(f).map_or(true, Value::is_null));
            if missing_required {
                continue;
            }

            if !config.dedupe_by.is_empty() {
                let key: String = config
                    .dedupe_by
                    .iter()
                    .map(|f| row.get(f).map_or_else(|| "\u{0}".to_string(), Value::canonical))
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                if !seen_keys.insert(key) {
                    continue;
                }
            }

            out.push(row);
        }

        Ok(batch.with_rows(out))
    }
}

/// Options accepted under an `aggregate` stage's `config` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregateConfig {
    /// Grouping key; rows with equal values across these fields form
    /// one output row.
    group_by: Vec<String>,
    #[serde(default)]
    aggregate: Vec<AggregateSpec>,
    /// Drops output rows whose `field` is not strictly above `gt`.
    #[serde(default)]
    having_min: Option<HavingMin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregateSpec {
    op: AggregateOp,
    /// Input field to fold; `count` without a field counts rows.
    #[serde(default)]
    field: Option<String>,
    /// Output field name.
    #[serde(rename = "as")]
    output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AggregateOp {
    Sum,
    Avg,
    Count,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HavingMin {
    field: String,
    gt: f64,
}

/// Running sums for one group. `values` counts the numeric inputs a
/// sum/avg actually saw; nulls and absent fields are skipped.
struct Accumulator {
    sum: f64,
    values: u64,
    rows: u64,
}

/// The engine's built-in group-and-summarize transformer, registered
/// under the `aggregate` tag. Groups keep first-seen order so the
/// output fingerprint is stable across re-runs.
pub struct AggregateTransformer;

#[async_trait]
impl Transformer for AggregateTransformer {
    async fn apply(
        &self,
        batch: RecordBatch,
        ctx: &StageContext,
    ) -> Result<RecordBatch, StageError> {
        let config: AggregateConfig = serde_json::from_value(ctx.config.clone()).map_err(|e| {
            StageError::config("INVALID_AGGREGATE_CONFIG", format!("bad aggregate options: {e}"))
        })?;
        if config.group_by.is_empty() {
            return Err(StageError::config(
                "INVALID_AGGREGATE_CONFIG",
                "group_by must name at least one field",
            ));
        }
        for spec in &config.aggregate {
            if spec.op != AggregateOp::Count && spec.field.is_none() {
                return Err(StageError::config(
                    "INVALID_AGGREGATE_CONFIG",
                    format!("'{}' needs a field to fold", spec.output),
                ));
            }
        }

        // First-seen group order; each group keeps its first row as
        // the source of the group-by field values.
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Row, Vec<Accumulator>)> = Vec::new();

        for row in &batch.rows {
            let key: String = config
                .group_by
                .iter()
                .map(|f| row.get(f).map_or_else(|| "\u{0}".to_string(), Value::canonical))
                .collect::<Vec<_>>()
                .join("\u{1f}");
            let slot = *index.entry(key).or_insert_with(|| {
                let accs = config
                    .aggregate
                    .iter()
                    .map(|_| Accumulator {
                        sum: 0.0,
                        values: 0,
                        rows: 0,
                    })
                    .collect();
                groups.push((row.clone(), accs));
                groups.len() - 1
            });

            let accs = &mut groups[slot].1;
            for (spec, acc) in config.aggregate.iter().zip(accs.iter_mut()) {
                acc.rows += 1;
                let Some(field) = &spec.field else { continue };
                match row.get(field) {
                    None | Some(Value::Null) => {}
                    Some(value) => {
                        let Some(n) = value.as_f64() else {
                            return Err(StageError::validation(
                                "AGGREGATE_TYPE_MISMATCH",
                                format!("field '{field}' holds non-numeric value {value}"),
                            ));
                        };
                        acc.sum += n;
                        acc.values += 1;
                    }
                }
            }
        }

        let mut rows: Vec<Row> = Vec::with_capacity(groups.len());
        for (rep, accs) in groups {
            let mut out = Row::new();
            for field in &config.group_by {
                if let Some(value) = rep.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
            for (spec, acc) in config.aggregate.iter().zip(accs.iter()) {
                out.insert(spec.output.clone(), summarize(spec, acc));
            }
            rows.push(out);
        }

        if let Some(having) = &config.having_min {
            rows.retain(|row| {
                row.get(&having.field)
                    .and_then(Value::as_f64)
                    .is_some_and(|v| v > having.gt)
            });
        }

        let schema = aggregate_schema(&config, &batch.schema);
        Ok(batch.with_schema_and_rows(schema, rows))
    }
}

fn summarize(spec: &AggregateSpec, acc: &Accumulator) -> Value {
    match spec.op {
        AggregateOp::Sum => Value::Float(round2(acc.sum)),
        AggregateOp::Avg if acc.values == 0 => Value::Null,
        #[allow(clippy::cast_precision_loss)]
        AggregateOp::Avg => Value::Float(round2(acc.sum / acc.values as f64)),
        #[allow(clippy::cast_possible_wrap)]
        AggregateOp::Count => Value::Integer(if spec.field.is_some() {
            acc.values as i64
        } else {
            acc.rows as i64
        }),
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Grouped output schema: group-by fields keep their input type,
/// sum/avg produce floats, count produces integers.
fn aggregate_schema(config: &AggregateConfig, input: &Schema) -> Schema {
    let mut fields: Vec<Field> = config
        .group_by
        .iter()
        .map(|name| {
            let field_type = input.field(name).map_or(FieldType::String, |f| f.field_type);
            Field::new(name.clone(), field_type)
        })
        .collect();
    for spec in &config.aggregate {
        let field_type = match spec.op {
            AggregateOp::Sum | AggregateOp::Avg => FieldType::Float,
            AggregateOp::Count => FieldType::Integer,
        };
        fields.push(Field::new(spec.output.clone(), field_type));
    }
    Schema::new(fields)
}

fn rewrite_string(row: &mut Row, field: &str, f: impl Fn(&str) -> String) {
    if let Some(value) = row.get_mut(field) {
        if let Value::String(s) = value {
            *value = Value::String(f(s));
        }
    }
}

/// Capitalize each whitespace-separated word, lowercasing the rest.
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use batchline_types::ids::{PipelineId, RunId, StageName};
    use batchline_types::schema::{Field, Schema};
    use batchline_types::value::FieldType;
    use tokio_util::sync::CancellationToken;

    fn ctx(config: serde_json::Value) -> StageContext {
        StageContext {
            pipeline_id: PipelineId::new("p"),
            run_id: RunId::new("r"),
            stage_name: StageName::new("clean"),
            config,
            idempotency_key: "k".into(),
            env: BTreeMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn batch(rows: Vec<Row>) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::String),
            Field::new("email", FieldType::String),
        ]);
        RecordBatch::new(schema, rows, "test", 1)
    }

    #[tokio::test]
    async fn trims_and_normalizes_case() {
        let b = batch(vec![row(&[
            ("name", Value::String("  jANE doE ".into())),
            ("email", Value::String(" Jane@Example.COM ".into())),
        ])]);
        let out = CleanTransformer
            .apply(
                b,
                &ctx(serde_json::json!({
                    "trim": ["name", "email"],
                    "titlecase": ["name"],
                    "lowercase": ["email"],
                })),
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0]["name"], Value::String("Jane Doe".into()));
        assert_eq!(out.rows[0]["email"], Value::String("jane@example.com".into()));
    }

    #[tokio::test]
    async fn drops_rows_missing_required_fields() {
        let b = batch(vec![
            row(&[("id", Value::Integer(1))]),
            row(&[("id", Value::Null)]),
            row(&[("name", Value::String("no id".into()))]),
        ]);
        let out = CleanTransformer
            .apply(b, &ctx(serde_json::json!({"require": ["id"]})))
            .await
            .unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.rows[0]["id"], Value::Integer(1));
    }

    #[tokio::test]
    async fn dedup_keeps_first_occurrence() {
        let b = batch(vec![
            row(&[("id", Value::Integer(1)), ("name", Value::String("first".into()))]),
            row(&[("id", Value::Integer(2))]),
            row(&[("id", Value::Integer(1)), ("name", Value::String("second".into()))]),
        ]);
        let out = CleanTransformer
            .apply(b, &ctx(serde_json::json!({"dedupe_by": ["id"]})))
            .await
            .unwrap();
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.rows[0]["name"], Value::String("first".into()));
    }

    #[tokio::test]
    async fn null_config_is_identity() {
        let b = batch(vec![row(&[("id", Value::Integer(1))])]);
        let out = CleanTransformer
            .apply(b.clone(), &ctx(serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(out, b);
    }

    #[tokio::test]
    async fn unknown_option_is_config_error() {
        let b = batch(vec![]);
        let err = CleanTransformer
            .apply(b, &ctx(serde_json::json!({"nonsense": true})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_CLEAN_CONFIG");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn title_case_handles_unicode_and_spacing() {
        assert_eq!(title_case("  maria   de  sousa "), "Maria De Sousa");
        assert_eq!(title_case(""), "");
        assert_eq!(title_case("élodie"), "Élodie");
    }

    fn txn(customer: i64, amount: f64) -> Row {
        row(&[
            ("customer_id", Value::Integer(customer)),
            ("amount", Value::Float(amount)),
        ])
    }

    fn txn_batch(rows: Vec<Row>) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("customer_id", FieldType::Integer),
            Field::new("amount", FieldType::Float),
        ]);
        RecordBatch::new(schema, rows, "test", 1)
    }

    fn spend_config() -> serde_json::Value {
        serde_json::json!({
            "group_by": ["customer_id"],
            "aggregate": [
                {"op": "sum", "field": "amount", "as": "total_spent"},
                {"op": "avg", "field": "amount", "as": "avg_transaction"},
                {"op": "count", "as": "transaction_count"},
            ],
        })
    }

    #[tokio::test]
    async fn groups_and_summarizes_per_customer() {
        let b = txn_batch(vec![txn(1, 100.0), txn(2, 40.0), txn(1, 50.555)]);
        let out = AggregateTransformer.apply(b, &ctx(spend_config())).await.unwrap();

        assert_eq!(out.num_rows(), 2);
        let first = &out.rows[0];
        assert_eq!(first["customer_id"], Value::Integer(1));
        assert_eq!(first["total_spent"], Value::Float(150.56));
        assert_eq!(first["avg_transaction"], Value::Float(75.28));
        assert_eq!(first["transaction_count"], Value::Integer(2));
        assert_eq!(out.rows[1]["total_spent"], Value::Float(40.0));
    }

    #[tokio::test]
    async fn groups_keep_first_seen_order() {
        let b = txn_batch(vec![txn(9, 1.0), txn(3, 1.0), txn(9, 1.0), txn(7, 1.0)]);
        let out = AggregateTransformer.apply(b, &ctx(spend_config())).await.unwrap();
        let ids: Vec<_> = out.rows.iter().map(|r| r["customer_id"].clone()).collect();
        assert_eq!(
            ids,
            vec![Value::Integer(9), Value::Integer(3), Value::Integer(7)]
        );
    }

    #[tokio::test]
    async fn threshold_drops_low_spend_groups() {
        let mut config = spend_config();
        config["having_min"] = serde_json::json!({"field": "total_spent", "gt": 500.0});
        let b = txn_batch(vec![txn(1, 300.0), txn(1, 300.0), txn(2, 500.0)]);
        let out = AggregateTransformer.apply(b, &ctx(config)).await.unwrap();

        // Customer 2 sits exactly at the threshold and is excluded.
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.rows[0]["customer_id"], Value::Integer(1));
    }

    #[tokio::test]
    async fn null_amounts_skipped_in_sum_and_avg() {
        let b = txn_batch(vec![
            txn(1, 10.0),
            row(&[("customer_id", Value::Integer(1)), ("amount", Value::Null)]),
        ]);
        let out = AggregateTransformer.apply(b, &ctx(spend_config())).await.unwrap();
        assert_eq!(out.rows[0]["total_spent"], Value::Float(10.0));
        assert_eq!(out.rows[0]["avg_transaction"], Value::Float(10.0));
        // Bare count still counts every row in the group.
        assert_eq!(out.rows[0]["transaction_count"], Value::Integer(2));
    }

    #[tokio::test]
    async fn output_schema_reflects_grouped_shape() {
        let b = txn_batch(vec![txn(1, 10.0)]);
        let out = AggregateTransformer.apply(b, &ctx(spend_config())).await.unwrap();
        assert_eq!(
            out.schema.field("customer_id").unwrap().field_type,
            FieldType::Integer
        );
        assert_eq!(
            out.schema.field("total_spent").unwrap().field_type,
            FieldType::Float
        );
        assert_eq!(
            out.schema.field("transaction_count").unwrap().field_type,
            FieldType::Integer
        );
        assert!(!out.schema.has_field("amount"));
    }

    #[tokio::test]
    async fn non_numeric_amount_is_validation_error() {
        let b = txn_batch(vec![row(&[
            ("customer_id", Value::Integer(1)),
            ("amount", Value::String("lots".into())),
        ])]);
        let err = AggregateTransformer
            .apply(b, &ctx(spend_config()))
            .await
            .unwrap_err();
        assert_eq!(err.code, "AGGREGATE_TYPE_MISMATCH");
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn sum_without_field_is_config_error() {
        let b = txn_batch(vec![]);
        let err = AggregateTransformer
            .apply(
                b,
                &ctx(serde_json::json!({
                    "group_by": ["customer_id"],
                    "aggregate": [{"op": "sum", "as": "total"}],
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_AGGREGATE_CONFIG");
    }

    #[tokio::test]
    async fn empty_group_by_is_config_error() {
        let b = txn_batch(vec![]);
        let err = AggregateTransformer
            .apply(b, &ctx(serde_json::json!({"group_by": []})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_AGGREGATE_CONFIG");
    }
}
