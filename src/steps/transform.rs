//! Pure transform operations over item collections.
//!
//! Every operation takes the already-resolved input items and a resolved
//! config. None of them suspend or touch the execution context.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::conditions::{combine, compare_values, evaluate, field_value, group_key, stringify};
use crate::context::expression::TransformEngine;
use crate::error::StepErrorKind;
use crate::workflow::{FilterConfig, TransformOp};

type TransformResult = Result<TransformOutput, StepErrorKind>;

/// Output of one transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub data: Value,
    pub metadata: Value,
}

impl TransformOutput {
    fn new(data: Value, metadata: Value) -> Self {
        Self { data, metadata }
    }
}

fn parse_config<T: DeserializeOwned>(op: TransformOp, config: &Value) -> Result<T, StepErrorKind> {
    let config = if config.is_null() { json!({}) } else { config.clone() };
    serde_json::from_value(config).map_err(|e| {
        StepErrorKind::InvalidConfig(format!("invalid {} config: {}", op.as_str(), e))
    })
}

/// Apply `op` to `items`.
pub fn apply(
    op: TransformOp,
    items: Vec<Value>,
    config: &Value,
    engine: &TransformEngine,
) -> TransformResult {
    match op {
        TransformOp::Filter => filter(items, &parse_config(op, config)?),
        TransformOp::Map => map(items, parse_config(op, config)?, engine),
        TransformOp::Group => group(items, parse_config(op, config)?),
        TransformOp::Aggregate => aggregate(items, parse_config(op, config)?),
        TransformOp::Deduplicate => deduplicate(items, parse_config(op, config)?),
        TransformOp::Reduce => reduce(items, parse_config(op, config)?, engine),
        TransformOp::Join => join(items, parse_config(op, config)?),
        TransformOp::Pivot => pivot(items, parse_config(op, config)?),
        TransformOp::Split => split(items, parse_config(op, config)?),
        TransformOp::Expand => expand(items, parse_config(op, config)?),
        TransformOp::Flatten => flatten(items, parse_config(op, config)?),
        TransformOp::Sort => sort(items, parse_config(op, config)?),
        TransformOp::Extract => extract(items, parse_config(op, config)?),
    }
}

// =============================================================================
// filter
// =============================================================================

/// Keep items matching the conditions under one combinator.
pub fn filter(items: Vec<Value>, config: &FilterConfig) -> TransformResult {
    if config.conditions.is_empty() {
        return Err(StepErrorKind::InvalidConfig(
            "filter requires at least one condition".into(),
        ));
    }

    let original_count = items.len();
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let results = config
            .conditions
            .iter()
            .map(|c| {
                let left = field_value(&item, &c.field).cloned().unwrap_or(Value::Null);
                evaluate(&left, c.operator, &c.value)
            })
            .collect::<Result<Vec<bool>, _>>()?;
        if combine(results, config.combine_with) {
            kept.push(item);
        }
    }

    let filtered_count = kept.len();
    Ok(TransformOutput::new(
        Value::Array(kept),
        json!({
            "original_count": original_count,
            "filtered_count": filtered_count,
            "combine_with": config.combine_with,
        }),
    ))
}

// =============================================================================
// map / reduce
// =============================================================================

#[derive(Debug, Deserialize)]
struct MapConfig {
    /// Rhai expression over `item` and `index`
    #[serde(default)]
    expression: Option<String>,
    /// Projection: output field -> item path
    #[serde(default)]
    fields: Option<Map<String, Value>>,
}

fn map(items: Vec<Value>, config: MapConfig, engine: &TransformEngine) -> TransformResult {
    let count = items.len();
    let mapped = match (&config.expression, &config.fields) {
        (Some(expression), _) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                engine
                    .eval(expression, &[("item", item), ("index", &json!(i))])
                    .map_err(StepErrorKind::from)
            })
            .collect::<Result<Vec<_>, _>>()?,
        (None, Some(fields)) => items
            .iter()
            .map(|item| {
                let projected: Map<String, Value> = fields
                    .iter()
                    .map(|(out, path)| {
                        let value = path
                            .as_str()
                            .and_then(|p| field_value(item, p))
                            .cloned()
                            .unwrap_or(Value::Null);
                        (out.clone(), value)
                    })
                    .collect();
                Value::Object(projected)
            })
            .collect(),
        (None, None) => {
            return Err(StepErrorKind::InvalidConfig(
                "map requires 'expression' or 'fields'".into(),
            ))
        }
    };
    Ok(TransformOutput::new(Value::Array(mapped), json!({"count": count})))
}

#[derive(Debug, Deserialize)]
struct ReduceConfig {
    /// Rhai expression over `acc` and `item`
    expression: String,
    #[serde(default)]
    initial: Value,
}

fn reduce(items: Vec<Value>, config: ReduceConfig, engine: &TransformEngine) -> TransformResult {
    let count = items.len();
    let result = items.iter().try_fold(config.initial, |acc, item| {
        engine
            .eval(&config.expression, &[("acc", &acc), ("item", item)])
            .map_err(StepErrorKind::from)
    })?;
    Ok(TransformOutput::new(result, json!({"count": count})))
}

// =============================================================================
// group / aggregate / pivot
// =============================================================================

#[derive(Debug, Deserialize)]
struct GroupConfig {
    key: String,
}

/// Partition items by key, in order of first appearance.
///
/// Output: `{"groups": [{"key", "items", "count"}]}`.
fn group(items: Vec<Value>, config: GroupConfig) -> TransformResult {
    let mut order: Vec<String> = Vec::new();
    let mut keys: HashMap<String, Value> = HashMap::new();
    let mut buckets: HashMap<String, Vec<Value>> = HashMap::new();
    let mut missing = 0usize;

    for item in items {
        let Some(key_value) = field_value(&item, &config.key).filter(|v| !v.is_null()).cloned()
        else {
            missing += 1;
            continue;
        };
        let key = group_key(&key_value);
        if !buckets.contains_key(&key) {
            order.push(key.clone());
            keys.insert(key.clone(), key_value);
        }
        buckets.entry(key).or_default().push(item);
    }

    let groups: Vec<Value> = order
        .iter()
        .map(|k| {
            let members = buckets.remove(k).unwrap_or_default();
            json!({
                "key": keys.remove(k).unwrap_or(Value::Null),
                "count": members.len(),
                "items": members,
            })
        })
        .collect();

    let group_count = groups.len();
    Ok(TransformOutput::new(
        json!({ "groups": groups }),
        json!({"key": config.key, "group_count": group_count, "missing_key": missing}),
    ))
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    #[default]
    Collect,
}

#[derive(Debug, Deserialize)]
struct AggregateConfig {
    #[serde(default)]
    function: AggregateFunction,
    #[serde(default)]
    field: Option<String>,
}

fn aggregate(items: Vec<Value>, config: AggregateConfig) -> TransformResult {
    let count = items.len();
    let values: Vec<Value> = match &config.field {
        Some(field) => items
            .iter()
            .filter_map(|i| field_value(i, field).cloned())
            .collect(),
        None => items.clone(),
    };
    let numbers = || values.iter().filter_map(super::conditions::as_f64);

    let value = match config.function {
        AggregateFunction::Count => json!(count),
        AggregateFunction::Sum => json!(numbers().sum::<f64>()),
        AggregateFunction::Avg => {
            let n = numbers().count();
            if n == 0 {
                Value::Null
            } else {
                json!(numbers().sum::<f64>() / n as f64)
            }
        }
        AggregateFunction::Min => values
            .iter()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Max => values
            .iter()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFunction::Collect => Value::Array(values),
    };

    Ok(TransformOutput::new(
        json!({
            "function": config.function_name(),
            "field": config.field,
            "count": count,
            "value": value,
        }),
        json!({"count": count}),
    ))
}

impl AggregateConfig {
    fn function_name(&self) -> &'static str {
        match self.function {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Collect => "collect",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PivotConfig {
    row_key: String,
    column_key: String,
    value_field: String,
}

/// One output row per distinct `row_key`, one column per distinct `column_key`.
fn pivot(items: Vec<Value>, config: PivotConfig) -> TransformResult {
    let mut order: Vec<String> = Vec::new();
    let mut rows: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut columns: Vec<String> = Vec::new();

    for item in &items {
        let Some(row) = field_value(item, &config.row_key) else {
            continue;
        };
        let Some(column) = field_value(item, &config.column_key) else {
            continue;
        };
        let row_id = group_key(row);
        let column = group_key(column);
        if !columns.contains(&column) {
            columns.push(column.clone());
        }
        let entry = rows.entry(row_id.clone()).or_insert_with(|| {
            order.push(row_id.clone());
            let mut m = Map::new();
            m.insert(config.row_key.clone(), row.clone());
            m
        });
        let value = field_value(item, &config.value_field)
            .cloned()
            .unwrap_or(Value::Null);
        entry.insert(column, value);
    }

    let data: Vec<Value> = order
        .iter()
        .filter_map(|r| rows.remove(r))
        .map(Value::Object)
        .collect();
    let row_count = data.len();
    Ok(TransformOutput::new(
        Value::Array(data),
        json!({"rows": row_count, "columns": columns}),
    ))
}

// =============================================================================
// deduplicate / join
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum Keep {
    #[default]
    First,
    Last,
}

#[derive(Debug, Deserialize)]
struct DedupeConfig {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    keep: Keep,
}

fn deduplicate(items: Vec<Value>, config: DedupeConfig) -> TransformResult {
    let original_count = items.len();
    // Items without the key are never duplicates of each other.
    let key_of = |item: &Value| -> Option<String> {
        match &config.key {
            Some(key) => field_value(item, key).filter(|v| !v.is_null()).map(group_key),
            None => Some(item.to_string()),
        }
    };
    let missing_key = items.iter().filter(|i| key_of(i).is_none()).count();

    let kept: Vec<Value> = match config.keep {
        Keep::First => {
            let mut seen = HashSet::new();
            items
                .into_iter()
                .filter(|i| key_of(i).map_or(true, |k| seen.insert(k)))
                .collect()
        }
        Keep::Last => {
            let mut seen = HashSet::new();
            let mut reversed: Vec<Value> = items
                .into_iter()
                .rev()
                .filter(|i| key_of(i).map_or(true, |k| seen.insert(k)))
                .collect();
            reversed.reverse();
            reversed
        }
    };

    let removed = original_count - kept.len();
    Ok(TransformOutput::new(
        Value::Array(kept),
        json!({
            "original_count": original_count,
            "removed": removed,
            "missing_key": missing_key,
            "key": config.key,
        }),
    ))
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Deserialize)]
struct JoinConfig {
    /// Right-hand collection (resolved before the transform runs)
    right: Value,
    left_key: String,
    #[serde(default)]
    right_key: Option<String>,
    #[serde(default)]
    kind: JoinKind,
}

fn join(items: Vec<Value>, config: JoinConfig) -> TransformResult {
    let Value::Array(right) = config.right else {
        return Err(StepErrorKind::TypeMismatch(
            "join 'right' must resolve to an array".into(),
        ));
    };
    let right_key = config.right_key.as_deref().unwrap_or(&config.left_key);

    let mut index: HashMap<String, Vec<&Value>> = HashMap::new();
    for r in &right {
        if let Some(k) = field_value(r, right_key) {
            index.entry(group_key(k)).or_default().push(r);
        }
    }

    let mut joined = Vec::new();
    for left in items {
        let matches = field_value(&left, &config.left_key)
            .and_then(|k| index.get(&group_key(k)));
        match matches {
            Some(rights) => {
                for r in rights {
                    joined.push(shallow_merge(&left, r));
                }
            }
            None if config.kind == JoinKind::Left => joined.push(left),
            None => {}
        }
    }

    let count = joined.len();
    Ok(TransformOutput::new(Value::Array(joined), json!({"count": count})))
}

pub(crate) fn shallow_merge(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = l.clone();
            for (k, v) in r {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        (_, r) => r.clone(),
    }
}

// =============================================================================
// split / expand / flatten / sort
// =============================================================================

#[derive(Debug, Deserialize)]
struct SplitConfig {
    #[serde(default)]
    batch_size: Option<usize>,
    /// Split a string field into several items
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    separator: Option<String>,
}

fn split(items: Vec<Value>, config: SplitConfig) -> TransformResult {
    if let (Some(field), Some(separator)) = (&config.field, &config.separator) {
        let mut out = Vec::new();
        for item in &items {
            let text = field_value(item, field).map(stringify).unwrap_or_default();
            for part in text.split(separator.as_str()).map(str::trim).filter(|p| !p.is_empty()) {
                let mut piece = item.clone();
                if let Value::Object(map) = &mut piece {
                    map.insert(field.clone(), json!(part));
                } else {
                    piece = json!(part);
                }
                out.push(piece);
            }
        }
        let count = out.len();
        return Ok(TransformOutput::new(Value::Array(out), json!({"count": count})));
    }

    let batch_size = config.batch_size.ok_or_else(|| {
        StepErrorKind::InvalidConfig("split requires 'batch_size' or 'field' + 'separator'".into())
    })?;
    if batch_size == 0 {
        return Err(StepErrorKind::InvalidConfig(
            "split batch_size must be >= 1".into(),
        ));
    }
    let batches: Vec<Value> = items
        .chunks(batch_size)
        .map(|chunk| Value::Array(chunk.to_vec()))
        .collect();
    let count = batches.len();
    Ok(TransformOutput::new(
        Value::Array(batches),
        json!({"batch_size": batch_size, "batches": count}),
    ))
}

#[derive(Debug, Deserialize)]
struct ExpandConfig {
    field: String,
}

/// One output item per element of `item[field]`, with the field replaced by the element.
fn expand(items: Vec<Value>, config: ExpandConfig) -> TransformResult {
    let mut out = Vec::new();
    for item in items {
        match field_value(&item, &config.field) {
            Some(Value::Array(elements)) => {
                for element in elements {
                    let mut row = item.clone();
                    if let Value::Object(map) = &mut row {
                        map.insert(config.field.clone(), element.clone());
                    }
                    out.push(row);
                }
            }
            _ => out.push(item),
        }
    }
    let count = out.len();
    Ok(TransformOutput::new(Value::Array(out), json!({"count": count})))
}

#[derive(Debug, Deserialize)]
struct FlattenConfig {
    #[serde(default = "default_flatten_depth")]
    depth: usize,
}

fn default_flatten_depth() -> usize {
    1
}

fn flatten(items: Vec<Value>, config: FlattenConfig) -> TransformResult {
    fn push_flat(value: Value, depth: usize, out: &mut Vec<Value>) {
        match value {
            Value::Array(inner) if depth > 0 => {
                for v in inner {
                    push_flat(v, depth - 1, out);
                }
            }
            other => out.push(other),
        }
    }

    let mut out = Vec::new();
    for item in items {
        push_flat(item, config.depth, &mut out);
    }
    let count = out.len();
    Ok(TransformOutput::new(Value::Array(out), json!({"count": count})))
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Deserialize)]
struct SortConfig {
    #[serde(default)]
    by: Option<String>,
    #[serde(default)]
    order: SortOrder,
}

fn sort(mut items: Vec<Value>, config: SortConfig) -> TransformResult {
    let key = |item: &Value| -> Value {
        match &config.by {
            Some(field) => field_value(item, field).cloned().unwrap_or(Value::Null),
            None => item.clone(),
        }
    };
    items.sort_by(|a, b| {
        let ordering = compare_values(&key(a), &key(b));
        match config.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
    let count = items.len();
    Ok(TransformOutput::new(Value::Array(items), json!({"count": count})))
}

// =============================================================================
// extract
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ExtractFormat {
    #[default]
    Auto,
    Text,
    Base64,
}

#[derive(Debug, Deserialize)]
struct ExtractConfig {
    /// Item field holding the unstructured content
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    format: ExtractFormat,
    #[serde(default = "default_extract_output")]
    output_field: String,
}

fn default_extract_output() -> String {
    "extracted_text".to_string()
}

/// Turn unstructured content (attachments, encoded files) into text.
///
/// Attachment objects are read from `content`, `data` or `text`.
fn extract(items: Vec<Value>, config: ExtractConfig) -> TransformResult {
    let field = config.field.as_deref().unwrap_or("attachments");
    let mut extracted_count = 0usize;

    let out: Vec<Value> = items
        .into_iter()
        .map(|mut item| {
            let text = field_value(&item, field).map(|v| extract_text(v, config.format));
            if let (Some(text), Value::Object(map)) = (text, &mut item) {
                if !text.is_empty() {
                    extracted_count += 1;
                }
                map.insert(config.output_field.clone(), json!(text));
            }
            item
        })
        .collect();

    Ok(TransformOutput::new(
        Value::Array(out),
        json!({"field": field, "extracted": extracted_count}),
    ))
}

fn extract_text(value: &Value, format: ExtractFormat) -> String {
    match value {
        Value::String(s) => decode_payload(s, format),
        Value::Array(parts) => parts
            .iter()
            .map(|p| extract_text(p, format))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => ["content", "data", "text"]
            .iter()
            .find_map(|k| map.get(*k))
            .map(|v| extract_text(v, format))
            .unwrap_or_default(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode_payload(text: &str, format: ExtractFormat) -> String {
    let decode = || {
        base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    };
    match format {
        ExtractFormat::Text => text.to_string(),
        ExtractFormat::Base64 => decode().unwrap_or_default(),
        ExtractFormat::Auto => {
            let looks_encoded = text.len() >= 8
                && !text.contains(' ')
                && text
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "+/=\n\r".contains(c));
            if looks_encoded {
                decode().unwrap_or_else(|| text.to_string())
            } else {
                text.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Combinator;
    use crate::workflow::{ConditionOperator, FilterRule};

    fn engine() -> TransformEngine {
        TransformEngine::new()
    }

    fn tickets() -> Vec<Value> {
        vec![
            json!({"id": 1, "status": "open", "priority": "high", "owner": "ana"}),
            json!({"id": 2, "status": "closed", "priority": "high", "owner": "bo"}),
            json!({"id": 3, "status": "open", "priority": "low", "owner": "ana"}),
            json!({"id": 4, "status": "pending", "priority": "low", "owner": "cy"}),
        ]
    }

    fn rule(field: &str, value: &str) -> FilterRule {
        FilterRule {
            field: field.into(),
            operator: ConditionOperator::Equals,
            value: json!(value),
        }
    }

    fn ids(output: &TransformOutput) -> Vec<i64> {
        output
            .data
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_chained_filters_equal_and_not_or() {
        let c1 = rule("status", "open");
        let c2 = rule("priority", "high");

        let first = filter(
            tickets(),
            &FilterConfig { conditions: vec![c1.clone()], combine_with: Combinator::And },
        )
        .unwrap();
        let chained = filter(
            first.data.as_array().unwrap().clone(),
            &FilterConfig { conditions: vec![c2.clone()], combine_with: Combinator::And },
        )
        .unwrap();

        let and = filter(
            tickets(),
            &FilterConfig { conditions: vec![c1.clone(), c2.clone()], combine_with: Combinator::And },
        )
        .unwrap();
        let or = filter(
            tickets(),
            &FilterConfig { conditions: vec![c1, c2], combine_with: Combinator::Or },
        )
        .unwrap();

        assert_eq!(ids(&chained), ids(&and));
        assert_eq!(ids(&and), vec![1]);
        assert_eq!(ids(&or), vec![1, 2, 3]);
        assert_ne!(ids(&chained), ids(&or));
    }

    #[test]
    fn test_filter_same_field_or() {
        let out = filter(
            tickets(),
            &FilterConfig {
                conditions: vec![rule("status", "open"), rule("status", "pending")],
                combine_with: Combinator::Or,
            },
        )
        .unwrap();
        assert_eq!(ids(&out), vec![1, 3, 4]);
    }

    #[test]
    fn test_group_preserves_first_appearance() {
        let out = apply(TransformOp::Group, tickets(), &json!({"key": "owner"}), &engine()).unwrap();
        let groups = out.data["groups"].as_array().unwrap();
        let keys: Vec<&str> = groups.iter().map(|g| g["key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["ana", "bo", "cy"]);
        assert_eq!(groups[0]["count"], 2);
    }

    #[test]
    fn test_aggregate_functions() {
        let items = vec![json!({"n": 2}), json!({"n": 4}), json!({"n": "6"})];
        let sum = apply(TransformOp::Aggregate, items.clone(), &json!({"function": "sum", "field": "n"}), &engine()).unwrap();
        assert_eq!(sum.data["value"], json!(12.0));
        let avg = apply(TransformOp::Aggregate, items.clone(), &json!({"function": "avg", "field": "n"}), &engine()).unwrap();
        assert_eq!(avg.data["value"], json!(4.0));
        let count = apply(TransformOp::Aggregate, items, &json!({"function": "count"}), &engine()).unwrap();
        assert_eq!(count.data["value"], json!(3));
    }

    #[test]
    fn test_deduplicate_keep_first_and_last() {
        let items = vec![
            json!({"email": "a@x.io", "v": 1}),
            json!({"email": "b@x.io", "v": 2}),
            json!({"email": "a@x.io", "v": 3}),
        ];
        let first = apply(TransformOp::Deduplicate, items.clone(), &json!({"key": "email"}), &engine()).unwrap();
        assert_eq!(first.data, json!([{"email": "a@x.io", "v": 1}, {"email": "b@x.io", "v": 2}]));
        let last = apply(TransformOp::Deduplicate, items, &json!({"key": "email", "keep": "last"}), &engine()).unwrap();
        assert_eq!(last.data, json!([{"email": "b@x.io", "v": 2}, {"email": "a@x.io", "v": 3}]));
    }

    #[test]
    fn test_deduplicate_passes_items_without_key() {
        let items = vec![
            json!({"email": "a@x.io", "v": 1}),
            json!({"v": 2}),
            json!({"email": null, "v": 3}),
            json!({"v": 4}),
            json!({"email": "a@x.io", "v": 5}),
        ];
        let out = apply(TransformOp::Deduplicate, items, &json!({"key": "email"}), &engine()).unwrap();
        assert_eq!(
            out.data,
            json!([{"email": "a@x.io", "v": 1}, {"v": 2}, {"email": null, "v": 3}, {"v": 4}])
        );
        assert_eq!(out.metadata["removed"], json!(1));
        assert_eq!(out.metadata["missing_key"], json!(3));
    }

    #[test]
    fn test_map_and_reduce_expressions() {
        let items = vec![json!({"price": 2, "qty": 3}), json!({"price": 5, "qty": 1})];
        let mapped = apply(TransformOp::Map, items.clone(), &json!({"expression": "item.price * item.qty"}), &engine()).unwrap();
        assert_eq!(mapped.data, json!([6, 5]));

        let total = apply(
            TransformOp::Reduce,
            items,
            &json!({"expression": "acc + item.price * item.qty", "initial": 0}),
            &engine(),
        )
        .unwrap();
        assert_eq!(total.data, json!(11));
    }

    #[test]
    fn test_map_projection() {
        let out = apply(
            TransformOp::Map,
            vec![json!({"from": {"email": "a@x.io"}, "subject": "hi"})],
            &json!({"fields": {"sender": "from.email"}}),
            &engine(),
        )
        .unwrap();
        assert_eq!(out.data, json!([{"sender": "a@x.io"}]));
    }

    #[test]
    fn test_join_inner_and_left() {
        let orders = vec![json!({"cid": 1, "total": 10}), json!({"cid": 2, "total": 5})];
        let config = json!({"right": [{"cid": 1, "name": "Ada"}], "left_key": "cid"});
        let inner = apply(TransformOp::Join, orders.clone(), &config, &engine()).unwrap();
        assert_eq!(inner.data, json!([{"cid": 1, "total": 10, "name": "Ada"}]));

        let mut left_config = config;
        left_config["kind"] = json!("left");
        let left = apply(TransformOp::Join, orders, &left_config, &engine()).unwrap();
        assert_eq!(left.data.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_pivot() {
        let items = vec![
            json!({"rep": "ana", "month": "jan", "sales": 3}),
            json!({"rep": "ana", "month": "feb", "sales": 4}),
            json!({"rep": "bo", "month": "jan", "sales": 1}),
        ];
        let out = apply(
            TransformOp::Pivot,
            items,
            &json!({"row_key": "rep", "column_key": "month", "value_field": "sales"}),
            &engine(),
        )
        .unwrap();
        assert_eq!(out.data, json!([{"rep": "ana", "jan": 3, "feb": 4}, {"rep": "bo", "jan": 1}]));
    }

    #[test]
    fn test_split_expand_flatten_sort() {
        let batches = apply(TransformOp::Split, vec![json!(1), json!(2), json!(3)], &json!({"batch_size": 2}), &engine()).unwrap();
        assert_eq!(batches.data, json!([[1, 2], [3]]));
        assert!(apply(TransformOp::Split, vec![], &json!({"batch_size": 0}), &engine()).is_err());

        let expanded = apply(TransformOp::Expand, vec![json!({"id": 1, "tags": ["a", "b"]})], &json!({"field": "tags"}), &engine()).unwrap();
        assert_eq!(expanded.data, json!([{"id": 1, "tags": "a"}, {"id": 1, "tags": "b"}]));

        let flat = apply(TransformOp::Flatten, vec![json!([1, [2]]), json!(3)], &json!({}), &engine()).unwrap();
        assert_eq!(flat.data, json!([1, [2], 3]));

        let sorted = apply(TransformOp::Sort, tickets(), &json!({"by": "id", "order": "desc"}), &engine()).unwrap();
        assert_eq!(ids(&sorted), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_extract_decodes_attachments() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("Invoice total: 42 EUR");
        let items = vec![json!({"id": 1, "attachments": [{"filename": "inv.txt", "content": encoded}]})];
        let out = apply(TransformOp::Extract, items, &json!({}), &engine()).unwrap();
        assert_eq!(out.data[0]["extracted_text"], "Invoice total: 42 EUR");
        assert_eq!(out.metadata["extracted"], 1);
    }

    #[test]
    fn test_invalid_config_reported() {
        let err = apply(TransformOp::Group, tickets(), &json!({}), &engine()).unwrap_err();
        assert!(matches!(err, StepErrorKind::InvalidConfig(_)));
    }
}
