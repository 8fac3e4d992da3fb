//! Delivery pattern detection, filter compilation and plugin shape hints.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::ir::{
    Combinator, DataSource, DeclarativeIr, DeliveryTarget, FilterClause, Filtering,
    PerGroupDelivery, SourceKind,
};
use crate::workflow::{ConditionOperator, FilterConfig, FilterRule};

/// How results leave the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryPattern {
    /// One delivery per group, partitioned on `key`
    PerGroup {
        key: String,
        target: PerGroupDelivery,
    },
    /// One aggregated delivery
    Summary(DeliveryTarget),
    /// The final collection, passed through
    Raw(DeliveryTarget),
}

impl DeliveryPattern {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryPattern::PerGroup { .. } => "per_group_delivery",
            DeliveryPattern::Summary(_) => "summary_delivery",
            DeliveryPattern::Raw(_) => "raw_delivery",
        }
    }
}

/// Pick the delivery pattern: per-group, then summary, then raw.
///
/// When several rules are set the lower-precedence ones are ignored with a
/// warning.
pub fn detect_pattern(ir: &DeclarativeIr) -> Result<(DeliveryPattern, Vec<String>)> {
    let rules = &ir.delivery_rules;
    let pattern = if let Some(target) = &rules.per_group_delivery {
        let key = ir.group_key().ok_or_else(|| {
            Error::Compilation(
                "per_group_delivery needs a group key (group_by or grouping.group_by)".into(),
            )
        })?;
        DeliveryPattern::PerGroup {
            key: key.to_string(),
            target: target.clone(),
        }
    } else if let Some(target) = &rules.summary_delivery {
        DeliveryPattern::Summary(target.clone())
    } else if let Some(target) = &rules.raw_delivery {
        DeliveryPattern::Raw(target.clone())
    } else {
        return Err(Error::Compilation("no delivery rule is set".into()));
    };

    let mut warnings = Vec::new();
    if rules.configured_count() > 1 {
        let ignored: Vec<&str> = [
            ("per_group_delivery", rules.per_group_delivery.is_some()),
            ("summary_delivery", rules.summary_delivery.is_some()),
            ("raw_delivery", rules.raw_delivery.is_some()),
        ]
        .iter()
        .filter(|(name, set)| *set && *name != pattern.name())
        .map(|(name, _)| *name)
        .collect();
        warnings.push(format!(
            "several delivery rules set; using {} and ignoring {}",
            pattern.name(),
            ignored.join(", ")
        ));
    }
    Ok((pattern, warnings))
}

/// First pair of equals conditions on one field with different values.
fn conflicting_equals(rules: &[FilterRule]) -> Option<(&FilterRule, &FilterRule)> {
    rules.iter().enumerate().find_map(|(i, a)| {
        rules[i + 1..]
            .iter()
            .find(|b| {
                a.operator == ConditionOperator::Equals
                    && b.operator == a.operator
                    && b.field == a.field
                    && b.value != a.value
            })
            .map(|b| (a, b))
    })
}

/// Fold equals conditions sharing a field into one `in` condition.
///
/// Only used without an explicit combinator: two different values for one
/// field can only mean "either", while every other clause keeps AND. A folded
/// field that also carries other operators is ambiguous and fails closed.
fn fold_alternatives(rules: Vec<FilterRule>) -> Result<(Vec<FilterRule>, Vec<String>)> {
    let mut folded: Vec<FilterRule> = Vec::with_capacity(rules.len());
    let mut first_equals: HashMap<String, usize> = HashMap::new();
    let mut alternatives: Vec<usize> = Vec::new();

    for rule in rules {
        if rule.operator != ConditionOperator::Equals {
            folded.push(rule);
            continue;
        }
        let Some(&at) = first_equals.get(&rule.field) else {
            first_equals.insert(rule.field.clone(), folded.len());
            folded.push(rule);
            continue;
        };
        let target = &mut folded[at];
        if target.operator == ConditionOperator::In {
            if let Value::Array(values) = &mut target.value {
                if !values.contains(&rule.value) {
                    values.push(rule.value);
                }
            }
        } else if target.value != rule.value {
            let first = target.value.take();
            target.operator = ConditionOperator::In;
            target.value = Value::Array(vec![first, rule.value]);
            alternatives.push(at);
        }
    }

    let mut warnings = Vec::new();
    for &at in &alternatives {
        let rule = &folded[at];
        let clashing = folded
            .iter()
            .enumerate()
            .any(|(i, other)| i != at && other.field == rule.field);
        if clashing {
            return Err(Error::Compilation(format!(
                "filter on '{}' mixes alternative values with other conditions on the same field; set combine_with explicitly",
                rule.field
            )));
        }
        let values: Vec<String> = rule
            .value
            .as_array()
            .map(|values| values.iter().map(Value::to_string).collect())
            .unwrap_or_default();
        warnings.push(format!(
            "inferred OR for filter on '{}': {} cannot all hold, matching any of them",
            rule.field,
            values.join(", ")
        ));
    }
    Ok((folded, warnings))
}

/// Compile IR filtering into one filter config.
///
/// Only flat composition is supported; nested groups fail compilation. With
/// no explicit combinator the clauses are ANDed, except that equals clauses
/// on one field with different values are folded into a single `in` clause.
pub fn compile_filter(filtering: &Filtering) -> Result<(FilterConfig, Vec<String>)> {
    let mut rules = Vec::with_capacity(filtering.conditions.len());
    for (i, clause) in filtering.conditions.iter().enumerate() {
        match clause {
            FilterClause::Condition(c) => rules.push(FilterRule {
                field: c.field.clone(),
                operator: c.operator.into(),
                value: c.value.clone(),
            }),
            FilterClause::Group(_) => {
                return Err(Error::Compilation(format!(
                    "filtering.conditions[{}] is a nested group; only flat AND/OR filters are supported",
                    i
                )))
            }
        }
    }

    let mut warnings = Vec::new();
    let combine_with = match filtering.combine_with {
        None => {
            let (folded, inferred) = fold_alternatives(rules)?;
            rules = folded;
            warnings.extend(inferred);
            Combinator::And
        }
        Some(Combinator::And) => {
            if let Some((a, b)) = conflicting_equals(&rules) {
                warnings.push(format!(
                    "filter requires '{}' to equal both {} and {}; no item can match",
                    a.field, a.value, b.value
                ));
            }
            Combinator::And
        }
        Some(Combinator::Or) => Combinator::Or,
    };

    Ok((
        FilterConfig {
            conditions: rules,
            combine_with,
        },
        warnings,
    ))
}

/// Dominant collection field of a source's output.
pub fn collection_field(source: &DataSource) -> &'static str {
    match source.source.to_ascii_lowercase().as_str() {
        "gmail" | "outlook" | "email" => "emails",
        "sheets" | "google_sheets" => "values",
        "database" | "postgres" | "postgresql" | "mysql" | "sqlite" => "rows",
        "airtable" => "records",
        _ if source.kind == SourceKind::Database => "rows",
        _ => "items",
    }
}

/// Params for a data source's fetch action.
pub fn fetch_params(source: &DataSource) -> Value {
    let mut params: Map<String, Value> = source.params.clone().unwrap_or_default();
    if let Some(query) = &source.query {
        params.insert("query".into(), json!(query));
    }
    Value::Object(params)
}

/// Params for a delivery action, named the way the target plugin expects.
pub fn delivery_params(plugin: &str, recipient: Option<String>, subject: &str, body: String) -> Value {
    let mut params = Map::new();
    let (recipient_key, body_key, subject_key) = match plugin.to_ascii_lowercase().as_str() {
        "gmail" | "outlook" | "email" => ("to", "body", Some("subject")),
        "slack" | "teams" | "discord" => ("channel", "text", None),
        "sheets" | "google_sheets" => ("spreadsheet_id", "rows", None),
        _ => ("recipient", "content", Some("subject")),
    };
    if let Some(recipient) = recipient {
        params.insert(recipient_key.into(), json!(recipient));
    }
    if let Some(key) = subject_key {
        params.insert(key.into(), json!(subject));
    }
    params.insert(body_key.into(), json!(body));
    Value::Object(params)
}
