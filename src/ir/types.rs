//! Declarative IR type definitions.
//!
//! The IR describes *what* a workflow should achieve, never *how*: there are
//! no step ids, loops or variable references here. The compiler infers all of
//! those.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete declarative workflow description.
///
/// # Example JSON
///
/// ```json
/// {
///   "goal": "Notify each sales person about angry customer emails",
///   "data_sources": [
///     {"source": "gmail", "kind": "api", "operation": "search_emails", "query": "in:inbox", "params": null}
///   ],
///   "filtering": {
///     "conditions": [{"field": "body", "operator": "contains", "value": "angry"}],
///     "combine_with": null
///   },
///   "ai_processing": [],
///   "delivery_rules": {
///     "per_group_delivery": {"group_by": "sales_person", "plugin": "gmail", "action": "send_email", "recipient_field": null},
///     "summary_delivery": null,
///     "raw_delivery": null
///   },
///   "grouping": null
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarativeIr {
    /// Plain-language goal of the workflow
    pub goal: String,

    /// Where the data comes from (at least one)
    pub data_sources: Vec<DataSource>,

    /// Item-level filtering rules
    pub filtering: Option<Filtering>,

    /// AI processing needs, in the order they should apply
    pub ai_processing: Vec<AiProcessing>,

    /// How results are delivered
    pub delivery_rules: DeliveryRules,

    /// Grouping of items by a key
    pub grouping: Option<Grouping>,
}

/// A data source the workflow reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    /// Plugin providing the data (e.g. "gmail", "sheets")
    pub source: String,

    /// Kind of source
    pub kind: SourceKind,

    /// Plugin operation to fetch data (defaults to "fetch")
    pub operation: Option<String>,

    /// Free-form query understood by the plugin
    pub query: Option<String>,

    /// Additional plugin parameters
    pub params: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    Database,
    File,
    Webhook,
    Stream,
}

/// Filtering rules applied to fetched items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filtering {
    pub conditions: Vec<FilterClause>,

    /// How conditions combine; `null` lets the compiler infer it
    pub combine_with: Option<Combinator>,
}

/// A single filter clause: either a leaf condition or a nested group.
///
/// Nested groups parse so that they can be reported precisely, but the
/// compiler only supports flat, single-level composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterClause {
    Condition(FilterCondition),
    Group(FilterGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub combine_with: Option<Combinator>,
    pub conditions: Vec<FilterClause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
    Matches,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "not_equals",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContains => "not_contains",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::Exists => "exists",
            FilterOperator::Matches => "matches",
        }
    }
}

/// Boolean combinator for conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

impl std::fmt::Display for Combinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Combinator::And => write!(f, "AND"),
            Combinator::Or => write!(f, "OR"),
        }
    }
}

/// One AI processing need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiProcessing {
    /// Processing type, e.g. "summarize", "classify", "extract", "dedupe"
    #[serde(rename = "type")]
    pub processing_type: String,

    /// Natural-language instruction for the model
    pub instruction: String,

    /// Item field the processing reads
    pub input_field: Option<String>,

    /// Item field the processing writes
    pub output_field: Option<String>,
}

/// Delivery rules; at least one must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRules {
    pub per_group_delivery: Option<PerGroupDelivery>,
    pub summary_delivery: Option<DeliveryTarget>,
    pub raw_delivery: Option<DeliveryTarget>,
}

impl DeliveryRules {
    /// Number of delivery rules that are set.
    pub fn configured_count(&self) -> usize {
        [
            self.per_group_delivery.is_some(),
            self.summary_delivery.is_some(),
            self.raw_delivery.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Deliver one message per group of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerGroupDelivery {
    /// Item field to partition on (falls back to `grouping.group_by`)
    pub group_by: Option<String>,
    pub plugin: String,
    pub action: String,

    /// Item field holding the recipient (defaults to the group key itself)
    pub recipient_field: Option<String>,
}

/// Deliver to a fixed destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub plugin: String,
    pub action: String,
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grouping {
    pub group_by: Option<String>,
}

impl DeclarativeIr {
    /// Effective grouping key for per-group delivery.
    pub fn group_key(&self) -> Option<&str> {
        self.delivery_rules
            .per_group_delivery
            .as_ref()
            .and_then(|d| d.group_by.as_deref())
            .or_else(|| self.grouping.as_ref().and_then(|g| g.group_by.as_deref()))
    }
}
