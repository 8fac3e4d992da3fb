//! Step intent classification.
//!
//! Pattern rules settle the unambiguous cases (structural step kinds, well
//! known action verbs) with a fixed confidence. Everything else goes to a
//! [`SemanticClassifier`]; the default one scores keyword hits over the
//! step's name, action and instruction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{StepKind, TransformOp, WorkflowStep};

/// Confidence assigned by pattern rules.
pub const PATTERN_CONFIDENCE: f64 = 0.95;

/// Confidence when nothing matched at all.
const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepIntent {
    Retrieve,
    Transform,
    Extract,
    Classify,
    Summarize,
    Analyze,
    Generate,
    Deliver,
    Control,
}

impl StepIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepIntent::Retrieve => "retrieve",
            StepIntent::Transform => "transform",
            StepIntent::Extract => "extract",
            StepIntent::Classify => "classify",
            StepIntent::Summarize => "summarize",
            StepIntent::Analyze => "analyze",
            StepIntent::Generate => "generate",
            StepIntent::Deliver => "deliver",
            StepIntent::Control => "control",
        }
    }

    /// Whether steps with this intent consume model tokens.
    pub fn is_generative(&self) -> bool {
        matches!(
            self,
            StepIntent::Extract
                | StepIntent::Classify
                | StepIntent::Summarize
                | StepIntent::Analyze
                | StepIntent::Generate
        )
    }

    /// Relative token demand, used by proportional allocation.
    pub fn base_weight(&self) -> f64 {
        match self {
            StepIntent::Generate => 4.0,
            StepIntent::Analyze => 3.0,
            StepIntent::Summarize => 3.0,
            StepIntent::Extract => 2.0,
            StepIntent::Classify => 1.0,
            StepIntent::Retrieve
            | StepIntent::Transform
            | StepIntent::Deliver
            | StepIntent::Control => 0.5,
        }
    }

    /// How strongly the demand grows with agent complexity.
    pub fn complexity_sensitivity(&self) -> f64 {
        match self {
            StepIntent::Generate | StepIntent::Analyze => 1.0,
            StepIntent::Summarize | StepIntent::Extract => 0.6,
            StepIntent::Classify => 0.3,
            _ => 0.0,
        }
    }

    /// Scheduling priority for budget allocation (higher first).
    pub fn priority(&self) -> u8 {
        match self {
            StepIntent::Classify | StepIntent::Extract => 5,
            StepIntent::Summarize => 4,
            StepIntent::Analyze => 3,
            StepIntent::Generate => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for StepIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub intent: StepIntent,
    pub confidence: f64,
}

/// Classification of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: StepIntent,
    pub confidence: f64,
    pub alternatives: Vec<IntentScore>,
}

impl IntentClassification {
    fn certain(intent: StepIntent) -> Self {
        Self {
            intent,
            confidence: PATTERN_CONFIDENCE,
            alternatives: Vec::new(),
        }
    }
}

/// Fallback classifier for steps the pattern rules cannot settle.
pub trait SemanticClassifier: Send + Sync {
    /// Scores for candidate intents; need not be sorted or normalized.
    fn score(&self, text: &str) -> Vec<IntentScore>;
}

/// Keyword-hit scorer.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

const KEYWORDS: &[(StepIntent, &[&str])] = &[
    (StepIntent::Summarize, &["summar", "digest", "brief", "recap", "tl;dr", "overview"]),
    (StepIntent::Classify, &["classif", "categor", "label", "tag", "sentiment", "triage", "detect"]),
    (StepIntent::Extract, &["extract", "parse", "pull out", "ocr", "attachment", "invoice"]),
    (StepIntent::Analyze, &["analy", "insight", "trend", "evaluate", "assess", "score"]),
    (StepIntent::Generate, &["generate", "write", "draft", "compose", "reply", "respond", "create"]),
    (StepIntent::Retrieve, &["fetch", "search", "read", "list", "lookup", "query", "get"]),
    (StepIntent::Deliver, &["send", "notify", "post", "deliver", "email", "message"]),
];

impl SemanticClassifier for KeywordClassifier {
    fn score(&self, text: &str) -> Vec<IntentScore> {
        let text = text.to_lowercase();
        let hits: Vec<(StepIntent, usize)> = KEYWORDS
            .iter()
            .map(|(intent, words)| (*intent, words.iter().filter(|w| text.contains(*w)).count()))
            .filter(|(_, n)| *n > 0)
            .collect();
        let total: usize = hits.iter().map(|(_, n)| n).sum();
        hits.into_iter()
            .map(|(intent, n)| IntentScore {
                intent,
                confidence: n as f64 / total as f64 * 0.9,
            })
            .collect()
    }
}

/// Classifies steps by intent.
pub struct IntentClassifier {
    semantic: Box<dyn SemanticClassifier>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(Box::new(KeywordClassifier))
    }
}

impl IntentClassifier {
    pub fn new(semantic: Box<dyn SemanticClassifier>) -> Self {
        Self { semantic }
    }

    pub fn classify(&self, step: &WorkflowStep) -> IntentClassification {
        if let Some(intent) = pattern_intent(step) {
            return IntentClassification::certain(intent);
        }

        let mut scores = self.semantic.score(&describe(step));
        scores.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.intent.cmp(&b.intent))
        });

        if scores.is_empty() {
            return IntentClassification {
                intent: StepIntent::Generate,
                confidence: FALLBACK_CONFIDENCE,
                alternatives: Vec::new(),
            };
        }
        let best = scores.remove(0);
        IntentClassification {
            intent: best.intent,
            confidence: best.confidence,
            alternatives: scores,
        }
    }
}

const AI_VERBS: &[(&str, StepIntent)] = &[
    ("summarize", StepIntent::Summarize),
    ("summarise", StepIntent::Summarize),
    ("classify", StepIntent::Classify),
    ("categorize", StepIntent::Classify),
    ("extract", StepIntent::Extract),
    ("analyze", StepIntent::Analyze),
    ("analyse", StepIntent::Analyze),
    ("generate", StepIntent::Generate),
];

const RETRIEVE_PREFIXES: &[&str] = &["fetch", "search", "list", "get", "read", "query"];
const DELIVER_PREFIXES: &[&str] = &["send", "post", "notify", "deliver", "publish"];

fn pattern_intent(step: &WorkflowStep) -> Option<StepIntent> {
    match &step.kind {
        StepKind::Transform { operation, .. } => Some(match operation {
            TransformOp::Extract => StepIntent::Extract,
            _ => StepIntent::Transform,
        }),
        StepKind::Conditional { .. }
        | StepKind::ScatterGather { .. }
        | StepKind::Approval { .. }
        | StepKind::Validation { .. }
        | StepKind::Comparison { .. } => Some(StepIntent::Control),
        StepKind::Enrichment { .. } => Some(StepIntent::Transform),
        StepKind::Action { plugin, action, .. } => {
            let action = action.to_lowercase();
            if plugin == "ai" {
                return AI_VERBS
                    .iter()
                    .find(|(verb, _)| action == *verb)
                    .map(|(_, intent)| *intent);
            }
            if RETRIEVE_PREFIXES.iter().any(|p| action.starts_with(p)) {
                Some(StepIntent::Retrieve)
            } else if DELIVER_PREFIXES.iter().any(|p| action.starts_with(p)) {
                Some(StepIntent::Deliver)
            } else {
                None
            }
        }
    }
}

fn describe(step: &WorkflowStep) -> String {
    let mut parts = vec![step.name.clone()];
    if let StepKind::Action { action, params, .. } = &step.kind {
        parts.push(action.replace('_', " "));
        if let Some(instruction) = params.get("instruction").and_then(Value::as_str) {
            parts.push(instruction.to_string());
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(plugin: &str, action: &str, instruction: &str) -> WorkflowStep {
        WorkflowStep::new(
            "step1",
            format!("{} {}", plugin, action),
            StepKind::Action {
                plugin: plugin.into(),
                action: action.into(),
                params: json!({ "instruction": instruction }),
            },
        )
    }

    #[test]
    fn test_pattern_rules() {
        let classifier = IntentClassifier::default();
        let c = classifier.classify(&action("ai", "summarize", ""));
        assert_eq!(c.intent, StepIntent::Summarize);
        assert_eq!(c.confidence, PATTERN_CONFIDENCE);

        assert_eq!(classifier.classify(&action("gmail", "search_emails", "")).intent, StepIntent::Retrieve);
        assert_eq!(classifier.classify(&action("slack", "post_message", "")).intent, StepIntent::Deliver);
    }

    #[test]
    fn test_semantic_fallback() {
        let classifier = IntentClassifier::default();
        let c = classifier.classify(&action("ai", "process", "Give a short recap and summary of each thread"));
        assert_eq!(c.intent, StepIntent::Summarize);
        assert!(c.confidence < PATTERN_CONFIDENCE);
    }

    #[test]
    fn test_alternatives_reported() {
        let classifier = IntentClassifier::default();
        let c = classifier.classify(&action("ai", "process", "classify the sentiment then draft a reply"));
        assert!(!c.alternatives.is_empty());
        assert!(c.alternatives.iter().all(|a| a.confidence <= c.confidence));
    }

    struct Always(StepIntent);

    impl SemanticClassifier for Always {
        fn score(&self, _text: &str) -> Vec<IntentScore> {
            vec![IntentScore { intent: self.0, confidence: 0.7 }]
        }
    }

    #[test]
    fn test_custom_semantic_classifier() {
        let classifier = IntentClassifier::new(Box::new(Always(StepIntent::Analyze)));
        let c = classifier.classify(&action("ai", "think", ""));
        assert_eq!(c.intent, StepIntent::Analyze);
        assert_eq!(c.confidence, 0.7);
    }
}
