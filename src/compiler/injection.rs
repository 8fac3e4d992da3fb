//! AI-processing classification for auto-injection.
//!
//! Decides which AI needs are really deduplication and which consume
//! unstructured content that must be extracted first.

use std::collections::HashMap;

use crate::ir::AiProcessing;

/// Processing types that mean "deduplicate".
pub const DEDUPE_ALIASES: [&str; 8] = [
    "dedupe",
    "dedup",
    "deduplicate",
    "unique",
    "distinct",
    "uniq",
    "remove_duplicates",
    "drop_duplicates",
];

/// Words that mark content as unstructured.
const UNSTRUCTURED_MARKERS: &[&str] = &[
    "attachment",
    "file",
    "document",
    "doc",
    "pdf",
    "image",
    "binary",
    "binaries",
    "scan",
];

/// `"Remove Duplicates"` and `"remove-duplicates"` both become `remove_duplicates`.
pub fn normalize_type(processing_type: &str) -> String {
    processing_type
        .trim()
        .to_ascii_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn is_dedupe(ai: &AiProcessing) -> bool {
    DEDUPE_ALIASES.contains(&normalize_type(&ai.processing_type).as_str())
}

fn mentions_unstructured(text: &str) -> bool {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| {
            let singular = word.strip_suffix('s').unwrap_or(word);
            UNSTRUCTURED_MARKERS.contains(&word) || UNSTRUCTURED_MARKERS.contains(&singular)
        })
}

/// Whether the processing reads unstructured content.
pub fn needs_extraction(ai: &AiProcessing) -> bool {
    ai.input_field.as_deref().map(mentions_unstructured).unwrap_or(false)
        || mentions_unstructured(&ai.instruction)
}

/// Item field an injected extraction reads.
pub fn extraction_field(ai: &AiProcessing) -> String {
    match ai.input_field.as_deref() {
        Some(field) if mentions_unstructured(field) => field.to_string(),
        _ => "attachments".to_string(),
    }
}

/// Tracks dedupe intents by key to report collisions.
#[derive(Debug, Default)]
pub struct DedupeTracker {
    seen: HashMap<String, String>,
}

impl DedupeTracker {
    /// Record a dedupe on `key`; returns a warning if one was already seen.
    pub fn record(&mut self, key: Option<&str>, alias: &str) -> Option<String> {
        let slot = key.unwrap_or("<whole item>").to_string();
        match self.seen.get(&slot) {
            Some(previous) => Some(format!(
                "deduplication on '{}' requested twice ({} and {}); both steps kept, resolve explicitly",
                slot, previous, alias
            )),
            None => {
                self.seen.insert(slot, alias.to_string());
                None
            }
        }
    }
}
