//! Template reference parsing.
//!
//! A reference is `{{ root.path.to[0].field }}`: a root name (step id,
//! branch variable or `input`) followed by field names and numeric indices.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::ResolutionError;

/// Regex matching one `{{ ... }}` token.
pub fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("valid regex"))
}

/// An identifier not preceded by `.`, i.e. the root of a path.
fn root_identifier_regex() -> &'static Regex {
    static ROOT_REGEX: OnceLock<Regex> = OnceLock::new();
    ROOT_REGEX.get_or_init(|| {
        Regex::new(r"(?:^|[^.\w])([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

/// A parsed template reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub root: String,
    pub path: Vec<PathSegment>,
}

impl TemplateRef {
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{{{{{}}}}}", self.root)
        } else {
            write!(f, "{{{{{}.{}}}}}", self.root, self.path_string())
        }
    }
}

/// A token found in a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte range of the whole `{{ ... }}` token
    pub span: Range<usize>,
    /// Trimmed inner text
    pub inner: String,
}

/// All tokens in `text`, in order.
pub fn find_tokens(text: &str) -> Vec<Token> {
    token_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?;
            Some(Token {
                span: whole.range(),
                inner: inner.as_str().to_string(),
            })
        })
        .collect()
}

pub fn has_tokens(text: &str) -> bool {
    token_regex().is_match(text)
}

/// Inner text if `text` is exactly one token (surrounding whitespace allowed).
pub fn bare_reference(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let caps = token_regex().captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse the inner text of a token into a reference.
pub fn parse_reference(inner: &str) -> std::result::Result<TemplateRef, ResolutionError> {
    let invalid = || ResolutionError::InvalidTemplate(format!("{{{{{}}}}}", inner));
    let inner = inner.trim();
    let mut parts = inner.split('.');
    let root_part = parts.next().ok_or_else(invalid)?;

    let (root, mut path) = split_indices(root_part).ok_or_else(invalid)?;
    if !is_identifier(&root) {
        return Err(invalid());
    }

    for part in parts {
        let (name, indices) = split_indices(part).ok_or_else(invalid)?;
        if name.is_empty() && indices.is_empty() {
            return Err(invalid());
        }
        if !name.is_empty() {
            if let Ok(index) = name.parse::<usize>() {
                path.push(PathSegment::Index(index));
            } else if is_identifier(&name) {
                path.push(PathSegment::Field(name));
            } else {
                return Err(invalid());
            }
        }
        path.extend(indices);
    }

    Ok(TemplateRef { root, path })
}

/// Split `name[0][1]` into `("name", [Index(0), Index(1)])`.
fn split_indices(part: &str) -> Option<(String, Vec<PathSegment>)> {
    let Some(open) = part.find('[') else {
        return Some((part.to_string(), Vec::new()));
    };
    let name = part[..open].to_string();
    let mut rest = &part[open..];
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let body = rest.strip_prefix('[')?;
        let close = body.find(']')?;
        let index = body[..close].trim().parse::<usize>().ok()?;
        indices.push(PathSegment::Index(index));
        rest = &body[close + 1..];
    }
    Some((name, indices))
}

/// Parse every reference in `text`; invalid tokens are reported as errors.
pub fn extract_references(text: &str) -> Vec<std::result::Result<TemplateRef, ResolutionError>> {
    find_tokens(text)
        .into_iter()
        .map(|t| parse_reference(&t.inner))
        .collect()
}

/// Root names referenced by every token in `text`, expressions included.
pub fn referenced_roots(text: &str) -> Vec<String> {
    let mut roots = Vec::new();
    for token in find_tokens(text) {
        match parse_reference(&token.inner) {
            Ok(reference) => roots.push(reference.root),
            Err(_) => roots.extend(
                root_identifier_regex()
                    .captures_iter(&token.inner)
                    .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string())),
            ),
        }
    }
    roots.dedup();
    roots
}

/// Rewrite reference roots inside tokens. Text outside tokens is untouched.
pub fn rename_roots(text: &str, renames: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for token in find_tokens(text) {
        out.push_str(&text[last..token.span.start]);
        let slice = &text[token.span.clone()];
        let renamed = root_identifier_regex().replace_all(slice, |caps: &regex_lite::Captures<'_>| {
            let whole = &caps[0];
            let ident = &caps[1];
            match renames.get(ident) {
                Some(new) => format!("{}{}", &whole[..whole.len() - ident.len()], new),
                None => whole.to_string(),
            }
        });
        out.push_str(&renamed);
        last = token.span.end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_reference() {
        let r = parse_reference("step1.emails").unwrap();
        assert_eq!(r.root, "step1");
        assert_eq!(r.path, vec![PathSegment::Field("emails".into())]);
    }

    #[test]
    fn test_parse_indices() {
        let r = parse_reference("step2.items[0].tags.1").unwrap();
        assert_eq!(
            r.path,
            vec![
                PathSegment::Field("items".into()),
                PathSegment::Index(0),
                PathSegment::Field("tags".into()),
                PathSegment::Index(1),
            ]
        );
        assert_eq!(r.path_string(), "items.0.tags.1");
    }

    #[test]
    fn test_invalid_references() {
        assert!(parse_reference("").is_err());
        assert!(parse_reference("step1..x").is_err());
        assert!(parse_reference("a + b").is_err());
        assert!(parse_reference("step1.items[x]").is_err());
    }

    #[test]
    fn test_bare_reference() {
        assert_eq!(bare_reference("  {{ step1.id }} "), Some("step1.id"));
        assert_eq!(bare_reference("[\"{{step1.id}}\"]"), None);
        assert_eq!(bare_reference("{{a}}{{b}}"), None);
        assert_eq!(bare_reference("plain"), None);
    }

    #[test]
    fn test_find_tokens_spans() {
        let text = "Hi {{ group.key }}, see {{step1}}";
        let tokens = find_tokens(text);
        assert_eq!(tokens.len(), 2);
        assert_eq!(&text[tokens[0].span.clone()], "{{ group.key }}");
        assert_eq!(tokens[1].inner, "step1");
    }

    #[test]
    fn test_display_round_trip() {
        let r = parse_reference("group.items").unwrap();
        assert_eq!(r.to_string(), "{{group.items}}");
    }

    #[test]
    fn test_referenced_roots_include_expressions() {
        assert_eq!(referenced_roots("{{step1.emails}}"), vec!["step1"]);
        assert_eq!(
            referenced_roots("total: {{ step2.total * step3.rate }}"),
            vec!["step2", "step3"]
        );
        assert!(referenced_roots("no tokens").is_empty());
    }

    #[test]
    fn test_rename_roots_only_inside_tokens() {
        let renames: HashMap<String, String> = [
            ("step2".to_string(), "step3".to_string()),
            ("step2_1".to_string(), "step3_1".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            rename_roots("step2 says {{ step2.items[0] }} and {{step2_1}}", &renames),
            "step2 says {{ step3.items[0] }} and {{step3_1}}"
        );
        assert_eq!(rename_roots("{{item.step2}}", &renames), "{{item.step2}}");
    }
}
