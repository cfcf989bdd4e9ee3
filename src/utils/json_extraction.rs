//! JSON extraction from LLM responses.
//!
//! Fixers are asked to answer with a single JSON object, but models wrap it
//! in markdown fences, prefix it with reasoning, or get cut off mid-object.
//! Extraction tries, in order:
//!
//! 1. A ```json fenced block
//! 2. Any fenced block containing an object
//! 3. The response itself, when it starts with `{`
//! 4. The largest valid object anywhere in the response, preferring later ones
//!
//! If none parses but an object was opened and never closed, the response is
//! reported as truncated rather than missing.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("valid json fence regex"));

static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").expect("valid fence regex"));

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Brace and bracket balance of a string, ignoring string literals.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonStructureAnalysis {
    pub unclosed_braces: usize,
    pub unclosed_brackets: usize,
    /// Whether the scan ended inside a string literal.
    pub in_string: bool,
    /// Byte offset of the first `{` or `[`.
    pub json_start: Option<usize>,
}

impl JsonStructureAnalysis {
    pub fn is_unbalanced(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut brace_depth: isize = 0;
    let mut bracket_depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut json_start = None;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                json_start.get_or_insert(i);
                brace_depth += 1;
            }
            '}' if !in_string => brace_depth -= 1,
            '[' if !in_string => {
                json_start.get_or_insert(i);
                bracket_depth += 1;
            }
            ']' if !in_string => bracket_depth -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: brace_depth.max(0) as usize,
        unclosed_brackets: bracket_depth.max(0) as usize,
        in_string,
        json_start,
    }
}

/// Index of the `}` closing the object that `s` starts with.
///
/// Braces inside string literals, including escaped quotes, are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parses(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

/// The first object inside `block`, if it parses.
fn object_in_block(block: &str) -> Option<String> {
    let block = block.trim();
    let start = block.find('{')?;
    let end = find_matching_brace(&block[start..])?;
    let candidate = &block[start..=start + end];
    parses(candidate).then(|| candidate.to_string())
}

/// Largest valid object in `content`; ties go to the later one.
///
/// Reasoning models often quote small example objects before the answer.
pub fn extract_largest_json_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let rest = &content[start..];
            let end = find_matching_brace(rest)?;
            let candidate = &rest[..=end];
            parses(candidate).then_some((start, candidate))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json.to_string())
}

/// Extracts a JSON object from an LLM response.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(json) = JSON_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|m| object_in_block(m.as_str()))
    {
        return Ok(json);
    }

    if let Some(json) = ANY_FENCE
        .captures_iter(trimmed)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| object_in_block(m.as_str()))
    {
        return Ok(json);
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            let candidate = &trimmed[..=end];
            if parses(candidate) {
                return Ok(candidate.to_string());
            }
        }
    }

    if let Some(json) = extract_largest_json_object(trimmed) {
        return Ok(json);
    }

    let analysis = analyze_json_structure(trimmed);
    if let Some(start) = analysis.json_start.filter(|_| analysis.is_unbalanced()) {
        let partial_preview: String = trimmed[start..].chars().take(100).collect();
        return Err(JsonExtractionError::Truncated {
            partial_preview,
            unclosed_braces: analysis.unclosed_braces,
            unclosed_brackets: analysis.unclosed_brackets,
        });
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(50).collect(),
    })
}
