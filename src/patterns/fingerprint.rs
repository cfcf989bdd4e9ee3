//! Error fingerprinting.
//!
//! Errors are normalized by replacing the parts that vary between otherwise
//! identical failures (timestamps, file paths, line/column positions, quoted
//! identifiers, numbers) with fixed placeholders. The fingerprint is the
//! SHA-256 hex digest of the error's category and the normalized text.
//!
//! The category is part of the hash because classification can depend on
//! text that normalization erases: `Cannot find module './utils'` is an
//! import error while `Cannot find module 'left-pad'` is a missing
//! dependency, yet both normalize to `Cannot find module <ID>`.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::categories::ErrorCategory;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("valid fingerprint regex"));
    };
}

static_regex!(
    RE_TIMESTAMP,
    r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?"
);
static_regex!(RE_CLOCK, r"\b\d{1,2}:\d{2}:\d{2}(\.\d+)?\b");
static_regex!(RE_DATE, r"\b\d{4}-\d{2}-\d{2}\b");
static_regex!(
    RE_PATH,
    r"(?:[A-Za-z]:)?(?:\.{1,2})?[/\\]?(?:[\w.@-]+[/\\])+[\w.@-]+"
);
static_regex!(
    RE_FILE,
    r"\b[\w-]+\.(?:rs|ts|tsx|js|jsx|mjs|cjs|py|go|java|kt|rb|c|cc|cpp|h|hpp|cs|php|swift|vue|json|toml|ya?ml)\b"
);
static_regex!(RE_LINE_COL, r":\d+(?::\d+)?\b");
static_regex!(RE_PAREN_POS, r"\(\d+,\s*\d+\)");
static_regex!(RE_LINE_WORD, r"(?i)\bline \d+");
static_regex!(RE_HEX, r"\b0x[0-9a-fA-F]+\b");
static_regex!(RE_QUOTED, r#"'[^'\n]*'|"[^"\n]*"|`[^`\n]*`"#);
static_regex!(RE_NUMBER, r"\b\d+\b");
static_regex!(RE_WHITESPACE, r"\s+");

/// A normalized error, its category and its stable hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// SHA-256 hex digest of `category` and `normalized`.
    pub hash: String,
    /// Category of the raw error text.
    pub category: ErrorCategory,
    /// The normalized error text.
    pub normalized: String,
}

impl Fingerprint {
    /// Fingerprints a raw error message.
    pub fn of(raw: &str) -> Self {
        let category = ErrorCategory::classify(raw);
        let normalized = normalize(raw);
        let hash = hash_normalized(category, &normalized);
        Self {
            hash,
            category,
            normalized,
        }
    }
}

/// Normalizes an error message.
///
/// Replacement order matters: timestamps go before line:column so that
/// `12:30:45` is not read as a position, and paths go before quoted
/// identifiers so that a quoted path collapses to a single placeholder.
pub fn normalize(raw: &str) -> String {
    let text = RE_TIMESTAMP.replace_all(raw, "<TIME>");
    let text = RE_CLOCK.replace_all(&text, "<TIME>");
    let text = RE_DATE.replace_all(&text, "<TIME>");
    let text = RE_PATH.replace_all(&text, "<PATH>");
    let text = RE_FILE.replace_all(&text, "<PATH>");
    let text = RE_PAREN_POS.replace_all(&text, "(<POS>)");
    let text = RE_LINE_COL.replace_all(&text, ":<POS>");
    let text = RE_LINE_WORD.replace_all(&text, "line <POS>");
    let text = RE_HEX.replace_all(&text, "<HEX>");
    let text = RE_QUOTED.replace_all(&text, "<ID>");
    let text = RE_NUMBER.replace_all(&text, "<N>");
    RE_WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Returns the fingerprint hash of a raw error message.
pub fn fingerprint(raw: &str) -> String {
    Fingerprint::of(raw).hash
}

fn hash_normalized(category: ErrorCategory, normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Keywords that mark a line of tool output as part of the error itself.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "cannot",
    "can't",
    "failed",
    "failure",
    "not found",
    "not defined",
    "exception",
    "panicked",
    "undefined",
    "unexpected",
];

/// Extracts the lines of verification output that describe the error.
///
/// Build and test tools surround the error with progress noise (timings,
/// counters, banners) that would make every fingerprint unique. This keeps
/// up to `max_lines` lines containing an error marker, or the last
/// `max_lines` non-empty lines when none match.
pub fn error_signature(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let marked: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| {
            let lower = line.to_lowercase();
            ERROR_MARKERS.iter().any(|m| lower.contains(m))
        })
        .take(max_lines)
        .collect();

    if !marked.is_empty() {
        return marked.join("\n");
    }

    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
