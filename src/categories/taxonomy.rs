//! Failure category taxonomy.
//!
//! Verification output is classified by ordered pattern matching: the
//! specific categories are tried first and `Unknown` is the fallback.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A third-party package is not installed or cannot be resolved.
    MissingDependency,
    /// A local module or symbol import cannot be resolved.
    ImportError,
    SyntaxError,
    TypeError,
    /// A name is referenced but never defined.
    UndefinedSymbol,
    TestFailure,
    LintError,
    /// Build tooling or project configuration is broken.
    BuildConfig,
    /// Nothing more specific matched.
    Unknown,
}

impl ErrorCategory {
    /// Returns all categories in classification order.
    pub fn all() -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::MissingDependency,
            ErrorCategory::ImportError,
            ErrorCategory::SyntaxError,
            ErrorCategory::TypeError,
            ErrorCategory::UndefinedSymbol,
            ErrorCategory::TestFailure,
            ErrorCategory::LintError,
            ErrorCategory::BuildConfig,
            ErrorCategory::Unknown,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::MissingDependency => "missing_dependency",
            ErrorCategory::ImportError => "import_error",
            ErrorCategory::SyntaxError => "syntax_error",
            ErrorCategory::TypeError => "type_error",
            ErrorCategory::UndefinedSymbol => "undefined_symbol",
            ErrorCategory::TestFailure => "test_failure",
            ErrorCategory::LintError => "lint_error",
            ErrorCategory::BuildConfig => "build_config",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Classifies failure text into the first matching category.
    pub fn classify(text: &str) -> ErrorCategory {
        RULES
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(text)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Returns a repair hint targeted at this category.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorCategory::MissingDependency => {
                "A required package is missing. Add it to the project's dependency manifest \
                 (package.json, requirements.txt, Cargo.toml, go.mod, ...) rather than \
                 vendoring code, and check the package name for typos."
            }
            ErrorCategory::ImportError => {
                "An import cannot be resolved. Check relative paths, file extensions, \
                 exported names and whether the imported module actually exists."
            }
            ErrorCategory::SyntaxError => {
                "The code does not parse. Look for unbalanced brackets, missing separators \
                 or an edit that was cut off, starting at the reported location."
            }
            ErrorCategory::TypeError => {
                "Types disagree. Fix the value or the signature at the reported location \
                 instead of adding casts that hide the mismatch."
            }
            ErrorCategory::UndefinedSymbol => {
                "A name is used but not defined or not in scope. Define it, import it, or \
                 correct the spelling."
            }
            ErrorCategory::TestFailure => {
                "The code builds but tests fail. Compare expected and actual values and fix \
                 the implementation; do not edit the tests to match broken behavior."
            }
            ErrorCategory::LintError => {
                "A linter rejected the change. Apply the rule's suggested fix; do not \
                 disable the rule."
            }
            ErrorCategory::BuildConfig => {
                "The build configuration is broken. Check manifests, compiler options and \
                 scripts referenced by the build command."
            }
            ErrorCategory::Unknown => {
                "The failure did not match a known category. Read the output carefully, \
                 identify the first real error and make the smallest change that fixes it."
            }
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::all()
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown error category '{}'", s))
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("valid category regex"))
        .collect()
}

/// Classification rules, most specific first.
static RULES: LazyLock<Vec<(ErrorCategory, Vec<Regex>)>> = LazyLock::new(|| {
    vec![
        (
            ErrorCategory::MissingDependency,
            compile(&[
                r#"(?i)cannot find module ['"][^./'"]"#,
                r#"(?i)can't resolve ['"][^./'"]"#,
                r"(?i)no module named",
                r"(?i)err_module_not_found",
                r"(?i)can't find crate for",
                r"(?i)no matching package named",
                r"(?i)could not find (a )?(package|dependency)",
                r"(?i)package \S+ is not installed",
                r"(?i)cannot find package",
            ]),
        ),
        (
            ErrorCategory::ImportError,
            compile(&[
                r"(?i)cannot find module",
                r"(?i)can't resolve",
                r"(?i)importerror",
                r"(?i)unresolved import",
                r"(?i)cannot import name",
                r"(?i)has no exported member",
                r"(?i)failed to resolve import",
            ]),
        ),
        (
            ErrorCategory::SyntaxError,
            compile(&[
                r"(?i)syntaxerror",
                r"(?i)syntax error",
                r"(?i)unexpected token",
                r"(?i)unexpected end of (input|file)",
                r"(?i)indentationerror",
                r"(?i)unterminated (string|comment|template)",
                r"(?i)expected one of .+, found",
                r"(?i)parse error",
                r"\bTS1\d{3}\b",
            ]),
        ),
        (
            ErrorCategory::TypeError,
            compile(&[
                r"(?i)typeerror",
                r"(?i)mismatched types",
                r"(?i)is not assignable to",
                r"(?i)incompatible types?",
                r"\berror\[E0308\]",
                r"\bTS2(322|345|339)\b",
            ]),
        ),
        (
            ErrorCategory::UndefinedSymbol,
            compile(&[
                r"(?i)cannot find (name|value|function|type|symbol|macro)",
                r"(?i)is not defined",
                r"(?i)nameerror",
                r"(?i)undefined (reference|symbol|variable|method|function|name)",
                r"(?i)has no attribute",
                r"(?i)does not exist on type",
                r"\berror\[E0425\]",
                r"\bTS2304\b",
            ]),
        ),
        (
            ErrorCategory::TestFailure,
            compile(&[
                r"(?i)assertionerror",
                r"(?i)assertion failed",
                r"(?i)\btests? failed\b",
                r"(?i)\d+ failing\b",
                r"(?i)panicked at",
                r"(?i)expected:? .+ (received|but got|got|actual)",
                r"\bFAIL(ED)?\b",
            ]),
        ),
        (
            ErrorCategory::LintError,
            compile(&[
                r"(?i)\beslint\b",
                r"(?i)\bclippy\b",
                r"(?i)\b(flake8|pylint|ruff|rubocop|golangci-lint)\b",
                r"(?i)\blint(ing)? (error|failed)",
                r"(?i)prettier",
            ]),
        ),
        (
            ErrorCategory::BuildConfig,
            compile(&[
                r"(?i)tsconfig",
                r"(?i)cargo\.toml",
                r"(?i)package\.json",
                r"(?i)command not found",
                r"(?i)missing script",
                r"(?i)(invalid|failed to load) config",
                r"(?i)no such file or directory",
            ]),
        ),
    ]
});
