//! Repair requests and self-reflection notes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::fixer::FixerTier;
use crate::categories::ErrorCategory;
use crate::patterns::FixCandidate;
use crate::scheduler::AttemptRecord;

/// Relation between the current failure and the previous attempt's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryTrend {
    /// No earlier attempt.
    FirstAttempt,
    /// Same category as the previous attempt: the root cause is unaddressed.
    Unchanged,
    /// Category changed: the previous fix introduced a regression.
    Changed { previous: ErrorCategory },
}

/// What earlier attempts say about this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub trend: CategoryTrend,
    /// Files touched by two or more earlier attempts.
    pub repeated_files: Vec<String>,
    /// Strategies already tried without success, oldest first.
    pub attempted_strategies: Vec<String>,
}

impl Reflection {
    /// Builds the reflection for an attempt facing `current`.
    ///
    /// `rejected` is the pattern store's list of strategies that failed for
    /// this fingerprint in earlier jobs.
    pub fn from_history(
        history: &[AttemptRecord],
        current: ErrorCategory,
        rejected: &[String],
    ) -> Self {
        let trend = match history.last() {
            None => CategoryTrend::FirstAttempt,
            Some(last) => match last.category.parse::<ErrorCategory>() {
                Ok(previous) if previous != current => CategoryTrend::Changed { previous },
                _ => CategoryTrend::Unchanged,
            },
        };

        let mut touch_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in history {
            let mut seen: Vec<&str> = Vec::new();
            for file in &record.touched_files {
                if !seen.contains(&file.as_str()) {
                    seen.push(file);
                    *touch_counts.entry(file).or_default() += 1;
                }
            }
        }
        let repeated_files = touch_counts
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(file, _)| file.to_string())
            .collect();

        let mut attempted_strategies: Vec<String> = Vec::new();
        let earlier = history
            .iter()
            .filter(|r| !r.result.is_success())
            .filter_map(|r| r.strategy.as_deref());
        for strategy in rejected.iter().map(String::as_str).chain(earlier) {
            if !attempted_strategies.iter().any(|s| s == strategy) {
                attempted_strategies.push(strategy.to_string());
            }
        }

        Self {
            trend,
            repeated_files,
            attempted_strategies,
        }
    }

    /// Returns true when there is nothing to reflect on.
    pub fn is_empty(&self) -> bool {
        self.trend == CategoryTrend::FirstAttempt
            && self.repeated_files.is_empty()
            && self.attempted_strategies.is_empty()
    }

    /// Renders the reflection as prompt notes.
    pub fn notes(&self, current: ErrorCategory) -> Vec<String> {
        let mut notes = Vec::new();
        match self.trend {
            CategoryTrend::FirstAttempt => {}
            CategoryTrend::Unchanged => notes.push(format!(
                "The previous attempt failed with the same category ({}). Its fix did not \
                 address the root cause; try a different approach.",
                current
            )),
            CategoryTrend::Changed { previous } => notes.push(format!(
                "The failure changed from {} to {}. The previous fix likely introduced a \
                 regression; check what it changed before adding more.",
                previous, current
            )),
        }
        if !self.repeated_files.is_empty() {
            notes.push(format!(
                "These files were changed in several attempts without success: {}. \
                 The problem may be elsewhere.",
                self.repeated_files.join(", ")
            ));
        }
        if !self.attempted_strategies.is_empty() {
            let list = self
                .attempted_strategies
                .iter()
                .map(|s| format!("  - {}", s))
                .collect::<Vec<_>>()
                .join("\n");
            notes.push(format!("Strategies that already failed (do not repeat):\n{}", list));
        }
        notes
    }
}

/// Everything a fixer needs for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub job_key: String,
    /// What the job is supposed to accomplish, if the payload says.
    pub task: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub tier: FixerTier,
    pub category: ErrorCategory,
    pub fingerprint: String,
    /// Tail of the verification output.
    pub failure_excerpt: String,
    pub hint: String,
    /// Advisory fixes from the pattern store.
    pub candidates: Vec<FixCandidate>,
    pub reflection: Reflection,
    /// Files the job has changed so far.
    pub changed_files: Vec<String>,
}

impl RepairRequest {
    /// Renders the request as prompt text.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "# Repair request for {} (attempt {}/{}, {} tier)\n\n",
            self.job_key, self.attempt, self.max_attempts, self.tier
        ));

        if let Some(task) = &self.task {
            out.push_str("## Task\n");
            out.push_str(task.trim());
            out.push_str("\n\n");
        }

        out.push_str(&format!("## Failure ({})\n", self.category));
        out.push_str("```\n");
        out.push_str(self.failure_excerpt.trim_end());
        out.push_str("\n```\n\n");

        out.push_str("## Hint\n");
        out.push_str(&self.hint);
        out.push_str("\n\n");

        if !self.candidates.is_empty() {
            out.push_str("## Fixes that worked for similar failures (advisory)\n");
            for candidate in &self.candidates {
                out.push_str(&format!(
                    "- [{} match, confidence {:.2}] {}",
                    candidate.match_kind.as_str(),
                    candidate.confidence,
                    candidate.fix
                ));
                if !candidate.touched_files.is_empty() {
                    out.push_str(&format!(" (files: {})", candidate.touched_files.join(", ")));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        let notes = self.reflection.notes(self.category);
        if !notes.is_empty() {
            out.push_str("## Reflection\n");
            for note in notes {
                out.push_str(&note);
                out.push_str("\n\n");
            }
        }

        if !self.changed_files.is_empty() {
            out.push_str("## Files changed so far\n");
            for file in &self.changed_files {
                out.push_str(&format!("- {}\n", file));
            }
            out.push('\n');
        }

        out
    }
}

/// Keeps the last `max_chars` characters of `text`.
///
/// Build output puts the decisive error near the end, so the head is what
/// gets dropped.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("[... {} characters truncated ...]\n{}", skip, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::MatchKind;
    use crate::scheduler::AttemptResult;

    fn record(attempt: u32, category: &str, files: &[&str], strategy: &str) -> AttemptRecord {
        AttemptRecord {
            attempt,
            tier: "primary".to_string(),
            category: category.to_string(),
            fingerprint: "f".repeat(64),
            error_excerpt: "error".to_string(),
            strategy: Some(strategy.to_string()),
            touched_files: files.iter().map(|f| f.to_string()).collect(),
            result: AttemptResult::VerificationFailed,
            detail: None,
        }
    }

    #[test]
    fn test_first_attempt_reflection_is_empty() {
        let reflection = Reflection::from_history(&[], ErrorCategory::TypeError, &[]);
        assert_eq!(reflection.trend, CategoryTrend::FirstAttempt);
        assert!(reflection.is_empty());
        assert!(reflection.notes(ErrorCategory::TypeError).is_empty());
    }

    #[test]
    fn test_same_category_means_unaddressed() {
        let history = vec![record(1, "type_error", &["a.ts"], "cast it")];
        let reflection = Reflection::from_history(&history, ErrorCategory::TypeError, &[]);
        assert_eq!(reflection.trend, CategoryTrend::Unchanged);
        let notes = reflection.notes(ErrorCategory::TypeError);
        assert!(notes[0].contains("root cause"));
    }

    #[test]
    fn test_changed_category_means_regression() {
        let history = vec![record(1, "type_error", &["a.ts"], "cast it")];
        let reflection = Reflection::from_history(&history, ErrorCategory::SyntaxError, &[]);
        assert_eq!(
            reflection.trend,
            CategoryTrend::Changed {
                previous: ErrorCategory::TypeError
            }
        );
        assert!(reflection.notes(ErrorCategory::SyntaxError)[0].contains("regression"));
    }

    #[test]
    fn test_repeated_files_and_strategies() {
        let history = vec![
            record(1, "type_error", &["a.ts", "b.ts", "a.ts"], "cast it"),
            record(2, "type_error", &["a.ts"], "widen the type"),
        ];
        let rejected = vec!["cast it".to_string(), "delete the test".to_string()];
        let reflection = Reflection::from_history(&history, ErrorCategory::TypeError, &rejected);

        assert_eq!(reflection.repeated_files, vec!["a.ts".to_string()]);
        assert_eq!(
            reflection.attempted_strategies,
            vec!["cast it", "delete the test", "widen the type"]
        );
    }

    #[test]
    fn test_render_contains_sections() {
        let request = RepairRequest {
            job_key: "ISSUE-9".to_string(),
            task: Some("Add a date formatter".to_string()),
            attempt: 2,
            max_attempts: 3,
            tier: FixerTier::Primary,
            category: ErrorCategory::MissingDependency,
            fingerprint: "abc".to_string(),
            failure_excerpt: "Error: Cannot find module 'left-pad'".to_string(),
            hint: ErrorCategory::MissingDependency.hint().to_string(),
            candidates: vec![FixCandidate {
                fingerprint: "abc".to_string(),
                category: ErrorCategory::MissingDependency,
                fix: "install left-pad".to_string(),
                touched_files: vec!["package.json".to_string()],
                confidence: 0.95,
                success_count: 1,
                match_kind: MatchKind::Exact,
            }],
            reflection: Reflection::from_history(
                &[record(1, "missing_dependency", &["index.js"], "vendor it")],
                ErrorCategory::MissingDependency,
                &[],
            ),
            changed_files: vec!["index.js".to_string()],
        };

        let text = request.render();
        assert!(text.contains("attempt 2/3, primary tier"));
        assert!(text.contains("## Task\nAdd a date formatter"));
        assert!(text.contains("Cannot find module 'left-pad'"));
        assert!(text.contains("[exact match, confidence 0.95] install left-pad (files: package.json)"));
        assert!(text.contains("  - vendor it"));
        assert!(text.contains("- index.js"));
    }

    #[test]
    fn test_truncate_tail() {
        assert_eq!(truncate_tail("short", 10), "short");
        let out = truncate_tail("0123456789", 4);
        assert!(out.ends_with("\n6789"));
        assert!(out.starts_with("[... 6 characters truncated ...]"));
        // Multi-byte characters are never split.
        assert!(truncate_tail("ééééé", 2).ends_with("éé"));
    }
}
