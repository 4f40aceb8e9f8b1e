//! Detection of output that asks the operator to act.
//!
//! Advisory only: a missed prompt costs a notification, never correctness.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::tail_chars;

/// Characters of trailing output inspected.
pub const ACTION_WINDOW_CHARS: usize = 500;

/// What the agent appears to be asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Approval to run a tool or touch a file.
    Permission,
    /// Yes/no confirmation.
    Confirmation,
    /// Pick one of several listed options.
    Choice,
    /// Free-form information requested.
    Input,
    /// Output ends in a question without a recognised phrase.
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

/// A detected request for operator action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNeeded {
    pub kind: ActionKind,
    pub confidence: Confidence,
    /// Text that triggered the detection.
    pub excerpt: String,
}

#[allow(clippy::expect_used)]
static PHRASES: LazyLock<Vec<(ActionKind, Regex)>> = LazyLock::new(|| {
    [
        (
            ActionKind::Permission,
            r"(?i)do you want to (?:proceed|allow|make this edit|create|run|overwrite)[^\n]*",
        ),
        (ActionKind::Permission, r"(?i)\ballow\b[^\n]*\?"),
        (ActionKind::Permission, r"(?i)\bpermission to\b[^\n]*"),
        (
            ActionKind::Confirmation,
            r"(?i)[^\n]*(?:\((?:y/n|yes/no)\)|\[y/n\])",
        ),
        (ActionKind::Confirmation, r"(?i)\bare you sure\b[^\n]*"),
        (ActionKind::Confirmation, r"(?i)\b(?:continue|proceed)\?"),
        (
            ActionKind::Choice,
            r"(?m)^\s*(?:❯\s*)?1[.)]\s+\S[^\n]*\n\s*(?:❯\s*)?2[.)]\s+\S[^\n]*",
        ),
        (ActionKind::Choice, r"(?i)\b(?:select|choose)\b[^\n]*\b(?:option|one)\b[^\n]*"),
        (
            ActionKind::Input,
            r"(?i)\bplease (?:provide|enter|specify|share|confirm)\b[^\n]*",
        ),
        (ActionKind::Input, r"(?i)\bwhat would you like\b[^\n]*"),
        (
            ActionKind::Input,
            r"(?i)\blet me know (?:if|what|which|how|whether)\b[^\n]*",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("static regex is valid")))
    .collect()
});

/// Inspect the trailing window of cleaned output for a request to act.
///
/// Phrase rules are tried in order and yield high confidence; failing those,
/// a trailing question mark yields low confidence.
pub fn detect_action_needed(text: &str) -> Option<ActionNeeded> {
    let window = tail_chars(text, ACTION_WINDOW_CHARS);

    for (kind, regex) in PHRASES.iter() {
        if let Some(m) = regex.find(window) {
            return Some(ActionNeeded {
                kind: *kind,
                confidence: Confidence::High,
                excerpt: m.as_str().trim().to_string(),
            });
        }
    }

    let trimmed = window.trim_end();
    if trimmed.ends_with('?') {
        let last_line = trimmed.lines().last().unwrap_or(trimmed).trim();
        return Some(ActionNeeded {
            kind: ActionKind::Question,
            confidence: Confidence::Low,
            excerpt: last_line.to_string(),
        });
    }

    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn permission_prompt_is_high_confidence() {
        let action = detect_action_needed("Edit src/main.rs\nDo you want to make this edit to main.rs?\n").unwrap();
        assert_eq!(action.kind, ActionKind::Permission);
        assert_eq!(action.confidence, Confidence::High);
        assert!(action.excerpt.starts_with("Do you want to make this edit"));
    }

    #[test]
    fn yes_no_confirmation() {
        let action = detect_action_needed("Delete 3 files? (y/n)").unwrap();
        assert_eq!(action.kind, ActionKind::Confirmation);
        assert_eq!(action.excerpt, "Delete 3 files? (y/n)");
    }

    #[test]
    fn numbered_choice() {
        let action = detect_action_needed("How should I proceed:\n❯ 1. Yes\n  2. No, tell me what to change\n").unwrap();
        assert_eq!(action.kind, ActionKind::Choice);
    }

    #[test]
    fn input_request() {
        let action = detect_action_needed("Please provide the database URL to continue.").unwrap();
        assert_eq!(action.kind, ActionKind::Input);
    }

    #[test]
    fn trailing_question_is_low_confidence() {
        let action = detect_action_needed("I refactored the parser.\nShould the old API stay?  \n").unwrap();
        assert_eq!(action.kind, ActionKind::Question);
        assert_eq!(action.confidence, Confidence::Low);
        assert_eq!(action.excerpt, "Should the old API stay?");
    }

    #[test]
    fn statement_needs_nothing() {
        assert!(detect_action_needed("All 42 tests passed.").is_none());
        assert!(detect_action_needed("").is_none());
    }

    #[test]
    fn only_the_trailing_window_counts() {
        let mut text = String::from("Do you want to proceed?\n");
        text.push_str(&"x".repeat(ACTION_WINDOW_CHARS));
        assert!(detect_action_needed(&text).is_none());
    }
}
