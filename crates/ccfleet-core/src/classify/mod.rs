//! Output classification for coding-agent terminals.
//!
//! Terminal output is unstructured ANSI text. Each cleaned chunk is matched
//! against an ordered rule list (first match wins) and mapped to an
//! [`OutputCategory`], which in turn suggests an [`AgentState`]. Rules are
//! plain data so deployments can prepend their own patterns when the agent's
//! output format drifts.
//!
//! The stateful analyzer that consumes these classifications lives in the
//! daemon; this module is pure and synchronous.

mod action;
mod ansi;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use action::{ACTION_WINDOW_CHARS, ActionKind, ActionNeeded, Confidence, detect_action_needed};
pub use ansi::strip_ansi;

/// Kind of content a chunk of output carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputCategory {
    /// Spinner or status line shown while the model reasons.
    Thinking,
    /// Input prompt awaiting the operator.
    Prompt,
    /// Tool invocation marker.
    ToolUse,
    /// Error report; never changes the inferred state.
    Error,
    /// Anything else: response text.
    Plain,
}

impl OutputCategory {
    /// State this category moves the agent into, if any.
    pub const fn candidate_state(self) -> Option<AgentState> {
        match self {
            Self::Thinking => Some(AgentState::Thinking),
            Self::Prompt => Some(AgentState::WaitingInput),
            Self::ToolUse => Some(AgentState::ExecutingTool),
            Self::Plain => Some(AgentState::Responding),
            Self::Error => None,
        }
    }
}

/// Inferred activity of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Responding,
    WaitingInput,
    ExecutingTool,
}

impl AgentState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Responding => "responding",
            Self::WaitingInput => "waiting_input",
            Self::ExecutingTool => "executing_tool",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classification rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    /// Rule identifier, reported with every match.
    pub id: String,
    /// Regular expression matched against ANSI-stripped text.
    pub pattern: String,
    /// Category assigned on match.
    pub category: OutputCategory,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    regex: Regex,
    category: OutputCategory,
}

impl CompiledRule {
    fn compile(rule: &ClassifierRule) -> Result<Self> {
        let regex = Regex::new(&rule.pattern).map_err(|e| Error::InvalidRule {
            id: rule.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: rule.id.clone(),
            regex,
            category: rule.category,
        })
    }
}

/// Result of classifying one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: OutputCategory,
    /// Id of the matching rule; `None` for the plain fallback.
    pub rule_id: Option<String>,
}

/// Built-in rules, in evaluation order.
pub fn builtin_rules() -> Vec<ClassifierRule> {
    let rule = |id: &str, pattern: &str, category| ClassifierRule {
        id: id.to_string(),
        pattern: pattern.to_string(),
        category,
    };
    vec![
        // "✻ Pondering… (12s · ↑ 1.2k tokens · esc to interrupt)"
        rule(
            "thinking-status",
            r"(?i)\(\s*(?:\d+m\s*)?\d+s\s*·[^)]*tokens",
            OutputCategory::Thinking,
        ),
        rule("thinking-interrupt", r"(?i)esc to interrupt", OutputCategory::Thinking),
        rule(
            "thinking-spinner",
            r"(?m)^\s*[✻✽✶✳✢*]\s*\p{L}+(?:…|\.\.\.)\s*$",
            OutputCategory::Thinking,
        ),
        rule(
            "tool-call",
            r"(?m)^\s*⏺\s*(?:Bash|Read|Write|Edit|MultiEdit|Glob|Grep|LS|WebFetch|WebSearch|Task|TodoWrite|NotebookEdit)\(",
            OutputCategory::ToolUse,
        ),
        rule("tool-fence", r"(?i)</?tool_use>|```tool", OutputCategory::ToolUse),
        rule(
            "error-line",
            r"(?im)^\s*(?:error|fatal|panic)(?:\[[^\]]*\])?:",
            OutputCategory::Error,
        ),
        rule("api-error", r"(?i)\bapi error\b", OutputCategory::Error),
        rule(
            "input-box",
            r"(?s)│\s*>\s.*╰─+╯\s*\z",
            OutputCategory::Prompt,
        ),
        rule(
            "bare-prompt",
            r"(?m)^[ \t]*[>❯›][ \t]*\s*\z",
            OutputCategory::Prompt,
        ),
        rule(
            "yes-no",
            r"(?i)(?:\((?:y/n|yes/no)\)|\[y/n\])\s*\z",
            OutputCategory::Prompt,
        ),
    ]
}

#[allow(clippy::expect_used)]
static BUILTIN: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    builtin_rules()
        .iter()
        .map(|r| CompiledRule::compile(r).expect("builtin classifier rule is valid"))
        .collect()
});

/// Ordered, first-match-wins rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleSet {
    /// The built-in rules only.
    pub fn builtin() -> Self {
        Self {
            rules: BUILTIN.clone(),
        }
    }

    /// Custom rules evaluated before the built-in ones.
    pub fn with_custom(custom: &[ClassifierRule]) -> Result<Self> {
        let mut rules = custom
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        rules.extend(BUILTIN.iter().cloned());
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify already-cleaned text.
    pub fn classify(&self, text: &str) -> Classification {
        self.rules
            .iter()
            .find(|r| r.regex.is_match(text))
            .map_or(
                Classification {
                    category: OutputCategory::Plain,
                    rule_id: None,
                },
                |r| Classification {
                    category: r.category,
                    rule_id: Some(r.id.clone()),
                },
            )
    }
}

/// The last `n` characters of `text`, respecting char boundaries.
pub fn tail_chars(text: &str, n: usize) -> &str {
    let total = text.chars().count();
    if total <= n {
        return text;
    }
    text.char_indices()
        .nth(total - n)
        .map_or(text, |(idx, _)| &text[idx..])
}
