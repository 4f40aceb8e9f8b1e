//! Streaming state machine over one session's terminal output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ccfleet_core::classify::{
    ACTION_WINDOW_CHARS, ActionNeeded, AgentState, OutputCategory, RuleSet, detect_action_needed,
    strip_ansi, tail_chars,
};
use ccfleet_core::config::MonitorSettings;
use ccfleet_core::db::unix_timestamp_millis;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Analyzer timing and retention.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the idle check runs.
    pub check_interval: Duration,
    /// Silence after which a response counts as finished.
    pub idle_threshold: Duration,
    /// Characters of cleaned output retained.
    pub buffer_chars: usize,
    /// State changes retained.
    pub history_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            check_interval: Duration::from_millis(settings.check_interval_ms.max(1)),
            idle_threshold: Duration::from_millis(settings.idle_threshold_ms),
            buffer_chars: settings.buffer_chars.max(1),
            history_limit: settings.history_limit.max(1),
        }
    }
}

/// One transition of the inferred agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub previous: AgentState,
    pub current: AgentState,
    /// Unix epoch milliseconds.
    pub at_ms: i64,
}

/// Events raised by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    StateChanged(StateChange),
    /// The agent entered `WaitingInput`.
    WaitingForInput { context: String },
    /// The agent went quiet after responding.
    ResponseComplete {
        action_needed: Option<ActionNeeded>,
        context: String,
    },
}

struct AnalyzerState {
    current: AgentState,
    buffer: String,
    history: VecDeque<StateChange>,
    /// Last plain or prompt chunk.
    last_content: Instant,
}

impl AnalyzerState {
    fn append(&mut self, text: &str, limit: usize) {
        self.buffer.push_str(text);
        let keep = tail_chars(&self.buffer, limit).len();
        let cut = self.buffer.len() - keep;
        if cut > 0 {
            self.buffer.drain(..cut);
        }
    }

    fn transition(&mut self, next: AgentState, history_limit: usize) -> StateChange {
        let change = StateChange {
            previous: self.current,
            current: next,
            at_ms: unix_timestamp_millis(),
        };
        self.current = next;
        if self.history.len() == history_limit {
            self.history.pop_front();
        }
        self.history.push_back(change);
        change
    }

    fn context(&self) -> String {
        tail_chars(&self.buffer, ACTION_WINDOW_CHARS).to_string()
    }
}

struct Inner {
    rules: Arc<RuleSet>,
    config: MonitorConfig,
    state: Mutex<AnalyzerState>,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, AnalyzerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<MonitorEvent>) {
        for event in events {
            // Receiver gone means nobody is watching this session any more.
            let _ = self.events.send(event);
        }
    }

    fn feed(&self, chunk: &str) {
        let clean = strip_ansi(chunk);
        if clean.trim().is_empty() {
            return;
        }
        let classification = self.rules.classify(&clean);
        trace!(category = ?classification.category, rule = ?classification.rule_id, "Classified output");

        let mut events = Vec::new();
        {
            let mut state = self.lock();
            state.append(&clean, self.config.buffer_chars);
            if matches!(
                classification.category,
                OutputCategory::Plain | OutputCategory::Prompt
            ) {
                state.last_content = Instant::now();
            }

            if let Some(next) = classification.category.candidate_state()
                && next != state.current
            {
                let change = state.transition(next, self.config.history_limit);
                debug!(previous = %change.previous, current = %change.current, "Agent state changed");
                events.push(MonitorEvent::StateChanged(change));
                if next == AgentState::WaitingInput {
                    events.push(MonitorEvent::WaitingForInput {
                        context: state.context(),
                    });
                }
            }
        }
        self.emit(events);
    }

    fn check_idle(&self) -> bool {
        let events = {
            let mut state = self.lock();
            if state.current != AgentState::Responding
                || state.last_content.elapsed() < self.config.idle_threshold
            {
                return false;
            }
            let change = state.transition(AgentState::Idle, self.config.history_limit);
            let action_needed = detect_action_needed(&state.buffer);
            debug!(action = ?action_needed.as_ref().map(|a| a.kind), "Response complete");
            vec![
                MonitorEvent::StateChanged(change),
                MonitorEvent::ResponseComplete {
                    action_needed,
                    context: state.context(),
                },
            ]
        };
        self.emit(events);
        true
    }
}

/// Classifies a session's output and tracks the agent's state.
///
/// The idle timer only runs between [`start`](Self::start) and
/// [`stop`](Self::stop); dropping the analyzer stops it.
pub struct OutputAnalyzer {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OutputAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputAnalyzer")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl OutputAnalyzer {
    /// Create an analyzer in `Idle` and the receiver for its events.
    pub fn new(
        rules: Arc<RuleSet>,
        config: MonitorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            rules,
            config,
            state: Mutex::new(AnalyzerState {
                current: AgentState::Idle,
                buffer: String::new(),
                history: VecDeque::new(),
                last_content: Instant::now(),
            }),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
                ticker: Mutex::new(None),
            },
            rx,
        )
    }

    /// Process one chunk of terminal output. Chunks that are empty once
    /// escape sequences are removed are ignored.
    pub fn feed(&self, chunk: &str) {
        self.inner.feed(chunk);
    }

    /// Run the idle check once. Returns `true` if a response completed.
    pub fn check_idle(&self) -> bool {
        self.inner.check_idle()
    }

    /// Start the periodic idle check. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let period = inner.config.check_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await; // Skip first immediate tick
            loop {
                timer.tick().await;
                inner.check_idle();
            }
        }));
    }

    /// Cancel the idle check.
    pub fn stop(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().current
    }

    /// Retained state changes, oldest first.
    pub fn state_history(&self) -> Vec<StateChange> {
        self.inner.lock().history.iter().copied().collect()
    }

    /// The last `n` characters of cleaned output.
    pub fn last_output(&self, n: usize) -> String {
        tail_chars(&self.inner.lock().buffer, n).to_string()
    }
}

impl Drop for OutputAnalyzer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use ccfleet_core::classify::ActionKind;

    const THINKING: &str = "\x1b[2m✻ Pondering… (3s · ↑ 120 tokens · esc to interrupt)\x1b[0m";
    const PLAIN: &str = "Here is the refactored parser.\n";

    fn analyzer() -> (OutputAnalyzer, mpsc::UnboundedReceiver<MonitorEvent>) {
        OutputAnalyzer::new(Arc::new(RuleSet::builtin()), MonitorConfig::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[MonitorEvent]) -> Vec<(AgentState, AgentState)> {
        events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::StateChanged(c) => Some((c.previous, c.current)),
                _ => None,
            })
            .collect()
    }

    fn completions(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::ResponseComplete { .. }))
            .count()
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[tokio::test]
    async fn thinking_then_plain() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed(THINKING);
        analyzer.feed(PLAIN);

        assert_eq!(analyzer.state(), AgentState::Responding);
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                (AgentState::Idle, AgentState::Thinking),
                (AgentState::Thinking, AgentState::Responding),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_category_emits_once() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed(THINKING);
        analyzer.feed(THINKING);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn error_keeps_state() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed(PLAIN);
        drain(&mut rx);

        analyzer.feed("Error: connection refused\n");
        assert_eq!(analyzer.state(), AgentState::Responding);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn prompt_emits_waiting_for_input() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed("Done.\n> ");

        assert_eq!(analyzer.state(), AgentState::WaitingInput);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            MonitorEvent::WaitingForInput { context } => assert!(context.contains("Done.")),
            other => panic!("Expected WaitingForInput, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn escape_only_chunks_are_ignored() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed("\x1b[2K\x1b[1G");
        analyzer.feed("  \r\n");

        assert_eq!(analyzer.state(), AgentState::Idle);
        assert!(analyzer.last_output(100).is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn buffer_and_history_are_bounded() {
        let config = MonitorConfig {
            buffer_chars: 16,
            history_limit: 2,
            ..MonitorConfig::default()
        };
        let (analyzer, _rx) = OutputAnalyzer::new(Arc::new(RuleSet::builtin()), config);

        analyzer.feed(&"é".repeat(100));
        assert_eq!(analyzer.last_output(1000).chars().count(), 16);
        assert_eq!(analyzer.last_output(3), "ééé");

        analyzer.feed(THINKING);
        analyzer.feed(PLAIN);
        let history = analyzer.state_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].current, AgentState::Responding);
    }

    // =========================================================================
    // Idle detection
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn response_completes_after_threshold_not_before() {
        let (analyzer, mut rx) = analyzer();
        analyzer.start();
        analyzer.feed(THINKING);
        analyzer.feed(PLAIN);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        let early = drain(&mut rx);
        assert_eq!(completions(&early), 0);
        assert_eq!(analyzer.state(), AgentState::Responding);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let late = drain(&mut rx);
        assert_eq!(completions(&late), 1);
        assert_eq!(analyzer.state(), AgentState::Idle);

        let mut all = early;
        all.extend(late);
        assert_eq!(
            states(&all),
            vec![
                (AgentState::Idle, AgentState::Thinking),
                (AgentState::Thinking, AgentState::Responding),
                (AgentState::Responding, AgentState::Idle),
            ]
        );

        // Further silence does not repeat the event.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(completions(&drain(&mut rx)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_carries_action_needed() {
        let (analyzer, mut rx) = analyzer();
        analyzer.feed("I updated the parser.\nShould I also update the docs?");
        drain(&mut rx);

        assert!(!analyzer.check_idle());
        tokio::time::advance(Duration::from_millis(3001)).await;
        assert!(analyzer.check_idle());

        let events = drain(&mut rx);
        match events.last() {
            Some(MonitorEvent::ResponseComplete {
                action_needed: Some(action),
                context,
            }) => {
                assert_eq!(action.kind, ActionKind::Question);
                assert!(context.ends_with("docs?"));
            }
            other => panic!("Expected ResponseComplete, got: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn thinking_is_never_forced_idle() {
        let (analyzer, _rx) = analyzer();
        analyzer.feed(THINKING);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!analyzer.check_idle());
        assert_eq!(analyzer.state(), AgentState::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_idle_timer() {
        let (analyzer, mut rx) = analyzer();
        analyzer.start();
        assert!(analyzer.is_running());
        analyzer.feed(PLAIN);
        analyzer.stop();
        assert!(!analyzer.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(completions(&drain(&mut rx)), 0);
        assert_eq!(analyzer.state(), AgentState::Responding);
    }
}
