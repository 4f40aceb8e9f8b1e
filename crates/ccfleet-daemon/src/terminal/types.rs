//! Terminal multiplexer types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::monitor::OutputAnalyzer;

/// Configuration for the terminal multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Program run when a session names no command.
    pub shell: String,
    /// Event broadcast channel capacity per session.
    pub broadcast_capacity: usize,
    /// Time between SIGTERM and a forced kill.
    pub terminate_grace: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            broadcast_capacity: 1024,
            terminate_grace: Duration::from_secs(5),
        }
    }
}

/// The user's login shell, falling back to the platform default.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if cfg!(windows) {
                "cmd.exe".to_string()
            } else {
                "/bin/sh".to_string()
            }
        })
}

/// An explicit program to run instead of the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// What to spawn for a new session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub working_directory: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// `None` runs the configured shell.
    pub command: Option<CommandSpec>,
    /// Receives the session's output as text.
    pub analyzer: Option<Arc<OutputAnalyzer>>,
}

impl SessionSpec {
    /// An 80x24 shell session in `working_directory`.
    pub fn shell(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            cols: 80,
            rows: 24,
            env: Vec::new(),
            command: None,
            analyzer: None,
        }
    }

    #[must_use]
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(CommandSpec {
            program: program.into(),
            args,
        });
        self
    }

    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<OutputAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    #[must_use]
    pub const fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Events published by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Raw bytes read from the PTY.
    Output(Vec<u8>),
    /// The process exited. Always the last event of a session.
    Exited {
        code: Option<u32>,
        signal: Option<String>,
    },
}

/// Returned once a session's process is running.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub pid: Option<u32>,
    pub events: broadcast::Receiver<TerminalEvent>,
}

/// Result of writing to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered,
    /// The session is gone or its process has exited.
    Dropped,
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    /// Number of live sessions.
    pub session_count: usize,
    /// Number of connections owning a session.
    pub connection_count: usize,
}

/// Terminal multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Failed to spawn terminal process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Terminal session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("PTY error: {0}")]
    Pty(String),
}
