//! Terminal session multiplexing over pseudo-terminals.
//!
//! Each remote connection owns at most one PTY-backed process. Output is
//! broadcast to subscribers and fed to an optional output analyzer.

mod multiplexer;
mod session;
mod types;

pub use multiplexer::TerminalMultiplexer;
pub use types::{
    CommandSpec, MultiplexerConfig, MultiplexerStats, SessionHandle, SessionSpec, TerminalError,
    TerminalEvent, WriteOutcome, default_shell,
};
