//! Per-session output monitoring.
//!
//! Turns a terminal byte stream into agent state transitions and a
//! "response complete" signal once the agent goes quiet.

mod analyzer;

pub use analyzer::{MonitorConfig, MonitorEvent, OutputAnalyzer, StateChange};
