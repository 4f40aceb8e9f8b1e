//! ccfleet Core Library
//!
//! Shared functionality for ccfleet components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Terminal output classification for coding agents
//! - Tracing and optional `OpenTelemetry` initialisation
//! - Common error types

pub mod classify;
pub mod config;
pub mod db;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use classify::{AgentState, OutputCategory, RuleSet};
pub use config::Config;
pub use error::{Error, Result};
