//! ccfleet Daemon Library
//!
//! Core functionality for the ccfleet daemon:
//! - Instance registry with per-project parallelism quotas
//! - Task dependency analysis and phase scheduling
//! - Git worktree isolation for child instances
//! - PTY terminal multiplexing and agent output monitoring
//! - SQLite storage for projects, tasks, instances, and phases
//! - HTTP/WebSocket server for operator clients

pub mod monitor;
pub mod orchestration;
pub mod server;
pub mod storage;
pub mod terminal;
pub mod worktree;
