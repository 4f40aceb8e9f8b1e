//! Git worktree isolation for child instances.
//!
//! Each child instance works in its own checkout on its own branch, so
//! concurrent agents never touch the same files.

mod layout;
mod manager;

pub use layout::{WorktreeLayout, repo_name};
pub use manager::{Worktree, WorktreeError, WorktreeManager, WorktreePlan};
