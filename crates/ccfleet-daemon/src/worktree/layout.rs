//! Worktree placement on disk.

use std::path::{Path, PathBuf};

use ccfleet_core::config::{WorktreeLayoutKind, WorktreeSettings};

/// Where checkouts for a repository are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeLayout {
    /// Shared base directory: `<base>/<repo_name>/<name>/`
    Global(PathBuf),
    /// Inside the repository: `<repo>/<subfolder>/<name>/`
    Local(PathBuf),
}

impl WorktreeLayout {
    /// Build a layout from configuration. `default_base` is used in global
    /// mode when no base directory is configured.
    pub fn from_settings(settings: &WorktreeSettings, default_base: &Path) -> Self {
        match settings.layout {
            WorktreeLayoutKind::Global => Self::Global(
                settings
                    .base_dir
                    .clone()
                    .unwrap_or_else(|| default_base.to_path_buf()),
            ),
            WorktreeLayoutKind::Local => Self::Local(settings.local_subfolder.clone()),
        }
    }

    /// Directory under which all checkouts of `repo` are placed.
    pub fn checkout_root(&self, repo: &Path) -> PathBuf {
        match self {
            Self::Global(base) => base.join(repo_name(repo)),
            Self::Local(subfolder) => repo.join(subfolder),
        }
    }
}

/// Last path component of a repository. Falls back to "unknown" for `/`.
pub fn repo_name(repo: &Path) -> &str {
    repo.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
}
