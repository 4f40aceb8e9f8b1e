//! Worktree manager: git worktree creation and removal.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::layout::WorktreeLayout;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("Worktree path already exists: {0}")]
    PathExists(String),

    #[error("Refusing to remove {path}: it is the base repository or one of its ancestors")]
    ProtectedPath { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Setup script failed: {0}")]
    SetupFailed(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// A checkout that has been planned but not yet created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreePlan {
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
    pub repo_path: PathBuf,
}

/// A checkout that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub repo_path: PathBuf,
}

/// Validate a worktree/branch name: alphanumeric, hyphens, underscores, slashes, dots.
/// Rejects path traversal (`..`), leading dashes, and control characters.
fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.is_empty() {
        return Err(WorktreeError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(WorktreeError::InvalidName(
            "name cannot start with a dash".into(),
        ));
    }
    if name.contains("..") {
        return Err(WorktreeError::InvalidName(
            "name cannot contain '..'".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorktreeError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Up to eight alphanumeric characters of a task id, lowercased.
fn task_slug(task_id: &str) -> String {
    let slug: String = task_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    if slug.is_empty() { "x".to_string() } else { slug }
}

/// Creates and removes isolated checkouts for child instances.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    layout: WorktreeLayout,
    setup_script: Option<String>,
}

impl WorktreeManager {
    /// Create a new worktree manager.
    ///
    /// `setup_script` is executed as a shell command inside every new
    /// checkout and must come from trusted configuration.
    pub const fn new(layout: WorktreeLayout, setup_script: Option<String>) -> Self {
        Self {
            layout,
            setup_script,
        }
    }

    pub const fn layout(&self) -> &WorktreeLayout {
        &self.layout
    }

    /// Derive a unique checkout name, branch, and path for a task.
    pub fn plan(&self, repo_path: &Path, task_id: &str) -> Result<WorktreePlan, WorktreeError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("task-{}-{}", task_slug(task_id), &suffix[..8]);
        let branch = format!("ccfleet/{name}");
        validate_name(&name)?;
        validate_name(&branch)?;

        let path = self.layout.checkout_root(repo_path).join(&name);
        debug!(name, branch, path = %path.display(), "Planned worktree");

        Ok(WorktreePlan {
            name,
            branch,
            path,
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Create the planned checkout with `git worktree add -b`.
    ///
    /// The planned directory is removed again if git or the setup script
    /// fails. Git's stderr is surfaced unchanged.
    pub async fn create(&self, plan: &WorktreePlan) -> Result<Worktree, WorktreeError> {
        let repo_path = plan.repo_path.as_path();
        if !repo_path.exists() {
            return Err(WorktreeError::NotFound(format!(
                "Repository not found at {}",
                repo_path.display()
            )));
        }

        let check = tokio::process::Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(repo_path)
            .output()
            .await?;
        if !check.status.success() {
            return Err(WorktreeError::NotARepository(
                repo_path.display().to_string(),
            ));
        }

        if plan.path.exists() {
            return Err(WorktreeError::PathExists(plan.path.display().to_string()));
        }
        if let Some(parent) = plan.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let start = std::time::Instant::now();
        let output = tokio::process::Command::new("git")
            .args(["worktree", "add", "-b", &plan.branch])
            .arg(&plan.path)
            .current_dir(repo_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                elapsed_ms = start.elapsed().as_millis(),
                status = %output.status,
                "git worktree add failed"
            );
            if plan.path.exists()
                && let Err(e) = tokio::fs::remove_dir_all(&plan.path).await
            {
                warn!(path = %plan.path.display(), error = %e, "Failed to clean up worktree directory");
            }
            return Err(WorktreeError::Git(stderr.trim().to_string()));
        }

        info!(
            name = %plan.name,
            path = %plan.path.display(),
            branch = %plan.branch,
            elapsed_ms = start.elapsed().as_millis(),
            "Created git worktree"
        );

        if let Some(script) = &self.setup_script
            && let Err(e) = self.run_setup_script(&plan.path, script).await
        {
            warn!(path = %plan.path.display(), error = %e, "Setup script failed, cleaning up worktree");
            if let Err(cleanup) = self.remove(repo_path, &plan.path).await {
                warn!(error = %cleanup, "Worktree cleanup after setup failure failed");
            }
            return Err(e);
        }

        Ok(Worktree {
            name: plan.name.clone(),
            path: plan.path.clone(),
            branch: plan.branch.clone(),
            repo_path: plan.repo_path.clone(),
        })
    }

    /// Remove a checkout. Returns `false` if the path was already gone.
    ///
    /// The branch is left in place.
    pub async fn remove(&self, repo_path: &Path, path: &Path) -> Result<bool, WorktreeError> {
        if !path.exists() {
            self.prune(repo_path).await;
            return Ok(false);
        }

        let target = tokio::fs::canonicalize(path).await?;
        let repo = tokio::fs::canonicalize(repo_path)
            .await
            .unwrap_or_else(|_| repo_path.to_path_buf());
        if repo.starts_with(&target) {
            return Err(WorktreeError::ProtectedPath {
                path: path.display().to_string(),
            });
        }

        let output = tokio::process::Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&target)
            .current_dir(repo_path)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                info!(path = %path.display(), "Removed git worktree");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(path = %path.display(), error = %stderr.trim(), "git worktree remove failed, deleting directory");
                tokio::fs::remove_dir_all(&target).await?;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "git unavailable, deleting directory");
                tokio::fs::remove_dir_all(&target).await?;
            }
        }

        self.prune(repo_path).await;
        Ok(true)
    }

    /// Drop metadata of worktrees whose directories are gone.
    async fn prune(&self, repo_path: &Path) {
        if !repo_path.exists() {
            return;
        }
        match tokio::process::Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(repo_path)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!(repo = %repo_path.display(), error = %stderr.trim(), "git worktree prune failed");
            }
            Err(e) => debug!(repo = %repo_path.display(), error = %e, "git worktree prune failed"),
        }
    }

    /// Run the setup script in a worktree directory.
    async fn run_setup_script(&self, path: &Path, script: &str) -> Result<(), WorktreeError> {
        info!(path = %path.display(), script, "Running worktree setup script");

        let shell = if cfg!(windows) { "cmd" } else { "sh" };
        let flag = if cfg!(windows) { "/C" } else { "-c" };

        let output = tokio::process::Command::new(shell)
            .args([flag, script])
            .current_dir(path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::SetupFailed(format!(
                "Setup script '{}' failed: {}",
                script,
                stderr.trim()
            )));
        }

        info!(path = %path.display(), "Setup script completed");
        Ok(())
    }
}
