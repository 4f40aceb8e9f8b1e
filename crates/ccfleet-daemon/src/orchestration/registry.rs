//! Instance lifecycle registry.
//!
//! Owns the persisted state of every agent instance: creation under the
//! project's parallelism quota, the status state machine, progress, and
//! termination of parents together with their children. Side effects on
//! worktrees and terminals belong to the instance manager.

use serde::Serialize;
use tracing::{debug, info, warn};

use ccfleet_core::db::unix_timestamp;

use crate::storage::{Database, DatabaseError, InstanceParams, ProjectRow, UnknownVariant};

use super::instance::{Instance, InstanceRole, InstanceStatus, NewInstance};
use super::quota::{ProjectLocks, QuotaGuard};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Project not found: {id}")]
    ProjectNotFound { id: String },

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    #[error("Parent instance not found: {id}")]
    ParentNotFound { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Invalid status transition for instance {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Project {project_id} is at its parallelism limit ({active}/{max} active instances)")]
    QuotaExceeded {
        project_id: String,
        active: i64,
        max: i64,
    },

    #[error("Task already has an active CC instance: task {task_id}, instance {instance_id}")]
    TaskAlreadyActive {
        task_id: String,
        instance_id: String,
    },

    #[error("Worktree path {path} is already used by instance {instance_id}")]
    WorktreePathInUse { path: String, instance_id: String },

    #[error("Instance {id} has {children} active child instance(s); terminate with force to cascade")]
    HasActiveChildren { id: String, children: usize },

    #[error("Instance {id} is still {status}; terminate it before deleting")]
    ActiveInstance { id: String, status: InstanceStatus },

    #[error("Invalid stored data: {0}")]
    InvalidData(#[from] UnknownVariant),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of a terminate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// The instance had already finished; nothing changed.
    AlreadyTerminal { instance: Instance },
    /// The instance and `cascaded` children were moved to `terminated`.
    Terminated {
        instance: Instance,
        cascaded: Vec<String>,
    },
}

impl TerminateOutcome {
    pub const fn instance(&self) -> &Instance {
        match self {
            Self::AlreadyTerminal { instance } | Self::Terminated { instance, .. } => instance,
        }
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Row removed.
    Deleted,
    /// Row kept for its children, marked deleted.
    SoftDeleted,
}

/// Persisted registry of agent instances.
pub struct InstanceRegistry {
    db: Database,
    locks: ProjectLocks,
}

impl InstanceRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: ProjectLocks::new(),
        }
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    /// Register a new instance in `starting`.
    ///
    /// Validation, the quota check, and the insert run under the project's
    /// lock, so concurrent creations at the last free slot admit exactly one.
    pub async fn create_instance(&self, request: NewInstance) -> Result<Instance, RegistryError> {
        let project = self.project(request.project_id()).await?;
        let _guard = self.locks.acquire(&project.id).await;

        let (parent_instance_id, task_id, worktree_path) = match &request {
            NewInstance::Parent { .. } => (None, None, None),
            NewInstance::Child {
                parent_instance_id,
                task_id,
                worktree_path,
                ..
            } => {
                self.validate_child(
                    &project,
                    parent_instance_id,
                    task_id.as_deref(),
                    worktree_path.as_deref(),
                )
                .await?;
                (
                    Some(parent_instance_id.as_str()),
                    task_id.as_deref(),
                    worktree_path.as_deref(),
                )
            }
        };

        self.check_quota(&project).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let kind = match request {
            NewInstance::Parent { .. } => "parent",
            NewInstance::Child { .. } => "child",
        };
        let row = self
            .db
            .create_instance(&InstanceParams {
                id: &id,
                project_id: &project.id,
                instance_type: kind,
                parent_instance_id,
                task_id,
                worktree_path,
            })
            .await?;
        let instance = Instance::try_from(row)?;

        info!(
            instance_id = %instance.id,
            project_id = %project.id,
            role = instance.role.kind(),
            task_id = ?instance.task_id(),
            "Instance created"
        );
        #[cfg(feature = "metrics")]
        ccfleet_core::metrics::record_instance_transition(InstanceStatus::Starting.as_str());

        Ok(instance)
    }

    /// Move an instance along the lifecycle.
    pub async fn update_status(
        &self,
        id: &str,
        next: InstanceStatus,
    ) -> Result<Instance, RegistryError> {
        let current = self.live(id).await?;
        if !current.status.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: next,
            });
        }

        let _guard = self.guard_reentry(&current, next).await?;
        self.db.update_instance_status(id, next.as_str()).await?;

        info!(instance_id = %id, from = %current.status, to = %next, "Instance status changed");
        #[cfg(feature = "metrics")]
        ccfleet_core::metrics::record_instance_transition(next.as_str());

        self.live(id).await
    }

    /// Record progress and derive the status from it: 0 is `starting`, 100
    /// is `completed`, anything else `running`.
    ///
    /// Progress reports are authoritative and bypass the transition table,
    /// but re-entering the active set is still quota-checked.
    pub async fn update_progress(&self, id: &str, percent: i64) -> Result<Instance, RegistryError> {
        if !(0..=100).contains(&percent) {
            return Err(RegistryError::InvalidArgument {
                message: format!("progress must be between 0 and 100, got {percent}"),
            });
        }

        let current = self.live(id).await?;
        let next = match percent {
            0 => InstanceStatus::Starting,
            100 => InstanceStatus::Completed,
            _ => InstanceStatus::Running,
        };

        let _guard = self.guard_reentry(&current, next).await?;
        self.db
            .update_instance_progress(id, percent, next.as_str())
            .await?;

        debug!(instance_id = %id, percent, status = %next, "Instance progress updated");
        if current.status != next {
            #[cfg(feature = "metrics")]
            ccfleet_core::metrics::record_instance_transition(next.as_str());
        }

        self.live(id).await
    }

    /// Terminate an instance. Active children block termination unless
    /// `force` is set, in which case they are terminated first.
    pub async fn terminate(&self, id: &str, force: bool) -> Result<TerminateOutcome, RegistryError> {
        let instance = self.live(id).await?;
        if instance.status.is_terminal() {
            debug!(instance_id = %id, status = %instance.status, "Instance already finished");
            return Ok(TerminateOutcome::AlreadyTerminal { instance });
        }

        let children = self.active_children(id).await?;
        if !children.is_empty() && !force {
            return Err(RegistryError::HasActiveChildren {
                id: id.to_string(),
                children: children.len(),
            });
        }

        let mut cascaded = Vec::with_capacity(children.len());
        for child in children {
            self.db
                .update_instance_status(&child.id, InstanceStatus::Terminated.as_str())
                .await?;
            info!(instance_id = %child.id, parent_instance_id = %id, "Child instance terminated");
            cascaded.push(child.id);
        }

        self.db
            .update_instance_status(id, InstanceStatus::Terminated.as_str())
            .await?;
        info!(instance_id = %id, cascaded = cascaded.len(), "Instance terminated");
        #[cfg(feature = "metrics")]
        ccfleet_core::metrics::record_instance_transition(InstanceStatus::Terminated.as_str());

        Ok(TerminateOutcome::Terminated {
            instance: self.live(id).await?,
            cascaded,
        })
    }

    /// Active instances with no update for `max_idle_minutes`.
    pub async fn find_stale(&self, max_idle_minutes: u64) -> Result<Vec<Instance>, RegistryError> {
        let cutoff = unix_timestamp() - seconds(max_idle_minutes.saturating_mul(60));
        let rows = self.db.find_stale_instances(cutoff).await?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    /// Soft-delete finished instances older than `max_age_hours` and return
    /// them.
    pub async fn cleanup(&self, max_age_hours: u64) -> Result<Vec<Instance>, RegistryError> {
        let cutoff = unix_timestamp() - seconds(max_age_hours.saturating_mul(3600));
        let rows = self.db.soft_delete_finished_instances(cutoff).await?;
        if !rows.is_empty() {
            info!(count = rows.len(), max_age_hours, "Cleaned up finished instances");
        }
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    /// Fetch an instance, including soft-deleted ones.
    pub async fn get(&self, id: &str) -> Result<Instance, RegistryError> {
        let row = self.db.get_instance(id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => RegistryError::InstanceNotFound { id: id.to_string() },
            other => other.into(),
        })?;
        Ok(Instance::try_from(row)?)
    }

    /// Live instances, optionally filtered.
    pub async fn list(
        &self,
        project_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, RegistryError> {
        let rows = self
            .db
            .list_instances(project_id, status.as_ref().map(InstanceStatus::as_str))
            .await?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    /// Live children of an instance.
    pub async fn children(&self, id: &str) -> Result<Vec<Instance>, RegistryError> {
        let rows = self.db.list_child_instances(id).await?;
        rows.into_iter()
            .map(|row| Instance::try_from(row).map_err(Into::into))
            .collect()
    }

    pub async fn set_pid(&self, id: &str, pid: Option<u32>) -> Result<(), RegistryError> {
        self.live(id).await?;
        self.db.set_instance_pid(id, pid.map(i64::from)).await?;
        Ok(())
    }

    /// Record activity so the instance is not reported stale.
    pub async fn touch(&self, id: &str) -> Result<(), RegistryError> {
        self.live(id).await?;
        self.db.touch_instance(id).await?;
        Ok(())
    }

    /// Delete a finished instance. Rows that children still reference are
    /// soft-deleted.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome, RegistryError> {
        let instance = self.get(id).await?;
        if instance.is_active() {
            return Err(RegistryError::ActiveInstance {
                id: id.to_string(),
                status: instance.status,
            });
        }

        if self.db.has_child_rows(id).await? {
            self.db.soft_delete_instance(id).await?;
            info!(instance_id = %id, "Instance soft-deleted");
            Ok(DeleteOutcome::SoftDeleted)
        } else {
            self.db.delete_instance(id).await?;
            info!(instance_id = %id, "Instance deleted");
            Ok(DeleteOutcome::Deleted)
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn project(&self, id: &str) -> Result<ProjectRow, RegistryError> {
        self.db.get_project(id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => RegistryError::ProjectNotFound { id: id.to_string() },
            other => other.into(),
        })
    }

    /// An instance that has not been deleted.
    async fn live(&self, id: &str) -> Result<Instance, RegistryError> {
        let instance = self.get(id).await?;
        if instance.deleted_at.is_some() {
            return Err(RegistryError::InstanceNotFound { id: id.to_string() });
        }
        Ok(instance)
    }

    async fn active_children(&self, id: &str) -> Result<Vec<Instance>, RegistryError> {
        Ok(self
            .children(id)
            .await?
            .into_iter()
            .filter(Instance::is_active)
            .collect())
    }

    async fn validate_child(
        &self,
        project: &ProjectRow,
        parent_instance_id: &str,
        task_id: Option<&str>,
        worktree_path: Option<&str>,
    ) -> Result<(), RegistryError> {
        let parent = match self.live(parent_instance_id).await {
            Ok(parent) => parent,
            Err(RegistryError::InstanceNotFound { .. }) => {
                return Err(RegistryError::ParentNotFound {
                    id: parent_instance_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if parent.role != InstanceRole::Parent {
            return Err(RegistryError::InvalidArgument {
                message: format!("instance {parent_instance_id} is not a parent instance"),
            });
        }
        if parent.project_id != project.id {
            return Err(RegistryError::InvalidArgument {
                message: format!(
                    "parent instance {parent_instance_id} belongs to project {}, not {}",
                    parent.project_id, project.id
                ),
            });
        }

        if let Some(task_id) = task_id {
            let task = self.db.get_task(task_id).await.map_err(|e| match e {
                DatabaseError::NotFound(_) => RegistryError::TaskNotFound {
                    id: task_id.to_string(),
                },
                other => other.into(),
            })?;
            if task.project_id != project.id {
                return Err(RegistryError::InvalidArgument {
                    message: format!(
                        "task {task_id} belongs to project {}, not {}",
                        task.project_id, project.id
                    ),
                });
            }
            if let Some(active) = self.db.find_active_instance_for_task(task_id).await? {
                return Err(RegistryError::TaskAlreadyActive {
                    task_id: task_id.to_string(),
                    instance_id: active.id,
                });
            }
        }

        if let Some(path) = worktree_path
            && let Some(owner) = self.db.find_instance_by_worktree(path).await?
        {
            return Err(RegistryError::WorktreePathInUse {
                path: path.to_string(),
                instance_id: owner.id,
            });
        }

        Ok(())
    }

    async fn check_quota(&self, project: &ProjectRow) -> Result<(), RegistryError> {
        let active = self.db.count_active_instances(&project.id).await?;
        if active >= project.max_parallelism {
            warn!(
                project_id = %project.id,
                active,
                max = project.max_parallelism,
                "Parallelism quota exceeded"
            );
            #[cfg(feature = "metrics")]
            ccfleet_core::metrics::record_quota_rejection(&project.id);
            return Err(RegistryError::QuotaExceeded {
                project_id: project.id.clone(),
                active,
                max: project.max_parallelism,
            });
        }
        Ok(())
    }

    /// Take the project lock and check the quota when a finished instance
    /// is about to become active again.
    async fn guard_reentry(
        &self,
        current: &Instance,
        next: InstanceStatus,
    ) -> Result<Option<QuotaGuard>, RegistryError> {
        if current.status.is_active() || next.is_terminal() {
            return Ok(None);
        }
        let guard = self.locks.acquire(&current.project_id).await;
        let project = self.project(&current.project_id).await?;
        self.check_quota(&project).await?;
        Ok(Some(guard))
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn seconds(secs: u64) -> i64 {
    if secs > i64::MAX as u64 {
        i64::MAX
    } else {
        secs as i64
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::TaskParams;

    async fn registry(max_parallelism: i64) -> InstanceRegistry {
        let db = Database::open_in_memory().await.unwrap();
        db.create_project("p1", "demo", "/repo", max_parallelism)
            .await
            .unwrap();
        db.create_project("p2", "other", "/other", 3).await.unwrap();
        for id in ["t1", "t2", "t3"] {
            db.create_task(&TaskParams::new(id, "p1", id)).await.unwrap();
        }
        InstanceRegistry::new(db)
    }

    fn parent() -> NewInstance {
        NewInstance::Parent {
            project_id: "p1".into(),
        }
    }

    fn child(parent: &str, task: &str) -> NewInstance {
        NewInstance::Child {
            project_id: "p1".into(),
            parent_instance_id: parent.into(),
            task_id: Some(task.into()),
            worktree_path: Some(format!("/wt/{task}")),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    #[tokio::test]
    async fn new_instance_is_starting() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();
        assert_eq!(p.status, InstanceStatus::Starting);
        assert_eq!(p.progress, 0);
        assert_eq!(p.role, InstanceRole::Parent);
    }

    #[tokio::test]
    async fn unknown_project_and_parent() {
        let reg = registry(3).await;
        assert!(matches!(
            reg.create_instance(NewInstance::Parent {
                project_id: "nope".into()
            })
            .await,
            Err(RegistryError::ProjectNotFound { .. })
        ));
        assert!(matches!(
            reg.create_instance(child("ghost", "t1")).await,
            Err(RegistryError::ParentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn child_cannot_parent_a_child() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        let c = reg.create_instance(child(&p.id, "t1")).await.unwrap();
        assert!(matches!(
            reg.create_instance(child(&c.id, "t2")).await,
            Err(RegistryError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn parent_from_other_project_is_rejected() {
        let reg = registry(5).await;
        let other = reg
            .create_instance(NewInstance::Parent {
                project_id: "p2".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reg.create_instance(child(&other.id, "t1")).await,
            Err(RegistryError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn task_with_active_instance_is_rejected() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        let first = reg.create_instance(child(&p.id, "t1")).await.unwrap();

        let request = NewInstance::Child {
            project_id: "p1".into(),
            parent_instance_id: p.id.clone(),
            task_id: Some("t1".into()),
            worktree_path: Some("/wt/other".into()),
        };
        match reg.create_instance(request).await {
            Err(err @ RegistryError::TaskAlreadyActive { .. }) => {
                let msg = err.to_string();
                assert!(msg.contains("Task already has an active CC instance"));
                assert!(msg.contains("t1"));
                assert!(msg.contains(&first.id));
            }
            other => panic!("Expected TaskAlreadyActive, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        assert!(matches!(
            reg.create_instance(child(&p.id, "missing")).await,
            Err(RegistryError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn worktree_path_is_exclusive_until_cleanup() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        let first = reg.create_instance(child(&p.id, "t1")).await.unwrap();

        let reuse = NewInstance::Child {
            project_id: "p1".into(),
            parent_instance_id: p.id.clone(),
            task_id: Some("t2".into()),
            worktree_path: Some("/wt/t1".into()),
        };
        assert!(matches!(
            reg.create_instance(reuse.clone()).await,
            Err(RegistryError::WorktreePathInUse { .. })
        ));

        reg.terminate(&first.id, false).await.unwrap();
        // Terminated but not yet cleaned up: still claimed.
        assert!(reg.create_instance(reuse.clone()).await.is_err());

        sqlx::query("UPDATE cc_instances SET finished_at = finished_at - 7200 WHERE id = ?")
            .bind(&first.id)
            .execute(reg.db().pool())
            .await
            .unwrap();
        assert_eq!(reg.cleanup(1).await.unwrap().len(), 1);
        assert!(reg.create_instance(reuse).await.is_ok());
    }

    // =========================================================================
    // Quota
    // =========================================================================

    #[tokio::test]
    async fn quota_rejects_third_instance() {
        let reg = registry(2).await;
        reg.create_instance(parent()).await.unwrap();
        reg.create_instance(parent()).await.unwrap();
        match reg.create_instance(parent()).await {
            Err(RegistryError::QuotaExceeded {
                project_id,
                active,
                max,
            }) => {
                assert_eq!(project_id, "p1");
                assert_eq!((active, max), (2, 2));
            }
            other => panic!("Expected QuotaExceeded, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_instances_free_their_slot() {
        let reg = registry(1).await;
        let p = reg.create_instance(parent()).await.unwrap();
        reg.update_status(&p.id, InstanceStatus::Failed).await.unwrap();
        reg.create_instance(parent()).await.unwrap();

        // Retrying the failed one would exceed the quota.
        assert!(matches!(
            reg.update_status(&p.id, InstanceStatus::Starting).await,
            Err(RegistryError::QuotaExceeded { .. })
        ));
        assert_eq!(reg.get(&p.id).await.unwrap().status, InstanceStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_respects_quota() {
        let reg = Arc::new(registry(3).await);
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let reg = Arc::clone(&reg);
            tasks.push(tokio::spawn(async move { reg.create_instance(parent()).await }));
        }

        let mut created = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(RegistryError::QuotaExceeded { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((created, rejected), (3, 7));
        assert_eq!(reg.db().count_active_instances("p1").await.unwrap(), 3);
    }

    // =========================================================================
    // Status and progress
    // =========================================================================

    #[tokio::test]
    async fn valid_transitions_stamp_timestamps() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();

        let running = reg.update_status(&p.id, InstanceStatus::Running).await.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        let done = reg.update_status(&p.id, InstanceStatus::Completed).await.unwrap();
        assert_eq!(done.progress, 100);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_leaves_instance_unchanged() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();

        match reg.update_status(&p.id, InstanceStatus::Completed).await {
            Err(RegistryError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, InstanceStatus::Starting);
                assert_eq!(to, InstanceStatus::Completed);
            }
            other => panic!("Expected InvalidTransition, got: {other:?}"),
        }
        assert_eq!(reg.get(&p.id).await.unwrap(), p);
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let reg = registry(3).await;
        assert!(matches!(
            reg.update_status("nope", InstanceStatus::Running).await,
            Err(RegistryError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn progress_drives_status() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();

        let mid = reg.update_progress(&p.id, 40).await.unwrap();
        assert_eq!((mid.status, mid.progress), (InstanceStatus::Running, 40));

        let done = reg.update_progress(&p.id, 100).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(done.finished_at.is_some());

        let restarted = reg.update_progress(&p.id, 0).await.unwrap();
        assert_eq!(restarted.status, InstanceStatus::Starting);
        assert!(restarted.finished_at.is_none());

        assert!(matches!(
            reg.update_progress(&p.id, 101).await,
            Err(RegistryError::InvalidArgument { .. })
        ));
        assert!(matches!(
            reg.update_progress(&p.id, -1).await,
            Err(RegistryError::InvalidArgument { .. })
        ));
    }

    // =========================================================================
    // Termination and maintenance
    // =========================================================================

    #[tokio::test]
    async fn terminate_requires_force_with_active_children() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        let c1 = reg.create_instance(child(&p.id, "t1")).await.unwrap();
        let c2 = reg.create_instance(child(&p.id, "t2")).await.unwrap();
        reg.update_status(&c2.id, InstanceStatus::Failed).await.unwrap();

        assert!(matches!(
            reg.terminate(&p.id, false).await,
            Err(RegistryError::HasActiveChildren { children: 1, .. })
        ));

        match reg.terminate(&p.id, true).await.unwrap() {
            TerminateOutcome::Terminated { instance, cascaded } => {
                assert_eq!(instance.status, InstanceStatus::Terminated);
                assert_eq!(cascaded, vec![c1.id.clone()]);
            }
            other => panic!("Expected Terminated, got: {other:?}"),
        }
        assert_eq!(
            reg.get(&c1.id).await.unwrap().status,
            InstanceStatus::Terminated
        );
        assert_eq!(reg.get(&c2.id).await.unwrap().status, InstanceStatus::Failed);

        assert!(matches!(
            reg.terminate(&p.id, false).await.unwrap(),
            TerminateOutcome::AlreadyTerminal { .. }
        ));
    }

    #[tokio::test]
    async fn stale_instances_are_reported() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();
        assert!(reg.find_stale(30).await.unwrap().is_empty());

        sqlx::query("UPDATE cc_instances SET updated_at = updated_at - 3600 WHERE id = ?")
            .bind(&p.id)
            .execute(reg.db().pool())
            .await
            .unwrap();
        let stale = reg.find_stale(30).await.unwrap();
        assert_eq!(stale.len(), 1);

        reg.touch(&p.id).await.unwrap();
        assert!(reg.find_stale(30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();
        reg.terminate(&p.id, false).await.unwrap();

        assert!(reg.cleanup(24).await.unwrap().is_empty());
        sqlx::query("UPDATE cc_instances SET finished_at = finished_at - 90000 WHERE id = ?")
            .bind(&p.id)
            .execute(reg.db().pool())
            .await
            .unwrap();

        let removed = reg.cleanup(24).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(reg.cleanup(24).await.unwrap().is_empty());
        assert!(reg.list(Some("p1"), None).await.unwrap().is_empty());
        assert!(reg.get(&p.id).await.unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn delete_keeps_rows_children_reference() {
        let reg = registry(5).await;
        let p = reg.create_instance(parent()).await.unwrap();
        let c = reg.create_instance(child(&p.id, "t1")).await.unwrap();

        assert!(matches!(
            reg.delete(&p.id).await,
            Err(RegistryError::ActiveInstance { .. })
        ));

        reg.terminate(&p.id, true).await.unwrap();
        assert_eq!(reg.delete(&c.id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(reg.delete(&p.id).await.unwrap(), DeleteOutcome::Deleted);

        let p2 = reg.create_instance(parent()).await.unwrap();
        let c2 = reg.create_instance(child(&p2.id, "t2")).await.unwrap();
        reg.terminate(&p2.id, true).await.unwrap();
        assert_eq!(reg.delete(&p2.id).await.unwrap(), DeleteOutcome::SoftDeleted);
        assert!(reg.get(&c2.id).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let reg = registry(5).await;
        let a = reg.create_instance(parent()).await.unwrap();
        reg.create_instance(parent()).await.unwrap();
        reg.update_status(&a.id, InstanceStatus::Running).await.unwrap();

        let running = reg
            .list(Some("p1"), Some(InstanceStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
        assert_eq!(reg.list(None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pid_is_recorded() {
        let reg = registry(3).await;
        let p = reg.create_instance(parent()).await.unwrap();
        reg.set_pid(&p.id, Some(1234)).await.unwrap();
        assert_eq!(reg.get(&p.id).await.unwrap().pid, Some(1234));
    }
}
