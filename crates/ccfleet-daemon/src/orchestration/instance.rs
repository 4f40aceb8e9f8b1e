//! Agent instance domain model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::{InstanceRow, UnknownVariant};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Waiting,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub const ALL: [Self; 6] = [
        Self::Starting,
        Self::Running,
        Self::Waiting,
        Self::Completed,
        Self::Failed,
        Self::Terminated,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Counted against the project's parallelism quota.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Waiting)
    }

    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use InstanceStatus::{Completed, Failed, Running, Starting, Terminated, Waiting};
        matches!(
            (self, next),
            (Starting, Running | Failed | Terminated)
                | (Running, Waiting | Completed | Failed | Terminated)
                | (Waiting, Running | Failed | Terminated)
                | (Completed, Running)
                | (Failed, Starting | Running)
                | (Terminated, Starting)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                column: "instance status",
                value: s.to_string(),
            })
    }
}

/// What an instance is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceRole {
    /// Supervising session driven by the operator.
    Parent,
    /// Executes one task in its own worktree.
    Child {
        parent_instance_id: String,
        task_id: Option<String>,
        worktree_path: Option<String>,
    },
}

impl InstanceRole {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child { .. } => "child",
        }
    }
}

/// An agent instance as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: String,
    pub project_id: String,
    pub role: InstanceRole,
    pub status: InstanceStatus,
    pub progress: u8,
    pub pid: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl Instance {
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn task_id(&self) -> Option<&str> {
        match &self.role {
            InstanceRole::Child { task_id, .. } => task_id.as_deref(),
            InstanceRole::Parent => None,
        }
    }

    pub fn worktree_path(&self) -> Option<&str> {
        match &self.role {
            InstanceRole::Child { worktree_path, .. } => worktree_path.as_deref(),
            InstanceRole::Parent => None,
        }
    }

    pub fn parent_instance_id(&self) -> Option<&str> {
        match &self.role {
            InstanceRole::Child {
                parent_instance_id, ..
            } => Some(parent_instance_id),
            InstanceRole::Parent => None,
        }
    }
}

impl TryFrom<InstanceRow> for Instance {
    type Error = UnknownVariant;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let role = match (row.instance_type.as_str(), row.parent_instance_id) {
            ("parent", _) => InstanceRole::Parent,
            ("child", Some(parent_instance_id)) => InstanceRole::Child {
                parent_instance_id,
                task_id: row.task_id,
                worktree_path: row.worktree_path,
            },
            (other, _) => {
                return Err(UnknownVariant {
                    column: "instance type",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            role,
            status: row.status.parse()?,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            pid: row.pid.and_then(|p| u32::try_from(p).ok()),
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Request to register a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewInstance {
    Parent {
        project_id: String,
    },
    Child {
        project_id: String,
        parent_instance_id: String,
        task_id: Option<String>,
        worktree_path: Option<String>,
    },
}

impl NewInstance {
    pub fn project_id(&self) -> &str {
        match self {
            Self::Parent { project_id } | Self::Child { project_id, .. } => project_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use InstanceStatus::{Completed, Failed, Running, Starting, Terminated, Waiting};

    #[test]
    fn transition_table() {
        let allowed = [
            (Starting, Running),
            (Starting, Failed),
            (Starting, Terminated),
            (Running, Waiting),
            (Running, Completed),
            (Running, Failed),
            (Running, Terminated),
            (Waiting, Running),
            (Waiting, Failed),
            (Waiting, Terminated),
            (Completed, Running),
            (Failed, Starting),
            (Failed, Running),
            (Terminated, Starting),
        ];
        for from in InstanceStatus::ALL {
            for to in InstanceStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn active_set() {
        let active: Vec<_> = InstanceStatus::ALL
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(active, vec![Starting, Running, Waiting]);
    }

    #[test]
    fn status_parses_from_text() {
        for status in InstanceStatus::ALL {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    fn row(instance_type: &str, parent: Option<&str>) -> InstanceRow {
        InstanceRow {
            id: "i1".into(),
            project_id: "p1".into(),
            instance_type: instance_type.into(),
            status: "running".into(),
            parent_instance_id: parent.map(Into::into),
            task_id: Some("t1".into()),
            worktree_path: Some("/wt/a".into()),
            progress: 40,
            pid: Some(4242),
            created_at: 1,
            updated_at: 2,
            started_at: Some(2),
            finished_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn child_row_becomes_child_role() {
        let instance = Instance::try_from(row("child", Some("parent-1"))).unwrap();
        assert_eq!(instance.parent_instance_id(), Some("parent-1"));
        assert_eq!(instance.task_id(), Some("t1"));
        assert_eq!(instance.worktree_path(), Some("/wt/a"));
        assert_eq!(instance.progress, 40);
        assert_eq!(instance.pid, Some(4242));
    }

    #[test]
    fn parent_row_ignores_child_columns() {
        let instance = Instance::try_from(row("parent", None)).unwrap();
        assert_eq!(instance.role, InstanceRole::Parent);
        assert_eq!(instance.task_id(), None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Instance::try_from(row("sidecar", None)).is_err());
        assert!(Instance::try_from(row("child", None)).is_err());
    }

    #[test]
    fn role_serializes_tagged() {
        let json = serde_json::to_value(InstanceRole::Child {
            parent_instance_id: "p".into(),
            task_id: None,
            worktree_path: None,
        })
        .unwrap();
        assert_eq!(json["type"], "child");
        assert_eq!(json["parent_instance_id"], "p");
    }
}
