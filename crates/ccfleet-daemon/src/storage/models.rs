//! Database models for the ccfleet daemon.

use serde::{Deserialize, Serialize};

/// Project record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub working_directory: String,
    pub max_parallelism: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Task record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub project_id: String,
    pub parent_task_id: Option<String>,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub status: String,
    pub instruction: String,
    pub assigned_instance_id: Option<String>,
    pub phase: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Dependency edge: `task_id` waits for `depends_on_task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskDependencyRow {
    pub task_id: String,
    pub depends_on_task_id: String,
    pub kind: String,
    pub auto_generated: i64,
    pub created_at: i64,
}

/// Agent instance record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: String,
    pub project_id: String,
    pub instance_type: String,
    pub status: String,
    pub parent_instance_id: Option<String>,
    pub task_id: Option<String>,
    pub worktree_path: Option<String>,
    pub progress: i64,
    pub pid: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

/// Execution phase record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionPhaseRow {
    pub id: i64,
    pub project_id: String,
    pub phase_number: i64,
    pub name: String,
    pub status: String,
    pub quality_gate_passed: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown {column} value: {value}")]
pub struct UnknownVariant {
    pub column: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $column:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        column: $column,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Task status.
    TaskStatus, "task status" {
        Pending => "pending",
        Queued => "queued",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    /// Scheduling hint attached to a task.
    TaskType, "task type" {
        Setup => "setup",
        Database => "database",
        Backend => "backend",
        Frontend => "frontend",
        Test => "test",
        Deploy => "deploy",
        General => "general",
    }
);

string_enum!(
    /// Execution phase status.
    PhaseStatus, "phase status" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
);
