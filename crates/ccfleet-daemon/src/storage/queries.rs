//! Database queries for projects, tasks, and task dependencies.

use ccfleet_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ProjectRow, TaskDependencyRow, TaskRow};

/// Parameters for inserting a task.
#[derive(Debug, Clone)]
pub struct TaskParams<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub parent_task_id: Option<&'a str>,
    pub title: &'a str,
    pub description: &'a str,
    pub task_type: &'a str,
    pub priority: i64,
    pub instruction: &'a str,
}

impl<'a> TaskParams<'a> {
    /// A general task with empty description and instruction.
    pub const fn new(id: &'a str, project_id: &'a str, title: &'a str) -> Self {
        Self {
            id,
            project_id,
            parent_task_id: None,
            title,
            description: "",
            task_type: "general",
            priority: 0,
            instruction: "",
        }
    }
}

/// Result of a task deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDeletion {
    Deleted,
    NotFound,
    /// Refused: the task has child tasks and `force` was not set.
    HasChildren { count: i64 },
}

impl Database {
    // =========================================================================
    // Project queries
    // =========================================================================

    /// Create a new project.
    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        working_directory: &str,
        max_parallelism: i64,
    ) -> Result<ProjectRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO projects (id, name, working_directory, max_parallelism, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(name)
        .bind(working_directory)
        .bind(max_parallelism)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::from(e).on_conflict(|| format!("Project {id}")))?;

        self.get_project(id).await
    }

    /// Get a project by ID.
    pub async fn get_project(&self, id: &str) -> Result<ProjectRow, DatabaseError> {
        sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {id}")))
    }

    /// List all projects, newest first.
    pub async fn list_projects(&self) -> Result<Vec<ProjectRow>, DatabaseError> {
        let projects =
            sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY created_at DESC")
                .fetch_all(self.pool())
                .await?;
        Ok(projects)
    }

    /// Change a project's parallelism quota.
    pub async fn set_max_parallelism(
        &self,
        id: &str,
        max_parallelism: i64,
    ) -> Result<(), DatabaseError> {
        let result =
            sqlx::query("UPDATE projects SET max_parallelism = ?, updated_at = ? WHERE id = ?")
                .bind(max_parallelism)
                .bind(unix_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Project {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Task queries
    // =========================================================================

    /// Create a new task.
    pub async fn create_task(&self, params: &TaskParams<'_>) -> Result<TaskRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO tasks
                (id, project_id, parent_task_id, title, description, task_type,
                 priority, instruction, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(params.id)
        .bind(params.project_id)
        .bind(params.parent_task_id)
        .bind(params.title)
        .bind(params.description)
        .bind(params.task_type)
        .bind(params.priority)
        .bind(params.instruction)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::from(e).on_conflict(|| format!("Task {}", params.id)))?;

        self.get_task(params.id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<TaskRow, DatabaseError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// List a project's tasks by priority (highest first), then age.
    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<TaskRow>, DatabaseError> {
        let tasks = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE project_id = ? ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(tasks)
    }

    /// Update a task's status.
    ///
    /// `running` stamps `started_at` once and records the assigned instance;
    /// `completed`/`failed` stamp `completed_at`; `pending`/`queued` clear it.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: &str,
        assigned_instance_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = match status {
            "running" => {
                sqlx::query(
                    r"
                    UPDATE tasks
                    SET status = ?, started_at = COALESCE(started_at, ?), completed_at = NULL,
                        assigned_instance_id = COALESCE(?, assigned_instance_id)
                    WHERE id = ?
                    ",
                )
                .bind(status)
                .bind(now)
                .bind(assigned_instance_id)
                .bind(id)
                .execute(self.pool())
                .await?
            }
            "completed" | "failed" => {
                sqlx::query("UPDATE tasks SET status = ?, completed_at = ? WHERE id = ?")
                    .bind(status)
                    .bind(now)
                    .bind(id)
                    .execute(self.pool())
                    .await?
            }
            _ => {
                sqlx::query("UPDATE tasks SET status = ?, completed_at = NULL WHERE id = ?")
                    .bind(status)
                    .bind(id)
                    .execute(self.pool())
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {id}")));
        }
        Ok(())
    }

    /// Delete a task. Child tasks block deletion unless `force` is set, in
    /// which case the subtree goes with it.
    pub async fn delete_task(&self, id: &str, force: bool) -> Result<TaskDeletion, DatabaseError> {
        let (children,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE parent_task_id = ?")
                .bind(id)
                .fetch_one(self.pool())
                .await?;

        if children > 0 && !force {
            return Ok(TaskDeletion::HasChildren { count: children });
        }

        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(if result.rows_affected() == 0 {
            TaskDeletion::NotFound
        } else {
            TaskDeletion::Deleted
        })
    }

    // =========================================================================
    // Dependency queries
    // =========================================================================

    /// Insert a dependency edge. Returns `false` when the edge already exists.
    pub async fn add_task_dependency(
        &self,
        task_id: &str,
        depends_on_task_id: &str,
        auto_generated: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            INSERT INTO task_dependencies
                (task_id, depends_on_task_id, kind, auto_generated, created_at)
            VALUES (?, ?, 'depends_on', ?, ?)
            ON CONFLICT (task_id, depends_on_task_id) DO NOTHING
            ",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .bind(i64::from(auto_generated))
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a dependency edge. Returns `false` when it did not exist.
    pub async fn remove_task_dependency(
        &self,
        task_id: &str,
        depends_on_task_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All dependency edges whose source task belongs to the project.
    pub async fn list_project_dependencies(
        &self,
        project_id: &str,
    ) -> Result<Vec<TaskDependencyRow>, DatabaseError> {
        let edges = sqlx::query_as::<_, TaskDependencyRow>(
            r"
            SELECT d.* FROM task_dependencies d
            JOIN tasks t ON t.id = d.task_id
            WHERE t.project_id = ?
            ORDER BY d.task_id, d.depends_on_task_id
            ",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(edges)
    }

    /// Edges leaving a single task.
    pub async fn list_task_dependencies(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskDependencyRow>, DatabaseError> {
        let edges = sqlx::query_as::<_, TaskDependencyRow>(
            "SELECT * FROM task_dependencies WHERE task_id = ? ORDER BY depends_on_task_id",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(edges)
    }
}
