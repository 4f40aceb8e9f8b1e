//! Database queries for agent instances.

use ccfleet_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{Database, DatabaseError};
use super::models::InstanceRow;

/// Parameters for inserting an instance.
#[derive(Debug, Clone)]
pub struct InstanceParams<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub instance_type: &'a str,
    pub parent_instance_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub worktree_path: Option<&'a str>,
}

impl Database {
    /// Insert a new instance in `starting` with progress 0.
    pub async fn create_instance(
        &self,
        params: &InstanceParams<'_>,
    ) -> Result<InstanceRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO cc_instances
                (id, project_id, instance_type, status, parent_instance_id, task_id,
                 worktree_path, progress, created_at, updated_at)
            VALUES (?, ?, ?, 'starting', ?, ?, ?, 0, ?, ?)
            ",
        )
        .bind(params.id)
        .bind(params.project_id)
        .bind(params.instance_type)
        .bind(params.parent_instance_id)
        .bind(params.task_id)
        .bind(params.worktree_path)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_instance(params.id).await
    }

    /// Get an instance by ID, including soft-deleted ones.
    pub async fn get_instance(&self, id: &str) -> Result<InstanceRow, DatabaseError> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM cc_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Instance {id}")))
    }

    /// List live instances, optionally filtered by project and status.
    pub async fn list_instances(
        &self,
        project_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<InstanceRow>, DatabaseError> {
        let instances = sqlx::query_as::<_, InstanceRow>(
            r"
            SELECT * FROM cc_instances
            WHERE deleted_at IS NULL
              AND (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id ASC
            ",
        )
        .bind(project_id)
        .bind(status)
        .fetch_all(self.pool())
        .await?;
        Ok(instances)
    }

    /// Live children of a parent instance.
    pub async fn list_child_instances(
        &self,
        parent_instance_id: &str,
    ) -> Result<Vec<InstanceRow>, DatabaseError> {
        let children = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM cc_instances WHERE parent_instance_id = ? AND deleted_at IS NULL ORDER BY created_at, id",
        )
        .bind(parent_instance_id)
        .fetch_all(self.pool())
        .await?;
        Ok(children)
    }

    /// Number of instances counted against the project's quota.
    pub async fn count_active_instances(&self, project_id: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cc_instances WHERE project_id = ? AND deleted_at IS NULL AND status IN ('starting', 'running', 'waiting')",
        )
        .bind(project_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// The active instance bound to a task, if any.
    pub async fn find_active_instance_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<InstanceRow>, DatabaseError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM cc_instances WHERE task_id = ? AND deleted_at IS NULL AND status IN ('starting', 'running', 'waiting') LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// The live instance claiming a worktree path, if any.
    pub async fn find_instance_by_worktree(
        &self,
        worktree_path: &str,
    ) -> Result<Option<InstanceRow>, DatabaseError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM cc_instances WHERE worktree_path = ? AND deleted_at IS NULL LIMIT 1",
        )
        .bind(worktree_path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Set an instance's status and the timestamps that go with it.
    ///
    /// `running` stamps `started_at` on first entry; terminal statuses stamp
    /// `finished_at`; active statuses clear it; `completed` forces progress
    /// to 100.
    pub async fn update_instance_status(&self, id: &str, status: &str) -> Result<(), DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        apply_instance_status(&mut conn, id, status).await
    }

    /// Record progress and apply `status` in one transaction.
    pub async fn update_instance_progress(
        &self,
        id: &str,
        progress: i64,
        status: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query("UPDATE cc_instances SET progress = ? WHERE id = ?")
            .bind(progress)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Instance {id}")));
        }
        apply_instance_status(&mut tx, id, status).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record the process ID of an instance's agent.
    pub async fn set_instance_pid(&self, id: &str, pid: Option<i64>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE cc_instances SET pid = ?, updated_at = ? WHERE id = ?")
            .bind(pid)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Bump `updated_at` to mark activity.
    pub async fn touch_instance(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE cc_instances SET updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Active instances not updated since `cutoff`.
    pub async fn find_stale_instances(&self, cutoff: i64) -> Result<Vec<InstanceRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM cc_instances WHERE deleted_at IS NULL AND status IN ('starting', 'running', 'waiting') AND updated_at < ? ORDER BY updated_at",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Soft-delete terminal instances that finished before `cutoff` and
    /// return the rows that were removed.
    pub async fn soft_delete_finished_instances(
        &self,
        cutoff: i64,
    ) -> Result<Vec<InstanceRow>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query_as::<_, InstanceRow>(
            r"
            SELECT * FROM cc_instances
            WHERE deleted_at IS NULL
              AND status IN ('completed', 'failed', 'terminated')
              AND finished_at IS NOT NULL AND finished_at < ?
            ORDER BY finished_at
            ",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let now = unix_timestamp();
        for row in &rows {
            sqlx::query("UPDATE cc_instances SET deleted_at = ? WHERE id = ?")
                .bind(now)
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// Mark a single instance deleted while keeping its row.
    pub async fn soft_delete_instance(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE cc_instances SET deleted_at = COALESCE(deleted_at, ?) WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove an instance row.
    pub async fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM cc_instances WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether any row, live or soft-deleted, names this instance as parent.
    pub async fn has_child_rows(&self, id: &str) -> Result<bool, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM cc_instances WHERE parent_instance_id = ?")
                .bind(id)
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }
}

async fn apply_instance_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: &str,
) -> Result<(), DatabaseError> {
    let now = unix_timestamp();
    let result = match status {
        "running" => {
            sqlx::query(
                r"
                UPDATE cc_instances
                SET status = ?, started_at = COALESCE(started_at, ?), finished_at = NULL, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(status)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?
        }
        "completed" => {
            sqlx::query(
                "UPDATE cc_instances SET status = ?, progress = 100, finished_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?
        }
        "failed" | "terminated" => {
            sqlx::query(
                "UPDATE cc_instances SET status = ?, finished_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?
        }
        _ => {
            sqlx::query(
                "UPDATE cc_instances SET status = ?, finished_at = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(status)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?
        }
    };

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound(format!("Instance {id}")));
    }
    Ok(())
}
