//! Database queries for execution phases.

use ccfleet_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::ExecutionPhaseRow;

impl Database {
    /// Replace a project's phase plan in one transaction.
    ///
    /// `task_phases` assigns each task its phase number; tasks not listed get
    /// their phase cleared. `phase_names` holds one name per phase, in order.
    pub async fn replace_execution_phases(
        &self,
        project_id: &str,
        task_phases: &[(String, i64)],
        phase_names: &[String],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE tasks SET phase = NULL WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        for (task_id, phase) in task_phases {
            sqlx::query("UPDATE tasks SET phase = ? WHERE id = ? AND project_id = ?")
                .bind(phase)
                .bind(task_id)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM execution_phases WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        for (number, name) in (1_i64..).zip(phase_names) {
            sqlx::query(
                r"
                INSERT INTO execution_phases (project_id, phase_number, name, status, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', ?, ?)
                ",
            )
            .bind(project_id)
            .bind(number)
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Phases of a project in execution order.
    pub async fn list_execution_phases(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExecutionPhaseRow>, DatabaseError> {
        let phases = sqlx::query_as::<_, ExecutionPhaseRow>(
            "SELECT * FROM execution_phases WHERE project_id = ? ORDER BY phase_number",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        Ok(phases)
    }

    /// Set a phase's status. Returns `false` if the phase does not exist.
    pub async fn update_phase_status(
        &self,
        project_id: &str,
        phase_number: i64,
        status: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE execution_phases SET status = ?, updated_at = ? WHERE project_id = ? AND phase_number = ?",
        )
        .bind(status)
        .bind(unix_timestamp())
        .bind(project_id)
        .bind(phase_number)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a quality gate verdict. Returns `false` if the phase does not exist.
    pub async fn set_quality_gate(
        &self,
        project_id: &str,
        phase_number: i64,
        passed: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE execution_phases SET quality_gate_passed = ?, updated_at = ? WHERE project_id = ? AND phase_number = ?",
        )
        .bind(i64::from(passed))
        .bind(unix_timestamp())
        .bind(project_id)
        .bind(phase_number)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
