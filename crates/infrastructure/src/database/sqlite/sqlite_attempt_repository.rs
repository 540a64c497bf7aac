use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use pipeline_domain::entities::{RunTimes, SchedulingAttempt};
use pipeline_domain::repositories::AttemptRepository;
use pipeline_domain::{PipelineError, PipelineResult};

pub struct SqliteAttemptRepository {
    pool: SqlitePool,
}

impl SqliteAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<SchedulingAttempt> {
        Ok(SchedulingAttempt {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            latest_heartbeat: row.try_get("latest_heartbeat")?,
            host: row.try_get("host")?,
            error_fail: row.try_get("error_fail")?,
            error_text: row.try_get("error_text")?,
            all_products_passed_qc: row.try_get("all_products_passed_qc")?,
            qc_complete: row.try_get("qc_complete")?,
            run_time_wall_clock: row.try_get("run_time_wall_clock")?,
            run_time_cpu: row.try_get("run_time_cpu")?,
        })
    }
}

#[async_trait]
impl AttemptRepository for SqliteAttemptRepository {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<SchedulingAttempt>> {
        let row = sqlx::query("SELECT * FROM scheduling_attempts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_attempt).transpose()
    }

    async fn find_for_task(&self, task_id: i64) -> PipelineResult<Vec<SchedulingAttempt>> {
        let rows = sqlx::query("SELECT * FROM scheduling_attempts WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn find_with_status(
        &self,
        status: pipeline_domain::AttemptStatus,
    ) -> PipelineResult<Vec<SchedulingAttempt>> {
        let rows = sqlx::query("SELECT * FROM scheduling_attempts WHERE status = ? ORDER BY id")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn claim(&self, task_id: i64) -> PipelineResult<Option<SchedulingAttempt>> {
        // Guarded insert: concurrent schedulers race on the NOT EXISTS
        // and at most one row lands.
        let result = sqlx::query(
            r#"
            INSERT INTO scheduling_attempts (task_id, status, queued_at)
            SELECT ?, 'QUEUED', ?
            WHERE NOT EXISTS (
                SELECT 1 FROM scheduling_attempts
                WHERE task_id = ? AND status IN ('QUEUED', 'RUNNING')
            )
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let attempt_id = result.last_insert_rowid();
        debug!(task_id, attempt_id, "claimed scheduling attempt");
        let attempt = self
            .find_by_id(attempt_id)
            .await?
            .ok_or(PipelineError::AttemptNotFound { id: attempt_id })?;
        Ok(Some(attempt))
    }

    async fn mark_running(&self, attempt_id: i64, host: &str) -> PipelineResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scheduling_attempts
            SET status = 'RUNNING', started_at = ?, latest_heartbeat = ?, host = ?
            WHERE id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(host)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(&self, attempt_id: i64) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE scheduling_attempts SET latest_heartbeat = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(Utc::now())
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_succeeded(&self, attempt_id: i64, run_times: RunTimes) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduling_attempts
            SET status = 'SUCCEEDED', ended_at = ?,
                run_time_wall_clock = ?, run_time_cpu = ?
            WHERE id = ? AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(Utc::now())
        .bind(run_times.wall_clock)
        .bind(run_times.cpu)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::AttemptNotFound { id: attempt_id });
        }
        Ok(())
    }

    async fn mark_failed(&self, attempt_id: i64, error_text: &str) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduling_attempts
            SET status = 'FAILED', ended_at = ?, error_fail = 1, error_text = ?
            WHERE id = ? AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(Utc::now())
        .bind(error_text)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::AttemptNotFound { id: attempt_id });
        }
        Ok(())
    }

    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<SchedulingAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduling_attempts
            WHERE status = 'RUNNING'
              AND COALESCE(latest_heartbeat, started_at, queued_at) < ?
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn find_stale_queued(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<SchedulingAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduling_attempts WHERE status = 'QUEUED' AND queued_at < ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn refresh_qc_outcome(&self, attempt_id: i64) -> PipelineResult<()> {
        // NULL while any version is uninspected (or none exist yet);
        // false as soon as one version fails; true only when every
        // version passed.
        sqlx::query(
            r#"
            UPDATE scheduling_attempts
            SET all_products_passed_qc = (
                SELECT CASE
                    WHEN COUNT(*) = 0 THEN NULL
                    WHEN SUM(CASE WHEN passed_qc = 0 THEN 1 ELSE 0 END) > 0 THEN 0
                    WHEN SUM(CASE WHEN passed_qc IS NULL THEN 1 ELSE 0 END) > 0 THEN NULL
                    ELSE 1
                END
                FROM product_versions WHERE attempt_id = ?
            )
            WHERE id = ?
            "#,
        )
        .bind(attempt_id)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_qc_complete(&self, attempt_id: i64) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE scheduling_attempts SET qc_complete = 1 WHERE id = ?")
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::AttemptNotFound { id: attempt_id });
        }
        Ok(())
    }

    async fn count_by_status(&self) -> PipelineResult<Vec<(Option<String>, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT t.job_name AS job_name, a.status AS status, COUNT(*) AS n
            FROM scheduling_attempts a
            JOIN tasks t ON t.id = a.task_id
            GROUP BY t.job_name, a.status
            ORDER BY t.job_name, a.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("job_name")?,
                    row.try_get("status")?,
                    row.try_get("n")?,
                ))
            })
            .collect()
    }
}
