use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use pipeline_domain::entities::{FileProduct, FileProductVersion, OutputFileDescriptor};
use pipeline_domain::repositories::ProductRepository;
use pipeline_domain::{PipelineError, PipelineResult};

pub struct SqliteProductRepository {
    pool: SqlitePool,
}

impl SqliteProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_product(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<FileProduct> {
        Ok(FileProduct {
            id: row.try_get("id")?,
            generator_task: row.try_get("generator_task")?,
            directory: row.try_get("directory")?,
            filename: row.try_get("filename")?,
            semantic_type: row.try_get("semantic_type")?,
            mime_type: row.try_get("mime_type")?,
            planned_at: row.try_get("planned_at")?,
        })
    }

    fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<FileProductVersion> {
        Ok(FileProductVersion {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            attempt_id: row.try_get("attempt_id")?,
            repository_id: row.try_get("repository_id")?,
            checksum: row.try_get("checksum")?,
            size_bytes: row.try_get("size_bytes")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
            passed_qc: row.try_get("passed_qc")?,
        })
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<FileProduct>> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_product).transpose()
    }

    async fn find_by_location(
        &self,
        directory: &str,
        filename: &str,
    ) -> PipelineResult<Option<FileProduct>> {
        // Several tasks may plan the same location across do-while
        // iterations; the latest plan wins.
        let row = sqlx::query(
            "SELECT * FROM products WHERE directory = ? AND filename = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(directory)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_product).transpose()
    }

    async fn find_outputs_of_task(&self, task_id: i64) -> PipelineResult<Vec<FileProduct>> {
        let rows = sqlx::query("SELECT * FROM products WHERE generator_task = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_product).collect()
    }

    async fn find_inputs_of_task(&self, task_id: i64) -> PipelineResult<Vec<FileProduct>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM products p
            JOIN task_inputs i ON i.product_id = p.id
            WHERE i.task_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_product).collect()
    }

    async fn find_consumer_tasks(&self, product_id: i64) -> PipelineResult<Vec<i64>> {
        let rows =
            sqlx::query("SELECT task_id FROM task_inputs WHERE product_id = ? ORDER BY task_id")
                .bind(product_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("task_id")?))
            .collect()
    }

    async fn has_passed_version(&self, product_id: i64) -> PipelineResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM product_versions WHERE product_id = ? AND passed_qc = 1",
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    async fn register_version(
        &self,
        product_id: i64,
        attempt_id: i64,
        file: &OutputFileDescriptor,
    ) -> PipelineResult<FileProductVersion> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO product_versions
                (product_id, attempt_id, repository_id, checksum, size_bytes,
                 created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(product_id)
        .bind(attempt_id)
        .bind(&file.repository_id)
        .bind(&file.checksum)
        .bind(file.size_bytes)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.find_version_by_id(id)
            .await?
            .ok_or(PipelineError::ProductVersionNotFound { id })
    }

    async fn find_version_by_id(&self, id: i64) -> PipelineResult<Option<FileProductVersion>> {
        let row = sqlx::query("SELECT * FROM product_versions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn find_versions_of_attempt(
        &self,
        attempt_id: i64,
    ) -> PipelineResult<Vec<FileProductVersion>> {
        let rows = sqlx::query("SELECT * FROM product_versions WHERE attempt_id = ? ORDER BY id")
            .bind(attempt_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_version).collect()
    }

    async fn set_version_qc(&self, version_id: i64, passed: bool) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE product_versions SET passed_qc = ?, modified_at = ? WHERE id = ?",
        )
        .bind(passed)
        .bind(Utc::now())
        .bind(version_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::ProductVersionNotFound { id: version_id });
        }
        Ok(())
    }
}
