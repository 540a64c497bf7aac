use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use pipeline_domain::entities::{MetadataItem, MetadataRequest, MetadataRequestKind, MetadataValue};
use pipeline_domain::repositories::MetadataRepository;
use pipeline_domain::PipelineResult;

pub struct SqliteMetadataRepository {
    pool: SqlitePool,
}

impl SqliteMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<MetadataItem> {
        let value_float: Option<f64> = row.try_get("value_float")?;
        let value_str: Option<String> = row.try_get("value_str")?;
        let value = match (value_float, value_str) {
            (Some(v), _) => MetadataValue::Float(v),
            (None, Some(s)) => MetadataValue::Str(s),
            (None, None) => MetadataValue::Str(String::new()),
        };
        Ok(MetadataItem {
            keyword: row.try_get("keyword")?,
            value,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<MetadataRequest> {
        Ok(MetadataRequest {
            task_id: row.try_get("task_id")?,
            kind: row.try_get("kind")?,
            referenced_task_id: row.try_get("referenced_task_id")?,
            referenced_name: row.try_get("referenced_name")?,
        })
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn record_task_metadata(&self, task_id: i64, item: &MetadataItem) -> PipelineResult<()> {
        let (value_float, value_str) = match &item.value {
            MetadataValue::Float(v) => (Some(*v), None),
            MetadataValue::Str(s) => (None, Some(s.clone())),
        };
        sqlx::query(
            r#"
            INSERT INTO task_metadata (task_id, keyword, value_float, value_str, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (task_id, keyword) DO UPDATE SET
                value_float = excluded.value_float,
                value_str = excluded.value_str,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(task_id)
        .bind(&item.keyword)
        .bind(value_float)
        .bind(value_str)
        .bind(item.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_metadata(&self, task_id: i64) -> PipelineResult<Vec<MetadataItem>> {
        let rows = sqlx::query("SELECT * FROM task_metadata WHERE task_id = ? ORDER BY keyword")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn get_task_metadata_value(
        &self,
        task_id: i64,
        keyword: &str,
    ) -> PipelineResult<Option<MetadataItem>> {
        let row = sqlx::query("SELECT * FROM task_metadata WHERE task_id = ? AND keyword = ?")
            .bind(task_id)
            .bind(keyword)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn record_attempt_metadata(
        &self,
        attempt_id: i64,
        item: &MetadataItem,
    ) -> PipelineResult<()> {
        let (value_float, value_str) = match &item.value {
            MetadataValue::Float(v) => (Some(*v), None),
            MetadataValue::Str(s) => (None, Some(s.clone())),
        };
        sqlx::query(
            r#"
            INSERT INTO attempt_metadata (attempt_id, keyword, value_float, value_str, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (attempt_id, keyword) DO UPDATE SET
                value_float = excluded.value_float,
                value_str = excluded.value_str,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(attempt_id)
        .bind(&item.keyword)
        .bind(value_float)
        .bind(value_str)
        .bind(item.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempt_metadata(&self, attempt_id: i64) -> PipelineResult<Vec<MetadataItem>> {
        let rows = sqlx::query("SELECT * FROM attempt_metadata WHERE attempt_id = ? ORDER BY keyword")
            .bind(attempt_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn record_request(&self, request: &MetadataRequest) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata_requests (task_id, kind, referenced_task_id, referenced_name)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (task_id, kind, referenced_name) DO UPDATE SET
                referenced_task_id = excluded.referenced_task_id
            "#,
        )
        .bind(request.task_id)
        .bind(request.kind)
        .bind(request.referenced_task_id)
        .bind(&request.referenced_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requests_for_task(&self, task_id: i64) -> PipelineResult<Vec<MetadataRequest>> {
        let rows = sqlx::query(
            "SELECT * FROM metadata_requests WHERE task_id = ? ORDER BY referenced_name",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_request).collect()
    }

    async fn find_requesting_tasks(&self, referenced_task_id: i64) -> PipelineResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id FROM metadata_requests
            WHERE referenced_task_id = ? AND kind = ?
            ORDER BY task_id
            "#,
        )
        .bind(referenced_task_id)
        .bind(MetadataRequestKind::Sibling)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("task_id")?))
            .collect()
    }

    async fn resolve_request(
        &self,
        task_id: i64,
        kind: MetadataRequestKind,
        referenced_name: &str,
        referenced_task_id: i64,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE metadata_requests SET referenced_task_id = ?
            WHERE task_id = ? AND kind = ? AND referenced_name = ?
            "#,
        )
        .bind(referenced_task_id)
        .bind(task_id)
        .bind(kind)
        .bind(referenced_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
