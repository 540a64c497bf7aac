use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use pipeline_domain::entities::{Task, TaskSchedulingInfo, TASK_TYPE_CHAIN, TASK_TYPE_FOR_LOOP};
use pipeline_domain::plan::{ExpansionPlan, PlanParent, PlanProductRef, PlanTaskRef};
use pipeline_domain::repositories::{PersistedPlan, TaskRepository};
use pipeline_domain::{MetadataValue, PipelineError, PipelineResult};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            task_type: row.try_get("task_type")?,
            name: row.try_get("name")?,
            job_name: row.try_get("job_name")?,
            working_directory: row.try_get("working_directory")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_children(&self, parent_id: i64) -> PipelineResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = ? ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_by_type(&self, task_type: &str) -> PipelineResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE task_type = ? ORDER BY id")
            .bind(task_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_descendant_by_name(
        &self,
        root_id: i64,
        name: &str,
    ) -> PipelineResult<Option<Task>> {
        // The most recent match wins: in a do-while loop each iteration
        // re-creates tasks with the same name and the continuation
        // decision reads the latest one.
        let row = sqlx::query(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM tasks WHERE id = ?
                UNION ALL
                SELECT t.id FROM tasks t JOIN subtree s ON t.parent_id = s.id
            )
            SELECT t.* FROM tasks t
            JOIN subtree s ON t.id = s.id
            WHERE t.name = ?
            ORDER BY t.id DESC
            LIMIT 1
            "#,
        )
        .bind(root_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_unscheduled_tasks(&self, limit: i64) -> PipelineResult<Vec<TaskSchedulingInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT t.*,
                   COUNT(a.id) AS attempt_count,
                   MAX(CASE WHEN a.status = 'FAILED' THEN a.ended_at END) AS last_failure_at
            FROM tasks t
            LEFT JOIN scheduling_attempts a ON a.task_id = t.id
            WHERE t.task_type NOT IN (?, ?)
            GROUP BY t.id
            HAVING COALESCE(SUM(CASE WHEN a.status IN ('QUEUED', 'RUNNING', 'SUCCEEDED')
                                     THEN 1 ELSE 0 END), 0) = 0
            ORDER BY t.id
            LIMIT ?
            "#,
        )
        .bind(TASK_TYPE_CHAIN)
        .bind(TASK_TYPE_FOR_LOOP)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TaskSchedulingInfo {
                    task: Self::row_to_task(row)?,
                    attempt_count: row.try_get("attempt_count")?,
                    last_failure_at: row.try_get("last_failure_at")?,
                })
            })
            .collect()
    }

    async fn persist_plan(&self, plan: &ExpansionPlan) -> PipelineResult<PersistedPlan> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut task_ids: Vec<i64> = Vec::with_capacity(plan.tasks.len());
        for (index, planned) in plan.tasks.iter().enumerate() {
            let parent_id = match planned.parent {
                PlanParent::Existing(id) => id,
                PlanParent::Planned(parent_index) => {
                    // Planning emits tasks parent-first, so forward
                    // references are a planner bug.
                    let resolved = task_ids.get(parent_index).copied();
                    match resolved {
                        Some(id) => Some(id),
                        None => {
                            return Err(PipelineError::internal(format!(
                                "plan task {index} references unplanned parent {parent_index}"
                            )))
                        }
                    }
                }
            };
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (parent_id, task_type, name, job_name, working_directory,
                                   created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(parent_id)
            .bind(&planned.task_type)
            .bind(&planned.name)
            .bind(&planned.job_name)
            .bind(&planned.working_directory)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            task_ids.push(result.last_insert_rowid());
        }

        let mut product_ids: Vec<i64> = Vec::with_capacity(plan.products.len());
        for planned in &plan.products {
            let generator = task_ids.get(planned.generator).copied().ok_or_else(|| {
                PipelineError::internal(format!(
                    "plan product references unplanned task {}",
                    planned.generator
                ))
            })?;
            let result = sqlx::query(
                r#"
                INSERT INTO products (generator_task, directory, filename, semantic_type,
                                      mime_type, planned_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(generator)
            .bind(&planned.directory)
            .bind(&planned.filename)
            .bind(&planned.semantic_type)
            .bind(&planned.mime_type)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            product_ids.push(result.last_insert_rowid());
        }

        for input in &plan.inputs {
            let consumer = task_ids.get(input.consumer).copied().ok_or_else(|| {
                PipelineError::internal(format!(
                    "plan input references unplanned task {}",
                    input.consumer
                ))
            })?;
            let product_id = match input.product {
                PlanProductRef::Existing(id) => id,
                PlanProductRef::Planned(index) => {
                    product_ids.get(index).copied().ok_or_else(|| {
                        PipelineError::internal(format!(
                            "plan input references unplanned product {index}"
                        ))
                    })?
                }
            };
            sqlx::query(
                "INSERT INTO task_inputs (task_id, product_id, semantic_type) VALUES (?, ?, ?)",
            )
            .bind(consumer)
            .bind(product_id)
            .bind(&input.semantic_type)
            .execute(&mut *tx)
            .await?;
        }

        let mut metadata_rows: Vec<(i64, &pipeline_domain::MetadataItem)> =
            Vec::with_capacity(plan.metadata.len() + plan.existing_metadata.len());
        for (task_index, item) in &plan.metadata {
            let task_id = task_ids.get(*task_index).copied().ok_or_else(|| {
                PipelineError::internal(format!(
                    "plan metadata references unplanned task {task_index}"
                ))
            })?;
            metadata_rows.push((task_id, item));
        }
        for (task_id, item) in &plan.existing_metadata {
            metadata_rows.push((*task_id, item));
        }
        for (task_id, item) in metadata_rows {
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
            .execute(&mut *tx)
            .await?;
        }

        for request in &plan.requests {
            let task_id = task_ids.get(request.task).copied().ok_or_else(|| {
                PipelineError::internal(format!(
                    "plan request references unplanned task {}",
                    request.task
                ))
            })?;
            let referenced_task_id = match request.referenced {
                Some(PlanTaskRef::Existing(id)) => Some(id),
                Some(PlanTaskRef::Planned(index)) => {
                    Some(task_ids.get(index).copied().ok_or_else(|| {
                        PipelineError::internal(format!(
                            "plan request references unplanned task {index}"
                        ))
                    })?)
                }
                None => None,
            };
            sqlx::query(
                r#"
                INSERT INTO metadata_requests (task_id, kind, referenced_task_id, referenced_name)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (task_id, kind, referenced_name) DO UPDATE SET
                    referenced_task_id = excluded.referenced_task_id
                "#,
            )
            .bind(task_id)
            .bind(request.kind)
            .bind(referenced_task_id)
            .bind(&request.referenced_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            tasks = task_ids.len(),
            products = product_ids.len(),
            "persisted expansion plan"
        );

        Ok(PersistedPlan {
            task_ids,
            product_ids,
        })
    }

    async fn count_all(&self) -> PipelineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}
