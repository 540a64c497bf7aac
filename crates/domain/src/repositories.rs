//! Persistence ports. Implementations live in the infrastructure
//! crate; services depend only on these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    FileProduct, FileProductVersion, MetadataItem, MetadataRequest, MetadataRequestKind,
    OutputFileDescriptor, RunTimes, SchedulingAttempt, Task, TaskSchedulingInfo,
};
use crate::errors::PipelineResult;
use crate::plan::ExpansionPlan;

/// Database ids assigned to an expansion plan's rows, in plan order.
#[derive(Debug, Clone, Default)]
pub struct PersistedPlan {
    pub task_ids: Vec<i64>,
    pub product_ids: Vec<i64>,
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<Task>>;

    async fn find_children(&self, parent_id: i64) -> PipelineResult<Vec<Task>>;

    /// All tasks of one type, oldest first. Used by the scheduler to
    /// find do-while containers awaiting a continuation decision.
    async fn find_by_type(&self, task_type: &str) -> PipelineResult<Vec<Task>>;

    /// Resolves a task name within the subtree rooted at `root_id`,
    /// preferring the most recently created match. Used for metadata
    /// requests whose target did not exist at planning time.
    async fn find_descendant_by_name(
        &self,
        root_id: i64,
        name: &str,
    ) -> PipelineResult<Option<Task>>;

    /// Non-structural tasks with no in-flight or succeeded attempt,
    /// joined with their attempt history for retry decisions.
    async fn find_unscheduled_tasks(&self, limit: i64) -> PipelineResult<Vec<TaskSchedulingInfo>>;

    /// Persists a whole expansion plan in one transaction.
    async fn persist_plan(&self, plan: &ExpansionPlan) -> PipelineResult<PersistedPlan>;

    async fn count_all(&self) -> PipelineResult<i64>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<SchedulingAttempt>>;

    async fn find_for_task(&self, task_id: i64) -> PipelineResult<Vec<SchedulingAttempt>>;

    /// All attempts currently in the given state, oldest first. Used
    /// to requeue attempts whose queue message was lost.
    async fn find_with_status(
        &self,
        status: crate::entities::AttemptStatus,
    ) -> PipelineResult<Vec<SchedulingAttempt>>;

    /// Creates a QUEUED attempt if and only if the task currently has
    /// no queued or running attempt. Returns `None` when another
    /// scheduler won the race.
    async fn claim(&self, task_id: i64) -> PipelineResult<Option<SchedulingAttempt>>;

    /// QUEUED -> RUNNING transition performed by the worker that picked
    /// the attempt off the queue. Returns false if the attempt was not
    /// in the QUEUED state.
    async fn mark_running(&self, attempt_id: i64, host: &str) -> PipelineResult<bool>;

    async fn record_heartbeat(&self, attempt_id: i64) -> PipelineResult<()>;

    async fn mark_succeeded(&self, attempt_id: i64, run_times: RunTimes) -> PipelineResult<()>;

    async fn mark_failed(&self, attempt_id: i64, error_text: &str) -> PipelineResult<()>;

    /// RUNNING attempts whose latest heartbeat is older than the
    /// cutoff; the heartbeat monitor fails these.
    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<SchedulingAttempt>>;

    /// QUEUED attempts older than the cutoff that no worker ever
    /// picked up, e.g. because their queue message was lost.
    async fn find_stale_queued(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<SchedulingAttempt>>;

    /// Recomputes `all_products_passed_qc` from the attempt's product
    /// versions and stores the outcome.
    async fn refresh_qc_outcome(&self, attempt_id: i64) -> PipelineResult<()>;

    /// Marks QC inspection of the attempt's outputs as finished.
    async fn mark_qc_complete(&self, attempt_id: i64) -> PipelineResult<()>;

    /// Attempt counts grouped by the owning task's job name and the
    /// attempt status, for the progress summary.
    async fn count_by_status(&self) -> PipelineResult<Vec<(Option<String>, String, i64)>>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> PipelineResult<Option<FileProduct>>;

    async fn find_by_location(
        &self,
        directory: &str,
        filename: &str,
    ) -> PipelineResult<Option<FileProduct>>;

    async fn find_outputs_of_task(&self, task_id: i64) -> PipelineResult<Vec<FileProduct>>;

    async fn find_inputs_of_task(&self, task_id: i64) -> PipelineResult<Vec<FileProduct>>;

    /// Ids of the tasks that consume the product as an input.
    async fn find_consumer_tasks(&self, product_id: i64) -> PipelineResult<Vec<i64>>;

    /// True when the product has at least one version that passed QC.
    async fn has_passed_version(&self, product_id: i64) -> PipelineResult<bool>;

    /// Records a version written by an attempt. `passed_qc` starts out
    /// unset; QC fills it in later.
    async fn register_version(
        &self,
        product_id: i64,
        attempt_id: i64,
        file: &OutputFileDescriptor,
    ) -> PipelineResult<FileProductVersion>;

    async fn find_version_by_id(&self, id: i64) -> PipelineResult<Option<FileProductVersion>>;

    async fn find_versions_of_attempt(
        &self,
        attempt_id: i64,
    ) -> PipelineResult<Vec<FileProductVersion>>;

    async fn set_version_qc(&self, version_id: i64, passed: bool) -> PipelineResult<()>;
}

#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Inserts or overwrites one keyword on a task.
    async fn record_task_metadata(&self, task_id: i64, item: &MetadataItem) -> PipelineResult<()>;

    async fn get_task_metadata(&self, task_id: i64) -> PipelineResult<Vec<MetadataItem>>;

    async fn get_task_metadata_value(
        &self,
        task_id: i64,
        keyword: &str,
    ) -> PipelineResult<Option<MetadataItem>>;

    /// Attempt-scoped copy of worker-reported metadata, kept for
    /// provenance; downstream expressions read the task-scoped copy.
    async fn record_attempt_metadata(
        &self,
        attempt_id: i64,
        item: &MetadataItem,
    ) -> PipelineResult<()>;

    async fn get_attempt_metadata(&self, attempt_id: i64) -> PipelineResult<Vec<MetadataItem>>;

    async fn record_request(&self, request: &MetadataRequest) -> PipelineResult<()>;

    async fn requests_for_task(&self, task_id: i64) -> PipelineResult<Vec<MetadataRequest>>;

    /// Ids of the tasks holding a sibling request bound to the given
    /// task. Used to trace which consumers a blocked task wedges.
    async fn find_requesting_tasks(&self, referenced_task_id: i64) -> PipelineResult<Vec<i64>>;

    /// Binds a by-name request to a concrete task once the target
    /// exists.
    async fn resolve_request(
        &self,
        task_id: i64,
        kind: MetadataRequestKind,
        referenced_name: &str,
        referenced_task_id: i64,
    ) -> PipelineResult<()>;
}
