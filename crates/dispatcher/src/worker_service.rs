//! The surface workers drive: picking attempts off the queue,
//! heartbeating, registering outputs and reporting results.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use pipeline_domain::entities::{
    FileProductVersion, MetadataItem, OutputFileDescriptor, RunTimes, TaskContext,
};
use pipeline_domain::ports::messaging::WorkQueue;
use pipeline_domain::repositories::{
    AttemptRepository, MetadataRepository, ProductRepository, TaskRepository,
};
use pipeline_domain::{PipelineError, PipelineResult};

use crate::context::{evaluate_metadata_scope, MetadataResolver};

pub struct WorkerService {
    tasks: Arc<dyn TaskRepository>,
    attempts: Arc<dyn AttemptRepository>,
    products: Arc<dyn ProductRepository>,
    metadata: Arc<dyn MetadataRepository>,
    queue: Arc<dyn WorkQueue>,
    resolver: Arc<MetadataResolver>,
    host: String,
}

impl WorkerService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        attempts: Arc<dyn AttemptRepository>,
        products: Arc<dyn ProductRepository>,
        metadata: Arc<dyn MetadataRepository>,
        queue: Arc<dyn WorkQueue>,
        resolver: Arc<MetadataResolver>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            tasks,
            attempts,
            products,
            metadata,
            queue,
            resolver,
            host,
        }
    }

    /// Waits for the next attempt and takes ownership of it. Returns
    /// `None` when the queue stays empty or the attempt was already
    /// taken over (e.g. failed by the heartbeat monitor meanwhile).
    pub async fn fetch_work(&self, timeout: Duration) -> PipelineResult<Option<TaskContext>> {
        let attempt_id = match self.queue.receive(timeout).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        if !self.attempts.mark_running(attempt_id, &self.host).await? {
            warn!(attempt_id, "attempt was no longer claimable, dropping");
            return Ok(None);
        }
        info!(attempt_id, host = %self.host, "picked up attempt");
        Ok(Some(self.build_context(attempt_id).await?))
    }

    /// Assembles everything a worker needs to execute an attempt, with
    /// every descriptor expression resolved to a literal value.
    pub async fn build_context(&self, attempt_id: i64) -> PipelineResult<TaskContext> {
        let attempt = self
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(PipelineError::AttemptNotFound { id: attempt_id })?;
        let task = self
            .tasks
            .find_by_id(attempt.task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound { id: attempt.task_id })?;

        let evaluator = self.resolver.evaluator_for(&task).await?;
        let metadata = evaluate_metadata_scope(&evaluator)?;
        let inputs = self.products.find_inputs_of_task(task.id).await?;
        let outputs = self.products.find_outputs_of_task(task.id).await?;

        Ok(TaskContext {
            attempt_id,
            task_id: task.id,
            task_type: task.task_type,
            task_name: task.name,
            job_name: task.job_name,
            working_directory: task.working_directory,
            inputs,
            outputs,
            metadata,
            requested_metadata: evaluator.requested_metadata,
        })
    }

    pub async fn record_heartbeat(&self, attempt_id: i64) -> PipelineResult<()> {
        self.attempts.record_heartbeat(attempt_id).await
    }

    /// Registers one written output file as a new version of the
    /// product the task declared for that location.
    pub async fn register_output(
        &self,
        attempt_id: i64,
        directory: &str,
        filename: &str,
        file: &OutputFileDescriptor,
    ) -> PipelineResult<FileProductVersion> {
        let attempt = self
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(PipelineError::AttemptNotFound { id: attempt_id })?;
        let product = self
            .products
            .find_outputs_of_task(attempt.task_id)
            .await?
            .into_iter()
            .find(|p| p.directory == directory && p.filename == filename)
            .ok_or_else(|| PipelineError::ProductNotFound {
                directory: directory.to_string(),
                filename: filename.to_string(),
            })?;

        let version = self
            .products
            .register_version(product.id, attempt_id, file)
            .await?;
        // The new version is uninspected, which resets the attempt's
        // QC outcome to undecided.
        self.attempts.refresh_qc_outcome(attempt_id).await?;
        debug!(
            attempt_id,
            product_id = product.id,
            version_id = version.id,
            "registered output version"
        );
        Ok(version)
    }

    /// Publishes a metadata value on the attempt's task, where siblings
    /// and loop criteria can read it, and keeps an attempt-scoped copy
    /// for provenance.
    pub async fn record_metadata(
        &self,
        attempt_id: i64,
        item: &MetadataItem,
    ) -> PipelineResult<()> {
        let attempt = self
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(PipelineError::AttemptNotFound { id: attempt_id })?;
        self.metadata.record_attempt_metadata(attempt_id, item).await?;
        self.metadata
            .record_task_metadata(attempt.task_id, item)
            .await
    }

    pub async fn report_success(
        &self,
        attempt_id: i64,
        run_times: RunTimes,
    ) -> PipelineResult<()> {
        info!(attempt_id, "attempt succeeded");
        self.attempts.mark_succeeded(attempt_id, run_times).await
    }

    pub async fn report_failure(&self, attempt_id: i64, error_text: &str) -> PipelineResult<()> {
        warn!(attempt_id, error_text, "attempt failed");
        self.attempts.mark_failed(attempt_id, error_text).await
    }
}
