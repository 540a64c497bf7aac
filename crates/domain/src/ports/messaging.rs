//! Work-queue port.
//!
//! Queue messages are bare attempt ids; everything else a worker needs
//! is looked up in the task graph store. Keeping messages minimal
//! makes requeueing after a crash safe and idempotent.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::PipelineResult;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues an attempt id for pickup by a worker.
    async fn publish(&self, attempt_id: i64) -> PipelineResult<()>;

    /// Waits up to `timeout` for the next attempt id. `None` means the
    /// queue stayed empty.
    async fn receive(&self, timeout: Duration) -> PipelineResult<Option<i64>>;

    async fn pending(&self) -> PipelineResult<usize>;

    /// Drains the queue, returning the number of discarded messages.
    async fn purge(&self) -> PipelineResult<usize>;
}
