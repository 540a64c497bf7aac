//! Tokio-channel work queue for single-process deployments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use pipeline_domain::ports::messaging::WorkQueue;
use pipeline_domain::{PipelineError, PipelineResult};

#[derive(Debug)]
pub struct InMemoryWorkQueue {
    sender: mpsc::UnboundedSender<i64>,
    // Mutex-wrapped so several worker loops can share one consumer.
    receiver: Mutex<mpsc::UnboundedReceiver<i64>>,
    size: AtomicUsize,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            size: AtomicUsize::new(0),
        }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn publish(&self, attempt_id: i64) -> PipelineResult<()> {
        self.sender
            .send(attempt_id)
            .map_err(|e| PipelineError::queue(format!("queue closed: {e}")))?;
        self.size.fetch_add(1, Ordering::SeqCst);
        debug!(attempt_id, "published attempt to work queue");
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> PipelineResult<Option<i64>> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(attempt_id)) => {
                self.size.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(attempt_id))
            }
            Ok(None) => Err(PipelineError::queue("queue closed")),
            Err(_) => Ok(None),
        }
    }

    async fn pending(&self) -> PipelineResult<usize> {
        Ok(self.size.load(Ordering::SeqCst))
    }

    async fn purge(&self) -> PipelineResult<usize> {
        let mut receiver = self.receiver.lock().await;
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        self.size.fetch_sub(discarded, Ordering::SeqCst);
        debug!(discarded, "purged work queue");
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive_in_order() {
        let queue = InMemoryWorkQueue::new();
        queue.publish(11).await.unwrap();
        queue.publish(22).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 2);

        let first = queue.receive(Duration::from_millis(50)).await.unwrap();
        let second = queue.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first, Some(11));
        assert_eq!(second, Some(22));
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let queue = InMemoryWorkQueue::new();
        let none = queue.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn purge_drains_everything() {
        let queue = InMemoryWorkQueue::new();
        for id in 0..5 {
            queue.publish(id).await.unwrap();
        }
        assert_eq!(queue.purge().await.unwrap(), 5);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
