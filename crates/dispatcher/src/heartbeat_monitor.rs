//! Liveness monitoring for running attempts.
//!
//! Workers heartbeat while executing. When a heartbeat goes stale the
//! attempt is failed so the retry policy can reschedule the task on
//! another worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use pipeline_domain::repositories::AttemptRepository;
use pipeline_domain::PipelineResult;

pub struct HeartbeatMonitor {
    attempts: Arc<dyn AttemptRepository>,
    /// A RUNNING attempt with no heartbeat for this long is presumed
    /// dead.
    heartbeat_timeout: Duration,
    /// A QUEUED attempt older than this was lost on the queue and is
    /// failed so the scheduler re-publishes it.
    queued_timeout: Duration,
    check_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl HeartbeatMonitor {
    pub fn new(
        attempts: Arc<dyn AttemptRepository>,
        heartbeat_timeout: Duration,
        queued_timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            attempts,
            heartbeat_timeout,
            queued_timeout,
            check_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("heartbeat monitor is already running");
                return;
            }
            *running = true;
        }
        info!(
            timeout_secs = self.heartbeat_timeout.as_secs(),
            "heartbeat monitor started"
        );

        while *self.running.read().await {
            if let Err(e) = self.check_once().await {
                error!("heartbeat check failed: {}", e);
            }
            tokio::time::sleep(self.check_interval).await;
        }
        info!("heartbeat monitor stopped");
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// One sweep over in-flight attempts; returns how many were failed
    /// as lost.
    pub async fn check_once(&self) -> PipelineResult<usize> {
        let mut failed = 0;

        let timeout =
            ChronoDuration::from_std(self.heartbeat_timeout).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now() - timeout;
        for attempt in self.attempts.find_stale_running(cutoff).await? {
            let since = attempt
                .latest_heartbeat
                .or(attempt.started_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            warn!(
                attempt_id = attempt.id,
                task_id = attempt.task_id,
                host = attempt.host.as_deref().unwrap_or("unknown"),
                last_heartbeat = %since,
                "failing attempt with stale heartbeat"
            );
            self.attempts
                .mark_failed(
                    attempt.id,
                    &format!("worker heartbeat lost (last seen {since})"),
                )
                .await?;
            failed += 1;
        }

        let queued_timeout =
            ChronoDuration::from_std(self.queued_timeout).unwrap_or(ChronoDuration::MAX);
        let queued_cutoff = Utc::now() - queued_timeout;
        for attempt in self.attempts.find_stale_queued(queued_cutoff).await? {
            warn!(
                attempt_id = attempt.id,
                task_id = attempt.task_id,
                queued_at = %attempt.queued_at.to_rfc3339(),
                "failing attempt that was never picked up"
            );
            self.attempts
                .mark_failed(
                    attempt.id,
                    &format!("never picked up (queued {})", attempt.queued_at.to_rfc3339()),
                )
                .await?;
            failed += 1;
        }

        if failed == 0 {
            debug!("no stale attempts");
        }
        Ok(failed)
    }
}
