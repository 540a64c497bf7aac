//! The scheduling sweep.
//!
//! Each sweep finds tasks whose dependencies are satisfied, claims an
//! attempt for them and either hands them to workers (leaf tasks) or
//! expands them inline (conditionals and do-while iterations). A
//! second pass drives do-while continuation decisions for loops whose
//! current iteration has settled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use pipeline_domain::chain::ChainDescriptor;
use pipeline_domain::entities::{
    AttemptStatus, RunTimes, SchedulingAttempt, Task, TaskSchedulingInfo, TaskState,
    TASK_TYPE_CONDITIONAL, TASK_TYPE_DO_WHILE_LOOP,
};
use pipeline_domain::ports::messaging::WorkQueue;
use pipeline_domain::repositories::{
    AttemptRepository, MetadataRepository, PersistedPlan, ProductRepository, TaskRepository,
};
use pipeline_domain::{PipelineError, PipelineResult};

use crate::context::MetadataResolver;
use crate::expander::ChainExpander;
use crate::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval: Duration,
    /// Upper bound on candidates examined per sweep.
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            batch_size: 200,
        }
    }
}

/// What one sweep did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Leaf attempts published to the work queue.
    pub queued: usize,
    /// Conditional and do-while containers expanded.
    pub expanded: usize,
    /// Do-while loops that started another iteration.
    pub continued: usize,
    /// Do-while loops closed this sweep.
    pub closed: usize,
    /// Tasks whose retry cap is exhausted.
    pub blocked: usize,
    /// Tasks waiting on dependencies or backoff.
    pub deferred: usize,
}

/// A task past its retry cap, with the downstream tasks it wedges.
#[derive(Debug, Clone)]
pub struct BlockedTaskReport {
    pub task: Task,
    pub attempt_count: i64,
    /// Transitive consumers that cannot run while this task stays
    /// blocked.
    pub dependents: Vec<Task>,
}

pub struct SchedulerService {
    tasks: Arc<dyn TaskRepository>,
    attempts: Arc<dyn AttemptRepository>,
    products: Arc<dyn ProductRepository>,
    metadata: Arc<dyn MetadataRepository>,
    queue: Arc<dyn WorkQueue>,
    expander: Arc<ChainExpander>,
    resolver: Arc<MetadataResolver>,
    retry: RetryPolicy,
    config: SchedulerConfig,
    running: Arc<RwLock<bool>>,
    /// Tasks already warned about as blocked, so the transition is
    /// logged once instead of on every sweep.
    warned_blocked: Mutex<HashSet<i64>>,
}

impl SchedulerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        attempts: Arc<dyn AttemptRepository>,
        products: Arc<dyn ProductRepository>,
        metadata: Arc<dyn MetadataRepository>,
        queue: Arc<dyn WorkQueue>,
        expander: Arc<ChainExpander>,
        resolver: Arc<MetadataResolver>,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            attempts,
            products,
            metadata,
            queue,
            expander,
            resolver,
            retry,
            config,
            running: Arc::new(RwLock::new(false)),
            warned_blocked: Mutex::new(HashSet::new()),
        }
    }

    /// Validates, plans and atomically persists a chain submission.
    pub async fn submit(&self, descriptor: &ChainDescriptor) -> PipelineResult<PersistedPlan> {
        let plan = self.expander.plan_submission(descriptor).await?;
        let persisted = self.tasks.persist_plan(&plan).await?;
        info!(
            root_task = persisted.task_ids.first().copied().unwrap_or(-1),
            tasks = persisted.task_ids.len(),
            products = persisted.product_ids.len(),
            "chain submitted"
        );
        Ok(persisted)
    }

    pub async fn run(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("scheduler is already running");
                return;
            }
            *running = true;
        }
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "scheduler started"
        );

        while *self.running.read().await {
            match self.sweep_once().await {
                Ok(stats) if stats != SweepStats::default() => {
                    debug!(?stats, "sweep finished");
                }
                Ok(_) => {}
                Err(e) => error!("scheduler sweep failed: {}", e),
            }
            tokio::time::sleep(self.config.sweep_interval).await;
        }
        info!("scheduler stopped");
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn sweep_once(&self) -> PipelineResult<SweepStats> {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        let candidates = self
            .tasks
            .find_unscheduled_tasks(self.config.batch_size)
            .await?;
        for info in &candidates {
            match self.retry.decide(info, now) {
                RetryDecision::Blocked => {
                    self.note_blocked(info).await;
                    stats.blocked += 1;
                    continue;
                }
                RetryDecision::Wait(until) => {
                    debug!(task_id = info.task.id, until = %until, "task in retry backoff");
                    stats.deferred += 1;
                    continue;
                }
                RetryDecision::Ready => {}
            }

            if !self.dependencies_ready(&info.task).await? {
                stats.deferred += 1;
                continue;
            }

            let attempt = match self.attempts.claim(info.task.id).await? {
                Some(attempt) => attempt,
                // Another scheduler instance got there first.
                None => continue,
            };

            match info.task.task_type.as_str() {
                TASK_TYPE_CONDITIONAL => {
                    self.run_expansion(&info.task, &attempt, ExpansionKind::Conditional)
                        .await?;
                    stats.expanded += 1;
                }
                TASK_TYPE_DO_WHILE_LOOP => {
                    self.run_expansion(&info.task, &attempt, ExpansionKind::DoWhileIteration)
                        .await?;
                    stats.expanded += 1;
                }
                _ => {
                    if let Err(e) = self.queue.publish(attempt.id).await {
                        error!(attempt_id = attempt.id, "failed to enqueue attempt: {}", e);
                        self.attempts
                            .mark_failed(attempt.id, &format!("enqueue failed: {e}"))
                            .await?;
                        continue;
                    }
                    debug!(
                        task_id = info.task.id,
                        attempt_id = attempt.id,
                        task_type = %info.task.task_type,
                        "queued leaf task"
                    );
                    stats.queued += 1;
                }
            }
        }

        self.sweep_do_while_continuations(&mut stats).await?;
        Ok(stats)
    }

    /// Derives the current state of a task from its attempt history
    /// and dependency situation. Never stored, always recomputed.
    pub async fn task_state(&self, task_id: i64) -> PipelineResult<TaskState> {
        let task = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound { id: task_id })?;
        let attempts = self.attempts.find_for_task(task_id).await?;
        match attempts.last().map(|a| a.status) {
            Some(AttemptStatus::Queued) => Ok(TaskState::Queued),
            Some(AttemptStatus::Running) => Ok(TaskState::Running),
            Some(AttemptStatus::Succeeded) => Ok(TaskState::Succeeded),
            Some(AttemptStatus::Failed) => {
                if attempts.len() as i64 >= self.retry.max_attempts {
                    Ok(TaskState::Blocked)
                } else {
                    Ok(TaskState::Failed)
                }
            }
            None => {
                if self.dependencies_ready(&task).await? {
                    Ok(TaskState::Ready)
                } else {
                    Ok(TaskState::Pending)
                }
            }
        }
    }

    /// Tasks whose retry cap is exhausted, each with the downstream
    /// tasks it wedges, for operator inspection.
    pub async fn blocked_tasks(&self) -> PipelineResult<Vec<BlockedTaskReport>> {
        let now = Utc::now();
        let mut reports = Vec::new();
        for info in self
            .tasks
            .find_unscheduled_tasks(self.config.batch_size)
            .await?
        {
            if self.retry.decide(&info, now) != RetryDecision::Blocked {
                continue;
            }
            let dependents = self.downstream_of(info.task.id).await?;
            reports.push(BlockedTaskReport {
                task: info.task,
                attempt_count: info.attempt_count,
                dependents,
            });
        }
        // Do-while containers leave the unscheduled set once their
        // first expansion succeeds, so capped continuation decisions
        // are surfaced separately.
        let already_reported: HashSet<i64> = reports.iter().map(|r| r.task.id).collect();
        for task in self.tasks.find_by_type(TASK_TYPE_DO_WHILE_LOOP).await? {
            if already_reported.contains(&task.id) || self.expander.is_loop_closed(&task).await? {
                continue;
            }
            let attempts = self.attempts.find_for_task(task.id).await?;
            let capped = attempts
                .last()
                .map(|a| a.status == AttemptStatus::Failed)
                .unwrap_or(false)
                && attempts.len() as i64 >= self.retry.max_attempts;
            if !capped {
                continue;
            }
            let dependents = self.downstream_of(task.id).await?;
            reports.push(BlockedTaskReport {
                task,
                attempt_count: attempts.len() as i64,
                dependents,
            });
        }
        Ok(reports)
    }

    /// Transitive downstream consumers of a task, through product
    /// inputs and sibling metadata requests.
    async fn downstream_of(&self, task_id: i64) -> PipelineResult<Vec<Task>> {
        let mut seen = HashSet::from([task_id]);
        let mut frontier = vec![task_id];
        let mut dependents = Vec::new();
        while let Some(current) = frontier.pop() {
            let mut next = Vec::new();
            for product in self.products.find_outputs_of_task(current).await? {
                next.extend(self.products.find_consumer_tasks(product.id).await?);
            }
            next.extend(self.metadata.find_requesting_tasks(current).await?);
            for id in next {
                if !seen.insert(id) {
                    continue;
                }
                if let Some(task) = self.tasks.find_by_id(id).await? {
                    frontier.push(id);
                    dependents.push(task);
                }
            }
        }
        dependents.sort_by_key(|t| t.id);
        Ok(dependents)
    }

    /// Logs the blocked transition once per task; repeat sightings
    /// drop to debug.
    async fn note_blocked(&self, info: &TaskSchedulingInfo) {
        let mut warned = self.warned_blocked.lock().await;
        if warned.insert(info.task.id) {
            warn!(
                task_id = info.task.id,
                task_type = %info.task.task_type,
                attempts = info.attempt_count,
                "task is blocked: retry cap exhausted"
            );
        } else {
            debug!(task_id = info.task.id, "task remains blocked");
        }
    }

    /// Runs an inline expansion under a claimed attempt. Expansion
    /// failures fail the attempt and flow into the retry policy.
    async fn run_expansion(
        &self,
        task: &Task,
        attempt: &SchedulingAttempt,
        kind: ExpansionKind,
    ) -> PipelineResult<()> {
        let outcome = match kind {
            ExpansionKind::Conditional => self.expander.expand_conditional(task).await,
            ExpansionKind::DoWhileIteration => self.expander.expand_do_while_iteration(task).await,
        };
        let plan = match outcome {
            Ok(plan) => plan,
            Err(e) if e.is_submission_error() => {
                error!(task_id = task.id, "expansion failed: {}", e);
                self.attempts.mark_failed(attempt.id, &e.to_string()).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.tasks.persist_plan(&plan).await?;
        self.attempts
            .mark_succeeded(attempt.id, RunTimes::default())
            .await?;
        // Expansion attempts have no file outputs, so QC has nothing
        // to inspect.
        self.attempts.mark_qc_complete(attempt.id).await?;
        Ok(())
    }

    async fn sweep_do_while_continuations(&self, stats: &mut SweepStats) -> PipelineResult<()> {
        let now = Utc::now();
        for task in self.tasks.find_by_type(TASK_TYPE_DO_WHILE_LOOP).await? {
            if self.expander.is_loop_closed(&task).await? {
                continue;
            }
            let attempts = self.attempts.find_for_task(task.id).await?;
            let latest = match attempts.last() {
                // Never expanded: the main pass handles the first
                // iteration.
                None => continue,
                Some(latest) => latest,
            };
            if latest.is_in_flight() {
                continue;
            }
            if !latest.is_successful() {
                // A failed continuation decision retries under the
                // same backoff and cap as any other task.
                let info = TaskSchedulingInfo {
                    task: task.clone(),
                    attempt_count: attempts.len() as i64,
                    last_failure_at: latest.ended_at,
                };
                match self.retry.decide(&info, now) {
                    RetryDecision::Blocked => {
                        self.note_blocked(&info).await;
                        stats.blocked += 1;
                        continue;
                    }
                    RetryDecision::Wait(_) => {
                        stats.deferred += 1;
                        continue;
                    }
                    RetryDecision::Ready => {}
                }
            }
            if !self.subtree_settled(task.id).await? {
                continue;
            }

            // A criterion that cannot evaluate fails this loop's
            // attempt but must not abort the sweep for other loops.
            match self.expander.should_repeat(&task).await {
                Ok(true) => {
                    let attempt = match self.attempts.claim(task.id).await? {
                        Some(attempt) => attempt,
                        None => continue,
                    };
                    self.run_expansion(&task, &attempt, ExpansionKind::DoWhileIteration)
                        .await?;
                    stats.continued += 1;
                }
                Ok(false) => {
                    self.expander.close_loop(&task).await?;
                    stats.closed += 1;
                }
                Err(e) if e.is_submission_error() => {
                    error!(task_id = task.id, "repeat criterion evaluation failed: {}", e);
                    if let Some(attempt) = self.attempts.claim(task.id).await? {
                        self.attempts.mark_failed(attempt.id, &e.to_string()).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// All gates a task must pass before an attempt is claimed: every
    /// input product has a QC-passed version and every requested
    /// sibling has finished.
    async fn dependencies_ready(&self, task: &Task) -> PipelineResult<bool> {
        for product in self.products.find_inputs_of_task(task.id).await? {
            if !self.products.has_passed_version(product.id).await? {
                return Ok(false);
            }
        }
        for request in self.metadata.requests_for_task(task.id).await? {
            if request.kind != pipeline_domain::MetadataRequestKind::Sibling {
                // Child requests only gate continuation decisions.
                continue;
            }
            let target = match self.resolver.resolve_target(task, &request).await? {
                Some(target) => target,
                None => return Ok(false),
            };
            if !self.ready_as_dependency(&target).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether a dependency target counts as finished for downstream
    /// consumers.
    fn ready_as_dependency<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, PipelineResult<bool>> {
        async move {
            if task.is_structural() {
                return self.subtree_settled(task.id).await;
            }
            if task.task_type == TASK_TYPE_DO_WHILE_LOOP
                && !self.expander.is_loop_closed(task).await?
            {
                return Ok(false);
            }
            let attempts = self.attempts.find_for_task(task.id).await?;
            let usable = attempts
                .last()
                .map(SchedulingAttempt::is_usable_downstream)
                .unwrap_or(false);
            if !usable {
                return Ok(false);
            }
            if task.is_container() {
                // Containers are only done once everything they
                // expanded into is done too.
                return self.subtree_settled(task.id).await;
            }
            Ok(true)
        }
        .boxed()
    }

    /// True when every task in the subtree has finished successfully
    /// with QC cleared.
    fn subtree_settled(&self, task_id: i64) -> BoxFuture<'_, PipelineResult<bool>> {
        async move {
            for child in self.tasks.find_children(task_id).await? {
                if !self.ready_as_dependency(&child).await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }
}

#[derive(Clone, Copy)]
enum ExpansionKind {
    Conditional,
    DoWhileIteration,
}
