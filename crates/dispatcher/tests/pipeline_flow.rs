//! End-to-end scheduling flows against an in-memory store and queue,
//! with the worker and QC sides driven by hand.

use std::sync::Arc;
use std::time::Duration;

use pipeline_domain::chain::ChainDescriptor;
use pipeline_domain::entities::{
    MetadataItem, MetadataValue, OutputFileDescriptor, RunTimes, TaskContext,
    METADATA_LOOP_CLOSED, TASK_TYPE_CHAIN, TASK_TYPE_DO_WHILE_LOOP,
};
use pipeline_domain::ports::messaging::WorkQueue;
use pipeline_domain::repositories::{
    AttemptRepository, MetadataRepository, ProductRepository, TaskRepository,
};
use pipeline_dispatcher::{
    ChainExpander, HeartbeatMonitor, MetadataResolver, QcService, RetryPolicy, SchedulerConfig,
    SchedulerService, WorkerService,
};
use pipeline_infrastructure::{
    DatabaseManager, InMemoryWorkQueue, SqliteAttemptRepository, SqliteMetadataRepository,
    SqliteProductRepository, SqliteTaskRepository,
};

struct Pipeline {
    _db: DatabaseManager,
    tasks: Arc<dyn TaskRepository>,
    attempts: Arc<dyn AttemptRepository>,
    products: Arc<dyn ProductRepository>,
    metadata: Arc<dyn MetadataRepository>,
    queue: Arc<InMemoryWorkQueue>,
    scheduler: SchedulerService,
    worker: WorkerService,
    qc: QcService,
}

async fn pipeline() -> Pipeline {
    pipeline_with_retry(RetryPolicy {
        max_attempts: 3,
        base_delay_seconds: 0.0,
        max_delay_seconds: 0.0,
        jitter: 0.0,
    })
    .await
}

async fn pipeline_with_retry(retry: RetryPolicy) -> Pipeline {
    let db = DatabaseManager::open_in_memory().await.unwrap();
    let pool = db.pool().clone();
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let attempts: Arc<dyn AttemptRepository> = Arc::new(SqliteAttemptRepository::new(pool.clone()));
    let products: Arc<dyn ProductRepository> = Arc::new(SqliteProductRepository::new(pool.clone()));
    let metadata: Arc<dyn MetadataRepository> = Arc::new(SqliteMetadataRepository::new(pool));
    let queue = Arc::new(InMemoryWorkQueue::new());

    let resolver = Arc::new(MetadataResolver::new(tasks.clone(), metadata.clone()));
    let expander = Arc::new(ChainExpander::new(
        products.clone(),
        metadata.clone(),
        resolver.clone(),
    ));
    let scheduler = SchedulerService::new(
        tasks.clone(),
        attempts.clone(),
        products.clone(),
        metadata.clone(),
        queue.clone(),
        expander,
        resolver.clone(),
        retry,
        SchedulerConfig::default(),
    );
    let worker = WorkerService::new(
        tasks.clone(),
        attempts.clone(),
        products.clone(),
        metadata.clone(),
        queue.clone(),
        resolver,
    );
    let qc = QcService::new(attempts.clone(), products.clone());

    Pipeline {
        _db: db,
        tasks,
        attempts,
        products,
        metadata,
        queue,
        scheduler,
        worker,
        qc,
    }
}

async fn fetch(p: &Pipeline) -> Option<TaskContext> {
    p.worker.fetch_work(Duration::from_millis(50)).await.unwrap()
}

/// Plays a cooperative worker: records metadata, registers and passes
/// QC on every declared output, reports success and completes QC.
async fn complete_ok(p: &Pipeline, ctx: &TaskContext, metadata: &[(&str, MetadataValue)]) {
    for (keyword, value) in metadata {
        p.worker
            .record_metadata(ctx.attempt_id, &MetadataItem::new(*keyword, value.clone()))
            .await
            .unwrap();
    }
    for output in &ctx.outputs {
        let file = OutputFileDescriptor {
            repository_id: format!("repo-{}", output.id),
            checksum: Some("cafe".to_string()),
            size_bytes: Some(1),
        };
        let version = p
            .worker
            .register_output(ctx.attempt_id, &output.directory, &output.filename, &file)
            .await
            .unwrap();
        p.qc.record_version_qc(version.id, true).await.unwrap();
    }
    p.worker
        .report_success(ctx.attempt_id, RunTimes::default())
        .await
        .unwrap();
    p.qc.complete_attempt_qc(ctx.attempt_id).await.unwrap();
}

const LINEAR_CHAIN: &str = r#"{
    "job_name": "demo",
    "working_directory": "wd",
    "task_list": [
        {"task": "synthesis_psls", "name": "synth",
         "outputs": {"lightcurve": "earth.lc"},
         "duration": "(2 * constants['year'])"},
        {"task": "transit_search", "name": "search",
         "inputs": {"lightcurve": "earth.lc"},
         "outputs": {"periodogram": "pgram.dat"}}
    ]
}"#;

#[tokio::test]
async fn chain_runs_in_dependency_order() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    // Only the producer is ready at first.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 1);
    let synth = fetch(&p).await.expect("synthesis task queued");
    assert_eq!(synth.task_type, "synthesis_psls");
    // Spec expressions are resolved by the time the worker sees them.
    assert_eq!(
        synth.metadata.get("duration"),
        Some(&MetadataValue::Float(730.5))
    );

    // The consumer stays deferred until QC passes the lightcurve.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert!(stats.deferred >= 1);

    complete_ok(&p, &synth, &[]).await;
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 1);
    let search = fetch(&p).await.expect("search task queued");
    assert_eq!(search.task_type, "transit_search");
    assert_eq!(search.inputs.len(), 1);
    assert_eq!(search.inputs[0].filename, "earth.lc");
}

#[tokio::test]
async fn failed_qc_keeps_consumers_unready() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    p.scheduler.sweep_once().await.unwrap();
    let synth = fetch(&p).await.unwrap();

    // Succeeds, but its only output fails inspection.
    let file = OutputFileDescriptor {
        repository_id: "repo-x".to_string(),
        checksum: None,
        size_bytes: Some(1),
    };
    let version = p
        .worker
        .register_output(synth.attempt_id, "wd", "earth.lc", &file)
        .await
        .unwrap();
    p.worker
        .report_success(synth.attempt_id, RunTimes::default())
        .await
        .unwrap();
    p.qc.record_version_qc(version.id, false).await.unwrap();
    p.qc.complete_attempt_qc(synth.attempt_id).await.unwrap();

    let attempt = p.attempts.find_by_id(synth.attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.all_products_passed_qc, Some(false));

    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert!(fetch(&p).await.is_none());
}

#[tokio::test]
async fn at_most_one_attempt_in_flight() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    let first = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(first.queued, 1);
    // Sweeping again must not double-queue the same task.
    let second = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(second.queued, 0);
    assert_eq!(p.queue.pending().await.unwrap(), 1);
}

#[tokio::test]
async fn rejected_submission_persists_nothing() {
    let p = pipeline().await;
    // The input filename matches no declared output.
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "transit_search", "inputs": {"lightcurve": "missing.lc"}}
        ]}"#,
    )
    .unwrap();
    let err = p.scheduler.submit(&descriptor).await.unwrap_err();
    assert!(err.is_submission_error());
    assert_eq!(p.tasks.count_all().await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_output_locations_are_rejected() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "synthesis_psls", "outputs": {"lightcurve": "earth.lc"}},
            {"task": "synthesis_batman", "outputs": {"lightcurve": "earth.lc"}}
        ]}"#,
    )
    .unwrap();
    let err = p.scheduler.submit(&descriptor).await.unwrap_err();
    assert!(err.is_submission_error());
    assert_eq!(p.tasks.count_all().await.unwrap(), 0);
}

#[tokio::test]
async fn for_loop_expands_every_iteration_with_bindings() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "execution_for_loop", "parameter": "size",
             "linear_range": [1, 3, 3],
             "task_list": [
                {"task": "synthesis_psls",
                 "outputs": {"lightcurve": "(format('earth_{}.lc', metadata['size_index']))"}}
             ]}
        ]}"#,
    )
    .unwrap();
    let persisted = p.scheduler.submit(&descriptor).await.unwrap();
    // Root chain + loop container + 3 * (iteration container + leaf).
    assert_eq!(persisted.task_ids.len(), 8);
    assert_eq!(persisted.product_ids.len(), 3);

    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 3);

    let mut filenames = Vec::new();
    let mut sizes = Vec::new();
    for _ in 0..3 {
        let ctx = fetch(&p).await.unwrap();
        filenames.push(ctx.outputs[0].filename.clone());
        sizes.push(ctx.metadata.get("size").cloned().unwrap());
    }
    filenames.sort();
    assert_eq!(filenames, vec!["earth_0.lc", "earth_1.lc", "earth_2.lc"]);
    assert!(sizes.contains(&MetadataValue::Float(1.0)));
    assert!(sizes.contains(&MetadataValue::Float(2.0)));
    assert!(sizes.contains(&MetadataValue::Float(3.0)));
}

async fn run_conditional(snr: f64) -> (Pipeline, Vec<String>) {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "transit_search", "name": "search",
             "outputs": {"periodogram": "pgram.dat"}},
            {"task": "execution_conditional",
             "criterion": "(requested_metadata['search']['snr'] > 5)",
             "requires_metadata_from": ["search"],
             "task_list": [{"task": "vetting", "inputs": {"periodogram": "pgram.dat"}}],
             "task_list_else": [{"task": "discard"}]}
        ]}"#,
    )
    .unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    p.scheduler.sweep_once().await.unwrap();
    let search = fetch(&p).await.unwrap();
    complete_ok(&p, &search, &[("snr", MetadataValue::Float(snr))]).await;

    // One sweep expands the conditional, the next queues the branch.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.expanded, 1);
    p.scheduler.sweep_once().await.unwrap();

    let mut queued_types = Vec::new();
    while let Some(ctx) = fetch(&p).await {
        queued_types.push(ctx.task_type.clone());
        complete_ok(&p, &ctx, &[]).await;
    }
    (p, queued_types)
}

#[tokio::test]
async fn conditional_takes_main_branch_when_criterion_holds() {
    let (_p, queued) = run_conditional(7.5).await;
    assert_eq!(queued, vec!["vetting"]);
}

#[tokio::test]
async fn conditional_takes_else_branch_when_criterion_fails() {
    let (_p, queued) = run_conditional(2.0).await;
    assert_eq!(queued, vec!["discard"]);
}

#[tokio::test]
async fn do_while_repeats_until_criterion_clears() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "execution_do_while_loop", "name": "refine",
             "iteration_name": "pass",
             "repeat_criterion": "(requested_metadata['verify']['done'] < 1)",
             "requires_metadata_from_child": ["verify"],
             "task_list": [{"task": "verify", "name": "verify"}]}
        ]}"#,
    )
    .unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    // First sweep expands iteration one, second queues its leaf.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.expanded, 1);
    p.scheduler.sweep_once().await.unwrap();
    let verify = fetch(&p).await.expect("first iteration leaf");
    // Iterations count from one.
    assert_eq!(
        verify.metadata.get("pass_index"),
        Some(&MetadataValue::Float(1.0))
    );
    complete_ok(&p, &verify, &[("done", MetadataValue::Float(0.0))]).await;

    // Not done yet: the loop starts a second iteration.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.continued, 1);
    assert_eq!(stats.closed, 0);
    p.scheduler.sweep_once().await.unwrap();
    let verify = fetch(&p).await.expect("second iteration leaf");
    assert_eq!(
        verify.metadata.get("pass_index"),
        Some(&MetadataValue::Float(2.0))
    );
    complete_ok(&p, &verify, &[("done", MetadataValue::Float(1.0))]).await;

    // Done: the loop closes instead of iterating.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.continued, 0);
    assert_eq!(stats.closed, 1);

    let container = p
        .tasks
        .find_by_type(TASK_TYPE_DO_WHILE_LOOP)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert!(p
        .metadata
        .get_task_metadata_value(container.id, METADATA_LOOP_CLOSED)
        .await
        .unwrap()
        .is_some());
    // Two iteration containers under the loop.
    let children = p.tasks.find_children(container.id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.task_type == TASK_TYPE_CHAIN));
}

#[tokio::test]
async fn broken_repeat_criterion_does_not_starve_other_loops() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(
        r#"{"working_directory": "wd", "task_list": [
            {"task": "execution_do_while_loop", "name": "bad",
             "iteration_name": "pass",
             "repeat_criterion": "(requested_metadata['check']['nope'] < 1)",
             "requires_metadata_from_child": ["check"],
             "task_list": [{"task": "check", "name": "check"}]},
            {"task": "execution_do_while_loop", "name": "good",
             "iteration_name": "pass",
             "repeat_criterion": "(requested_metadata['verify']['done'] < 1)",
             "requires_metadata_from_child": ["verify"],
             "task_list": [{"task": "verify", "name": "verify"}]}
        ]}"#,
    )
    .unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    // Both first iterations expand, then their leaves run. The bad
    // loop's child never records the key its criterion reads.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.expanded, 2);
    p.scheduler.sweep_once().await.unwrap();
    for _ in 0..2 {
        let ctx = fetch(&p).await.unwrap();
        if ctx.task_type == "verify" {
            complete_ok(&p, &ctx, &[("done", MetadataValue::Float(1.0))]).await;
        } else {
            complete_ok(&p, &ctx, &[("found", MetadataValue::Float(0.0))]).await;
        }
    }

    // The bad criterion cannot evaluate; the sweep still closes the
    // healthy loop instead of erroring out.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.continued, 0);

    let bad = p
        .tasks
        .find_by_type(TASK_TYPE_DO_WHILE_LOOP)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name.as_deref() == Some("bad"))
        .unwrap();
    let last = p.attempts.find_for_task(bad.id).await.unwrap().pop().unwrap();
    assert!(last.error_fail);
    assert!(last.error_text.as_deref().unwrap_or("").contains("nope"));

    // Zero backoff: each sweep burns one retry until the cap blocks
    // the loop and surfaces it to operators.
    p.scheduler.sweep_once().await.unwrap();
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.blocked, 1);
    let blocked = p.scheduler.blocked_tasks().await.unwrap();
    assert!(blocked.iter().any(|r| r.task.id == bad.id));
}

#[tokio::test]
async fn lost_heartbeat_fails_and_reschedules_the_attempt() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    p.scheduler.sweep_once().await.unwrap();
    let synth = fetch(&p).await.unwrap();

    // Worker goes silent; a zero-tolerance monitor declares it dead.
    let monitor = HeartbeatMonitor::new(
        p.attempts.clone(),
        Duration::ZERO,
        Duration::from_secs(3600),
        Duration::from_millis(10),
    );
    let failed = monitor.check_once().await.unwrap();
    assert_eq!(failed, 1);
    let attempt = p.attempts.find_by_id(synth.attempt_id).await.unwrap().unwrap();
    assert!(attempt.error_fail);

    // Retry backoff is zero, so the task is rescheduled immediately.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 1);
    let retry = fetch(&p).await.unwrap();
    assert_eq!(retry.task_id, synth.task_id);
    assert_ne!(retry.attempt_id, synth.attempt_id);
}

#[tokio::test]
async fn exhausted_retries_block_the_task() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();

    for _ in 0..3 {
        p.scheduler.sweep_once().await.unwrap();
        let ctx = fetch(&p).await.expect("attempt queued");
        p.worker
            .report_failure(ctx.attempt_id, "synthetic failure")
            .await
            .unwrap();
    }

    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.blocked, 1);
    // Further sweeps keep counting it without rescheduling.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.blocked, 1);

    let blocked = p.scheduler.blocked_tasks().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].task.task_type, "synthesis_psls");
    assert_eq!(blocked[0].attempt_count, 3);
    // The consumer it wedges is reported alongside.
    assert_eq!(blocked[0].dependents.len(), 1);
    assert_eq!(blocked[0].dependents[0].task_type, "transit_search");
}

#[tokio::test]
async fn stale_queued_attempt_is_failed_and_rescheduled() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();
    p.scheduler.sweep_once().await.unwrap();

    // The queue message is lost: nobody fetches. A zero-tolerance
    // monitor expires the queued attempt.
    let monitor = HeartbeatMonitor::new(
        p.attempts.clone(),
        Duration::from_secs(3600),
        Duration::ZERO,
        Duration::from_millis(10),
    );
    assert_eq!(monitor.check_once().await.unwrap(), 1);

    // The next sweep claims and publishes a fresh attempt.
    let stats = p.scheduler.sweep_once().await.unwrap();
    assert_eq!(stats.queued, 1);
}

#[tokio::test]
async fn heartbeat_keeps_attempt_alive() {
    let p = pipeline().await;
    let descriptor = ChainDescriptor::from_json(LINEAR_CHAIN).unwrap();
    p.scheduler.submit(&descriptor).await.unwrap();
    p.scheduler.sweep_once().await.unwrap();
    let synth = fetch(&p).await.unwrap();

    p.worker.record_heartbeat(synth.attempt_id).await.unwrap();
    let monitor = HeartbeatMonitor::new(
        p.attempts.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_millis(10),
    );
    assert_eq!(monitor.check_once().await.unwrap(), 0);
}
