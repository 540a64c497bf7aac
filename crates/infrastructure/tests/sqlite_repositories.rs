use pipeline_domain::entities::{
    MetadataItem, MetadataRequestKind, OutputFileDescriptor, RunTimes, TASK_TYPE_CHAIN,
};
use pipeline_domain::plan::{
    ExpansionPlan, PlanParent, PlanProductRef, PlannedInput, PlannedMetadataRequest,
    PlannedProduct, PlannedTask,
};
use pipeline_domain::repositories::{
    AttemptRepository, MetadataRepository, ProductRepository, TaskRepository,
};
use pipeline_infrastructure::{
    DatabaseManager, SqliteAttemptRepository, SqliteMetadataRepository, SqliteProductRepository,
    SqliteTaskRepository,
};

struct Repos {
    _db: DatabaseManager,
    tasks: SqliteTaskRepository,
    attempts: SqliteAttemptRepository,
    products: SqliteProductRepository,
    metadata: SqliteMetadataRepository,
}

async fn repos() -> Repos {
    let db = DatabaseManager::open_in_memory().await.unwrap();
    let pool = db.pool().clone();
    Repos {
        tasks: SqliteTaskRepository::new(pool.clone()),
        attempts: SqliteAttemptRepository::new(pool.clone()),
        products: SqliteProductRepository::new(pool.clone()),
        metadata: SqliteMetadataRepository::new(pool),
        _db: db,
    }
}

fn planned_task(parent: PlanParent, task_type: &str, name: Option<&str>) -> PlannedTask {
    PlannedTask {
        parent,
        task_type: task_type.to_string(),
        name: name.map(str::to_string),
        job_name: Some("test_job".to_string()),
        working_directory: "test_dir".to_string(),
    }
}

/// Plans a two-task chain: synth writes earth.lc, search reads it.
fn two_task_plan() -> ExpansionPlan {
    let mut plan = ExpansionPlan::default();
    let chain = plan.add_task(planned_task(
        PlanParent::Existing(None),
        TASK_TYPE_CHAIN,
        None,
    ));
    let synth = plan.add_task(planned_task(
        PlanParent::Planned(chain),
        "synthesis_psls",
        Some("synth"),
    ));
    let search = plan.add_task(planned_task(
        PlanParent::Planned(chain),
        "transit_search",
        Some("search"),
    ));
    let lightcurve = plan.add_product(PlannedProduct {
        generator: synth,
        directory: "test_dir".to_string(),
        filename: "earth.lc".to_string(),
        semantic_type: "lightcurve".to_string(),
        mime_type: None,
    });
    plan.add_input(PlannedInput {
        consumer: search,
        product: PlanProductRef::Planned(lightcurve),
        semantic_type: "lightcurve".to_string(),
    });
    plan.add_metadata(synth, MetadataItem::new("duration", 730.0));
    plan.add_request(PlannedMetadataRequest {
        task: search,
        kind: MetadataRequestKind::Sibling,
        referenced: Some(pipeline_domain::plan::PlanTaskRef::Planned(synth)),
        referenced_name: "synth".to_string(),
    });
    plan
}

#[tokio::test]
async fn persist_plan_links_parents_products_and_metadata() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    assert_eq!(persisted.task_ids.len(), 3);
    assert_eq!(persisted.product_ids.len(), 1);

    let chain_id = persisted.task_ids[0];
    let synth_id = persisted.task_ids[1];
    let search_id = persisted.task_ids[2];

    let synth = r.tasks.find_by_id(synth_id).await.unwrap().unwrap();
    assert_eq!(synth.parent_id, Some(chain_id));

    let outputs = r.products.find_outputs_of_task(synth_id).await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].filename, "earth.lc");

    let inputs = r.products.find_inputs_of_task(search_id).await.unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].id, outputs[0].id);

    let consumers = r.products.find_consumer_tasks(outputs[0].id).await.unwrap();
    assert_eq!(consumers, vec![search_id]);
    let requesters = r.metadata.find_requesting_tasks(synth_id).await.unwrap();
    assert_eq!(requesters, vec![search_id]);

    let duration = r
        .metadata
        .get_task_metadata_value(synth_id, "duration")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(duration.value.as_f64(), Some(730.0));

    let requests = r.metadata.requests_for_task(search_id).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].referenced_task_id, Some(synth_id));
}

#[tokio::test]
async fn claim_is_exclusive_while_an_attempt_is_in_flight() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let synth_id = persisted.task_ids[1];

    let first = r.attempts.claim(synth_id).await.unwrap();
    assert!(first.is_some());
    let second = r.attempts.claim(synth_id).await.unwrap();
    assert!(second.is_none());

    let attempt = first.unwrap();
    assert!(r.attempts.mark_running(attempt.id, "host-a").await.unwrap());
    // Still exclusive while running.
    assert!(r.attempts.claim(synth_id).await.unwrap().is_none());

    r.attempts
        .mark_succeeded(attempt.id, RunTimes::default())
        .await
        .unwrap();
    // A finished attempt no longer blocks a new claim; the do-while
    // continuation pass relies on this.
    assert!(r.attempts.claim(synth_id).await.unwrap().is_some());
}

#[tokio::test]
async fn mark_running_requires_a_queued_attempt() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let attempt = r.attempts.claim(persisted.task_ids[1]).await.unwrap().unwrap();

    assert!(r.attempts.mark_running(attempt.id, "host-a").await.unwrap());
    // Second worker loses the pickup race.
    assert!(!r.attempts.mark_running(attempt.id, "host-b").await.unwrap());
}

#[tokio::test]
async fn qc_outcome_follows_version_flags() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let synth_id = persisted.task_ids[1];
    let product_id = persisted.product_ids[0];

    let attempt = r.attempts.claim(synth_id).await.unwrap().unwrap();
    let file = OutputFileDescriptor {
        repository_id: "repo-1".to_string(),
        checksum: Some("abc".to_string()),
        size_bytes: Some(42),
    };
    let version = r
        .products
        .register_version(product_id, attempt.id, &file)
        .await
        .unwrap();

    // Uninspected version: outcome stays undecided.
    r.attempts.refresh_qc_outcome(attempt.id).await.unwrap();
    let a = r.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert_eq!(a.all_products_passed_qc, None);

    r.products.set_version_qc(version.id, true).await.unwrap();
    r.attempts.refresh_qc_outcome(attempt.id).await.unwrap();
    let a = r.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert_eq!(a.all_products_passed_qc, Some(true));
    assert!(r.products.has_passed_version(product_id).await.unwrap());

    r.products.set_version_qc(version.id, false).await.unwrap();
    r.attempts.refresh_qc_outcome(attempt.id).await.unwrap();
    let a = r.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert_eq!(a.all_products_passed_qc, Some(false));
    assert!(!r.products.has_passed_version(product_id).await.unwrap());
}

#[tokio::test]
async fn unscheduled_query_skips_structural_and_attempted_tasks() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let synth_id = persisted.task_ids[1];
    let search_id = persisted.task_ids[2];

    let unscheduled = r.tasks.find_unscheduled_tasks(100).await.unwrap();
    let ids: Vec<i64> = unscheduled.iter().map(|i| i.task.id).collect();
    // The chain container is structural and never scheduled.
    assert_eq!(ids, vec![synth_id, search_id]);

    let attempt = r.attempts.claim(synth_id).await.unwrap().unwrap();
    let unscheduled = r.tasks.find_unscheduled_tasks(100).await.unwrap();
    let ids: Vec<i64> = unscheduled.iter().map(|i| i.task.id).collect();
    assert_eq!(ids, vec![search_id]);

    // A failed attempt puts the task back in the unscheduled set, now
    // with history for the retry policy.
    r.attempts.mark_failed(attempt.id, "worker died").await.unwrap();
    let unscheduled = r.tasks.find_unscheduled_tasks(100).await.unwrap();
    let synth_info = unscheduled
        .iter()
        .find(|i| i.task.id == synth_id)
        .expect("failed task is schedulable again");
    assert_eq!(synth_info.attempt_count, 1);
    assert!(synth_info.last_failure_at.is_some());
}

#[tokio::test]
async fn descendant_lookup_prefers_latest_match() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let chain_id = persisted.task_ids[0];
    let search_id = persisted.task_ids[2];

    let found = r
        .tasks
        .find_descendant_by_name(chain_id, "search")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, search_id);

    // A second task with the same name, planted under the chain later,
    // shadows the first.
    let mut plan = ExpansionPlan::default();
    plan.add_task(PlannedTask {
        parent: PlanParent::Existing(Some(chain_id)),
        task_type: "transit_search".to_string(),
        name: Some("search".to_string()),
        job_name: None,
        working_directory: "test_dir".to_string(),
    });
    let newer = r.tasks.persist_plan(&plan).await.unwrap();

    let found = r
        .tasks
        .find_descendant_by_name(chain_id, "search")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, newer.task_ids[0]);
}

#[tokio::test]
async fn attempt_metadata_is_scoped_and_upserted() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let attempt = r.attempts.claim(persisted.task_ids[1]).await.unwrap().unwrap();

    r.metadata
        .record_attempt_metadata(attempt.id, &MetadataItem::new("snr", 4.0))
        .await
        .unwrap();
    r.metadata
        .record_attempt_metadata(attempt.id, &MetadataItem::new("snr", 6.5))
        .await
        .unwrap();

    let items = r.metadata.get_attempt_metadata(attempt.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].value.as_f64(), Some(6.5));

    // The attempt-level copy does not leak onto the task.
    assert!(r
        .metadata
        .get_task_metadata_value(persisted.task_ids[1], "snr")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn stale_running_attempts_are_found_by_cutoff() {
    let r = repos().await;
    let persisted = r.tasks.persist_plan(&two_task_plan()).await.unwrap();
    let attempt = r.attempts.claim(persisted.task_ids[1]).await.unwrap().unwrap();
    r.attempts.mark_running(attempt.id, "host-a").await.unwrap();

    // Heartbeat is fresh, so a cutoff in the past finds nothing.
    let past = chrono::Utc::now() - chrono::Duration::seconds(60);
    assert!(r.attempts.find_stale_running(past).await.unwrap().is_empty());

    // A cutoff in the future makes the fresh heartbeat stale.
    let future = chrono::Utc::now() + chrono::Duration::seconds(60);
    let stale = r.attempts.find_stale_running(future).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, attempt.id);
}
