use cascade::failpoints::{COPY_AFTER_BULK_COPY, WORKER_BEFORE_COMMIT};
use cascade::test_utils::event::{row, row_events_for};
use cascade::test_utils::failpoints::CascadeFailScenario;
use cascade::test_utils::{TEST_QUEUE, TestCluster, test_admin_config, worker_name};
use cascade::types::ChangeOp;
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";

/// Root and branch replicating [`ITEMS`], with the branch copy finished.
async fn synced_branch(dir: &TempDir) -> TestCluster {
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    test_cluster
}

async fn insert_unkeyed(test_cluster: &TestCluster, id: &str) {
    test_cluster
        .cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &[],
            row(&[("id", id), ("val", "v")]),
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_failing_before_commit_is_replayed_once() {
    init_test_tracing();
    let mut scenario = CascadeFailScenario::setup(&[]);
    let dir = TempDir::new().unwrap();
    let test_cluster = synced_branch(&dir).await;

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    ticker.stop().await;

    scenario.configure(WORKER_BEFORE_COMMIT, "1*return(timed_retry)");
    insert_unkeyed(&test_cluster, "1").await;
    insert_unkeyed(&test_cluster, "2").await;
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    let cluster = &test_cluster.cluster;
    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "v")]), row(&[("id", "2"), ("val", "v")])]
    );
    let events = cluster.queue_events("branch", TEST_QUEUE).await.unwrap();
    assert_eq!(row_events_for(&events, ITEMS).len(), 2);

    let state = cluster
        .consumer_state("branch", TEST_QUEUE, &worker_name("branch"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.error, None);

    branch_worker.stop().await.unwrap();
    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_stopped_before_commit_resumes_after_restart() {
    init_test_tracing();
    let mut scenario = CascadeFailScenario::setup(&[]);
    let dir = TempDir::new().unwrap();
    let test_cluster = synced_branch(&dir).await;

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    ticker.stop().await;

    scenario.configure(WORKER_BEFORE_COMMIT, "1*return(no_retry)");
    insert_unkeyed(&test_cluster, "1").await;
    let tick_id = test_cluster.tick("root").await.unwrap();

    assert!(branch_worker.join().await.is_err());
    let cluster = &test_cluster.cluster;
    let state = cluster
        .consumer_state("branch", TEST_QUEUE, &worker_name("branch"))
        .await
        .unwrap()
        .unwrap();
    assert!(state.completed_tick < tick_id);
    assert!(state.error.is_some());
    assert!(cluster.rows("branch", ITEMS).await.unwrap().is_empty());

    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_completed("branch", tick_id).await.unwrap();
    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "v")])]
    );

    branch_worker.stop().await.unwrap();
    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_failing_after_bulk_load_is_redone() {
    init_test_tracing();
    let scenario = CascadeFailScenario::setup(&[(COPY_AFTER_BULK_COPY, "1*return(timed_retry)")]);
    let dir = TempDir::new().unwrap();
    let test_cluster = synced_branch(&dir).await;
    insert_unkeyed(&test_cluster, "1").await;

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    assert_eq!(
        test_cluster.cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "v")])]
    );

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
    scenario.teardown();
}
