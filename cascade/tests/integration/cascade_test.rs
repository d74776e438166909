use cascade::node::base::{NodeConnector, NodeRpc};
use cascade::queue::base::BatchSource;
use cascade::test_utils::event::{event_ids, row, row_events_for};
use cascade::test_utils::{
    TEST_QUEUE, TestCluster, spawn_worker, test_admin_config, test_worker_config, wait_until,
    worker_name,
};
use cascade::types::{ChangeOp, FetchMode, SYNC_WATERMARK_ATTR};
use cascade_config::shared::WorkerRole;
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";

async fn insert(test_cluster: &TestCluster, node: &str, pkeys: &[&str], id: &str, val: &str) {
    test_cluster
        .cluster
        .source_change(
            node,
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            pkeys,
            row(&[("id", id), ("val", val)]),
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn events_flow_down_a_three_level_cascade() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.add_leaf("leaf", "branch").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch", "leaf"])
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let root_worker = test_cluster.spawn_worker("root");
    let branch_worker = test_cluster.spawn_worker("branch");
    let leaf_worker = test_cluster.spawn_worker("leaf");
    test_cluster.wait_table_ok("leaf", ITEMS).await.unwrap();

    for id in ["1", "2", "3"] {
        insert(&test_cluster, "root", &["id"], id, "v").await;
    }
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();

    let cluster = &test_cluster.cluster;
    let root_rows = cluster.rows("root", ITEMS).await.unwrap();
    assert_eq!(root_rows.len(), 3);
    assert_eq!(cluster.rows("branch", ITEMS).await.unwrap(), root_rows);
    assert_eq!(cluster.rows("leaf", ITEMS).await.unwrap(), root_rows);

    // The branch re-publishes the root's events under their original ids.
    let root_events = cluster.queue_events("root", TEST_QUEUE).await.unwrap();
    let branch_events = cluster.queue_events("branch", TEST_QUEUE).await.unwrap();
    let root_ids = event_ids(row_events_for(&root_events, ITEMS));
    let branch_ids = event_ids(row_events_for(&branch_events, ITEMS));
    assert_eq!(root_ids.len(), 3);
    assert_eq!(root_ids, branch_ids);

    leaf_worker.stop().await.unwrap();
    branch_worker.stop().await.unwrap();
    root_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_commit_is_retried_without_duplicates() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    ticker.stop().await;

    let cluster = &test_cluster.cluster;
    cluster.fail_next_commits("branch", 1).await.unwrap();
    insert(&test_cluster, "root", &[], "1", "a").await;
    insert(&test_cluster, "root", &[], "2", "b").await;
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "a")]), row(&[("id", "2"), ("val", "b")])]
    );
    let branch_events = cluster.queue_events("branch", TEST_QUEUE).await.unwrap();
    assert_eq!(row_events_for(&branch_events, ITEMS).len(), 2);

    let state = cluster
        .consumer_state("branch", TEST_QUEUE, &worker_name("branch"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.error, None);

    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_handed_out_again_after_commit_is_skipped() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    ticker.stop().await;

    insert(&test_cluster, "root", &[], "1", "a").await;
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();
    branch_worker.stop().await.unwrap();

    // The provider forgets that the batch was closed, as after a crash between the two commits.
    let root = test_cluster.connector.connect("root").unwrap();
    root.register_consumer(TEST_QUEUE, &worker_name("branch"), Some(tick_id - 1))
        .await
        .unwrap();

    let branch_worker = test_cluster.spawn_worker("branch");
    let next_tick = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", next_tick).await.unwrap();

    assert_eq!(
        test_cluster.cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "a")])]
    );
    assert_eq!(
        root.get_consumer_tick(TEST_QUEUE, &worker_name("branch"))
            .await
            .unwrap(),
        Some(next_tick)
    );

    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watermarks_rise_through_the_cascade() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_leaf("leaf", "root").await.unwrap();

    let root_worker = test_cluster.spawn_worker("root");
    let leaf_worker = test_cluster.spawn_worker("leaf");

    let mut tick_id = 0;
    for _ in 0..10 {
        tick_id = test_cluster.tick("root").await.unwrap();
    }
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();

    let cluster = &test_cluster.cluster;
    wait_until("leaf reporting its watermark", || async move {
        Ok(cluster.subscriber_watermark("root", TEST_QUEUE, "leaf").await? >= Some(tick_id))
    })
    .await
    .unwrap();
    wait_until("root publishing the global watermark", || async move {
        Ok(cluster.node_info("root", TEST_QUEUE).await?.global_watermark >= tick_id)
    })
    .await
    .unwrap();

    // The broadcast travels down with the next tick.
    test_cluster.tick("root").await.unwrap();
    wait_until("leaf receiving the global watermark", || async move {
        Ok(cluster.node_info("leaf", TEST_QUEUE).await?.global_watermark >= tick_id)
    })
    .await
    .unwrap();

    // A lower report is stored as given and the next batch of the leaf raises it again.
    let root = test_cluster.connector.connect("root").unwrap();
    root.set_subscriber_watermark(TEST_QUEUE, "leaf", 1)
        .await
        .unwrap();
    assert_eq!(
        cluster
            .subscriber_watermark("root", TEST_QUEUE, "leaf")
            .await
            .unwrap(),
        Some(1)
    );
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();
    wait_until("leaf reporting its watermark again", || async move {
        Ok(cluster.subscriber_watermark("root", TEST_QUEUE, "leaf").await? >= Some(tick_id))
    })
    .await
    .unwrap();

    leaf_worker.stop().await.unwrap();
    root_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn branch_with_subscribers_keeps_the_lowest_watermark() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.add_leaf("leaf", "branch").await.unwrap();

    let branch_worker = test_cluster.spawn_worker("branch");
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    // The leaf is not running, so the branch cannot report past the leaf's position.
    let cluster = &test_cluster.cluster;
    let leaf_watermark = cluster
        .subscriber_watermark("branch", TEST_QUEUE, "leaf")
        .await
        .unwrap()
        .unwrap();
    assert!(leaf_watermark < tick_id);
    assert!(
        cluster
            .subscriber_watermark("root", TEST_QUEUE, "branch")
            .await
            .unwrap()
            < Some(tick_id)
    );

    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_provider_is_retried() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();

    let cluster = &test_cluster.cluster;
    cluster.set_reachable("root", false).await.unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    let branch_consumer = worker_name("branch");
    let branch_consumer = branch_consumer.as_str();
    wait_until("branch recording the connection error", || async move {
        let state = cluster.consumer_state("branch", TEST_QUEUE, branch_consumer).await?;
        Ok(state.is_some_and(|state| state.error.is_some()))
    })
    .await
    .unwrap();
    assert!(!branch_worker.is_finished());

    cluster.set_reachable("root", true).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    let state = cluster
        .consumer_state("branch", TEST_QUEUE, branch_consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.error, None);

    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_watermark_branch_merges_with_its_peer() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    // Created first so that b1 starts out knowing where b2 is.
    test_cluster.add_branch("b2", "root").await.unwrap();
    test_cluster.add_branch("b1", "root").await.unwrap();

    let cluster = &test_cluster.cluster;
    cluster
        .set_node_attr("b1", TEST_QUEUE, SYNC_WATERMARK_ATTR, "b1,b2")
        .await
        .unwrap();
    let initial = cluster
        .subscriber_watermark("root", TEST_QUEUE, "b1")
        .await
        .unwrap();
    let initial_global = cluster.node_info("b1", TEST_QUEUE).await.unwrap().global_watermark;

    let b2_worker = test_cluster.spawn_worker("b2");
    let peer_tick = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("b2", peer_tick).await.unwrap();
    b2_worker.stop().await.unwrap();

    // With the peer down the held rounds report nothing upstream.
    cluster.set_reachable("b2", false).await.unwrap();
    let b1_worker = test_cluster.spawn_worker("b1");
    test_cluster.wait_completed("b1", peer_tick).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("b1", tick_id).await.unwrap();

    assert_eq!(
        cluster
            .subscriber_watermark("root", TEST_QUEUE, "b1")
            .await
            .unwrap(),
        initial
    );
    assert_eq!(
        cluster.node_info("b1", TEST_QUEUE).await.unwrap().global_watermark,
        initial_global
    );

    // Back online, the peer caps the merged watermark at its own position.
    cluster.set_reachable("b2", true).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("b1", tick_id).await.unwrap();

    wait_until("b1 reporting the merged watermark", || async move {
        Ok(cluster.subscriber_watermark("root", TEST_QUEUE, "b1").await? == Some(peer_tick))
    })
    .await
    .unwrap();
    wait_until("b1 raising its global watermark", || async move {
        Ok(cluster.node_info("b1", TEST_QUEUE).await?.global_watermark == peer_tick)
    })
    .await
    .unwrap();

    b1_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cursor_fetch_applies_batches_in_chunks() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let mut config = test_worker_config("branch", WorkerRole::Main);
    config.batch.fetch_size = Some(2);
    config.batch.max_event_buffer = 3;
    assert_eq!(
        FetchMode::from_config(&config.batch),
        FetchMode::Cursor { fetch_size: 2 }
    );

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = spawn_worker(test_cluster.connector.clone(), config);
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    ticker.stop().await;

    for id in ["1", "2", "3", "4", "5"] {
        insert(&test_cluster, "root", &["id"], id, "v").await;
    }
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    let cluster = &test_cluster.cluster;
    let root_rows = cluster.rows("root", ITEMS).await.unwrap();
    assert_eq!(root_rows.len(), 5);
    assert_eq!(cluster.rows("branch", ITEMS).await.unwrap(), root_rows);

    let root_events = cluster.queue_events("root", TEST_QUEUE).await.unwrap();
    let branch_events = cluster.queue_events("branch", TEST_QUEUE).await.unwrap();
    assert_eq!(
        event_ids(row_events_for(&branch_events, ITEMS)),
        event_ids(row_events_for(&root_events, ITEMS))
    );

    branch_worker.stop().await.unwrap();
}
