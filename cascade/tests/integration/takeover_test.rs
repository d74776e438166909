use cascade::admin::takeover::{TakeoverMode, gravestone_consumer_name};
use cascade::error::ErrorKind;
use cascade::node::base::NodeConnector;
use cascade::queue::base::BatchSource;
use cascade::test_utils::event::{count_events_by_type, row};
use cascade::test_utils::{TEST_QUEUE, TestCluster, test_admin_config, wait_until};
use cascade::types::{ChangeOp, Event, NodeType, RowMap};
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";

async fn insert(test_cluster: &TestCluster, node: &str, id: u32) {
    let id = id.to_string();
    test_cluster
        .cluster
        .source_change(
            node,
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", &id), ("val", "v")]),
        )
        .await
        .unwrap();
}

fn rows(ids: impl IntoIterator<Item = u32>) -> Vec<RowMap> {
    let mut rows: Vec<_> = ids
        .into_iter()
        .map(|id| row(&[("id", &id.to_string()), ("val", "v")]))
        .collect();
    rows.sort();
    rows
}

/// Root with two branches, all replicating [`ITEMS`].
async fn two_branch_cluster(dir: &TempDir) -> TestCluster {
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("b1", "root").await.unwrap();
    test_cluster.add_branch("b2", "root").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "b1", "b2"])
        .await
        .unwrap();

    test_cluster
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_takeover_swaps_root_and_branch() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = two_branch_cluster(&dir).await;

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let root_worker = test_cluster.spawn_worker("root");
    let b1_worker = test_cluster.spawn_worker("b1");
    let b2_worker = test_cluster.spawn_worker("b2");
    test_cluster.wait_table_ok("b1", ITEMS).await.unwrap();
    test_cluster.wait_table_ok("b2", ITEMS).await.unwrap();

    for id in 1..=3 {
        insert(&test_cluster, "root", id).await;
    }
    ticker.stop().await;

    let report = test_cluster.admin.takeover("b1", "root").await.unwrap();
    assert_eq!(report.mode, TakeoverMode::Graceful);

    let cluster = &test_cluster.cluster;
    assert_eq!(cluster.node_info("b1", TEST_QUEUE).await.unwrap().node_type, NodeType::Root);
    let old_root = cluster.node_info("root", TEST_QUEUE).await.unwrap();
    assert_eq!(old_root.node_type, NodeType::Branch);
    assert_eq!(old_root.provider_node.as_deref(), Some("b1"));
    assert_eq!(cluster.rows("b1", ITEMS).await.unwrap(), rows(1..=3));

    // The old root now follows the new one and still feeds its other branch.
    let ticker = test_cluster.spawn_ticker("b1").unwrap();
    insert(&test_cluster, "b1", 4).await;
    let tick_id = test_cluster.tick("b1").await.unwrap();
    test_cluster.wait_completed("root", tick_id).await.unwrap();
    test_cluster.wait_completed("b2", tick_id).await.unwrap();

    assert_eq!(cluster.rows("root", ITEMS).await.unwrap(), rows(1..=4));
    assert_eq!(cluster.rows("b2", ITEMS).await.unwrap(), rows(1..=4));

    ticker.stop().await;
    b2_worker.stop().await.unwrap();
    b1_worker.stop().await.unwrap();
    root_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn takeover_refuses_a_leaf_candidate() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_leaf("leaf", "root").await.unwrap();

    let err = test_cluster.admin.takeover("leaf", "root").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidNodeType);
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_takeover_then_resurrect_dumps_lost_events() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = two_branch_cluster(&dir).await;
    let cluster = &test_cluster.cluster;

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let root_worker = test_cluster.spawn_worker("root");
    let b1_worker = test_cluster.spawn_worker("b1");
    let b2_worker = test_cluster.spawn_worker("b2");
    test_cluster.wait_table_ok("b1", ITEMS).await.unwrap();
    test_cluster.wait_table_ok("b2", ITEMS).await.unwrap();

    for id in 1..=5 {
        insert(&test_cluster, "root", id).await;
    }
    ticker.stop().await;
    let failover_tick = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("b1", failover_tick).await.unwrap();
    test_cluster.wait_completed("b2", failover_tick).await.unwrap();

    b1_worker.stop().await.unwrap();
    b2_worker.stop().await.unwrap();
    root_worker.stop().await.unwrap();

    // Accepted by the root but never seen by any branch.
    for id in 6..=8 {
        insert(&test_cluster, "root", id).await;
    }
    test_cluster.tick("root").await.unwrap();
    cluster.set_reachable("root", false).await.unwrap();

    let b1_worker = test_cluster.spawn_worker("b1");
    let b2_worker = test_cluster.spawn_worker("b2");

    let report = test_cluster.admin.takeover("b1", "root").await.unwrap();
    assert_eq!(report.mode, TakeoverMode::Direct);
    assert_eq!(report.tick_id, failover_tick);

    let b1 = test_cluster.connector.connect("b1").unwrap();
    assert_eq!(
        b1.get_consumer_tick(TEST_QUEUE, &gravestone_consumer_name("root"))
            .await
            .unwrap(),
        Some(failover_tick)
    );
    assert_eq!(
        cluster.node_info("b2", TEST_QUEUE).await.unwrap().provider_node.as_deref(),
        Some("b1")
    );

    let ticker = test_cluster.spawn_ticker("b1").unwrap();
    insert(&test_cluster, "b1", 9).await;
    wait_until("b2 receiving rows from the new root", || async move {
        Ok(cluster.rows("b2", ITEMS).await?.len() == 6)
    })
    .await
    .unwrap();
    assert_eq!(cluster.rows("b1", ITEMS).await.unwrap(), rows((1..=5).chain([9])));
    assert_eq!(cluster.rows("b2", ITEMS).await.unwrap(), rows((1..=5).chain([9])));

    // The old root comes back with events nobody else has.
    cluster.set_reachable("root", true).await.unwrap();
    let resurrect = test_cluster.admin.resurrect("root", "b1").await.unwrap();
    assert_eq!(resurrect.tick_id, failover_tick);

    let dump = tokio::fs::read_to_string(&resurrect.dump_file).await.unwrap();
    let dumped: Vec<Event> = dump
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(dumped.len() as u64, resurrect.dumped_events);
    assert_eq!(count_events_by_type(&dumped).get("I:id"), Some(&3));

    let old_root = cluster.node_info("root", TEST_QUEUE).await.unwrap();
    assert_eq!(old_root.node_type, NodeType::Branch);
    assert_eq!(old_root.provider_node.as_deref(), Some("b1"));
    assert_eq!(
        b1.get_consumer_tick(TEST_QUEUE, &gravestone_consumer_name("root"))
            .await
            .unwrap(),
        None
    );

    let root_worker = test_cluster.spawn_worker("root");
    let tick_id = test_cluster.tick("b1").await.unwrap();
    test_cluster.wait_completed("root", tick_id).await.unwrap();

    // The lost rows stay in the old root's tables, the dump is for manual replay.
    assert_eq!(cluster.rows("root", ITEMS).await.unwrap(), rows(1..=9));

    // A second resurrect never overwrites the dump of the first one.
    let err = test_cluster.admin.resurrect("root", "b1").await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::InvalidNodeType | ErrorKind::DumpFileExists
    ));

    ticker.stop().await;
    root_worker.stop().await.unwrap();
    b2_worker.stop().await.unwrap();
    b1_worker.stop().await.unwrap();
}
