use cascade::admin::status::NodeStatus;
use cascade::error::ErrorKind;
use cascade::test_utils::event::row;
use cascade::test_utils::{TEST_QUEUE, TestCluster, test_admin_config, worker_name};
use cascade::types::{ChangeOp, NodeType};
use cascade_config::shared::AdminConfig;
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";

fn new_cluster(dir: &TempDir) -> TestCluster {
    TestCluster::new(test_admin_config(dir.path().join("lost_events.json")))
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_worker_stops_consuming_until_resumed() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();

    let branch_worker = test_cluster.spawn_worker("branch");
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    test_cluster.admin.pause_node("branch").await.unwrap();
    let cluster = &test_cluster.cluster;
    let state = cluster
        .consumer_state("branch", TEST_QUEUE, &worker_name("branch"))
        .await
        .unwrap()
        .unwrap();
    assert!(state.paused);
    assert!(state.uptodate);

    let paused_tick = test_cluster.tick("root").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let state = cluster
        .consumer_state("branch", TEST_QUEUE, &worker_name("branch"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.completed_tick, tick_id);

    test_cluster.admin.resume_node("branch").await.unwrap();
    test_cluster.wait_completed("branch", paused_tick).await.unwrap();

    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_without_worker_times_out() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = TestCluster::new(AdminConfig {
        rendezvous_timeout_ms: 100,
        ..test_admin_config(dir.path().join("lost_events.json"))
    });
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();

    let err = test_cluster.admin.pause_node("branch").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn change_provider_moves_leaf_without_gaps() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.add_leaf("leaf", "branch").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch", "leaf"])
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    let leaf_worker = test_cluster.spawn_worker("leaf");
    test_cluster.wait_table_ok("leaf", ITEMS).await.unwrap();

    let cluster = &test_cluster.cluster;
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &[],
            row(&[("id", "1"), ("val", "a")]),
        )
        .await
        .unwrap();

    test_cluster.admin.change_provider("leaf", "root").await.unwrap();
    // Switching again to the same provider changes nothing.
    test_cluster.admin.change_provider("leaf", "root").await.unwrap();

    let info = cluster.node_info("leaf", TEST_QUEUE).await.unwrap();
    assert_eq!(info.provider_node.as_deref(), Some("root"));
    assert!(
        cluster
            .subscriber_watermark("root", TEST_QUEUE, "leaf")
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(
        cluster
            .subscriber_watermark("branch", TEST_QUEUE, "leaf")
            .await
            .unwrap(),
        None
    );

    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &[],
            row(&[("id", "2"), ("val", "b")]),
        )
        .await
        .unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();

    assert_eq!(
        cluster.rows("leaf", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "a")]), row(&[("id", "2"), ("val", "b")])]
    );

    leaf_worker.stop().await.unwrap();
    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn change_provider_refuses_leaf_provider() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_leaf("leaf1", "root").await.unwrap();
    test_cluster.add_leaf("leaf2", "root").await.unwrap();

    let err = test_cluster
        .admin
        .change_provider("leaf2", "leaf1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidNodeType);

    let err = test_cluster
        .admin
        .change_provider("root", "leaf1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidNodeType);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_every_node_and_lag() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.add_leaf("leaf", "branch").await.unwrap();

    let branch_worker = test_cluster.spawn_worker("branch");
    let leaf_worker = test_cluster.spawn_worker("leaf");
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();

    let statuses = test_cluster.admin.node_status("root").await.unwrap();
    let mut names: Vec<&str> = statuses.iter().map(NodeStatus::node_name).collect();
    names.sort();
    assert_eq!(names, vec!["branch", "leaf", "root"]);

    let leaf = statuses
        .iter()
        .find_map(|status| match status {
            NodeStatus::Up(report) if report.node_name == "leaf" => Some(report.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(leaf.node_type, NodeType::Leaf);
    assert_eq!(leaf.provider_node.as_deref(), Some("branch"));
    assert_eq!(leaf.completed_tick, Some(tick_id));
    assert_eq!(leaf.lag_ticks, Some(0));

    test_cluster.cluster.set_reachable("leaf", false).await.unwrap();
    let statuses = test_cluster.admin.node_status("root").await.unwrap();
    assert!(
        statuses
            .iter()
            .any(|status| {
                matches!(status, NodeStatus::Down { node_name, .. } if node_name == "leaf")
            })
    );
    test_cluster.cluster.set_reachable("leaf", true).await.unwrap();

    leaf_worker.stop().await.unwrap();
    branch_worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_node_refuses_nodes_with_subscribers() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.add_leaf("leaf", "branch").await.unwrap();

    let err = test_cluster.admin.drop_node("branch").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeCommandFailed);

    test_cluster.admin.drop_node("leaf").await.unwrap();
    let cluster = &test_cluster.cluster;
    assert_eq!(
        cluster
            .subscriber_watermark("branch", TEST_QUEUE, "leaf")
            .await
            .unwrap(),
        None
    );

    let statuses = test_cluster.admin.node_status("root").await.unwrap();
    assert!(statuses.iter().all(|status| status.node_name() != "leaf"));

    test_cluster.admin.drop_node("branch").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn creating_an_existing_node_fails() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();

    let err = test_cluster.add_root("root").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NodeCommandFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn add_table_requires_provider_table() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();
    test_cluster.cluster.create_table("branch", ITEMS).await.unwrap();

    let err = test_cluster
        .admin
        .add_table("branch", ITEMS, Default::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingTableState);

    test_cluster.add_table_everywhere(ITEMS, &["root", "branch"]).await.unwrap();
    assert!(
        test_cluster
            .cluster
            .table_phase("branch", TEST_QUEUE, ITEMS)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_node_updates_every_location_table() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = new_cluster(&dir);
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();

    test_cluster.admin.rename_node("branch", "branch_a").await.unwrap();

    let info = test_cluster.cluster.node_info("branch", TEST_QUEUE).await.unwrap();
    assert_eq!(info.node_name, "branch_a");

    let statuses = test_cluster.admin.node_status("root").await.unwrap();
    let mut names: Vec<&str> = statuses.iter().map(NodeStatus::node_name).collect();
    names.sort();
    assert_eq!(names, vec!["branch_a", "root"]);
}
