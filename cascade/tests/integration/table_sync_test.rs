use cascade::error::ErrorKind;
use cascade::node::base::NodeConnector;
use cascade::state::table::TablePhase;
use cascade::store::base::{CopyClaims, TargetStore, TargetTx};
use cascade::test_utils::event::row;
use cascade::test_utils::{
    ForeignKey, TEST_QUEUE, TestCluster, spawn_worker, test_admin_config, test_worker_config,
    wait_until,
};
use cascade::types::ChangeOp;
use cascade::workers::copy::copy_consumer_name;
use cascade_config::shared::WorkerRole;
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";

async fn branch_cluster(dir: &TempDir) -> TestCluster {
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    test_cluster.add_root("root").await.unwrap();
    test_cluster.add_branch("branch", "root").await.unwrap();

    test_cluster
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_before_copy_is_not_applied_twice() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    // Without a primary key a second apply of the insert would duplicate the row.
    test_cluster
        .cluster
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

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let root_worker = test_cluster.spawn_worker("root");
    let branch_worker = test_cluster.spawn_worker("branch");

    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    let rows = test_cluster.cluster.rows("branch", ITEMS).await.unwrap();
    assert_eq!(rows, vec![row(&[("id", "1"), ("val", "a")])]);

    branch_worker.stop().await.unwrap();
    root_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn updates_inside_copy_snapshot_are_discarded() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let cluster = &test_cluster.cluster;
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", "1"), ("val", "a")]),
        )
        .await
        .unwrap();
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Update,
            &["id"],
            row(&[("id", "1"), ("val", "b")]),
        )
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "b")])]
    );

    // Changes after the copy flow through the main worker.
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Update,
            &["id"],
            row(&[("id", "1"), ("val", "c")]),
        )
        .await
        .unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "c")])]
    );

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_during_catch_up_reach_the_branch() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    let cluster = &test_cluster.cluster;
    for id in 1..=6 {
        let id = id.to_string();
        cluster
            .source_change(
                "root",
                TEST_QUEUE,
                ITEMS,
                ChangeOp::Insert,
                &["id"],
                row(&[("id", &id), ("val", "x")]),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
    }

    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        cluster.rows("root", ITEMS).await.unwrap()
    );
    assert_eq!(cluster.rows("branch", ITEMS).await.unwrap().len(), 6);

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn indexes_are_restored_after_copy() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let ddl = "CREATE INDEX items_val_idx ON public.items (val)";
    let cluster = &test_cluster.cluster;
    cluster.set_table_objects("branch", ITEMS, ddl).await.unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    assert_eq!(
        cluster.table_objects("branch", ITEMS).await.unwrap().as_deref(),
        Some(ddl)
    );

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_keys_return_once_both_tables_are_replicated() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere("public.customers", &["root", "branch"])
        .await
        .unwrap();
    test_cluster
        .add_table_everywhere("public.orders", &["root", "branch"])
        .await
        .unwrap();

    let fkey = ForeignKey::new("orders_customer_fkey", "public.orders", "public.customers");
    let cluster = &test_cluster.cluster;
    cluster.add_foreign_key("branch", fkey.clone()).await.unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    test_cluster.wait_table_ok("branch", "public.customers").await.unwrap();
    test_cluster.wait_table_ok("branch", "public.orders").await.unwrap();

    wait_until("foreign key restored", || async move {
        Ok(cluster.pending_foreign_keys("branch").await?.is_empty())
    })
    .await
    .unwrap();
    assert_eq!(cluster.foreign_keys("branch").await.unwrap(), vec![fkey]);

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn leaf_copies_from_branch_once_branch_is_replicated() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster.add_leaf("leaf", "branch").await.unwrap();
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch", "leaf"])
        .await
        .unwrap();

    let cluster = &test_cluster.cluster;
    for id in ["1", "2", "3"] {
        cluster
            .source_change(
                "root",
                TEST_QUEUE,
                ITEMS,
                ChangeOp::Insert,
                &["id"],
                row(&[("id", id), ("val", "v")]),
            )
            .await
            .unwrap();
    }

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    let leaf_worker = test_cluster.spawn_worker("leaf");

    test_cluster.wait_table_ok("leaf", ITEMS).await.unwrap();
    assert_eq!(
        cluster.table_phase("branch", TEST_QUEUE, ITEMS).await.unwrap(),
        Some(TablePhase::Ok)
    );

    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("leaf", tick_id).await.unwrap();
    assert_eq!(
        cluster.rows("leaf", ITEMS).await.unwrap(),
        cluster.rows("root", ITEMS).await.unwrap()
    );

    leaf_worker.stop().await.unwrap();
    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resync_table_copies_it_again() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let cluster = &test_cluster.cluster;
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", "1"), ("val", "a")]),
        )
        .await
        .unwrap();

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();

    test_cluster.admin.resync_table("branch", ITEMS).await.unwrap();
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", "2"), ("val", "b")]),
        )
        .await
        .unwrap();

    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "a")]), row(&[("id", "2"), ("val", "b")])]
    );

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

async fn start_copy_phase(test_cluster: &TestCluster, node_name: &str, table: &str) {
    let node = test_cluster.connector.connect(node_name).unwrap();
    let mut tx = node.begin().await.unwrap();
    tx.save_table_state(TEST_QUEUE, table, &TablePhase::InCopy, None)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_claimed_elsewhere_is_not_started_twice() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();

    let cluster = &test_cluster.cluster;
    cluster
        .source_change(
            "root",
            TEST_QUEUE,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", "1"), ("val", "a")]),
        )
        .await
        .unwrap();

    // A copy worker in another process holds the claim.
    start_copy_phase(&test_cluster, "branch", ITEMS).await;
    let branch = test_cluster.connector.connect("branch").unwrap();
    let claim = branch.try_claim_copy(TEST_QUEUE, ITEMS).await.unwrap();
    assert!(claim.is_some());

    let ticker = test_cluster.spawn_ticker("root").unwrap();
    let branch_worker = test_cluster.spawn_worker("branch");

    let tick_id = test_cluster.tick("root").await.unwrap();
    test_cluster.wait_completed("branch", tick_id).await.unwrap();

    let copy_consumer = copy_consumer_name("branch_worker", ITEMS);
    assert!(
        cluster
            .consumer_state("branch", TEST_QUEUE, &copy_consumer)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        cluster.table_phase("branch", TEST_QUEUE, ITEMS).await.unwrap(),
        Some(TablePhase::InCopy)
    );

    // Once the other worker is gone the main worker takes the copy over.
    drop(claim);
    test_cluster.wait_table_ok("branch", ITEMS).await.unwrap();
    assert_eq!(
        cluster.rows("branch", ITEMS).await.unwrap(),
        vec![row(&[("id", "1"), ("val", "a")])]
    );

    branch_worker.stop().await.unwrap();
    ticker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn standalone_copy_worker_refuses_claimed_table() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = branch_cluster(&dir).await;
    test_cluster
        .add_table_everywhere(ITEMS, &["root", "branch"])
        .await
        .unwrap();
    start_copy_phase(&test_cluster, "branch", ITEMS).await;

    let branch = test_cluster.connector.connect("branch").unwrap();
    let _claim = branch.try_claim_copy(TEST_QUEUE, ITEMS).await.unwrap();

    let copy_worker = spawn_worker(
        test_cluster.connector.clone(),
        test_worker_config(
            "branch",
            WorkerRole::Copy {
                table: ITEMS.to_string(),
            },
        ),
    );
    let err = copy_worker.join().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CopyAlreadyRunning);

    let copy_consumer = copy_consumer_name("branch_worker", ITEMS);
    assert!(
        test_cluster
            .cluster
            .consumer_state("branch", TEST_QUEUE, &copy_consumer)
            .await
            .unwrap()
            .is_none()
    );
}
