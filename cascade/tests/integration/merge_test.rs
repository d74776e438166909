use cascade::admin::ControlPlane;
use cascade::admin::setup::NodeSetup;
use cascade::cascade::worker_state::WorkerState;
use cascade::test_utils::event::{row, row_events_for};
use cascade::test_utils::{
    MemoryConnector, TestCluster, WorkerHandle, spawn_worker, test_admin_config,
    test_worker_config, wait_until,
};
use cascade::types::{ChangeOp, ControlEvent, Event, EventKind, NodeType};
use cascade_config::shared::WorkerRole;
use cascade_telemetry::init_test_tracing;
use tempfile::TempDir;

const ITEMS: &str = "public.items";
const COMBINED: &str = "combined";
const PARTS: [&str; 2] = ["part1", "part2"];

/// Database holding the combined root and one merge leaf per part queue.
const TARGET: &str = "target";
/// Database holding a combined branch and one waiting leaf per part queue.
const REPLICA: &str = "replica";

fn setup(node_name: &str, location: &str) -> NodeSetup {
    NodeSetup {
        node_name: node_name.to_string(),
        worker_name: format!("{node_name}_worker"),
        location: location.to_string(),
    }
}

fn part_node(part: &str, location: &str) -> String {
    format!("{part}_{location}")
}

fn worker(
    connector: &MemoryConnector,
    location: &str,
    queue: &str,
    node_name: &str,
) -> WorkerHandle {
    let mut config = test_worker_config(location, WorkerRole::Main);
    config.queue_name = queue.to_string();
    config.consumer_name = format!("{node_name}_worker");

    spawn_worker(connector.clone(), config)
}

fn tick_events(events: &[Event]) -> Vec<(String, i64)> {
    events
        .iter()
        .filter_map(|event| match event.kind() {
            Ok(EventKind::Control(ControlEvent::TickId {
                source_queue,
                tick_id,
            })) => Some((source_queue, tick_id)),
            _ => None,
        })
        .collect()
}

/// Two part queues merged into a combined root on `target`, with a combined branch on
/// `replica` that carries waiting leaves of both parts.
async fn merge_cluster(dir: &TempDir) -> TestCluster {
    let test_cluster = TestCluster::new(test_admin_config(dir.path().join("lost_events.json")));
    let cluster = &test_cluster.cluster;
    let connector = &test_cluster.connector;
    let admin = |queue: &str| {
        ControlPlane::new(
            connector.clone(),
            test_admin_config(dir.path().join(format!("{queue}_lost_events.json"))),
            queue,
        )
    };

    for location in PARTS.iter().chain([&TARGET, &REPLICA]) {
        cluster.add_database(location).await;
    }

    let combined = admin(COMBINED);
    combined.create_root(&setup("combined_root", TARGET)).await.unwrap();
    combined
        .create_branch(&setup("combined_branch", REPLICA), TARGET)
        .await
        .unwrap();

    for part in PARTS {
        cluster.create_table(part, ITEMS).await.unwrap();
        let part_admin = admin(part);
        part_admin.create_root(&setup(part, part)).await.unwrap();
        for location in [TARGET, REPLICA] {
            part_admin
                .create_leaf(&setup(&part_node(part, location), location), part, Some(COMBINED))
                .await
                .unwrap();
        }
    }

    test_cluster
}

async fn insert(test_cluster: &TestCluster, part: &str, id: &str) {
    test_cluster
        .cluster
        .source_change(
            part,
            part,
            ITEMS,
            ChangeOp::Insert,
            &["id"],
            row(&[("id", id), ("val", part)]),
        )
        .await
        .unwrap();
}

async fn wait_consumer(
    test_cluster: &TestCluster,
    location: &str,
    queue: &str,
    node: &str,
    tick_id: i64,
) {
    let cluster = &test_cluster.cluster;
    let consumer = format!("{node}_worker");
    let consumer = consumer.as_str();

    wait_until("consumer completing the tick", || async move {
        let state = cluster.consumer_state(location, queue, consumer).await?;
        Ok(state.is_some_and(|state| state.completed_tick >= tick_id))
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_leaves_derive_their_worker_state_from_the_combined_node() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = merge_cluster(&dir).await;
    let cluster = &test_cluster.cluster;

    let merge_leaf = cluster.node_info(TARGET, "part1").await.unwrap();
    assert_eq!(merge_leaf.node_type, NodeType::Leaf);
    assert_eq!(merge_leaf.combined_type, Some(NodeType::Root));
    let state = WorkerState::for_node("part1", &merge_leaf).unwrap();
    assert!(state.process_events);
    assert!(state.copy_events);
    assert!(state.filtered_copy);
    assert!(state.send_tick_event);
    assert!(!state.wait_behind);
    assert_eq!(state.target_queue.as_deref(), Some(COMBINED));

    let waiting_leaf = cluster.node_info(REPLICA, "part1").await.unwrap();
    assert_eq!(waiting_leaf.combined_type, Some(NodeType::Branch));
    let state = WorkerState::for_node("part1", &waiting_leaf).unwrap();
    assert!(state.process_batch);
    assert!(state.wait_behind);
    assert!(!state.process_events);
    assert!(!state.copy_events);
    assert!(!state.send_tick_event);
    assert_eq!(state.target_queue, None);

    let combined_branch = cluster.node_info(REPLICA, COMBINED).await.unwrap();
    let state = WorkerState::for_node(COMBINED, &combined_branch).unwrap();
    assert!(state.process_tick_event);
    assert_eq!(state.target_queue.as_deref(), Some(COMBINED));
}

#[tokio::test(flavor = "multi_thread")]
async fn part_queues_merge_into_the_combined_queue() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let test_cluster = merge_cluster(&dir).await;
    let cluster = &test_cluster.cluster;
    let connector = &test_cluster.connector;

    let mut workers = Vec::new();
    for part in PARTS {
        workers.push(worker(connector, TARGET, part, &part_node(part, TARGET)));
        workers.push(worker(connector, REPLICA, part, &part_node(part, REPLICA)));
    }

    insert(&test_cluster, "part1", "1").await;
    insert(&test_cluster, "part2", "2").await;
    let mut part_ticks = Vec::new();
    for part in PARTS {
        let tick_id = cluster.tick(part, part).await.unwrap();
        wait_consumer(&test_cluster, TARGET, part, &part_node(part, TARGET), tick_id).await;
        part_ticks.push((part.to_string(), tick_id));
    }

    // Row events of both parts and one tick event per part batch, without the part queues'
    // own pgq events.
    let combined_events = cluster.queue_events(TARGET, COMBINED).await.unwrap();
    assert_eq!(row_events_for(&combined_events, ITEMS).len(), 2);
    let mut relayed_ticks = tick_events(&combined_events);
    relayed_ticks.sort();
    assert_eq!(relayed_ticks, part_ticks);
    assert!(!combined_events.iter().any(|event| matches!(
        event.kind(),
        Ok(EventKind::Control(ControlEvent::LocationInfo { node_name, .. }))
            if node_name.starts_with("part")
    )));

    // Nothing passed the combined branch yet, so the waiting leaves hold their batches.
    for part in PARTS {
        let state = cluster
            .consumer_state(REPLICA, part, &format!("{}_worker", part_node(part, REPLICA)))
            .await
            .unwrap()
            .unwrap();
        assert!(state.completed_tick < cluster.last_tick(part, part).await.unwrap());
    }

    let combined_tick = cluster.tick(TARGET, COMBINED).await.unwrap();
    let branch_worker = worker(connector, REPLICA, COMBINED, "combined_branch");
    wait_consumer(&test_cluster, REPLICA, COMBINED, "combined_branch", combined_tick).await;

    // The combined branch turns the tick events into partition watermarks, which lets the
    // waiting leaves close their batches and report upstream.
    for (part, tick_id) in &part_ticks {
        let node = part_node(part, REPLICA);
        wait_consumer(&test_cluster, REPLICA, part, &node, *tick_id).await;

        let node = node.as_str();
        let part = part.as_str();
        let tick_id = *tick_id;
        wait_until("waiting leaf reporting its watermark", || async move {
            let watermark = cluster.subscriber_watermark(part, part, node).await?;
            Ok(watermark == Some(tick_id))
        })
        .await
        .unwrap();
    }

    let replica_events = cluster.queue_events(REPLICA, COMBINED).await.unwrap();
    assert_eq!(row_events_for(&replica_events, ITEMS).len(), 2);
    assert_eq!(cluster.last_tick(REPLICA, COMBINED).await.unwrap(), combined_tick);

    branch_worker.stop().await.unwrap();
    for worker in workers {
        worker.stop().await.unwrap();
    }
}
