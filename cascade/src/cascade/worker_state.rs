use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::types::{NodeInfo, NodeType};

/// What a worker does with each batch, derived from the node row.
///
/// Recomputed for every batch and never stored: an administrative change of the node type or
/// attributes takes effect at the next batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerState {
    /// Fetch and process batches from the provider.
    pub process_batch: bool,
    /// Apply business events to local tables.
    pub process_events: bool,
    /// Re-publish consumed events into `target_queue`.
    pub copy_events: bool,
    /// Leave `pgq.*` events out of the re-published stream.
    pub filtered_copy: bool,
    /// Re-published events keep their upstream ids.
    pub keep_event_ids: bool,
    /// Stamp the local queue with the upstream tick after each batch.
    pub create_tick: bool,
    /// Relay the batch position into the combined queue as a tick-id event.
    pub send_tick_event: bool,
    /// Hold batches until the combined branch has consumed them.
    pub wait_behind: bool,
    /// Apply tick-id events as partition watermarks.
    pub process_tick_event: bool,
    /// Apply global-watermark events to the local node.
    pub process_global_wm: bool,
    /// Broadcast the global watermark (root only).
    pub global_wm_event: bool,
    /// Report the local watermark to the provider.
    pub local_wm_publish: bool,
    /// Merge the local watermark with branch peers before publishing.
    pub sync_watermark: bool,
    pub wm_sync_nodes: Vec<String>,
    /// Handle cascade control events.
    pub handle_control: bool,
    /// Queue that re-published events and local ticks go to.
    pub target_queue: Option<String>,
}

impl WorkerState {
    /// Decision table over node type, combined queue type and node attributes.
    pub fn for_node(queue: &str, node: &NodeInfo) -> CascadeResult<Self> {
        let mut state = WorkerState {
            handle_control: true,
            ..WorkerState::default()
        };

        match (node.node_type, node.combined_type) {
            (NodeType::Root, None) => {
                state.global_wm_event = true;
            }
            (NodeType::Branch, None) => {
                state.process_batch = true;
                state.process_events = true;
                state.copy_events = true;
                state.keep_event_ids = true;
                state.create_tick = true;
                state.process_tick_event = true;
                state.local_wm_publish = true;
                state.target_queue = Some(queue.to_string());

                match node.attrs.sync_watermark_nodes() {
                    Some(nodes) => {
                        state.sync_watermark = true;
                        state.wm_sync_nodes = nodes;
                    }
                    None => state.process_global_wm = true,
                }
            }
            (NodeType::Leaf, None) => {
                state.process_batch = true;
                state.process_events = true;
                state.local_wm_publish = true;
            }
            (NodeType::Leaf, Some(NodeType::Root)) => {
                let Some(combined_queue) = node.combined_queue.clone() else {
                    bail!(
                        ErrorKind::InvalidNodeType,
                        "Merge leaf has no combined queue",
                        node.node_name.clone()
                    );
                };
                state.process_batch = true;
                state.process_events = true;
                state.copy_events = true;
                state.filtered_copy = true;
                state.send_tick_event = true;
                state.local_wm_publish = true;
                state.target_queue = Some(combined_queue);
            }
            (NodeType::Leaf, Some(NodeType::Branch)) => {
                state.process_batch = true;
                state.wait_behind = true;
                state.local_wm_publish = true;
            }
            (node_type, combined_type) => bail!(
                ErrorKind::InvalidNodeType,
                "Unsupported node type combination",
                format!(
                    "node {} is {node_type} with combined type {}",
                    node.node_name,
                    combined_type.map(|t| t.as_str()).unwrap_or("none")
                )
            ),
        }

        Ok(state)
    }

    /// State of a copy worker: business events of its table only, no cascade duties.
    pub fn for_copy() -> Self {
        WorkerState {
            process_batch: true,
            process_events: true,
            ..WorkerState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeAttrs;

    fn node(node_type: NodeType, combined_type: Option<NodeType>, attrs: Option<&str>) -> NodeInfo {
        NodeInfo {
            node_type,
            node_name: "n1".to_string(),
            global_watermark: 1,
            local_watermark: 1,
            provider_node: None,
            provider_location: None,
            combined_queue: combined_type.map(|_| "combined".to_string()),
            combined_type,
            worker_name: Some("w1".to_string()),
            worker_paused: false,
            worker_uptodate: true,
            worker_last_tick: Some(1),
            attrs: NodeAttrs::parse(attrs).unwrap(),
        }
    }

    #[test]
    fn test_root_only_broadcasts() {
        let state = WorkerState::for_node("q", &node(NodeType::Root, None, None)).unwrap();
        assert!(state.global_wm_event);
        assert!(!state.process_batch);
        assert!(!state.local_wm_publish);
    }

    #[test]
    fn test_branch_republishes_and_ticks() {
        let state = WorkerState::for_node("q", &node(NodeType::Branch, None, None)).unwrap();
        assert!(state.process_events && state.copy_events && state.create_tick);
        assert!(state.keep_event_ids);
        assert!(state.process_global_wm);
        assert!(!state.sync_watermark);
        assert_eq!(state.target_queue.as_deref(), Some("q"));
    }

    #[test]
    fn test_sync_watermark_replaces_global_wm_processing() {
        let state = WorkerState::for_node(
            "q",
            &node(NodeType::Branch, None, Some("sync_watermark=b1%2Cb2")),
        )
        .unwrap();
        assert!(state.sync_watermark);
        assert!(!state.process_global_wm);
        assert_eq!(state.wm_sync_nodes, vec!["b1", "b2"]);
    }

    #[test]
    fn test_plain_leaf_applies_without_republishing() {
        let state = WorkerState::for_node("q", &node(NodeType::Leaf, None, None)).unwrap();
        assert!(state.process_events);
        assert!(!state.copy_events && !state.create_tick);
        assert_eq!(state.target_queue, None);
    }

    #[test]
    fn test_merge_leaf_relays_into_combined_queue() {
        let node = node(NodeType::Leaf, Some(NodeType::Root), None);
        let state = WorkerState::for_node("part1", &node).unwrap();
        assert!(state.copy_events && state.filtered_copy && state.send_tick_event);
        assert!(!state.keep_event_ids && !state.create_tick);
        assert_eq!(state.target_queue.as_deref(), Some("combined"));
    }

    #[test]
    fn test_leaf_of_combined_branch_waits_behind() {
        let info = node(NodeType::Leaf, Some(NodeType::Branch), None);
        let state = WorkerState::for_node("part1", &info).unwrap();
        assert!(state.wait_behind);
        assert!(!state.process_events);
        assert!(!state.copy_events);
    }

    #[test]
    fn test_invalid_combinations_are_rejected() {
        for (node_type, combined_type) in [
            (NodeType::Root, Some(NodeType::Root)),
            (NodeType::Branch, Some(NodeType::Branch)),
            (NodeType::Leaf, Some(NodeType::Leaf)),
        ] {
            let err =
                WorkerState::for_node("q", &node(node_type, combined_type, None)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidNodeType);
        }
    }

    #[test]
    fn test_copy_worker_has_no_cascade_duties() {
        let state = WorkerState::for_copy();
        assert!(state.process_events);
        assert!(!state.handle_control && !state.copy_events && !state.local_wm_publish);
    }
}
