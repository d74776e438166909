use std::collections::HashMap;

use crate::admin::ControlPlane;
use crate::error::CascadeResult;
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::types::{NodeInfo, NodeType};

/// State of one reachable node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node_name: String,
    pub node_type: NodeType,
    pub location: String,
    pub provider_node: Option<String>,
    pub paused: bool,
    pub uptodate: bool,
    pub completed_tick: Option<i64>,
    /// Ticks the provider created that the node has not consumed yet.
    pub lag_ticks: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Up(NodeReport),
    Down {
        node_name: String,
        location: String,
        error: String,
    },
}

impl NodeStatus {
    pub fn node_name(&self) -> &str {
        match self {
            NodeStatus::Up(report) => &report.node_name,
            NodeStatus::Down { node_name, .. } => node_name,
        }
    }
}

impl<C: NodeConnector> ControlPlane<C> {
    /// Reports every node registered in the location table of the node at `entry_location`.
    pub async fn node_status(&self, entry_location: &str) -> CascadeResult<Vec<NodeStatus>> {
        let entry = self.node(entry_location)?;
        let locations = entry.get_queue_locations(&self.queue).await?;

        let mut statuses = Vec::with_capacity(locations.len());
        let mut infos: HashMap<String, NodeInfo> = HashMap::new();

        for location in locations {
            if location.dead {
                statuses.push(NodeStatus::Down {
                    node_name: location.node_name,
                    location: location.location,
                    error: "marked dead".to_string(),
                });
                continue;
            }

            match self.read_report(&location.location).await {
                Ok((report, info)) => {
                    infos.insert(report.node_name.clone(), info);
                    statuses.push(NodeStatus::Up(report));
                }
                Err(err) => statuses.push(NodeStatus::Down {
                    node_name: location.node_name,
                    location: location.location,
                    error: err.summary(),
                }),
            }
        }

        for status in &mut statuses {
            let NodeStatus::Up(report) = status else {
                continue;
            };
            let provider_last_tick = report
                .provider_node
                .as_ref()
                .and_then(|provider| infos.get(provider))
                .and_then(|provider| provider.worker_last_tick);
            if let (Some(last_tick), Some(completed)) =
                (provider_last_tick, report.completed_tick)
            {
                report.lag_ticks = Some((last_tick - completed).max(0));
            }
        }

        Ok(statuses)
    }

    async fn read_report(&self, location: &str) -> CascadeResult<(NodeReport, NodeInfo)> {
        let node = self.node(location)?;
        let info = node.get_node_info(&self.queue).await?;

        let consumer = match &info.worker_name {
            Some(worker) => node.get_consumer_state(&self.queue, worker).await?,
            None => None,
        };

        let report = NodeReport {
            node_name: info.node_name.clone(),
            node_type: info.node_type,
            location: location.to_string(),
            provider_node: info.provider_node.clone(),
            paused: info.worker_paused,
            uptodate: info.worker_uptodate,
            completed_tick: consumer.as_ref().map(|state| state.completed_tick),
            lag_ticks: None,
            error: consumer.and_then(|state| state.error),
        };

        Ok((report, info))
    }
}
