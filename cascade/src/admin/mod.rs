//! Administrative control plane.
//!
//! The control plane keeps no state of its own. Every fact about the topology lives in the node
//! rows of the cascade and every node is reached through its registered location. Multi-node
//! sequences are not atomic: when one is interrupted half way it fails with
//! [`ErrorKind::TopologyChangeIncomplete`](crate::error::ErrorKind::TopologyChangeIncomplete)
//! naming the step, and the operator finishes it by hand.

use cascade_config::shared::AdminConfig;

use crate::bail;
use crate::cascade_error;
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::types::{NodeInfo, NodeLocation};

pub mod pause;
pub mod provider;
pub mod setup;
pub mod status;
pub mod tables;
pub mod takeover;

/// Entry point for administrative commands on one queue.
#[derive(Debug, Clone)]
pub struct ControlPlane<C: NodeConnector> {
    connector: C,
    config: AdminConfig,
    queue: String,
}

impl<C: NodeConnector> ControlPlane<C> {
    pub fn new(connector: C, config: AdminConfig, queue: impl Into<String>) -> Self {
        ControlPlane {
            connector,
            config,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn node(&self, location: &str) -> CascadeResult<C::Node> {
        self.connector.connect(location)
    }

    /// Looks up the location of `node_name` in the location table of `via`.
    async fn locate(&self, via: &C::Node, node_name: &str) -> CascadeResult<NodeLocation> {
        let locations = via.get_queue_locations(&self.queue).await?;
        match locations.into_iter().find(|location| location.node_name == node_name) {
            Some(location) => Ok(location),
            None => bail!(
                ErrorKind::ConfigError,
                "Node has no registered location",
                format!("queue {}: {node_name}", self.queue)
            ),
        }
    }

    /// Reads the node row and the name of its worker.
    async fn node_worker(&self, node: &C::Node) -> CascadeResult<(NodeInfo, String)> {
        let info = node.get_node_info(&self.queue).await?;
        let Some(worker) = info.worker_name.clone() else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Node has no worker",
                format!("queue {}: {}", self.queue, info.node_name)
            );
        };

        Ok((info, worker))
    }
}

/// Wraps the failure of a step that runs after the topology was already changed.
fn incomplete(step: &'static str, err: CascadeError) -> CascadeError {
    cascade_error!(
        ErrorKind::TopologyChangeIncomplete,
        "Topology change stopped half way",
        format!("step '{step}' failed: {err}"),
        source: err
    )
}
