use tracing::info;

use crate::admin::{ControlPlane, incomplete};
use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::types::NodeType;

impl<C: NodeConnector> ControlPlane<C> {
    /// Moves the node at `location` under `new_provider`.
    ///
    /// The node is subscribed on the new provider at exactly the tick it completed on the old one,
    /// so no batch is skipped or read twice. Calling it again after a successful switch is a
    /// no-op.
    pub async fn change_provider(&self, location: &str, new_provider: &str) -> CascadeResult<()> {
        let node = self.node(location)?;
        let (info, worker) = self.node_worker(&node).await?;

        if info.node_type == NodeType::Root {
            bail!(
                ErrorKind::InvalidNodeType,
                "Root node has no provider",
                info.node_name
            );
        }
        if info.node_name == new_provider {
            bail!(
                ErrorKind::ConfigError,
                "Node cannot be its own provider",
                new_provider
            );
        }
        if info.provider_node.as_deref() == Some(new_provider) {
            info!(node = %info.node_name, provider = new_provider, "provider already set");
            return Ok(());
        }

        let new_location = self.locate(&node, new_provider).await?;
        let new_node = self.node(&new_location.location)?;
        let new_info = new_node.get_node_info(&self.queue).await?;
        if new_info.node_type == NodeType::Leaf {
            bail!(
                ErrorKind::InvalidNodeType,
                "Leaf node cannot be a provider",
                new_provider
            );
        }

        self.pause_node(location).await?;

        let Some(state) = node.get_consumer_state(&self.queue, &worker).await? else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Paused worker lost its consumer state",
                format!("queue {}, consumer {worker}", self.queue)
            );
        };
        let old_provider = self.node(&state.provider_location)?;

        new_node
            .register_subscriber(&self.queue, &info.node_name, &worker, Some(state.completed_tick))
            .await
            .map_err(|err| incomplete("register subscriber on new provider", err))?;
        node.change_consumer_provider(&self.queue, &worker, new_provider)
            .await
            .map_err(|err| incomplete("switch provider pointer", err))?;
        self.resume_node(location)
            .await
            .map_err(|err| incomplete("resume worker", err))?;
        old_provider
            .unregister_subscriber(&self.queue, &info.node_name)
            .await
            .map_err(|err| incomplete("unregister from old provider", err))?;

        info!(
            queue = %self.queue,
            node = %info.node_name,
            old_provider = %state.provider_node,
            new_provider,
            tick_id = state.completed_tick,
            "provider changed"
        );

        Ok(())
    }
}
