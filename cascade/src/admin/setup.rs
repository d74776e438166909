use tracing::{info, warn};

use crate::admin::{ControlPlane, incomplete};
use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NewNode, NodeConnector, NodeRpc, ProgressTracker};
use crate::types::{NodeLocation, NodeType};

/// Longest provider chain walked when announcing a new node upstream.
const MAX_CASCADE_DEPTH: usize = 64;

/// Identity of a node being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSetup {
    pub node_name: String,
    pub worker_name: String,
    /// Connection string other nodes and the control plane use to reach the node.
    pub location: String,
}

impl NodeSetup {
    fn node_location(&self) -> NodeLocation {
        NodeLocation {
            node_name: self.node_name.clone(),
            location: self.location.clone(),
            dead: false,
        }
    }
}

impl<C: NodeConnector> ControlPlane<C> {
    pub async fn create_root(&self, setup: &NodeSetup) -> CascadeResult<()> {
        let node = self.node(&setup.location)?;

        node.create_node(&NewNode {
            queue: self.queue.clone(),
            node_type: NodeType::Root,
            node_name: setup.node_name.clone(),
            worker_name: setup.worker_name.clone(),
            provider_node: None,
            global_watermark: None,
            combined_queue: None,
        })
        .await?;
        node.register_location(&self.queue, &setup.node_location())
            .await
            .map_err(|err| incomplete("register root location", err))?;

        info!(queue = %self.queue, node = %setup.node_name, "created root node");

        Ok(())
    }

    pub async fn create_branch(
        &self,
        setup: &NodeSetup,
        provider_location: &str,
    ) -> CascadeResult<()> {
        self.create_subscriber_node(setup, NodeType::Branch, provider_location, None)
            .await
    }

    /// Creates a leaf; with `combined_queue` set the leaf relays its events into that queue on
    /// the local database.
    pub async fn create_leaf(
        &self,
        setup: &NodeSetup,
        provider_location: &str,
        combined_queue: Option<&str>,
    ) -> CascadeResult<()> {
        self.create_subscriber_node(setup, NodeType::Leaf, provider_location, combined_queue)
            .await
    }

    async fn create_subscriber_node(
        &self,
        setup: &NodeSetup,
        node_type: NodeType,
        provider_location: &str,
        combined_queue: Option<&str>,
    ) -> CascadeResult<()> {
        let provider = self.node(provider_location)?;
        let provider_info = provider.get_node_info(&self.queue).await?;
        if provider_info.node_type == NodeType::Leaf {
            bail!(
                ErrorKind::InvalidNodeType,
                "Leaf node cannot be a provider",
                provider_info.node_name
            );
        }

        let own_location = setup.node_location();
        self.announce_upstream(&provider, &own_location).await?;

        let node = self.node(&setup.location)?;
        let mut locations = provider.get_queue_locations(&self.queue).await?;
        if !locations.iter().any(|location| location.node_name == setup.node_name) {
            locations.push(own_location);
        }
        for location in &locations {
            node.register_location(&self.queue, location)
                .await
                .map_err(|err| incomplete("copy locations to new node", err))?;
        }

        let start_tick = provider
            .register_subscriber(
                &self.queue,
                &setup.node_name,
                &setup.worker_name,
                Some(provider_info.global_watermark),
            )
            .await
            .map_err(|err| incomplete("subscribe to provider", err))?
            .unwrap_or(provider_info.global_watermark);

        node.create_node(&NewNode {
            queue: self.queue.clone(),
            node_type,
            node_name: setup.node_name.clone(),
            worker_name: setup.worker_name.clone(),
            provider_node: Some(provider_info.node_name.clone()),
            global_watermark: Some(start_tick),
            combined_queue: combined_queue.map(str::to_string),
        })
        .await
        .map_err(|err| incomplete("create node", err))?;

        info!(
            queue = %self.queue,
            node = %setup.node_name,
            node_type = %node_type,
            provider = %provider_info.node_name,
            tick_id = start_tick,
            "created node"
        );

        Ok(())
    }

    /// Registers `location` on the provider and every node above it up to the root. The root
    /// re-announces it down the cascade.
    async fn announce_upstream(
        &self,
        provider: &C::Node,
        location: &NodeLocation,
    ) -> CascadeResult<()> {
        let mut current = provider.clone();

        for _ in 0..MAX_CASCADE_DEPTH {
            current.register_location(&self.queue, location).await?;

            let info = current.get_node_info(&self.queue).await?;
            match (info.node_type, info.provider_location) {
                (NodeType::Root, _) | (_, None) => return Ok(()),
                (_, Some(upstream)) => current = self.node(&upstream)?,
            }
        }

        bail!(
            ErrorKind::ConfigError,
            "Provider chain does not end in a root",
            format!("queue {} deeper than {MAX_CASCADE_DEPTH} nodes", self.queue)
        )
    }

    /// Removes the node at `location` from the cascade. A node with subscribers is refused.
    pub async fn drop_node(&self, location: &str) -> CascadeResult<()> {
        let node = self.node(location)?;
        let info = node.get_node_info(&self.queue).await?;

        let subscribers = node.get_subscriber_info(&self.queue).await?;
        if !subscribers.is_empty() {
            let names: Vec<_> = subscribers
                .into_iter()
                .map(|subscriber| subscriber.node_name)
                .collect();
            bail!(
                ErrorKind::NodeCommandFailed,
                "Node still has subscribers",
                format!("{}: {}", info.node_name, names.join(", "))
            );
        }

        if let Some(provider_location) = &info.provider_location {
            let provider = self.node(provider_location)?;
            if let Err(err) = provider.unregister_subscriber(&self.queue, &info.node_name).await {
                warn!(
                    node = %info.node_name,
                    error = %err.summary(),
                    "could not unregister from provider"
                );
            }
        }

        for location in node.get_queue_locations(&self.queue).await? {
            if location.dead || location.node_name == info.node_name {
                continue;
            }
            let result = match self.node(&location.location) {
                Ok(other) => other.unregister_location(&self.queue, &info.node_name).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(
                    node = %location.node_name,
                    error = %err.summary(),
                    "could not remove location of dropped node"
                );
            }
        }

        node.drop_node(&self.queue, &info.node_name)
            .await
            .map_err(|err| incomplete("drop node row", err))?;

        info!(queue = %self.queue, node = %info.node_name, "dropped node");

        Ok(())
    }

    /// Renames the node at `location`: first in the location tables of every reachable node,
    /// then on the node itself.
    pub async fn rename_node(&self, location: &str, new_name: &str) -> CascadeResult<()> {
        let node = self.node(location)?;
        let info = node.get_node_info(&self.queue).await?;
        let old_name = info.node_name.as_str();
        if old_name == new_name {
            return Ok(());
        }

        for other in node.get_queue_locations(&self.queue).await? {
            if other.dead || other.node_name == old_name {
                continue;
            }
            let result = match self.node(&other.location) {
                Ok(peer) => peer.rename_node_step1(&self.queue, old_name, new_name).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(node = %other.node_name, error = %err.summary(), "could not rename on node");
            }
        }

        node.rename_node_step1(&self.queue, old_name, new_name)
            .await
            .map_err(|err| incomplete("rename in own location table", err))?;
        node.rename_node_step2(&self.queue, old_name, new_name)
            .await
            .map_err(|err| incomplete("rename node row", err))?;

        info!(queue = %self.queue, old_name, new_name, "renamed node");

        Ok(())
    }
}
