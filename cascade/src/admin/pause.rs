use tracing::info;

use crate::admin::ControlPlane;
use crate::concurrency::wait::poll_until;
use crate::error::CascadeResult;
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};

impl<C: NodeConnector> ControlPlane<C> {
    /// Pauses the worker of the node at `location` and waits until the worker parked.
    pub async fn pause_node(&self, location: &str) -> CascadeResult<()> {
        self.set_paused(location, true).await
    }

    /// Resumes the worker of the node at `location` and waits until the worker saw it.
    pub async fn resume_node(&self, location: &str) -> CascadeResult<()> {
        self.set_paused(location, false).await
    }

    async fn set_paused(&self, location: &str, paused: bool) -> CascadeResult<()> {
        let node = self.node(location)?;
        let (info, worker) = self.node_worker(&node).await?;

        node.set_consumer_paused(&self.queue, &worker, paused).await?;
        self.wait_uptodate(&node, &worker).await?;

        info!(
            queue = %self.queue,
            node = %info.node_name,
            worker = %worker,
            paused,
            "worker acknowledged pause flag"
        );

        Ok(())
    }

    /// Waits for the rendezvous signal of a worker: the `uptodate` flag it sets once it observed
    /// the latest change of its consumer row.
    pub(crate) async fn wait_uptodate(&self, node: &C::Node, worker: &str) -> CascadeResult<()> {
        let queue = self.queue.as_str();
        poll_until(
            "worker acknowledging the control change",
            self.config.poll(),
            self.config.rendezvous_timeout(),
            || async move {
                let state = node.get_consumer_state(queue, worker).await?;
                Ok(state.is_some_and(|state| state.uptodate))
            },
        )
        .await
    }
}
