use std::future::Future;

use crate::error::CascadeResult;
use crate::queue::base::BatchSource;
use crate::store::base::{CopyClaims, CopySource, TableRegistry, TargetStore};
use crate::types::{ConsumerState, NodeInfo, NodeLocation, NodeType, SubscriberInfo};

/// Reads and flags the progress rows of a node's consumers.
///
/// Advancing the completed tick is not part of this trait: it must happen inside the batch
/// transaction, see [`TargetTx::set_consumer_completed`](crate::store::base::TargetTx::set_consumer_completed).
pub trait ProgressTracker {
    /// Returns the node row of `queue` on this database.
    fn get_node_info(&self, queue: &str) -> impl Future<Output = CascadeResult<NodeInfo>> + Send;

    /// Returns the state of a local consumer, `None` when it is not registered.
    fn get_consumer_state(
        &self,
        queue: &str,
        consumer: &str,
    ) -> impl Future<Output = CascadeResult<Option<ConsumerState>>> + Send;

    /// Acknowledges (or resets) the latest control-plane change seen by the worker.
    fn set_consumer_uptodate(
        &self,
        queue: &str,
        consumer: &str,
        uptodate: bool,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Stores the last worker error, `None` clearing it.
    fn set_consumer_error(
        &self,
        queue: &str,
        consumer: &str,
        error: Option<&str>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;
}

/// Parameters for creating a node row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub queue: String,
    pub node_type: NodeType,
    pub node_name: String,
    pub worker_name: String,
    pub provider_node: Option<String>,
    pub global_watermark: Option<i64>,
    pub combined_queue: Option<String>,
}

/// Node-level RPC surface used by the worker and the control plane.
pub trait NodeRpc: ProgressTracker {
    fn set_consumer_paused(
        &self,
        queue: &str,
        consumer: &str,
        paused: bool,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn change_consumer_provider(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Creates the local progress row of a consumer reading from `provider_node`.
    fn register_node_consumer(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn unregister_node_consumer(
        &self,
        queue: &str,
        consumer: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Subscribes `node` to this node's queue. Returns the starting tick.
    fn register_subscriber(
        &self,
        queue: &str,
        node: &str,
        worker: &str,
        tick_id: Option<i64>,
    ) -> impl Future<Output = CascadeResult<Option<i64>>> + Send;

    fn unregister_subscriber(
        &self,
        queue: &str,
        node: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn set_subscriber_watermark(
        &self,
        queue: &str,
        node: &str,
        tick_id: i64,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Sets the global watermark; on a root `None` derives it from the subscribers and
    /// broadcasts it down the cascade.
    fn set_global_watermark(
        &self,
        queue: &str,
        tick_id: Option<i64>,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn register_location(
        &self,
        queue: &str,
        location: &NodeLocation,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn unregister_location(
        &self,
        queue: &str,
        node: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn get_queue_locations(
        &self,
        queue: &str,
    ) -> impl Future<Output = CascadeResult<Vec<NodeLocation>>> + Send;

    fn get_subscriber_info(
        &self,
        queue: &str,
    ) -> impl Future<Output = CascadeResult<Vec<SubscriberInfo>>> + Send;

    fn create_node(&self, node: &NewNode) -> impl Future<Output = CascadeResult<()>> + Send;

    fn drop_node(&self, queue: &str, node: &str) -> impl Future<Output = CascadeResult<()>> + Send;

    /// Runs one step of the root demotion: 1 freezes, 2 returns the last tick, 3 converts the
    /// node into a branch of `new_provider`.
    fn demote_root(
        &self,
        queue: &str,
        step: i32,
        new_provider: &str,
    ) -> impl Future<Output = CascadeResult<Option<i64>>> + Send;

    fn promote_branch(&self, queue: &str) -> impl Future<Output = CascadeResult<()>> + Send;

    fn rename_node_step1(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;

    fn rename_node_step2(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> impl Future<Output = CascadeResult<()>> + Send;
}

/// Opens connections to nodes by their registered location.
pub trait NodeConnector: Clone + Send + Sync + 'static {
    type Node: CascadeNode;

    /// Returns a handle for the node at `location`.
    ///
    /// Connections may be established lazily, an unreachable node then fails on first use.
    fn connect(&self, location: &str) -> CascadeResult<Self::Node>;
}

/// Everything a worker or the control plane needs from one node database.
pub trait CascadeNode:
    NodeRpc
    + BatchSource
    + TargetStore
    + TableRegistry
    + CopySource
    + CopyClaims
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> CascadeNode for T where
    T: NodeRpc
        + BatchSource
        + TargetStore
        + TableRegistry
        + CopySource
        + CopyClaims
        + Clone
        + Send
        + Sync
        + 'static
{
}
