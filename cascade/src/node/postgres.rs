use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cascade_postgres::connect::connect_location_lazy;
use cascade_postgres::pgq_node;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NewNode, NodeConnector, NodeRpc, ProgressTracker};
use crate::types::{ConsumerState, NodeInfo, NodeLocation, SubscriberInfo};
use crate::cascade_error;

/// A node database reached through a lazily connecting pool.
#[derive(Debug, Clone)]
pub struct PgNode {
    location: Arc<str>,
    pool: PgPool,
}

impl PgNode {
    pub fn new(location: &str, pool: PgPool) -> Self {
        Self {
            location: Arc::from(location),
            pool,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Hands out [`PgNode`]s, sharing one pool per location.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    pools: Arc<Mutex<HashMap<String, PgPool>>>,
}

impl PgConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeConnector for PgConnector {
    type Node = PgNode;

    fn connect(&self, location: &str) -> CascadeResult<PgNode> {
        let mut pools = self.pools.lock().map_err(|_| {
            cascade_error!(
                ErrorKind::WorkerPanic,
                "Connection pool registry is poisoned"
            )
        })?;

        if let Some(pool) = pools.get(location) {
            return Ok(PgNode::new(location, pool.clone()));
        }

        debug!("creating connection pool for node location");
        let pool = connect_location_lazy(location)?;
        pools.insert(location.to_string(), pool.clone());

        Ok(PgNode::new(location, pool))
    }
}

impl ProgressTracker for PgNode {
    async fn get_node_info(&self, queue: &str) -> CascadeResult<NodeInfo> {
        let row = pgq_node::get_node_info(&self.pool, queue).await?;

        NodeInfo::try_from(row)
    }

    async fn get_consumer_state(
        &self,
        queue: &str,
        consumer: &str,
    ) -> CascadeResult<Option<ConsumerState>> {
        let row = pgq_node::get_consumer_state(&self.pool, queue, consumer).await?;

        row.map(ConsumerState::try_from).transpose()
    }

    async fn set_consumer_uptodate(
        &self,
        queue: &str,
        consumer: &str,
        uptodate: bool,
    ) -> CascadeResult<()> {
        pgq_node::set_consumer_uptodate(&self.pool, queue, consumer, uptodate).await?;

        Ok(())
    }

    async fn set_consumer_error(
        &self,
        queue: &str,
        consumer: &str,
        error: Option<&str>,
    ) -> CascadeResult<()> {
        pgq_node::set_consumer_error(&self.pool, queue, consumer, error).await?;

        Ok(())
    }
}

impl NodeRpc for PgNode {
    async fn set_consumer_paused(
        &self,
        queue: &str,
        consumer: &str,
        paused: bool,
    ) -> CascadeResult<()> {
        pgq_node::set_consumer_paused(&self.pool, queue, consumer, paused).await?;

        Ok(())
    }

    async fn change_consumer_provider(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
    ) -> CascadeResult<()> {
        pgq_node::change_consumer_provider(&self.pool, queue, consumer, provider_node).await?;

        Ok(())
    }

    async fn register_node_consumer(
        &self,
        queue: &str,
        consumer: &str,
        provider_node: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        pgq_node::register_consumer(&self.pool, queue, consumer, provider_node, tick_id).await?;

        Ok(())
    }

    async fn unregister_node_consumer(&self, queue: &str, consumer: &str) -> CascadeResult<()> {
        pgq_node::unregister_consumer(&self.pool, queue, consumer).await?;

        Ok(())
    }

    async fn register_subscriber(
        &self,
        queue: &str,
        node: &str,
        worker: &str,
        tick_id: Option<i64>,
    ) -> CascadeResult<Option<i64>> {
        let tick_id =
            pgq_node::register_subscriber(&self.pool, queue, node, worker, tick_id).await?;

        Ok(tick_id)
    }

    async fn unregister_subscriber(&self, queue: &str, node: &str) -> CascadeResult<()> {
        pgq_node::unregister_subscriber(&self.pool, queue, node).await?;

        Ok(())
    }

    async fn set_subscriber_watermark(
        &self,
        queue: &str,
        node: &str,
        tick_id: i64,
    ) -> CascadeResult<()> {
        pgq_node::set_subscriber_watermark(&self.pool, queue, node, tick_id).await?;

        Ok(())
    }

    async fn set_global_watermark(&self, queue: &str, tick_id: Option<i64>) -> CascadeResult<()> {
        pgq_node::set_global_watermark(&self.pool, queue, tick_id).await?;

        Ok(())
    }

    async fn register_location(&self, queue: &str, location: &NodeLocation) -> CascadeResult<()> {
        pgq_node::register_location(
            &self.pool,
            queue,
            &location.node_name,
            &location.location,
            location.dead,
        )
        .await?;

        Ok(())
    }

    async fn unregister_location(&self, queue: &str, node: &str) -> CascadeResult<()> {
        pgq_node::unregister_location(&self.pool, queue, node).await?;

        Ok(())
    }

    async fn get_queue_locations(&self, queue: &str) -> CascadeResult<Vec<NodeLocation>> {
        let rows = pgq_node::get_queue_locations(&self.pool, queue).await?;

        Ok(rows.into_iter().map(NodeLocation::from).collect())
    }

    async fn get_subscriber_info(&self, queue: &str) -> CascadeResult<Vec<SubscriberInfo>> {
        let rows = pgq_node::get_subscriber_info(&self.pool, queue).await?;

        Ok(rows.into_iter().map(SubscriberInfo::from).collect())
    }

    async fn create_node(&self, node: &NewNode) -> CascadeResult<()> {
        pgq_node::create_node(
            &self.pool,
            &node.queue,
            node.node_type.as_str(),
            &node.node_name,
            &node.worker_name,
            node.provider_node.as_deref(),
            node.global_watermark,
            node.combined_queue.as_deref(),
        )
        .await?;

        Ok(())
    }

    async fn drop_node(&self, queue: &str, node: &str) -> CascadeResult<()> {
        pgq_node::drop_node(&self.pool, queue, node).await?;

        Ok(())
    }

    async fn demote_root(
        &self,
        queue: &str,
        step: i32,
        new_provider: &str,
    ) -> CascadeResult<Option<i64>> {
        let tick_id = pgq_node::demote_root(&self.pool, queue, step, new_provider).await?;

        Ok(tick_id)
    }

    async fn promote_branch(&self, queue: &str) -> CascadeResult<()> {
        pgq_node::promote_branch(&self.pool, queue).await?;

        Ok(())
    }

    async fn rename_node_step1(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> CascadeResult<()> {
        pgq_node::rename_node_step1(&self.pool, queue, old_name, new_name).await?;

        Ok(())
    }

    async fn rename_node_step2(
        &self,
        queue: &str,
        old_name: &str,
        new_name: &str,
    ) -> CascadeResult<()> {
        pgq_node::rename_node_step2(&self.pool, queue, old_name, new_name).await?;

        Ok(())
    }
}
