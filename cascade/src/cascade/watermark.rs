//! Watermark publishing.
//!
//! Local watermarks flow upward: every subscriber periodically reports the last tick it no longer
//! needs to its provider. The root turns the minimum of its subscribers into the global
//! watermark and broadcasts it downward as a control event. Branches listed in a
//! `sync_watermark` attribute merge their local watermarks so parallel branches can replace
//! each other after a failover.

use std::time::Duration;

use cascade_config::shared::{PeerTimeoutPolicy, WatermarkConfig};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cascade::worker_state::WorkerState;
use crate::error::{CascadeResult, ErrorKind};
use crate::metrics::{CASCADE_WATERMARK_PUBLISH_TOTAL, SCOPE_LABEL};
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::types::NodeInfo;
use crate::{bail, cascade_error};

/// Result of asking peers for their local watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMerge {
    /// Minimum over the own watermark and every answering peer.
    Merged(i64),
    /// A peer did not answer and the policy holds the round.
    Held,
}

/// Merges the own watermark with the watermarks read from peers.
///
/// `peers` holds `None` for every peer that could not be read.
pub fn merge_peer_watermarks(
    own: i64,
    peers: &[(String, Option<i64>)],
    policy: PeerTimeoutPolicy,
) -> PeerMerge {
    let mut merged = own;
    for (_, watermark) in peers {
        match (watermark, policy) {
            (Some(watermark), _) => merged = merged.min(*watermark),
            (None, PeerTimeoutPolicy::Hold) => return PeerMerge::Held,
            (None, PeerTimeoutPolicy::Ignore) => {}
        }
    }

    PeerMerge::Merged(merged)
}

/// Periodic publisher of local and global watermarks for one worker.
#[derive(Debug)]
pub struct WatermarkPublisher {
    config: WatermarkConfig,
    last_local_publish: Option<Instant>,
    last_global_publish: Option<Instant>,
    /// Highest watermark reported upstream by this process.
    published: Option<i64>,
    /// Latest global watermark broadcast from upstream, kept for the peer merge.
    upstream_global: Option<i64>,
}

fn is_due(last: Option<Instant>, period: Duration) -> bool {
    last.is_none_or(|last| last.elapsed() >= period)
}

impl WatermarkPublisher {
    pub fn new(config: WatermarkConfig) -> Self {
        WatermarkPublisher {
            config,
            last_local_publish: None,
            last_global_publish: None,
            published: None,
            upstream_global: None,
        }
    }

    /// Remembers the global watermark an upstream broadcast carried.
    pub fn note_upstream_global(&mut self, tick_id: i64) {
        self.upstream_global = Some(self.upstream_global.map_or(tick_id, |wm| wm.max(tick_id)));
    }

    /// Returns `true` when a local publish would happen now.
    pub fn local_due(&self, state: &WorkerState) -> bool {
        state.local_wm_publish
            && is_due(self.last_local_publish, self.config.local_publish_period())
    }

    /// Lets a root derive and broadcast the global watermark once the period has passed.
    pub async fn maybe_publish_global<N: NodeRpc>(
        &mut self,
        local: &N,
        queue: &str,
    ) -> CascadeResult<bool> {
        if !is_due(self.last_global_publish, self.config.global_publish_period()) {
            return Ok(false);
        }

        local.set_global_watermark(queue, None).await?;
        self.last_global_publish = Some(Instant::now());
        counter!(CASCADE_WATERMARK_PUBLISH_TOTAL, SCOPE_LABEL => "global").increment(1);
        debug!(queue, "broadcast global watermark");

        Ok(true)
    }

    /// Reports the local watermark to the provider once the period has passed.
    ///
    /// The reported value is never lower than one reported before by this publisher.
    pub async fn maybe_publish_local<C: NodeConnector>(
        &mut self,
        connector: &C,
        local: &C::Node,
        provider: &C::Node,
        queue: &str,
        node: &NodeInfo,
        state: &WorkerState,
        cur_tick_id: i64,
    ) -> CascadeResult<bool> {
        if !self.local_due(state) {
            return Ok(false);
        }

        let mut watermark = node.local_watermark.min(cur_tick_id);

        if state.sync_watermark {
            let peers = self.read_peer_watermarks(connector, local, queue, node, state).await?;
            match merge_peer_watermarks(watermark, &peers, self.config.peer_timeout_policy) {
                PeerMerge::Merged(merged) => watermark = merged,
                PeerMerge::Held => {
                    warn!(queue, "a watermark peer did not answer, holding this round");
                    self.last_local_publish = Some(Instant::now());
                    return Ok(false);
                }
            }

            // Peers keep queue data until all of them passed it.
            let global = self
                .upstream_global
                .map_or(watermark, |upstream| upstream.min(watermark));
            if global > node.global_watermark {
                info!(queue, global_watermark = global, "raising merged global watermark");
                local.set_global_watermark(queue, Some(global)).await?;
            }
        }

        self.last_local_publish = Some(Instant::now());
        if self.published.is_some_and(|published| watermark <= published) {
            return Ok(false);
        }

        provider
            .set_subscriber_watermark(queue, &node.node_name, watermark)
            .await?;
        self.published = Some(watermark);
        counter!(CASCADE_WATERMARK_PUBLISH_TOTAL, SCOPE_LABEL => "local").increment(1);
        debug!(queue, watermark, "published local watermark");

        Ok(true)
    }

    async fn read_peer_watermarks<C: NodeConnector>(
        &self,
        connector: &C,
        local: &C::Node,
        queue: &str,
        node: &NodeInfo,
        state: &WorkerState,
    ) -> CascadeResult<Vec<(String, Option<i64>)>> {
        let locations = local.get_queue_locations(queue).await?;
        let mut peers = Vec::new();

        for peer in state.wm_sync_nodes.iter().filter(|peer| **peer != node.node_name) {
            let location = locations
                .iter()
                .find(|location| &location.node_name == peer && !location.dead);
            let watermark = match location {
                Some(location) => {
                    match self.read_peer(connector, &location.location, queue, peer).await {
                        Ok(watermark) => Some(watermark),
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "watermark peer is unreachable");
                            None
                        }
                    }
                }
                None => {
                    warn!(peer = %peer, "watermark peer has no registered location");
                    None
                }
            };
            peers.push((peer.clone(), watermark));
        }

        Ok(peers)
    }

    async fn read_peer<C: NodeConnector>(
        &self,
        connector: &C,
        location: &str,
        queue: &str,
        peer: &str,
    ) -> CascadeResult<i64> {
        let read = async {
            let node = connector.connect(location)?;
            node.get_node_info(queue).await
        };

        match tokio::time::timeout(self.config.peer_timeout(), read).await {
            Ok(Ok(info)) => Ok(info.local_watermark),
            Ok(Err(err)) => Err(cascade_error!(
                ErrorKind::PeerUnreachable,
                "Could not read peer watermark",
                format!("{peer}: {err}")
            )),
            Err(_) => bail!(
                ErrorKind::PeerUnreachable,
                "Peer watermark read timed out",
                format!("{peer} after {:?}", self.config.peer_timeout())
            ),
        }
    }
}
