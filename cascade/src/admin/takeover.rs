//! Root failover and recovery of a root that kept running after it was failed over.

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::admin::{ControlPlane, incomplete};
use crate::bail;
use crate::concurrency::wait::poll_until;
use crate::error::{CascadeError, CascadeResult, ErrorKind};
use crate::node::base::{NodeConnector, NodeRpc, ProgressTracker};
use crate::queue::base::{BatchSource, EventStream};
use crate::types::{BatchThresholds, FetchMode, NodeInfo, NodeLocation, NodeType};

/// Name of the consumer marking where a root was failed over without its cooperation.
pub fn gravestone_consumer_name(old_root: &str) -> String {
    format!(".{old_root}.gravestone")
}

fn resurrect_consumer_name(old_root: &str) -> String {
    format!(".{old_root}.resurrect")
}

/// Path the takeover took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverMode {
    /// The old root was reachable and was demoted step by step.
    Graceful,
    /// The old root was unreachable; the candidate was promoted on its own.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverReport {
    pub mode: TakeoverMode,
    /// Last tick of the old root that is part of the new history.
    pub tick_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResurrectReport {
    pub tick_id: i64,
    pub dumped_events: u64,
    pub dump_file: PathBuf,
}

fn is_unreachable(err: &CascadeError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionFailed
            | ErrorKind::PeerUnreachable
            | ErrorKind::SourceConnectionFailed
            | ErrorKind::TargetConnectionFailed
            | ErrorKind::Timeout
    )
}

impl<C: NodeConnector> ControlPlane<C> {
    /// Makes the branch at `candidate_location` the root of the queue in place of `old_root`.
    pub async fn takeover(
        &self,
        candidate_location: &str,
        old_root: &str,
    ) -> CascadeResult<TakeoverReport> {
        let candidate = self.node(candidate_location)?;
        let (candidate_info, candidate_worker) = self.node_worker(&candidate).await?;

        if candidate_info.node_type != NodeType::Branch {
            bail!(
                ErrorKind::InvalidNodeType,
                "Only a branch can take over the root",
                format!("{} is a {}", candidate_info.node_name, candidate_info.node_type)
            );
        }
        if candidate_info.provider_node.as_deref() != Some(old_root) {
            bail!(
                ErrorKind::ConfigError,
                "Candidate does not read from the old root",
                format!(
                    "{} reads from {:?}, not {old_root}",
                    candidate_info.node_name, candidate_info.provider_node
                )
            );
        }

        let old_location = self.locate(&candidate, old_root).await?;
        let old = self.node(&old_location.location)?;

        match old.get_node_info(&self.queue).await {
            Ok(old_info) => {
                self.takeover_graceful(
                    candidate_location,
                    &candidate,
                    &candidate_worker,
                    &candidate_info,
                    &old,
                    &old_info,
                )
                .await
            }
            Err(err) if is_unreachable(&err) => {
                warn!(
                    old_root,
                    error = %err.summary(),
                    "old root is unreachable, promoting candidate directly"
                );
                self.takeover_direct(
                    candidate_location,
                    &candidate,
                    &candidate_worker,
                    &candidate_info,
                    old_location,
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    async fn takeover_graceful(
        &self,
        candidate_location: &str,
        candidate: &C::Node,
        candidate_worker: &str,
        candidate_info: &NodeInfo,
        old: &C::Node,
        old_info: &NodeInfo,
    ) -> CascadeResult<TakeoverReport> {
        if old_info.node_type != NodeType::Root {
            bail!(
                ErrorKind::InvalidNodeType,
                "Node being taken over is not the root",
                format!("{} is a {}", old_info.node_name, old_info.node_type)
            );
        }
        let Some(old_worker) = old_info.worker_name.clone() else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Root has no worker",
                old_info.node_name.clone()
            );
        };
        let candidate_name = candidate_info.node_name.as_str();

        old.demote_root(&self.queue, 1, candidate_name).await?;
        info!(old_root = %old_info.node_name, "old root frozen");

        let Some(last_tick) = old
            .demote_root(&self.queue, 2, candidate_name)
            .await
            .map_err(|err| incomplete("drain old root", err))?
        else {
            bail!(
                ErrorKind::TopologyChangeIncomplete,
                "Old root did not report its last tick",
                old_info.node_name.clone()
            );
        };

        let queue = self.queue.as_str();
        poll_until(
            "candidate reaching the last tick of the old root",
            self.config.poll(),
            self.config.rendezvous_timeout(),
            || async move {
                let state = candidate.get_consumer_state(queue, candidate_worker).await?;
                Ok(state.is_some_and(|state| state.completed_tick >= last_tick))
            },
        )
        .await
        .map_err(|err| incomplete("wait for candidate to catch up", err))?;

        self.pause_node(candidate_location)
            .await
            .map_err(|err| incomplete("pause candidate", err))?;
        candidate
            .promote_branch(&self.queue)
            .await
            .map_err(|err| incomplete("promote candidate", err))?;
        candidate
            .register_subscriber(&self.queue, &old_info.node_name, &old_worker, Some(last_tick))
            .await
            .map_err(|err| incomplete("subscribe old root to candidate", err))?;
        old.demote_root(&self.queue, 3, candidate_name)
            .await
            .map_err(|err| incomplete("convert old root into branch", err))?;
        self.resume_node(candidate_location)
            .await
            .map_err(|err| incomplete("resume candidate", err))?;

        info!(
            queue = %self.queue,
            new_root = candidate_name,
            old_root = %old_info.node_name,
            tick_id = last_tick,
            "graceful takeover finished"
        );

        Ok(TakeoverReport {
            mode: TakeoverMode::Graceful,
            tick_id: last_tick,
        })
    }

    async fn takeover_direct(
        &self,
        candidate_location: &str,
        candidate: &C::Node,
        candidate_worker: &str,
        candidate_info: &NodeInfo,
        mut old_location: NodeLocation,
    ) -> CascadeResult<TakeoverReport> {
        let candidate_name = candidate_info.node_name.as_str();

        self.pause_node(candidate_location).await?;

        let Some(state) = candidate.get_consumer_state(&self.queue, candidate_worker).await? else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Paused candidate lost its consumer state",
                candidate_worker.to_string()
            );
        };
        let tick_id = state.completed_tick;

        candidate
            .promote_branch(&self.queue)
            .await
            .map_err(|err| incomplete("promote candidate", err))?;
        candidate
            .register_consumer(
                &self.queue,
                &gravestone_consumer_name(&old_location.node_name),
                Some(tick_id),
            )
            .await
            .map_err(|err| incomplete("register gravestone", err))?;

        let locations = candidate.get_queue_locations(&self.queue).await?;
        for location in locations {
            if location.dead
                || location.node_name == candidate_name
                || location.node_name == old_location.node_name
            {
                continue;
            }

            if let Err(err) = self
                .rewire_orphan(candidate_name, &old_location.node_name, &location, tick_id)
                .await
            {
                if is_unreachable(&err) {
                    warn!(
                        node = %location.node_name,
                        error = %err.summary(),
                        "skipping unreachable node"
                    );
                    continue;
                }
                return Err(incomplete("move subscribers of the old root", err));
            }
        }

        old_location.dead = true;
        candidate
            .register_location(&self.queue, &old_location)
            .await
            .map_err(|err| incomplete("mark old root dead", err))?;
        self.resume_node(candidate_location)
            .await
            .map_err(|err| incomplete("resume candidate", err))?;

        info!(
            queue = %self.queue,
            new_root = candidate_name,
            old_root = %old_location.node_name,
            tick_id,
            "direct takeover finished"
        );

        Ok(TakeoverReport {
            mode: TakeoverMode::Direct,
            tick_id,
        })
    }

    /// Moves a direct subscriber of the dead root under the new root. The old root cannot be
    /// told, its subscription stays behind.
    async fn rewire_orphan(
        &self,
        new_root: &str,
        old_root: &str,
        location: &NodeLocation,
        failover_tick: i64,
    ) -> CascadeResult<()> {
        let node = self.node(&location.location)?;
        let (info, worker) = self.node_worker(&node).await?;
        if info.provider_node.as_deref() != Some(old_root) {
            return Ok(());
        }

        let new_root_location = self.locate(&node, new_root).await?;
        let new_root_node = self.node(&new_root_location.location)?;

        self.pause_node(&location.location).await?;
        let Some(state) = node.get_consumer_state(&self.queue, &worker).await? else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Paused node lost its consumer state",
                worker
            );
        };
        if state.completed_tick > failover_tick {
            warn!(
                node = %info.node_name,
                completed_tick = state.completed_tick,
                failover_tick,
                "node is ahead of the new root, events between the ticks are lost for it"
            );
        }

        new_root_node
            .register_subscriber(&self.queue, &info.node_name, &worker, Some(state.completed_tick))
            .await?;
        node.change_consumer_provider(&self.queue, &worker, new_root)
            .await?;
        self.resume_node(&location.location).await?;

        info!(node = %info.node_name, new_provider = new_root, "moved node to new root");

        Ok(())
    }

    /// Turns a root that kept running after a direct takeover into a branch of `new_root`.
    ///
    /// Every event the old root accepted after the failover tick is written to the dump file as
    /// one JSON object per line and deleted from its queue. The dump file must not exist.
    pub async fn resurrect(
        &self,
        old_location: &str,
        new_root: &str,
    ) -> CascadeResult<ResurrectReport> {
        let old = self.node(old_location)?;
        let (old_info, old_worker) = self.node_worker(&old).await?;
        if old_info.node_type != NodeType::Root {
            bail!(
                ErrorKind::InvalidNodeType,
                "Only a failed over root can be resurrected",
                format!("{} is a {}", old_info.node_name, old_info.node_type)
            );
        }

        let new_root_location = self.locate(&old, new_root).await?;
        let new_root_node = self.node(&new_root_location.location)?;
        let gravestone = gravestone_consumer_name(&old_info.node_name);
        let Some(tick_id) = new_root_node.get_consumer_tick(&self.queue, &gravestone).await? else {
            bail!(
                ErrorKind::TopologyChangeIncomplete,
                "New root has no gravestone for the old root",
                format!("consumer {gravestone} on {new_root}")
            );
        };

        let dump_file = self.config.dump_file.clone();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dump_file)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(
                    ErrorKind::DumpFileExists,
                    "Dump file of a previous resurrect exists",
                    dump_file.display()
                );
            }
            Err(err) => return Err(err.into()),
        };

        let temp_consumer = resurrect_consumer_name(&old_info.node_name);
        old.register_consumer(&self.queue, &temp_consumer, Some(tick_id))
            .await?;
        old.force_tick(&self.queue)
            .await
            .map_err(|err| incomplete("force tick on old root", err))?;

        let mut dumped_events = 0;
        let thresholds = BatchThresholds::default();
        while let Some(batch) = old
            .next_batch(&self.queue, &temp_consumer, &thresholds)
            .await
            .map_err(|err| incomplete("read lost batch", err))?
        {
            let mut stream = old.load_events(&batch, FetchMode::Eager).await?;
            while let Some(chunk) = stream.next_chunk().await? {
                for event in chunk {
                    let mut line = serde_json::to_vec(&event)?;
                    line.push(b'\n');
                    file.write_all(&line).await?;
                    dumped_events += 1;
                }
            }
            file.sync_all().await?;

            let deleted = old
                .delete_batch_events(&self.queue, batch.batch_id)
                .await
                .map_err(|err| incomplete("delete dumped events", err))?;
            old.finish_batch(batch.batch_id).await?;

            info!(
                batch_id = batch.batch_id,
                tick_id = batch.cur_tick_id,
                deleted,
                "dumped lost batch"
            );
        }
        file.flush().await?;
        file.sync_all().await?;

        old.unregister_consumer(&self.queue, &temp_consumer)
            .await
            .map_err(|err| incomplete("remove dump consumer", err))?;
        old.drop_ticks_after(&self.queue, tick_id)
            .await
            .map_err(|err| incomplete("drop ticks after failover", err))?;
        old.demote_root(&self.queue, 3, new_root)
            .await
            .map_err(|err| incomplete("convert old root into branch", err))?;
        new_root_node
            .register_subscriber(&self.queue, &old_info.node_name, &old_worker, Some(tick_id))
            .await
            .map_err(|err| incomplete("subscribe old root to new root", err))?;
        new_root_node
            .unregister_consumer(&self.queue, &gravestone)
            .await
            .map_err(|err| incomplete("remove gravestone", err))?;
        new_root_node
            .register_location(
                &self.queue,
                &NodeLocation {
                    node_name: old_info.node_name.clone(),
                    location: old_location.to_string(),
                    dead: false,
                },
            )
            .await
            .map_err(|err| incomplete("mark old root alive", err))?;

        info!(
            queue = %self.queue,
            node = %old_info.node_name,
            new_root,
            tick_id,
            dumped_events,
            dump_file = %dump_file.display(),
            "resurrect finished"
        );

        Ok(ResurrectReport {
            tick_id,
            dumped_events,
            dump_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade_error;

    #[test]
    fn test_gravestone_name_is_hidden_consumer() {
        assert_eq!(gravestone_consumer_name("root1"), ".root1.gravestone");
    }

    #[test]
    fn test_is_unreachable_only_for_connection_kinds() {
        assert!(is_unreachable(&cascade_error!(ErrorKind::ConnectionFailed, "down")));
        assert!(is_unreachable(&cascade_error!(ErrorKind::Timeout, "slow")));
        assert!(!is_unreachable(&cascade_error!(ErrorKind::InvalidNodeType, "leaf")));
    }
}
