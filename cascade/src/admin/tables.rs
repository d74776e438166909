use tracing::info;

use crate::admin::ControlPlane;
use crate::bail;
use crate::error::{CascadeResult, ErrorKind};
use crate::node::base::{NodeConnector, ProgressTracker};
use crate::replication::handler::build_handler;
use crate::state::table::{Actor, TableAttrs, TablePhase, TableState};
use crate::store::base::TableRegistry;
use crate::types::NodeType;

impl<C: NodeConnector> ControlPlane<C> {
    /// Subscribes the node at `location` to `table`.
    ///
    /// On a root the table is replicated right away. Elsewhere it starts in
    /// [`TablePhase::Missing`] and the worker copies it, which requires the provider to carry
    /// the table.
    pub async fn add_table(
        &self,
        location: &str,
        table: &str,
        mut attrs: TableAttrs,
        dest_table: Option<&str>,
    ) -> CascadeResult<()> {
        let node = self.node(location)?;
        let info = node.get_node_info(&self.queue).await?;

        if self.local_table(&node, table).await?.is_some() {
            info!(node = %info.node_name, table, "table already added");
            return Ok(());
        }

        let handler = build_handler(attrs.handler_spec())?;
        handler.on_table_added(&mut attrs)?;

        let dest = dest_table.unwrap_or(table);
        if handler.needs_destination_table() && !node.table_exists(dest).await? {
            bail!(
                ErrorKind::MissingTableState,
                "Destination table does not exist",
                format!("{dest} on {}", info.node_name)
            );
        }

        if info.node_type != NodeType::Root {
            let Some(provider_location) = &info.provider_location else {
                bail!(
                    ErrorKind::MissingConsumerState,
                    "Node has no provider",
                    info.node_name
                );
            };
            let provider = self.node(provider_location)?;
            if self.local_table(&provider, table).await?.is_none() {
                bail!(
                    ErrorKind::MissingTableState,
                    "Provider does not replicate the table",
                    format!("{table} on {}", info.provider_node.unwrap_or_default())
                );
            }
        }

        node.add_table(&self.queue, table, &attrs, dest_table).await?;

        info!(
            queue = %self.queue,
            node = %info.node_name,
            table,
            handler = handler.name(),
            "added table"
        );

        Ok(())
    }

    pub async fn remove_table(&self, location: &str, table: &str) -> CascadeResult<()> {
        let node = self.node(location)?;
        self.require_local_table(&node, table).await?;

        node.remove_table(&self.queue, table).await?;
        info!(queue = %self.queue, table, "removed table");

        Ok(())
    }

    /// Puts `table` back into [`TablePhase::Missing`] so the worker copies it again.
    pub async fn resync_table(&self, location: &str, table: &str) -> CascadeResult<()> {
        let node = self.node(location)?;
        let state = self.require_local_table(&node, table).await?;

        state
            .phase
            .check_transition(Actor::Admin, &TablePhase::Missing)?;
        node.reset_table(&self.queue, table).await?;

        info!(
            queue = %self.queue,
            table,
            from_phase = state.phase.name(),
            to_phase = TablePhase::Missing.name(),
            "table reset for resync"
        );

        Ok(())
    }

    async fn local_table(&self, node: &C::Node, table: &str) -> CascadeResult<Option<TableState>> {
        let tables = node.load_table_states(&self.queue).await?;
        Ok(tables
            .into_iter()
            .find(|state| state.local && state.name == table))
    }

    async fn require_local_table(&self, node: &C::Node, table: &str) -> CascadeResult<TableState> {
        match self.local_table(node, table).await? {
            Some(state) => Ok(state),
            None => bail!(
                ErrorKind::MissingTableState,
                "Table is not added on the node",
                format!("queue {}: {table}", self.queue)
            ),
        }
    }
}
