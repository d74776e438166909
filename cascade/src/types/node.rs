use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cascade_postgres::pgq_node::{ConsumerStateRow, LocationRow, NodeInfoRow, SubscriberRow};

use crate::bail;
use crate::conversions::urlenc::decode_map;
use crate::error::{CascadeError, CascadeResult, ErrorKind};

/// Node attribute that turns on watermark synchronization between branch peers.
pub const SYNC_WATERMARK_ATTR: &str = "sync_watermark";

/// Position of a node in the replication tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Root,
    Branch,
    Leaf,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Root => "root",
            NodeType::Branch => "branch",
            NodeType::Leaf => "leaf",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = CascadeError;

    fn from_str(s: &str) -> CascadeResult<Self> {
        match s {
            "root" => Ok(NodeType::Root),
            "branch" => Ok(NodeType::Branch),
            "leaf" => Ok(NodeType::Leaf),
            other => bail!(ErrorKind::InvalidNodeType, "Unknown node type", other),
        }
    }
}

/// Free-form node attributes, stored url-encoded on the node row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAttrs(BTreeMap<String, String>);

impl NodeAttrs {
    pub fn parse(encoded: Option<&str>) -> CascadeResult<Self> {
        let Some(encoded) = encoded else {
            return Ok(NodeAttrs::default());
        };

        let attrs = decode_map(encoded)?
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_default()))
            .collect();

        Ok(NodeAttrs(attrs))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Peer node names listed in the `sync_watermark` attribute.
    pub fn sync_watermark_nodes(&self) -> Option<Vec<String>> {
        self.get(SYNC_WATERMARK_ATTR).map(|nodes| {
            nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Node row of a queue on one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub node_name: String,
    pub global_watermark: i64,
    pub local_watermark: i64,
    pub provider_node: Option<String>,
    pub provider_location: Option<String>,
    pub combined_queue: Option<String>,
    pub combined_type: Option<NodeType>,
    pub worker_name: Option<String>,
    pub worker_paused: bool,
    pub worker_uptodate: bool,
    pub worker_last_tick: Option<i64>,
    pub attrs: NodeAttrs,
}

impl TryFrom<NodeInfoRow> for NodeInfo {
    type Error = CascadeError;

    fn try_from(row: NodeInfoRow) -> CascadeResult<Self> {
        let (Some(node_type), Some(node_name)) = (row.node_type.as_deref(), row.node_name.clone())
        else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Node is not initialized",
                row.ret_note
            );
        };

        Ok(NodeInfo {
            node_type: node_type.parse()?,
            node_name,
            global_watermark: row.global_watermark.unwrap_or_default(),
            local_watermark: row.local_watermark.unwrap_or_default(),
            provider_node: row.provider_node,
            provider_location: row.provider_location,
            combined_queue: row.combined_queue,
            combined_type: row.combined_type.as_deref().map(str::parse).transpose()?,
            worker_name: row.worker_name,
            worker_paused: row.worker_paused.unwrap_or(false),
            worker_uptodate: row.worker_uptodate.unwrap_or(false),
            worker_last_tick: row.worker_last_tick,
            attrs: NodeAttrs::parse(row.node_attrs.as_deref())?,
        })
    }
}

/// Local consumer state of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerState {
    pub node_type: NodeType,
    pub node_name: String,
    pub completed_tick: i64,
    pub provider_node: String,
    pub provider_location: String,
    pub paused: bool,
    pub uptodate: bool,
    pub error: Option<String>,
}

impl TryFrom<ConsumerStateRow> for ConsumerState {
    type Error = CascadeError;

    fn try_from(row: ConsumerStateRow) -> CascadeResult<Self> {
        let (
            Some(node_type),
            Some(node_name),
            Some(completed_tick),
            Some(provider_node),
            Some(provider_location),
        ) = (
            row.node_type.as_deref(),
            row.node_name,
            row.completed_tick,
            row.provider_node,
            row.provider_location,
        ) else {
            bail!(
                ErrorKind::MissingConsumerState,
                "Consumer state is incomplete",
                row.ret_note
            );
        };

        Ok(ConsumerState {
            node_type: node_type.parse()?,
            node_name,
            completed_tick,
            provider_node,
            provider_location,
            paused: row.paused.unwrap_or(false),
            uptodate: row.uptodate.unwrap_or(false),
            error: row.cur_error,
        })
    }
}

/// A registered node location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLocation {
    pub node_name: String,
    pub location: String,
    pub dead: bool,
}

impl From<LocationRow> for NodeLocation {
    fn from(row: LocationRow) -> Self {
        NodeLocation {
            node_name: row.node_name,
            location: row.node_location,
            dead: row.dead,
        }
    }
}

/// A direct subscriber of a node and the watermark it last reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub node_name: String,
    pub worker_name: Option<String>,
    pub watermark: Option<i64>,
}

impl From<SubscriberRow> for SubscriberInfo {
    fn from(row: SubscriberRow) -> Self {
        SubscriberInfo {
            node_name: row.node_name,
            worker_name: row.worker_name,
            watermark: row.node_watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_watermark_nodes_are_split() {
        let attrs = NodeAttrs::parse(Some("sync_watermark=b1%2Cb2&other=x")).unwrap();
        assert_eq!(
            attrs.sync_watermark_nodes(),
            Some(vec!["b1".to_string(), "b2".to_string()])
        );
        assert_eq!(attrs.get("other"), Some("x"));
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("branch".parse::<NodeType>().unwrap(), NodeType::Branch);
        assert_eq!(
            "twig".parse::<NodeType>().unwrap_err().kind(),
            ErrorKind::InvalidNodeType
        );
    }
}
