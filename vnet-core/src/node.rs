//! Types describing an emulated node that both the controller and the compute
//! hosts agree on.

use crate::{port::PortInfo, Id};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The emulation backend a node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Vpcs,
    #[serde(rename = "traceng")]
    TraceNg,
    Iou,
    Qemu,
}

impl NodeType {
    /// The name used in RPC paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vpcs => "vpcs",
            NodeType::TraceNg => "traceng",
            NodeType::Iou => "iou",
            NodeType::Qemu => "qemu",
        }
    }

    /// Whether the backend taps its own traffic, which makes it the better
    /// side of a link to run a packet capture on.
    pub fn inline_capture(&self) -> bool {
        matches!(self, NodeType::Iou)
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        [Self::Vpcs, Self::TraceNg, Self::Iou, Self::Qemu]
            .into_iter()
            .find(|node_type| node_type.as_str() == segment)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of a node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A point-in-time view of a node, as published on the notification bus and
/// returned by compute RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: Id,
    pub project_id: Id,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub console: Option<u16>,
    pub command_line: String,
    pub ports: Vec<PortInfo>,
}
