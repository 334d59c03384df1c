//! The controller's view of a node living on some compute host.

use serde_json::json;
use std::{fmt, sync::Arc};
use vnet_core::{
    compute::RemoteError,
    node::{NodeSnapshot, NodeType},
    port::{PortAddress, PortInfo},
    ComputeHandle, Id,
};

/// A handle on a node. Everything it does goes through the node's compute
/// host; the node's state lives there, not here.
#[derive(Clone)]
pub struct Node {
    id: Id,
    project_id: Id,
    name: String,
    node_type: NodeType,
    compute: Arc<dyn ComputeHandle>,
    ports: Vec<PortInfo>,
}

impl Node {
    /// Creates the node on `compute` and learns its ports from the answer.
    pub async fn create(
        project_id: Id,
        compute: Arc<dyn ComputeHandle>,
        name: impl Into<String>,
        node_type: NodeType,
    ) -> Result<Self, RemoteError> {
        let name = name.into();
        let path = format!("/projects/{}/{}/nodes", project_id, node_type);
        let snapshot: NodeSnapshot = compute
            .post(&path, Some(json!({ "name": name })))
            .await?
            .decode(compute.id())?;
        tracing::info!(node = %snapshot.node_id, name = %name, compute = compute.id(), "Node created");
        Ok(Self::new(
            snapshot.node_id,
            project_id,
            snapshot.name,
            node_type,
            compute,
            snapshot.ports,
        ))
    }

    /// Builds a handle for a node that already exists on `compute`.
    pub fn new(
        id: Id,
        project_id: Id,
        name: impl Into<String>,
        node_type: NodeType,
        compute: Arc<dyn ComputeHandle>,
        ports: Vec<PortInfo>,
    ) -> Self {
        Self {
            id,
            project_id,
            name: name.into(),
            node_type,
            compute,
            ports,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn project_id(&self) -> Id {
        self.project_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn compute(&self) -> &Arc<dyn ComputeHandle> {
        &self.compute
    }

    pub fn ports(&self) -> &[PortInfo] {
        &self.ports
    }

    pub fn port(&self, adapter_number: u32, port_number: u32) -> Option<&PortInfo> {
        let address = PortAddress::new(adapter_number, port_number);
        self.ports.iter().find(|port| port.address == address)
    }

    /// Whether captures on links of this node are best run on this side.
    pub fn inline_capture(&self) -> bool {
        self.node_type.inline_capture()
    }

    /// The RPC path of the node on its compute host.
    pub fn node_path(&self) -> String {
        format!("/projects/{}/{}/nodes/{}", self.project_id, self.node_type, self.id)
    }

    /// The RPC path of one of the node's ports.
    pub fn port_path(&self, address: PortAddress) -> String {
        format!(
            "{}/adapters/{}/ports/{}",
            self.node_path(),
            address.adapter_number,
            address.port_number
        )
    }

    async fn lifecycle(&self, action: &str) -> Result<NodeSnapshot, RemoteError> {
        let path = format!("{}/{}", self.node_path(), action);
        let snapshot = self
            .compute
            .post(&path, None)
            .await?
            .decode(self.compute.id())?;
        tracing::info!(node = %self.id, action, "Node lifecycle request done");
        Ok(snapshot)
    }

    pub async fn start(&self) -> Result<NodeSnapshot, RemoteError> {
        self.lifecycle("start").await
    }

    pub async fn stop(&self) -> Result<NodeSnapshot, RemoteError> {
        self.lifecycle("stop").await
    }

    pub async fn reload(&self) -> Result<NodeSnapshot, RemoteError> {
        self.lifecycle("reload").await
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, RemoteError> {
        self.compute
            .get(&self.node_path())
            .await?
            .decode(self.compute.id())
    }

    /// Deletes the node on its compute host, closing it there.
    pub async fn delete(&self) -> Result<(), RemoteError> {
        self.compute.delete(&self.node_path()).await?;
        tracing::info!(node = %self.id, "Node deleted");
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("compute", &self.compute.id())
            .finish()
    }
}
