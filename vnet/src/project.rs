//! A set of nodes and the links between them, as managed by the controller.

use crate::{
    config::{EndpointConfig, Topology},
    link::{LinkError, UdpLink},
    node::Node,
};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use vnet_core::{
    compute::RemoteError, nio::Filters, node::NodeType, notification::NotificationBus,
    ComputeHandle, Id,
};

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("No node named {0}")]
    UnknownNode(String),
}

pub struct Project {
    id: Id,
    nodes: Vec<Node>,
    links: Vec<UdpLink>,
    bus: NotificationBus,
}

impl Project {
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            id: Id::random(),
            nodes: Vec::new(),
            links: Vec::new(),
            bus,
        }
    }

    /// Creates every node of `topology` on `compute` and then every link.
    pub async fn build(
        compute: Arc<dyn ComputeHandle>,
        topology: &Topology,
        bus: NotificationBus,
    ) -> Result<Self, ProjectError> {
        let mut project = Self::new(bus);
        for node in &topology.nodes {
            project
                .add_node(compute.clone(), &node.name, node.node_type)
                .await?;
        }
        for link in &topology.links {
            project.add_link(&link.a, &link.b, link.filters.clone()).await?;
        }
        Ok(project)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn links(&self) -> &[UdpLink] {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut [UdpLink] {
        &mut self.links
    }

    pub async fn add_node(
        &mut self,
        compute: Arc<dyn ComputeHandle>,
        name: &str,
        node_type: NodeType,
    ) -> Result<&Node, ProjectError> {
        let node = Node::create(self.id, compute, name, node_type).await?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub async fn add_link(
        &mut self,
        a: &EndpointConfig,
        b: &EndpointConfig,
        filters: Filters,
    ) -> Result<&UdpLink, ProjectError> {
        let lookup = |name: &str| {
            self.node(name)
                .cloned()
                .ok_or_else(|| ProjectError::UnknownNode(name.to_string()))
        };
        let (a_node, b_node) = (lookup(&a.node)?, lookup(&b.node)?);
        let mut link = UdpLink::new(self.bus.clone());
        link.update_filters(filters).await?;
        link.add_node(a_node, a.adapter, a.port).await?;
        link.add_node(b_node, b.adapter, b.port).await?;
        self.links.push(link);
        Ok(&self.links[self.links.len() - 1])
    }

    /// Starts every node concurrently.
    pub async fn start_all(&self) -> Result<(), RemoteError> {
        try_join_all(self.nodes.iter().map(|node| node.start())).await?;
        tracing::info!(project = %self.id, nodes = self.nodes.len(), "All nodes started");
        Ok(())
    }

    /// Deletes every link and then every node. Failures are logged and do
    /// not stop the rest of the teardown.
    pub async fn close(&mut self) {
        for link in &mut self.links {
            if let Err(e) = link.delete().await {
                tracing::error!(link = %link.id(), "Failed to delete link: {}", e);
            }
        }
        self.links.clear();
        let deleted = join_all(self.nodes.iter().map(|node| node.delete())).await;
        for (node, result) in self.nodes.iter().zip(deleted) {
            if let Err(e) = result {
                tracing::error!(node = %node.id(), "Failed to delete node: {}", e);
            }
        }
        self.nodes.clear();
        tracing::info!(project = %self.id, "Project closed");
    }
}
