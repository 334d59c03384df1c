//! UDP links between two node ports.
//!
//! A link is established in two steps. The first [`UdpLink::add_node`] only
//! records the endpoint. The second picks addresses the two compute hosts can
//! reach each other on, has both hosts allocate a UDP port, and binds a NIO
//! pointing at the other side on each port. Either both ports end up bound or
//! neither does.
//!
//! One side of an established link can record its traffic. Which side is
//! decided by [`UdpLink::choose_capture_side`].

use crate::node::Node;
use futures::future::join;
use serde::{Deserialize, Serialize};
use serde_json::json;
use vnet_core::{
    compute::{ByteStream, RemoteError},
    nio::{Filters, Nio},
    notification::NotificationBus,
    port::PortAddress,
    Id,
};

pub const DEFAULT_DATA_LINK_TYPE: &str = "DLT_EN10MB";

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Link {0} is already capturing")]
    AlreadyCapturing(Id),
    #[error("Link {0} already has two endpoints")]
    Full(Id),
    #[error("Link {0} has been deleted")]
    Deleted(Id),
    #[error("Link {0} is not established")]
    NotEstablished(Id),
    #[error("Port {address} does not exist on node {node}")]
    PortAddress { node: String, address: PortAddress },
    #[error("Link {0} has no capture to read")]
    NoCapture(Id),
}

/// Where a link is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Empty,
    OneEndpoint,
    Established,
    Deleted,
}

/// One end of a link.
#[derive(Debug, Clone)]
pub struct LinkEndpoint {
    pub node: Node,
    pub address: PortAddress,
}

impl LinkEndpoint {
    fn nio_path(&self) -> String {
        format!("{}/nio", self.node.port_path(self.address))
    }

    fn capture_path(&self, action: &str) -> String {
        format!("{}/{}", self.node.port_path(self.address), action)
    }

    async fn allocate_udp_port(&self) -> Result<u16, RemoteError> {
        #[derive(Deserialize)]
        struct Allocated {
            udp_port: u16,
        }
        let compute = self.node.compute();
        let path = format!("/projects/{}/ports/udp", self.node.project_id());
        let allocated: Allocated = compute.post(&path, None).await?.decode(compute.id())?;
        Ok(allocated.udp_port)
    }

    async fn release_udp_port(&self, port: u16) -> Result<(), RemoteError> {
        let path = format!("/projects/{}/ports/udp/{}", self.node.project_id(), port);
        self.node.compute().delete(&path).await?;
        Ok(())
    }

    async fn bind(&self, nio: &Nio) -> Result<(), RemoteError> {
        self.node
            .compute()
            .post(&self.nio_path(), Some(json!(nio)))
            .await?;
        Ok(())
    }

    async fn rebind(&self, nio: &Nio) -> Result<(), RemoteError> {
        self.node
            .compute()
            .put(&self.nio_path(), Some(json!(nio)))
            .await?;
        Ok(())
    }

    async fn unbind(&self) -> Result<(), RemoteError> {
        self.node.compute().delete(&self.nio_path()).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Capture {
    side: usize,
    file_name: String,
    data_link_type: String,
}

#[derive(Serialize)]
struct EndpointSnapshot {
    node_id: Id,
    adapter_number: u32,
    port_number: u32,
}

/// What `link.updated` carries.
#[derive(Serialize)]
struct LinkSnapshot {
    link_id: Id,
    state: LinkState,
    capturing: bool,
    capture_file_name: Option<String>,
    capture_compute_id: Option<String>,
    nodes: Vec<EndpointSnapshot>,
}

/// A bidirectional UDP tunnel between two node ports.
#[derive(Debug)]
pub struct UdpLink {
    id: Id,
    state: LinkState,
    endpoints: Vec<LinkEndpoint>,
    nios: Vec<Nio>,
    filters: Filters,
    capture: Option<Capture>,
    // The most recent capture, kept so it can still be read once stopped
    last_capture: Option<(usize, String)>,
    bus: NotificationBus,
}

impl UdpLink {
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            id: Id::random(),
            state: LinkState::Empty,
            endpoints: Vec::with_capacity(2),
            nios: Vec::with_capacity(2),
            filters: Filters::new(),
            capture: None,
            last_capture: None,
            bus,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn endpoints(&self) -> &[LinkEndpoint] {
        &self.endpoints
    }

    /// The NIOs bound on each endpoint, in endpoint order, once established.
    pub fn nios(&self) -> &[Nio] {
        &self.nios
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// The file the active capture writes to.
    pub fn capture_file_name(&self) -> Option<&str> {
        self.capture.as_ref().map(|capture| capture.file_name.as_str())
    }

    /// Adds an endpoint. Adding the second one establishes the link.
    pub async fn add_node(
        &mut self,
        node: Node,
        adapter_number: u32,
        port_number: u32,
    ) -> Result<(), LinkError> {
        match self.state {
            LinkState::Deleted => return Err(LinkError::Deleted(self.id)),
            LinkState::Established => return Err(LinkError::Full(self.id)),
            LinkState::Empty | LinkState::OneEndpoint => {}
        }
        let address = PortAddress::new(adapter_number, port_number);
        if node.port(adapter_number, port_number).is_none() {
            return Err(LinkError::PortAddress {
                node: node.name().to_string(),
                address,
            });
        }
        self.endpoints.push(LinkEndpoint { node, address });
        if self.endpoints.len() == 1 {
            self.state = LinkState::OneEndpoint;
            return Ok(());
        }

        match self.establish().await {
            Ok(nios) => {
                self.nios = nios;
                self.state = LinkState::Established;
                tracing::info!(link = %self.id, "Link established");
                Ok(())
            }
            Err(e) => {
                tracing::error!(link = %self.id, "Failed to establish link: {}", e);
                self.endpoints.pop();
                self.state = LinkState::OneEndpoint;
                Err(e)
            }
        }
    }

    /// Negotiates and binds both NIOs. On failure nothing stays bound and
    /// every UDP port allocated on the way is handed back.
    async fn establish(&self) -> Result<Vec<Nio>, LinkError> {
        let (a, b) = (&self.endpoints[0], &self.endpoints[1]);
        let (a_host, b_host) = a
            .node
            .compute()
            .get_ip_on_same_subnet(b.node.compute().as_ref())
            .await?;
        let (a_port, b_port) = match join(a.allocate_udp_port(), b.allocate_udp_port()).await {
            (Ok(a_port), Ok(b_port)) => (a_port, b_port),
            (a_result, b_result) => {
                let mut error = None;
                for (endpoint, result) in [(a, a_result), (b, b_result)] {
                    match result {
                        Ok(port) => self.release_port(endpoint, port).await,
                        Err(e) => {
                            error.get_or_insert(e);
                        }
                    }
                }
                return Err(error.map_or(LinkError::NotEstablished(self.id), LinkError::from));
            }
        };
        let a_nio = Nio::udp(a_port, b_host, b_port).replace_filters(self.filters.clone());
        let b_nio = Nio::udp(b_port, a_host, a_port).replace_filters(self.filters.clone());

        if let Err(e) = a.bind(&a_nio).await {
            self.roll_back(a, a_port, &e).await;
            self.release_port(b, b_port).await;
            return Err(e.into());
        }
        if let Err(e) = b.bind(&b_nio).await {
            if let Err(rollback) = a.unbind().await {
                tracing::error!(link = %self.id, node = %a.node.id(), "Failed to roll back NIO: {}", rollback);
            }
            self.roll_back(b, b_port, &e).await;
            return Err(e.into());
        }
        Ok(vec![a_nio, b_nio])
    }

    /// Cleans up one side after its bind failed. A compute that answered has
    /// already undone the bind itself. One that did not answer may or may not
    /// have applied it, so the binding is removed to be sure.
    async fn roll_back(&self, endpoint: &LinkEndpoint, port: u16, error: &RemoteError) {
        if !matches!(error, RemoteError::Status { .. }) {
            if let Err(e) = endpoint.unbind().await {
                tracing::error!(link = %self.id, node = %endpoint.node.id(), "Failed to roll back NIO: {}", e);
            }
        }
        self.release_port(endpoint, port).await;
    }

    async fn release_port(&self, endpoint: &LinkEndpoint, port: u16) {
        if let Err(e) = endpoint.release_udp_port(port).await {
            tracing::warn!(link = %self.id, node = %endpoint.node.id(), port, "Failed to release UDP port: {}", e);
        }
    }

    /// Replaces the filters of both NIOs.
    pub async fn update_filters(&mut self, filters: Filters) -> Result<(), LinkError> {
        if self.state == LinkState::Deleted {
            return Err(LinkError::Deleted(self.id));
        }
        if self.state == LinkState::Established {
            let nios: Vec<Nio> = self
                .nios
                .iter()
                .map(|nio| nio.replace_filters(filters.clone()))
                .collect();
            for (endpoint, nio) in self.endpoints.iter().zip(&nios) {
                endpoint.rebind(nio).await?;
            }
            self.nios = nios;
        }
        self.filters = filters;
        Ok(())
    }

    /// Releases both bindings. Deleting twice does nothing the second time.
    pub async fn delete(&mut self) -> Result<(), LinkError> {
        if self.state == LinkState::Deleted {
            return Ok(());
        }
        if let Err(e) = self.stop_capture().await {
            tracing::warn!(link = %self.id, "Failed to stop capture: {}", e);
            self.capture = None;
        }
        let mut result = Ok(());
        if self.state == LinkState::Established {
            for endpoint in &self.endpoints {
                if let Err(e) = endpoint.unbind().await {
                    tracing::error!(link = %self.id, node = %endpoint.node.id(), "Failed to unbind NIO: {}", e);
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }
        self.nios.clear();
        self.state = LinkState::Deleted;
        tracing::info!(link = %self.id, "Link deleted");
        result
    }

    /// Picks the endpoint that runs captures: a node that captures inline
    /// beats one that doesn't, then a node on the local compute beats a remote
    /// one, then the endpoint added last wins.
    pub fn choose_capture_side(&self) -> Result<&LinkEndpoint, LinkError> {
        self.capture_side_index().map(|side| &self.endpoints[side])
    }

    fn capture_side_index(&self) -> Result<usize, LinkError> {
        let [a, b] = match self.endpoints.as_slice() {
            [a, b] => [a, b],
            _ => return Err(LinkError::NotEstablished(self.id)),
        };
        if a.node.inline_capture() != b.node.inline_capture() {
            return Ok(if a.node.inline_capture() { 0 } else { 1 });
        }
        let (a_local, b_local) = (a.node.compute().is_local(), b.node.compute().is_local());
        if a_local != b_local {
            return Ok(if a_local { 0 } else { 1 });
        }
        Ok(1)
    }

    /// `<node1>_<a1>-<p1>_to_<node2>_<a2>-<p2>.pcap`, keeping only
    /// characters that are safe in a file name.
    pub fn default_capture_file_name(&self) -> Result<String, LinkError> {
        let [a, b] = match self.endpoints.as_slice() {
            [a, b] => [a, b],
            _ => return Err(LinkError::NotEstablished(self.id)),
        };
        let stem = format!(
            "{}_{}-{}_to_{}_{}-{}",
            a.node.name(),
            a.address.adapter_number,
            a.address.port_number,
            b.node.name(),
            b.address.adapter_number,
            b.address.port_number
        );
        let stem: String = stem
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        Ok(format!("{}.pcap", stem))
    }

    /// Starts capturing on the capture side. Without a file name the default
    /// one is used.
    pub async fn start_capture(
        &mut self,
        data_link_type: &str,
        capture_file_name: Option<&str>,
    ) -> Result<(), LinkError> {
        if self.state != LinkState::Established {
            return Err(LinkError::NotEstablished(self.id));
        }
        if self.capture.is_some() {
            return Err(LinkError::AlreadyCapturing(self.id));
        }
        let side = self.capture_side_index()?;
        let file_name = match capture_file_name {
            Some(name) => name.to_string(),
            None => self.default_capture_file_name()?,
        };
        let endpoint = &self.endpoints[side];
        endpoint
            .node
            .compute()
            .post(
                &endpoint.capture_path("start_capture"),
                Some(json!({
                    "capture_file_name": file_name,
                    "data_link_type": data_link_type,
                })),
            )
            .await?;
        tracing::info!(link = %self.id, node = %endpoint.node.id(), file = %file_name, "Capture started");
        self.last_capture = Some((side, file_name.clone()));
        self.capture = Some(Capture {
            side,
            file_name,
            data_link_type: data_link_type.to_string(),
        });
        self.publish_update();
        Ok(())
    }

    /// Stops the active capture, if any.
    pub async fn stop_capture(&mut self) -> Result<(), LinkError> {
        let Some(capture) = &self.capture else {
            return Ok(());
        };
        let endpoint = &self.endpoints[capture.side];
        endpoint
            .node
            .compute()
            .post(&endpoint.capture_path("stop_capture"), None)
            .await?;
        tracing::info!(link = %self.id, node = %endpoint.node.id(), data_link_type = %capture.data_link_type, "Capture stopped");
        self.capture = None;
        self.publish_update();
        Ok(())
    }

    /// Streams the bytes of the most recent capture from the compute host
    /// that recorded it, whether or not it is still running.
    pub async fn read_pcap_from_source(&self) -> Result<ByteStream, LinkError> {
        let (side, file_name) = self
            .last_capture
            .as_ref()
            .ok_or(LinkError::NoCapture(self.id))?;
        let node = &self.endpoints[*side].node;
        let path = format!("tmp/captures/{}", file_name);
        Ok(node.compute().stream_file(node.project_id(), &path).await?)
    }

    fn publish_update(&self) {
        let capture_compute_id = self
            .capture
            .as_ref()
            .map(|capture| self.endpoints[capture.side].node.compute().id().to_string());
        let snapshot = LinkSnapshot {
            link_id: self.id,
            state: self.state,
            capturing: self.capture.is_some(),
            capture_file_name: self.capture_file_name().map(str::to_string),
            capture_compute_id,
            nodes: self
                .endpoints
                .iter()
                .map(|endpoint| EndpointSnapshot {
                    node_id: endpoint.node.id(),
                    adapter_number: endpoint.address.adapter_number,
                    port_number: endpoint.address.port_number,
                })
                .collect(),
        };
        self.bus.publish("link.updated", snapshot);
    }
}
