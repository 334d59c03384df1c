//! The compute host: owns the nodes living on this machine and answers the
//! RPCs the controller sends about them.

use crate::{
    bridge::BridgeFactory,
    compute::{ChannelCompute, Envelope, Interface, Method, Request, Response, ENVELOPE_QUEUE},
    nio::Nio,
    node::NodeType,
    notification::NotificationBus,
    port::PortAddress,
    port_manager::{PortManager, PortManagerError},
    process::ProcessLauncher,
    registry::{NodeRegistry, SharedNode},
    supervisor::{
        Backend, EmulatedNode, HostContext, NodeIdentity, Supervisor, SupervisorError,
        SupervisorSettings, TraceNg, Vpcs,
    },
    Id,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::AsyncReadExt,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

const STREAM_CHUNK: usize = 8192;
const STREAM_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    PortAllocation(#[from] PortManagerError),
}

impl ComputeError {
    pub fn status(&self) -> u16 {
        match self {
            ComputeError::NotFound(_) => 404,
            ComputeError::BadRequest(_) => 400,
            ComputeError::Supervisor(e) => match e {
                SupervisorError::PortAddress { .. } => 404,
                SupervisorError::CaptureFileName(_) => 400,
                _ => 409,
            },
            ComputeError::PortAllocation(_) => 409,
        }
    }
}

impl From<ComputeError> for Response {
    fn from(e: ComputeError) -> Self {
        Response::error(e.status(), e)
    }
}

/// Host-wide settings.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// The address this host advertises to the controller.
    pub host: String,
    pub interfaces: Vec<Interface>,
    /// Where project directories live.
    pub projects_dir: PathBuf,
    pub supervisor: SupervisorSettings,
}

#[derive(Deserialize)]
struct CreateNode {
    name: String,
    #[serde(default)]
    node_id: Option<Id>,
}

#[derive(Deserialize)]
struct StartCapture {
    capture_file_name: String,
    #[serde(default = "default_data_link_type")]
    data_link_type: String,
}

fn default_data_link_type() -> String {
    "DLT_EN10MB".to_string()
}

/// What a node-scoped path asks for.
enum NodeAction {
    Node,
    Lifecycle(String),
    Port(PortAddress, String),
}

/// Owns the nodes of one compute host.
pub struct ComputeHost {
    settings: HostSettings,
    registry: NodeRegistry,
    context: HostContext,
    bridges: Arc<dyn BridgeFactory>,
}

impl ComputeHost {
    pub fn new(
        settings: HostSettings,
        ports: Arc<PortManager>,
        launcher: Arc<dyn ProcessLauncher>,
        bridges: Arc<dyn BridgeFactory>,
        bus: NotificationBus,
    ) -> Self {
        let context = HostContext {
            launcher,
            ports,
            bus,
            settings: Arc::new(settings.supervisor.clone()),
        };
        Self {
            settings,
            registry: NodeRegistry::new(),
            context,
            bridges,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortManager {
        &self.context.ports
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.context.bus
    }

    /// Answers one RPC.
    pub async fn handle(&self, request: Request) -> Response {
        tracing::debug!(method = %request.method, path = %request.path, "Handling compute request");
        match self.route(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(method = %request.method, path = %request.path, "Compute request failed: {}", e);
                e.into()
            }
        }
    }

    async fn route(&self, request: &Request) -> Result<Response, ComputeError> {
        let segments: Vec<&str> = request
            .path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let not_found = || ComputeError::NotFound(format!("No route for {} {}", request.method, request.path));
        match (request.method, segments.as_slice()) {
            (Method::Get, ["network", "interfaces"]) => {
                Ok(Response::ok(json!(self.settings.interfaces)))
            }
            (Method::Post, ["projects", project, "ports", "udp"]) => {
                parse_id(project)?;
                let port = self.context.ports.get_free_udp_port().await?;
                Ok(Response::created(json!({ "udp_port": port })))
            }
            (Method::Delete, ["projects", project, "ports", "udp", port]) => {
                parse_id(project)?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| ComputeError::BadRequest(format!("Invalid UDP port {}", port)))?;
                self.context.ports.release_udp_port(port);
                tracing::debug!(port, "UDP port released");
                Ok(Response::no_content())
            }
            (Method::Post, ["projects", project, node_type, "nodes"]) => {
                let project_id = parse_id(project)?;
                let node_type = parse_node_type(node_type)?;
                let body: CreateNode = parse_body(request.body.as_ref())?;
                self.create_node(project_id, node_type, body).await
            }
            (method, ["projects", project, node_type, "nodes", node, rest @ ..]) => {
                let project_id = parse_id(project)?;
                let node_type = parse_node_type(node_type)?;
                let node_id = parse_id(node)?;
                let action = match rest {
                    [] => NodeAction::Node,
                    [action] => NodeAction::Lifecycle(action.to_string()),
                    ["adapters", adapter, "ports", port, action] => {
                        NodeAction::Port(parse_address(adapter, port)?, action.to_string())
                    }
                    _ => return Err(not_found()),
                };
                let node = self.find_node(project_id, node_type, node_id).await?;
                match (method, action) {
                    (Method::Get, NodeAction::Node) => {
                        let mut node = node.lock().await;
                        node.is_running();
                        Ok(Response::ok(json!(node.snapshot())))
                    }
                    (Method::Delete, NodeAction::Node) => {
                        self.registry.remove(node_id);
                        node.lock().await.close().await?;
                        tracing::info!(node = %node_id, "Node deleted");
                        Ok(Response::no_content())
                    }
                    (Method::Post, NodeAction::Lifecycle(action)) => {
                        let mut node = node.lock().await;
                        match action.as_str() {
                            "start" => node.start().await?,
                            "stop" => node.stop().await?,
                            "reload" => node.reload().await?,
                            _ => return Err(not_found()),
                        }
                        Ok(Response::ok(json!(node.snapshot())))
                    }
                    (method, NodeAction::Port(address, action)) => {
                        self.port_request(&node, method, address, &action, request.body.as_ref())
                            .await
                            .map_err(|e| match e {
                                ComputeError::NotFound(_) => not_found(),
                                e => e,
                            })
                    }
                    _ => Err(not_found()),
                }
            }
            _ => Err(not_found()),
        }
    }

    async fn port_request(
        &self,
        node: &SharedNode,
        method: Method,
        address: PortAddress,
        action: &str,
        body: Option<&Value>,
    ) -> Result<Response, ComputeError> {
        let mut node = node.lock().await;
        match (method, action) {
            (Method::Post, "nio") => {
                let nio: Nio = parse_body(body)?;
                node.port_add_nio_binding(address, nio.clone()).await?;
                Ok(Response::created(json!(nio)))
            }
            (Method::Put, "nio") => {
                let nio: Nio = parse_body(body)?;
                node.port_update_nio_binding(address, nio.clone()).await?;
                Ok(Response::created(json!(nio)))
            }
            (Method::Delete, "nio") => {
                node.port_remove_nio_binding(address).await?;
                Ok(Response::no_content())
            }
            (Method::Post, "start_capture") => {
                let capture: StartCapture = parse_body(body)?;
                let path = node
                    .start_capture(address, &capture.capture_file_name, &capture.data_link_type)
                    .await?;
                Ok(Response::ok(json!({ "pcap_file_path": path.display().to_string() })))
            }
            (Method::Post, "stop_capture") => {
                node.stop_capture(address).await?;
                Ok(Response::no_content())
            }
            _ => Err(ComputeError::NotFound(String::new())),
        }
    }

    async fn find_node(
        &self,
        project_id: Id,
        node_type: NodeType,
        node_id: Id,
    ) -> Result<SharedNode, ComputeError> {
        let missing = || ComputeError::NotFound(format!("Node {} doesn't exist", node_id));
        let node = self.registry.get(node_id).ok_or_else(missing)?;
        {
            let guard = node.lock().await;
            let snapshot = guard.snapshot();
            if snapshot.project_id != project_id || snapshot.node_type != node_type {
                return Err(missing());
            }
        }
        Ok(node)
    }

    async fn create_node(
        &self,
        project_id: Id,
        node_type: NodeType,
        body: CreateNode,
    ) -> Result<Response, ComputeError> {
        let identity = NodeIdentity {
            node_id: body.node_id.unwrap_or_else(Id::random),
            project_id,
            name: body.name,
            project_dir: self.settings.projects_dir.join(project_id.to_string()),
        };
        if self.registry.get(identity.node_id).is_some() {
            return Err(ComputeError::BadRequest(format!(
                "Node {} already exists",
                identity.node_id
            )));
        }
        let node: Box<dyn EmulatedNode> = match node_type {
            NodeType::Vpcs => self.supervise(Vpcs, identity).await?,
            NodeType::TraceNg => self.supervise(TraceNg, identity).await?,
            other => {
                return Err(ComputeError::BadRequest(format!(
                    "Unsupported node type {}",
                    other
                )))
            }
        };
        let snapshot = node.snapshot();
        if !self.registry.insert(node) {
            return Err(ComputeError::BadRequest(format!(
                "Node {} already exists",
                snapshot.node_id
            )));
        }
        Ok(Response::created(json!(snapshot)))
    }

    async fn supervise<B: Backend>(
        &self,
        backend: B,
        identity: NodeIdentity,
    ) -> Result<Box<dyn EmulatedNode>, ComputeError> {
        let bridge = self
            .bridges
            .create(identity.node_id, &identity.working_dir(B::NODE_TYPE));
        let supervisor = Supervisor::create(backend, identity, self.context.clone(), bridge).await?;
        Ok(Box::new(supervisor))
    }

    /// Opens a file under a project directory and streams it in chunks.
    pub async fn stream_file(
        &self,
        project_id: Id,
        path: &str,
    ) -> Result<mpsc::Receiver<io::Result<Vec<u8>>>, ComputeError> {
        let relative = Path::new(path);
        if relative.as_os_str().is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(ComputeError::BadRequest(format!(
                "{} is not inside the project directory",
                path
            )));
        }
        let full = self
            .settings
            .projects_dir
            .join(project_id.to_string())
            .join(relative);
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| ComputeError::NotFound(format!("Could not open {}: {}", path, e)))?;

        let (sender, receiver) = mpsc::channel(STREAM_QUEUE);
        tokio::spawn(async move {
            let mut buffer = vec![0; STREAM_CHUNK];
            loop {
                let chunk = match file.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(read) => Ok(buffer[..read].to_vec()),
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                if sender.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(receiver)
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request { request, reply } => {
                let response = self.handle(request).await;
                if reply.send(response).is_err() {
                    tracing::debug!("Caller stopped waiting for a response");
                }
            }
            Envelope::StreamFile {
                project_id,
                path,
                reply,
            } => {
                let answer = self.stream_file(project_id, &path).await.map_err(Response::from);
                if reply.send(answer).is_err() {
                    tracing::debug!("Caller stopped waiting for a file stream");
                }
            }
        }
    }

    /// Closes every node on the host.
    pub async fn shutdown(&self) {
        for node in self.registry.drain() {
            let mut node = node.lock().await;
            if let Err(e) = node.close().await {
                tracing::error!(node = %node.id(), "Failed to close node: {}", e);
            }
        }
        tracing::info!("Compute host shut down");
    }

    /// Serves RPCs arriving through the returned [`ChannelCompute`] until
    /// `cancel` fires or every handle is dropped, then closes every node.
    pub fn serve(
        self: Arc<Self>,
        id: impl Into<String>,
        rpc_timeout: Duration,
        cancel: CancellationToken,
    ) -> (ChannelCompute, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(ENVELOPE_QUEUE);
        let compute = ChannelCompute::new(id, self.settings.host.clone(), rpc_timeout, sender);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = receiver.recv() => match envelope {
                        Some(envelope) => {
                            let host = self.clone();
                            tokio::spawn(async move { host.dispatch(envelope).await });
                        }
                        None => break,
                    },
                }
            }
            self.shutdown().await;
        });
        (compute, task)
    }
}

fn parse_id(segment: &str) -> Result<Id, ComputeError> {
    segment
        .parse()
        .map_err(|e| ComputeError::BadRequest(format!("Invalid id {:?}: {}", segment, e)))
}

fn parse_node_type(segment: &str) -> Result<NodeType, ComputeError> {
    NodeType::from_path_segment(segment)
        .ok_or_else(|| ComputeError::NotFound(format!("Unknown node type {}", segment)))
}

fn parse_address(adapter: &str, port: &str) -> Result<PortAddress, ComputeError> {
    let number = |segment: &str| {
        segment
            .parse::<u32>()
            .map_err(|_| ComputeError::BadRequest(format!("Invalid port address {}/{}", adapter, port)))
    };
    Ok(PortAddress::new(number(adapter)?, number(port)?))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Option<&Value>) -> Result<T, ComputeError> {
    let body = body.ok_or_else(|| ComputeError::BadRequest("Missing request body".into()))?;
    serde_json::from_value(body.clone())
        .map_err(|e| ComputeError::BadRequest(format!("Invalid request body: {}", e)))
}
