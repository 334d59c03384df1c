//! Supervision of emulated node processes on a compute host.
//!
//! A [`Supervisor`] owns one node process and the bridge that connects its
//! ports to the outside world. It moves through
//! `stopped → starting → started → stopping → stopped` and keeps the bridge in
//! sync with the NIOs bound to the node's ports, re-applying them whenever the
//! process is (re)started.
//!
//! Supervisors are reached through the [`EmulatedNode`] trait so that a host
//! can keep nodes of every backend in one registry.

use crate::{
    bridge::{command, Bridge, BridgeCommandError},
    nio::{Filters, Nio},
    node::{NodeSnapshot, NodeStatus, NodeType},
    notification::NotificationBus,
    port::{PortAddress, PortCapture, Ports},
    port_manager::{PortManager, PortManagerError},
    process::{terminate_process, ChildProcess, ProcessLauncher},
    Id,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

mod backend;
pub use backend::{Backend, LaunchParams, Tunnel};

mod traceng;
pub use traceng::TraceNg;

mod vpcs;
pub use vpcs::Vpcs;


#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0}")]
    Requirements(String),
    #[error("Port {address} does not exist on node {node}")]
    PortAddress { node: String, address: PortAddress },
    #[error("Port {0} already has a NIO bound")]
    PortInUse(PortAddress),
    #[error("Port {0} has no NIO bound")]
    NioNotBound(PortAddress),
    #[error("A capture is already running on port {0}")]
    AlreadyCapturing(PortAddress),
    #[error("Invalid capture file name {0:?}")]
    CaptureFileName(String),
    #[error("Node {0} is closed")]
    Closed(Id),
    #[error("The node process exited while starting")]
    ProcessExited,
    #[error(transparent)]
    Bridge(#[from] BridgeCommandError),
    #[error(transparent)]
    PortAllocation(#[from] PortManagerError),
    #[error("Process error: {0}")]
    Process(#[from] io::Error),
}

/// The lifecycle and port binding operations every emulated node supports.
#[async_trait]
pub trait EmulatedNode: Send {
    fn id(&self) -> Id;

    fn node_type(&self) -> NodeType;

    /// Whether packet captures are better run on this node than on its peer.
    fn inline_capture(&self) -> bool {
        self.node_type().inline_capture()
    }

    fn status(&self) -> NodeStatus;

    /// The command line used by the most recent start, joined with spaces.
    fn command_line(&self) -> String;

    fn snapshot(&self) -> NodeSnapshot;

    /// Whether the node is started and its process is still alive. A process
    /// that died on its own is noticed here and the node becomes stopped.
    fn is_running(&mut self) -> bool;

    fn port_nio(&self, address: PortAddress) -> Result<Option<Nio>, SupervisorError>;

    async fn start(&mut self) -> Result<(), SupervisorError>;

    async fn stop(&mut self) -> Result<(), SupervisorError>;

    async fn reload(&mut self) -> Result<(), SupervisorError>;

    async fn close(&mut self) -> Result<(), SupervisorError>;

    async fn port_add_nio_binding(
        &mut self,
        address: PortAddress,
        nio: Nio,
    ) -> Result<(), SupervisorError>;

    async fn port_update_nio_binding(
        &mut self,
        address: PortAddress,
        nio: Nio,
    ) -> Result<(), SupervisorError>;

    async fn port_remove_nio_binding(
        &mut self,
        address: PortAddress,
    ) -> Result<Option<Nio>, SupervisorError>;

    /// Starts capturing the traffic of a port into `file_name` under the
    /// project's capture directory and returns the full path.
    async fn start_capture(
        &mut self,
        address: PortAddress,
        file_name: &str,
        data_link_type: &str,
    ) -> Result<PathBuf, SupervisorError>;

    async fn stop_capture(&mut self, address: PortAddress) -> Result<(), SupervisorError>;
}

/// Tunables shared by every supervisor on a host.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a process gets to exit after being asked before it is killed.
    pub stop_timeout: Duration,
    /// How long a new process must stay alive before it counts as started.
    pub startup_grace: Duration,
    /// Binary paths overriding the backend defaults.
    pub binaries: HashMap<NodeType, PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(3),
            startup_grace: Duration::from_millis(100),
            binaries: HashMap::new(),
        }
    }
}

/// The host resources a supervisor draws on.
#[derive(Clone)]
pub struct HostContext {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub ports: Arc<PortManager>,
    pub bus: NotificationBus,
    pub settings: Arc<SupervisorSettings>,
}

/// Who a node is and where it keeps its files.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: Id,
    pub project_id: Id,
    pub name: String,
    /// The project directory on this host.
    pub project_dir: PathBuf,
}

impl NodeIdentity {
    pub fn working_dir(&self, node_type: NodeType) -> PathBuf {
        self.project_dir
            .join("project-files")
            .join(node_type.as_str())
            .join(self.node_id.to_string())
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.project_dir.join("tmp").join("captures")
    }
}

/// Supervises one node process of backend `B`.
pub struct Supervisor<B: Backend> {
    backend: B,
    identity: NodeIdentity,
    context: HostContext,
    status: NodeStatus,
    ports: Ports,
    process: Option<Box<dyn ChildProcess>>,
    bridge: Box<dyn Bridge>,
    tunnels: BTreeMap<PortAddress, Tunnel>,
    console: Option<u16>,
    internal_console: Option<u16>,
    argv: Vec<String>,
    closed: bool,
}

impl<B: Backend> Supervisor<B> {
    /// Creates a stopped node and reserves its console port.
    pub async fn create(
        backend: B,
        identity: NodeIdentity,
        context: HostContext,
        bridge: Box<dyn Bridge>,
    ) -> Result<Self, SupervisorError> {
        let console = context.ports.get_free_tcp_port().await?;
        let ports = Ports::new(backend.ports());
        tracing::info!(node = %identity.node_id, name = %identity.name, node_type = %B::NODE_TYPE, console, "Node created");
        Ok(Self {
            backend,
            identity,
            context,
            status: NodeStatus::Stopped,
            ports,
            process: None,
            bridge,
            tunnels: BTreeMap::new(),
            console: Some(console),
            internal_console: None,
            argv: Vec::new(),
            closed: false,
        })
    }

    /// The literal argument vector of the most recent start.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn console(&self) -> Option<u16> {
        self.console
    }

    pub fn internal_console(&self) -> Option<u16> {
        self.internal_console
    }

    pub fn tunnel(&self, address: PortAddress) -> Option<Tunnel> {
        self.tunnels.get(&address).copied()
    }

    fn publish_update(&self) {
        self.context.bus.publish("node.updated", self.snapshot());
    }

    fn bridge_name(&self, address: PortAddress) -> String {
        format!(
            "{}-{}-{}",
            self.identity.node_id, address.adapter_number, address.port_number
        )
    }

    fn mac_id(&self) -> u8 {
        (self.identity.node_id.into_inner() % 255) as u8 + 1
    }

    fn port_address_error(&self, address: PortAddress) -> SupervisorError {
        SupervisorError::PortAddress {
            node: self.identity.name.clone(),
            address,
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, SupervisorError> {
        let configured = self.context.settings.binaries.get(&B::NODE_TYPE);
        let wanted = configured
            .cloned()
            .unwrap_or_else(|| PathBuf::from(self.backend.binary_name()));
        self.context.launcher.resolve(&wanted).map_err(|e| {
            SupervisorError::Requirements(format!(
                "The {} binary {} is not available: {}",
                B::NODE_TYPE,
                wanted.display(),
                e
            ))
        })
    }

    /// Allocates the bridge tunnel of every port that does not have one yet.
    async fn allocate_tunnels(&mut self) -> Result<(), SupervisorError> {
        let addresses: Vec<PortAddress> = self.ports.iter().map(|port| port.address()).collect();
        for address in addresses {
            if self.tunnels.contains_key(&address) {
                continue;
            }
            let process_port = self.context.ports.get_free_udp_port().await?;
            let bridge_port = match self.context.ports.get_free_udp_port().await {
                Ok(port) => port,
                Err(e) => {
                    self.context.ports.release_udp_port(process_port);
                    return Err(e.into());
                }
            };
            self.tunnels.insert(
                address,
                Tunnel {
                    process_port,
                    bridge_port,
                },
            );
        }
        Ok(())
    }

    async fn bridge_send(&mut self, command: String) -> Result<(), BridgeCommandError> {
        match self.bridge.send(&command).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(node = %self.identity.node_id, command = %command, "Bridge command failed: {}", e);
                Err(e)
            }
        }
    }

    async fn apply_filters(&mut self, bridge: &str, filters: &Filters) -> Result<(), BridgeCommandError> {
        self.bridge_send(command::reset_packet_filters(bridge)).await?;
        for (index, (filter, params)) in filters.iter().enumerate() {
            self.bridge_send(command::add_packet_filter(bridge, index, filter, params))
                .await?;
        }
        Ok(())
    }

    /// Creates the bridge of a port, joining its tunnel to `nio`.
    async fn connect_port(&mut self, address: PortAddress, nio: &Nio) -> Result<(), SupervisorError> {
        let tunnel = self
            .tunnels
            .get(&address)
            .copied()
            .ok_or_else(|| self.port_address_error(address))?;
        let capture = self
            .ports
            .get(address)
            .and_then(|port| port.capture().cloned());
        let name = self.bridge_name(address);
        let Nio::Udp(udp) = nio;

        self.bridge_send(command::create(&name)).await?;
        self.bridge_send(command::add_nio_udp(
            &name,
            tunnel.bridge_port,
            "127.0.0.1",
            tunnel.process_port,
        ))
        .await?;
        self.bridge_send(command::add_nio_udp(&name, udp.lport, &udp.rhost, udp.rport))
            .await?;
        if let Some(capture) = capture {
            self.bridge_send(command::start_capture(&name, &capture.path, &capture.data_link_type))
                .await?;
        }
        self.apply_filters(&name, &udp.filters).await?;
        self.bridge_send(command::start(&name)).await?;
        tracing::info!(node = %self.identity.node_id, port = %address, lport = udp.lport, rhost = %udp.rhost, rport = udp.rport, "Port connected");
        Ok(())
    }

    /// Forgets a binding whose bridge could not be set up, leaving the port
    /// and the NIO's UDP port as they were before the bind. A UDP port that
    /// was already allocated stays with whoever allocated it.
    async fn unwind_binding(&mut self, address: PortAddress, nio: &Nio, reserved: bool) {
        if let Some(port) = self.ports.get_mut(address) {
            port.unbind();
        }
        if reserved {
            self.context.ports.release_udp_port(nio.lport());
        }
        if let Err(e) = self.disconnect_port(address).await {
            tracing::debug!(node = %self.identity.node_id, port = %address, "Nothing to delete after failed bind: {}", e);
        }
    }

    async fn disconnect_port(&mut self, address: PortAddress) -> Result<(), SupervisorError> {
        let name = self.bridge_name(address);
        self.bridge_send(command::delete(&name)).await?;
        Ok(())
    }

    /// The part of a start that can fail after the node left `stopped`.
    async fn launch(&mut self, binary: &Path) -> Result<(), SupervisorError> {
        if self.bridge.is_running() {
            // Left over from a process that died on its own
            self.bridge.stop().await?;
        }
        self.allocate_tunnels().await?;
        if B::INTERNAL_CONSOLE && self.internal_console.is_none() {
            self.internal_console = Some(self.context.ports.get_free_tcp_port().await?);
        }

        let tunnels: Vec<(PortAddress, Tunnel)> =
            self.tunnels.iter().map(|(address, tunnel)| (*address, *tunnel)).collect();
        let params = LaunchParams {
            console: self.console,
            internal_console: self.internal_console,
            mac_id: self.mac_id(),
            tunnels: &tunnels,
        };
        self.argv = self.backend.command_line(binary, &params);

        let working_dir = self.identity.working_dir(B::NODE_TYPE);
        let mut process = self.context.launcher.spawn(&self.argv, &working_dir).await?;
        if !self.context.settings.startup_grace.is_zero() {
            tokio::time::sleep(self.context.settings.startup_grace).await;
        }
        if process.has_exited() {
            return Err(SupervisorError::ProcessExited);
        }
        self.process = Some(process);

        self.bridge.start().await?;
        if !self.bridge.is_running() {
            return Err(BridgeCommandError::NotRunning.into());
        }
        let bound: Vec<(PortAddress, Nio)> = self
            .ports
            .bound()
            .map(|(address, nio)| (address, nio.clone()))
            .collect();
        for (address, nio) in bound {
            self.connect_port(address, &nio).await?;
        }
        Ok(())
    }

    /// Tears down whatever a failed start left behind.
    async fn abort_start(&mut self) {
        if self.bridge.is_running() {
            if let Err(e) = self.bridge.stop().await {
                tracing::warn!(node = %self.identity.node_id, "Failed to stop bridge: {}", e);
            }
        }
        if let Some(mut process) = self.process.take() {
            if let Err(e) = terminate_process(process.as_mut(), self.context.settings.stop_timeout).await {
                tracing::error!(node = %self.identity.node_id, "Failed to terminate node process: {}", e);
            }
        }
    }

    fn release_ports(&mut self) {
        let ports = self.context.ports.clone();
        if let Some(console) = self.console.take() {
            ports.release_tcp_port(console);
        }
        if let Some(console) = self.internal_console.take() {
            ports.release_tcp_port(console);
        }
        for tunnel in std::mem::take(&mut self.tunnels).into_values() {
            ports.release_udp_port(tunnel.process_port);
            ports.release_udp_port(tunnel.bridge_port);
        }
        let addresses: Vec<PortAddress> = self.ports.iter().map(|port| port.address()).collect();
        for address in addresses {
            if let Some(nio) = self.ports.get_mut(address).and_then(|port| port.unbind()) {
                ports.release_udp_port(nio.lport());
            }
        }
    }
}

#[async_trait]
impl<B: Backend> EmulatedNode for Supervisor<B> {
    fn id(&self) -> Id {
        self.identity.node_id
    }

    fn node_type(&self) -> NodeType {
        B::NODE_TYPE
    }

    fn status(&self) -> NodeStatus {
        self.status
    }

    fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.identity.node_id,
            project_id: self.identity.project_id,
            name: self.identity.name.clone(),
            node_type: B::NODE_TYPE,
            status: self.status,
            console: self.console,
            command_line: self.command_line(),
            ports: self.ports.infos(),
        }
    }

    fn is_running(&mut self) -> bool {
        if self.status != NodeStatus::Started {
            return false;
        }
        let alive = self
            .process
            .as_mut()
            .map_or(false, |process| !process.has_exited());
        if !alive {
            tracing::warn!(node = %self.identity.node_id, "Node process exited unexpectedly");
            self.process = None;
            self.status = NodeStatus::Stopped;
            self.publish_update();
        }
        alive
    }

    fn port_nio(&self, address: PortAddress) -> Result<Option<Nio>, SupervisorError> {
        self.ports
            .get(address)
            .map(|port| port.nio().cloned())
            .ok_or_else(|| self.port_address_error(address))
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.closed {
            return Err(SupervisorError::Closed(self.identity.node_id));
        }
        if self.is_running() {
            tracing::debug!(node = %self.identity.node_id, "Node is already started");
            return Ok(());
        }
        let binary = self.resolve_binary()?;
        self.backend
            .check_requirements(&binary, self.context.launcher.as_ref())
            .await?;

        self.status = NodeStatus::Starting;
        if let Err(e) = self.launch(&binary).await {
            tracing::error!(node = %self.identity.node_id, "Failed to start node: {}", e);
            self.abort_start().await;
            self.status = NodeStatus::Stopped;
            return Err(e);
        }
        self.status = NodeStatus::Started;
        tracing::info!(node = %self.identity.node_id, command = %self.command_line(), "Node started");
        self.publish_update();
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Ok(());
        }
        self.status = NodeStatus::Stopping;
        if self.bridge.is_running() {
            if let Err(e) = self.bridge.stop().await {
                tracing::warn!(node = %self.identity.node_id, "Failed to stop bridge: {}", e);
            }
        }
        if let Some(mut process) = self.process.take() {
            if let Err(e) = terminate_process(process.as_mut(), self.context.settings.stop_timeout).await {
                tracing::error!(node = %self.identity.node_id, "Failed to terminate node process: {}", e);
            }
        }
        self.status = NodeStatus::Stopped;
        tracing::info!(node = %self.identity.node_id, "Node stopped");
        self.publish_update();
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.start().await
    }

    async fn close(&mut self) -> Result<(), SupervisorError> {
        if self.closed {
            return Ok(());
        }
        self.stop().await?;
        if self.bridge.is_running() {
            if let Err(e) = self.bridge.stop().await {
                tracing::warn!(node = %self.identity.node_id, "Failed to stop bridge: {}", e);
            }
        }
        self.release_ports();
        self.closed = true;
        tracing::info!(node = %self.identity.node_id, "Node closed");
        Ok(())
    }

    async fn port_add_nio_binding(
        &mut self,
        address: PortAddress,
        nio: Nio,
    ) -> Result<(), SupervisorError> {
        let port = match self.ports.get_mut(address) {
            Some(port) => port,
            None => return Err(self.port_address_error(address)),
        };
        if port.bind(nio.clone()).is_err() {
            return Err(SupervisorError::PortInUse(address));
        }
        let reserved = match self.context.ports.reserve_udp_port(nio.lport()) {
            Ok(reserved) => reserved,
            Err(e) => {
                tracing::debug!(node = %self.identity.node_id, "Not tracking NIO port: {}", e);
                false
            }
        };
        if self.is_running() {
            if let Err(e) = self.connect_port(address, &nio).await {
                self.unwind_binding(address, &nio, reserved).await;
                return Err(e);
            }
        }
        tracing::info!(node = %self.identity.node_id, port = %address, lport = nio.lport(), "NIO bound");
        Ok(())
    }

    async fn port_update_nio_binding(
        &mut self,
        address: PortAddress,
        nio: Nio,
    ) -> Result<(), SupervisorError> {
        let port = match self.ports.get_mut(address) {
            Some(port) => port,
            None => return Err(self.port_address_error(address)),
        };
        let previous = port.rebind(nio.clone());
        if let Some(previous) = &previous {
            if previous.lport() != nio.lport() {
                self.context.ports.release_udp_port(previous.lport());
            }
        }
        if let Err(e) = self.context.ports.reserve_udp_port(nio.lport()) {
            tracing::debug!(node = %self.identity.node_id, "Not tracking NIO port: {}", e);
        }
        if !self.is_running() {
            return Ok(());
        }
        let same_endpoints = previous.as_ref().map_or(false, |previous| {
            previous.replace_filters(Filters::new()) == nio.replace_filters(Filters::new())
        });
        if same_endpoints {
            let name = self.bridge_name(address);
            self.apply_filters(&name, nio.filters()).await?;
        } else {
            if previous.is_some() {
                self.disconnect_port(address).await?;
            }
            self.connect_port(address, &nio).await?;
        }
        Ok(())
    }

    async fn port_remove_nio_binding(
        &mut self,
        address: PortAddress,
    ) -> Result<Option<Nio>, SupervisorError> {
        let port = match self.ports.get_mut(address) {
            Some(port) => port,
            None => return Err(self.port_address_error(address)),
        };
        let Some(nio) = port.unbind() else {
            return Ok(None);
        };
        self.context.ports.release_udp_port(nio.lport());
        tracing::info!(node = %self.identity.node_id, port = %address, "NIO removed");
        if self.is_running() {
            self.disconnect_port(address).await?;
        }
        Ok(Some(nio))
    }

    async fn start_capture(
        &mut self,
        address: PortAddress,
        file_name: &str,
        data_link_type: &str,
    ) -> Result<PathBuf, SupervisorError> {
        if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.starts_with('.') {
            return Err(SupervisorError::CaptureFileName(file_name.to_string()));
        }
        {
            let port = self
                .ports
                .get(address)
                .ok_or_else(|| self.port_address_error(address))?;
            if port.nio().is_none() {
                return Err(SupervisorError::NioNotBound(address));
            }
            if port.capture().is_some() {
                return Err(SupervisorError::AlreadyCapturing(address));
            }
        }
        let captures = self.identity.captures_dir();
        tokio::fs::create_dir_all(&captures).await?;
        let path = captures.join(file_name);
        let capture = PortCapture {
            path: path.clone(),
            data_link_type: data_link_type.to_string(),
        };
        if let Some(port) = self.ports.get_mut(address) {
            port.set_capture(Some(capture));
        }
        if self.is_running() {
            let name = self.bridge_name(address);
            if let Err(e) = self
                .bridge_send(command::start_capture(&name, &path, data_link_type))
                .await
            {
                if let Some(port) = self.ports.get_mut(address) {
                    port.set_capture(None);
                }
                return Err(e.into());
            }
        }
        tracing::info!(node = %self.identity.node_id, port = %address, path = %path.display(), "Capture started");
        Ok(path)
    }

    async fn stop_capture(&mut self, address: PortAddress) -> Result<(), SupervisorError> {
        let port = match self.ports.get_mut(address) {
            Some(port) => port,
            None => return Err(self.port_address_error(address)),
        };
        if port.capture().is_none() {
            return Ok(());
        }
        port.set_capture(None);
        tracing::info!(node = %self.identity.node_id, port = %address, "Capture stopped");
        if self.is_running() {
            let name = self.bridge_name(address);
            self.bridge_send(command::stop_capture(&name)).await?;
        }
        Ok(())
    }
}
