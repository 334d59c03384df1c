use super::SupervisorError;
use crate::{
    node::NodeType,
    port::{PortAddress, PortInfo},
    process::ProcessLauncher,
};
use async_trait::async_trait;
use std::path::Path;

/// The private UDP tunnel between a node process and its bridge for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    /// The port the node process listens on.
    pub process_port: u16,
    /// The port the bridge listens on.
    pub bridge_port: u16,
}

/// Everything a backend may put on a command line.
#[derive(Debug, Clone, Copy)]
pub struct LaunchParams<'a> {
    pub console: Option<u16>,
    pub internal_console: Option<u16>,
    /// Distinguishes the MAC addresses of nodes of the same type.
    pub mac_id: u8,
    pub tunnels: &'a [(PortAddress, Tunnel)],
}

impl LaunchParams<'_> {
    /// The tunnel of the first port.
    pub fn first_tunnel(&self) -> Option<Tunnel> {
        self.tunnels.first().map(|(_, tunnel)| *tunnel)
    }
}

/// What differs between emulation backends: which binary runs, how its
/// command line is built, and what it takes for the binary to be usable.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    const NODE_TYPE: NodeType;

    /// Whether the process needs a console port for the host's own use, in
    /// addition to the user-facing one.
    const INTERNAL_CONSOLE: bool = false;

    /// The binary looked up on `PATH` when no path is configured.
    fn binary_name(&self) -> &'static str;

    /// The fixed port topology of nodes of this type.
    fn ports(&self) -> Vec<PortInfo> {
        vec![PortInfo::new(PortAddress::new(0, 0), "Ethernet0")]
    }

    /// Fails with [`SupervisorError::Requirements`] if `binary` cannot run
    /// this backend.
    async fn check_requirements(
        &self,
        _binary: &Path,
        _launcher: &dyn ProcessLauncher,
    ) -> Result<(), SupervisorError> {
        Ok(())
    }

    /// Builds the argument vector handed to the OS. Must be deterministic.
    fn command_line(&self, binary: &Path, params: &LaunchParams) -> Vec<String>;
}
