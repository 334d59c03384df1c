//! Logical adapter ports of an emulated node.

use crate::nio::Nio;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf};

/// The stable address of a port: an adapter number and a port number on that
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub adapter_number: u32,
    pub port_number: u32,
}

impl PortAddress {
    pub const fn new(adapter_number: u32, port_number: u32) -> Self {
        Self {
            adapter_number,
            port_number,
        }
    }
}

impl Display for PortAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.adapter_number, self.port_number)
    }
}

/// A port as described to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    #[serde(flatten)]
    pub address: PortAddress,
    pub name: Option<String>,
}

impl PortInfo {
    pub fn new(address: PortAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: Some(name.into()),
        }
    }
}

/// A packet capture running on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCapture {
    pub path: PathBuf,
    pub data_link_type: String,
}

/// A port of a node on its compute host, holding at most one bound NIO.
#[derive(Debug, Clone)]
pub struct Port {
    info: PortInfo,
    nio: Option<Nio>,
    capture: Option<PortCapture>,
}

impl Port {
    pub fn new(info: PortInfo) -> Self {
        Self {
            info,
            nio: None,
            capture: None,
        }
    }

    pub fn address(&self) -> PortAddress {
        self.info.address
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    pub fn nio(&self) -> Option<&Nio> {
        self.nio.as_ref()
    }

    pub fn capture(&self) -> Option<&PortCapture> {
        self.capture.as_ref()
    }

    /// Binds a NIO. Fails with the rejected NIO if one is already bound.
    pub fn bind(&mut self, nio: Nio) -> Result<(), Nio> {
        if self.nio.is_some() {
            return Err(nio);
        }
        self.nio = Some(nio);
        Ok(())
    }

    /// Replaces the bound NIO, returning the previous one.
    pub fn rebind(&mut self, nio: Nio) -> Option<Nio> {
        self.nio.replace(nio)
    }

    /// Releases the bound NIO. A capture cannot outlive its NIO.
    pub fn unbind(&mut self) -> Option<Nio> {
        self.capture = None;
        self.nio.take()
    }

    pub fn set_capture(&mut self, capture: Option<PortCapture>) {
        self.capture = capture;
    }
}

/// The fixed port topology of a node. Ports are created once and only their
/// bindings change afterwards.
#[derive(Debug, Clone)]
pub struct Ports(Vec<Port>);

impl Ports {
    pub fn new(infos: impl IntoIterator<Item = PortInfo>) -> Self {
        Self(infos.into_iter().map(Port::new).collect())
    }

    pub fn get(&self, address: PortAddress) -> Option<&Port> {
        self.0.iter().find(|port| port.address() == address)
    }

    pub fn get_mut(&mut self, address: PortAddress) -> Option<&mut Port> {
        self.0.iter_mut().find(|port| port.address() == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.0.iter()
    }

    /// Ports that currently have a NIO bound.
    pub fn bound(&self) -> impl Iterator<Item = (PortAddress, &Nio)> {
        self.0
            .iter()
            .filter_map(|port| port.nio().map(|nio| (port.address(), nio)))
    }

    pub fn infos(&self) -> Vec<PortInfo> {
        self.0.iter().map(|port| port.info().clone()).collect()
    }
}
