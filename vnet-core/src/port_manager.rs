//! Hands out the UDP and TCP ports a compute host listens on.

use std::{
    collections::BTreeSet,
    ops::RangeInclusive,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::net::{TcpListener, UdpSocket};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PortManagerError {
    #[error("No free {kind} port in range {start}-{end}")]
    Exhausted {
        kind: &'static str,
        start: u16,
        end: u16,
    },
    #[error("{kind} port {port} is outside of range {start}-{end}")]
    OutOfRange {
        kind: &'static str,
        port: u16,
        start: u16,
        end: u16,
    },
}

/// Tracks which ports in a range are taken.
#[derive(Debug)]
struct Pool {
    kind: &'static str,
    range: RangeInclusive<u16>,
    used: Mutex<BTreeSet<u16>>,
}

impl Pool {
    fn new(kind: &'static str, range: RangeInclusive<u16>) -> Self {
        Self {
            kind,
            range,
            used: Default::default(),
        }
    }

    /// A set of port numbers is still valid after a panic elsewhere, so a
    /// poisoned lock is recovered rather than propagated.
    fn used(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the lowest free port above `after` as used. The scan never wraps,
    /// so a port released below `after` is only seen again by the next scan
    /// that starts from the bottom of the range.
    fn claim_after(&self, after: Option<u16>) -> Option<u16> {
        let mut used = self.used();
        let start = match after {
            None => *self.range.start(),
            Some(port) => port.checked_add(1)?,
        };
        let port = (start..=*self.range.end()).find(|port| !used.contains(port))?;
        used.insert(port);
        Some(port)
    }

    fn release(&self, port: u16) {
        self.used().remove(&port);
    }

    /// Returns whether the port was free before.
    fn reserve(&self, port: u16) -> Result<bool, PortManagerError> {
        if !self.range.contains(&port) {
            return Err(PortManagerError::OutOfRange {
                kind: self.kind,
                port,
                start: *self.range.start(),
                end: *self.range.end(),
            });
        }
        Ok(self.used().insert(port))
    }

    fn exhausted(&self) -> PortManagerError {
        PortManagerError::Exhausted {
            kind: self.kind,
            start: *self.range.start(),
            end: *self.range.end(),
        }
    }

    fn is_used(&self, port: u16) -> bool {
        self.used().contains(&port)
    }
}

/// Allocates ports for one compute host.
///
/// A port is only handed out after the OS has accepted a bind on it, so ports
/// taken by unrelated programs are skipped. Allocated ports belong to whoever
/// asked for them until released.
#[derive(Debug)]
pub struct PortManager {
    udp: Pool,
    tcp: Pool,
    bind_host: String,
}

impl PortManager {
    pub fn new(
        bind_host: impl Into<String>,
        udp: RangeInclusive<u16>,
        tcp: RangeInclusive<u16>,
    ) -> Self {
        Self {
            udp: Pool::new("UDP", udp),
            tcp: Pool::new("TCP", tcp),
            bind_host: bind_host.into(),
        }
    }

    /// Finds a UDP port in range that no one holds and the OS lets us bind.
    pub async fn get_free_udp_port(&self) -> Result<u16, PortManagerError> {
        let mut candidate = None;
        loop {
            let port = self.udp.claim_after(candidate).ok_or_else(|| self.udp.exhausted())?;
            match UdpSocket::bind((self.bind_host.as_str(), port)).await {
                Ok(_) => return Ok(port),
                Err(e) => {
                    tracing::debug!(port, "UDP port is not bindable: {}", e);
                    self.udp.release(port);
                    candidate = Some(port);
                }
            }
        }
    }

    /// Finds a TCP port in range that no one holds and the OS lets us listen on.
    pub async fn get_free_tcp_port(&self) -> Result<u16, PortManagerError> {
        let mut candidate = None;
        loop {
            let port = self.tcp.claim_after(candidate).ok_or_else(|| self.tcp.exhausted())?;
            match TcpListener::bind((self.bind_host.as_str(), port)).await {
                Ok(_) => return Ok(port),
                Err(e) => {
                    tracing::debug!(port, "TCP port is not bindable: {}", e);
                    self.tcp.release(port);
                    candidate = Some(port);
                }
            }
        }
    }

    /// Marks a UDP port chosen elsewhere as used. Reserving a port twice is
    /// harmless; the result tells whether this call took it.
    pub fn reserve_udp_port(&self, port: u16) -> Result<bool, PortManagerError> {
        self.udp.reserve(port)
    }

    pub fn release_udp_port(&self, port: u16) {
        self.udp.release(port)
    }

    pub fn release_tcp_port(&self, port: u16) {
        self.tcp.release(port)
    }

    pub fn udp_port_in_use(&self, port: u16) -> bool {
        self.udp.is_used(port)
    }

    pub fn tcp_port_in_use(&self, port: u16) -> bool {
        self.tcp.is_used(port)
    }
}
