//! Network I/O endpoint descriptors.
//!
//! A [`Nio`] attaches a port of an emulated node to a transport. Only UDP
//! tunnels exist today. Once bound to a port a NIO is never mutated; changing
//! its filters produces a new descriptor that replaces the old one wholesale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Traffic shaping filters applied to a NIO, keyed by filter name
/// (`frequency_drop`, `packet_loss`, `delay`, `corrupt`, ...).
pub type Filters = BTreeMap<String, Vec<i64>>;

/// A network I/O endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Nio {
    #[serde(rename = "nio_udp")]
    Udp(NioUdp),
}

/// A UDP tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NioUdp {
    /// The local port packets are received on.
    pub lport: u16,
    /// The host packets are sent to.
    pub rhost: String,
    /// The port packets are sent to.
    pub rport: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: Filters,
}

impl Nio {
    /// Creates a UDP NIO without filters.
    pub fn udp(lport: u16, rhost: impl Into<String>, rport: u16) -> Self {
        Self::Udp(NioUdp {
            lport,
            rhost: rhost.into(),
            rport,
            filters: Filters::new(),
        })
    }

    /// The local port of the endpoint.
    pub fn lport(&self) -> u16 {
        match self {
            Nio::Udp(udp) => udp.lport,
        }
    }

    pub fn filters(&self) -> &Filters {
        match self {
            Nio::Udp(udp) => &udp.filters,
        }
    }

    /// Returns a copy of this NIO carrying `filters` instead of its own.
    pub fn replace_filters(&self, filters: Filters) -> Self {
        match self {
            Nio::Udp(udp) => Nio::Udp(NioUdp {
                filters,
                ..udp.clone()
            }),
        }
    }
}
