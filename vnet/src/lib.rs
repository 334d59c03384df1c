//! The controller of a distributed network emulator.
//!
//! The controller owns no node state itself. It creates nodes on compute hosts
//! through [`ComputeHandle`](vnet_core::ComputeHandle)s, links their ports with
//! [`UdpLink`](link::UdpLink)s and captures link traffic, all through RPCs.

pub mod cli;
pub mod config;
pub mod link;
pub mod logging;
pub mod node;
pub mod project;
