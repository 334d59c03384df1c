//! Node supervision and the shared data model of a distributed network
//! emulator.
//!
//! Topologies are emulated by running one process per node on one or more
//! compute hosts and joining their ports with UDP tunnels. This crate holds
//! everything that runs on a compute host, plus the types the controller and
//! the compute hosts exchange.
//!
//! # Organization
//! - [`Nio`] and [`Port`](port::Port) describe what a port is bound to
//! - [`Supervisor`](supervisor::Supervisor) drives one node process and its
//!   bridge through their lifecycle
//! - [`ComputeHost`](host::ComputeHost) keeps the nodes of one host in a
//!   [`NodeRegistry`](registry::NodeRegistry) and answers RPCs about them
//! - [`ComputeHandle`] is how the controller reaches a compute host; it never
//!   touches a host's memory directly
//! - [`NotificationBus`](notification::NotificationBus) carries lifecycle
//!   events to whoever subscribed
//!
//! # Process structure
//!
//! A running node is two processes: the emulator itself and a bridge. The
//! emulator only talks to the bridge, over a private UDP tunnel per port. The
//! bridge forwards between that tunnel and the port's NIO, which lets links be
//! rewired, filtered and captured without restarting the emulator.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub mod bridge;
pub mod compute;
pub use compute::ComputeHandle;

pub mod host;
pub mod nio;
pub use nio::Nio;

pub mod node;
pub mod notification;
pub mod port;
pub mod port_manager;
pub mod process;
pub mod registry;
pub mod supervisor;

mod id;
pub use id::{Id, ParseIdError};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub(crate) type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;
