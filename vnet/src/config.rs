//! Configuration, read from a JSON file. Every field has a default, so an
//! empty object (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    io,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};
use vnet_core::{
    compute::Interface, host::HostSettings, nio::Filters, node::NodeType,
    supervisor::SupervisorSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compute: ComputeConfig,
    pub controller: ControllerConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, range) in [
            ("udp_port_range", &self.compute.udp_port_range),
            ("console_port_range", &self.compute.console_port_range),
        ] {
            if range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "{} starts after it ends ({} > {})",
                    name, range.start, range.end
                )));
            }
        }
        for node_type in self.compute.binaries.keys() {
            if NodeType::from_path_segment(node_type).is_none() {
                return Err(ConfigError::Invalid(format!("Unknown node type {}", node_type)));
            }
        }
        let topology = &self.controller.topology;
        let mut names = HashSet::new();
        for node in &topology.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::Invalid(format!("Node {} is defined twice", node.name)));
            }
        }
        for link in &topology.links {
            for endpoint in [&link.a, &link.b] {
                if !names.contains(endpoint.node.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "Link endpoint refers to unknown node {}",
                        endpoint.node
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// The address the local compute host advertises.
    pub host: String,
    pub interfaces: Vec<Interface>,
    pub projects_dir: PathBuf,
    pub udp_port_range: PortRange,
    pub console_port_range: PortRange,
    /// Binary paths keyed by node type.
    pub binaries: HashMap<String, PathBuf>,
    pub ubridge_path: PathBuf,
    pub stop_timeout_ms: u64,
    pub startup_grace_ms: u64,
    pub bridge_reply_timeout_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            interfaces: vec![Interface {
                name: "lo".into(),
                ip_address: "127.0.0.1".into(),
                netmask: Some("255.0.0.0".into()),
            }],
            projects_dir: PathBuf::from("./projects"),
            udp_port_range: PortRange {
                start: 10000,
                end: 20000,
            },
            console_port_range: PortRange {
                start: 5000,
                end: 10000,
            },
            binaries: HashMap::new(),
            ubridge_path: PathBuf::from("ubridge"),
            stop_timeout_ms: 3000,
            startup_grace_ms: 100,
            bridge_reply_timeout_ms: 5000,
        }
    }
}

impl ComputeConfig {
    pub fn bridge_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_reply_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn host_settings(&self) -> HostSettings {
        let binaries = self
            .binaries
            .iter()
            .filter_map(|(node_type, path)| {
                NodeType::from_path_segment(node_type).map(|node_type| (node_type, path.clone()))
            })
            .collect();
        HostSettings {
            host: self.host.clone(),
            interfaces: self.interfaces.clone(),
            projects_dir: self.projects_dir.clone(),
            supervisor: SupervisorSettings {
                stop_timeout: self.stop_timeout(),
                startup_grace: Duration::from_millis(self.startup_grace_ms),
                binaries,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub rpc_timeout_ms: u64,
    pub topology: Topology,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 30000,
            topology: Topology::default(),
        }
    }
}

impl ControllerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// The nodes and links brought up at boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub nodes: Vec<NodeConfig>,
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: EndpointConfig,
    pub b: EndpointConfig,
    #[serde(default)]
    pub filters: Filters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub node: String,
    #[serde(default)]
    pub adapter: u32,
    #[serde(default)]
    pub port: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_all_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.compute.host, "127.0.0.1");
        assert_eq!(config.compute.udp_port_range.range(), 10000..=20000);
        assert_eq!(config.compute.console_port_range.range(), 5000..=10000);
        assert_eq!(config.compute.ubridge_path, PathBuf::from("ubridge"));
        assert_eq!(config.controller.rpc_timeout(), Duration::from_secs(30));
        assert!(config.controller.topology.nodes.is_empty());
    }

    #[test]
    fn reads_topology_and_binaries() {
        let config = Config::from_json(
            r#"{
                "compute": {"binaries": {"vpcs": "/opt/vpcs/bin/vpcs"}, "stop_timeout_ms": 500},
                "controller": {"topology": {
                    "nodes": [{"name": "PC1", "node_type": "vpcs"}, {"name": "PC2", "node_type": "traceng"}],
                    "links": [{"a": {"node": "PC1"}, "b": {"node": "PC2"}, "filters": {"delay": [50]}}]
                }}
            }"#,
        )
        .unwrap();
        let settings = config.compute.host_settings();
        assert_eq!(
            settings.supervisor.binaries.get(&NodeType::Vpcs),
            Some(&PathBuf::from("/opt/vpcs/bin/vpcs"))
        );
        assert_eq!(settings.supervisor.stop_timeout, Duration::from_millis(500));
        let link = &config.controller.topology.links[0];
        assert_eq!((link.a.adapter, link.a.port), (0, 0));
        assert_eq!(link.filters.get("delay"), Some(&vec![50]));
    }

    #[test]
    fn rejects_bad_configurations() {
        assert!(matches!(Config::from_json("{"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            Config::from_json(r#"{"compute": {"udp_port_range": {"start": 20, "end": 10}}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"controller": {"topology": {"links": [{"a": {"node": "X"}, "b": {"node": "Y"}}]}}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/vnet.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
