//! TraceNG nodes, a traceroute-only endpoint.

use super::{Backend, LaunchParams};
use crate::node::NodeType;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct TraceNg;

impl Backend for TraceNg {
    const NODE_TYPE: NodeType = NodeType::TraceNg;
    const INTERNAL_CONSOLE: bool = true;

    fn binary_name(&self) -> &'static str {
        "traceng"
    }

    fn command_line(&self, binary: &Path, params: &LaunchParams) -> Vec<String> {
        let mut argv = vec![binary.to_string_lossy().into_owned()];
        if let Some(console) = params.internal_console {
            argv.extend(["-p".to_string(), console.to_string()]);
        }
        if let Some(tunnel) = params.first_tunnel() {
            argv.extend([
                "-s".to_string(),
                tunnel.process_port.to_string(),
                "-c".to_string(),
                tunnel.bridge_port.to_string(),
                "-t".to_string(),
                "127.0.0.1".to_string(),
            ]);
        }
        argv
    }
}
