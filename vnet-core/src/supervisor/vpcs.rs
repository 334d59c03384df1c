//! Virtual PC Simulator nodes.

use super::{Backend, LaunchParams, SupervisorError};
use crate::{node::NodeType, process::ProcessLauncher};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct Vpcs;

impl Vpcs {
    const MIN_VERSION: (u32, u32, u32) = (0, 6, 1);

    /// Pulls the version out of a `vpcs -v` banner such as
    /// `Welcome to Virtual PC Simulator, version 0.6.1`.
    pub(crate) fn parse_version(banner: &str) -> Option<(u32, u32, u32)> {
        let start = banner.find("version ")? + "version ".len();
        let digits: String = banner[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = digits.split('.').filter(|part| !part.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |part| part.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |part| part.parse().ok())?;
        Some((major, minor, patch))
    }
}

#[async_trait]
impl Backend for Vpcs {
    const NODE_TYPE: NodeType = NodeType::Vpcs;

    fn binary_name(&self) -> &'static str {
        "vpcs"
    }

    async fn check_requirements(
        &self,
        binary: &Path,
        launcher: &dyn ProcessLauncher,
    ) -> Result<(), SupervisorError> {
        let argv = [binary.to_string_lossy().into_owned(), "-v".to_string()];
        let banner = launcher.output(&argv).await.map_err(|e| {
            SupervisorError::Requirements(format!("Could not run {}: {}", binary.display(), e))
        })?;
        let version = Self::parse_version(&banner).ok_or_else(|| {
            SupervisorError::Requirements(format!(
                "Could not determine the version of {}",
                binary.display()
            ))
        })?;
        // 0.8 was a development line with an incompatible command line
        if version < Self::MIN_VERSION || (version.0, version.1) == (0, 8) {
            return Err(SupervisorError::Requirements(format!(
                "VPCS executable version must be >= 0.6.1 but not a 0.8, found {}.{}.{}",
                version.0, version.1, version.2
            )));
        }
        Ok(())
    }

    fn command_line(&self, binary: &Path, params: &LaunchParams) -> Vec<String> {
        let mut argv = vec![binary.to_string_lossy().into_owned()];
        if let Some(console) = params.console {
            argv.extend(["-p".to_string(), console.to_string()]);
        }
        argv.extend([
            "-m".to_string(),
            params.mac_id.to_string(),
            "-i".to_string(),
            "1".to_string(),
            "-F".to_string(),
            "-R".to_string(),
        ]);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{port::PortAddress, supervisor::Tunnel};

    #[test]
    fn parses_banner() {
        assert_eq!(
            Vpcs::parse_version("Welcome to Virtual PC Simulator, version 0.6.1\nDedicated to Daling."),
            Some((0, 6, 1))
        );
        assert_eq!(Vpcs::parse_version("version 0.8"), Some((0, 8, 0)));
        assert_eq!(Vpcs::parse_version("no banner here"), None);
    }

    #[test]
    fn command_line_layout() {
        let tunnels = [(
            PortAddress::new(0, 0),
            Tunnel {
                process_port: 10001,
                bridge_port: 10002,
            },
        )];
        let params = LaunchParams {
            console: Some(5000),
            internal_console: None,
            mac_id: 7,
            tunnels: &tunnels,
        };
        assert_eq!(
            Vpcs.command_line(Path::new("/usr/bin/vpcs"), &params),
            vec![
                "/usr/bin/vpcs", "-p", "5000", "-m", "7", "-i", "1", "-F", "-R", "-s", "10001",
                "-c", "10002", "-t", "127.0.0.1"
            ]
        );
    }
}
