//! The packet bridging subprocess that sits between a node process and its
//! links.
//!
//! Every running node gets one bridge. The node process only ever talks to the
//! bridge over a private UDP tunnel; the bridge forwards between that tunnel
//! and whatever NIO the port is bound to, applying filters and captures on the
//! way.

use crate::{
    port_manager::PortManager,
    process::{terminate_process, ChildProcess, ProcessLauncher},
    Id,
};
use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum BridgeCommandError {
    #[error("The bridge is not running")]
    NotRunning,
    #[error("The bridge rejected {command:?}: {reply}")]
    Rejected { command: String, reply: String },
    #[error("The bridge did not answer {0:?} in time")]
    Timeout(String),
    #[error("Failed to start the bridge: {0}")]
    Start(String),
    #[error("Bridge I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// A bridging subprocess, driven by sending it commands and awaiting their
/// acknowledgement.
#[async_trait]
pub trait Bridge: Send {
    /// Launches the subprocess. Starting a running bridge does nothing.
    async fn start(&mut self) -> Result<(), BridgeCommandError>;

    /// Whether the subprocess is alive and accepting commands.
    fn is_running(&mut self) -> bool;

    /// Sends one command and returns the acknowledgement lines.
    async fn send(&mut self, command: &str) -> Result<Vec<String>, BridgeCommandError>;

    /// Shuts the subprocess down.
    async fn stop(&mut self) -> Result<(), BridgeCommandError>;
}

/// Makes a bridge for each node.
pub trait BridgeFactory: Send + Sync {
    fn create(&self, node_id: Id, working_dir: &Path) -> Box<dyn Bridge>;
}

/// Builders for the bridge command language.
pub mod command {
    use std::path::Path;

    pub fn create(bridge: &str) -> String {
        format!("bridge create {}", bridge)
    }

    pub fn add_nio_udp(bridge: &str, lport: u16, rhost: &str, rport: u16) -> String {
        format!("bridge add_nio_udp {} {} {} {}", bridge, lport, rhost, rport)
    }

    pub fn start(bridge: &str) -> String {
        format!("bridge start {}", bridge)
    }

    pub fn delete(bridge: &str) -> String {
        format!("bridge delete {}", bridge)
    }

    pub fn start_capture(bridge: &str, path: &Path, data_link_type: &str) -> String {
        // The bridge expects the bare link type name, without the DLT_ prefix
        let data_link_type = data_link_type.trim_start_matches("DLT_");
        format!(
            "bridge start_capture {} \"{}\" {}",
            bridge,
            path.display(),
            data_link_type
        )
    }

    pub fn stop_capture(bridge: &str) -> String {
        format!("bridge stop_capture {}", bridge)
    }

    pub fn reset_packet_filters(bridge: &str) -> String {
        format!("bridge reset_packet_filters {}", bridge)
    }

    pub fn add_packet_filter(bridge: &str, index: usize, filter: &str, params: &[i64]) -> String {
        let mut command = format!("bridge add_packet_filter {} filter{} {}", bridge, index, filter);
        for param in params {
            command.push(' ');
            command.push_str(&param.to_string());
        }
        command
    }

    pub fn hypervisor_stop() -> String {
        "hypervisor stop".to_string()
    }
}

/// Reads one reply. Lines look like `100-text` while more follow and
/// `100 text` for the last one; codes of 200 and above are errors.
async fn read_reply<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    command: &str,
) -> Result<Vec<String>, BridgeCommandError> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "bridge closed the connection").into());
        }
        let line = line.trim_end();
        let malformed = || BridgeCommandError::Rejected {
            command: command.to_string(),
            reply: format!("malformed reply {:?}", line),
        };
        let last = match line.as_bytes().get(3) {
            Some(b' ') => true,
            Some(b'-') => false,
            _ => return Err(malformed()),
        };
        let code: u16 = line[..3].parse().map_err(|_| malformed())?;
        let text = line[4..].to_string();
        if code >= 200 {
            return Err(BridgeCommandError::Rejected {
                command: command.to_string(),
                reply: text,
            });
        }
        lines.push(text);
        if last {
            return Ok(lines);
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A bridge run by the `ubridge` hypervisor, controlled over a local TCP
/// connection.
pub struct Ubridge {
    binary: PathBuf,
    working_dir: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    ports: Arc<PortManager>,
    reply_timeout: Duration,
    stop_timeout: Duration,
    process: Option<Box<dyn ChildProcess>>,
    port: Option<u16>,
    connection: Option<Connection>,
}

impl Ubridge {
    const HOST: &'static str = "127.0.0.1";
    const CONNECT_ATTEMPTS: usize = 30;
    const CONNECT_DELAY: Duration = Duration::from_millis(100);

    async fn connect(port: u16) -> io::Result<Connection> {
        let mut last_error = None;
        for _ in 0..Self::CONNECT_ATTEMPTS {
            match TcpStream::connect((Self::HOST, port)).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(Connection {
                        reader: BufReader::new(reader),
                        writer,
                    });
                }
                Err(e) => last_error = Some(e),
            }
            tokio::time::sleep(Self::CONNECT_DELAY).await;
        }
        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no connection attempt")))
    }

    async fn shut_down_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = terminate_process(process.as_mut(), self.stop_timeout).await {
                tracing::error!("Failed to terminate bridge: {}", e);
            }
        }
        if let Some(port) = self.port.take() {
            self.ports.release_tcp_port(port);
        }
    }
}

#[async_trait]
impl Bridge for Ubridge {
    async fn start(&mut self) -> Result<(), BridgeCommandError> {
        if self.is_running() {
            return Ok(());
        }
        let binary = self
            .launcher
            .resolve(&self.binary)
            .map_err(|e| BridgeCommandError::Start(format!("{}: {}", self.binary.display(), e)))?;
        let port = self
            .ports
            .get_free_tcp_port()
            .await
            .map_err(|e| BridgeCommandError::Start(e.to_string()))?;
        self.port = Some(port);
        let argv = vec![
            binary.to_string_lossy().into_owned(),
            "-H".to_string(),
            format!("{}:{}", Self::HOST, port),
        ];
        match self.launcher.spawn(&argv, &self.working_dir).await {
            Ok(process) => self.process = Some(process),
            Err(e) => {
                self.shut_down_process().await;
                return Err(BridgeCommandError::Start(e.to_string()));
            }
        }
        match Self::connect(port).await {
            Ok(connection) => {
                tracing::info!(port, "Bridge hypervisor started");
                self.connection = Some(connection);
                Ok(())
            }
            Err(e) => {
                self.shut_down_process().await;
                Err(BridgeCommandError::Start(e.to_string()))
            }
        }
    }

    fn is_running(&mut self) -> bool {
        self.connection.is_some()
            && self
                .process
                .as_mut()
                .map_or(false, |process| !process.has_exited())
    }

    async fn send(&mut self, command: &str) -> Result<Vec<String>, BridgeCommandError> {
        let connection = self.connection.as_mut().ok_or(BridgeCommandError::NotRunning)?;
        tracing::debug!(command, "Sending bridge command");
        let result = match connection
            .writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
        {
            Ok(()) => match tokio::time::timeout(self.reply_timeout, read_reply(&mut connection.reader, command)).await {
                Ok(reply) => reply,
                Err(_) => Err(BridgeCommandError::Timeout(command.to_string())),
            },
            Err(e) => Err(e.into()),
        };
        // A late reply would be read as the answer to the next command
        if matches!(result, Err(BridgeCommandError::Timeout(_) | BridgeCommandError::Io(_))) {
            tracing::warn!(command, "Dropping bridge connection");
            self.connection = None;
        }
        result
    }

    async fn stop(&mut self) -> Result<(), BridgeCommandError> {
        if self.connection.is_some() {
            if let Err(e) = self.send(&command::hypervisor_stop()).await {
                tracing::debug!("Bridge did not acknowledge stop: {}", e);
            }
            self.connection = None;
        }
        self.shut_down_process().await;
        Ok(())
    }
}

/// Creates a [`Ubridge`] per node.
pub struct UbridgeFactory {
    pub binary: PathBuf,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub ports: Arc<PortManager>,
    pub reply_timeout: Duration,
    pub stop_timeout: Duration,
}

impl BridgeFactory for UbridgeFactory {
    fn create(&self, _node_id: Id, working_dir: &Path) -> Box<dyn Bridge> {
        Box::new(Ubridge {
            binary: self.binary.clone(),
            working_dir: working_dir.to_path_buf(),
            launcher: self.launcher.clone(),
            ports: self.ports.clone(),
            reply_timeout: self.reply_timeout,
            stop_timeout: self.stop_timeout,
            process: None,
            port: None,
            connection: None,
        })
    }
}
