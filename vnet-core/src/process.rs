//! Launching and terminating external processes.
//!
//! Supervisors never talk to the OS directly. They go through a
//! [`ProcessLauncher`] so that the exact argument vector handed to the OS is
//! observable and so that hosts can substitute their own launcher.

use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::{Child, Command};

/// Starts processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Finds the executable a program name or path refers to.
    fn resolve(&self, program: &Path) -> io::Result<PathBuf> {
        which::which(program).map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))
    }

    /// Launches `argv[0]` with the remaining arguments in `working_dir`.
    async fn spawn(&self, argv: &[String], working_dir: &Path) -> io::Result<Box<dyn ChildProcess>>;

    /// Runs `argv` to completion and returns everything it printed.
    async fn output(&self, argv: &[String]) -> io::Result<String>;
}

/// A running (or exited) process.
#[async_trait]
pub trait ChildProcess: Send {
    /// The OS process id, if the process has not been reaped yet.
    fn id(&self) -> Option<u32>;

    /// Checks, without waiting, whether the process has exited.
    fn has_exited(&mut self) -> bool;

    /// Asks the process to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the process to exit.
    fn kill(&mut self) -> io::Result<()>;

    /// Waits for the process to exit and returns its exit code, if any.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Terminates `child`, escalating to a kill if it has not exited after
/// `timeout`. Neither wait can take longer than `timeout`.
pub async fn terminate_process(child: &mut dyn ChildProcess, timeout: Duration) -> io::Result<()> {
    if child.has_exited() {
        return Ok(());
    }
    if let Err(e) = child.terminate() {
        tracing::warn!(pid = ?child.id(), "Failed to signal process: {}", e);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result.map(drop),
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "Process still running after {:?}, killing it", timeout);
            child.kill()?;
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => result.map(drop),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "process did not exit after being killed",
                )),
            }
        }
    }
}

/// Launches real processes through tokio.
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

impl TokioLauncher {
    pub fn new() -> Self {
        Self
    }
}

fn split(argv: &[String]) -> io::Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, argv: &[String], working_dir: &Path) -> io::Result<Box<dyn ChildProcess>> {
        let (program, args) = split(argv)?;
        tokio::fs::create_dir_all(working_dir).await?;
        let stem = Path::new(program)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "process".into());
        let log = tokio::fs::File::create(working_dir.join(format!("{}.log", stem)))
            .await?
            .into_std()
            .await;
        let child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(pid = ?child.id(), command = %argv.join(" "), "Process started");
        Ok(Box::new(TokioChild { child }))
    }

    async fn output(&self, argv: &[String]) -> io::Result<String> {
        let (program, args) = split(argv)?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

struct TokioChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                tracing::warn!("Failed to poll process: {}", e);
                true
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: kill(2) has no memory safety requirements
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }
}
