//! Scripted stand-ins for processes and bridges, for tests that need a
//! supervisor or a compute host without real emulator binaries.

use crate::{
    bridge::{Bridge, BridgeCommandError, BridgeFactory},
    process::{ChildProcess, ProcessLauncher},
    Id,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;

/// The observable side of a [`FakeProcess`].
#[derive(Debug, Default)]
pub struct FakeProcessHandle {
    exited: AtomicBool,
    ignore_terminate: AtomicBool,
    terminations: AtomicUsize,
    kills: AtomicUsize,
    exit: Notify,
}

impl FakeProcessHandle {
    /// Makes the process exit on its own.
    pub fn crash(&self) {
        self.exit_now();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    fn exit_now(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit.notify_one();
    }
}

struct FakeProcess {
    pid: u32,
    handle: Arc<FakeProcessHandle>,
}

#[async_trait]
impl ChildProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        (!self.handle.has_exited()).then_some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.handle.has_exited()
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.handle.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.handle.ignore_terminate.load(Ordering::SeqCst) {
            self.handle.exit_now();
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.handle.kills.fetch_add(1, Ordering::SeqCst);
        self.handle.exit_now();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        while !self.handle.has_exited() {
            self.handle.exit.notified().await;
        }
        Ok(Some(0))
    }
}

#[derive(Default)]
struct LauncherState {
    spawned: Vec<Vec<String>>,
    processes: Vec<Arc<FakeProcessHandle>>,
    outputs: HashMap<String, String>,
    missing: Vec<PathBuf>,
    fail_spawn: bool,
    exit_on_spawn: bool,
    ignore_terminate: bool,
}

/// A launcher that records what it is asked to run and hands out fake
/// processes. Every program resolves to itself unless marked missing.
#[derive(Default, Clone)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scripts what `output` prints for a program.
    pub fn set_output(&self, program: impl Into<String>, output: impl Into<String>) {
        self.state().outputs.insert(program.into(), output.into());
    }

    /// Makes `program` fail to resolve.
    pub fn set_missing(&self, program: impl Into<PathBuf>) {
        self.state().missing.push(program.into());
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.state().fail_spawn = fail;
    }

    /// Makes new processes die right after being spawned.
    pub fn exit_on_spawn(&self, exit: bool) {
        self.state().exit_on_spawn = exit;
    }

    /// Makes new processes ignore graceful termination.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.state().ignore_terminate = ignore;
    }

    /// Every argument vector spawned so far.
    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.state().spawned.clone()
    }

    pub fn last_process(&self) -> Option<Arc<FakeProcessHandle>> {
        self.state().processes.last().cloned()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn resolve(&self, program: &Path) -> io::Result<PathBuf> {
        if self.state().missing.iter().any(|missing| missing == program) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", program.display()),
            ));
        }
        Ok(program.to_path_buf())
    }

    async fn spawn(&self, argv: &[String], _working_dir: &Path) -> io::Result<Box<dyn ChildProcess>> {
        let mut state = self.state();
        if state.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "spawning disabled"));
        }
        state.spawned.push(argv.to_vec());
        let handle = Arc::new(FakeProcessHandle::default());
        handle
            .ignore_terminate
            .store(state.ignore_terminate, Ordering::SeqCst);
        if state.exit_on_spawn {
            handle.exit_now();
        }
        state.processes.push(handle.clone());
        Ok(Box::new(FakeProcess {
            pid: 1000 + state.processes.len() as u32,
            handle,
        }))
    }

    async fn output(&self, argv: &[String]) -> io::Result<String> {
        let program = argv
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        self.state()
            .outputs
            .get(program)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", program)))
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    commands: Vec<String>,
    starts: usize,
    stops: usize,
    running: bool,
    fail_start: bool,
    dead_on_start: bool,
    reject: Option<String>,
}

/// The observable side of a [`FakeBridge`].
#[derive(Debug, Default)]
pub struct FakeBridgeHandle {
    state: Mutex<BridgeState>,
}

impl FakeBridgeHandle {
    fn state(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every command accepted or rejected so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    pub fn starts(&self) -> usize {
        self.state().starts
    }

    pub fn stops(&self) -> usize {
        self.state().stops
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    /// Makes the bridge start without becoming usable.
    pub fn dead_on_start(&self, dead: bool) {
        self.state().dead_on_start = dead;
    }

    /// Rejects every command starting with `prefix`.
    pub fn reject(&self, prefix: Option<&str>) {
        self.state().reject = prefix.map(str::to_string);
    }

    pub fn crash(&self) {
        self.state().running = false;
    }
}

/// A bridge that records the commands it receives.
#[derive(Debug, Clone, Default)]
pub struct FakeBridge {
    handle: Arc<FakeBridgeHandle>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<FakeBridgeHandle> {
        self.handle.clone()
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn start(&mut self) -> Result<(), BridgeCommandError> {
        let mut state = self.handle.state();
        if state.running {
            return Ok(());
        }
        state.starts += 1;
        if state.fail_start {
            return Err(BridgeCommandError::Start("bridge disabled".into()));
        }
        state.running = !state.dead_on_start;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.handle.state().running
    }

    async fn send(&mut self, command: &str) -> Result<Vec<String>, BridgeCommandError> {
        let mut state = self.handle.state();
        if !state.running {
            return Err(BridgeCommandError::NotRunning);
        }
        state.commands.push(command.to_string());
        match &state.reject {
            Some(prefix) if command.starts_with(prefix.as_str()) => Err(BridgeCommandError::Rejected {
                command: command.to_string(),
                reply: "rejected".into(),
            }),
            _ => Ok(vec!["OK".into()]),
        }
    }

    async fn stop(&mut self) -> Result<(), BridgeCommandError> {
        let mut state = self.handle.state();
        state.stops += 1;
        state.running = false;
        Ok(())
    }
}

/// Hands out one [`FakeBridge`] per node and remembers them.
#[derive(Default, Clone)]
pub struct FakeBridgeFactory {
    bridges: Arc<Mutex<HashMap<Id, Arc<FakeBridgeHandle>>>>,
}

impl FakeBridgeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bridge(&self, node_id: Id) -> Option<Arc<FakeBridgeHandle>> {
        self.bridges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&node_id)
            .cloned()
    }
}

impl BridgeFactory for FakeBridgeFactory {
    fn create(&self, node_id: Id, _working_dir: &Path) -> Box<dyn Bridge> {
        let bridge = FakeBridge::new();
        self.bridges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node_id, bridge.handle());
        Box::new(bridge)
    }
}
