//! The moorlock runtime: lockspace manager, resource/token manager, and
//! supervisor, bound into one explicitly constructed [`Runtime`] value.
//! Nothing here is process-global; tests run several isolated runtimes in
//! one process.

pub mod client;
pub mod events;
pub mod resource;
pub mod seams;
pub mod space;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use moorlock_delta::DeltaEngine;
use moorlock_error::{MoorError, Result};
use moorlock_io::traits::DiskHandle;
use moorlock_io::IoDispatcher;
use moorlock_paxos::{HostInfoSource, PaxosEngine};
use moorlock_types::{
    AcquireFlags, Clock, DaemonDump, HostId, HostStatus, LockspaceSpec, Name, ResourceSpec,
    SystemClock, Timeouts, TokenDump,
};
use parking_lot::Mutex;
use tracing::info;

use client::{ClientTable, HeldToken};
use events::EventRing;
use resource::ResourceTable;
use seams::{
    DiskOpener, FileDiskOpener, NullWatchdog, ProcessKiller, SignalKiller, WatchdogConnector,
};
use space::SpaceSet;
use supervisor::Command;

/// Daemon-level tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default I/O timeout for lockspaces that do not specify one.
    pub io_timeout_seconds: u32,
    /// Worker threads executing client commands.
    pub worker_threads: usize,
    /// Supervisor tick; fencing and reaping run at this cadence.
    pub tick: Duration,
    /// This host's name, recorded in its delta lease slots.
    pub host_name: Name,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            io_timeout_seconds: moorlock_types::timeouts::DEFAULT_IO_TIMEOUT_SECONDS,
            worker_threads: 4,
            tick: Duration::from_secs(2),
            host_name: "moorlock".parse().expect("static name"),
        }
    }
}

/// Shared state of one runtime instance.
pub(crate) struct Core {
    pub config: RuntimeConfig,
    pub clock: Arc<dyn Clock>,
    pub io: IoDispatcher,
    pub delta: DeltaEngine,
    pub paxos: PaxosEngine,
    pub opener: Arc<dyn DiskOpener>,
    pub watchdog: Arc<dyn WatchdogConnector>,
    pub killer: Arc<dyn ProcessKiller>,
    pub events: EventRing,
    pub clients: ClientTable,
    pub spaces: SpaceSet,
    pub resources: ResourceTable,
    pub shutdown: AtomicBool,
    token_ids: AtomicU64,
    space_ids: AtomicU32,
    release_tx: Mutex<Option<mpsc::Sender<HeldToken>>>,
}

impl Core {
    pub fn next_token_id(&self) -> u64 {
        self.token_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_space_id(&self) -> u32 {
        self.space_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue a token for the asynchronous release worker.
    pub fn release_async(&self, held: HeldToken) {
        if let Some(tx) = self.release_tx.lock().as_ref() {
            let _ = tx.send(held);
        }
    }

    pub fn timeouts_for(&self, io_timeout_seconds: u32) -> Timeouts {
        Timeouts::new(if io_timeout_seconds == 0 {
            self.config.io_timeout_seconds
        } else {
            io_timeout_seconds
        })
    }
}

impl HostInfoSource for Core {
    fn host_status(&self, space_name: &Name, host_id: HostId) -> Option<HostStatus> {
        self.spaces.get(space_name)?.host_status.get(host_id)
    }

    fn lockspace_disk(&self, space_name: &Name) -> Option<DiskHandle> {
        self.spaces.get(space_name).map(|s| Arc::clone(&s.disk))
    }
}

/// Builder for a [`Runtime`] with substitutable edges.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    opener: Arc<dyn DiskOpener>,
    watchdog: Arc<dyn WatchdogConnector>,
    killer: Arc<dyn ProcessKiller>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
            opener: Arc::new(FileDiskOpener),
            watchdog: Arc::new(NullWatchdog),
            killer: Arc::new(SignalKiller),
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn disk_opener(mut self, opener: Arc<dyn DiskOpener>) -> Self {
        self.opener = opener;
        self
    }

    #[must_use]
    pub fn watchdog(mut self, watchdog: Arc<dyn WatchdogConnector>) -> Self {
        self.watchdog = watchdog;
        self
    }

    #[must_use]
    pub fn process_killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = killer;
        self
    }

    /// Start the supervisor and release worker.
    #[must_use]
    pub fn start(self) -> Runtime {
        let io = IoDispatcher::new();
        let core = Arc::new(Core {
            delta: DeltaEngine::new(io.clone(), Arc::clone(&self.clock)),
            paxos: PaxosEngine::new(io.clone(), Arc::clone(&self.clock)),
            config: self.config,
            clock: self.clock,
            io,
            opener: self.opener,
            watchdog: self.watchdog,
            killer: self.killer,
            events: EventRing::new(),
            clients: ClientTable::new(),
            spaces: SpaceSet::new(),
            resources: ResourceTable::new(),
            shutdown: AtomicBool::new(false),
            token_ids: AtomicU64::new(0),
            space_ids: AtomicU32::new(0),
            release_tx: Mutex::new(None),
        });

        // Asynchronous release worker.
        let (tx, rx) = mpsc::channel::<HeldToken>();
        *core.release_tx.lock() = Some(tx);
        let release_core = Arc::clone(&core);
        let release_worker = std::thread::Builder::new()
            .name("moorlock-release".into())
            .spawn(move || {
                while let Ok(held) = rx.recv() {
                    release_core.release_token_logged(held);
                }
            })
            .expect("spawn release worker");

        // Supervisor.
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let sup_core = Arc::clone(&core);
        let sup = std::thread::Builder::new()
            .name("moorlock-main".into())
            .spawn(move || supervisor::run(&sup_core, &cmd_rx))
            .expect("spawn supervisor");

        info!("runtime started");
        Runtime {
            core,
            tx: cmd_tx,
            supervisor: Mutex::new(Some(sup)),
            release_worker: Mutex::new(Some(release_worker)),
        }
    }
}

/// Handle to a running lock-manager instance.
///
/// Methods submit commands to the supervisor and block for the reply,
/// which is how the transport layer (socket server, bindings) is expected
/// to drive the core.
pub struct Runtime {
    core: Arc<Core>,
    tx: mpsc::Sender<Command>,
    supervisor: Mutex<Option<std::thread::JoinHandle<()>>>,
    release_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Runtime {
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    fn call<T>(&self, build: impl FnOnce(mpsc::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| MoorError::Shutdown)?;
        reply_rx.recv().map_err(|_| MoorError::Shutdown)?
    }

    /// Register a local process as a client.
    pub fn register(&self, pid: i32) -> Result<()> {
        self.call(|reply| Command::Register { pid, reply })
    }

    /// Notify the core that a registered process died.
    pub fn client_gone(&self, pid: i32) -> Result<()> {
        self.call(|reply| Command::ClientGone { pid, reply })
    }

    /// Join a lockspace; returns once the host slot is held.
    pub fn add_lockspace(&self, spec: LockspaceSpec) -> Result<()> {
        self.call(|reply| Command::AddLockspace { spec, reply })
    }

    /// Leave a lockspace; returns once it is fully torn down.
    pub fn rem_lockspace(&self, name: Name) -> Result<()> {
        self.call(|reply| Command::RemLockspace { name, reply })
    }

    /// Acquire leases for a registered client.
    pub fn acquire(
        &self,
        pid: i32,
        resources: Vec<ResourceSpec>,
        flags: AcquireFlags,
    ) -> Result<()> {
        self.call(|reply| Command::Acquire {
            pid,
            resources,
            flags,
            reply,
        })
    }

    /// Release specific leases, or all with `None`.
    pub fn release(&self, pid: i32, resources: Option<Vec<(Name, Name)>>) -> Result<()> {
        self.call(|reply| Command::Release {
            pid,
            resources,
            reply,
        })
    }

    /// Dump the tokens a client holds.
    pub fn inquire(&self, pid: i32) -> Result<Vec<TokenDump>> {
        self.call(|reply| Command::Inquire { pid, reply })
    }

    /// Structured daemon state.
    pub fn status(&self) -> Result<DaemonDump> {
        self.call(|reply| Command::Status { reply })
    }

    /// Recent event lines.
    pub fn log_dump(&self) -> Result<Vec<String>> {
        self.call(|reply| Command::LogDump { reply })
    }

    /// Begin shutdown: all lockspaces are fenced and removed, then the
    /// supervisor exits. Use [`Runtime::wait`] to join it.
    pub fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply })
    }

    /// Join the supervisor after [`Runtime::shutdown`].
    pub fn wait(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
        *self.core.release_tx.lock() = None;
        if let Some(handle) = self.release_worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Direct (non-blocking) submission for transports that manage their
    /// own replies.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| MoorError::Shutdown)
    }
}
