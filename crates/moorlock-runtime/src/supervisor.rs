//! The supervisor: a single event loop that dispatches client commands to
//! a bounded worker pool, sweeps lockspaces for fencing on every tick,
//! and drives shutdown once nothing is left to protect.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;

use moorlock_error::Result;
use moorlock_types::{
    AcquireFlags, DaemonDump, LockspaceSpec, Name, ResourceSpec, TokenDump,
};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::space::Space;
use crate::Core;

/// Typed messages of the client control interface. The transport layer
/// builds these; replies flow back over the carried sender.
pub enum Command {
    Register {
        pid: i32,
        reply: Sender<Result<()>>,
    },
    ClientGone {
        pid: i32,
        reply: Sender<Result<()>>,
    },
    AddLockspace {
        spec: LockspaceSpec,
        reply: Sender<Result<()>>,
    },
    RemLockspace {
        name: Name,
        reply: Sender<Result<()>>,
    },
    Acquire {
        pid: i32,
        resources: Vec<ResourceSpec>,
        flags: AcquireFlags,
        reply: Sender<Result<()>>,
    },
    Release {
        pid: i32,
        resources: Option<Vec<(Name, Name)>>,
        reply: Sender<Result<()>>,
    },
    Inquire {
        pid: i32,
        reply: Sender<Result<Vec<TokenDump>>>,
    },
    Status {
        reply: Sender<Result<DaemonDump>>,
    },
    LogDump {
        reply: Sender<Result<Vec<String>>>,
    },
    Shutdown {
        reply: Sender<Result<()>>,
    },
}

// Fencing escalation: two SIGTERM sweeps, one SIGKILL sweep, then a final
// sweep that logs the stuck pids and stops escalating.
const KILL_SIGTERM_ROUNDS: u32 = 2;
const KILL_SIGKILL_ROUND: u32 = KILL_SIGTERM_ROUNDS + 1;
const KILL_ABANDON_ROUND: u32 = KILL_SIGKILL_ROUND + 1;

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool executing client commands so a slow acquire cannot
/// starve the supervisor loop.
pub(crate) struct WorkerPool {
    queue: Arc<(Mutex<PoolQueue>, Condvar)>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let queue = Arc::new((
            Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            Condvar::new(),
        ));
        let threads = (0..size.max(1))
            .map(|i| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("moorlock-worker-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let (lock, cond) = &*queue;
                            let mut q = lock.lock();
                            loop {
                                if let Some(job) = q.jobs.pop_front() {
                                    break job;
                                }
                                if q.stopping {
                                    return;
                                }
                                cond.wait(&mut q);
                            }
                        };
                        job();
                    })
                    .expect("spawn worker")
            })
            .collect();
        Self { queue, threads }
    }

    pub fn execute(&self, job: Job) {
        let (lock, cond) = &*self.queue;
        lock.lock().jobs.push_back(job);
        cond.notify_one();
    }

    pub fn stop(mut self) {
        {
            let (lock, cond) = &*self.queue;
            lock.lock().stopping = true;
            cond.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// The supervisor loop. Returns when shutdown completes.
pub(crate) fn run(core: &Arc<Core>, commands: &Receiver<Command>) {
    let pool = WorkerPool::new(core.config.worker_threads);
    let tick = core.config.tick;

    loop {
        match commands.recv_timeout(tick) {
            Ok(command) => dispatch(core, &pool, command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                core.shutdown.store(true, Ordering::SeqCst);
                std::thread::sleep(tick);
            }
        }

        sweep_spaces(core);
        core.spaces.reap();

        if core.shutdown.load(Ordering::SeqCst) && core.spaces.is_empty() {
            break;
        }
    }

    core.spaces.reap_all();
    pool.stop();
    info!("supervisor stopped");
}

fn dispatch(core: &Arc<Core>, pool: &WorkerPool, command: Command) {
    match command {
        // Daemon-level commands are answered inline.
        Command::Register { pid, reply } => {
            let result = core.clients.register(pid);
            if result.is_ok() {
                core.events.push(format!("client pid {pid} registered"));
            }
            let _ = reply.send(result);
        }
        Command::ClientGone { pid, reply } => {
            let _ = reply.send(core.client_gone_cmd(pid));
        }
        Command::Status { reply } => {
            let _ = reply.send(Ok(core.status_cmd()));
        }
        Command::LogDump { reply } => {
            let _ = reply.send(Ok(core.events.dump()));
        }
        Command::Shutdown { reply } => {
            info!("shutdown requested");
            core.shutdown.store(true, Ordering::SeqCst);
            let _ = reply.send(Ok(()));
        }

        // Lockspace and resource commands may block on disk; they run on
        // the pool.
        Command::AddLockspace { spec, reply } => {
            let core = Arc::clone(core);
            pool.execute(Box::new(move || {
                let _ = reply.send(core.add_lockspace(spec));
            }));
        }
        Command::RemLockspace { name, reply } => {
            let core = Arc::clone(core);
            pool.execute(Box::new(move || {
                let _ = reply.send(core.rem_lockspace(name));
            }));
        }
        Command::Acquire {
            pid,
            resources,
            flags,
            reply,
        } => {
            let core = Arc::clone(core);
            pool.execute(Box::new(move || {
                let _ = reply.send(core.acquire_cmd(pid, resources, flags));
            }));
        }
        Command::Release {
            pid,
            resources,
            reply,
        } => {
            let core = Arc::clone(core);
            pool.execute(Box::new(move || {
                let _ = reply.send(core.release_cmd(pid, resources));
            }));
        }
        Command::Inquire { pid, reply } => {
            let core = Arc::clone(core);
            pool.execute(Box::new(move || {
                let _ = reply.send(core.inquire_cmd(pid));
            }));
        }
    }
}

/// Per-tick fencing sweep.
fn sweep_spaces(core: &Arc<Core>) {
    let shutdown = core.shutdown.load(Ordering::SeqCst);
    let now = core.clock.monotime();

    for space in core.spaces.all() {
        let (killing, phase) = {
            let st = space.status.lock();
            (st.killing_pids, st.phase)
        };

        // A space still acquiring its host slot has no renewal clock yet;
        // it is fenced only after it starts running.
        if matches!(
            phase,
            crate::space::SpacePhase::Starting | crate::space::SpacePhase::Stopped
        ) {
            continue;
        }

        if killing > 0 {
            if core.clients.pids_using_space(&space.name).is_empty() {
                info!(space = %space.name, "no clients left; removing lockspace");
                space.request_stop();
                space.watchdog.unlink();
                core.spaces.begin_remove(&space);
            } else {
                kill_pids(core, &space);
            }
            continue;
        }

        let external_remove = space.status.lock().external_remove;
        let renewed = space.renewed_recently(now);
        if shutdown || external_remove || !renewed {
            if !renewed && !shutdown && !external_remove {
                error!(space = %space.name, "lockspace renewal lost; fencing clients");
                core.events
                    .push(format!("lockspace {} failed; fencing", space.name));
            }
            space.status.lock().killing_pids = 1;
            kill_pids(core, &space);
        }
    }
}

/// One escalation round against every client using the space.
fn kill_pids(core: &Arc<Core>, space: &Arc<Space>) {
    let round = space.status.lock().killing_pids;

    if round > KILL_ABANDON_ROUND {
        return;
    }
    if round == KILL_ABANDON_ROUND {
        for pid in core.clients.pids_using_space(&space.name) {
            error!(space = %space.name, pid, "fencing stuck; abandoning pid");
            core.events
                .push(format!("pid {pid} stuck in lockspace {}", space.name));
        }
        space.status.lock().killing_pids = round + 1;
        return;
    }

    let use_sigkill = round >= KILL_SIGKILL_ROUND;
    let mut signalled = 0usize;
    for slot in core.clients.all() {
        let pid = {
            let mut guard = slot.lock();
            if guard.pid_dead || !guard.uses_space(&space.name) {
                continue;
            }
            let limit = if use_sigkill {
                KILL_SIGTERM_ROUNDS + 1
            } else {
                round
            };
            if u32::from(guard.killing) >= limit {
                continue;
            }
            guard.killing += 1;
            guard.pid
        };
        if use_sigkill {
            core.killer.sigkill(pid);
        } else {
            core.killer.sigterm(pid);
        }
        signalled += 1;
    }
    if signalled > 0 {
        warn!(
            space = %space.name,
            round,
            signal = if use_sigkill { "SIGKILL" } else { "SIGTERM" },
            count = signalled,
            "fencing clients"
        );
    }

    space.status.lock().killing_pids = round + 1;
}
