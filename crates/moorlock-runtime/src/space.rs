//! Lockspace lifecycle and the per-lockspace renewal thread.
//!
//! Each joined lockspace runs one thread that acquires the host slot, then
//! renews it on a fixed period, feeding the watchdog only after each
//! successful renewal and rescanning every slot to keep the host-status
//! table current. Renewal failures are never retried into success
//! locally: once the failure window elapses the space turns `Failing` and
//! the supervisor fences the local clients before the hardware watchdog
//! would fire.

use std::sync::Arc;
use std::time::Duration;

use moorlock_delta::{DeltaEngine, DeltaSlot, HostStatusTable};
use moorlock_error::{MoorError, Result};
use moorlock_io::traits::DiskHandle;
use moorlock_ondisk::LeaderRecord;
use moorlock_types::{Clock, DiskSpec, Generation, HostId, Name, SpaceDump, Timeouts};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::seams::WatchdogLink;

/// Lifecycle phase of a lockspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacePhase {
    /// Renewal thread is acquiring the host slot.
    Starting,
    Running,
    /// Renewal has failed for longer than the failure window.
    Failing,
    Stopped,
}

impl SpacePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SpacePhase::Starting => "starting",
            SpacePhase::Running => "running",
            SpacePhase::Failing => "failing",
            SpacePhase::Stopped => "stopped",
        }
    }
}

pub struct SpaceStatus {
    pub phase: SpacePhase,
    pub generation: Generation,
    pub last_renewal: u64,
    /// Fencing round counter; nonzero once the supervisor starts killing.
    pub killing_pids: u32,
    pub external_remove: bool,
    pub thread_stop: bool,
    /// Error that ended the Starting phase, if any.
    pub start_error: Option<MoorError>,
}

/// One joined lockspace.
pub struct Space {
    pub space_id: u32,
    pub name: Name,
    pub host_id: HostId,
    pub host_name: Name,
    pub spec: DiskSpec,
    pub disk: DiskHandle,
    pub timeouts: Timeouts,
    pub host_status: HostStatusTable,
    pub watchdog: Box<dyn WatchdogLink>,
    pub status: Mutex<SpaceStatus>,
    pub cond: Condvar,
    /// Slot count used by the status scan; from the slot leader.
    pub max_hosts: Mutex<u64>,
}

impl Space {
    pub fn new(
        space_id: u32,
        name: Name,
        host_id: HostId,
        host_name: Name,
        spec: DiskSpec,
        disk: DiskHandle,
        timeouts: Timeouts,
        watchdog: Box<dyn WatchdogLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            space_id,
            name,
            host_id,
            host_name,
            spec,
            disk,
            timeouts,
            host_status: HostStatusTable::new(),
            watchdog,
            status: Mutex::new(SpaceStatus {
                phase: SpacePhase::Starting,
                generation: 0,
                last_renewal: 0,
                killing_pids: 0,
                external_remove: false,
                thread_stop: false,
                start_error: None,
            }),
            cond: Condvar::new(),
            max_hosts: Mutex::new(moorlock_types::DEFAULT_MAX_HOSTS),
        })
    }

    /// Snapshot used by acquire paths: `(generation, healthy)`.
    #[must_use]
    pub fn acquire_snapshot(&self) -> (Generation, bool) {
        let st = self.status.lock();
        let healthy = st.phase == SpacePhase::Running && st.killing_pids == 0;
        (st.generation, healthy)
    }

    /// True while renewals are landing inside the failure window.
    #[must_use]
    pub fn renewed_recently(&self, now: u64) -> bool {
        let st = self.status.lock();
        match st.phase {
            SpacePhase::Running => {
                now.saturating_sub(st.last_renewal) <= u64::from(self.timeouts.renewal_fail_seconds())
            }
            _ => false,
        }
    }

    /// Ask the renewal thread to stop and wake it.
    pub fn request_stop(&self) {
        let mut st = self.status.lock();
        st.thread_stop = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn dump(&self) -> SpaceDump {
        let st = self.status.lock();
        SpaceDump {
            space_id: self.space_id,
            name: self.name,
            host_id: self.host_id,
            host_generation: st.generation,
            disk: self.spec.clone(),
            state: st.phase.as_str().to_string(),
            killing_pids: st.killing_pids,
            last_renewal: st.last_renewal,
        }
    }
}

/// Run the acquire-then-renew loop for `space`. Returns when stopped.
pub fn renewal_thread(space: &Arc<Space>, delta: &DeltaEngine, clock: &Arc<dyn Clock>) {
    fn slot(space: &Space) -> DeltaSlot<'_> {
        DeltaSlot {
            space_name: &space.name,
            host_id: space.host_id,
            host_name: &space.host_name,
            timeouts: space.timeouts,
        }
    }

    // Starting: acquire the host slot.
    let mut leader: LeaderRecord = match delta.acquire(&space.disk, &slot(space)) {
        Ok(leader) => {
            let mut st = space.status.lock();
            st.phase = SpacePhase::Running;
            st.generation = leader.owner_generation;
            st.last_renewal = clock.monotime();
            space.cond.notify_all();
            drop(st);
            *space.max_hosts.lock() = leader.max_hosts;
            space.watchdog.renewed(leader.timestamp);
            info!(
                space = %space.name, host_id = space.host_id,
                generation = leader.owner_generation, "lockspace running"
            );
            leader
        }
        Err(e) => {
            error!(space = %space.name, error = %e, "host slot acquire failed");
            let mut st = space.status.lock();
            st.phase = SpacePhase::Stopped;
            st.start_error = Some(e);
            space.cond.notify_all();
            return;
        }
    };

    let renewal_interval = Duration::from_secs(u64::from(space.timeouts.renewal_seconds()));
    let warn_after = u64::from(space.timeouts.renewal_warn_seconds());
    let fail_after = u64::from(space.timeouts.renewal_fail_seconds());

    loop {
        {
            let mut st = space.status.lock();
            if !st.thread_stop {
                space.cond.wait_for(&mut st, renewal_interval);
            }
            if st.thread_stop {
                break;
            }
        }

        let max_hosts = *space.max_hosts.lock();
        delta.scan_all(
            &space.disk,
            &space.name,
            max_hosts,
            space.timeouts.io_timeout_seconds(),
            &space.host_status,
        );

        match delta.renew(&space.disk, &slot(space), &leader) {
            Ok(renewed) => {
                leader = renewed;
                let mut st = space.status.lock();
                st.last_renewal = clock.monotime();
                drop(st);
                // Strict ordering: the watchdog learns of a renewal only
                // after it has landed on disk.
                space.watchdog.renewed(leader.timestamp);
            }
            Err(e) => {
                let now = clock.monotime();
                let mut st = space.status.lock();
                let lag = now.saturating_sub(st.last_renewal);
                if lag > fail_after && st.phase == SpacePhase::Running {
                    st.phase = SpacePhase::Failing;
                    error!(
                        space = %space.name, lag,
                        error = %e, "renewal failed past the failure window"
                    );
                } else if lag > warn_after {
                    warn!(space = %space.name, lag, error = %e, "renewal lagging");
                } else {
                    warn!(space = %space.name, error = %e, "renewal failed");
                }
            }
        }
    }

    // Clean exit: give the slot back when it is still ours.
    let phase = space.status.lock().phase;
    if phase == SpacePhase::Running {
        if let Err(e) = delta.release(&space.disk, &slot(space), &leader) {
            warn!(space = %space.name, error = %e, "host slot release failed");
        }
    }
    space.status.lock().phase = SpacePhase::Stopped;
    info!(space = %space.name, "renewal thread stopped");
}

/// The table of joined lockspaces plus spaces pending teardown.
#[derive(Default)]
pub struct SpaceSet {
    spaces: Mutex<Vec<Arc<Space>>>,
    removing: Mutex<Vec<(Arc<Space>, std::thread::JoinHandle<()>)>>,
    threads: Mutex<Vec<(u32, std::thread::JoinHandle<()>)>>,
}

impl SpaceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &Name) -> Option<Arc<Space>> {
        self.spaces.lock().iter().find(|s| s.name == *name).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Space>> {
        self.spaces.lock().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spaces.lock().is_empty()
    }

    /// Claim the name slot for a new space. No thread is running yet, so
    /// a duplicate is rejected without any cleanup to undo.
    pub fn reserve(&self, space: &Arc<Space>) -> Result<()> {
        let mut spaces = self.spaces.lock();
        if spaces.iter().any(|s| s.name == space.name) {
            return Err(MoorError::SpaceExists(space.name));
        }
        spaces.push(Arc::clone(space));
        Ok(())
    }

    /// Attach the renewal thread of a reserved space.
    pub fn register_thread(&self, space_id: u32, thread: std::thread::JoinHandle<()>) {
        self.threads.lock().push((space_id, thread));
    }

    /// Drop a space that never got past Starting.
    pub fn abort_insert(&self, space: &Space) {
        self.spaces.lock().retain(|s| s.space_id != space.space_id);
        if let Some(pos) = {
            let threads = self.threads.lock();
            threads.iter().position(|(id, _)| *id == space.space_id)
        } {
            let (_, handle) = self.threads.lock().remove(pos);
            let _ = handle.join();
        }
    }

    /// Move a space whose clients are all gone into the teardown list.
    pub fn begin_remove(&self, space: &Arc<Space>) {
        let mut spaces = self.spaces.lock();
        spaces.retain(|s| s.space_id != space.space_id);
        drop(spaces);

        let handle = {
            let mut threads = self.threads.lock();
            threads
                .iter()
                .position(|(id, _)| *id == space.space_id)
                .map(|pos| threads.remove(pos).1)
        };
        if let Some(handle) = handle {
            self.removing.lock().push((Arc::clone(space), handle));
        }
    }

    /// Join renewal threads of spaces being torn down.
    pub fn reap(&self) {
        let mut done = Vec::new();
        {
            let mut removing = self.removing.lock();
            let mut keep = Vec::new();
            for (space, handle) in removing.drain(..) {
                if handle.is_finished() {
                    done.push((space, handle));
                } else {
                    keep.push((space, handle));
                }
            }
            *removing = keep;
        }
        for (space, handle) in done {
            let _ = handle.join();
            info!(space = %space.name, "lockspace removed");
        }
    }

    /// Block until every teardown finished (shutdown path).
    pub fn reap_all(&self) {
        let drained: Vec<_> = self.removing.lock().drain(..).collect();
        for (space, handle) in drained {
            let _ = handle.join();
            info!(space = %space.name, "lockspace removed");
        }
    }
}
