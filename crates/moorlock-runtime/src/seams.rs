//! Pluggable edges of the runtime: how disks are opened, how the watchdog
//! is fed, and how local processes are signalled. Production wires the
//! real implementations; tests substitute in-memory ones.

use std::collections::HashMap;
use std::sync::Arc;

use moorlock_error::Result;
use moorlock_io::traits::DiskHandle;
use moorlock_io::{FileDisk, MemDisk, MemRegion};
use moorlock_types::{DiskSpec, HostId, Name};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Resolves a [`DiskSpec`] into an open disk handle.
pub trait DiskOpener: Send + Sync {
    fn open(&self, spec: &DiskSpec) -> Result<DiskHandle>;
}

/// Opens real files and block devices.
#[derive(Default)]
pub struct FileDiskOpener;

impl DiskOpener for FileDiskOpener {
    fn open(&self, spec: &DiskSpec) -> Result<DiskHandle> {
        Ok(Arc::new(FileDisk::open(spec)?))
    }
}

/// Maps paths to in-memory regions for tests.
#[derive(Default, Clone)]
pub struct MemDiskOpener {
    regions: Arc<Mutex<HashMap<std::path::PathBuf, MemRegion>>>,
}

impl MemDiskOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region reachable under `path`.
    pub fn insert(&self, path: impl Into<std::path::PathBuf>, region: MemRegion) {
        self.regions.lock().insert(path.into(), region);
    }
}

impl DiskOpener for MemDiskOpener {
    fn open(&self, spec: &DiskSpec) -> Result<DiskHandle> {
        let regions = self.regions.lock();
        let region = regions.get(&spec.path).ok_or_else(|| {
            moorlock_error::MoorError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no mem region at {}", spec.path.display()),
            ))
        })?;
        Ok(Arc::new(MemDisk::with_label(
            region,
            spec.path.display().to_string(),
        )))
    }
}

/// One lockspace's registration with the external watchdog daemon.
///
/// The renewal loop calls `renewed` after every successful delta-lease
/// renewal and nothing else; a stalled loop therefore starves the watchdog
/// and the host is reset within the dead interval.
pub trait WatchdogLink: Send + Sync {
    fn renewed(&self, timestamp: u64);
    fn unlink(&self);
}

/// Creates per-lockspace watchdog registrations.
pub trait WatchdogConnector: Send + Sync {
    fn connect(&self, space_name: &Name, host_id: HostId) -> Result<Box<dyn WatchdogLink>>;
}

/// Watchdog stand-in for hosts without fencing hardware configured; logs
/// the renewals so operators can see the loop is alive.
#[derive(Default)]
pub struct NullWatchdog;

struct NullWatchdogLink {
    space_name: Name,
}

impl WatchdogLink for NullWatchdogLink {
    fn renewed(&self, timestamp: u64) {
        debug!(space = %self.space_name, timestamp, "watchdog pet (null)");
    }

    fn unlink(&self) {
        debug!(space = %self.space_name, "watchdog unlink (null)");
    }
}

impl WatchdogConnector for NullWatchdog {
    fn connect(&self, space_name: &Name, _host_id: HostId) -> Result<Box<dyn WatchdogLink>> {
        Ok(Box::new(NullWatchdogLink {
            space_name: *space_name,
        }))
    }
}

/// Recording watchdog for tests.
#[derive(Default, Clone)]
pub struct SpyWatchdog {
    pets: Arc<Mutex<Vec<(Name, u64)>>>,
    unlinked: Arc<Mutex<Vec<Name>>>,
}

impl SpyWatchdog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pet_count(&self, space_name: &Name) -> usize {
        self.pets.lock().iter().filter(|(n, _)| n == space_name).count()
    }

    #[must_use]
    pub fn unlinked(&self, space_name: &Name) -> bool {
        self.unlinked.lock().contains(space_name)
    }
}

struct SpyLink {
    space_name: Name,
    spy: SpyWatchdog,
}

impl WatchdogLink for SpyLink {
    fn renewed(&self, timestamp: u64) {
        self.spy.pets.lock().push((self.space_name, timestamp));
    }

    fn unlink(&self) {
        self.spy.unlinked.lock().push(self.space_name);
    }
}

impl WatchdogConnector for SpyWatchdog {
    fn connect(&self, space_name: &Name, _host_id: HostId) -> Result<Box<dyn WatchdogLink>> {
        Ok(Box::new(SpyLink {
            space_name: *space_name,
            spy: self.clone(),
        }))
    }
}

/// Delivers fencing signals to local client processes.
pub trait ProcessKiller: Send + Sync {
    fn sigterm(&self, pid: i32);
    fn sigkill(&self, pid: i32);
}

/// Real signal delivery.
#[derive(Default)]
pub struct SignalKiller;

impl ProcessKiller for SignalKiller {
    fn sigterm(&self, pid: i32) {
        if let Err(e) = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        ) {
            warn!(pid, error = %e, "SIGTERM failed");
        }
    }

    fn sigkill(&self, pid: i32) {
        if let Err(e) = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        ) {
            warn!(pid, error = %e, "SIGKILL failed");
        }
    }
}

/// Recording killer for tests.
#[derive(Default, Clone)]
pub struct SpyKiller {
    signals: Arc<Mutex<Vec<(i32, &'static str)>>>,
}

impl SpyKiller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<(i32, &'static str)> {
        self.signals.lock().clone()
    }
}

impl ProcessKiller for SpyKiller {
    fn sigterm(&self, pid: i32) {
        self.signals.lock().push((pid, "TERM"));
    }

    fn sigkill(&self, pid: i32) {
        self.signals.lock().push((pid, "KILL"));
    }
}
