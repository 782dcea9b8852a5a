//! Request descriptors and structured state dumps.
//!
//! These are the data halves of the collaborator contract: a transport
//! layer (Unix socket, CLI, bindings) builds the request types and renders
//! the dump types; the core never sees wire framing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Generation, HostId, LeaseVersion, Name};

/// Location of a lease area on shared storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskSpec {
    pub path: PathBuf,
    /// Byte offset of the lease area on the device.
    pub offset: u64,
}

impl DiskSpec {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self { path: path.into(), offset }
    }
}

/// Request to join a lockspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockspaceSpec {
    pub name: Name,
    pub host_id: HostId,
    pub disk: DiskSpec,
    /// Zero means the daemon default.
    pub io_timeout_seconds: u32,
}

/// A resource lease to acquire or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub space_name: Name,
    pub name: Name,
    pub disks: Vec<DiskSpec>,
    /// Require this lease version on acquire (stale handle detection).
    pub acquire_lver: Option<LeaseVersion>,
    /// Shrink or grow the advertised host count on successful acquire.
    pub new_num_hosts: Option<u64>,
}

/// Daemon-level state dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDump {
    pub io_timeout_seconds: u32,
    pub renewal_seconds: u32,
    pub renewal_fail_seconds: u32,
    pub host_dead_seconds: u32,
    pub spaces: Vec<SpaceDump>,
    pub clients: Vec<ClientDump>,
}

/// Per-lockspace state dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceDump {
    pub space_id: u32,
    pub name: Name,
    pub host_id: HostId,
    pub host_generation: Generation,
    pub disk: DiskSpec,
    pub state: String,
    pub killing_pids: u32,
    pub last_renewal: u64,
}

/// Per-client state dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDump {
    pub pid: i32,
    pub cmd_active: bool,
    pub pid_dead: bool,
    pub tokens: Vec<TokenDump>,
}

/// Per-held-token state dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDump {
    pub token_id: u64,
    pub space_name: Name,
    pub resource_name: Name,
    pub lver: LeaseVersion,
    pub owner_id: HostId,
    pub owner_generation: Generation,
    pub timestamp: u64,
    pub shared: bool,
}
