use moorlock_types::{Generation, HostId, LeaseVersion, Name};
use thiserror::Error;

/// Primary error type for moorlock operations.
///
/// The original protocol used one negative-integer domain for all of these;
/// the structured variants keep that taxonomy while carrying the values a
/// caller needs to react (owner identity, lease versions, mismatch pairs).
#[derive(Error, Debug)]
pub enum MoorError {
    // === I/O ===
    /// The operation's deadline passed while the disk op was still in
    /// flight. The op may yet complete; its buffer stays with the worker.
    #[error("disk i/o timeout after {timeout_seconds}s")]
    AioTimeout { timeout_seconds: u32 },

    /// Immediate I/O failure; the buffer is reusable.
    #[error("disk i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Sector size not in the supported set.
    #[error("unsupported sector size {0}")]
    InvalidSectorSize(u32),

    // === Record verification ===
    #[error("leader magic {found:#010x} expected {expected:#010x}")]
    LeaderMagic { found: u32, expected: u32 },

    #[error("leader version {found:#010x} unsupported")]
    LeaderVersion { found: u32 },

    #[error("leader lockspace name {found} expected {expected}")]
    LeaderLockspace { found: Name, expected: Name },

    #[error("leader resource name {found} expected {expected}")]
    LeaderResource { found: Name, expected: Name },

    #[error("leader num_hosts {num_hosts} below host_id {host_id}")]
    LeaderNumHosts { num_hosts: u64, host_id: HostId },

    #[error("leader checksum {found:#010x} computed {computed:#010x}")]
    LeaderChecksum { found: u32, computed: u32 },

    #[error("dblock checksum {found:#010x} computed {computed:#010x}")]
    DblockChecksum { found: u32, computed: u32 },

    #[error("record too short: need {need} bytes, have {have}")]
    ShortRecord { need: usize, have: usize },

    // === Majority ===
    #[error("leader read failed on a majority of disks")]
    LeaderRead,

    #[error("leader write failed on a majority of disks")]
    LeaderWrite,

    #[error("no leader record consistent across a majority of disks")]
    LeaderDiff,

    #[error("dblock read failed on a majority of disks")]
    DblockRead,

    #[error("dblock write failed on a majority of disks")]
    DblockWrite,

    // === Paxos ballot aborts (consumed inside acquire) ===
    #[error("ballot aborted: higher mbal {theirs} seen (ours {ours})")]
    DblockMbal { ours: u64, theirs: u64 },

    #[error("ballot aborted: higher lver {theirs} seen (ours {ours})")]
    DblockLver { ours: LeaseVersion, theirs: LeaseVersion },

    // === Acquire outcomes ===
    #[error("lease version is {actual}, caller required {requested}")]
    AcquireLver { requested: LeaseVersion, actual: LeaseVersion },

    #[error("lease owner {owner_id}:{owner_generation} is alive")]
    AcquireIdLive { owner_id: HostId, owner_generation: Generation },

    #[error("lease already owned by {owner_id}:{owner_generation}")]
    AcquireOwned { owner_id: HostId, owner_generation: Generation },

    #[error("lease owned by {owner_id}:{owner_generation}; retry later")]
    AcquireOwnedRetry { owner_id: HostId, owner_generation: Generation },

    #[error("ballot committed {owner_id}:{owner_generation} as owner, not us")]
    AcquireOther { owner_id: HostId, owner_generation: Generation },

    #[error("cannot open lockspace disk to check owner liveness")]
    AcquireIdDisk,

    #[error("lockspace {0} not found for owner liveness check")]
    AcquireLockspace(Name),

    #[error("resource held in shared mode by {live} live host(s)")]
    AcquireShared { live: usize },

    // === Release outcomes ===
    #[error("release: disk lver {disk} differs from held {held}")]
    ReleaseLver { held: LeaseVersion, disk: LeaseVersion },

    #[error("release: not the owner (disk owner {owner_id}:{owner_generation})")]
    ReleaseOwner { owner_id: HostId, owner_generation: Generation },

    // === Delta lease ===
    #[error("host slot {host_id} busy: held by {owner_id}:{owner_generation}")]
    DeltaBusy { host_id: HostId, owner_id: HostId, owner_generation: Generation },

    /// A conflicting writer appeared during the acquire stability wait.
    #[error("host slot {host_id} contended during acquire")]
    DeltaBadLeader { host_id: HostId },

    // === Runtime ===
    #[error("lockspace {0} not found")]
    SpaceNotFound(Name),

    #[error("lockspace {0} already exists")]
    SpaceExists(Name),

    #[error("lockspace {0} is failing; operations rejected")]
    SpaceFailing(Name),

    #[error("client pid {0} not registered")]
    ClientNotFound(i32),

    #[error("client pid {pid} does not hold {space_name}:{resource_name}")]
    TokenNotFound { pid: i32, space_name: Name, resource_name: Name },

    #[error("request exceeds {max} resources")]
    TooManyResources { max: usize },

    #[error("client has no free token slots")]
    NoFreeSlots,

    #[error("another command is active on this client")]
    Busy,

    #[error("resource {space_name}:{resource_name} already held by pid {pid}")]
    ResourceBusy { pid: i32, space_name: Name, resource_name: Name },

    #[error("daemon is shutting down")]
    Shutdown,
}

impl MoorError {
    /// True for the timeout outcome, which callers must treat differently
    /// from failure (the buffer is gone until the op drains).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, MoorError::AioTimeout { .. })
    }

    /// True for the two ballot abort codes that acquire retries internally.
    #[must_use]
    pub fn is_ballot_abort(&self) -> bool {
        matches!(self, MoorError::DblockMbal { .. } | MoorError::DblockLver { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, MoorError>;
