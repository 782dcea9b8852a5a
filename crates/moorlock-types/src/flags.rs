//! Flag sets carried in on-disk records, tokens, and acquire requests.

bitflags::bitflags! {
    /// Leader record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LeaderFlags: u32 {
        /// Hint that the owner expects to hold the lease briefly (set while
        /// committing ourselves as owner of a shared acquire). Other hosts
        /// may use it to retry sooner on transient contention.
        const SHORT_HOLD = 0x0000_0001;
    }
}

bitflags::bitflags! {
    /// Per-host paxos dblock flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DblockFlags: u32 {
        /// The host voluntarily released the lease. Lets a new acquirer skip
        /// the owner-death wait when the leader writer was not the owner.
        const RELEASED = 0x0000_0001;
    }
}

bitflags::bitflags! {
    /// Mode block flags (overlaid within each dblock sector).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MblockFlags: u32 {
        /// The host holds this resource in shared mode.
        const SHARED = 0x0000_0001;
    }
}

bitflags::bitflags! {
    /// Options for a paxos lease acquire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AcquireFlags: u32 {
        /// Take the lease regardless of the current owner. Callers must
        /// guarantee out-of-band that the owner is gone.
        const FORCE = 0x0000_0001;
        /// Acquire in shared mode.
        const SHARED = 0x0000_0002;
        /// Fail with `AcquireOwnedRetry` instead of waiting for the current
        /// owner's delta lease to expire.
        const OWNER_NOWAIT = 0x0000_0004;
    }
}

bitflags::bitflags! {
    /// Runtime state carried on a token across engine calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TokenFlags: u32 {
        /// A ballot phase 2 partially completed before failing; another host
        /// may still commit us as owner. Release must clear our ownership
        /// if it finds it on disk.
        const RETRACT_PAXOS = 0x0000_0001;
        /// Dblock writes must preserve our SHARED mode block in the same
        /// sector (set while converting a shared hold to exclusive).
        const DBLOCK_KEEPS_SHARED = 0x0000_0002;
        /// The client died while this token's acquire was in flight; the
        /// token is released as soon as the acquire finishes.
        const RELEASE_PENDING = 0x0000_0004;
    }
}
