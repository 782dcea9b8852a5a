//! Shared vocabulary for the moorlock lease manager.
//!
//! Everything here is plain data: names, identifiers, timeout derivation,
//! host-status records, and the admin-facing request/dump structures. The
//! on-disk record types live in `moorlock-ondisk`; runtime machinery lives
//! in `moorlock-runtime`.

pub mod admin;
pub mod clock;
pub mod flags;
pub mod timeouts;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use admin::{ClientDump, DaemonDump, DiskSpec, LockspaceSpec, ResourceSpec, SpaceDump, TokenDump};
pub use clock::{Clock, SystemClock, TestClock};
pub use flags::{AcquireFlags, DblockFlags, LeaderFlags, MblockFlags, TokenFlags};
pub use timeouts::Timeouts;

/// Host identifier within a lockspace, 1-based. Zero is never a valid owner.
pub type HostId = u64;

/// Monotonic counter incremented each time a host re-acquires its slot.
pub type Generation = u64;

/// Paxos round number of a resource lease.
pub type LeaseVersion = u64;

/// On-disk length of lockspace and resource names.
pub const NAME_LEN: usize = 64;

/// Maximum disks backing one resource lease (majority quorum across them).
pub const MAX_DISKS: usize = 4;

/// Maximum tokens a single registered client may hold.
pub const MAX_RESOURCES: usize = 8;

/// Default number of host slots in a new lease area.
pub const DEFAULT_MAX_HOSTS: u64 = 2000;

/// `timestamp` value meaning "this lease is not owned".
pub const LEASE_FREE: u64 = 0;

/// A fixed-width, NUL-padded name as stored on disk.
///
/// Lockspace and resource names are byte strings of at most [`NAME_LEN`]
/// bytes. Comparison is over the full padded array, matching the on-disk
/// comparison other hosts perform.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name([u8; NAME_LEN]);

impl Name {
    /// Empty (all-NUL) name.
    pub const EMPTY: Name = Name([0u8; NAME_LEN]);

    /// Build a name from raw bytes, rejecting over-long input.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > NAME_LEN {
            return None;
        }
        let mut buf = [0u8; NAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// Wrap an already padded array.
    #[must_use]
    pub const fn from_raw(raw: [u8; NAME_LEN]) -> Self {
        Self(raw)
    }

    /// The padded on-disk form.
    #[must_use]
    pub const fn as_raw(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    /// True when every byte is NUL.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Bytes up to the first NUL.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &self.0[..end]
    }
}

impl Default for Name {
    fn default() -> Self {
        Name::EMPTY
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl std::str::FromStr for Name {
    type Err = NameTooLong;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::new(s.as_bytes()).ok_or(NameTooLong(s.len()))
    }
}

/// Error for names longer than [`NAME_LEN`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTooLong(pub usize);

impl fmt::Display for NameTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name length {} exceeds {NAME_LEN} bytes", self.0)
    }
}

impl std::error::Error for NameTooLong {}

impl Serialize for Name {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Name::new(s.as_bytes()).ok_or_else(|| serde::de::Error::custom(NameTooLong(s.len())))
    }
}

/// In-memory liveness view of one `(lockspace, host_id)` slot.
///
/// `last_live` is the monotonic time at which the slot's timestamp was last
/// seen to change; it is the authoritative input to the owner-death wait in
/// the paxos acquire path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatus {
    /// Monotonic time of the most recent read of this slot.
    pub last_check: u64,
    /// Monotonic time at which `timestamp` last changed.
    pub last_live: u64,
    /// Timestamp read from the slot at `last_check`.
    pub timestamp: u64,
    /// Owner recorded in the slot.
    pub owner_id: HostId,
    /// Owner generation recorded in the slot.
    pub owner_generation: Generation,
    /// The slot owner's advertised I/O timeout in seconds.
    pub io_timeout: u32,
}

impl HostStatus {
    /// True when the renewal scan saw the timestamp move on its most
    /// recent pass.
    #[must_use]
    pub fn live_at_last_check(&self) -> bool {
        self.last_live != 0 && self.last_check == self.last_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_and_pads() {
        let n: Name = "vg-alpha".parse().unwrap();
        assert_eq!(n.as_bytes(), b"vg-alpha");
        assert_eq!(n.as_raw()[8..], [0u8; NAME_LEN - 8]);
        assert_eq!(n.to_string(), "vg-alpha");
    }

    #[test]
    fn name_rejects_overlong() {
        let long = "x".repeat(NAME_LEN + 1);
        assert!(long.parse::<Name>().is_err());
        let exact = "y".repeat(NAME_LEN);
        assert!(exact.parse::<Name>().is_ok());
    }

    #[test]
    fn empty_name_detection() {
        assert!(Name::EMPTY.is_empty());
        let n: Name = "a".parse().unwrap();
        assert!(!n.is_empty());
    }
}
