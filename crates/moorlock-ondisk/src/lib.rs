//! On-disk record codecs.
//!
//! Every record is serialized little-endian through an explicit codec —
//! never by reinterpreting an in-memory struct — and carries a CRC32C
//! computed over the serialized bytes excluding the checksum field itself,
//! with initial value `!1u32`. Verification recomputes on the raw bytes
//! before deserialization.
//!
//! Lease-area layout (offsets in sectors):
//!
//! ```text
//! resource area:  [0] leader  [1] request  [2 + host_id - 1] dblock per host
//! lockspace area: [host_id - 1] delta-lease leader, one per slot
//! ```
//!
//! A mode block is overlaid at byte [`MBLOCK_OFFSET`] of each dblock
//! sector, so shared-mode state travels with the host's ballot sector.

pub mod dblock;
pub mod leader;
pub mod request;
mod wire;

pub use dblock::{ModeBlock, PaxosDblock, DBLOCK_SIZE, MBLOCK_OFFSET, MBLOCK_SIZE};
pub use leader::{LeaderExpect, LeaderRecord, LEADER_SIZE};
pub use request::{RequestRecord, REQUEST_SIZE};

use moorlock_types::HostId;

/// Magic of a paxos-lease leader record.
pub const PAXOS_DISK_MAGIC: u32 = 0x0615_2010;

/// Magic written when a paxos lease area is deliberately cleared.
pub const PAXOS_DISK_CLEAR: u32 = 0x1128_2016;

/// Magic of a delta-lease leader record.
pub const DELTA_DISK_MAGIC: u32 = 0x1221_2010;

/// Magic of a request record.
pub const REQ_DISK_MAGIC: u32 = 0x0829_2011;

/// Version words; the high half is the compatibility-checked major.
pub const PAXOS_DISK_VERSION: u32 = 0x0003_0001;
pub const DELTA_DISK_VERSION: u32 = 0x0001_0002;
pub const REQ_DISK_VERSION: u32 = 0x0001_0001;

/// Mask selecting the major half of a version word.
pub const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

/// CRC32C with the initial value every record checksum uses.
#[must_use]
pub fn record_crc(data: &[u8]) -> u32 {
    crc32c::crc32c_append(!1u32, data)
}

/// Sector index of a host's paxos dblock within a resource area.
#[must_use]
pub fn dblock_sector(host_id: HostId) -> u64 {
    // leader + request precede the dblock table
    1 + host_id
}

/// Sector index of a host's delta-lease slot within a lockspace area.
#[must_use]
pub fn delta_slot_sector(host_id: HostId) -> u64 {
    host_id - 1
}

/// Sector count that one aligned lease read must cover: leader, request,
/// and the dblock table, rounded up to a power of two.
#[must_use]
pub fn lease_sector_count(num_hosts: u64) -> u64 {
    (num_hosts + 2).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_layout() {
        assert_eq!(dblock_sector(1), 2);
        assert_eq!(dblock_sector(8), 9);
        assert_eq!(delta_slot_sector(1), 0);
        assert_eq!(lease_sector_count(2), 4);
        assert_eq!(lease_sector_count(8), 16);
        assert_eq!(lease_sector_count(2000), 2048);
    }

    #[test]
    fn crc_seed_differs_from_plain_crc32c() {
        assert_ne!(record_crc(b"abc"), crc32c::crc32c(b"abc"));
    }
}
