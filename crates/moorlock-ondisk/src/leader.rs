//! Leader record: the committed state of a lease.
//!
//! Paxos leases and delta leases share this record; a delta lease stores
//! the host name in `resource_name` and only ever has the slot's own host
//! as owner.
//!
//! Layout (little-endian):
//! ```text
//! Offset  Size  Field
//!   0       4   magic
//!   4       4   version
//!   8       4   flags
//!  12       4   sector_size
//!  16       8   num_hosts
//!  24       8   max_hosts
//!  32       8   owner_id
//!  40       8   owner_generation
//!  48       8   lver
//!  56       8   timestamp (LEASE_FREE when unowned)
//!  64      64   space_name
//! 128      64   resource_name
//! 192       8   write_id
//! 200       8   write_generation
//! 208       8   write_timestamp
//! 216       4   io_timeout (writer's, seconds)
//! 220       4   checksum (CRC32C over bytes 0..220)
//! ```

use moorlock_error::{MoorError, Result};
use moorlock_types::{Generation, HostId, LeaseVersion, Name, NAME_LEN};

use crate::wire::{read_u32_at, read_u64_at, write_u32_at, write_u64_at};
use crate::{record_crc, PAXOS_DISK_CLEAR, VERSION_MAJOR_MASK};

/// Serialized size of a leader record.
pub const LEADER_SIZE: usize = 224;

/// Bytes covered by the checksum.
const CHECKSUM_LEN: usize = 220;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_SECTOR_SIZE: usize = 12;
const OFF_NUM_HOSTS: usize = 16;
const OFF_MAX_HOSTS: usize = 24;
const OFF_OWNER_ID: usize = 32;
const OFF_OWNER_GENERATION: usize = 40;
const OFF_LVER: usize = 48;
const OFF_TIMESTAMP: usize = 56;
const OFF_SPACE_NAME: usize = 64;
const OFF_RESOURCE_NAME: usize = 128;
const OFF_WRITE_ID: usize = 192;
const OFF_WRITE_GENERATION: usize = 200;
const OFF_WRITE_TIMESTAMP: usize = 208;
const OFF_IO_TIMEOUT: usize = 216;
const OFF_CHECKSUM: usize = 220;

/// Canonical lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaderRecord {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub sector_size: u32,
    pub num_hosts: u64,
    pub max_hosts: u64,
    pub owner_id: HostId,
    pub owner_generation: Generation,
    pub lver: LeaseVersion,
    pub timestamp: u64,
    pub space_name: Name,
    pub resource_name: Name,
    pub write_id: HostId,
    pub write_generation: Generation,
    pub write_timestamp: u64,
    pub io_timeout: u32,
    pub checksum: u32,
}

impl LeaderRecord {
    /// Serialize, computing and installing the checksum into both the
    /// buffer and `self`.
    pub fn encode(&mut self) -> [u8; LEADER_SIZE] {
        let mut buf = [0u8; LEADER_SIZE];
        write_u32_at(&mut buf, OFF_MAGIC, self.magic);
        write_u32_at(&mut buf, OFF_VERSION, self.version);
        write_u32_at(&mut buf, OFF_FLAGS, self.flags);
        write_u32_at(&mut buf, OFF_SECTOR_SIZE, self.sector_size);
        write_u64_at(&mut buf, OFF_NUM_HOSTS, self.num_hosts);
        write_u64_at(&mut buf, OFF_MAX_HOSTS, self.max_hosts);
        write_u64_at(&mut buf, OFF_OWNER_ID, self.owner_id);
        write_u64_at(&mut buf, OFF_OWNER_GENERATION, self.owner_generation);
        write_u64_at(&mut buf, OFF_LVER, self.lver);
        write_u64_at(&mut buf, OFF_TIMESTAMP, self.timestamp);
        buf[OFF_SPACE_NAME..OFF_SPACE_NAME + NAME_LEN].copy_from_slice(self.space_name.as_raw());
        buf[OFF_RESOURCE_NAME..OFF_RESOURCE_NAME + NAME_LEN]
            .copy_from_slice(self.resource_name.as_raw());
        write_u64_at(&mut buf, OFF_WRITE_ID, self.write_id);
        write_u64_at(&mut buf, OFF_WRITE_GENERATION, self.write_generation);
        write_u64_at(&mut buf, OFF_WRITE_TIMESTAMP, self.write_timestamp);
        write_u32_at(&mut buf, OFF_IO_TIMEOUT, self.io_timeout);

        self.checksum = record_crc(&buf[..CHECKSUM_LEN]);
        write_u32_at(&mut buf, OFF_CHECKSUM, self.checksum);
        buf
    }

    /// Deserialize. Returns the record and the checksum recomputed from
    /// the raw bytes (to be compared against `record.checksum` during
    /// verification).
    pub fn decode(raw: &[u8]) -> Result<(Self, u32)> {
        if raw.len() < LEADER_SIZE {
            return Err(MoorError::ShortRecord {
                need: LEADER_SIZE,
                have: raw.len(),
            });
        }
        let computed = record_crc(&raw[..CHECKSUM_LEN]);
        let mut space_name = [0u8; NAME_LEN];
        space_name.copy_from_slice(&raw[OFF_SPACE_NAME..OFF_SPACE_NAME + NAME_LEN]);
        let mut resource_name = [0u8; NAME_LEN];
        resource_name.copy_from_slice(&raw[OFF_RESOURCE_NAME..OFF_RESOURCE_NAME + NAME_LEN]);

        let record = Self {
            magic: read_u32_at(raw, OFF_MAGIC),
            version: read_u32_at(raw, OFF_VERSION),
            flags: read_u32_at(raw, OFF_FLAGS),
            sector_size: read_u32_at(raw, OFF_SECTOR_SIZE),
            num_hosts: read_u64_at(raw, OFF_NUM_HOSTS),
            max_hosts: read_u64_at(raw, OFF_MAX_HOSTS),
            owner_id: read_u64_at(raw, OFF_OWNER_ID),
            owner_generation: read_u64_at(raw, OFF_OWNER_GENERATION),
            lver: read_u64_at(raw, OFF_LVER),
            timestamp: read_u64_at(raw, OFF_TIMESTAMP),
            space_name: Name::from_raw(space_name),
            resource_name: Name::from_raw(resource_name),
            write_id: read_u64_at(raw, OFF_WRITE_ID),
            write_generation: read_u64_at(raw, OFF_WRITE_GENERATION),
            write_timestamp: read_u64_at(raw, OFF_WRITE_TIMESTAMP),
            io_timeout: read_u32_at(raw, OFF_IO_TIMEOUT),
            checksum: read_u32_at(raw, OFF_CHECKSUM),
        };
        Ok((record, computed))
    }

    /// Verify a decoded record against what the reader expected.
    pub fn verify(&self, computed_checksum: u32, expect: &LeaderExpect<'_>) -> Result<()> {
        if self.magic == PAXOS_DISK_CLEAR {
            return Err(MoorError::LeaderMagic {
                found: self.magic,
                expected: expect.magic,
            });
        }
        if self.magic != expect.magic {
            return Err(MoorError::LeaderMagic {
                found: self.magic,
                expected: expect.magic,
            });
        }
        if self.version & VERSION_MAJOR_MASK != expect.version & VERSION_MAJOR_MASK {
            return Err(MoorError::LeaderVersion { found: self.version });
        }
        if let Some(space) = expect.space_name {
            if self.space_name != *space {
                return Err(MoorError::LeaderLockspace {
                    found: self.space_name,
                    expected: *space,
                });
            }
        }
        if let Some(resource) = expect.resource_name {
            if self.resource_name != *resource {
                return Err(MoorError::LeaderResource {
                    found: self.resource_name,
                    expected: *resource,
                });
            }
        }
        if let Some(host_id) = expect.host_id {
            if self.num_hosts < host_id {
                return Err(MoorError::LeaderNumHosts {
                    num_hosts: self.num_hosts,
                    host_id,
                });
            }
        }
        if self.checksum != computed_checksum {
            return Err(MoorError::LeaderChecksum {
                found: self.checksum,
                computed: computed_checksum,
            });
        }
        Ok(())
    }

    /// Fields that make two leaders "the same lease state" for majority
    /// comparison and change detection: everything up to and including the
    /// names, ignoring the writer bookkeeping.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.magic == other.magic
            && self.version == other.version
            && self.flags == other.flags
            && self.sector_size == other.sector_size
            && self.num_hosts == other.num_hosts
            && self.max_hosts == other.max_hosts
            && self.owner_id == other.owner_id
            && self.owner_generation == other.owner_generation
            && self.lver == other.lver
            && self.timestamp == other.timestamp
            && self.space_name == other.space_name
            && self.resource_name == other.resource_name
    }

    /// True when the lease is unowned.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.timestamp == moorlock_types::LEASE_FREE
    }
}

/// What a reader expects of a leader record it just decoded.
#[derive(Debug, Clone, Copy)]
pub struct LeaderExpect<'a> {
    pub magic: u32,
    pub version: u32,
    pub space_name: Option<&'a Name>,
    pub resource_name: Option<&'a Name>,
    pub host_id: Option<HostId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PAXOS_DISK_MAGIC, PAXOS_DISK_VERSION};

    fn sample() -> LeaderRecord {
        LeaderRecord {
            magic: PAXOS_DISK_MAGIC,
            version: PAXOS_DISK_VERSION,
            flags: 0,
            sector_size: 512,
            num_hosts: 8,
            max_hosts: 8,
            owner_id: 1,
            owner_generation: 1,
            lver: 3,
            timestamp: 777,
            space_name: "vg".parse().unwrap(),
            resource_name: "lv1".parse().unwrap(),
            write_id: 1,
            write_generation: 1,
            write_timestamp: 778,
            io_timeout: 10,
            checksum: 0,
        }
    }

    fn expect_of(lr: &LeaderRecord) -> LeaderExpect<'static> {
        LeaderExpect {
            magic: PAXOS_DISK_MAGIC,
            version: PAXOS_DISK_VERSION,
            space_name: None,
            resource_name: None,
            host_id: Some(lr.owner_id),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut lr = sample();
        let raw = lr.encode();
        assert_eq!(raw.len(), LEADER_SIZE);
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        assert_eq!(back, lr);
        assert_eq!(computed, lr.checksum);
        back.verify(computed, &expect_of(&back)).unwrap();
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut lr = sample();
        let mut raw = lr.encode();
        raw[57] ^= 0x01;
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        let err = back.verify(computed, &expect_of(&back)).unwrap_err();
        assert!(matches!(err, MoorError::LeaderChecksum { .. }));
    }

    #[test]
    fn wrong_names_are_rejected() {
        let mut lr = sample();
        let raw = lr.encode();
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        let other: Name = "other".parse().unwrap();

        let err = back
            .verify(
                computed,
                &LeaderExpect {
                    space_name: Some(&other),
                    ..expect_of(&back)
                },
            )
            .unwrap_err();
        assert!(matches!(err, MoorError::LeaderLockspace { .. }));

        let err = back
            .verify(
                computed,
                &LeaderExpect {
                    resource_name: Some(&other),
                    ..expect_of(&back)
                },
            )
            .unwrap_err();
        assert!(matches!(err, MoorError::LeaderResource { .. }));
    }

    #[test]
    fn host_id_beyond_num_hosts_rejected() {
        let mut lr = sample();
        let raw = lr.encode();
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        let err = back
            .verify(
                computed,
                &LeaderExpect {
                    host_id: Some(9),
                    ..expect_of(&back)
                },
            )
            .unwrap_err();
        assert!(matches!(err, MoorError::LeaderNumHosts { .. }));
    }

    #[test]
    fn cleared_magic_is_leader_magic_error() {
        let mut lr = sample();
        lr.magic = crate::PAXOS_DISK_CLEAR;
        let raw = lr.encode();
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        assert!(matches!(
            back.verify(computed, &expect_of(&back)),
            Err(MoorError::LeaderMagic { .. })
        ));
    }
}
