//! Per-host paxos ballot state (dblock) and the shared-mode block
//! overlaid in the same sector.

use moorlock_error::{MoorError, Result};
use moorlock_types::{Generation, LeaseVersion};

use crate::record_crc;
use crate::wire::{read_u32_at, read_u64_at, write_u32_at, write_u64_at};

/// Serialized size of a dblock.
pub const DBLOCK_SIZE: usize = 56;

/// Bytes covered by the dblock checksum.
const CHECKSUM_LEN: usize = 52;

/// Byte offset of the mode block within a dblock sector.
pub const MBLOCK_OFFSET: usize = 128;

/// Serialized size of a mode block.
pub const MBLOCK_SIZE: usize = 12;

const OFF_MBAL: usize = 0;
const OFF_BAL: usize = 8;
const OFF_INP: usize = 16;
const OFF_INP2: usize = 24;
const OFF_INP3: usize = 32;
const OFF_LVER: usize = 40;
const OFF_FLAGS: usize = 48;
const OFF_CHECKSUM: usize = 52;

/// One host's ballot state for one resource lease.
///
/// `(inp, inp2, inp3)` is the proposed owner triple
/// `(host_id, generation, timestamp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaxosDblock {
    pub mbal: u64,
    pub bal: u64,
    pub inp: u64,
    pub inp2: u64,
    pub inp3: u64,
    pub lver: LeaseVersion,
    pub flags: u32,
    pub checksum: u32,
}

impl PaxosDblock {
    /// Serialize, computing and installing the checksum.
    pub fn encode(&mut self) -> [u8; DBLOCK_SIZE] {
        let mut buf = [0u8; DBLOCK_SIZE];
        write_u64_at(&mut buf, OFF_MBAL, self.mbal);
        write_u64_at(&mut buf, OFF_BAL, self.bal);
        write_u64_at(&mut buf, OFF_INP, self.inp);
        write_u64_at(&mut buf, OFF_INP2, self.inp2);
        write_u64_at(&mut buf, OFF_INP3, self.inp3);
        write_u64_at(&mut buf, OFF_LVER, self.lver);
        write_u32_at(&mut buf, OFF_FLAGS, self.flags);
        self.checksum = record_crc(&buf[..CHECKSUM_LEN]);
        write_u32_at(&mut buf, OFF_CHECKSUM, self.checksum);
        buf
    }

    /// Deserialize, returning the record and the recomputed checksum.
    pub fn decode(raw: &[u8]) -> Result<(Self, u32)> {
        if raw.len() < DBLOCK_SIZE {
            return Err(MoorError::ShortRecord {
                need: DBLOCK_SIZE,
                have: raw.len(),
            });
        }
        let computed = record_crc(&raw[..CHECKSUM_LEN]);
        let record = Self {
            mbal: read_u64_at(raw, OFF_MBAL),
            bal: read_u64_at(raw, OFF_BAL),
            inp: read_u64_at(raw, OFF_INP),
            inp2: read_u64_at(raw, OFF_INP2),
            inp3: read_u64_at(raw, OFF_INP3),
            lver: read_u64_at(raw, OFF_LVER),
            flags: read_u32_at(raw, OFF_FLAGS),
            checksum: read_u32_at(raw, OFF_CHECKSUM),
        };
        Ok((record, computed))
    }

    /// Checksum check. A never-written (all-zero) dblock verifies OK.
    pub fn verify(&self, computed_checksum: u32) -> Result<()> {
        if self.checksum == 0 && self.mbal == 0 && self.bal == 0 && self.inp == 0 && self.lver == 0
        {
            return Ok(());
        }
        if self.checksum != computed_checksum {
            return Err(MoorError::DblockChecksum {
                found: self.checksum,
                computed: computed_checksum,
            });
        }
        Ok(())
    }
}

/// Shared-mode marker, overlaid at [`MBLOCK_OFFSET`] within the dblock
/// sector. Guarded by position and by `generation` matching a live delta
/// lease rather than by a checksum of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeBlock {
    pub flags: u32,
    pub generation: Generation,
}

impl ModeBlock {
    /// Serialize.
    #[must_use]
    pub fn encode(&self) -> [u8; MBLOCK_SIZE] {
        let mut buf = [0u8; MBLOCK_SIZE];
        write_u32_at(&mut buf, 0, self.flags);
        write_u64_at(&mut buf, 4, self.generation);
        buf
    }

    /// Deserialize.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < MBLOCK_SIZE {
            return Err(MoorError::ShortRecord {
                need: MBLOCK_SIZE,
                have: raw.len(),
            });
        }
        Ok(Self {
            flags: read_u32_at(raw, 0),
            generation: read_u64_at(raw, 4),
        })
    }

    /// True when the SHARED flag is set.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags & moorlock_types::MblockFlags::SHARED.bits() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dblock_round_trip() {
        let mut db = PaxosDblock {
            mbal: 2001,
            bal: 2001,
            inp: 1,
            inp2: 1,
            inp3: 555,
            lver: 4,
            flags: 0,
            checksum: 0,
        };
        let raw = db.encode();
        let (back, computed) = PaxosDblock::decode(&raw).unwrap();
        assert_eq!(back, db);
        back.verify(computed).unwrap();
    }

    #[test]
    fn zero_dblock_verifies() {
        let raw = [0u8; DBLOCK_SIZE];
        let (db, computed) = PaxosDblock::decode(&raw).unwrap();
        db.verify(computed).unwrap();
    }

    #[test]
    fn corrupt_dblock_fails() {
        let mut db = PaxosDblock {
            mbal: 9,
            ..Default::default()
        };
        let mut raw = db.encode();
        raw[0] ^= 0xFF;
        let (back, computed) = PaxosDblock::decode(&raw).unwrap();
        assert!(matches!(
            back.verify(computed),
            Err(MoorError::DblockChecksum { .. })
        ));
    }

    #[test]
    fn mode_block_round_trip() {
        let mb = ModeBlock {
            flags: moorlock_types::MblockFlags::SHARED.bits(),
            generation: 6,
        };
        let raw = mb.encode();
        let back = ModeBlock::decode(&raw).unwrap();
        assert_eq!(back, mb);
        assert!(back.is_shared());
    }
}
