//! Request record: the second sector of a resource area, through which
//! collaborators post asynchronous lease requests to the current owner.
//! The core stores and retrieves it; `force_mode` is opaque here.

use moorlock_error::{MoorError, Result};
use moorlock_types::LeaseVersion;

use crate::wire::{read_u32_at, read_u64_at, write_u32_at, write_u64_at};
use crate::{REQ_DISK_MAGIC, REQ_DISK_VERSION};

/// Serialized size of a request record.
pub const REQUEST_SIZE: usize = 20;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_LVER: usize = 8;
const OFF_FORCE_MODE: usize = 16;

/// An asynchronous request against a resource lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub magic: u32,
    pub version: u32,
    /// Lease version the request applies to.
    pub lver: LeaseVersion,
    pub force_mode: u32,
}

impl Default for RequestRecord {
    fn default() -> Self {
        Self {
            magic: REQ_DISK_MAGIC,
            version: REQ_DISK_VERSION,
            lver: 0,
            force_mode: 0,
        }
    }
}

impl RequestRecord {
    /// Serialize.
    #[must_use]
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        write_u32_at(&mut buf, OFF_MAGIC, self.magic);
        write_u32_at(&mut buf, OFF_VERSION, self.version);
        write_u64_at(&mut buf, OFF_LVER, self.lver);
        write_u32_at(&mut buf, OFF_FORCE_MODE, self.force_mode);
        buf
    }

    /// Deserialize and check magic.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < REQUEST_SIZE {
            return Err(MoorError::ShortRecord {
                need: REQUEST_SIZE,
                have: raw.len(),
            });
        }
        let record = Self {
            magic: read_u32_at(raw, OFF_MAGIC),
            version: read_u32_at(raw, OFF_VERSION),
            lver: read_u64_at(raw, OFF_LVER),
            force_mode: read_u32_at(raw, OFF_FORCE_MODE),
        };
        if record.magic != REQ_DISK_MAGIC {
            return Err(MoorError::LeaderMagic {
                found: record.magic,
                expected: REQ_DISK_MAGIC,
            });
        }
        Ok(record)
    }
}
