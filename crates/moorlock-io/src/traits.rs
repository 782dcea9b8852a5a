//! The disk seam.

use std::io;
use std::sync::Arc;

/// A lease area on one disk: blocking positioned reads and writes plus the
/// device's native sector size.
///
/// Offsets are relative to the lease area base (implementations fold in
/// the absolute device offset). Implementations must be safe to call from
/// multiple threads; the dispatcher runs operations on worker threads.
pub trait SectorDisk: Send + Sync {
    /// Native sector size of the backing device (512 or 4096).
    fn sector_size(&self) -> u32;

    /// Read `buf.len()` bytes at `offset`, blocking until done or failed.
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`, durably, blocking until done or failed.
    fn pwrite(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Identification for log messages.
    fn describe(&self) -> String;
}

/// Shared handle to a disk.
pub type DiskHandle = Arc<dyn SectorDisk>;
