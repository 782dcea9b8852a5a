//! In-memory disk backend.
//!
//! A `MemRegion` is the shared storage; each simulated host opens its own
//! `MemDisk` handle onto it, the way real hosts open the same block
//! device. Fault switches let tests take a disk away (majority-quorum
//! scenarios) or make it fail outright.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::traits::SectorDisk;

struct RegionInner {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// Shared backing store for one lease area.
#[derive(Clone)]
pub struct MemRegion {
    inner: Arc<RegionInner>,
}

impl MemRegion {
    /// A zeroed region of `len` bytes with the given sector size.
    #[must_use]
    pub fn new(len: usize, sector_size: u32) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                data: Mutex::new(vec![0u8; len]),
                sector_size,
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Make all subsequent reads fail (and recover).
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make all subsequent writes fail (and recover).
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Take the whole disk away.
    pub fn set_offline(&self, offline: bool) {
        self.set_fail_reads(offline);
        self.set_fail_writes(offline);
    }

    /// Copy out a byte range (test inspection).
    #[must_use]
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        self.inner.data.lock()[offset..offset + len].to_vec()
    }

    /// Overwrite a byte range directly (test corruption injection).
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        self.inner.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// One host's handle onto a [`MemRegion`].
pub struct MemDisk {
    region: MemRegion,
    label: String,
}

impl MemDisk {
    #[must_use]
    pub fn new(region: &MemRegion) -> Self {
        Self {
            region: region.clone(),
            label: "mem".to_string(),
        }
    }

    #[must_use]
    pub fn with_label(region: &MemRegion, label: impl Into<String>) -> Self {
        Self {
            region: region.clone(),
            label: label.into(),
        }
    }
}

fn range_of(data_len: usize, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
    let end = start
        .checked_add(len)
        .filter(|&e| e <= data_len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "i/o beyond region end"))?;
    Ok(start..end)
}

impl SectorDisk for MemDisk {
    fn sector_size(&self) -> u32 {
        self.region.inner.sector_size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.region.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let data = self.region.inner.data.lock();
        let range = range_of(data.len(), offset, buf.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn pwrite(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        if self.region.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut data = self.region.inner.data.lock();
        let range = range_of(data.len(), offset, src.len())?;
        data[range].copy_from_slice(src);
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_handles_share_storage() {
        let region = MemRegion::new(4096, 512);
        let a = MemDisk::with_label(&region, "host1");
        let b = MemDisk::with_label(&region, "host2");

        a.pwrite(512, &[9u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        b.pread(512, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 512]);
    }

    #[test]
    fn bounds_are_enforced() {
        let region = MemRegion::new(1024, 512);
        let d = MemDisk::new(&region);
        let mut buf = [0u8; 512];
        assert!(d.pread(1024, &mut buf).is_err());
        assert!(d.pwrite(513 * 2, &buf).is_err());
    }

    #[test]
    fn fault_switches() {
        let region = MemRegion::new(1024, 512);
        let d = MemDisk::new(&region);
        region.set_offline(true);
        let mut buf = [0u8; 512];
        assert!(d.pread(0, &mut buf).is_err());
        assert!(d.pwrite(0, &buf).is_err());
        region.set_offline(false);
        assert!(d.pread(0, &mut buf).is_ok());
    }
}
