//! Unix file and block-device backend.
//!
//! Opens the device read-write with `O_DSYNC` so completed writes are
//! durable before the call returns; the paxos safety argument needs writes
//! to be on stable storage, not in a volatile cache. Sector size comes
//! from `BLKSSZGET` on block devices and defaults to 512 for regular files
//! (test images).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::fs::FileExt;
use std::path::Path;

use moorlock_error::{MoorError, Result};
use moorlock_types::DiskSpec;
use tracing::debug;

use crate::traits::SectorDisk;

nix::ioctl_read_bad!(blk_ssz_get, 0x1268, libc::c_int);

/// A lease area on a real file or block device.
pub struct FileDisk {
    file: File,
    base: u64,
    sector_size: u32,
    label: String,
}

impl FileDisk {
    /// Open the device named by `spec` and discover its sector size.
    pub fn open(spec: &DiskSpec) -> Result<Self> {
        Self::open_path(&spec.path, spec.offset)
    }

    /// Open `path` with the lease area starting at `base`.
    pub fn open_path(path: &Path, base: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)?;

        let meta = file.metadata()?;
        let sector_size = if meta.file_type().is_block_device() {
            let mut ssz: libc::c_int = 0;
            // SAFETY: valid fd, BLKSSZGET writes one c_int.
            unsafe { blk_ssz_get(file.as_raw_fd(), &mut ssz) }
                .map_err(|e| MoorError::Io(e.into()))?;
            u32::try_from(ssz).map_err(|_| MoorError::InvalidSectorSize(0))?
        } else {
            512
        };

        if !crate::sector_size_supported(sector_size) {
            return Err(MoorError::InvalidSectorSize(sector_size));
        }

        debug!(path = %path.display(), base, sector_size, "opened lease disk");

        Ok(Self {
            file,
            base,
            sector_size,
            label: format!("{}:{}", path.display(), base),
        })
    }
}

impl SectorDisk for FileDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, self.base + offset)
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, self.base + offset)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatcher::IoDispatcher;
    use crate::traits::DiskHandle;

    #[test]
    fn file_backend_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1024 * 1024).unwrap();

        let disk: DiskHandle =
            Arc::new(FileDisk::open_path(tmp.path(), 0).unwrap());
        assert_eq!(disk.sector_size(), 512);

        let io = IoDispatcher::new();
        io.write_sector(&disk, 3, b"moorlock", 5).unwrap();
        let buf = io.read_sectors(&disk, 3, 1, 5).unwrap();
        assert_eq!(&buf[..8], b"moorlock");
    }

    #[test]
    fn base_offset_is_applied() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1024 * 1024).unwrap();

        let d0 = FileDisk::open_path(tmp.path(), 0).unwrap();
        let d1 = FileDisk::open_path(tmp.path(), 4096).unwrap();

        d1.pwrite(0, &[5u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        d0.pread(4096, &mut buf).unwrap();
        assert_eq!(buf, [5u8; 512]);
    }
}
