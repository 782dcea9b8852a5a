//! Disk-paxos resource lease engine.
//!
//! A resource lease lives in its own aligned area on one or more shared
//! disks: a leader sector, a request sector, and one ballot (dblock)
//! sector per host. Ownership changes go through a two-phase disk-Paxos
//! ballot; the committed result is written back to the leader sector.
//! Liveness of the current owner is judged through the delta-lease oracle,
//! never assumed.

mod ballot;
mod lease;

pub use lease::PaxosEngine;

use moorlock_error::{MoorError, Result};
use moorlock_io::traits::DiskHandle;
use moorlock_io::IoDispatcher;
use moorlock_ondisk::{
    dblock_sector, LeaderExpect, LeaderRecord, ModeBlock, PaxosDblock, DBLOCK_SIZE, LEADER_SIZE,
    MBLOCK_OFFSET, MBLOCK_SIZE, PAXOS_DISK_MAGIC, PAXOS_DISK_VERSION,
};
use moorlock_types::{Generation, HostId, HostStatus, Name, TokenFlags};

/// View into lockspace state that the acquire path consults to decide
/// whether a lease owner is alive. The runtime implements this over its
/// lockspace table; tests implement it directly.
pub trait HostInfoSource: Send + Sync {
    /// Liveness view of `(space, host)` maintained by the renewal scans.
    fn host_status(&self, space_name: &Name, host_id: HostId) -> Option<HostStatus>;

    /// Handle to the lockspace area holding the delta leases for `space`.
    fn lockspace_disk(&self, space_name: &Name) -> Option<DiskHandle>;
}

/// One client's handle on one resource lease.
///
/// Created by the resource manager for each acquire; carries the identity
/// snapshot of the lockspace (`host_id`, `host_generation`) taken at entry
/// and the flag state the engine needs across calls.
#[derive(Clone)]
pub struct Token {
    pub token_id: u64,
    pub space_name: Name,
    pub resource_name: Name,
    pub host_id: HostId,
    pub host_generation: Generation,
    pub io_timeout: u32,
    pub disks: Vec<DiskHandle>,
    pub flags: TokenFlags,
}

impl Token {
    /// Sector size of the lease area (all disks must agree).
    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.disks[0].sector_size()
    }

    /// Aligned length of the lease area.
    #[must_use]
    pub fn align_size(&self) -> u64 {
        moorlock_io::align_size_for_sector(self.sector_size())
    }

    fn leader_expect(&self) -> LeaderExpect<'_> {
        LeaderExpect {
            magic: PAXOS_DISK_MAGIC,
            version: PAXOS_DISK_VERSION,
            space_name: Some(&self.space_name),
            resource_name: Some(&self.resource_name),
            host_id: Some(self.host_id),
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Token({} {}:{} host {}:{})",
            self.token_id, self.space_name, self.resource_name, self.host_id, self.host_generation
        )
    }
}

/// Strict-majority quorum.
#[must_use]
pub fn majority_disks(total: usize, ok: usize) -> bool {
    ok >= total / 2 + 1
}

/// Everything a single-disk lease read yields.
pub(crate) struct LeaseView {
    pub leader: LeaderRecord,
    pub our_dblock: PaxosDblock,
    pub max_mbal: u64,
    /// Hosts whose mode block carries SHARED, with the block itself.
    pub shared: Vec<(HostId, ModeBlock)>,
}

pub(crate) struct DiskIo<'a> {
    pub io: &'a IoDispatcher,
    pub token: &'a Token,
}

impl DiskIo<'_> {
    pub fn write_dblock(
        &self,
        disk: &DiskHandle,
        host_id: HostId,
        dblock: &mut PaxosDblock,
        keep_shared: Option<Generation>,
    ) -> Result<()> {
        let raw = dblock.encode();
        match keep_shared {
            None => self
                .io
                .write_sector(disk, dblock_sector(host_id), &raw, self.token.io_timeout),
            Some(generation) => {
                // Combined dblock + mode block write so an in-flight ballot
                // does not clobber our SHARED marker.
                let ss = usize::try_from(disk.sector_size()).expect("sector size fits usize");
                let mut buf = moorlock_io::AlignedBuf::zeroed(ss);
                buf[..DBLOCK_SIZE].copy_from_slice(&raw);
                let mb = ModeBlock {
                    flags: moorlock_types::MblockFlags::SHARED.bits(),
                    generation,
                };
                buf[MBLOCK_OFFSET..MBLOCK_OFFSET + MBLOCK_SIZE].copy_from_slice(&mb.encode());
                self.io
                    .write_iobuf(
                        disk,
                        dblock_sector(host_id) * u64::from(disk.sector_size()),
                        buf,
                        self.token.io_timeout,
                    )
                    .map(drop)
            }
        }
    }

    pub fn read_dblock(&self, disk: &DiskHandle, host_id: HostId) -> Result<PaxosDblock> {
        let buf = self
            .io
            .read_sectors(disk, dblock_sector(host_id), 1, self.token.io_timeout)?;
        let (dblock, computed) = PaxosDblock::decode(&buf)?;
        dblock.verify(computed)?;
        Ok(dblock)
    }

    pub fn write_leader(&self, disk: &DiskHandle, leader: &mut LeaderRecord) -> Result<()> {
        let raw = leader.encode();
        self.io.write_sector(disk, 0, &raw, self.token.io_timeout)
    }

    pub fn read_leader_one(&self, disk: &DiskHandle) -> Result<LeaderRecord> {
        let buf = self.io.read_sectors(disk, 0, 1, self.token.io_timeout)?;
        let (leader, computed) = LeaderRecord::decode(&buf)?;
        leader.verify(computed, &self.token.leader_expect())?;
        Ok(leader)
    }

    /// Leader record agreed by a majority of disks.
    pub fn read_leader(&self) -> Result<LeaderRecord> {
        let disks = &self.token.disks;
        if disks.len() == 1 {
            return self.read_leader_one(&disks[0]);
        }

        let mut leaders: Vec<LeaderRecord> = Vec::with_capacity(disks.len());
        for disk in disks {
            match self.read_leader_one(disk) {
                Ok(leader) => leaders.push(leader),
                Err(e) if e.is_timeout() => return Err(e),
                Err(_) => {}
            }
        }
        if !majority_disks(disks.len(), leaders.len()) {
            return Err(MoorError::LeaderRead);
        }
        pick_majority_leader(disks.len(), &leaders).ok_or(MoorError::LeaderDiff)
    }

    /// Write a new leader to all disks, requiring a majority.
    pub fn write_new_leader(&self, leader: &mut LeaderRecord) -> Result<()> {
        let disks = &self.token.disks;
        let mut ok = 0usize;
        let mut timed_out = false;
        let mut last_err = None;
        for disk in disks {
            match self.write_leader(disk, leader) {
                Ok(()) => ok += 1,
                Err(e) => {
                    timed_out |= e.is_timeout();
                    last_err = Some(e);
                }
            }
        }
        if majority_disks(disks.len(), ok) {
            return Ok(());
        }
        match last_err {
            Some(e) if timed_out => Err(e),
            _ => Err(MoorError::LeaderWrite),
        }
    }

    /// Read the whole lease area of one disk: leader, our dblock, the max
    /// mbal over every dblock, and all shared mode blocks.
    pub fn lease_read_one(&self, disk: &DiskHandle) -> Result<LeaseView> {
        let ss = usize::try_from(disk.sector_size()).expect("sector size fits usize");
        let len = usize::try_from(self.token.align_size()).expect("align size fits usize");
        let buf = self.io.read_iobuf(disk, 0, len, self.token.io_timeout)?;

        let (leader, computed) = LeaderRecord::decode(&buf[..LEADER_SIZE])?;
        leader.verify(computed, &self.token.leader_expect())?;

        let our_sector = usize::try_from(dblock_sector(self.token.host_id)).expect("sector index");
        let (our_dblock, our_computed) =
            PaxosDblock::decode(&buf[our_sector * ss..our_sector * ss + DBLOCK_SIZE])?;
        our_dblock.verify(our_computed)?;

        let mut max_mbal = 0u64;
        let mut shared = Vec::new();
        for q in 0..leader.num_hosts {
            let host_id = q + 1;
            let start = usize::try_from(dblock_sector(host_id)).expect("sector index") * ss;
            let (bk, bk_computed) = PaxosDblock::decode(&buf[start..start + DBLOCK_SIZE])?;
            bk.verify(bk_computed)?;
            if bk.mbal > max_mbal {
                max_mbal = bk.mbal;
            }
            let mb = ModeBlock::decode(&buf[start + MBLOCK_OFFSET..start + MBLOCK_OFFSET + MBLOCK_SIZE])?;
            if mb.is_shared() {
                shared.push((host_id, mb));
            }
        }

        Ok(LeaseView {
            leader,
            our_dblock,
            max_mbal,
            shared,
        })
    }

    /// Majority lease read across all disks.
    pub fn lease_read(&self) -> Result<LeaseView> {
        let disks = &self.token.disks;
        if disks.len() == 1 {
            return self.lease_read_one(&disks[0]);
        }

        let mut views: Vec<LeaseView> = Vec::new();
        for disk in disks {
            match self.lease_read_one(disk) {
                Ok(view) => views.push(view),
                Err(e) if e.is_timeout() => return Err(e),
                Err(_) => {}
            }
        }
        if !majority_disks(disks.len(), views.len()) {
            return Err(MoorError::DblockRead);
        }

        let leaders: Vec<LeaderRecord> = views.iter().map(|v| v.leader).collect();
        let leader =
            pick_majority_leader(disks.len(), &leaders).ok_or(MoorError::LeaderDiff)?;

        let best = views
            .iter()
            .max_by_key(|v| v.max_mbal)
            .expect("views nonempty");
        let mut shared: Vec<(HostId, ModeBlock)> = Vec::new();
        for view in &views {
            for &(host_id, mb) in &view.shared {
                if !shared.iter().any(|&(h, _)| h == host_id) {
                    shared.push((host_id, mb));
                }
            }
        }

        Ok(LeaseView {
            leader,
            our_dblock: best.our_dblock,
            max_mbal: best.max_mbal,
            shared,
        })
    }
}

/// The leader state repeated on a strict majority of `total` disks.
fn pick_majority_leader(total: usize, leaders: &[LeaderRecord]) -> Option<LeaderRecord> {
    for (i, candidate) in leaders.iter().enumerate() {
        let reps = leaders[i..]
            .iter()
            .filter(|l| l.same_state(candidate))
            .count();
        if majority_disks(total, reps) {
            return Some(*candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_rule() {
        assert!(majority_disks(1, 1));
        assert!(!majority_disks(1, 0));
        assert!(majority_disks(2, 2));
        assert!(!majority_disks(2, 1));
        assert!(majority_disks(3, 2));
        assert!(!majority_disks(3, 1));
        assert!(majority_disks(4, 3));
        assert!(!majority_disks(4, 2));
    }

    #[test]
    fn majority_leader_pick() {
        let mut a = LeaderRecord {
            lver: 3,
            ..Default::default()
        };
        let b = LeaderRecord {
            lver: 4,
            ..Default::default()
        };
        a.owner_id = 1;
        assert_eq!(pick_majority_leader(3, &[a, a, b]).unwrap().lver, 3);
        assert!(pick_majority_leader(3, &[a, b]).is_none());
    }
}
