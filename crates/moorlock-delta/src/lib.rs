//! Delta lease engine.
//!
//! A delta lease is one sector per host in a lockspace area. A host proves
//! it is alive by rewriting its slot's timestamp; every other host watches
//! those timestamps to decide whether a lease owner can still be holding
//! anything. Acquiring a slot is deliberately slow — the slot must be
//! observed stable for a full dead interval on both sides of the write —
//! which is what lets the rest of the system equate "timestamp unchanged
//! for host_dead_seconds" with "that host's watchdog has fired".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moorlock_error::{MoorError, Result};
use moorlock_io::traits::DiskHandle;
use moorlock_io::IoDispatcher;
use moorlock_ondisk::{
    delta_slot_sector, LeaderExpect, LeaderRecord, DELTA_DISK_MAGIC, DELTA_DISK_VERSION,
    LEADER_SIZE,
};
use moorlock_types::{Clock, HostId, HostStatus, Name, Timeouts, LEASE_FREE};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Liveness view of every observed slot in one lockspace.
///
/// Fed by every delta-lease read; consulted by the paxos acquire path to
/// decide whether a lease owner is alive.
#[derive(Default)]
pub struct HostStatusTable {
    inner: RwLock<HashMap<HostId, HostStatus>>,
}

impl HostStatusTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one read of `host_id`'s slot at monotonic time `now`.
    pub fn observe(&self, now: u64, host_id: HostId, leader: &LeaderRecord) {
        let mut inner = self.inner.write();
        let hs = inner.entry(host_id).or_default();
        hs.last_check = now;
        if hs.timestamp != leader.timestamp
            || hs.owner_id != leader.owner_id
            || hs.owner_generation != leader.owner_generation
        {
            hs.timestamp = leader.timestamp;
            hs.owner_id = leader.owner_id;
            hs.owner_generation = leader.owner_generation;
            hs.io_timeout = leader.io_timeout;
            if leader.timestamp != LEASE_FREE {
                hs.last_live = now;
            }
        }
    }

    /// Current view of one slot.
    #[must_use]
    pub fn get(&self, host_id: HostId) -> Option<HostStatus> {
        self.inner.read().get(&host_id).copied()
    }
}

/// Identity of the slot an operation works on.
#[derive(Debug, Clone, Copy)]
pub struct DeltaSlot<'a> {
    pub space_name: &'a Name,
    pub host_id: HostId,
    /// Stored in the slot's `resource_name` field for operators.
    pub host_name: &'a Name,
    pub timeouts: Timeouts,
}

/// The engine: stateless over (dispatcher, clock); all lease state is on
/// disk and in the caller's `HostStatusTable`.
pub struct DeltaEngine {
    io: IoDispatcher,
    clock: Arc<dyn Clock>,
}

impl DeltaEngine {
    #[must_use]
    pub fn new(io: IoDispatcher, clock: Arc<dyn Clock>) -> Self {
        Self { io, clock }
    }

    /// Initialize a lockspace area: one free leader per slot.
    pub fn init(
        &self,
        disk: &DiskHandle,
        space_name: &Name,
        max_hosts: u64,
        io_timeout: u32,
    ) -> Result<()> {
        let ss = usize::try_from(disk.sector_size()).expect("sector size fits usize");
        let count = usize::try_from(max_hosts).expect("max_hosts fits usize");
        let mut buf = moorlock_io::AlignedBuf::zeroed(count * ss);

        for slot in 0..max_hosts {
            let mut leader = LeaderRecord {
                magic: DELTA_DISK_MAGIC,
                version: DELTA_DISK_VERSION,
                sector_size: disk.sector_size(),
                num_hosts: max_hosts,
                max_hosts,
                owner_id: slot + 1,
                timestamp: LEASE_FREE,
                space_name: *space_name,
                ..Default::default()
            };
            let raw = leader.encode();
            let start = usize::try_from(slot).expect("slot fits usize") * ss;
            buf[start..start + LEADER_SIZE].copy_from_slice(&raw);
        }

        self.io.write_iobuf(disk, 0, buf, io_timeout)?;
        info!(space = %space_name, max_hosts, "initialized lockspace area");
        Ok(())
    }

    /// Read and verify one slot.
    pub fn read_slot(
        &self,
        disk: &DiskHandle,
        space_name: Option<&Name>,
        host_id: HostId,
        io_timeout: u32,
    ) -> Result<LeaderRecord> {
        let buf = self
            .io
            .read_sectors(disk, delta_slot_sector(host_id), 1, io_timeout)?;
        let (leader, computed) = LeaderRecord::decode(&buf)?;
        leader.verify(
            computed,
            &LeaderExpect {
                magic: DELTA_DISK_MAGIC,
                version: DELTA_DISK_VERSION,
                space_name,
                resource_name: None,
                host_id: None,
            },
        )?;
        Ok(leader)
    }

    /// Acquire the slot.
    ///
    /// A non-free slot must be observed unchanged for a full dead interval
    /// before we may overwrite it; any meaningful change during that wait
    /// means another host is using the slot. After writing, a second dead
    /// interval must pass with our record intact before the slot is ours.
    pub fn acquire(&self, disk: &DiskHandle, slot: &DeltaSlot<'_>) -> Result<LeaderRecord> {
        let io_to = slot.timeouts.io_timeout_seconds();
        let dead = u64::from(slot.timeouts.host_dead_seconds());

        let observed = self.read_slot(disk, Some(slot.space_name), slot.host_id, io_to)?;

        if !observed.is_free() {
            debug!(
                space = %slot.space_name, host_id = slot.host_id,
                owner = observed.owner_id, generation = observed.owner_generation,
                "slot held; waiting for stability"
            );
            let wait_start = self.clock.monotime();
            loop {
                self.clock.sleep(Duration::from_secs(1));
                let cur = self.read_slot(disk, Some(slot.space_name), slot.host_id, io_to)?;
                if cur.owner_id != observed.owner_id
                    || cur.owner_generation != observed.owner_generation
                    || cur.timestamp != observed.timestamp
                {
                    warn!(
                        space = %slot.space_name, host_id = slot.host_id,
                        owner = cur.owner_id, "slot changed during acquire wait"
                    );
                    return Err(MoorError::DeltaBusy {
                        host_id: slot.host_id,
                        owner_id: cur.owner_id,
                        owner_generation: cur.owner_generation,
                    });
                }
                if self.clock.monotime() - wait_start >= dead {
                    break;
                }
            }
        }

        let mut ours = LeaderRecord {
            magic: DELTA_DISK_MAGIC,
            version: DELTA_DISK_VERSION,
            sector_size: disk.sector_size(),
            num_hosts: observed.num_hosts,
            max_hosts: observed.max_hosts,
            owner_id: slot.host_id,
            owner_generation: observed.owner_generation + 1,
            timestamp: self.clock.monotime(),
            space_name: *slot.space_name,
            resource_name: *slot.host_name,
            write_id: slot.host_id,
            write_generation: observed.owner_generation + 1,
            write_timestamp: self.clock.monotime(),
            io_timeout: io_to,
            ..Default::default()
        };
        self.write_slot(disk, slot.host_id, &mut ours, io_to)?;

        // The post-write wait gives a racing host time to clobber us; only
        // an unchanged record after the full interval proves the slot is
        // ours.
        let wait_start = self.clock.monotime();
        while self.clock.monotime() - wait_start < dead {
            self.clock.sleep(Duration::from_secs(1));
        }

        let check = self.read_slot(disk, Some(slot.space_name), slot.host_id, io_to)?;
        if check.owner_id != ours.owner_id
            || check.owner_generation != ours.owner_generation
            || check.timestamp != ours.timestamp
        {
            warn!(
                space = %slot.space_name, host_id = slot.host_id,
                owner = check.owner_id, generation = check.owner_generation,
                "slot clobbered during acquire"
            );
            return Err(MoorError::DeltaBadLeader { host_id: slot.host_id });
        }

        info!(
            space = %slot.space_name, host_id = slot.host_id,
            generation = ours.owner_generation, "host slot acquired"
        );
        Ok(ours)
    }

    /// Renew the slot: prove liveness by moving the timestamp forward.
    pub fn renew(
        &self,
        disk: &DiskHandle,
        slot: &DeltaSlot<'_>,
        prev: &LeaderRecord,
    ) -> Result<LeaderRecord> {
        let io_to = slot.timeouts.io_timeout_seconds();
        let cur = self.read_slot(disk, Some(slot.space_name), slot.host_id, io_to)?;

        if cur.owner_id != slot.host_id
            || cur.owner_generation != prev.owner_generation
            || cur.timestamp != prev.timestamp
        {
            warn!(
                space = %slot.space_name, host_id = slot.host_id,
                owner = cur.owner_id, generation = cur.owner_generation,
                "renewal found foreign slot state"
            );
            return Err(MoorError::DeltaBadLeader { host_id: slot.host_id });
        }

        let mut next = cur;
        next.timestamp = self.clock.monotime();
        next.write_timestamp = next.timestamp;
        self.write_slot(disk, slot.host_id, &mut next, io_to)?;
        debug!(
            space = %slot.space_name, host_id = slot.host_id,
            timestamp = next.timestamp, "slot renewed"
        );
        Ok(next)
    }

    /// Release the slot by marking it free.
    pub fn release(
        &self,
        disk: &DiskHandle,
        slot: &DeltaSlot<'_>,
        prev: &LeaderRecord,
    ) -> Result<LeaderRecord> {
        let io_to = slot.timeouts.io_timeout_seconds();
        let mut next = *prev;
        next.timestamp = LEASE_FREE;
        next.write_timestamp = self.clock.monotime();
        self.write_slot(disk, slot.host_id, &mut next, io_to)?;
        info!(space = %slot.space_name, host_id = slot.host_id, "host slot released");
        Ok(next)
    }

    /// Read every slot in one aligned I/O and feed the status table.
    pub fn scan_all(
        &self,
        disk: &DiskHandle,
        space_name: &Name,
        max_hosts: u64,
        io_timeout: u32,
        table: &HostStatusTable,
    ) {
        let count = usize::try_from(max_hosts).expect("max_hosts fits usize");
        let buf = match self.io.read_sectors(disk, 0, count, io_timeout) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(space = %space_name, error = %e, "host status scan read failed");
                return;
            }
        };
        let ss = usize::try_from(disk.sector_size()).expect("sector size fits usize");
        let now = self.clock.monotime();
        for slot in 0..count {
            let raw = &buf[slot * ss..slot * ss + LEADER_SIZE];
            let Ok((leader, computed)) = LeaderRecord::decode(raw) else {
                continue;
            };
            let ok = leader.verify(
                computed,
                &LeaderExpect {
                    magic: DELTA_DISK_MAGIC,
                    version: DELTA_DISK_VERSION,
                    space_name: Some(space_name),
                    resource_name: None,
                    host_id: None,
                },
            );
            if ok.is_ok() {
                table.observe(now, slot as u64 + 1, &leader);
            }
        }
    }

    fn write_slot(
        &self,
        disk: &DiskHandle,
        host_id: HostId,
        leader: &mut LeaderRecord,
        io_timeout: u32,
    ) -> Result<()> {
        let raw = leader.encode();
        self.io
            .write_sector(disk, delta_slot_sector(host_id), &raw, io_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use moorlock_io::{MemDisk, MemRegion, SectorDisk};
    use moorlock_types::TestClock;

    use super::*;

    const SPACE: &str = "vg-test";
    const IO_TO: u32 = 10;

    fn setup() -> (MemRegion, DiskHandle, DeltaEngine, Arc<TestClock>) {
        let region = MemRegion::new(1024 * 1024, 512);
        let disk: DiskHandle = Arc::new(MemDisk::new(&region));
        let clock = Arc::new(TestClock::new(100));
        let engine = DeltaEngine::new(IoDispatcher::new(), Arc::clone(&clock) as Arc<dyn Clock>);
        let space: Name = SPACE.parse().unwrap();
        engine.init(&disk, &space, 8, IO_TO).unwrap();
        (region, disk, engine, clock)
    }

    fn slot_for<'a>(space: &'a Name, host: &'a Name, host_id: HostId) -> DeltaSlot<'a> {
        DeltaSlot {
            space_name: space,
            host_id,
            host_name: host,
            timeouts: Timeouts::new(IO_TO),
        }
    }

    #[test]
    fn acquire_free_slot_bumps_generation() {
        let (_region, disk, engine, _clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let host: Name = "node1".parse().unwrap();

        let leader = engine.acquire(&disk, &slot_for(&space, &host, 1)).unwrap();
        assert_eq!(leader.owner_id, 1);
        assert_eq!(leader.owner_generation, 1);
        assert_ne!(leader.timestamp, LEASE_FREE);
        assert_eq!(leader.io_timeout, IO_TO);

        // Reacquire after release: generation moves again.
        engine.release(&disk, &slot_for(&space, &host, 1), &leader).unwrap();
        let again = engine.acquire(&disk, &slot_for(&space, &host, 1)).unwrap();
        assert_eq!(again.owner_generation, 2);
    }

    #[test]
    fn acquire_reclaims_stale_owner() {
        let (_region, disk, engine, _clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let host: Name = "node2".parse().unwrap();

        // Host 1 owned the slot but stopped renewing.
        let stale = engine.acquire(&disk, &slot_for(&space, &host, 3)).unwrap();
        assert_eq!(stale.owner_generation, 1);

        // A second acquire waits out the dead interval and takes over.
        let taken = engine.acquire(&disk, &slot_for(&space, &host, 3)).unwrap();
        assert_eq!(taken.owner_id, 3);
        assert_eq!(taken.owner_generation, 2);
    }

    /// Disk wrapper that rewrites the slot after a fixed number of reads,
    /// standing in for a live owner renewing mid-wait.
    struct RenewingDisk {
        inner: MemDisk,
        region: MemRegion,
        reads: AtomicU32,
        rewrite_after: u32,
        slot_offset: usize,
        renewed: Vec<u8>,
    }

    impl SectorDisk for RenewingDisk {
        fn sector_size(&self) -> u32 {
            self.inner.sector_size()
        }

        fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n == self.rewrite_after {
                self.region.patch(self.slot_offset, &self.renewed);
            }
            self.inner.pread(offset, buf)
        }

        fn pwrite(&self, offset: u64, data: &[u8]) -> io::Result<()> {
            self.inner.pwrite(offset, data)
        }

        fn describe(&self) -> String {
            "renewing".into()
        }
    }

    #[test]
    fn acquire_aborts_when_owner_renews() {
        let (region, disk, engine, clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let host: Name = "node9".parse().unwrap();

        let held = engine.acquire(&disk, &slot_for(&space, &host, 2)).unwrap();

        // The owner will renew (timestamp moves) after the prober's third read.
        let mut renewed = held;
        renewed.timestamp = clock.monotime() + 5;
        let raw = renewed.encode();
        let spy: DiskHandle = Arc::new(RenewingDisk {
            inner: MemDisk::new(&region),
            region: region.clone(),
            reads: AtomicU32::new(0),
            rewrite_after: 3,
            slot_offset: 512,
            renewed: raw.to_vec(),
        });

        let err = engine.acquire(&spy, &slot_for(&space, &host, 2)).unwrap_err();
        assert!(matches!(err, MoorError::DeltaBusy { host_id: 2, .. }));
    }

    #[test]
    fn renew_moves_timestamp_and_detects_hijack() {
        let (region, disk, engine, clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let host: Name = "node1".parse().unwrap();

        let leader = engine.acquire(&disk, &slot_for(&space, &host, 1)).unwrap();
        clock.advance(20);
        let renewed = engine.renew(&disk, &slot_for(&space, &host, 1), &leader).unwrap();
        assert!(renewed.timestamp > leader.timestamp);

        // Another host overwrites the slot; the next renewal must refuse.
        let mut foreign = renewed;
        foreign.owner_id = 7;
        foreign.owner_generation += 1;
        let raw = foreign.encode();
        region.patch(0, &raw);

        let err = engine.renew(&disk, &slot_for(&space, &host, 1), &renewed).unwrap_err();
        assert!(matches!(err, MoorError::DeltaBadLeader { host_id: 1 }));
    }

    #[test]
    fn scan_feeds_status_table() {
        let (_region, disk, engine, clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let host: Name = "node1".parse().unwrap();
        let table = HostStatusTable::new();

        let leader = engine.acquire(&disk, &slot_for(&space, &host, 1)).unwrap();
        engine.scan_all(&disk, &space, 8, IO_TO, &table);

        let hs = table.get(1).unwrap();
        assert_eq!(hs.timestamp, leader.timestamp);
        assert_eq!(hs.owner_generation, 1);
        assert_eq!(hs.io_timeout, IO_TO);
        let first_live = hs.last_live;
        assert_ne!(first_live, 0);

        // No change: last_check moves, last_live does not.
        clock.advance(20);
        engine.scan_all(&disk, &space, 8, IO_TO, &table);
        let hs = table.get(1).unwrap();
        assert!(hs.last_check > first_live);
        assert_eq!(hs.last_live, first_live);

        // Renewal: last_live follows.
        let renewed = engine.renew(&disk, &slot_for(&space, &host, 1), &leader).unwrap();
        clock.advance(1);
        engine.scan_all(&disk, &space, 8, IO_TO, &table);
        let hs = table.get(1).unwrap();
        assert_eq!(hs.timestamp, renewed.timestamp);
        assert!(hs.last_live > first_live);
    }

    #[test]
    fn free_slots_do_not_mark_live() {
        let (_region, disk, engine, _clock) = setup();
        let space: Name = SPACE.parse().unwrap();
        let table = HostStatusTable::new();
        engine.scan_all(&disk, &space, 8, IO_TO, &table);
        let hs = table.get(5).unwrap();
        assert_eq!(hs.last_live, 0);
        assert_eq!(hs.timestamp, LEASE_FREE);
    }
}
