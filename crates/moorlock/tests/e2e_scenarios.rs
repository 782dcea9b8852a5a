//! End-to-end multi-host scenarios over shared in-memory storage.
//!
//! Each simulated host gets its own engines and host-status table but
//! opens the same backing regions, the way real hosts open the same
//! block device.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use moorlock::delta::{DeltaEngine, DeltaSlot, HostStatusTable};
use moorlock::io::traits::DiskHandle;
use moorlock::io::{IoDispatcher, MemDisk, MemRegion, SectorDisk};
use moorlock::ondisk::{LeaderRecord, PaxosDblock, PAXOS_DISK_MAGIC, PAXOS_DISK_VERSION};
use moorlock::types::{
    AcquireFlags, Clock, HostId, HostStatus, Name, TestClock, Timeouts, TokenFlags, LEASE_FREE,
};
use moorlock::{HostInfoSource, MoorError, PaxosEngine, Token};

const IO_TO: u32 = 10;
const NUM_HOSTS: u64 = 8;

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Oracle {
    space: Name,
    disk: DiskHandle,
    table: HostStatusTable,
}

impl HostInfoSource for Oracle {
    fn host_status(&self, space_name: &Name, host_id: HostId) -> Option<HostStatus> {
        (*space_name == self.space)
            .then(|| self.table.get(host_id))
            .flatten()
    }

    fn lockspace_disk(&self, space_name: &Name) -> Option<DiskHandle> {
        (*space_name == self.space).then(|| Arc::clone(&self.disk))
    }
}

struct Host {
    token: Token,
    oracle: Oracle,
    delta: DeltaEngine,
    paxos: PaxosEngine,
    slot_leader: LeaderRecord,
}

impl Host {
    fn rescan(&self) {
        self.delta.scan_all(
            &self.oracle.disk,
            &self.token.space_name,
            NUM_HOSTS,
            IO_TO,
            &self.oracle.table,
        );
    }

    fn renew(&mut self) {
        let host_name: Name = format!("node{}", self.token.host_id).parse().unwrap();
        let slot = DeltaSlot {
            space_name: &self.token.space_name,
            host_id: self.token.host_id,
            host_name: &host_name,
            timeouts: Timeouts::new(IO_TO),
        };
        self.slot_leader = self
            .delta
            .renew(&self.oracle.disk, &slot, &self.slot_leader)
            .unwrap();
    }

    fn acquire(&mut self, flags: AcquireFlags) -> moorlock::Result<LeaderRecord> {
        let Host {
            token,
            oracle,
            paxos,
            ..
        } = self;
        paxos
            .acquire(token, oracle, flags, None, None)
            .map(|(leader, _)| leader)
    }
}

struct Cluster {
    space_region: MemRegion,
    res_regions: Vec<MemRegion>,
    space: Name,
    resource: Name,
    clock: Arc<TestClock>,
}

impl Cluster {
    fn new(num_res_disks: usize) -> Self {
        let cluster = Self {
            space_region: MemRegion::new(1024 * 1024, 512),
            res_regions: (0..num_res_disks)
                .map(|_| MemRegion::new(1024 * 1024, 512))
                .collect(),
            space: "pool1".parse().unwrap(),
            resource: "vol1".parse().unwrap(),
            clock: Arc::new(TestClock::new(2000)),
        };
        let io = IoDispatcher::new();
        let clock: Arc<dyn Clock> = Arc::clone(&cluster.clock) as _;
        let delta = DeltaEngine::new(io, clock);
        let disk: DiskHandle = Arc::new(MemDisk::new(&cluster.space_region));
        delta.init(&disk, &cluster.space, NUM_HOSTS, IO_TO).unwrap();
        cluster
    }

    fn join(&self, host_id: HostId) -> Host {
        let io = IoDispatcher::new();
        let clock: Arc<dyn Clock> = Arc::clone(&self.clock) as _;
        let delta = DeltaEngine::new(io.clone(), Arc::clone(&clock));
        let paxos = PaxosEngine::new(io, clock);

        let space_disk: DiskHandle = Arc::new(MemDisk::new(&self.space_region));
        let res_disks: Vec<DiskHandle> = self
            .res_regions
            .iter()
            .map(|r| Arc::new(MemDisk::new(r)) as DiskHandle)
            .collect();

        let host_name: Name = format!("node{host_id}").parse().unwrap();
        let slot = DeltaSlot {
            space_name: &self.space,
            host_id,
            host_name: &host_name,
            timeouts: Timeouts::new(IO_TO),
        };
        let slot_leader = delta.acquire(&space_disk, &slot).unwrap();

        let oracle = Oracle {
            space: self.space,
            disk: space_disk,
            table: HostStatusTable::new(),
        };
        delta.scan_all(&oracle.disk, &self.space, NUM_HOSTS, IO_TO, &oracle.table);

        Host {
            token: Token {
                token_id: host_id,
                space_name: self.space,
                resource_name: self.resource,
                host_id,
                host_generation: slot_leader.owner_generation,
                io_timeout: IO_TO,
                disks: res_disks,
                flags: TokenFlags::empty(),
            },
            oracle,
            delta,
            paxos,
            slot_leader,
        }
    }

    fn init_resource(&self, host: &Host) {
        host.paxos
            .init(&host.token, NUM_HOSTS, NUM_HOSTS, false)
            .unwrap();
    }
}

/// Free acquire and contention against a live owner.
#[test]
fn scenario_free_acquire() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    cluster.init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(leader.lver, 1);
    assert_eq!(leader.owner_id, 1);
    assert_eq!(leader.owner_generation, 1);
    assert!(leader.timestamp > 0);

    h1.renew();
    h2.rescan();
    let err = h2.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(err, MoorError::AcquireIdLive { owner_id: 1, .. }));
}

/// The owner stops renewing; after its dead interval another host
/// reclaims with the next lease version.
#[test]
fn scenario_owner_death_reclaim() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    cluster.init_resource(&h1);

    let l1 = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!((l1.lver, l1.owner_id), (1, 1));

    // h1 goes silent at t0; h2 scans, waits out host_dead_seconds.
    h2.rescan();
    cluster.clock.advance(81);
    h2.rescan();

    let l2 = h2.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(l2.lver, 2);
    assert_eq!(l2.owner_id, 2);
    assert_eq!(l2.owner_generation, 1);
}

/// Deterministic ballot collision: a competing higher mbal appears
/// between our phase-1 write and read, then the competitor commits. The
/// loser aborts on mbal, retries, and finds the committed owner.
#[test]
fn scenario_concurrent_ballot_loser_sees_owner() {
    init_tracing();
    let cluster = Cluster::new(1);
    let h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    cluster.init_resource(&h1);

    // h1's phase-1/2 dblock and its committed leader, staged for injection.
    let mut rival_dblock = PaxosDblock {
        mbal: 9,
        bal: 9,
        inp: 1,
        inp2: 1,
        inp3: 2222,
        lver: 1,
        flags: 0,
        checksum: 0,
    };
    let rival_dblock_raw = rival_dblock.encode();
    let mut rival_leader = LeaderRecord {
        magic: PAXOS_DISK_MAGIC,
        version: PAXOS_DISK_VERSION,
        flags: 0,
        sector_size: 512,
        num_hosts: NUM_HOSTS,
        max_hosts: NUM_HOSTS,
        owner_id: 1,
        owner_generation: 1,
        lver: 1,
        timestamp: 2222,
        space_name: cluster.space,
        resource_name: cluster.resource,
        write_id: 1,
        write_generation: 1,
        write_timestamp: 2222,
        io_timeout: IO_TO,
        checksum: 0,
    };
    let rival_leader_raw = rival_leader.encode();

    // After h2's first dblock write lands, the rival's dblock (sector 2)
    // and committed leader (sector 0) appear.
    struct RacingDisk {
        inner: MemDisk,
        region: MemRegion,
        writes: AtomicU32,
        dblock: Vec<u8>,
        leader: Vec<u8>,
    }

    impl SectorDisk for RacingDisk {
        fn sector_size(&self) -> u32 {
            self.inner.sector_size()
        }

        fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            self.inner.pread(offset, buf)
        }

        fn pwrite(&self, offset: u64, data: &[u8]) -> io::Result<()> {
            let result = self.inner.pwrite(offset, data);
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                self.region.patch(2 * 512, &self.dblock);
                self.region.patch(0, &self.leader);
            }
            result
        }

        fn describe(&self) -> String {
            "racing".into()
        }
    }

    h2.token.disks = vec![Arc::new(RacingDisk {
        inner: MemDisk::new(&cluster.res_regions[0]),
        region: cluster.res_regions[0].clone(),
        writes: AtomicU32::new(0),
        dblock: rival_dblock_raw.to_vec(),
        leader: rival_leader_raw.to_vec(),
    }) as DiskHandle];

    let err = h2.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(
        err,
        MoorError::AcquireOwned {
            owner_id: 1,
            owner_generation: 1
        }
    ));
}

/// Two hosts really racing. With virtual time, a loser that waits out the
/// frozen owner's dead interval may reclaim afterwards, so the invariant
/// is sequential: every success commits a distinct, increasing lver, and
/// the final leader belongs to the last winner.
#[test]
fn scenario_concurrent_ballot_race() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    cluster.init_resource(&h1);

    let t1 = std::thread::spawn(move || h1.acquire(AcquireFlags::empty()));
    let t2 = std::thread::spawn(move || h2.acquire(AcquireFlags::empty()));
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let mut winners: Vec<&LeaderRecord> = Vec::new();
    for r in [&r1, &r2] {
        match r {
            Ok(leader) => {
                assert!(!leader.is_free());
                winners.push(leader);
            }
            Err(
                MoorError::AcquireOwned { .. }
                | MoorError::AcquireIdLive { .. }
                | MoorError::AcquireOther { .. }
                | MoorError::AcquireOwnedRetry { .. },
            ) => {}
            Err(other) => panic!("loser returned unexpected error: {other}"),
        }
    }
    assert!(!winners.is_empty(), "at least one host must win");
    if winners.len() == 2 {
        assert_ne!(
            winners[0].lver, winners[1].lver,
            "two commits of the same lver would break mutual exclusion"
        );
    }

    let last = winners.iter().max_by_key(|l| l.lver).unwrap();
    let observer = cluster.join(3);
    let on_disk = observer.paxos.leader_read(&observer.token).unwrap();
    assert_eq!(on_disk.owner_id, last.owner_id);
    assert_eq!(on_disk.lver, last.lver);
}

/// Shared holders coexist and block exclusive acquires until released.
#[test]
fn scenario_shared_then_exclusive() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    let mut h3 = cluster.join(3);
    cluster.init_resource(&h1);

    h1.acquire(AcquireFlags::SHARED).unwrap();
    let s2 = h2.acquire(AcquireFlags::SHARED).unwrap();

    h1.renew();
    h2.renew();
    h3.rescan();
    let err = h3.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(err, MoorError::AcquireShared { live: 2 }));

    h1.paxos.release_shared(&h1.token).unwrap();
    h2.paxos.release_shared(&h2.token).unwrap();

    let l3 = h3.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(l3.owner_id, 3);
    assert!(l3.lver > s2.lver);
}

/// A host that crashed between ballot and leader write can be committed
/// as owner by another host; its release must leave the foreign-written
/// leader alone.
#[test]
fn scenario_writer_not_owner() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    cluster.init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();

    let mut foreign = leader;
    foreign.write_id = 2;
    foreign.write_generation = 1;
    foreign.write_timestamp = leader.write_timestamp + 1;
    let raw = foreign.encode();
    cluster.res_regions[0].patch(0, &raw);

    h1.paxos.release(&h1.token, Some(&foreign)).unwrap();

    // Leader untouched; our dblock carries the released flag.
    let on_disk = h1.paxos.leader_read(&h1.token).unwrap();
    assert_eq!(on_disk.owner_id, 1);
    assert!(!on_disk.is_free());

    let raw_dblock = cluster.res_regions[0].snapshot(2 * 512, 56);
    let (db, _) = PaxosDblock::decode(&raw_dblock).unwrap();
    assert_eq!(
        db.flags & moorlock::types::DblockFlags::RELEASED.bits(),
        moorlock::types::DblockFlags::RELEASED.bits()
    );
}

/// Three disks, one dead: everything works on 2-of-3. Two dead: majority
/// lost, operations fail.
#[test]
fn scenario_disk_majority() {
    init_tracing();
    let cluster = Cluster::new(3);
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    cluster.init_resource(&h1);

    cluster.res_regions[2].set_offline(true);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(leader.lver, 1);
    h1.paxos.release(&h1.token, Some(&leader)).unwrap();

    let leader = h2.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!((leader.lver, leader.owner_id), (2, 2));
    h2.paxos.release(&h2.token, Some(&leader)).unwrap();

    // Second disk dies: no quorum.
    cluster.res_regions[1].set_offline(true);
    let err = h1.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(
        err,
        MoorError::DblockWrite
            | MoorError::DblockRead
            | MoorError::LeaderWrite
            | MoorError::LeaderRead
    ));
}

/// Release safety: a released leader keeps its lver and reads back free.
#[test]
fn scenario_release_preserves_lver() {
    init_tracing();
    let cluster = Cluster::new(1);
    let mut h1 = cluster.join(1);
    cluster.init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();
    let freed = h1.paxos.release(&h1.token, Some(&leader)).unwrap();
    assert_eq!(freed.timestamp, LEASE_FREE);
    assert_eq!(freed.lver, leader.lver);

    let read_back = h1.paxos.leader_read(&h1.token).unwrap();
    assert_eq!(read_back, freed);
}
