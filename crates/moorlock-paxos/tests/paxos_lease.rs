//! Engine-level paxos lease behavior on in-memory disks.

use std::sync::Arc;

use moorlock_delta::{DeltaEngine, DeltaSlot, HostStatusTable};
use moorlock_error::MoorError;
use moorlock_io::traits::DiskHandle;
use moorlock_io::{IoDispatcher, MemDisk, MemRegion};
use moorlock_ondisk::LeaderRecord;
use moorlock_paxos::{HostInfoSource, PaxosEngine, Token};
use moorlock_types::{
    AcquireFlags, Clock, HostId, HostStatus, Name, TestClock, Timeouts, TokenFlags, LEASE_FREE,
};

const IO_TO: u32 = 10;

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

struct Cluster {
    space_region: MemRegion,
    res_region: MemRegion,
    space: Name,
    resource: Name,
    clock: Arc<TestClock>,
}

impl Cluster {
    fn new() -> Self {
        let cluster = Self {
            space_region: MemRegion::new(1024 * 1024, 512),
            res_region: MemRegion::new(1024 * 1024, 512),
            space: "vg0".parse().unwrap(),
            resource: "lv0".parse().unwrap(),
            clock: Arc::new(TestClock::new(1000)),
        };
        let io = IoDispatcher::new();
        let clock: Arc<dyn Clock> = Arc::clone(&cluster.clock) as _;
        let delta = DeltaEngine::new(io, clock);
        let disk: DiskHandle = Arc::new(MemDisk::new(&cluster.space_region));
        delta.init(&disk, &cluster.space, 8, IO_TO).unwrap();
        cluster
    }

    fn join(&self, host_id: HostId) -> Host {
        let io = IoDispatcher::new();
        let clock: Arc<dyn Clock> = Arc::clone(&self.clock) as _;
        let delta = DeltaEngine::new(io.clone(), Arc::clone(&clock));
        let paxos = PaxosEngine::new(io, clock);

        let space_disk: DiskHandle = Arc::new(MemDisk::new(&self.space_region));
        let res_disk: DiskHandle = Arc::new(MemDisk::new(&self.res_region));

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
            disk: Arc::clone(&space_disk),
            table: HostStatusTable::new(),
        };
        delta.scan_all(&space_disk, &self.space, 8, IO_TO, &oracle.table);

        Host {
            token: Token {
                token_id: host_id,
                space_name: self.space,
                resource_name: self.resource,
                host_id,
                host_generation: slot_leader.owner_generation,
                io_timeout: IO_TO,
                disks: vec![res_disk],
                flags: TokenFlags::empty(),
            },
            oracle,
            delta,
            paxos,
            slot_leader,
        }
    }
}

impl Host {
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

    fn rescan(&self) {
        self.delta.scan_all(
            &self.oracle.disk,
            &self.token.space_name,
            8,
            IO_TO,
            &self.oracle.table,
        );
    }

    fn acquire(&mut self, flags: AcquireFlags) -> moorlock_error::Result<LeaderRecord> {
        // Split borrow: the engine call needs &mut token and &oracle.
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

fn init_resource(host: &Host) {
    host.paxos.init(&host.token, 8, 8, false).unwrap();
}

#[test]
fn free_acquire_then_release() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(leader.lver, 1);
    assert_eq!(leader.owner_id, 1);
    assert_eq!(leader.owner_generation, 1);
    assert_ne!(leader.timestamp, LEASE_FREE);
    assert_eq!(leader.write_id, 1);

    let freed = h1.paxos.release(&h1.token, Some(&leader)).unwrap();
    assert!(freed.is_free());
    assert_eq!(freed.lver, leader.lver);
}

#[test]
fn acquire_while_owner_live_fails_idlive() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    init_resource(&h1);

    h1.acquire(AcquireFlags::empty()).unwrap();

    // h2's renewal scans keep seeing h1 alive.
    h1.renew();
    h2.rescan();

    let err = h2.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(err, MoorError::AcquireIdLive { owner_id: 1, .. }));
}

#[test]
fn idempotent_reacquire_by_owner() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    init_resource(&h1);

    let first = h1.acquire(AcquireFlags::empty()).unwrap();
    let second = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(second.owner_id, 1);
    assert_eq!(second.lver, first.lver + 1);
}

#[test]
fn owner_death_reclaim() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    init_resource(&h1);

    let l1 = h1.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(l1.owner_id, 1);

    // h1 stops renewing; h2's scans see a frozen timestamp. The acquire
    // waits out the owner's dead interval (virtual time) and reclaims.
    h2.rescan();
    cluster.clock.advance(81);
    h2.rescan();

    let l2 = h2.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(l2.owner_id, 2);
    assert_eq!(l2.owner_generation, h2.token.host_generation);
    assert_eq!(l2.lver, 2);
}

#[test]
fn acquire_lver_mismatch() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();
    let Host {
        token,
        oracle,
        paxos,
        ..
    } = &mut h1;
    let err = paxos
        .acquire(token, oracle, AcquireFlags::empty(), Some(leader.lver + 5), None)
        .unwrap_err();
    assert!(matches!(err, MoorError::AcquireLver { .. }));
}

#[test]
fn owner_nowait_returns_retry() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    init_resource(&h1);

    h1.acquire(AcquireFlags::empty()).unwrap();

    // Two scans with no renewal in between: the owner looks neither live
    // (no timestamp movement) nor dead yet (well inside its interval).
    h2.rescan();
    cluster.clock.advance(5);
    h2.rescan();

    let err = h2.acquire(AcquireFlags::OWNER_NOWAIT).unwrap_err();
    assert!(matches!(err, MoorError::AcquireOwnedRetry { owner_id: 1, .. }));
}

#[test]
fn shared_holders_block_exclusive() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    let mut h3 = cluster.join(3);
    init_resource(&h1);

    let s1 = h1.acquire(AcquireFlags::SHARED).unwrap();
    assert_eq!(s1.owner_id, 1);
    let s2 = h2.acquire(AcquireFlags::SHARED).unwrap();
    assert_eq!(s2.lver, s1.lver + 1);

    // Leader is free while mode blocks guard the resource.
    let on_disk = h3.paxos.leader_read(&h3.token).unwrap();
    assert!(on_disk.is_free());

    h1.renew();
    h2.renew();
    h3.rescan();

    let err = h3.acquire(AcquireFlags::empty()).unwrap_err();
    assert!(matches!(err, MoorError::AcquireShared { live: 2 }));

    // Both release; exclusive then succeeds with a fresh lver.
    h1.paxos.release_shared(&h1.token).unwrap();
    h2.paxos.release_shared(&h2.token).unwrap();
    let l3 = h3.acquire(AcquireFlags::empty()).unwrap();
    assert_eq!(l3.owner_id, 3);
    assert!(l3.lver > s2.lver);
}

#[test]
fn release_skips_leader_write_when_not_writer() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    init_resource(&h1);

    let leader = h1.acquire(AcquireFlags::empty()).unwrap();

    // Pretend host 2 committed us: rewrite the leader with write_id 2.
    let mut foreign = leader;
    foreign.write_id = 2;
    foreign.write_generation = 1;
    let raw = foreign.encode();
    cluster.res_region.patch(0, &raw);

    let out = h1.paxos.release(&h1.token, Some(&foreign)).unwrap();
    assert_eq!(out.write_id, 2);

    // The leader still shows us as owner; only our dblock was marked.
    let on_disk = h1.paxos.leader_read(&h1.token).unwrap();
    assert_eq!(on_disk.owner_id, 1);
    assert!(!on_disk.is_free());
}

#[test]
fn force_acquire_takes_over() {
    let cluster = Cluster::new();
    let mut h1 = cluster.join(1);
    let mut h2 = cluster.join(2);
    init_resource(&h1);

    h1.acquire(AcquireFlags::empty()).unwrap();
    h1.renew();
    h2.rescan();

    let leader = h2.acquire(AcquireFlags::FORCE).unwrap();
    assert_eq!(leader.owner_id, 2);
    assert_eq!(leader.lver, 2);
}

#[test]
fn request_record_round_trip() {
    let cluster = Cluster::new();
    let h1 = cluster.join(1);
    init_resource(&h1);

    let mut rr = h1.paxos.request_read(&h1.token).unwrap();
    assert_eq!(rr.lver, 0);
    rr.lver = 9;
    rr.force_mode = 1;
    h1.paxos.request_write(&h1.token, &rr).unwrap();
    let back = h1.paxos.request_read(&h1.token).unwrap();
    assert_eq!(back, rr);
}
