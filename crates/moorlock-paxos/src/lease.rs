//! Acquire, release, and init of paxos leases.

use std::sync::Arc;
use std::time::Duration;

use moorlock_delta::DeltaEngine;
use moorlock_error::{MoorError, Result};
use moorlock_io::{AlignedBuf, IoDispatcher};
use moorlock_ondisk::{
    LeaderRecord, PaxosDblock, RequestRecord, LEADER_SIZE, PAXOS_DISK_CLEAR, PAXOS_DISK_MAGIC,
    PAXOS_DISK_VERSION, REQUEST_SIZE,
};
use moorlock_types::{
    AcquireFlags, Clock, HostId, LeaderFlags, LeaseVersion, TokenFlags, Timeouts, DEFAULT_MAX_HOSTS,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::ballot::{self, BallotContext, BallotOutcome};
use crate::{DiskIo, HostInfoSource, Token};

/// Result category of the owner-liveness wait.
enum Wait {
    /// The owner is free, dead, or reincarnated; run the ballot.
    Run,
    /// The leader changed while waiting; restart from the lease read.
    Restart,
}

/// The paxos lease engine.
pub struct PaxosEngine {
    io: IoDispatcher,
    clock: Arc<dyn Clock>,
}

impl PaxosEngine {
    #[must_use]
    pub fn new(io: IoDispatcher, clock: Arc<dyn Clock>) -> Self {
        Self { io, clock }
    }

    fn dio<'a>(&'a self, token: &'a Token) -> DiskIo<'a> {
        DiskIo {
            io: &self.io,
            token,
        }
    }

    /// Majority-consistent leader record.
    pub fn leader_read(&self, token: &Token) -> Result<LeaderRecord> {
        self.dio(token).read_leader()
    }

    /// Acquire the lease named by `token`, exclusively or shared.
    pub fn acquire(
        &self,
        token: &mut Token,
        oracle: &dyn HostInfoSource,
        flags: AcquireFlags,
        acquire_lver: Option<LeaseVersion>,
        new_num_hosts: Option<u64>,
    ) -> Result<(LeaderRecord, PaxosDblock)> {
        if flags.contains(AcquireFlags::SHARED) {
            self.acquire_shared(token, oracle, flags, acquire_lver, new_num_hosts)
        } else {
            self.acquire_inner(token, oracle, flags, acquire_lver, new_num_hosts, true)
        }
    }

    /// Shared acquire: win the lease exclusively, plant our SHARED mode
    /// block, then free the leader so other shared holders can do the
    /// same. The mode block (bound to our delta-lease generation) is what
    /// keeps exclusive acquirers out.
    fn acquire_shared(
        &self,
        token: &mut Token,
        oracle: &dyn HostInfoSource,
        flags: AcquireFlags,
        acquire_lver: Option<LeaseVersion>,
        new_num_hosts: Option<u64>,
    ) -> Result<(LeaderRecord, PaxosDblock)> {
        let (leader, dblock) =
            self.acquire_inner(token, oracle, flags, acquire_lver, new_num_hosts, false)?;

        let mut db = dblock;
        {
            let dio = self.dio(token);
            let mut ok = 0usize;
            for disk in &token.disks {
                if dio
                    .write_dblock(disk, token.host_id, &mut db, Some(token.host_generation))
                    .is_ok()
                {
                    ok += 1;
                }
            }
            if !crate::majority_disks(token.disks.len(), ok) {
                return Err(MoorError::DblockWrite);
            }
        }

        token.flags.insert(TokenFlags::DBLOCK_KEEPS_SHARED);
        let released = self.release(token, Some(&leader));
        token.flags.remove(TokenFlags::DBLOCK_KEEPS_SHARED);
        released?;

        info!(token = ?token, lver = leader.lver, "shared hold established");
        Ok((leader, db))
    }

    /// Drop a shared hold by clearing our dblock sector (mode block
    /// included).
    pub fn release_shared(&self, token: &Token) -> Result<()> {
        self.erase_dblock(token, token.host_id)
    }

    fn acquire_inner(
        &self,
        token: &mut Token,
        oracle: &dyn HostInfoSource,
        flags: AcquireFlags,
        acquire_lver: Option<LeaseVersion>,
        new_num_hosts: Option<u64>,
        check_shared: bool,
    ) -> Result<(LeaderRecord, PaxosDblock)> {
        debug!(token = ?token, ?flags, "paxos acquire begin");

        'restart: loop {
            let (cur_leader, max_mbal) = {
                let view = self.dio(token).lease_read()?;
                (view.leader, view.max_mbal)
            };

            let mut copy_cur_leader = false;
            let mut need_wait = true;

            if flags.contains(AcquireFlags::FORCE) {
                copy_cur_leader = true;
                need_wait = false;
            } else {
                if let Some(required) = acquire_lver {
                    if cur_leader.lver != required {
                        return Err(MoorError::AcquireLver {
                            requested: required,
                            actual: cur_leader.lver,
                        });
                    }
                }
                if cur_leader.is_free() {
                    debug!(lver = cur_leader.lver, "leader free");
                    copy_cur_leader = true;
                    need_wait = false;
                } else if cur_leader.owner_id == token.host_id
                    && cur_leader.owner_generation <= token.host_generation
                {
                    // Already ours, or ours from a previous incarnation
                    // that never released.
                    debug!(
                        generation = cur_leader.owner_generation,
                        "owner is already local"
                    );
                    copy_cur_leader = true;
                    need_wait = false;
                }
            }

            if need_wait {
                match self.wait_for_owner_death(token, oracle, &cur_leader, flags)? {
                    Wait::Run => {}
                    Wait::Restart => continue 'restart,
                }
            }

            // A new leader version is one past what we read at the top;
            // re-reading here would be wrong because another host may have
            // committed us as owner of exactly next_lver in the meantime.
            let next_lver = cur_leader.lver + 1;
            let mut our_mbal = if max_mbal == 0 {
                token.host_id
            } else {
                (max_mbal - max_mbal % cur_leader.max_hosts)
                    + cur_leader.max_hosts
                    + token.host_id
            };

            loop {
                let tmp_leader = if copy_cur_leader {
                    copy_cur_leader = false;
                    cur_leader
                } else {
                    self.dio(token).read_leader()?
                };

                if tmp_leader.lver == next_lver {
                    // Someone committed next_lver already; it may be us.
                    return if tmp_leader.owner_id == token.host_id
                        && tmp_leader.owner_generation == token.host_generation
                    {
                        warn!(
                            lver = next_lver,
                            writer = tmp_leader.write_id,
                            "another host committed us as owner"
                        );
                        Ok((tmp_leader, PaxosDblock::default()))
                    } else {
                        Err(MoorError::AcquireOwned {
                            owner_id: tmp_leader.owner_id,
                            owner_generation: tmp_leader.owner_generation,
                        })
                    };
                }
                if tmp_leader.lver > next_lver || tmp_leader != cur_leader {
                    debug!(
                        lver = next_lver,
                        disk_lver = tmp_leader.lver,
                        "leader moved; restarting acquire"
                    );
                    continue 'restart;
                }

                let outcome = {
                    let dio = self.dio(token);
                    ballot::run_ballot(
                        &BallotContext {
                            dio: &dio,
                            oracle,
                            clock: &*self.clock,
                            num_hosts: cur_leader.num_hosts,
                            check_shared,
                        },
                        next_lver,
                        our_mbal,
                    )
                };

                match outcome {
                    BallotOutcome::Committed(dblock) => {
                        let mut new_leader = cur_leader;
                        new_leader.lver = dblock.lver;
                        new_leader.owner_id = dblock.inp;
                        new_leader.owner_generation = dblock.inp2;
                        new_leader.timestamp = dblock.inp3;
                        new_leader.write_id = token.host_id;
                        new_leader.write_generation = token.host_generation;
                        new_leader.write_timestamp = self.clock.monotime();
                        if let Some(n) = new_num_hosts {
                            new_leader.num_hosts = n;
                        }
                        if new_leader.owner_id == token.host_id {
                            // SHORT_HOLD is a hint about *our* intent; when
                            // committing another host we cannot know theirs.
                            if flags.contains(AcquireFlags::SHARED) {
                                new_leader.flags |= LeaderFlags::SHORT_HOLD.bits();
                            } else {
                                new_leader.flags &= !LeaderFlags::SHORT_HOLD.bits();
                            }
                        }

                        let write_result = self.dio(token).write_new_leader(&mut new_leader);
                        if let Err(e) = write_result {
                            token.flags.insert(TokenFlags::RETRACT_PAXOS);
                            warn!(lver = next_lver, error = %e, "leader commit failed");
                            return Err(e);
                        }

                        if new_leader.owner_id != token.host_id {
                            warn!(
                                lver = next_lver,
                                owner = new_leader.owner_id,
                                "ballot committed another host as owner"
                            );
                            return Err(MoorError::AcquireOther {
                                owner_id: new_leader.owner_id,
                                owner_generation: new_leader.owner_generation,
                            });
                        }

                        info!(
                            token = ?token,
                            lver = next_lver,
                            "lease acquired"
                        );
                        return Ok((new_leader, dblock));
                    }
                    BallotOutcome::Failed { error, retract } => {
                        if retract {
                            token.flags.insert(TokenFlags::RETRACT_PAXOS);
                        }
                        if error.is_ballot_abort() {
                            let backoff = rand::thread_rng().gen_range(0..1000u64);
                            debug!(lver = next_lver, backoff_us = backoff, "ballot retry");
                            self.clock.sleep(Duration::from_micros(backoff));
                            our_mbal += cur_leader.max_hosts;
                            continue;
                        }
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Wait for evidence that the current owner is alive or dead, reading
    /// its delta lease once per second.
    fn wait_for_owner_death(
        &self,
        token: &Token,
        oracle: &dyn HostInfoSource,
        cur_leader: &LeaderRecord,
        flags: AcquireFlags,
    ) -> Result<Wait> {
        let space_disk = oracle
            .lockspace_disk(&cur_leader.space_name)
            .ok_or(MoorError::AcquireLockspace(cur_leader.space_name))?;
        let delta = DeltaEngine::new(self.io.clone(), Arc::clone(&self.clock));

        let hs = oracle
            .host_status(&cur_leader.space_name, cur_leader.owner_id)
            .filter(|hs| {
                hs.last_check != 0
                    && hs.last_live != 0
                    && hs.owner_id == cur_leader.owner_id
                    && hs.owner_generation == cur_leader.owner_generation
            });
        let (wait_start, mut last_timestamp) = match hs {
            Some(hs) => (hs.last_live, hs.timestamp),
            None => (self.clock.monotime(), 0),
        };

        debug!(
            owner = cur_leader.owner_id,
            generation = cur_leader.owner_generation,
            wait_start,
            "waiting on owner's delta lease"
        );

        loop {
            let host_id_leader = delta.read_slot(
                &space_disk,
                Some(&cur_leader.space_name),
                cur_leader.owner_id,
                token.io_timeout,
            )?;

            // A host_id cannot be freed or re-acquired in less than a dead
            // interval, so either observation proves the owner is gone.
            if host_id_leader.is_free() {
                debug!(owner = cur_leader.owner_id, "owner delta lease free");
                return Ok(Wait::Run);
            }
            if host_id_leader.owner_id != cur_leader.owner_id
                || host_id_leader.owner_generation > cur_leader.owner_generation
            {
                debug!(
                    owner = cur_leader.owner_id,
                    slot_owner = host_id_leader.owner_id,
                    slot_generation = host_id_leader.owner_generation,
                    "owner's slot reassigned"
                );
                return Ok(Wait::Run);
            }

            let mut skip_live_check = false;
            if last_timestamp == 0 {
                last_timestamp = host_id_leader.timestamp;
                skip_live_check = true;
            }

            if !skip_live_check {
                let renewal_seen = hs.is_some_and(|h| h.live_at_last_check());
                if host_id_leader.timestamp != last_timestamp || renewal_seen {
                    // Owner is alive. One escape: a live owner may have
                    // released while a third host's ballot clobbered the
                    // leader; its released dblock tells us so.
                    if cur_leader.write_id != cur_leader.owner_id {
                        if let Ok(db) =
                            self.dio(token).read_dblock(&token.disks[0], cur_leader.owner_id)
                        {
                            if db.flags & moorlock_types::DblockFlags::RELEASED.bits() != 0 {
                                warn!(
                                    owner = cur_leader.owner_id,
                                    writer = cur_leader.write_id,
                                    "live owner's dblock released; proceeding"
                                );
                                return Ok(Wait::Run);
                            }
                        }
                    }
                    return Err(MoorError::AcquireIdLive {
                        owner_id: cur_leader.owner_id,
                        owner_generation: cur_leader.owner_generation,
                    });
                }

                let other_io = hs
                    .map(|h| h.io_timeout)
                    .filter(|&t| t != 0)
                    .unwrap_or(host_id_leader.io_timeout);
                let other_dead = u64::from(Timeouts::other_host_dead_seconds(other_io));
                let now = self.clock.monotime();
                if now.saturating_sub(wait_start) > other_dead {
                    info!(
                        owner = cur_leader.owner_id,
                        waited = now - wait_start,
                        "owner declared dead"
                    );
                    return Ok(Wait::Run);
                }

                if flags.contains(AcquireFlags::OWNER_NOWAIT) {
                    return Err(MoorError::AcquireOwnedRetry {
                        owner_id: cur_leader.owner_id,
                        owner_generation: cur_leader.owner_generation,
                    });
                }
            }

            self.clock.sleep(Duration::from_secs(1));

            let tmp_leader = self.dio(token).read_leader()?;
            if tmp_leader != *cur_leader {
                return Ok(Wait::Restart);
            }
        }
    }

    /// Release the lease.
    ///
    /// `last` is the leader the caller believes it holds; `None` means
    /// "make sure we are not the owner" (the retract path after a partial
    /// ballot).
    pub fn release(&self, token: &Token, last: Option<&LeaderRecord>) -> Result<LeaderRecord> {
        {
            let dio = self.dio(token);
            if let Err(e) = ballot::mark_released(&dio) {
                warn!(token = ?token, error = %e, "release: dblock mark failed");
            }
        }

        let leader = self.dio(token).read_leader()?;
        let last = last.unwrap_or(&leader);

        // If another host wrote the leader that made us owner, it must be
        // allowed to manage that record; our released dblock is enough for
        // other hosts to reclaim. Writing the leader here could clobber a
        // newer one.
        if leader.write_id != token.host_id {
            warn!(
                token = ?token,
                writer = leader.write_id,
                "release skips leader write"
            );
            return Ok(leader);
        }

        if leader.lver != last.lver {
            return Err(MoorError::ReleaseLver {
                held: last.lver,
                disk: leader.lver,
            });
        }
        if leader.is_free() || leader.owner_id != token.host_id
            || leader.owner_generation != token.host_generation
            || leader != *last
        {
            return Err(MoorError::ReleaseOwner {
                owner_id: leader.owner_id,
                owner_generation: leader.owner_generation,
            });
        }

        let mut next = leader;
        next.timestamp = moorlock_types::LEASE_FREE;
        next.write_id = token.host_id;
        next.write_generation = token.host_generation;
        next.write_timestamp = self.clock.monotime();
        next.flags &= !LeaderFlags::SHORT_HOLD.bits();

        self.dio(token).write_new_leader(&mut next)?;
        info!(token = ?token, lver = next.lver, "lease released");
        Ok(next)
    }

    /// Zero a host's dblock sector on every disk (majority required).
    pub fn erase_dblock(&self, token: &Token, host_id: HostId) -> Result<()> {
        let dio = self.dio(token);
        let mut zero = PaxosDblock::default();
        let mut ok = 0usize;
        for disk in &token.disks {
            if dio.write_dblock(disk, host_id, &mut zero, None).is_ok() {
                ok += 1;
            }
        }
        if crate::majority_disks(token.disks.len(), ok) {
            Ok(())
        } else {
            Err(MoorError::DblockWrite)
        }
    }

    /// Initialize (or clear) the lease area on every disk.
    pub fn init(
        &self,
        token: &Token,
        num_hosts: u64,
        max_hosts: u64,
        write_clear: bool,
    ) -> Result<()> {
        let max_hosts = if max_hosts == 0 {
            DEFAULT_MAX_HOSTS
        } else {
            max_hosts
        };
        let num_hosts = if num_hosts == 0 || num_hosts > max_hosts {
            max_hosts
        } else {
            num_hosts
        };

        let ss = usize::try_from(token.sector_size()).expect("sector size fits usize");
        let len = usize::try_from(token.align_size()).expect("align size fits usize");

        let mut leader = LeaderRecord {
            magic: if write_clear {
                PAXOS_DISK_CLEAR
            } else {
                PAXOS_DISK_MAGIC
            },
            version: PAXOS_DISK_VERSION,
            sector_size: token.sector_size(),
            num_hosts,
            max_hosts,
            timestamp: moorlock_types::LEASE_FREE,
            space_name: token.space_name,
            resource_name: token.resource_name,
            write_timestamp: if write_clear { self.clock.monotime() } else { 0 },
            io_timeout: token.io_timeout,
            ..Default::default()
        };
        let leader_raw = leader.encode();
        let request_raw = RequestRecord::default().encode();

        for disk in &token.disks {
            let mut buf = AlignedBuf::zeroed(len);
            buf[..LEADER_SIZE].copy_from_slice(&leader_raw);
            buf[ss..ss + REQUEST_SIZE].copy_from_slice(&request_raw);
            self.io.write_iobuf(disk, 0, buf, token.io_timeout)?;
        }

        info!(token = ?token, num_hosts, max_hosts, write_clear, "lease area initialized");
        Ok(())
    }

    /// Read the request record.
    pub fn request_read(&self, token: &Token) -> Result<RequestRecord> {
        let buf = self
            .io
            .read_sectors(&token.disks[0], 1, 1, token.io_timeout)?;
        RequestRecord::decode(&buf)
    }

    /// Write the request record (first disk carries it).
    pub fn request_write(&self, token: &Token, record: &RequestRecord) -> Result<()> {
        self.io
            .write_sector(&token.disks[0], 1, &record.encode(), token.io_timeout)
    }

    /// Convert a shared hold to exclusive without giving up the shared
    /// guarantee while the ballot runs: dblock writes carry the mode block
    /// along until the exclusive hold is committed.
    pub fn convert_shared_to_exclusive(
        &self,
        token: &mut Token,
        oracle: &dyn HostInfoSource,
    ) -> Result<(LeaderRecord, PaxosDblock)> {
        token.flags.insert(TokenFlags::DBLOCK_KEEPS_SHARED);
        let result = self.acquire_inner(token, oracle, AcquireFlags::empty(), None, None, true);
        token.flags.remove(TokenFlags::DBLOCK_KEEPS_SHARED);
        let (leader, mut dblock) = result?;

        // Exclusive hold is committed; drop our shared marker by rewriting
        // the dblock without it.
        let dio = self.dio(token);
        let mut ok = 0usize;
        for disk in &token.disks {
            if dio
                .write_dblock(disk, token.host_id, &mut dblock, None)
                .is_ok()
            {
                ok += 1;
            }
        }
        if !crate::majority_disks(token.disks.len(), ok) {
            return Err(MoorError::DblockWrite);
        }
        Ok((leader, dblock))
    }
}
