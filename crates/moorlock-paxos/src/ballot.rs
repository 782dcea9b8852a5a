//! The two-phase disk-Paxos ballot.
//!
//! Phase 1: write our dblock (mbal only) to a majority, then read every
//! host's dblock from a majority; any dblock with a higher lver or mbal
//! aborts the ballot. Phase 2: adopt the proposal with the highest bal
//! seen (or our own if none), write, re-read, same abort rules. A ballot
//! that aborts after a phase-2 write may still be committed by another
//! host picking up our values, so the caller must retract ownership on
//! release.

use moorlock_error::{MoorError, Result};
use moorlock_ondisk::{
    dblock_sector, ModeBlock, PaxosDblock, DBLOCK_SIZE, MBLOCK_OFFSET, MBLOCK_SIZE,
};
use moorlock_types::{DblockFlags, HostId, Timeouts};
use tracing::{debug, warn};

use crate::{majority_disks, DiskIo, HostInfoSource};

/// Outcome of one ballot attempt.
pub(crate) enum BallotOutcome {
    Committed(PaxosDblock),
    Failed {
        error: MoorError,
        /// True when a phase-2 write may have landed: another host can
        /// still commit our values, so release must retract.
        retract: bool,
    },
}

struct AreaScan {
    dblocks: Vec<(HostId, PaxosDblock, u32)>,
    shared: Vec<(HostId, ModeBlock)>,
}

fn scan_area(buf: &[u8], sector_size: usize, num_hosts: u64) -> Result<AreaScan> {
    let mut dblocks = Vec::with_capacity(usize::try_from(num_hosts).unwrap_or(0));
    let mut shared = Vec::new();
    for q in 0..num_hosts {
        let host_id = q + 1;
        let start = usize::try_from(dblock_sector(host_id)).expect("sector index") * sector_size;
        let (bk, computed) = PaxosDblock::decode(&buf[start..start + DBLOCK_SIZE])?;
        let mb =
            ModeBlock::decode(&buf[start + MBLOCK_OFFSET..start + MBLOCK_OFFSET + MBLOCK_SIZE])?;
        if mb.is_shared() {
            shared.push((host_id, mb));
        }
        dblocks.push((host_id, bk, computed));
    }
    Ok(AreaScan { dblocks, shared })
}

/// Decide whether a SHARED mode block belongs to a host that may still be
/// using the resource.
fn shared_is_live(
    ctx: &BallotContext<'_>,
    host_id: HostId,
    mb: &ModeBlock,
) -> bool {
    let Some(hs) = ctx
        .oracle
        .host_status(&ctx.dio.token.space_name, host_id)
    else {
        // No view of that host: cannot prove it dead.
        return true;
    };
    if hs.owner_generation != mb.generation {
        // The marker is from a previous incarnation of that host.
        return false;
    }
    if hs.timestamp == moorlock_types::LEASE_FREE {
        return false;
    }
    if hs.live_at_last_check() {
        return true;
    }
    if hs.last_live == 0 {
        return true;
    }
    let now = ctx.clock.monotime();
    now.saturating_sub(hs.last_live) <= u64::from(Timeouts::other_host_dead_seconds(hs.io_timeout))
}

pub(crate) struct BallotContext<'a> {
    pub dio: &'a DiskIo<'a>,
    pub oracle: &'a dyn HostInfoSource,
    pub clock: &'a dyn moorlock_types::Clock,
    pub num_hosts: u64,
    /// Exclusive acquires must not proceed past live shared holders;
    /// shared acquires coexist with them.
    pub check_shared: bool,
}

/// Run one ballot for `next_lver` with prepare number `our_mbal`.
pub(crate) fn run_ballot(ctx: &BallotContext<'_>, next_lver: u64, our_mbal: u64) -> BallotOutcome {
    let token = ctx.dio.token;
    let num_disks = token.disks.len();
    let ss = usize::try_from(token.sector_size()).expect("sector size fits usize");
    let sector_count = usize::try_from(moorlock_ondisk::lease_sector_count(ctx.num_hosts))
        .expect("sector count fits usize");
    let keep_shared = token
        .flags
        .contains(moorlock_types::TokenFlags::DBLOCK_KEEPS_SHARED)
        .then_some(token.host_generation);

    let mut dblock = PaxosDblock {
        mbal: our_mbal,
        lver: next_lver,
        ..Default::default()
    };

    debug!(lver = next_lver, mbal = our_mbal, "ballot phase1 write");

    // Phase 1 write: announce our ballot number.
    let mut num_writes = 0usize;
    for disk in &token.disks {
        if ctx
            .dio
            .write_dblock(disk, token.host_id, &mut dblock, keep_shared)
            .is_ok()
        {
            num_writes += 1;
        }
    }
    if !majority_disks(num_disks, num_writes) {
        warn!(lver = next_lver, "ballot phase1 dblock write lost majority");
        return BallotOutcome::Failed {
            error: MoorError::DblockWrite,
            retract: false,
        };
    }

    // Phase 1 read: look for competing ballots and pick up any proposal we
    // are obliged to carry forward.
    let mut bk_max = PaxosDblock::default();
    let mut num_reads = 0usize;
    let mut shared_seen: Vec<(HostId, ModeBlock)> = Vec::new();
    for disk in &token.disks {
        let buf = match ctx
            .dio
            .io
            .read_iobuf(disk, 0, sector_count * ss, token.io_timeout)
        {
            Ok(buf) => buf,
            Err(_) => continue,
        };
        let scan = match scan_area(&buf, ss, ctx.num_hosts) {
            Ok(scan) => scan,
            Err(_) => continue,
        };
        num_reads += 1;

        for &(host_id, mb) in &scan.shared {
            if host_id != token.host_id && !shared_seen.iter().any(|&(h, _)| h == host_id) {
                shared_seen.push((host_id, mb));
            }
        }

        for &(host_id, bk, computed) in &scan.dblocks {
            if bk.verify(computed).is_err() {
                continue;
            }
            if host_id == token.host_id {
                continue;
            }
            if bk.lver < dblock.lver {
                continue;
            }
            if bk.lver > dblock.lver {
                warn!(
                    lver = next_lver,
                    host = host_id,
                    their_lver = bk.lver,
                    "ballot abort1: larger lver"
                );
                return BallotOutcome::Failed {
                    error: MoorError::DblockLver {
                        ours: dblock.lver,
                        theirs: bk.lver,
                    },
                    retract: false,
                };
            }
            if bk.mbal > dblock.mbal {
                warn!(
                    lver = next_lver,
                    host = host_id,
                    their_mbal = bk.mbal,
                    "ballot abort1: larger mbal"
                );
                return BallotOutcome::Failed {
                    error: MoorError::DblockMbal {
                        ours: dblock.mbal,
                        theirs: bk.mbal,
                    },
                    retract: false,
                };
            }
            if bk.inp == 0 {
                continue;
            }
            if bk.bal == 0 {
                warn!(lver = next_lver, host = host_id, "dblock has inp but zero bal");
                continue;
            }
            if bk.bal > bk_max.bal {
                bk_max = bk;
            }
        }
    }
    if !majority_disks(num_disks, num_reads) {
        return BallotOutcome::Failed {
            error: MoorError::DblockRead,
            retract: false,
        };
    }
    if ctx.check_shared {
        let live = shared_seen
            .iter()
            .filter(|(host_id, mb)| shared_is_live(ctx, *host_id, mb))
            .count();
        if live > 0 {
            debug!(lver = next_lver, live, "ballot blocked by shared holders");
            return BallotOutcome::Failed {
                error: MoorError::AcquireShared { live },
                retract: false,
            };
        }
    }

    // Choose the value to commit: the highest-bal proposal seen, else our
    // own owner triple.
    if bk_max.inp != 0 {
        dblock.inp = bk_max.inp;
        dblock.inp2 = bk_max.inp2;
        dblock.inp3 = bk_max.inp3;
        debug!(
            lver = next_lver,
            inp = bk_max.inp,
            inp2 = bk_max.inp2,
            "ballot adopts prior proposal"
        );
    } else {
        dblock.inp = token.host_id;
        dblock.inp2 = token.host_generation;
        dblock.inp3 = ctx.clock.monotime();
    }
    dblock.bal = dblock.mbal;

    debug!(
        lver = next_lver,
        bal = dblock.bal,
        inp = dblock.inp,
        "ballot phase2 write"
    );

    // Phase 2 write: propose.
    let mut phase2_writes = 0usize;
    for disk in &token.disks {
        if ctx
            .dio
            .write_dblock(disk, token.host_id, &mut dblock, keep_shared)
            .is_ok()
        {
            phase2_writes += 1;
        }
    }
    if !majority_disks(num_disks, phase2_writes) {
        return BallotOutcome::Failed {
            error: MoorError::DblockWrite,
            retract: phase2_writes > 0,
        };
    }

    // Phase 2 read: confirm no competing ballot overtook us.
    let mut num_reads = 0usize;
    for disk in &token.disks {
        let buf = match ctx
            .dio
            .io
            .read_iobuf(disk, 0, sector_count * ss, token.io_timeout)
        {
            Ok(buf) => buf,
            Err(_) => continue,
        };
        let scan = match scan_area(&buf, ss, ctx.num_hosts) {
            Ok(scan) => scan,
            Err(_) => continue,
        };
        num_reads += 1;

        for &(host_id, bk, computed) in &scan.dblocks {
            if bk.verify(computed).is_err() || host_id == token.host_id {
                continue;
            }
            if bk.lver < dblock.lver {
                continue;
            }
            if bk.lver > dblock.lver {
                warn!(lver = next_lver, host = host_id, "ballot abort2: larger lver");
                return BallotOutcome::Failed {
                    error: MoorError::DblockLver {
                        ours: dblock.lver,
                        theirs: bk.lver,
                    },
                    retract: true,
                };
            }
            if bk.mbal > dblock.mbal {
                warn!(lver = next_lver, host = host_id, "ballot abort2: larger mbal");
                return BallotOutcome::Failed {
                    error: MoorError::DblockMbal {
                        ours: dblock.mbal,
                        theirs: bk.mbal,
                    },
                    retract: true,
                };
            }
        }
    }
    if !majority_disks(num_disks, num_reads) {
        return BallotOutcome::Failed {
            error: MoorError::DblockRead,
            retract: true,
        };
    }

    BallotOutcome::Committed(dblock)
}

/// Write a dblock marked released, so other hosts can skip the owner-death
/// wait when the leader writer was not the owner.
pub(crate) fn mark_released(dio: &DiskIo<'_>) -> Result<()> {
    let token = dio.token;
    let mut current = PaxosDblock::default();
    for disk in &token.disks {
        if let Ok(db) = dio.read_dblock(disk, token.host_id) {
            current = db;
            break;
        }
    }
    current.flags |= DblockFlags::RELEASED.bits();
    let keep_shared = token
        .flags
        .contains(moorlock_types::TokenFlags::DBLOCK_KEEPS_SHARED)
        .then_some(token.host_generation);
    let mut ok = 0usize;
    for disk in &token.disks {
        if dio
            .write_dblock(disk, token.host_id, &mut current, keep_shared)
            .is_ok()
        {
            ok += 1;
        }
    }
    if majority_disks(token.disks.len(), ok) {
        Ok(())
    } else {
        Err(MoorError::DblockWrite)
    }
}
