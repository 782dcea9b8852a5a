//! Property checks: decode(encode(x)) == x and verify(encode(x)) == OK for
//! every record kind, and any single-byte corruption of a checksummed
//! region is caught.

use moorlock_ondisk::{
    LeaderExpect, LeaderRecord, PaxosDblock, RequestRecord, DBLOCK_SIZE, PAXOS_DISK_MAGIC,
    PAXOS_DISK_VERSION,
};
use moorlock_types::Name;
use proptest::prelude::*;

fn arb_name() -> impl Strategy<Value = Name> {
    "[a-z0-9-]{1,32}".prop_map(|s| s.parse().unwrap())
}

fn arb_leader() -> impl Strategy<Value = LeaderRecord> {
    (
        any::<u32>(),
        (1u64..10_000, 1u64..10_000, any::<u64>(), any::<u64>()),
        (any::<u64>(), any::<u64>(), arb_name(), arb_name()),
        (any::<u64>(), any::<u64>(), any::<u64>(), 1u32..3600),
    )
        .prop_map(
            |(flags, (num_hosts, max_hosts, owner_id, owner_generation), (lver, timestamp, space_name, resource_name), (write_id, write_generation, write_timestamp, io_timeout))| {
                LeaderRecord {
                    magic: PAXOS_DISK_MAGIC,
                    version: PAXOS_DISK_VERSION,
                    flags,
                    sector_size: 512,
                    num_hosts,
                    max_hosts,
                    owner_id,
                    owner_generation,
                    lver,
                    timestamp,
                    space_name,
                    resource_name,
                    write_id,
                    write_generation,
                    write_timestamp,
                    io_timeout,
                    checksum: 0,
                }
            },
        )
}

proptest! {
    #[test]
    fn leader_round_trip(mut lr in arb_leader()) {
        let raw = lr.encode();
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        prop_assert_eq!(back, lr);
        back.verify(computed, &LeaderExpect {
            magic: PAXOS_DISK_MAGIC,
            version: PAXOS_DISK_VERSION,
            space_name: None,
            resource_name: None,
            host_id: None,
        }).unwrap();
    }

    #[test]
    fn leader_detects_any_corruption(mut lr in arb_leader(), flip in 0usize..220, bit in 0u8..8) {
        let mut raw = lr.encode();
        raw[flip] ^= 1 << bit;
        let (back, computed) = LeaderRecord::decode(&raw).unwrap();
        prop_assert!(back.checksum != computed || back.magic != PAXOS_DISK_MAGIC);
    }

    #[test]
    fn dblock_round_trip(mbal in any::<u64>(), bal in any::<u64>(), inp in any::<u64>(),
                         inp2 in any::<u64>(), inp3 in any::<u64>(), lver in any::<u64>(),
                         flags in any::<u32>()) {
        let mut db = PaxosDblock { mbal, bal, inp, inp2, inp3, lver, flags, checksum: 0 };
        let raw = db.encode();
        prop_assert_eq!(raw.len(), DBLOCK_SIZE);
        let (back, computed) = PaxosDblock::decode(&raw).unwrap();
        prop_assert_eq!(back, db);
        back.verify(computed).unwrap();
    }

    #[test]
    fn request_round_trip(lver in any::<u64>(), force_mode in any::<u32>()) {
        let rr = RequestRecord { lver, force_mode, ..Default::default() };
        let back = RequestRecord::decode(&rr.encode()).unwrap();
        prop_assert_eq!(back, rr);
    }
}
