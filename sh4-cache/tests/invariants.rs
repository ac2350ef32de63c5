//! Property tests for the cache's structural invariants under random
//! compile / invalidate / fault / unlink / clear sequences.

mod common;

use std::collections::HashSet;

use common::{default_code, frontend, registry_guard, Machine, MockBackend, BASE};
use jit_backend::{AccessKind, Exception, ThreadState};
use proptest::prelude::*;
use sh4_cache::CodeCache;
use sh4_frontend::{BlockFlags, Sh4Frontend};

/// Dispatch window for the property tests.
const ADDR_MASK: u32 = 0xffff;
const SLOTS: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    Compile(u8),
    Remove(u8),
    Fault(u8),
    Unlink,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..SLOTS as u8).prop_map(Op::Compile),
        2 => (0..SLOTS as u8).prop_map(Op::Remove),
        2 => (0..SLOTS as u8).prop_map(Op::Fault),
        1 => Just(Op::Unlink),
        1 => Just(Op::Clear),
    ]
}

fn slot_addr(i: u8) -> u32 {
    BASE + i as u32 * 0x40
}

type TestCache = CodeCache<MockBackend, Sh4Frontend>;

/// Structural invariants: dispatch coherence, index agreement, host
/// range disjointness, guest address uniqueness.
fn check_invariants(cache: &TestCache, linked: &HashSet<u32>) {
    let mut guest_addrs = HashSet::new();
    let mut host_ranges: Vec<(usize, usize)> = Vec::new();

    for block in cache.blocks() {
        // Dispatch slot is the block's entry iff linked, else default.
        let entry = cache.dispatch_entry(block.guest_addr);
        if linked.contains(&block.guest_addr) {
            assert_eq!(entry, block.host_addr, "linked slot points elsewhere");
        } else {
            assert_eq!(entry, cache.default_code(), "unlinked slot not default");
        }

        // Forward and reverse indexes agree on this block.
        let fwd = cache.get_block(block.guest_addr).expect("missing forward");
        assert_eq!(fwd.host_addr, block.host_addr);
        let rev = cache
            .get_block_by_host(block.host_addr as usize)
            .expect("missing reverse");
        assert_eq!(rev.guest_addr, block.guest_addr);

        assert!(guest_addrs.insert(block.guest_addr), "duplicate guest addr");
        host_ranges
            .push((block.host_addr as usize, block.host_addr as usize + block.host_size));
    }

    host_ranges.sort();
    for pair in host_ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping host ranges");
    }
}

fn run_ops(ops: &[Op]) {
    let _registry = registry_guard();

    let mut m = Machine::new();
    for i in 0..SLOTS as u8 {
        m.load_program(slot_addr(i), &[0x000b, 0x0009]); // rts; nop
    }

    let mut cache = CodeCache::new(
        frontend(&mut m),
        MockBackend::new(1 << 20, 64),
        default_code(),
        ADDR_MASK,
    );

    // Model of which guest addresses are currently linked.
    let mut linked: HashSet<u32> = HashSet::new();

    for op in ops {
        match op {
            Op::Compile(i) => {
                let addr = slot_addr(*i);
                // The trampoline only compiles on a miss.
                if cache.dispatch_entry(addr) == cache.default_code() {
                    cache.compile(addr, BlockFlags::FASTMEM);
                    linked.insert(addr);
                }
            }
            Op::Remove(i) => {
                let addr = slot_addr(*i);
                cache.remove_blocks(addr + 2);
                linked.remove(&addr);
            }
            Op::Fault(i) => {
                let addr = slot_addr(*i);
                if let Some(block) = cache.get_block(addr) {
                    let mut ex = Exception {
                        access: AccessKind::Read,
                        fault_addr: 0,
                        state: ThreadState {
                            r: [0; 16],
                            pc: block.host_addr as u64,
                        },
                    };
                    assert!(cache.handle_exception(&mut ex));
                    assert!(cache
                        .get_block(addr)
                        .unwrap()
                        .flags
                        .contains(BlockFlags::SLOWMEM));
                    linked.remove(&addr);
                }
            }
            Op::Unlink => {
                cache.unlink_blocks();
                linked.clear();
            }
            Op::Clear => {
                cache.clear_blocks();
                linked.clear();
                assert_eq!(cache.num_blocks(), 0);
            }
        }
        check_invariants(&cache, &linked);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cache_invariants_hold_under_random_lifecycles(
        ops in proptest::collection::vec(op_strategy(), 1..80)
    ) {
        run_ops(&ops);
    }
}

#[test]
fn stale_slowmem_flag_survives_recompilation() {
    let _registry = registry_guard();

    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        MockBackend::new(1 << 20, 64),
        default_code(),
        ADDR_MASK,
    );

    cache.compile(BASE, BlockFlags::FASTMEM);
    let host = cache.get_block(BASE).unwrap().host_addr as u64;
    let mut ex = Exception {
        access: AccessKind::Write,
        fault_addr: 0,
        state: ThreadState { r: [0; 16], pc: host },
    };
    assert!(cache.handle_exception(&mut ex));

    cache.compile(BASE, BlockFlags::FASTMEM);
    let block = cache.get_block(BASE).unwrap();
    assert!(block.flags.contains(BlockFlags::SLOWMEM));
    assert!(block.flags.contains(BlockFlags::FASTMEM));
}
