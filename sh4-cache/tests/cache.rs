mod common;

use common::{
    default_code, frontend, pc_offset, registry_guard, Machine, MockBackend,
    ADDR_MASK, BASE,
};
use jit_backend::{
    exception_handler_dispatch, AccessKind, Exception, ThreadState, X64Backend,
};
use sh4_cache::CodeCache;
use sh4_frontend::BlockFlags;

fn x64_backend(machine: &mut Machine) -> X64Backend {
    X64Backend::new(machine.memif(), pc_offset(), 1 << 20).unwrap()
}

fn read_exception(pc: usize) -> Exception {
    Exception {
        access: AccessKind::Read,
        fault_addr: 0,
        state: ThreadState {
            r: [0; 16],
            pc: pc as u64,
        },
    }
}

/// Scan a host region for the one patchable access site.
fn fault_block(
    cache: &mut CodeCache<X64Backend, sh4_frontend::Sh4Frontend>,
    host: usize,
    size: usize,
) -> Option<usize> {
    for pc in host..host + size {
        let mut ex = read_exception(pc);
        if cache.handle_exception(&mut ex) {
            assert!(ex.state.pc > pc as u64, "fault pc not advanced");
            return Some(pc);
        }
    }
    None
}

#[test]
fn trivial_block_compiles_and_links() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]); // rts; nop

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    let entry = cache.compile(BASE, BlockFlags::FASTMEM);
    assert!(!entry.is_null());

    let block = cache.get_block(BASE).unwrap();
    assert_eq!(block.guest_size, 4);
    assert_eq!(block.num_instrs, 2);
    assert_eq!(block.num_cycles, 3);
    assert!(block.flags.contains(BlockFlags::FASTMEM));
    assert_eq!(block.host_addr, entry);
    assert!(block.host_size > 0);

    assert_eq!(cache.dispatch_entry(BASE), entry);
    let by_host = cache.get_block_by_host(entry as usize).unwrap();
    assert_eq!(by_host.guest_addr, BASE);
}

#[test]
fn fastmem_fault_downgrades_and_recompiles_slowmem() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    // mov.l @r1, r0; rts; nop
    m.load_program(BASE, &[0x6012, 0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    let entry = cache.compile(BASE, BlockFlags::FASTMEM);
    let (host, size) = {
        let block = cache.get_block(BASE).unwrap();
        (block.host_addr as usize, block.host_size)
    };
    assert_eq!(cache.dispatch_entry(BASE), entry);

    // Fault on the inlined load.
    let fault_pc = fault_block(&mut cache, host, size).expect("no fastmem site");

    // Unlinked and downgraded, but still in both indexes.
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
    let block = cache.get_block(BASE).unwrap();
    assert!(block.flags.contains(BlockFlags::SLOWMEM));
    assert_eq!(cache.get_block_by_host(host).unwrap().guest_addr, BASE);

    // A second fault on the same block is a harmless repeat.
    let mut ex = read_exception(fault_pc);
    assert!(cache.handle_exception(&mut ex));
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
    assert_eq!(cache.num_blocks(), 1);

    // The next dispatch recompiles without fastmem.
    let entry2 = cache.compile(BASE, BlockFlags::FASTMEM);
    assert_eq!(cache.num_blocks(), 1);
    assert_eq!(cache.dispatch_entry(BASE), entry2);
    let block = cache.get_block(BASE).unwrap();
    assert!(block.flags.contains(BlockFlags::SLOWMEM));

    // No patchable sites remain anywhere in the new block.
    let (host2, size2) = (block.host_addr as usize, block.host_size);
    assert!(fault_block(&mut cache, host2, size2).is_none());
}

#[test]
fn guest_store_invalidates_covering_block_only() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    let a = BASE + 0x100;
    let b = BASE + 0x200;
    // mov #1, r1; mov #2, r2; rts; nop (8 bytes)
    m.load_program(a, &[0xe101, 0xe202, 0x000b, 0x0009]);
    // rts; nop (4 bytes)
    m.load_program(b, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    cache.compile(a, BlockFlags::FASTMEM);
    let entry_b = cache.compile(b, BlockFlags::FASTMEM);
    assert_eq!(cache.get_block(a).unwrap().guest_size, 8);

    cache.remove_blocks(a + 4);

    assert!(cache.get_block(a).is_none());
    assert_eq!(cache.dispatch_entry(a), cache.default_code());
    assert_eq!(cache.num_blocks(), 1);
    assert!(cache.get_block(b).is_some());
    assert_eq!(cache.dispatch_entry(b), entry_b);
}

#[test]
fn remove_blocks_misses_leave_cache_untouched() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );
    cache.compile(BASE, BlockFlags::FASTMEM);

    // Past the block's footprint.
    cache.remove_blocks(BASE + 4);
    assert_eq!(cache.num_blocks(), 1);
    // Before any block.
    cache.remove_blocks(BASE - 2);
    assert_eq!(cache.num_blocks(), 1);
}

#[test]
fn compile_then_remove_restores_empty_cache() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    cache.compile(BASE, BlockFlags::FASTMEM);
    cache.remove_blocks(BASE);

    assert_eq!(cache.num_blocks(), 0);
    assert!(cache.get_block(BASE).is_none());
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
}

#[test]
fn backend_overflow_clears_and_retries() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    for i in 0..3 {
        m.load_program(BASE + i * 0x100, &[0x000b, 0x0009]);
    }

    // Room for two mock blocks; the third overflows.
    let mut cache = CodeCache::new(
        frontend(&mut m),
        MockBackend::new(250, 100),
        default_code(),
        ADDR_MASK,
    );

    cache.compile(BASE, BlockFlags::FASTMEM);
    cache.compile(BASE + 0x100, BlockFlags::FASTMEM);
    assert_eq!(cache.num_blocks(), 2);

    let entry = cache.compile(BASE + 0x200, BlockFlags::FASTMEM);

    // The overflow cleared everything; only the new block survives.
    assert_eq!(cache.num_blocks(), 1);
    assert!(cache.get_block(BASE).is_none());
    assert!(cache.get_block(BASE + 0x100).is_none());
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
    assert_eq!(cache.dispatch_entry(BASE + 0x200), entry);
    assert_eq!(cache.get_block(BASE + 0x200).unwrap().host_addr, entry);
}

#[test]
#[should_panic(expected = "backend assembler buffer overflow")]
fn backend_overflow_twice_is_fatal() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);

    // Too small for even one block.
    let mut cache = CodeCache::new(
        frontend(&mut m),
        MockBackend::new(50, 100),
        default_code(),
        ADDR_MASK,
    );
    cache.compile(BASE, BlockFlags::FASTMEM);
}

#[test]
#[should_panic(expected = "already-linked")]
fn compile_on_linked_slot_is_a_caller_bug() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );
    cache.compile(BASE, BlockFlags::FASTMEM);
    cache.compile(BASE, BlockFlags::FASTMEM);
}

#[test]
fn unlink_keeps_blocks_clear_removes_them() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x000b, 0x0009]);
    m.load_program(BASE + 0x100, &[0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    let first = cache.compile(BASE, BlockFlags::FASTMEM);
    cache.compile(BASE + 0x100, BlockFlags::FASTMEM);

    cache.unlink_blocks();

    // Every dispatch slot misses again, but the block set (and the
    // emitted code regions) survive for frames still on the stack.
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
    assert_eq!(cache.dispatch_entry(BASE + 0x100), cache.default_code());
    assert_eq!(cache.num_blocks(), 2);
    assert!(cache.get_block_by_host(first as usize).is_some());

    cache.clear_blocks();
    assert_eq!(cache.num_blocks(), 0);

    // After the backend reset, emission restarts at the same offset.
    let again = cache.compile(BASE, BlockFlags::FASTMEM);
    assert_eq!(again, first);
}

#[test]
fn invalid_opcode_block_is_two_bytes() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0xfffd, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );

    cache.compile(BASE, BlockFlags::FASTMEM);
    let block = cache.get_block(BASE).unwrap();
    assert_eq!(block.guest_size, 2);
    assert_eq!(block.num_instrs, 1);
}

#[test]
fn registered_handler_routes_faults_to_the_cache() {
    let _registry = registry_guard();
    let mut m = Machine::new();
    m.load_program(BASE, &[0x6012, 0x000b, 0x0009]);

    let mut cache = CodeCache::new(
        frontend(&mut m),
        x64_backend(&mut m),
        default_code(),
        ADDR_MASK,
    );
    cache.compile(BASE, BlockFlags::FASTMEM);
    let (host, size) = {
        let block = cache.get_block(BASE).unwrap();
        (block.host_addr as usize, block.host_size)
    };

    // Feed faults through the process-level registry instead of the
    // cache method; exactly the inlined load should be claimed.
    let mut handled = false;
    for pc in host..host + size {
        let mut ex = read_exception(pc);
        if exception_handler_dispatch(&mut ex) {
            handled = true;
            break;
        }
    }
    assert!(handled);
    assert_eq!(cache.dispatch_entry(BASE), cache.default_code());
    assert!(cache
        .get_block(BASE)
        .unwrap()
        .flags
        .contains(BlockFlags::SLOWMEM));

    // Faults nowhere near translated code are declined.
    let mut foreign = read_exception(0x10);
    assert!(!cache.handle_exception(&mut foreign));
}
