//! SH-4 code cache: the translation pipeline's lifecycle owner.
//!
//! Maps guest PCs to compiled blocks through a direct-mapped dispatch
//! table, keeps forward (guest address) and reverse (host address)
//! ordered indexes over a block slab, and cooperates with the backend
//! to downgrade fastmem blocks when they fault.

mod block;

pub use block::{Block, BlockId};

use std::collections::BTreeMap;
use std::ffi::c_void;

use jit_backend::{
    exception_handler_add, exception_handler_remove, Backend, Exception,
    HandlerHandle,
};
use jit_ir::passes::{
    DeadCodeEliminationPass, LoadStoreEliminationPass, PassRunner,
    RegisterAllocationPass,
};
use jit_ir::IrBuilder;
use sh4_frontend::{BlockFlags, Frontend};

use block::BlockSlab;

/// Default guest address mask: the 16 MiB RAM window.
pub const DEFAULT_ADDR_MASK: u32 = 0x00ff_ffff;

/// The SH-4 code cache.
///
/// Single-threaded: one thread executes translated code and is the
/// only caller of every operation here. The fastmem exception handler
/// runs synchronously on that same thread at the fault point.
pub struct CodeCache<B: Backend, F: Frontend> {
    /// Direct-mapped host entry pointers, indexed by
    /// `block_offset(guest_addr)`. Every slot is either the default
    /// trampoline or the `host_addr` of a linked block.
    dispatch: Vec<*const u8>,
    default_code: *const u8,
    addr_mask: u32,

    blocks: BlockSlab,
    /// guest_addr -> block, ordered for range invalidation.
    forward: BTreeMap<u32, BlockId>,
    /// host_addr -> block, ordered for fault attribution.
    reverse: BTreeMap<usize, BlockId>,

    frontend: F,
    backend: B,
    passes: PassRunner,
    /// IR arena, recycled between compilations.
    ir: IrBuilder,

    eh_handle: Option<HandlerHandle>,
}

impl<B: Backend, F: Frontend> CodeCache<B, F> {
    /// Build a cache and install its fastmem exception hook.
    ///
    /// `default_code` is the default trampoline installed in every
    /// dispatch slot; `addr_mask` fixes the dispatch table size at
    /// `(addr_mask >> 1) + 1` slots. Boxed so the registered handler
    /// pointer stays stable.
    pub fn new(
        frontend: F,
        backend: B,
        default_code: *const u8,
        addr_mask: u32,
    ) -> Box<Self> {
        let mut passes = PassRunner::new();
        passes.add_pass(Box::new(LoadStoreEliminationPass));
        passes.add_pass(Box::new(DeadCodeEliminationPass));
        passes.add_pass(Box::new(RegisterAllocationPass::new(
            backend.registers(),
        )));

        let slots = (addr_mask as usize >> 1) + 1;
        let mut cache = Box::new(Self {
            dispatch: vec![default_code; slots],
            default_code,
            addr_mask,
            blocks: BlockSlab::default(),
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
            frontend,
            backend,
            passes,
            ir: IrBuilder::new(),
            eh_handle: None,
        });

        let user = &mut *cache as *mut Self as *mut c_void;
        cache.eh_handle =
            Some(exception_handler_add(user, Self::handle_exception_cb));
        cache
    }

    /// # Safety
    /// `user` is the boxed cache registered in `new`; the box keeps
    /// the address stable until `Drop` removes the handler.
    unsafe fn handle_exception_cb(
        user: *mut c_void,
        ex: &mut Exception,
    ) -> bool {
        (*(user as *mut Self)).handle_exception(ex)
    }

    #[inline]
    fn block_offset(&self, guest_addr: u32) -> usize {
        ((guest_addr & self.addr_mask) >> 1) as usize
    }

    /// Host entry currently installed for `guest_addr`.
    pub fn dispatch_entry(&self, guest_addr: u32) -> *const u8 {
        self.dispatch[self.block_offset(guest_addr)]
    }

    pub fn default_code(&self) -> *const u8 {
        self.default_code
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().map(|(_, b)| b)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Compile the block starting at `guest_addr` and link it into the
    /// dispatch table. Called from the default trampoline on a miss.
    pub fn compile(&mut self, guest_addr: u32, flags: BlockFlags) -> *const u8 {
        let offset = self.block_offset(guest_addr);
        assert!(
            self.dispatch[offset] == self.default_code,
            "compile for already-linked slot at {guest_addr:#010x}"
        );

        // A block unlinked by a fastmem fault is still in the indexes;
        // inherit its flags (the SLOWMEM downgrade in particular) and
        // finish removing it now.
        let mut flags = flags;
        if let Some(&stale) = self.forward.get(&guest_addr) {
            flags |= self.blocks.get(stale).flags;
            self.remove_block(stale);
        }

        self.ir.reset();
        let info = self.frontend.translate(guest_addr, flags, &mut self.ir);
        self.passes.run(&mut self.ir);

        let (host_addr, host_size) = match self.backend.assemble(&self.ir) {
            Some(emitted) => emitted,
            None => {
                log::info!("assembler overflow, resetting block cache");
                self.clear_blocks();
                self.backend
                    .assemble(&self.ir)
                    .expect("backend assembler buffer overflow")
            }
        };

        let id = self.blocks.insert(Block {
            guest_addr,
            guest_size: info.guest_size,
            num_cycles: info.num_cycles,
            num_instrs: info.num_instrs,
            host_addr,
            host_size,
            flags: info.flags,
        });
        self.forward.insert(guest_addr, id);
        self.reverse.insert(host_addr as usize, id);
        self.dispatch[offset] = host_addr;

        host_addr
    }

    /// Exact lookup by starting guest address.
    pub fn get_block(&self, guest_addr: u32) -> Option<&Block> {
        let id = *self.forward.get(&guest_addr)?;
        Some(self.blocks.get(id))
    }

    /// Attribute a host code address to the block containing it.
    pub fn get_block_by_host(&self, host_addr: usize) -> Option<&Block> {
        let id = self.lookup_block_reverse(host_addr)?;
        Some(self.blocks.get(id))
    }

    /// Remove every block whose guest footprint contains `guest_addr`.
    /// Used when the guest writes over previously-translated code.
    pub fn remove_blocks(&mut self, guest_addr: u32) {
        loop {
            let covering = self
                .forward
                .range(..=guest_addr)
                .next_back()
                .map(|(&start, &id)| (start, id));
            match covering {
                Some((start, id))
                    if guest_addr
                        < start + self.blocks.get(id).guest_size =>
                {
                    self.remove_block(id);
                }
                _ => break,
            }
        }
    }

    /// Reset every dispatch slot to the default trampoline without
    /// touching the block set. Safe while translated code is running:
    /// subsequent dispatches miss and recompile, code already on the
    /// stack completes naturally.
    pub fn unlink_blocks(&mut self) {
        let Self {
            forward,
            dispatch,
            default_code,
            addr_mask,
            ..
        } = self;
        for &addr in forward.keys() {
            dispatch[((addr & *addr_mask) >> 1) as usize] = *default_code;
        }
    }

    /// Unlink and remove every block, then reclaim the backend's code
    /// buffer. Only legal when no translated frame is live on the call
    /// stack.
    pub fn clear_blocks(&mut self) {
        let ids: Vec<BlockId> = self.blocks.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.remove_block(id);
        }
        self.backend.reset();
    }

    /// Fastmem exception hook.
    ///
    /// Declines faults outside any block; otherwise delegates to the
    /// backend and, on success, unlinks the block and flags it for
    /// slowmem recompilation. The block stays in the indexes; it is
    /// still executing and may fault again.
    pub fn handle_exception(&mut self, ex: &mut Exception) -> bool {
        let Some(id) = self.lookup_block_reverse(ex.pc()) else {
            return false;
        };

        if !self.backend.handle_fastmem(ex) {
            return false;
        }

        self.unlink_block(id);
        let block = self.blocks.get_mut(id);
        block.flags |= BlockFlags::SLOWMEM;
        log::debug!(
            "fastmem fault: block {:#010x} downgraded to slowmem",
            block.guest_addr
        );
        true
    }

    /// Largest block with `host_addr <= pc`, if `pc` falls inside it.
    fn lookup_block_reverse(&self, pc: usize) -> Option<BlockId> {
        let (&host, &id) = self.reverse.range(..=pc).next_back()?;
        let block = self.blocks.get(id);
        (pc < host + block.host_size).then_some(id)
    }

    fn unlink_block(&mut self, id: BlockId) {
        let offset = self.block_offset(self.blocks.get(id).guest_addr);
        self.dispatch[offset] = self.default_code;
    }

    fn remove_block(&mut self, id: BlockId) {
        self.unlink_block(id);
        let block = self.blocks.remove(id);
        self.forward.remove(&block.guest_addr);
        self.reverse.remove(&(block.host_addr as usize));
    }
}

impl<B: Backend, F: Frontend> Drop for CodeCache<B, F> {
    fn drop(&mut self) {
        if let Some(handle) = self.eh_handle.take() {
            exception_handler_remove(handle);
        }
    }
}
