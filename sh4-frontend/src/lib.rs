//! SH-4 frontend: instruction dictionary and guest-to-IR translation.
//!
//! `analyze` delimits a translation unit from a starting PC; `translate`
//! replays the same walk and drives the per-opcode emit callbacks. The
//! two passes agree on the guest footprint by construction, so the IR
//! builder always sees a known, finite extent.

pub mod context;
pub mod disasm;
pub mod fallback;
pub mod guest;
pub mod opdef;
mod translate;

pub use context::{Sh4Context, EXC_ILLEGAL_INSTR, PR_MASK, SR_T, SZ_MASK};
pub use guest::Sh4Guest;
pub use opdef::{Opdef, OpdefFlags};

use jit_ir::{IrBuilder, Opcode};

/// Translation-time block flags.
///
/// `FASTMEM` is requested by the caller; the cache ORs in `SLOWMEM`
/// after a fault, and `SLOWMEM` dominates. The FP mode bits are
/// sampled from the guest FPSCR at translation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags(u32);

impl BlockFlags {
    pub const NONE: BlockFlags = BlockFlags(0);
    pub const FASTMEM: BlockFlags = BlockFlags(1 << 0);
    pub const SLOWMEM: BlockFlags = BlockFlags(1 << 1);
    pub const DOUBLE_PR: BlockFlags = BlockFlags(1 << 2);
    pub const DOUBLE_SZ: BlockFlags = BlockFlags(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether emitters may inline raw guest memory accesses.
    pub const fn fastmem(self) -> bool {
        self.contains(Self::FASTMEM) && !self.contains(Self::SLOWMEM)
    }
}

impl std::ops::BitOr for BlockFlags {
    type Output = BlockFlags;

    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BlockFlags {
    fn bitor_assign(&mut self, rhs: BlockFlags) {
        self.0 |= rhs.0;
    }
}

/// Result of delimiting (and translating) one block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInfo {
    /// Guest bytes covered (always a multiple of 2).
    pub guest_size: u32,
    /// Static cycle cost, for the scheduler.
    pub num_cycles: u32,
    /// Guest instructions covered, delay slots included.
    pub num_instrs: u32,
    /// Effective flags after FPSCR sampling (translate only).
    pub flags: BlockFlags,
}

/// Frontend capability set consumed by the code cache.
pub trait Frontend {
    /// Walk from `guest_addr` and delimit one translation unit.
    fn analyze(&self, guest_addr: u32) -> BlockInfo;

    /// Build IR for the unit starting at `guest_addr`.
    fn translate(
        &mut self,
        guest_addr: u32,
        flags: BlockFlags,
        ir: &mut IrBuilder,
    ) -> BlockInfo;

    /// Decode one instruction word.
    fn lookup_op(&self, word: u16) -> &'static Opdef;

    /// Log the disassembly of a guest range.
    fn dump(&self, guest_addr: u32, guest_size: u32);
}

/// The production SH-4 frontend.
pub struct Sh4Frontend {
    guest: Sh4Guest,
}

impl Sh4Frontend {
    pub fn new(guest: Sh4Guest) -> Self {
        Self { guest }
    }

    pub fn guest(&self) -> &Sh4Guest {
        &self.guest
    }
}

impl Frontend for Sh4Frontend {
    fn analyze(&self, guest_addr: u32) -> BlockInfo {
        let mut info = BlockInfo::default();
        let mut addr = guest_addr;

        loop {
            let data = self.guest.fetch16(addr);
            let def = opdef::lookup(data);
            let mut invalid = def.flags.contains(OpdefFlags::INVALID);

            addr += 2;
            info.guest_size += 2;
            info.num_cycles += def.cycles;
            info.num_instrs += 1;

            if def.flags.contains(OpdefFlags::DELAYED) {
                let delay_data = self.guest.fetch16(addr);
                let delay_def = opdef::lookup(delay_data);
                invalid |= delay_def.flags.contains(OpdefFlags::INVALID);

                addr += 2;
                info.guest_size += 2;
                info.num_cycles += delay_def.cycles;
                info.num_instrs += 1;

                // Delay slots can't have another delay slot.
                assert!(
                    !delay_def.flags.contains(OpdefFlags::DELAYED),
                    "delay slot at {addr:#010x} has a delay slot"
                );
            }

            if invalid {
                break;
            }

            // Stop on branches. FPSCR writes invalidate the sampled FP
            // modes and SR writes may unmask interrupts, so both end
            // the block as well.
            if def.flags.intersects(
                OpdefFlags::BRANCH | OpdefFlags::SET_FPSCR | OpdefFlags::SET_SR,
            ) {
                break;
            }
        }

        info
    }

    fn translate(
        &mut self,
        guest_addr: u32,
        flags: BlockFlags,
        ir: &mut IrBuilder,
    ) -> BlockInfo {
        let mut flags = flags;
        // SAFETY: the embedder keeps the guest context alive for the
        // lifetime of the frontend.
        let fpscr = unsafe { (*self.guest.ctx).fpscr };
        if fpscr & PR_MASK != 0 {
            flags |= BlockFlags::DOUBLE_PR;
        }
        if fpscr & SZ_MASK != 0 {
            flags |= BlockFlags::DOUBLE_SZ;
        }

        let mut info = self.analyze(guest_addr);
        info.flags = flags;

        let end = guest_addr + info.guest_size;
        let mut addr = guest_addr;
        while addr < end {
            let data = self.guest.fetch16(addr);
            let def = opdef::lookup(data);
            (def.emit)(&self.guest, ir, flags, addr, data);
            addr += if def.flags.contains(OpdefFlags::DELAYED) { 4 } else { 2 };
        }

        // A block that doesn't already end in an unconditional branch
        // falls through to the next PC.
        let ends_in_branch = match ir.last_instr() {
            Some(id) => match ir.instr(id).opc {
                Opcode::Branch => true,
                Opcode::Fallback => {
                    let raw =
                        ir.value(ir.instr(id).arg(2)).u32_value() as u16;
                    opdef::lookup(raw).flags.contains(OpdefFlags::BRANCH)
                }
                _ => false,
            },
            None => false,
        };
        if !ends_in_branch {
            let dest = ir.alloc_i32(end as i32);
            ir.branch(dest);
        }

        info
    }

    fn lookup_op(&self, word: u16) -> &'static Opdef {
        opdef::lookup(word)
    }

    fn dump(&self, guest_addr: u32, guest_size: u32) {
        let end = guest_addr + guest_size;
        let mut addr = guest_addr;
        while addr < end {
            let data = self.guest.fetch16(addr);
            let def = opdef::lookup(data);
            log::info!("{}", disasm::format(addr, data, def));
            addr += 2;

            if def.flags.contains(OpdefFlags::DELAYED) {
                let delay_data = self.guest.fetch16(addr);
                let delay_def = opdef::lookup(delay_data);
                log::info!("{}", disasm::format(addr, delay_data, delay_def));
                addr += 2;
            }
        }
    }
}
