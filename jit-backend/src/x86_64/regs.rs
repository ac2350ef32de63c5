use jit_ir::{RegisterDef, FLOAT_TYPES, INT_TYPES};

/// x86-64 general-purpose register numbers.
///
/// Encoding matches the ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Guest context pointer, pinned for the lifetime of translated code.
pub const GUEST_CTX: Reg = Reg::R14;

/// Fastmem base pointer, loaded once in the prologue.
pub const MEM_BASE: Reg = Reg::R15;

/// Callee-saved registers the prologue must save/restore
/// (System V AMD64 ABI).
pub const CALLEE_SAVED: &[Reg] =
    &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Scratch registers reserved for the code generator.
/// Never advertised to the register allocator.
pub const SCRATCH0: Reg = Reg::Rax;
pub const SCRATCH1: Reg = Reg::Rcx;

/// Bytes of stack reserved for spill slots below the frame.
pub const SPILL_AREA_SIZE: usize = 128 * 8;

/// Stack adjustment applied by the prologue. Entry rsp is 8 mod 16
/// (return address), the six pushes keep it there, and the odd addend
/// realigns call sites inside translated code.
pub const STACK_ADDEND: usize = SPILL_AREA_SIZE + 8;

/// Registers advertised to the register allocator.
///
/// Integer values prefer callee-saved registers so they survive slow
/// memory handlers and fallback calls; the caller-saved tail gives the
/// allocator room before spilling. Float values live in the
/// caller-saved XMM file and are force-spilled across calls.
/// `encoding` is the host register number (GPR or XMM).
pub static REGISTERS: [RegisterDef; 17] = [
    RegisterDef { name: "rbx", value_types: INT_TYPES, encoding: Reg::Rbx as u8, caller_saved: false },
    RegisterDef { name: "rbp", value_types: INT_TYPES, encoding: Reg::Rbp as u8, caller_saved: false },
    RegisterDef { name: "r12", value_types: INT_TYPES, encoding: Reg::R12 as u8, caller_saved: false },
    RegisterDef { name: "r13", value_types: INT_TYPES, encoding: Reg::R13 as u8, caller_saved: false },
    RegisterDef { name: "rsi", value_types: INT_TYPES, encoding: Reg::Rsi as u8, caller_saved: true },
    RegisterDef { name: "r8", value_types: INT_TYPES, encoding: Reg::R8 as u8, caller_saved: true },
    RegisterDef { name: "r9", value_types: INT_TYPES, encoding: Reg::R9 as u8, caller_saved: true },
    RegisterDef { name: "r10", value_types: INT_TYPES, encoding: Reg::R10 as u8, caller_saved: true },
    RegisterDef { name: "r11", value_types: INT_TYPES, encoding: Reg::R11 as u8, caller_saved: true },
    RegisterDef { name: "xmm4", value_types: FLOAT_TYPES, encoding: 4, caller_saved: true },
    RegisterDef { name: "xmm5", value_types: FLOAT_TYPES, encoding: 5, caller_saved: true },
    RegisterDef { name: "xmm6", value_types: FLOAT_TYPES, encoding: 6, caller_saved: true },
    RegisterDef { name: "xmm7", value_types: FLOAT_TYPES, encoding: 7, caller_saved: true },
    RegisterDef { name: "xmm8", value_types: FLOAT_TYPES, encoding: 8, caller_saved: true },
    RegisterDef { name: "xmm9", value_types: FLOAT_TYPES, encoding: 9, caller_saved: true },
    RegisterDef { name: "xmm10", value_types: FLOAT_TYPES, encoding: 10, caller_saved: true },
    RegisterDef { name: "xmm11", value_types: FLOAT_TYPES, encoding: 11, caller_saved: true },
];
