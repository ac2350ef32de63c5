//! SH-4 instruction dictionary.
//!
//! Each descriptor pairs a mask/key encoding pattern with its static
//! flags, cycle cost, IR emit callback, and disassembly template. A
//! 64K word-indexed decode table is built once on first lookup; every
//! encoding not claimed by a descriptor decodes to the invalid entry.

use std::sync::OnceLock;

use jit_ir::IrBuilder;

use crate::guest::Sh4Guest;
use crate::translate as t;
use crate::BlockFlags;

/// Static instruction properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpdefFlags(u16);

impl OpdefFlags {
    pub const NONE: OpdefFlags = OpdefFlags(0);
    /// Not implemented or ill-formed; ends the block.
    pub const INVALID: OpdefFlags = OpdefFlags(0x01);
    /// Has a delay slot.
    pub const DELAYED: OpdefFlags = OpdefFlags(0x02);
    /// May redirect control flow; ends the block.
    pub const BRANCH: OpdefFlags = OpdefFlags(0x04);
    /// Writes FPSCR; ends the block to re-sample FP modes.
    pub const SET_FPSCR: OpdefFlags = OpdefFlags(0x08);
    /// Writes SR; ends the block so interrupts can be serviced.
    pub const SET_SR: OpdefFlags = OpdefFlags(0x10);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: OpdefFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: OpdefFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for OpdefFlags {
    type Output = OpdefFlags;

    fn bitor(self, rhs: OpdefFlags) -> OpdefFlags {
        OpdefFlags(self.0 | rhs.0)
    }
}

const fn f(a: OpdefFlags, b: OpdefFlags) -> OpdefFlags {
    OpdefFlags(a.bits() | b.bits())
}

/// IR emit callback: `(guest, ir, flags, addr, instr)`.
pub type EmitFn = fn(&Sh4Guest, &mut IrBuilder, BlockFlags, u32, u16);

/// Immutable instruction descriptor.
#[derive(Clone, Copy)]
pub struct Opdef {
    pub name: &'static str,
    pub disas: &'static str,
    pub mask: u16,
    pub key: u16,
    pub flags: OpdefFlags,
    pub cycles: u32,
    pub emit: EmitFn,
}

const DE: OpdefFlags = OpdefFlags::DELAYED;
const BR: OpdefFlags = OpdefFlags::BRANCH;
const N: OpdefFlags = OpdefFlags::NONE;

macro_rules! opdef {
    ($name:literal, $disas:literal, $mask:literal, $key:literal, $flags:expr, $cycles:literal, $emit:path) => {
        Opdef {
            name: $name,
            disas: $disas,
            mask: $mask,
            key: $key,
            flags: $flags,
            cycles: $cycles,
            emit: $emit,
        }
    };
}

/// The dictionary. Entry 0 is the invalid descriptor; the decode table
/// maps unclaimed encodings to it. More specific patterns come first.
pub static OPDEFS: &[Opdef] = &[
    opdef!("invalid", "invalid", 0xffff, 0xffff, OpdefFlags::INVALID, 1, t::op_invalid),
    // -- Fixed encodings --
    opdef!("nop", "nop", 0xffff, 0x0009, N, 1, t::op_nop),
    opdef!("rts", "rts", 0xffff, 0x000b, f(DE, BR), 2, t::op_rts),
    opdef!("clrt", "clrt", 0xffff, 0x0008, N, 1, t::op_clrt),
    opdef!("sett", "sett", 0xffff, 0x0018, N, 1, t::op_sett),
    // -- One register --
    opdef!("jmp", "jmp @Rn", 0xf0ff, 0x402b, f(DE, BR), 2, t::op_jmp),
    opdef!("jsr", "jsr @Rn", 0xf0ff, 0x400b, f(DE, BR), 2, t::op_jsr),
    opdef!("ldc_sr", "ldc Rn, sr", 0xf0ff, 0x400e, OpdefFlags::SET_SR, 4, t::op_ldc_sr),
    opdef!("lds_fpscr", "lds Rn, fpscr", 0xf0ff, 0x406a, OpdefFlags::SET_FPSCR, 1, t::op_lds_fpscr),
    opdef!("shll", "shll Rn", 0xf0ff, 0x4000, N, 1, t::op_shll),
    opdef!("shlr", "shlr Rn", 0xf0ff, 0x4001, N, 1, t::op_shlr),
    // -- Two registers --
    opdef!("movb_load", "mov.b @Rm, Rn", 0xf00f, 0x6000, N, 1, t::op_movb_load),
    opdef!("movw_load", "mov.w @Rm, Rn", 0xf00f, 0x6001, N, 1, t::op_movw_load),
    opdef!("movl_load", "mov.l @Rm, Rn", 0xf00f, 0x6002, N, 1, t::op_movl_load),
    opdef!("mov", "mov Rm, Rn", 0xf00f, 0x6003, N, 1, t::op_mov_rr),
    opdef!("not", "not Rm, Rn", 0xf00f, 0x6007, N, 1, t::op_not),
    opdef!("neg", "neg Rm, Rn", 0xf00f, 0x600b, N, 1, t::op_neg),
    opdef!("movb_store", "mov.b Rm, @Rn", 0xf00f, 0x2000, N, 1, t::op_movb_store),
    opdef!("movw_store", "mov.w Rm, @Rn", 0xf00f, 0x2001, N, 1, t::op_movw_store),
    opdef!("movl_store", "mov.l Rm, @Rn", 0xf00f, 0x2002, N, 1, t::op_movl_store),
    opdef!("tst", "tst Rm, Rn", 0xf00f, 0x2008, N, 1, t::op_tst),
    opdef!("and", "and Rm, Rn", 0xf00f, 0x2009, N, 1, t::op_and),
    opdef!("xor", "xor Rm, Rn", 0xf00f, 0x200a, N, 1, t::op_xor),
    opdef!("or", "or Rm, Rn", 0xf00f, 0x200b, N, 1, t::op_or),
    opdef!("cmp_eq", "cmp/eq Rm, Rn", 0xf00f, 0x3000, N, 1, t::op_cmp_eq),
    opdef!("cmp_hs", "cmp/hs Rm, Rn", 0xf00f, 0x3002, N, 1, t::op_cmp_hs),
    opdef!("cmp_ge", "cmp/ge Rm, Rn", 0xf00f, 0x3003, N, 1, t::op_cmp_ge),
    opdef!("cmp_hi", "cmp/hi Rm, Rn", 0xf00f, 0x3006, N, 1, t::op_cmp_hi),
    opdef!("cmp_gt", "cmp/gt Rm, Rn", 0xf00f, 0x3007, N, 1, t::op_cmp_gt),
    opdef!("sub", "sub Rm, Rn", 0xf00f, 0x3008, N, 1, t::op_sub),
    opdef!("add", "add Rm, Rn", 0xf00f, 0x300c, N, 1, t::op_add),
    // -- Register + immediate / displacement --
    opdef!("cmp_eq_imm", "cmp/eq #imm, r0", 0xff00, 0x8800, N, 1, t::op_cmp_eq_imm),
    opdef!("bt", "bt disp", 0xff00, 0x8900, BR, 1, t::op_bt),
    opdef!("bf", "bf disp", 0xff00, 0x8b00, BR, 1, t::op_bf),
    opdef!("bts", "bt/s disp", 0xff00, 0x8d00, f(DE, BR), 1, t::op_bts),
    opdef!("bfs", "bf/s disp", 0xff00, 0x8f00, f(DE, BR), 1, t::op_bfs),
    opdef!("mova", "mova @(disp, pc), r0", 0xff00, 0xc700, N, 1, t::op_mova),
    opdef!("tst_imm", "tst #imm, r0", 0xff00, 0xc800, N, 1, t::op_tst_imm),
    opdef!("and_imm", "and #imm, r0", 0xff00, 0xc900, N, 1, t::op_and_imm),
    opdef!("xor_imm", "xor #imm, r0", 0xff00, 0xca00, N, 1, t::op_xor_imm),
    opdef!("or_imm", "or #imm, r0", 0xff00, 0xcb00, N, 1, t::op_or_imm),
    // -- Wide immediate forms --
    opdef!("add_imm", "add #imm, Rn", 0xf000, 0x7000, N, 1, t::op_add_imm),
    opdef!("mov_imm", "mov #imm, Rn", 0xf000, 0xe000, N, 1, t::op_mov_imm),
    opdef!("movw_load_pc", "mov.w @(disp, pc), Rn", 0xf000, 0x9000, N, 1, t::op_movw_load_pc),
    opdef!("movl_load_pc", "mov.l @(disp, pc), Rn", 0xf000, 0xd000, N, 1, t::op_movl_load_pc),
    opdef!("bra", "bra disp", 0xf000, 0xa000, f(DE, BR), 2, t::op_bra),
    opdef!("bsr", "bsr disp", 0xf000, 0xb000, f(DE, BR), 2, t::op_bsr),
];

fn decode_table() -> &'static [u16] {
    static TABLE: OnceLock<Vec<u16>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = vec![0u16; 0x10000];
        for (i, def) in OPDEFS.iter().enumerate().skip(1) {
            for word in 0..=0xffffu16 {
                if word & def.mask == def.key && table[word as usize] == 0 {
                    table[word as usize] = i as u16;
                }
            }
        }
        table
    })
}

/// Decode a 16-bit word into its descriptor.
#[inline]
pub fn lookup(word: u16) -> &'static Opdef {
    &OPDEFS[decode_table()[word as usize] as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixed_encodings() {
        assert_eq!(lookup(0x0009).name, "nop");
        assert_eq!(lookup(0x000b).name, "rts");
        assert!(lookup(0x000b).flags.contains(OpdefFlags::DELAYED));
        assert!(lookup(0x000b).flags.contains(OpdefFlags::BRANCH));
    }

    #[test]
    fn decodes_register_fields_as_wildcards() {
        assert_eq!(lookup(0x6523).name, "mov");
        assert_eq!(lookup(0x402b).name, "jmp");
        assert_eq!(lookup(0x4f2b).name, "jmp");
        assert_eq!(lookup(0xe1ff).name, "mov_imm");
    }

    #[test]
    fn unclaimed_encodings_are_invalid() {
        assert!(lookup(0xfffd).flags.contains(OpdefFlags::INVALID));
        assert!(lookup(0x0000).flags.contains(OpdefFlags::INVALID));
    }

    #[test]
    fn status_register_writers_flagged() {
        assert!(lookup(0x430e).flags.contains(OpdefFlags::SET_SR));
        assert!(lookup(0x4b6a).flags.contains(OpdefFlags::SET_FPSCR));
    }
}
