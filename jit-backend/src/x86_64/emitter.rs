//! x86-64 instruction encoding helpers.
//!
//! Thin free functions over the code buffer; the code generator in
//! `codegen.rs` sequences them. Register operands are raw encoding
//! numbers (GPR 0-15, or XMM 0-15 for the SSE helpers).

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;

#[inline]
const fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Emit a REX prefix if any extension bit or the width bit is needed.
#[inline]
fn rex(buf: &mut CodeBuffer, w: bool, reg: u8, index: u8, base: u8) {
    let mut b = 0x40u8;
    if w {
        b |= 0x08;
    }
    if reg >= 8 {
        b |= 0x04;
    }
    if index >= 8 {
        b |= 0x02;
    }
    if base >= 8 {
        b |= 0x01;
    }
    if b != 0x40 {
        buf.emit_u8(b);
    }
}

/// REX for 8-bit operations: also required to reach sil/dil/spl/bpl,
/// whether the byte register sits in the reg or r/m slot.
#[inline]
fn rex8(buf: &mut CodeBuffer, reg: u8, index: u8, base: u8) {
    let mut b = 0x40u8;
    if reg >= 8 {
        b |= 0x04;
    }
    if index >= 8 {
        b |= 0x02;
    }
    if base >= 8 {
        b |= 0x01;
    }
    let low_byte = |r: u8| r < 8 && matches!(r & 7, 4 | 5 | 6 | 7);
    if b != 0x40 || low_byte(reg) || low_byte(base) {
        buf.emit_u8(b);
    }
}

/// ModR/M + SIB + disp32 for a `[base + disp]` operand.
fn modrm_mem(buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
    if base & 7 == 4 {
        // rsp/r12 require a SIB byte.
        buf.emit_u8(modrm(0b10, reg, 0b100));
        buf.emit_u8(0x24); // scale=0, no index, base=rsp
    } else {
        buf.emit_u8(modrm(0b10, reg, base));
    }
    buf.emit_u32(disp as u32);
}

/// ModR/M + SIB for a `[base + index]` operand (no displacement).
fn modrm_mem_indexed(buf: &mut CodeBuffer, reg: u8, base: u8, index: u8) {
    assert!(base & 7 != 5, "rbp/r13 as a base needs a displacement");
    assert!(index & 7 != 4, "rsp cannot be an index");
    buf.emit_u8(modrm(0b00, reg, 0b100));
    buf.emit_u8(((index & 7) << 3) | (base & 7));
}

// -- Stack / control flow --

/// `push reg` (64-bit).
pub fn emit_push(buf: &mut CodeBuffer, reg: u8) {
    rex(buf, false, 0, 0, reg);
    buf.emit_u8(0x50 + (reg & 7));
}

/// `pop reg` (64-bit).
pub fn emit_pop(buf: &mut CodeBuffer, reg: u8) {
    rex(buf, false, 0, 0, reg);
    buf.emit_u8(0x58 + (reg & 7));
}

/// `ret`.
pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(0xC3);
}

/// `jmp *reg`.
pub fn emit_jmp_reg(buf: &mut CodeBuffer, reg: u8) {
    rex(buf, false, 0, 0, reg);
    buf.emit_u8(0xFF);
    buf.emit_u8(modrm(0b11, 4, reg));
}

/// `call *reg`.
pub fn emit_call_reg(buf: &mut CodeBuffer, reg: u8) {
    rex(buf, false, 0, 0, reg);
    buf.emit_u8(0xFF);
    buf.emit_u8(modrm(0b11, 2, reg));
}

/// Immediate-group ALU on rsp (`/0` add, `/5` sub); only the frame
/// setup uses it.
fn emit_rsp_imm(buf: &mut CodeBuffer, opext: u8, imm: u32) {
    if imm == 0 {
        return;
    }
    rex(buf, true, 0, 0, Reg::Rsp as u8);
    let short = imm <= i8::MAX as u32;
    buf.emit_u8(if short { 0x83 } else { 0x81 });
    buf.emit_u8(modrm(0b11, opext, Reg::Rsp as u8));
    if short {
        buf.emit_u8(imm as u8);
    } else {
        buf.emit_u32(imm);
    }
}

/// `sub rsp, imm`: carve out the translated-code frame.
pub fn emit_frame_alloc(buf: &mut CodeBuffer, bytes: u32) {
    emit_rsp_imm(buf, 5, bytes);
}

/// `add rsp, imm`: give the frame back before returning.
pub fn emit_frame_release(buf: &mut CodeBuffer, bytes: u32) {
    emit_rsp_imm(buf, 0, bytes);
}

/// `jmp rel32` to a fixed offset in the buffer (the epilogue, or a
/// resolved forward target).
pub fn emit_jmp_rel32(buf: &mut CodeBuffer, target_offset: usize) {
    buf.emit_u8(0xE9);
    let next = buf.offset() + 4;
    buf.emit_u32((target_offset as i64 - next as i64) as u32);
}

/// Condition codes for `jcc`/`setcc` (low nibble of the opcode).
pub mod cc {
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const B: u8 = 0x2;
    pub const AE: u8 = 0x3;
    pub const BE: u8 = 0x6;
    pub const A: u8 = 0x7;
    pub const L: u8 = 0xC;
    pub const GE: u8 = 0xD;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;
}

/// `jcc rel32` with a placeholder displacement.
/// Returns the offset of the displacement for later patching.
pub fn emit_jcc_rel32(buf: &mut CodeBuffer, cond: u8) -> usize {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x80 | cond);
    let patch = buf.offset();
    buf.emit_u32(0);
    patch
}

/// Resolve a forward `jcc rel32` displacement to the current offset.
pub fn patch_rel32(buf: &mut CodeBuffer, patch: usize) {
    let disp = buf.offset() as i64 - (patch as i64 + 4);
    buf.patch_u32(patch, disp as u32);
}

// -- Moves --

/// `mov dst, src` (64-bit register to register).
pub fn emit_mov_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex(buf, true, src, 0, dst);
    buf.emit_u8(0x89);
    buf.emit_u8(modrm(0b11, src, dst));
}

/// `mov dst32, src32` (zero-extends to 64-bit).
pub fn emit_mov_rr32(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex(buf, false, src, 0, dst);
    buf.emit_u8(0x89);
    buf.emit_u8(modrm(0b11, src, dst));
}

/// Load an immediate with the shortest encoding that reproduces it:
/// the zero idiom, `mov r32, imm32` when the value zero-extends, or
/// `movabs`.
pub fn emit_mov_imm64(buf: &mut CodeBuffer, reg: u8, val: u64) {
    if val == 0 {
        return emit_xor_rr32(buf, reg, reg);
    }
    let wide = val > u32::MAX as u64;
    rex(buf, wide, 0, 0, reg);
    buf.emit_u8(0xB8 + (reg & 7));
    if wide {
        buf.emit_u64(val);
    } else {
        buf.emit_u32(val as u32);
    }
}

/// `xor r32, r32`, the canonical zero idiom.
pub fn emit_xor_rr32(buf: &mut CodeBuffer, dst: u8, src: u8) {
    emit_alu_rr(buf, alu::XOR, false, dst, src);
}

// -- Loads from [base + disp] --

/// `movzx dst32, byte [base + disp]`.
pub fn emit_load8_zx(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    rex(buf, false, dst, 0, base);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    modrm_mem(buf, dst, base, disp);
}

/// `movzx dst32, word [base + disp]`.
pub fn emit_load16_zx(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    rex(buf, false, dst, 0, base);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB7);
    modrm_mem(buf, dst, base, disp);
}

/// `mov dst32, dword [base + disp]`.
pub fn emit_load32(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    rex(buf, false, dst, 0, base);
    buf.emit_u8(0x8B);
    modrm_mem(buf, dst, base, disp);
}

/// `mov dst64, qword [base + disp]`.
pub fn emit_load64(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    rex(buf, true, dst, 0, base);
    buf.emit_u8(0x8B);
    modrm_mem(buf, dst, base, disp);
}

// -- Stores to [base + disp] --

/// `mov byte [base + disp], src8`.
pub fn emit_store8(buf: &mut CodeBuffer, src: u8, base: u8, disp: i32) {
    rex8(buf, src, 0, base);
    buf.emit_u8(0x88);
    modrm_mem(buf, src, base, disp);
}

/// `mov word [base + disp], src16`.
pub fn emit_store16(buf: &mut CodeBuffer, src: u8, base: u8, disp: i32) {
    buf.emit_u8(0x66);
    rex(buf, false, src, 0, base);
    buf.emit_u8(0x89);
    modrm_mem(buf, src, base, disp);
}

/// `mov dword [base + disp], src32`.
pub fn emit_store32(buf: &mut CodeBuffer, src: u8, base: u8, disp: i32) {
    rex(buf, false, src, 0, base);
    buf.emit_u8(0x89);
    modrm_mem(buf, src, base, disp);
}

/// `mov qword [base + disp], src64`.
pub fn emit_store64(buf: &mut CodeBuffer, src: u8, base: u8, disp: i32) {
    rex(buf, true, src, 0, base);
    buf.emit_u8(0x89);
    modrm_mem(buf, src, base, disp);
}

/// `mov dword [base + disp], imm32`.
pub fn emit_store32_imm(buf: &mut CodeBuffer, base: u8, disp: i32, imm: u32) {
    rex(buf, false, 0, 0, base);
    buf.emit_u8(0xC7);
    modrm_mem(buf, 0, base, disp);
    buf.emit_u32(imm);
}

// -- Loads/stores through [base + index] (fastmem) --

/// `movzx dst32, byte [base + index]`.
pub fn emit_load8_zx_idx(buf: &mut CodeBuffer, dst: u8, base: u8, index: u8) {
    rex(buf, false, dst, index, base);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    modrm_mem_indexed(buf, dst, base, index);
}

/// `movzx dst32, word [base + index]`.
pub fn emit_load16_zx_idx(buf: &mut CodeBuffer, dst: u8, base: u8, index: u8) {
    rex(buf, false, dst, index, base);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB7);
    modrm_mem_indexed(buf, dst, base, index);
}

/// `mov dst32, dword [base + index]`.
pub fn emit_load32_idx(buf: &mut CodeBuffer, dst: u8, base: u8, index: u8) {
    rex(buf, false, dst, index, base);
    buf.emit_u8(0x8B);
    modrm_mem_indexed(buf, dst, base, index);
}

/// `mov dst64, qword [base + index]`.
pub fn emit_load64_idx(buf: &mut CodeBuffer, dst: u8, base: u8, index: u8) {
    rex(buf, true, dst, index, base);
    buf.emit_u8(0x8B);
    modrm_mem_indexed(buf, dst, base, index);
}

/// `mov byte [base + index], src8`.
pub fn emit_store8_idx(buf: &mut CodeBuffer, src: u8, base: u8, index: u8) {
    rex8(buf, src, index, base);
    buf.emit_u8(0x88);
    modrm_mem_indexed(buf, src, base, index);
}

/// `mov word [base + index], src16`.
pub fn emit_store16_idx(buf: &mut CodeBuffer, src: u8, base: u8, index: u8) {
    buf.emit_u8(0x66);
    rex(buf, false, src, index, base);
    buf.emit_u8(0x89);
    modrm_mem_indexed(buf, src, base, index);
}

/// `mov dword [base + index], src32`.
pub fn emit_store32_idx(buf: &mut CodeBuffer, src: u8, base: u8, index: u8) {
    rex(buf, false, src, index, base);
    buf.emit_u8(0x89);
    modrm_mem_indexed(buf, src, base, index);
}

/// `mov qword [base + index], src64`.
pub fn emit_store64_idx(buf: &mut CodeBuffer, src: u8, base: u8, index: u8) {
    rex(buf, true, src, index, base);
    buf.emit_u8(0x89);
    modrm_mem_indexed(buf, src, base, index);
}

// -- ALU --

/// Binary ALU `op r/m, r` opcode bytes.
pub mod alu {
    pub const ADD: u8 = 0x01;
    pub const OR: u8 = 0x09;
    pub const AND: u8 = 0x21;
    pub const SUB: u8 = 0x29;
    pub const XOR: u8 = 0x31;
    pub const CMP: u8 = 0x39;
}

/// `op dst, src` for the binary ALU group.
pub fn emit_alu_rr(buf: &mut CodeBuffer, op: u8, wide: bool, dst: u8, src: u8) {
    rex(buf, wide, src, 0, dst);
    buf.emit_u8(op);
    buf.emit_u8(modrm(0b11, src, dst));
}

/// `not reg`.
pub fn emit_not(buf: &mut CodeBuffer, wide: bool, reg: u8) {
    rex(buf, wide, 0, 0, reg);
    buf.emit_u8(0xF7);
    buf.emit_u8(modrm(0b11, 2, reg)); // /2
}

/// Shift group `/n` fields for `shift reg, cl`.
pub mod shift {
    pub const SHL: u8 = 4;
    pub const SHR: u8 = 5;
    pub const SAR: u8 = 7;
}

/// `shl/shr/sar reg, cl`.
pub fn emit_shift_cl(buf: &mut CodeBuffer, op: u8, wide: bool, reg: u8) {
    rex(buf, wide, 0, 0, reg);
    buf.emit_u8(0xD3);
    buf.emit_u8(modrm(0b11, op, reg));
}

/// `test a, b` (register-register).
pub fn emit_test_rr(buf: &mut CodeBuffer, wide: bool, a: u8, b: u8) {
    rex(buf, wide, b, 0, a);
    buf.emit_u8(0x85);
    buf.emit_u8(modrm(0b11, b, a));
}

/// `setcc reg8`.
pub fn emit_setcc(buf: &mut CodeBuffer, cond: u8, reg: u8) {
    rex8(buf, 0, 0, reg);
    buf.emit_u8(0x0F);
    buf.emit_u8(0x90 | cond);
    buf.emit_u8(modrm(0b11, 0, reg));
}

// -- Width changes --

/// `movzx dst32, src8`.
pub fn emit_movzx8_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex8(buf, dst, 0, src);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    buf.emit_u8(modrm(0b11, dst, src));
}

/// `movzx dst32, src16`.
pub fn emit_movzx16_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex(buf, false, dst, 0, src);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB7);
    buf.emit_u8(modrm(0b11, dst, src));
}

/// `movsx dst32, src8`.
pub fn emit_movsx8_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex8(buf, dst, 0, src);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xBE);
    buf.emit_u8(modrm(0b11, dst, src));
}

/// `movsx dst32, src16`.
pub fn emit_movsx16_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex(buf, false, dst, 0, src);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xBF);
    buf.emit_u8(modrm(0b11, dst, src));
}

/// `movsxd dst64, src32`.
pub fn emit_movsxd_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    rex(buf, true, dst, 0, src);
    buf.emit_u8(0x63);
    buf.emit_u8(modrm(0b11, dst, src));
}

// -- SSE scalar moves --

fn sse_mov(buf: &mut CodeBuffer, prefix: u8, op: u8, xmm: u8, base: u8, disp: i32) {
    buf.emit_u8(prefix);
    rex(buf, false, xmm, 0, base);
    buf.emit_u8(0x0F);
    buf.emit_u8(op);
    modrm_mem(buf, xmm, base, disp);
}

/// `movss xmm, dword [base + disp]`.
pub fn emit_movss_load(buf: &mut CodeBuffer, xmm: u8, base: u8, disp: i32) {
    sse_mov(buf, 0xF3, 0x10, xmm, base, disp);
}

/// `movss dword [base + disp], xmm`.
pub fn emit_movss_store(buf: &mut CodeBuffer, xmm: u8, base: u8, disp: i32) {
    sse_mov(buf, 0xF3, 0x11, xmm, base, disp);
}

/// `movsd xmm, qword [base + disp]`.
pub fn emit_movsd_load(buf: &mut CodeBuffer, xmm: u8, base: u8, disp: i32) {
    sse_mov(buf, 0xF2, 0x10, xmm, base, disp);
}

/// `movsd qword [base + disp], xmm`.
pub fn emit_movsd_store(buf: &mut CodeBuffer, xmm: u8, base: u8, disp: i32) {
    sse_mov(buf, 0xF2, 0x11, xmm, base, disp);
}
