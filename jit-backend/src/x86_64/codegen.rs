//! x86-64 code generation: lowers assembled IR to host machine code.
//!
//! Layout follows a shared prologue/epilogue at the start of the code
//! buffer. The prologue saves callee-saved registers, pins the guest
//! context in r14 and the fastmem base in r15, then tail-jumps to the
//! block entry; every block ends by storing the next guest PC into the
//! context and jumping to the epilogue.
//!
//! Binary operations are computed in scratch registers
//! (`op(rax, rcx) -> dst`), so allocated registers are only ever read
//! as sources or written as final destinations.

use jit_ir::{CmpOp, Instr, IrBuilder, Opcode, RegisterDef, ValueId, ValueType};

use crate::code_buffer::CodeBuffer;
use crate::exception::{AccessKind, Exception};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{
    Reg, CALLEE_SAVED, GUEST_CTX, MEM_BASE, REGISTERS, SCRATCH0, SCRATCH1,
    SPILL_AREA_SIZE, STACK_ADDEND,
};
use crate::{Backend, BackendError, MemoryInterface};

/// Worst-case host bytes per IR instruction, used to pre-check buffer
/// space before emission (the slow-path call sequence dominates).
const MAX_INSTR_BYTES: usize = 64;

/// One patchable fastmem access site.
#[derive(Debug, Clone, Copy)]
struct FastmemSite {
    /// Offset of the access instruction in the code buffer.
    offset: usize,
    /// Encoded length, for advancing the faulting PC.
    len: u8,
    kind: AccessKind,
    size_bytes: u8,
    /// Host GPR holding the guest address at the fault point.
    addr_reg: u8,
    /// Destination (load) or source (store) host GPR.
    value_reg: u8,
}

/// x86-64 backend: assembles IR into the code buffer and services
/// fastmem faults raised by its own emitted code.
pub struct X64Backend {
    buf: CodeBuffer,
    memif: MemoryInterface,
    /// Byte offset of the guest PC inside the context struct.
    pc_offset: i32,
    epilogue_offset: usize,
    sites: Vec<FastmemSite>,
}

impl X64Backend {
    pub fn new(
        memif: MemoryInterface,
        pc_offset: i32,
        code_size: usize,
    ) -> Result<Self, BackendError> {
        let buf = CodeBuffer::new(code_size)?;
        let mut backend = Self {
            buf,
            memif,
            pc_offset,
            epilogue_offset: 0,
            sites: Vec::new(),
        };
        backend.emit_prologue_epilogue();
        Ok(backend)
    }

    /// Entry point for the dispatch loop:
    /// `extern "C" fn(ctx: *mut u8, entry: *const u8)`.
    pub fn prologue_ptr(&self) -> *const u8 {
        self.buf.base()
    }

    /// Run one translated block to completion.
    ///
    /// # Safety
    /// `ctx` must point at the guest context the code was compiled
    /// against, and `entry` must be a live block entry in this
    /// backend's buffer.
    pub unsafe fn enter(&self, ctx: *mut u8, entry: *const u8) {
        let prologue: unsafe extern "C" fn(*mut u8, *const u8) =
            std::mem::transmute(self.buf.base());
        prologue(ctx, entry);
    }

    fn emit_prologue_epilogue(&mut self) {
        let buf = &mut self.buf;
        for &reg in CALLEE_SAVED {
            emit_push(buf, reg as u8);
        }
        emit_mov_rr(buf, GUEST_CTX as u8, Reg::Rdi as u8);
        emit_mov_imm64(buf, MEM_BASE as u8, self.memif.mem_base as u64);
        emit_frame_alloc(buf, STACK_ADDEND as u32);
        emit_jmp_reg(buf, Reg::Rsi as u8);

        self.epilogue_offset = buf.offset();
        emit_frame_release(buf, STACK_ADDEND as u32);
        for &reg in CALLEE_SAVED.iter().rev() {
            emit_pop(buf, reg as u8);
        }
        emit_ret(buf);
    }

    // -- Value resolution --

    /// Host GPR assigned to a non-constant value.
    fn gpr(ir: &IrBuilder, v: ValueId) -> u8 {
        let val = ir.value(v);
        let def = &REGISTERS[val.reg.expect("unallocated value") as usize];
        assert!(def.value_types & val.ty.mask() != 0);
        def.encoding
    }

    /// Host XMM register assigned to a float value.
    fn xmm(ir: &IrBuilder, v: ValueId) -> u8 {
        Self::gpr(ir, v)
    }

    /// Materialize a value into a GPR, using `scratch` for constants.
    fn value_to_gpr(&mut self, ir: &IrBuilder, v: ValueId, scratch: u8) -> u8 {
        match ir.value(v).constant {
            Some(bits) => {
                emit_mov_imm64(&mut self.buf, scratch, bits);
                scratch
            }
            None => Self::gpr(ir, v),
        }
    }

    // -- Instruction lowering --

    fn emit_instr(&mut self, ir: &IrBuilder, instr: &Instr) {
        match instr.opc {
            Opcode::LoadContext => {
                let off = ir.value(instr.arg(0)).i64_value() as i32;
                let result = instr.result.unwrap();
                self.emit_load_base(ir, result, GUEST_CTX as u8, off);
            }
            Opcode::StoreContext => {
                let off = ir.value(instr.arg(0)).i64_value() as i32;
                self.emit_store_base(ir, instr.arg(1), GUEST_CTX as u8, off);
            }
            Opcode::LoadLocal => {
                let slot = ir.value(instr.arg(0)).i64_value() as i32;
                let result = instr.result.unwrap();
                self.emit_load_base(ir, result, Reg::Rsp as u8, slot);
            }
            Opcode::StoreLocal => {
                let slot = ir.value(instr.arg(0)).i64_value() as i32;
                self.emit_store_base(ir, instr.arg(1), Reg::Rsp as u8, slot);
            }
            Opcode::LoadFast => self.emit_load_fast(ir, instr),
            Opcode::StoreFast => self.emit_store_fast(ir, instr),
            Opcode::LoadSlow => self.emit_load_slow(ir, instr),
            Opcode::StoreSlow => self.emit_store_slow(ir, instr),
            Opcode::Add => self.emit_alu(ir, instr, alu::ADD),
            Opcode::Sub => self.emit_alu(ir, instr, alu::SUB),
            Opcode::And => self.emit_alu(ir, instr, alu::AND),
            Opcode::Or => self.emit_alu(ir, instr, alu::OR),
            Opcode::Xor => self.emit_alu(ir, instr, alu::XOR),
            Opcode::Not => {
                let wide = ir.value(instr.arg(0)).ty == ValueType::I64;
                let a = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
                emit_mov_rr(&mut self.buf, SCRATCH0 as u8, a);
                emit_not(&mut self.buf, wide, SCRATCH0 as u8);
                let dst = Self::gpr(ir, instr.result.unwrap());
                emit_mov_rr(&mut self.buf, dst, SCRATCH0 as u8);
            }
            Opcode::Shl => self.emit_shift(ir, instr, shift::SHL),
            Opcode::Lshr => self.emit_shift(ir, instr, shift::SHR),
            Opcode::Ashr => self.emit_shift(ir, instr, shift::SAR),
            Opcode::Cmp => self.emit_cmp(ir, instr),
            Opcode::SExt => self.emit_sext(ir, instr),
            Opcode::ZExt => self.emit_zext(ir, instr),
            Opcode::Trunc => {
                let src = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
                let dst = Self::gpr(ir, instr.result.unwrap());
                emit_mov_rr32(&mut self.buf, dst, src);
            }
            Opcode::Branch => {
                self.emit_set_pc(ir, instr.arg(0));
                emit_jmp_rel32(&mut self.buf, self.epilogue_offset);
            }
            Opcode::BranchCond => self.emit_branch_cond(ir, instr),
            Opcode::Fallback => self.emit_fallback(ir, instr),
            Opcode::Count => unreachable!(),
        }
    }

    fn emit_load_base(&mut self, ir: &IrBuilder, result: ValueId, base: u8, disp: i32) {
        let ty = ir.value(result).ty;
        let buf = &mut self.buf;
        match ty {
            ValueType::F32 => emit_movss_load(buf, Self::xmm(ir, result), base, disp),
            ValueType::F64 => emit_movsd_load(buf, Self::xmm(ir, result), base, disp),
            _ => {
                let dst = Self::gpr(ir, result);
                match ty.size_bytes() {
                    1 => emit_load8_zx(buf, dst, base, disp),
                    2 => emit_load16_zx(buf, dst, base, disp),
                    4 => emit_load32(buf, dst, base, disp),
                    _ => emit_load64(buf, dst, base, disp),
                }
            }
        }
    }

    fn emit_store_base(&mut self, ir: &IrBuilder, v: ValueId, base: u8, disp: i32) {
        let ty = ir.value(v).ty;
        match ty {
            ValueType::F32 => {
                emit_movss_store(&mut self.buf, Self::xmm(ir, v), base, disp)
            }
            ValueType::F64 => {
                emit_movsd_store(&mut self.buf, Self::xmm(ir, v), base, disp)
            }
            ValueType::I32 if ir.value(v).is_const() => {
                let imm = ir.value(v).u32_value();
                emit_store32_imm(&mut self.buf, base, disp, imm);
            }
            _ => {
                let src = self.value_to_gpr(ir, v, SCRATCH0 as u8);
                let buf = &mut self.buf;
                match ty.size_bytes() {
                    1 => emit_store8(buf, src, base, disp),
                    2 => emit_store16(buf, src, base, disp),
                    4 => emit_store32(buf, src, base, disp),
                    _ => emit_store64(buf, src, base, disp),
                }
            }
        }
    }

    fn emit_load_fast(&mut self, ir: &IrBuilder, instr: &Instr) {
        let addr = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        let result = instr.result.unwrap();
        let ty = ir.value(result).ty;
        assert!(ty.is_int(), "fastmem is integer-only");
        let dst = Self::gpr(ir, result);

        let offset = self.buf.offset();
        let base = MEM_BASE as u8;
        match ty.size_bytes() {
            1 => emit_load8_zx_idx(&mut self.buf, dst, base, addr),
            2 => emit_load16_zx_idx(&mut self.buf, dst, base, addr),
            4 => emit_load32_idx(&mut self.buf, dst, base, addr),
            _ => emit_load64_idx(&mut self.buf, dst, base, addr),
        }
        self.sites.push(FastmemSite {
            offset,
            len: (self.buf.offset() - offset) as u8,
            kind: AccessKind::Read,
            size_bytes: ty.size_bytes() as u8,
            addr_reg: addr,
            value_reg: dst,
        });
    }

    fn emit_store_fast(&mut self, ir: &IrBuilder, instr: &Instr) {
        let addr = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        let v = instr.arg(1);
        let ty = ir.value(v).ty;
        assert!(ty.is_int(), "fastmem is integer-only");
        let src = self.value_to_gpr(ir, v, SCRATCH1 as u8);

        let offset = self.buf.offset();
        let base = MEM_BASE as u8;
        match ty.size_bytes() {
            1 => emit_store8_idx(&mut self.buf, src, base, addr),
            2 => emit_store16_idx(&mut self.buf, src, base, addr),
            4 => emit_store32_idx(&mut self.buf, src, base, addr),
            _ => emit_store64_idx(&mut self.buf, src, base, addr),
        }
        self.sites.push(FastmemSite {
            offset,
            len: (self.buf.offset() - offset) as u8,
            kind: AccessKind::Write,
            size_bytes: ty.size_bytes() as u8,
            addr_reg: addr,
            value_reg: src,
        });
    }

    fn emit_load_slow(&mut self, ir: &IrBuilder, instr: &Instr) {
        let result = instr.result.unwrap();
        let ty = ir.value(result).ty;
        assert!(ty.is_int(), "FP transfers go through fallbacks");

        emit_mov_imm64(&mut self.buf, Reg::Rdi as u8, self.memif.mem_self as u64);
        self.emit_arg32(ir, instr.arg(0), Reg::Rsi as u8);
        let handler = match ty.size_bytes() {
            1 => self.memif.r8 as usize,
            2 => self.memif.r16 as usize,
            4 => self.memif.r32 as usize,
            _ => self.memif.r64 as usize,
        };
        emit_mov_imm64(&mut self.buf, SCRATCH0 as u8, handler as u64);
        emit_call_reg(&mut self.buf, SCRATCH0 as u8);

        // Result arrives in rax; narrow returns leave garbage above
        // the value, so normalize before handing it to the block.
        if let Some(reg) = ir.value(result).reg {
            let dst = REGISTERS[reg as usize].encoding;
            let buf = &mut self.buf;
            match ty.size_bytes() {
                1 => emit_movzx8_rr(buf, dst, Reg::Rax as u8),
                2 => emit_movzx16_rr(buf, dst, Reg::Rax as u8),
                4 => emit_mov_rr32(buf, dst, Reg::Rax as u8),
                _ => emit_mov_rr(buf, dst, Reg::Rax as u8),
            }
        }
    }

    fn emit_store_slow(&mut self, ir: &IrBuilder, instr: &Instr) {
        let v = instr.arg(1);
        let ty = ir.value(v).ty;
        assert!(ty.is_int(), "FP transfers go through fallbacks");

        emit_mov_imm64(&mut self.buf, Reg::Rdi as u8, self.memif.mem_self as u64);
        self.emit_arg32(ir, instr.arg(0), Reg::Rsi as u8);
        match ir.value(v).constant {
            Some(bits) => emit_mov_imm64(&mut self.buf, Reg::Rdx as u8, bits),
            None => {
                let src = Self::gpr(ir, v);
                if ty == ValueType::I64 {
                    emit_mov_rr(&mut self.buf, Reg::Rdx as u8, src);
                } else {
                    emit_mov_rr32(&mut self.buf, Reg::Rdx as u8, src);
                }
            }
        }
        let handler = match ty.size_bytes() {
            1 => self.memif.w8 as usize,
            2 => self.memif.w16 as usize,
            4 => self.memif.w32 as usize,
            _ => self.memif.w64 as usize,
        };
        emit_mov_imm64(&mut self.buf, SCRATCH0 as u8, handler as u64);
        emit_call_reg(&mut self.buf, SCRATCH0 as u8);
    }

    /// Move a 32-bit argument value into an ABI register.
    fn emit_arg32(&mut self, ir: &IrBuilder, v: ValueId, abi_reg: u8) {
        match ir.value(v).constant {
            Some(bits) => emit_mov_imm64(&mut self.buf, abi_reg, bits as u32 as u64),
            None => emit_mov_rr32(&mut self.buf, abi_reg, Self::gpr(ir, v)),
        }
    }

    fn emit_alu(&mut self, ir: &IrBuilder, instr: &Instr, op: u8) {
        let ty = ir.value(instr.result.unwrap()).ty;
        let wide = ty == ValueType::I64;
        let a = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        emit_mov_rr(&mut self.buf, SCRATCH0 as u8, a);
        let b = self.value_to_gpr(ir, instr.arg(1), SCRATCH1 as u8);
        emit_alu_rr(&mut self.buf, op, wide, SCRATCH0 as u8, b);
        let dst = Self::gpr(ir, instr.result.unwrap());
        emit_mov_rr(&mut self.buf, dst, SCRATCH0 as u8);
    }

    fn emit_shift(&mut self, ir: &IrBuilder, instr: &Instr, op: u8) {
        let ty = ir.value(instr.result.unwrap()).ty;
        let wide = ty == ValueType::I64;
        let a = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        emit_mov_rr(&mut self.buf, SCRATCH0 as u8, a);
        // Shift count must be in cl.
        match ir.value(instr.arg(1)).constant {
            Some(bits) => emit_mov_imm64(&mut self.buf, SCRATCH1 as u8, bits & 63),
            None => {
                let n = Self::gpr(ir, instr.arg(1));
                emit_mov_rr32(&mut self.buf, SCRATCH1 as u8, n);
            }
        }
        emit_shift_cl(&mut self.buf, op, wide, SCRATCH0 as u8);
        let dst = Self::gpr(ir, instr.result.unwrap());
        emit_mov_rr(&mut self.buf, dst, SCRATCH0 as u8);
    }

    fn emit_cmp(&mut self, ir: &IrBuilder, instr: &Instr) {
        let ty = ir.value(instr.arg(0)).ty;
        let wide = ty == ValueType::I64;
        let cond = CmpOp::from_raw(ir.value(instr.arg(2)).u32_value());
        let a = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        emit_mov_rr(&mut self.buf, SCRATCH0 as u8, a);
        let b = self.value_to_gpr(ir, instr.arg(1), SCRATCH1 as u8);
        emit_alu_rr(&mut self.buf, alu::CMP, wide, SCRATCH0 as u8, b);

        let code = match cond {
            CmpOp::Eq => cc::E,
            CmpOp::Ne => cc::NE,
            CmpOp::Sge => cc::GE,
            CmpOp::Sgt => cc::G,
            CmpOp::Sle => cc::LE,
            CmpOp::Slt => cc::L,
            CmpOp::Uge => cc::AE,
            CmpOp::Ugt => cc::A,
            CmpOp::Ule => cc::BE,
            CmpOp::Ult => cc::B,
        };
        emit_setcc(&mut self.buf, code, SCRATCH0 as u8);
        emit_movzx8_rr(&mut self.buf, SCRATCH0 as u8, SCRATCH0 as u8);
        let dst = Self::gpr(ir, instr.result.unwrap());
        emit_mov_rr(&mut self.buf, dst, SCRATCH0 as u8);
    }

    fn emit_sext(&mut self, ir: &IrBuilder, instr: &Instr) {
        let src_ty = ir.value(instr.arg(0)).ty;
        let dst_ty = ir.value(instr.result.unwrap()).ty;
        let src = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        let dst = Self::gpr(ir, instr.result.unwrap());
        let buf = &mut self.buf;
        match (src_ty.size_bytes(), dst_ty.size_bytes()) {
            (1, _) => emit_movsx8_rr(buf, dst, src),
            (2, _) => emit_movsx16_rr(buf, dst, src),
            (4, 8) => emit_movsxd_rr(buf, dst, src),
            (a, b) => panic!("unsupported sign extension {a} -> {b}"),
        }
    }

    fn emit_zext(&mut self, ir: &IrBuilder, instr: &Instr) {
        let src_ty = ir.value(instr.arg(0)).ty;
        let src = self.value_to_gpr(ir, instr.arg(0), SCRATCH0 as u8);
        let dst = Self::gpr(ir, instr.result.unwrap());
        let buf = &mut self.buf;
        match src_ty.size_bytes() {
            1 => emit_movzx8_rr(buf, dst, src),
            2 => emit_movzx16_rr(buf, dst, src),
            // 32-bit moves zero-extend architecturally.
            _ => emit_mov_rr32(buf, dst, src),
        }
    }

    /// Store a branch destination into the guest PC slot.
    fn emit_set_pc(&mut self, ir: &IrBuilder, dest: ValueId) {
        match ir.value(dest).constant {
            Some(bits) => emit_store32_imm(
                &mut self.buf,
                GUEST_CTX as u8,
                self.pc_offset,
                bits as u32,
            ),
            None => {
                let reg = Self::gpr(ir, dest);
                emit_store32(&mut self.buf, reg, GUEST_CTX as u8, self.pc_offset);
            }
        }
    }

    fn emit_branch_cond(&mut self, ir: &IrBuilder, instr: &Instr) {
        let cond = instr.arg(0);
        if let Some(bits) = ir.value(cond).constant {
            if bits != 0 {
                self.emit_set_pc(ir, instr.arg(1));
                emit_jmp_rel32(&mut self.buf, self.epilogue_offset);
            }
            return;
        }
        let reg = Self::gpr(ir, cond);
        emit_test_rr(&mut self.buf, false, reg, reg);
        let skip = emit_jcc_rel32(&mut self.buf, cc::E);
        self.emit_set_pc(ir, instr.arg(1));
        emit_jmp_rel32(&mut self.buf, self.epilogue_offset);
        patch_rel32(&mut self.buf, skip);
    }

    fn emit_fallback(&mut self, ir: &IrBuilder, instr: &Instr) {
        let fn_addr = ir.value(instr.arg(0)).constant.unwrap();
        let addr = ir.value(instr.arg(1)).u32_value();
        let raw = ir.value(instr.arg(2)).u32_value();

        emit_mov_rr(&mut self.buf, Reg::Rdi as u8, GUEST_CTX as u8);
        emit_mov_imm64(&mut self.buf, Reg::Rsi as u8, addr as u64);
        emit_mov_imm64(&mut self.buf, Reg::Rdx as u8, raw as u64);
        emit_mov_imm64(&mut self.buf, SCRATCH0 as u8, fn_addr);
        emit_call_reg(&mut self.buf, SCRATCH0 as u8);
    }
}

impl Backend for X64Backend {
    fn registers(&self) -> &'static [RegisterDef] {
        &REGISTERS
    }

    fn assemble(&mut self, ir: &IrBuilder) -> Option<(*const u8, usize)> {
        assert!(
            ir.locals_size() as usize <= SPILL_AREA_SIZE,
            "spill area exhausted"
        );
        let estimate = ir.num_instrs() * MAX_INSTR_BYTES + 64;
        if self.buf.remaining() < estimate {
            return None;
        }

        let start = self.buf.offset();
        for block in 0..ir.num_blocks() {
            for &id in ir.block_instrs(block) {
                let instr = ir.instr(id).clone();
                self.emit_instr(ir, &instr);
            }
        }
        let size = self.buf.offset() - start;
        Some((self.buf.offset_ptr(start), size))
    }

    fn reset(&mut self) {
        self.buf.rewind(0);
        self.sites.clear();
        self.emit_prologue_epilogue();
    }

    fn handle_fastmem(&mut self, ex: &mut Exception) -> bool {
        let base = self.buf.base() as usize;
        let pc = ex.pc();
        if pc < base || pc >= base + self.buf.offset() {
            return false;
        }
        let offset = pc - base;
        let Ok(idx) = self.sites.binary_search_by_key(&offset, |s| s.offset)
        else {
            return false;
        };
        let site = self.sites[idx];

        let guest_addr = ex.state.r[site.addr_reg as usize] as u32;
        let mem_self = self.memif.mem_self;
        match site.kind {
            AccessKind::Read => {
                let val = match site.size_bytes {
                    1 => (self.memif.r8)(mem_self, guest_addr) as u64,
                    2 => (self.memif.r16)(mem_self, guest_addr) as u64,
                    4 => (self.memif.r32)(mem_self, guest_addr) as u64,
                    _ => (self.memif.r64)(mem_self, guest_addr),
                };
                ex.state.r[site.value_reg as usize] = val;
            }
            AccessKind::Write => {
                let val = ex.state.r[site.value_reg as usize];
                match site.size_bytes {
                    1 => (self.memif.w8)(mem_self, guest_addr, val as u8),
                    2 => (self.memif.w16)(mem_self, guest_addr, val as u16),
                    4 => (self.memif.w32)(mem_self, guest_addr, val as u32),
                    _ => (self.memif.w64)(mem_self, guest_addr, val),
                }
            }
        }

        // Resume past the patched access, as if it had completed.
        ex.state.pc += site.len as u64;
        log::debug!(
            "fastmem {:?} at {:#010x} replayed through slow handlers",
            site.kind,
            guest_addr
        );
        true
    }
}
