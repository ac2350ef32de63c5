use crate::instr::{Instr, InstrId, IrBlock, Use, Value, ValueId, MAX_INSTR_ARGS};
use crate::opcode::Opcode;
use crate::types::{CmpOp, ValueType};

/// Arena-owned IR builder.
///
/// Owns every value and instruction of one translation unit. The arena
/// is recycled between translations with `reset()`; no IR object
/// outlives a single translate → optimize → assemble cycle.
pub struct IrBuilder {
    values: Vec<Value>,
    instrs: Vec<Instr>,
    blocks: Vec<IrBlock>,
    current_block: usize,
    /// Next spill slot byte offset handed out by `alloc_local`.
    locals_size: u32,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            instrs: Vec::new(),
            blocks: vec![IrBlock::default()],
            current_block: 0,
            locals_size: 0,
        }
    }

    /// Recycle the arena for the next translation. Capacity is kept.
    pub fn reset(&mut self) {
        self.values.clear();
        self.instrs.clear();
        self.blocks.clear();
        self.blocks.push(IrBlock::default());
        self.current_block = 0;
        self.locals_size = 0;
    }

    // -- Accessors --

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_instrs(&self, block: usize) -> &[InstrId] {
        &self.blocks[block].instrs
    }

    /// Total instruction count across all blocks.
    pub fn num_instrs(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// The final instruction of the graph, if any.
    pub fn last_instr(&self) -> Option<InstrId> {
        self.blocks
            .iter()
            .rev()
            .find_map(|b| b.instrs.last().copied())
    }

    /// Bytes of spill storage the block needs at runtime.
    pub fn locals_size(&self) -> u32 {
        self.locals_size
    }

    /// Reserve an 8-byte spill slot; returns its byte offset.
    pub fn alloc_local(&mut self) -> u32 {
        let offset = self.locals_size;
        self.locals_size += 8;
        offset
    }

    // -- Constants --

    fn alloc_const(&mut self, ty: ValueType, bits: u64) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            ty,
            constant: Some(bits),
            def: None,
            uses: Vec::new(),
            reg: None,
            local: None,
        });
        id
    }

    pub fn alloc_i8(&mut self, v: i8) -> ValueId {
        self.alloc_const(ValueType::I8, v as u8 as u64)
    }

    pub fn alloc_i16(&mut self, v: i16) -> ValueId {
        self.alloc_const(ValueType::I16, v as u16 as u64)
    }

    pub fn alloc_i32(&mut self, v: i32) -> ValueId {
        self.alloc_const(ValueType::I32, v as u32 as u64)
    }

    pub fn alloc_i64(&mut self, v: i64) -> ValueId {
        self.alloc_const(ValueType::I64, v as u64)
    }

    pub fn alloc_f32(&mut self, v: f32) -> ValueId {
        self.alloc_const(ValueType::F32, v.to_bits() as u64)
    }

    pub fn alloc_f64(&mut self, v: f64) -> ValueId {
        self.alloc_const(ValueType::F64, v.to_bits())
    }

    // -- Instruction plumbing --

    fn alloc_result(&mut self, ty: ValueType, def: InstrId) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            ty,
            constant: None,
            def: Some(def),
            uses: Vec::new(),
            reg: None,
            local: None,
        });
        id
    }

    /// Create an instruction without appending it to any block.
    /// Used by the register allocator when rebuilding instruction order.
    pub fn create_instr(
        &mut self,
        opc: Opcode,
        args: &[ValueId],
        result_ty: Option<ValueType>,
    ) -> InstrId {
        assert!(args.len() <= MAX_INSTR_ARGS);
        let id = InstrId(self.instrs.len() as u32);
        let mut instr = Instr::new(opc);
        for (n, &arg) in args.iter().enumerate() {
            instr.args[n] = Some(arg);
            self.values[arg.0 as usize].uses.push(Use { instr: id, arg: n });
        }
        instr.result = result_ty.map(|ty| self.alloc_result(ty, id));
        self.instrs.push(instr);
        id
    }

    fn append(
        &mut self,
        opc: Opcode,
        args: &[ValueId],
        result_ty: Option<ValueType>,
    ) -> Option<ValueId> {
        let id = self.create_instr(opc, args, result_ty);
        self.blocks[self.current_block].instrs.push(id);
        self.instrs[id.0 as usize].result
    }

    /// Rewrite argument `n` of `instr`, keeping use lists consistent.
    pub fn set_arg(&mut self, instr: InstrId, n: usize, val: ValueId) {
        if let Some(old) = self.instrs[instr.0 as usize].args[n] {
            self.values[old.0 as usize]
                .uses
                .retain(|u| !(u.instr == instr && u.arg == n));
        }
        self.instrs[instr.0 as usize].args[n] = Some(val);
        self.values[val.0 as usize].uses.push(Use { instr, arg: n });
    }

    /// Replace every use of `old` with `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) {
        let uses = std::mem::take(&mut self.values[old.0 as usize].uses);
        for u in uses {
            self.instrs[u.instr.0 as usize].args[u.arg] = Some(new);
            self.values[new.0 as usize].uses.push(u);
        }
    }

    /// Remove the instruction at `pos` in `block`, dropping its
    /// argument uses. The result value (if any) must be unused.
    pub fn remove_instr(&mut self, block: usize, pos: usize) {
        let id = self.blocks[block].instrs.remove(pos);
        self.drop_arg_uses(id);
    }

    fn drop_arg_uses(&mut self, id: InstrId) {
        for n in 0..MAX_INSTR_ARGS {
            if let Some(arg) = self.instrs[id.0 as usize].args[n].take() {
                self.values[arg.0 as usize]
                    .uses
                    .retain(|u| !(u.instr == id && u.arg == n));
            }
        }
    }

    /// Replace a block's instruction order wholesale (register
    /// allocation rebuilds the list with spill code inserted).
    pub fn set_block_instrs(&mut self, block: usize, instrs: Vec<InstrId>) {
        self.blocks[block].instrs = instrs;
    }

    // -- Guest state --

    pub fn load_context(&mut self, offset: i32, ty: ValueType) -> ValueId {
        let off = self.alloc_i32(offset);
        self.append(Opcode::LoadContext, &[off], Some(ty)).unwrap()
    }

    pub fn store_context(&mut self, offset: i32, v: ValueId) {
        let off = self.alloc_i32(offset);
        self.append(Opcode::StoreContext, &[off, v], None);
    }

    pub fn load_local(&mut self, slot: u32, ty: ValueType) -> ValueId {
        let off = self.alloc_i32(slot as i32);
        self.append(Opcode::LoadLocal, &[off], Some(ty)).unwrap()
    }

    pub fn store_local(&mut self, slot: u32, v: ValueId) {
        let off = self.alloc_i32(slot as i32);
        self.append(Opcode::StoreLocal, &[off, v], None);
    }

    // -- Guest memory --

    pub fn load_fast(&mut self, addr: ValueId, ty: ValueType) -> ValueId {
        self.append(Opcode::LoadFast, &[addr], Some(ty)).unwrap()
    }

    pub fn store_fast(&mut self, addr: ValueId, v: ValueId) {
        self.append(Opcode::StoreFast, &[addr, v], None);
    }

    pub fn load_slow(&mut self, addr: ValueId, ty: ValueType) -> ValueId {
        self.append(Opcode::LoadSlow, &[addr], Some(ty)).unwrap()
    }

    pub fn store_slow(&mut self, addr: ValueId, v: ValueId) {
        self.append(Opcode::StoreSlow, &[addr, v], None);
    }

    // -- ALU --

    fn binary(&mut self, opc: Opcode, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.value(a).ty;
        self.append(opc, &[a, b], Some(ty)).unwrap()
    }

    pub fn add(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(Opcode::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(Opcode::Sub, a, b)
    }

    pub fn and(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(Opcode::And, a, b)
    }

    pub fn or(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(Opcode::Or, a, b)
    }

    pub fn xor(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(Opcode::Xor, a, b)
    }

    pub fn not(&mut self, a: ValueId) -> ValueId {
        let ty = self.value(a).ty;
        self.append(Opcode::Not, &[a], Some(ty)).unwrap()
    }

    pub fn shl(&mut self, a: ValueId, n: ValueId) -> ValueId {
        self.binary(Opcode::Shl, a, n)
    }

    pub fn lshr(&mut self, a: ValueId, n: ValueId) -> ValueId {
        self.binary(Opcode::Lshr, a, n)
    }

    pub fn ashr(&mut self, a: ValueId, n: ValueId) -> ValueId {
        self.binary(Opcode::Ashr, a, n)
    }

    /// Compare; produces an I8 0/1 value.
    pub fn cmp(&mut self, a: ValueId, b: ValueId, op: CmpOp) -> ValueId {
        let opv = self.alloc_i32(op as i32);
        self.append(Opcode::Cmp, &[a, b, opv], Some(ValueType::I8))
            .unwrap()
    }

    // -- Width changes --

    pub fn sext(&mut self, v: ValueId, ty: ValueType) -> ValueId {
        self.append(Opcode::SExt, &[v], Some(ty)).unwrap()
    }

    pub fn zext(&mut self, v: ValueId, ty: ValueType) -> ValueId {
        self.append(Opcode::ZExt, &[v], Some(ty)).unwrap()
    }

    pub fn trunc(&mut self, v: ValueId, ty: ValueType) -> ValueId {
        self.append(Opcode::Trunc, &[v], Some(ty)).unwrap()
    }

    // -- Control flow --

    /// Unconditional block terminator: store `dest` to the guest PC and
    /// return to dispatch.
    pub fn branch(&mut self, dest: ValueId) {
        self.append(Opcode::Branch, &[dest], None);
    }

    /// Single-sided conditional branch, taken when `cond` is non-zero.
    /// Fall-through continues in the block; the frontend's synthetic
    /// terminator covers the not-taken exit.
    pub fn branch_cond(&mut self, cond: ValueId, dest: ValueId) {
        self.append(Opcode::BranchCond, &[cond, dest], None);
    }

    /// Escape to an interpreter fallback routine.
    ///
    /// `fn_addr` is the host address of an
    /// `extern "C" fn(ctx, guest_addr, raw_instr)` routine; `addr` and
    /// `raw` are the guest address and raw instruction word. The raw
    /// word is carried as a constant so the frontend can re-derive the
    /// descriptor of a trailing fallback.
    pub fn fallback(&mut self, fn_addr: u64, addr: u32, raw: u16) {
        let f = self.alloc_i64(fn_addr as i64);
        let a = self.alloc_i32(addr as i32);
        let r = self.alloc_i32(raw as i32);
        self.append(Opcode::Fallback, &[f, a, r], None);
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}
