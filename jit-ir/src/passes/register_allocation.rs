use crate::builder::IrBuilder;
use crate::instr::{InstrId, ValueId, MAX_INSTR_ARGS};
use crate::opcode::Opcode;
use crate::passes::Pass;
use crate::types::ValueType;

/// One allocatable host register, advertised by the backend.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub name: &'static str,
    /// `ValueType::mask()` bits this register can hold.
    pub value_types: u8,
    /// Backend-specific register number.
    pub encoding: u8,
    /// Clobbered by host calls; live values here must be spilled
    /// across call-type instructions.
    pub caller_saved: bool,
}

/// Register allocation.
///
/// Linear scan over each block against the backend's register table.
/// Values are assigned a register at their defining instruction and
/// keep it until their last use; on pressure the value with the
/// furthest next use is spilled through `StoreLocal`/`LoadLocal`.
/// Values parked in caller-saved registers are spilled across
/// call-type instructions (slow memory handlers, fallbacks).
///
/// Reloads split the value: the reload produces a fresh value and all
/// later uses are rewritten to it, so every value occupies exactly one
/// register for its whole life.
pub struct RegisterAllocationPass {
    registers: &'static [RegisterDef],
}

impl RegisterAllocationPass {
    pub fn new(registers: &'static [RegisterDef]) -> Self {
        assert!(registers.len() <= 64);
        Self { registers }
    }
}

impl Pass for RegisterAllocationPass {
    fn name(&self) -> &'static str {
        "register_allocation"
    }

    fn run(&mut self, ir: &mut IrBuilder) {
        for block in 0..ir.num_blocks() {
            let mut alloc = BlockAlloc {
                registers: self.registers,
                owner: vec![None; self.registers.len()],
                order: ir.block_instrs(block).to_vec(),
            };
            alloc.run(ir);
            let order = std::mem::take(&mut alloc.order);
            ir.set_block_instrs(block, order);
        }
    }
}

struct BlockAlloc {
    registers: &'static [RegisterDef],
    /// Value currently occupying each register, by table index.
    owner: Vec<Option<ValueId>>,
    order: Vec<InstrId>,
}

impl BlockAlloc {
    fn run(&mut self, ir: &mut IrBuilder) {
        let mut i = 0;
        while i < self.order.len() {
            let id = self.order[i];

            // Reload any spilled arguments, splitting the value.
            for n in 0..MAX_INSTR_ARGS {
                let Some(arg) = ir.instr(id).args[n] else { continue };
                let value = ir.value(arg);
                if value.is_const() || self.reg_of(arg).is_some() {
                    continue;
                }
                let slot = value
                    .local
                    .expect("use of value that is neither live nor spilled");
                let ty = value.ty;
                i = self.reload(ir, i, arg, slot, ty, id);
            }

            // Calls clobber caller-saved registers: park live values.
            if ir.instr(id).opc.is_call() {
                for r in 0..self.registers.len() {
                    if !self.registers[r].caller_saved {
                        continue;
                    }
                    if let Some(v) = self.owner[r] {
                        // A use at the call itself reads the register
                        // before the callee runs; only later uses need
                        // the value saved.
                        if self.has_use_after(ir, i + 1, v) {
                            i = self.spill(ir, i, v);
                        }
                        self.owner[r] = None;
                    }
                }
            }

            // Free registers whose value dies at this instruction.
            for n in 0..MAX_INSTR_ARGS {
                let Some(arg) = ir.instr(id).args[n] else { continue };
                if ir.value(arg).is_const() {
                    continue;
                }
                if !self.has_use_after(ir, i + 1, arg) {
                    if let Some(r) = self.reg_of(arg) {
                        self.owner[r] = None;
                    }
                }
            }

            // Allocate the result register.
            if let Some(result) = ir.instr(id).result {
                if !ir.value(result).uses.is_empty() {
                    let ty = ir.value(result).ty;
                    let (r, ni) = self.alloc_reg(ir, i, ty, id);
                    i = ni;
                    ir.value_mut(result).reg = Some(r as u8);
                    self.owner[r] = Some(result);
                }
            }

            i += 1;
        }
    }

    /// Register currently holding `v`, if it is live.
    fn reg_of(&self, v: ValueId) -> Option<usize> {
        self.owner.iter().position(|&o| o == Some(v))
    }

    fn uses_at(&self, ir: &IrBuilder, pos: usize, v: ValueId) -> bool {
        let id = self.order[pos];
        ir.instr(id).args.iter().any(|&a| a == Some(v))
    }

    /// First position >= `pos` that uses `v`, if any.
    fn next_use(&self, ir: &IrBuilder, pos: usize, v: ValueId) -> Option<usize> {
        (pos..self.order.len()).find(|&p| self.uses_at(ir, p, v))
    }

    fn has_use_after(&self, ir: &IrBuilder, pos: usize, v: ValueId) -> bool {
        self.next_use(ir, pos, v).is_some()
    }

    /// Pick a register for `ty`, spilling the furthest-used victim if
    /// the class is full. Values consumed by `user` are never evicted.
    /// Returns the register and the (possibly advanced) position of
    /// the current instruction.
    fn alloc_reg(
        &mut self,
        ir: &mut IrBuilder,
        mut i: usize,
        ty: ValueType,
        user: InstrId,
    ) -> (usize, usize) {
        let class =
            |r: usize| self.registers[r].value_types & ty.mask() != 0;

        if let Some(r) = (0..self.registers.len())
            .find(|&r| class(r) && self.owner[r].is_none())
        {
            return (r, i);
        }

        // Evict the live value with the furthest next use.
        let mut victim: Option<(usize, usize)> = None; // (reg, next_use)
        for r in (0..self.registers.len()).filter(|&r| class(r)) {
            let v = self.owner[r].unwrap();
            if ir.instr(user).args.iter().any(|&a| a == Some(v)) {
                continue;
            }
            let nu = self.next_use(ir, i, v).unwrap_or(usize::MAX);
            if victim.map_or(true, |(_, best)| nu > best) {
                victim = Some((r, nu));
            }
        }
        let (r, _) = victim.expect("register class exhausted by one instruction");
        let v = self.owner[r].unwrap();
        i = self.spill(ir, i, v);
        self.owner[r] = None;
        (r, i)
    }

    /// Insert `store_local` for `v` before position `i`.
    /// Returns the new position of the instruction that was at `i`.
    fn spill(&mut self, ir: &mut IrBuilder, i: usize, v: ValueId) -> usize {
        let slot = match ir.value(v).local {
            Some(slot) => slot,
            None => {
                let slot = ir.alloc_local();
                ir.value_mut(v).local = Some(slot);
                slot
            }
        };
        let off = ir.alloc_i32(slot as i32);
        let store = ir.create_instr(Opcode::StoreLocal, &[off, v], None);
        self.order.insert(i, store);
        i + 1
    }

    /// Insert `load_local` before position `i`, producing a fresh
    /// value that replaces `v` in every instruction from `i` on.
    /// Returns the new position of the instruction that was at `i`.
    fn reload(
        &mut self,
        ir: &mut IrBuilder,
        i: usize,
        v: ValueId,
        slot: u32,
        ty: ValueType,
        user: InstrId,
    ) -> usize {
        let (r, i) = self.alloc_reg(ir, i, ty, user);
        let off = ir.alloc_i32(slot as i32);
        let load = ir.create_instr(Opcode::LoadLocal, &[off], Some(ty));
        let reloaded = ir.instr(load).result.unwrap();
        self.order.insert(i, load);
        let i = i + 1;

        for pos in i..self.order.len() {
            let id = self.order[pos];
            for n in 0..MAX_INSTR_ARGS {
                if ir.instr(id).args[n] == Some(v) {
                    ir.set_arg(id, n, reloaded);
                }
            }
        }

        ir.value_mut(reloaded).reg = Some(r as u8);
        ir.value_mut(reloaded).local = Some(slot);
        self.owner[r] = Some(reloaded);
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    static TEST_REGS: [RegisterDef; 3] = [
        RegisterDef {
            name: "a",
            value_types: crate::types::INT_TYPES,
            encoding: 0,
            caller_saved: false,
        },
        RegisterDef {
            name: "b",
            value_types: crate::types::INT_TYPES,
            encoding: 1,
            caller_saved: false,
        },
        RegisterDef {
            name: "c",
            value_types: crate::types::INT_TYPES,
            encoding: 2,
            caller_saved: true,
        },
    ];

    fn assert_args_allocated(ir: &IrBuilder) {
        for block in 0..ir.num_blocks() {
            for &id in ir.block_instrs(block) {
                let instr = ir.instr(id);
                for arg in instr.args.iter().flatten() {
                    let v = ir.value(*arg);
                    assert!(
                        v.is_const() || v.reg.is_some(),
                        "unallocated argument of {}",
                        instr.opc.def().name
                    );
                }
            }
        }
    }

    #[test]
    fn straight_line_fits_in_registers() {
        let mut ir = IrBuilder::new();
        let a = ir.load_context(0, ValueType::I32);
        let b = ir.load_context(4, ValueType::I32);
        let sum = ir.add(a, b);
        ir.store_context(8, sum);

        RegisterAllocationPass::new(&TEST_REGS).run(&mut ir);

        assert_args_allocated(&ir);
        assert_eq!(ir.locals_size(), 0);
    }

    #[test]
    fn pressure_inserts_spills() {
        let mut ir = IrBuilder::new();
        // Four simultaneously-live values against three registers.
        let v: Vec<_> = (0..4)
            .map(|n| ir.load_context(n * 4, ValueType::I32))
            .collect();
        for (n, &val) in v.iter().enumerate() {
            ir.store_context(0x20 + n as i32 * 4, val);
        }

        RegisterAllocationPass::new(&TEST_REGS).run(&mut ir);

        assert_args_allocated(&ir);
        assert!(ir.locals_size() > 0);
        let spills = ir
            .block_instrs(0)
            .iter()
            .filter(|&&id| {
                matches!(
                    ir.instr(id).opc,
                    Opcode::StoreLocal | Opcode::LoadLocal
                )
            })
            .count();
        assert!(spills >= 2);
    }

    #[test]
    fn call_spills_caller_saved_values() {
        let mut ir = IrBuilder::new();
        // Fill both callee-saved registers, then define a value that
        // must land in the caller-saved one and survive a slow store.
        let a = ir.load_context(0, ValueType::I32);
        let b = ir.load_context(4, ValueType::I32);
        let c = ir.load_context(8, ValueType::I32);
        let addr = ir.alloc_i32(0x8c00_0000u32 as i32);
        ir.store_slow(addr, a);
        ir.store_context(0x20, c);
        ir.store_context(0x24, b);

        RegisterAllocationPass::new(&TEST_REGS).run(&mut ir);

        assert_args_allocated(&ir);
        // c lived in the caller-saved register across the call.
        assert!(ir.locals_size() > 0);
    }
}
