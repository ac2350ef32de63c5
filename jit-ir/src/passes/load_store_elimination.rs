use crate::builder::IrBuilder;
use crate::instr::{InstrId, ValueId};
use crate::opcode::{OpFlags, Opcode};
use crate::passes::Pass;

/// One context slot whose current value is known.
struct Avail {
    offset: i32,
    size: u32,
    value: ValueId,
}

/// A context store that has not been observed by a later load and may
/// still turn out to be dead.
struct PendingStore {
    offset: i32,
    size: u32,
    instr: InstrId,
}

fn overlaps(a_off: i32, a_size: u32, b_off: i32, b_size: u32) -> bool {
    a_off < b_off + b_size as i32 && b_off < a_off + a_size as i32
}

/// Load/store elimination over guest context slots.
///
/// Along a straight-line run, a context load is replaced by the value
/// most recently stored to (or loaded from) the same slot, and a
/// context store is removed when a later store fully overwrites it with
/// no intervening load. Any instruction that may branch or call out
/// resets the tracked state: fallbacks and slow memory handlers can
/// rewrite the context wholesale.
pub struct LoadStoreEliminationPass;

impl Pass for LoadStoreEliminationPass {
    fn name(&self) -> &'static str {
        "load_store_elimination"
    }

    fn run(&mut self, ir: &mut IrBuilder) {
        for block in 0..ir.num_blocks() {
            self.run_block(ir, block);
        }
    }
}

impl LoadStoreEliminationPass {
    fn run_block(&mut self, ir: &mut IrBuilder, block: usize) {
        let mut avail: Vec<Avail> = Vec::new();
        let mut pending: Vec<PendingStore> = Vec::new();
        let mut removed: Vec<InstrId> = Vec::new();

        let order: Vec<InstrId> = ir.block_instrs(block).to_vec();
        for &id in &order {
            let instr = ir.instr(id).clone();
            let flags = instr.opc.def().flags;

            if flags.contains(OpFlags::CALL) || flags.contains(OpFlags::BRANCH)
            {
                avail.clear();
                pending.clear();
                continue;
            }

            match instr.opc {
                Opcode::LoadContext => {
                    let offset = ir.value(instr.arg(0)).i64_value() as i32;
                    let result = instr.result.unwrap();
                    let ty = ir.value(result).ty;
                    let size = ty.size_bytes();

                    pending.retain(|p| !overlaps(p.offset, p.size, offset, size));

                    let hit = avail.iter().find(|a| {
                        a.offset == offset
                            && a.size == size
                            && ir.value(a.value).ty == ty
                    });
                    if let Some(a) = hit {
                        let known = a.value;
                        ir.replace_uses(result, known);
                        removed.push(id);
                    } else {
                        avail.retain(|a| {
                            !(a.offset == offset && a.size == size)
                        });
                        avail.push(Avail {
                            offset,
                            size,
                            value: result,
                        });
                    }
                }
                Opcode::StoreContext => {
                    let offset = ir.value(instr.arg(0)).i64_value() as i32;
                    let value = instr.arg(1);
                    let size = ir.value(value).ty.size_bytes();

                    pending.retain(|p| {
                        if overlaps(p.offset, p.size, offset, size) {
                            if offset <= p.offset
                                && p.offset + p.size as i32
                                    <= offset + size as i32
                            {
                                // Fully overwritten, never observed.
                                removed.push(p.instr);
                            }
                            false
                        } else {
                            true
                        }
                    });

                    avail.retain(|a| !overlaps(a.offset, a.size, offset, size));
                    avail.push(Avail {
                        offset,
                        size,
                        value,
                    });
                    pending.push(PendingStore {
                        offset,
                        size,
                        instr: id,
                    });
                }
                _ => {}
            }
        }

        if removed.is_empty() {
            return;
        }
        let mut pos = ir.block_instrs(block).len();
        while pos > 0 {
            pos -= 1;
            let id = ir.block_instrs(block)[pos];
            if removed.contains(&id) {
                ir.remove_instr(block, pos);
            }
        }
    }
}
