use crate::builder::IrBuilder;
use crate::passes::Pass;

/// Dead code elimination.
///
/// Reverse sweep per block: an instruction with no side effects whose
/// result has no consumers is removed. Walking backwards lets removals
/// cascade through chains of dead producers in a single sweep.
pub struct DeadCodeEliminationPass;

impl Pass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run(&mut self, ir: &mut IrBuilder) {
        for block in 0..ir.num_blocks() {
            let mut pos = ir.block_instrs(block).len();
            while pos > 0 {
                pos -= 1;
                let id = ir.block_instrs(block)[pos];
                let instr = ir.instr(id);
                if instr.opc.has_side_effects() {
                    continue;
                }
                let dead = match instr.result {
                    Some(result) => ir.value(result).uses.is_empty(),
                    None => true,
                };
                if dead {
                    ir.remove_instr(block, pos);
                }
            }
        }
    }
}
