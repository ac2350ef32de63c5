//! IR dump: human-readable text output for debugging and tests.

use std::fmt::Write;

use crate::builder::IrBuilder;
use crate::instr::ValueId;
use crate::opcode::Opcode;
use crate::types::CmpOp;

fn fmt_value(ir: &IrBuilder, id: ValueId, out: &mut String) {
    let v = ir.value(id);
    if let Some(bits) = v.constant {
        write!(out, "${bits:#x}").unwrap();
    } else {
        write!(out, "%{}", id.0).unwrap();
    }
}

/// Render the whole graph as text, one instruction per line.
pub fn dump(ir: &IrBuilder) -> String {
    let mut out = String::new();
    for block in 0..ir.num_blocks() {
        for &id in ir.block_instrs(block) {
            let instr = ir.instr(id);
            out.push_str("  ");
            if let Some(result) = instr.result {
                write!(out, "%{} = ", result.0).unwrap();
            }
            out.push_str(instr.opc.def().name);
            let mut first = true;
            for arg in instr.args.iter().flatten() {
                out.push_str(if first { " " } else { ", " });
                first = false;
                // The cmp condition argument reads better symbolically.
                if instr.opc == Opcode::Cmp && *arg == instr.arg(2) {
                    let op = CmpOp::from_raw(ir.value(*arg).u32_value());
                    out.push_str(op.name());
                } else {
                    fmt_value(ir, *arg, &mut out);
                }
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn dump_renders_results_and_constants() {
        let mut ir = IrBuilder::new();
        let v = ir.load_context(8, ValueType::I32);
        let dest = ir.alloc_i32(0x8c00_0010u32 as i32);
        ir.store_context(0, v);
        ir.branch(dest);

        let text = dump(&ir);
        assert!(text.contains("load_context"));
        assert!(text.contains("store_context"));
        assert!(text.contains("branch $0x8c000010"));
    }
}
