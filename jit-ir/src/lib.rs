//! Typed IR for the SH-4 dynamic recompiler.
//!
//! The frontend builds instructions into an arena-owned graph, the
//! pass pipeline rewrites it in place, and the backend lowers the
//! final form to host code. The arena is recycled between
//! translations.

pub mod builder;
pub mod dump;
pub mod instr;
pub mod opcode;
pub mod passes;
pub mod types;

pub use builder::IrBuilder;
pub use instr::{Instr, InstrId, Use, Value, ValueId, MAX_INSTR_ARGS};
pub use opcode::{OpDef, OpFlags, Opcode, OPCODE_DEFS};
pub use passes::{Pass, PassRunner, RegisterDef};
pub use types::{CmpOp, ValueType, FLOAT_TYPES, INT_TYPES};
