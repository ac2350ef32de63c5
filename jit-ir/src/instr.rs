use crate::opcode::Opcode;
use crate::types::ValueType;

/// Maximum number of value arguments per IR instruction.
pub const MAX_INSTR_ARGS: usize = 3;

/// Index into the builder's value arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// Index into the builder's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

/// A single use of a value: which instruction, which argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub instr: InstrId,
    pub arg: usize,
}

/// An IR value: either a compile-time constant or the result of an
/// instruction. Use lists are maintained by the builder so passes can
/// replace and count consumers without rescanning the graph.
#[derive(Debug, Clone)]
pub struct Value {
    pub ty: ValueType,
    /// Bit pattern for constants (f32 constants store their raw bits).
    pub constant: Option<u64>,
    /// Defining instruction; `None` for constants.
    pub def: Option<InstrId>,
    pub uses: Vec<Use>,
    /// Register assigned by the allocation pass, an index into the
    /// backend's `registers()` table.
    pub reg: Option<u8>,
    /// Spill slot byte offset, if the allocator spilled this value.
    pub local: Option<u32>,
}

impl Value {
    pub fn is_const(&self) -> bool {
        self.constant.is_some()
    }

    /// Constant value as i64 (sign-extended from the value's width).
    pub fn i64_value(&self) -> i64 {
        let bits = self.constant.expect("i64_value on non-constant");
        match self.ty {
            ValueType::I8 => bits as u8 as i8 as i64,
            ValueType::I16 => bits as u16 as i16 as i64,
            ValueType::I32 => bits as u32 as i32 as i64,
            _ => bits as i64,
        }
    }

    /// Constant value as u32 (truncated).
    pub fn u32_value(&self) -> u32 {
        self.constant.expect("u32_value on non-constant") as u32
    }
}

/// A single IR instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    pub opc: Opcode,
    pub args: [Option<ValueId>; MAX_INSTR_ARGS],
    pub result: Option<ValueId>,
}

impl Instr {
    pub fn new(opc: Opcode) -> Self {
        Self {
            opc,
            args: [None; MAX_INSTR_ARGS],
            result: None,
        }
    }

    pub fn arg(&self, n: usize) -> ValueId {
        self.args[n].expect("missing instruction argument")
    }
}

/// An ordered run of instructions. The frontend emits a single block
/// per translation unit; passes operate block-at-a-time.
#[derive(Debug, Default)]
pub struct IrBlock {
    pub instrs: Vec<InstrId>,
}
