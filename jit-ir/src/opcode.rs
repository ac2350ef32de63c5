/// IR opcodes.
///
/// Guest memory traffic is split by emission mode: `LoadFast`/`StoreFast`
/// access guest memory through a raw host pointer (patchable on fault),
/// `LoadSlow`/`StoreSlow` go through the guarded `MemoryInterface`
/// handlers. `LoadContext`/`StoreContext` access the guest register file
/// at a fixed byte offset; `LoadLocal`/`StoreLocal` are spill slots
/// introduced by register allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // -- Guest state --
    LoadContext = 0,
    StoreContext,

    // -- Spill slots --
    LoadLocal,
    StoreLocal,

    // -- Guest memory --
    LoadFast,
    StoreFast,
    LoadSlow,
    StoreSlow,

    // -- ALU --
    Add,
    Sub,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Lshr,
    Ashr,
    Cmp,

    // -- Width changes --
    SExt,
    ZExt,
    Trunc,

    // -- Control flow --
    Branch,
    BranchCond,

    // -- Interpreter escape --
    Fallback,

    // Sentinel — must be last
    Count,
}

/// Flags describing properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u16);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Has observable side effects; cannot be eliminated.
    pub const SIDE_EFFECTS: OpFlags = OpFlags(0x01);
    /// Redirects control flow out of the block.
    pub const BRANCH: OpFlags = OpFlags(0x02);
    /// Lowered to a host call; clobbers caller-saved registers.
    pub const CALL: OpFlags = OpFlags(0x04);
    /// Reads or writes guest context memory.
    pub const CONTEXT: OpFlags = OpFlags(0x08);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Static definition of an opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub flags: OpFlags,
}

// Helper to combine flags in const context.
const fn f(a: OpFlags, b: OpFlags) -> OpFlags {
    OpFlags(a.bits() | b.bits())
}

const SE: OpFlags = OpFlags::SIDE_EFFECTS;
const BR: OpFlags = OpFlags::BRANCH;
const CA: OpFlags = OpFlags::CALL;
const CX: OpFlags = OpFlags::CONTEXT;
const N: OpFlags = OpFlags::NONE;

/// Static opcode definition table, indexed by `Opcode as usize`.
pub static OPCODE_DEFS: [OpDef; Opcode::Count as usize] = [
    OpDef { name: "load_context", flags: CX },
    OpDef { name: "store_context", flags: f(SE, CX) },
    OpDef { name: "load_local", flags: N },
    OpDef { name: "store_local", flags: SE },
    OpDef { name: "load_fast", flags: N },
    OpDef { name: "store_fast", flags: SE },
    // Slow loads can hit MMIO; the read itself is observable.
    OpDef { name: "load_slow", flags: f(SE, CA) },
    OpDef { name: "store_slow", flags: f(SE, CA) },
    OpDef { name: "add", flags: N },
    OpDef { name: "sub", flags: N },
    OpDef { name: "and", flags: N },
    OpDef { name: "or", flags: N },
    OpDef { name: "xor", flags: N },
    OpDef { name: "not", flags: N },
    OpDef { name: "shl", flags: N },
    OpDef { name: "lshr", flags: N },
    OpDef { name: "ashr", flags: N },
    OpDef { name: "cmp", flags: N },
    OpDef { name: "sext", flags: N },
    OpDef { name: "zext", flags: N },
    OpDef { name: "trunc", flags: N },
    OpDef { name: "branch", flags: f(SE, BR) },
    OpDef { name: "branch_cond", flags: f(SE, BR) },
    OpDef { name: "fallback", flags: f(f(SE, CA), CX) },
];

impl Opcode {
    #[inline]
    pub fn def(self) -> &'static OpDef {
        &OPCODE_DEFS[self as usize]
    }

    #[inline]
    pub fn has_side_effects(self) -> bool {
        self.def().flags.contains(OpFlags::SIDE_EFFECTS)
    }

    #[inline]
    pub fn is_branch(self) -> bool {
        self.def().flags.contains(OpFlags::BRANCH)
    }

    #[inline]
    pub fn is_call(self) -> bool {
        self.def().flags.contains(OpFlags::CALL)
    }
}
