//! Interpreter fallback routines invoked from translated code.

use crate::context::{Sh4Context, EXC_ILLEGAL_INSTR};

/// Illegal-instruction fallback: records the fault in the guest
/// context for the dispatch loop to service.
pub extern "C" fn sh4_invalid_instr(ctx: *mut Sh4Context, addr: u32, raw: u32) {
    // SAFETY: translated code always passes the context it runs under.
    let ctx = unsafe { &mut *ctx };
    ctx.exception = EXC_ILLEGAL_INSTR;
    ctx.pc = addr;
    log::warn!("illegal instruction {raw:#06x} at {addr:#010x}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_fault_in_context() {
        let mut ctx = Sh4Context::default();
        sh4_invalid_instr(&mut ctx, 0x8c00_0010, 0xfffd);
        assert_eq!(ctx.exception, EXC_ILLEGAL_INSTR);
        assert_eq!(ctx.pc, 0x8c00_0010);
    }
}
