//! Machine-code backend for the SH-4 dynamic recompiler.
//!
//! Owns the executable code buffer, lowers optimized IR to host
//! instructions, and services fastmem faults raised by its own code.
//! The exception handler registry lives here as well; the OS-specific
//! signal shim that feeds it is outside this crate.

pub mod code_buffer;
pub mod exception;
pub mod x86_64;

pub use code_buffer::CodeBuffer;
pub use exception::{
    exception_handler_add, exception_handler_dispatch, exception_handler_remove,
    AccessKind, Exception, HandlerHandle, ThreadState,
};
pub use x86_64::X64Backend;

use std::ffi::c_void;

use jit_ir::{IrBuilder, RegisterDef};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("code buffer mapping failed: {0}")]
    Map(#[from] std::io::Error),
}

/// Guarded guest memory access handlers plus the fastmem mapping.
///
/// `mem_base` is the host base of the mapped guest address space used
/// by fastmem accesses; the `r*`/`w*` handlers are the slow path, each
/// receiving `mem_self` back as its first argument.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInterface {
    pub mem_self: *mut c_void,
    pub mem_base: *mut u8,
    pub r8: extern "C" fn(*mut c_void, u32) -> u8,
    pub r16: extern "C" fn(*mut c_void, u32) -> u16,
    pub r32: extern "C" fn(*mut c_void, u32) -> u32,
    pub r64: extern "C" fn(*mut c_void, u32) -> u64,
    pub w8: extern "C" fn(*mut c_void, u32, u8),
    pub w16: extern "C" fn(*mut c_void, u32, u16),
    pub w32: extern "C" fn(*mut c_void, u32, u32),
    pub w64: extern "C" fn(*mut c_void, u32, u64),
}

/// Backend capability set consumed by the code cache.
///
/// There is exactly one production implementation (`X64Backend`); the
/// trait exists so the cache can be exercised against a mock.
pub trait Backend {
    /// Register file advertised to the register allocation pass.
    fn registers(&self) -> &'static [RegisterDef];

    fn num_registers(&self) -> usize {
        self.registers().len()
    }

    /// Assemble final IR into the code buffer. Returns the host
    /// address and size of the emitted region, or `None` when the
    /// buffer would overflow (the caller resets and retries).
    fn assemble(&mut self, ir: &IrBuilder) -> Option<(*const u8, usize)>;

    /// Reclaim the whole code buffer. Every previously-returned host
    /// address becomes invalid.
    fn reset(&mut self);

    /// Attempt to recover from an access violation inside emitted
    /// code. On `true` the thread state has been adjusted so execution
    /// resumes as if the access had gone through the slow path.
    fn handle_fastmem(&mut self, ex: &mut Exception) -> bool;
}
