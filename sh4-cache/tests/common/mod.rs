//! Shared test harness: a small guest machine (RAM + context), the
//! memory interface handlers over it, and a mock backend for cache
//! lifecycle tests that don't need real host code.

#![allow(dead_code)]

use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

use jit_backend::{Backend, Exception, MemoryInterface};
use jit_ir::{IrBuilder, RegisterDef};
use sh4_frontend::{context, Sh4Context, Sh4Frontend, Sh4Guest};

pub const BASE: u32 = 0x8c00_0000;
pub const RAM_SIZE: usize = 0x1_0000;
/// Small dispatch window for tests (32K slots).
pub const ADDR_MASK: u32 = 0xffff;

/// Guest RAM and context with stable addresses (always boxed).
pub struct Machine {
    pub ram: Vec<u8>,
    pub ctx: Sh4Context,
}

impl Machine {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            ram: vec![0; RAM_SIZE],
            ctx: Sh4Context::default(),
        })
    }

    pub fn load_program(&mut self, addr: u32, words: &[u16]) {
        let mut i = (addr as usize) & (RAM_SIZE - 1);
        for w in words {
            self.ram[i..i + 2].copy_from_slice(&w.to_le_bytes());
            i += 2;
        }
    }

    pub fn guest(&mut self) -> Sh4Guest {
        Sh4Guest {
            space: self as *mut Machine as *mut c_void,
            r8: g_r8,
            r16: g_r16,
            r32: g_r32,
            ctx: &mut self.ctx,
        }
    }

    pub fn memif(&mut self) -> MemoryInterface {
        MemoryInterface {
            mem_self: self as *mut Machine as *mut c_void,
            mem_base: self.ram.as_mut_ptr(),
            r8: m_r8,
            r16: m_r16,
            r32: m_r32,
            r64: m_r64,
            w8: m_w8,
            w16: m_w16,
            w32: m_w32,
            w64: m_w64,
        }
    }
}

fn ram(space: *mut c_void) -> &'static mut Vec<u8> {
    unsafe { &mut (*(space as *mut Machine)).ram }
}

fn idx(addr: u32) -> usize {
    (addr as usize) & (RAM_SIZE - 1)
}

extern "C" fn g_r8(space: *mut c_void, addr: u32) -> u8 {
    ram(space)[idx(addr)]
}

extern "C" fn g_r16(space: *mut c_void, addr: u32) -> u16 {
    let m = ram(space);
    let i = idx(addr);
    u16::from_le_bytes([m[i], m[i + 1]])
}

extern "C" fn g_r32(space: *mut c_void, addr: u32) -> u32 {
    let m = ram(space);
    let i = idx(addr);
    u32::from_le_bytes([m[i], m[i + 1], m[i + 2], m[i + 3]])
}

extern "C" fn m_r8(space: *mut c_void, addr: u32) -> u8 {
    g_r8(space, addr)
}

extern "C" fn m_r16(space: *mut c_void, addr: u32) -> u16 {
    g_r16(space, addr)
}

extern "C" fn m_r32(space: *mut c_void, addr: u32) -> u32 {
    g_r32(space, addr)
}

extern "C" fn m_r64(space: *mut c_void, addr: u32) -> u64 {
    let lo = g_r32(space, addr) as u64;
    let hi = g_r32(space, addr + 4) as u64;
    (hi << 32) | lo
}

extern "C" fn m_w8(space: *mut c_void, addr: u32, val: u8) {
    ram(space)[idx(addr)] = val;
}

extern "C" fn m_w16(space: *mut c_void, addr: u32, val: u16) {
    let i = idx(addr);
    ram(space)[i..i + 2].copy_from_slice(&val.to_le_bytes());
}

extern "C" fn m_w32(space: *mut c_void, addr: u32, val: u32) {
    let i = idx(addr);
    ram(space)[i..i + 4].copy_from_slice(&val.to_le_bytes());
}

extern "C" fn m_w64(space: *mut c_void, addr: u32, val: u64) {
    let i = idx(addr);
    ram(space)[i..i + 8].copy_from_slice(&val.to_le_bytes());
}

/// Serializes tests that construct a cache: every cache registers in
/// the process-level exception registry, and a concurrently-dispatched
/// fault must never race a cache under mutation on another thread.
pub fn registry_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    let _ = env_logger::builder().is_test(true).try_init();
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// The default trampoline sentinel. Tests only compare the pointer.
static DEFAULT_TRAMPOLINE: u8 = 0xc3;

pub fn default_code() -> *const u8 {
    &DEFAULT_TRAMPOLINE
}

pub fn frontend(machine: &mut Machine) -> Sh4Frontend {
    Sh4Frontend::new(machine.guest())
}

pub fn pc_offset() -> i32 {
    context::pc_offset()
}

/// Backend double: hands out fake host regions from a bump counter
/// and claims every fastmem fault inside one of them.
pub struct MockBackend {
    capacity: usize,
    used: usize,
    block_size: usize,
    base: usize,
    pub resets: usize,
}

impl MockBackend {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            capacity,
            used: 0,
            block_size,
            base: 0x5000_0000,
            resets: 0,
        }
    }
}

impl Backend for MockBackend {
    fn registers(&self) -> &'static [RegisterDef] {
        &jit_backend::x86_64::REGISTERS
    }

    fn assemble(&mut self, _ir: &IrBuilder) -> Option<(*const u8, usize)> {
        if self.capacity - self.used < self.block_size {
            return None;
        }
        let addr = self.base + self.used;
        self.used += self.block_size;
        Some((addr as *const u8, self.block_size))
    }

    fn reset(&mut self) {
        self.used = 0;
        self.resets += 1;
    }

    fn handle_fastmem(&mut self, ex: &mut Exception) -> bool {
        let pc = ex.pc();
        pc >= self.base && pc < self.base + self.used
    }
}
