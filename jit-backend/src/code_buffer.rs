use std::io;

use crate::BackendError;

/// Executable memory for emitted blocks.
///
/// A single anonymous read/write/execute mapping, filled front to back
/// by a cursor. Blocks are never freed individually: unlinking a block
/// strands its bytes, and `rewind(0)` reclaims the whole region at
/// once. The mapping is fixed for the lifetime of the buffer; there is
/// no growth path.
pub struct CodeBuffer {
    base: *mut u8,
    len: usize,
    cursor: usize,
}

// SAFETY: the mapping belongs to this buffer alone; nothing else
// unmaps or aliases it.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Mapping size for production use, when the embedder has no
    /// reason to pick another.
    pub const DEFAULT_SIZE: usize = 16 << 20;

    /// Map `size` bytes of executable memory, rounded up to whole
    /// pages.
    pub fn new(size: usize) -> Result<Self, BackendError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = size.div_ceil(page) * page;

        // SAFETY: fresh anonymous mapping, not backed by a file.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BackendError::Map(io::Error::last_os_error()));
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            cursor: 0,
        })
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    /// Start of the mapping.
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Address of an emitted offset.
    #[inline]
    pub fn offset_ptr(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.cursor);
        unsafe { self.base.add(offset) }
    }

    /// Move the cursor back, abandoning everything emitted past
    /// `offset`. Host addresses handed out beyond it are dead.
    pub fn rewind(&mut self, offset: usize) {
        assert!(offset <= self.cursor);
        self.cursor = offset;
    }

    /// Claim the next `n` bytes for writing.
    fn bump(&mut self, n: usize) -> *mut u8 {
        assert!(n <= self.remaining(), "jit code buffer exhausted");
        let p = unsafe { self.base.add(self.cursor) };
        self.cursor += n;
        p
    }

    /// Checked pointer to `n` mapped bytes at `offset`.
    fn slot(&self, offset: usize, n: usize) -> *mut u8 {
        assert!(offset + n <= self.len);
        unsafe { self.base.add(offset) }
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        unsafe { self.bump(1).write(val) };
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        unsafe { (self.bump(2) as *mut u16).write_unaligned(val) };
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        unsafe { (self.bump(4) as *mut u32).write_unaligned(val) };
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        unsafe { (self.bump(8) as *mut u64).write_unaligned(val) };
    }

    /// Rewrite a displacement emitted earlier (forward-branch fixup).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        unsafe { (self.slot(offset, 4) as *mut u32).write_unaligned(val) };
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        unsafe { (self.slot(offset, 4) as *const u32).read_unaligned() }
    }

    /// Everything emitted so far.
    pub fn emitted(&self) -> &[u8] {
        // SAFETY: bytes below the cursor have been written.
        unsafe { std::slice::from_raw_parts(self.base, self.cursor) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in new().
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tracks_emission() {
        let mut buf = CodeBuffer::new(1).unwrap();
        assert!(buf.capacity() >= 1); // page-rounded
        buf.emit_u8(0xc3);
        buf.emit_u16(0x9090);
        buf.emit_u32(0x0102_0304);
        assert_eq!(buf.offset(), 7);
        assert_eq!(buf.emitted()[0], 0xc3);
        assert_eq!(buf.read_u32(3), 0x0102_0304);
    }

    #[test]
    fn forward_patch_rewrites_displacement() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u8(0xe9);
        let disp = buf.offset();
        buf.emit_u32(0);
        buf.patch_u32(disp, 0x20);
        assert_eq!(buf.read_u32(disp), 0x20);
    }

    #[test]
    fn rewind_abandons_the_whole_region() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.emit_u64(0x1122_3344_5566_7788);
        buf.rewind(0);
        assert_eq!(buf.remaining(), buf.capacity());
        assert!(buf.emitted().is_empty());
    }
}
