//! Process-level exception handler registry.
//!
//! The OS-specific signal/SEH shim converts a hardware fault into an
//! `Exception` and calls `exception_handler_dispatch` on the faulting
//! thread. Handlers run in registration order; the first one to return
//! true owns the fault. On unanimous decline the shim is expected to
//! fall back to the OS default action.

use std::ffi::c_void;
use std::sync::Mutex;

/// What kind of access faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Saved host thread state at the fault point.
///
/// `r` is indexed by the x86-64 register encoding (rax = 0 .. r15 = 15).
/// Handlers may rewrite both the registers and `pc`; the shim writes
/// the state back before resuming.
#[derive(Debug, Clone, Default)]
pub struct ThreadState {
    pub r: [u64; 16],
    pub pc: u64,
}

/// An access violation surfaced to registered handlers.
#[derive(Debug, Clone)]
pub struct Exception {
    pub access: AccessKind,
    /// Host data address of the faulting access.
    pub fault_addr: usize,
    pub state: ThreadState,
}

impl Exception {
    /// Faulting host instruction address.
    pub fn pc(&self) -> usize {
        self.state.pc as usize
    }
}

/// Registered callback: `(user, exception) -> handled`.
///
/// # Safety
/// `user` is the pointer passed to `exception_handler_add` and must
/// still reference a live object when a fault is dispatched.
pub type ExceptionHandlerFn = unsafe fn(*mut c_void, &mut Exception) -> bool;

/// Handle returned by `exception_handler_add`, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerHandle(usize);

struct HandlerSlot {
    user: *mut c_void,
    cb: ExceptionHandlerFn,
}

// SAFETY: dispatch runs synchronously on the faulting thread; the
// registry only stores the pointers, it never dereferences them.
unsafe impl Send for HandlerSlot {}

static HANDLERS: Mutex<Vec<Option<HandlerSlot>>> = Mutex::new(Vec::new());

/// Register an exception handler. The handler stays installed until
/// `exception_handler_remove` is called with the returned handle.
pub fn exception_handler_add(
    user: *mut c_void,
    cb: ExceptionHandlerFn,
) -> HandlerHandle {
    let mut handlers = HANDLERS.lock().unwrap();
    let slot = HandlerSlot { user, cb };
    match handlers.iter().position(|h| h.is_none()) {
        Some(i) => {
            handlers[i] = Some(slot);
            HandlerHandle(i)
        }
        None => {
            handlers.push(Some(slot));
            HandlerHandle(handlers.len() - 1)
        }
    }
}

/// Deregister a handler.
pub fn exception_handler_remove(handle: HandlerHandle) {
    let mut handlers = HANDLERS.lock().unwrap();
    handlers[handle.0] = None;
}

/// Offer an exception to every registered handler in order.
/// Returns true as soon as one handles it.
pub fn exception_handler_dispatch(ex: &mut Exception) -> bool {
    let slots: Vec<(*mut c_void, ExceptionHandlerFn)> = {
        let handlers = HANDLERS.lock().unwrap();
        handlers
            .iter()
            .flatten()
            .map(|s| (s.user, s.cb))
            .collect()
    };
    for (user, cb) in slots {
        // SAFETY: the registrant guarantees `user` outlives its
        // registration (handlers deregister on drop).
        if unsafe { cb(user, ex) } {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn count_and_decline(user: *mut c_void, _ex: &mut Exception) -> bool {
        *(user as *mut u32) += 1;
        false
    }

    unsafe fn claim(user: *mut c_void, _ex: &mut Exception) -> bool {
        *(user as *mut u32) += 1;
        true
    }

    fn test_exception() -> Exception {
        Exception {
            access: AccessKind::Read,
            fault_addr: 0x1000,
            state: ThreadState::default(),
        }
    }

    #[test]
    fn dispatch_stops_at_first_claim() {
        let mut a = 0u32;
        let mut b = 0u32;
        let ha = exception_handler_add(&mut a as *mut u32 as *mut c_void, claim);
        let hb = exception_handler_add(
            &mut b as *mut u32 as *mut c_void,
            count_and_decline,
        );

        assert!(exception_handler_dispatch(&mut test_exception()));
        assert_eq!(a, 1);
        assert_eq!(b, 0);

        exception_handler_remove(ha);
        exception_handler_remove(hb);
    }

    #[test]
    fn unanimous_decline_returns_false() {
        let mut a = 0u32;
        let ha = exception_handler_add(
            &mut a as *mut u32 as *mut c_void,
            count_and_decline,
        );
        assert!(!exception_handler_dispatch(&mut test_exception()));
        assert_eq!(a, 1);
        exception_handler_remove(ha);
    }
}
