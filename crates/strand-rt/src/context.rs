// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution context: the narrow unsafe boundary over the OS context-swap
//! primitive (POSIX ucontext). Raw stack pointers and `ucontext_t` never
//! leave this crate.

use std::cell::UnsafeCell;

use crate::stack::Stack;

/// Saved CPU register state plus a stack descriptor.
///
/// The state is boxed so its address stays stable while the owning
/// `Fiber` value moves between suspensions; a swap writes through a
/// pointer captured before control transfers.
pub(crate) struct ExecutionContext {
    ctx: Box<UnsafeCell<libc::ucontext_t>>,
}

impl ExecutionContext {
    /// Capture the calling thread's current context. Fatal on failure: a
    /// fiber with no valid context is unusable.
    pub fn capture() -> Self {
        // ucontext_t is plain old data to the kernel; every field that
        // matters is written by getcontext below.
        let ctx: Box<UnsafeCell<libc::ucontext_t>> =
            Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        if unsafe { libc::getcontext(ctx.get()) } != 0 {
            log::error!("getcontext failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
        Self { ctx }
    }

    /// Re-point this context at `entry`, running on `stack`.
    ///
    /// The context has no successor link, so `entry` must never return;
    /// it hands control back by swapping instead.
    pub fn bind(&mut self, stack: &Stack, entry: extern "C" fn()) {
        let ctx = self.ctx.get_mut();
        ctx.uc_link = std::ptr::null_mut();
        ctx.uc_stack.ss_sp = stack.base().cast();
        ctx.uc_stack.ss_size = stack.size();
        ctx.uc_stack.ss_flags = 0;
        unsafe { libc::makecontext(self.ctx.get(), entry, 0) };
    }

    /// Swap execution: save the running state into `from`, resume `to`.
    /// The call returns only when some later swap restores `from`.
    ///
    /// # Safety
    /// `to` must hold either freshly bound state or state saved by an
    /// earlier swap, and the stack it runs on must still be alive. Both
    /// contexts must belong to the calling thread.
    pub unsafe fn swap(from: &Self, to: &Self) {
        if unsafe { libc::swapcontext(from.ctx.get(), to.ctx.get()) } != 0 {
            log::error!("swapcontext failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
    }
}
