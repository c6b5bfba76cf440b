// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers.
//!
//! A fiber owns a stack and a saved execution context; control moves by
//! explicit swaps against the thread's main fiber. State machine:
//! INIT → EXEC → {READY, HOLD} → EXEC → {TERM, EXCEPT}, with `reset`
//! bringing a finished fiber back to INIT on the same stack.
//!
//! Contract violations (resuming a finished fiber, yielding off the main
//! fiber, destroying a suspended fiber) are fatal by design: continuing
//! with a corrupted context state machine is worse than crashing.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config;
use crate::context::ExecutionContext;
use crate::registry;
use crate::stack::Stack;

/// Work run on a fiber's own stack. Deliberately not `Send`: a fiber
/// lives and dies on the thread that created it.
pub type FiberCallback = Box<dyn FnOnce()>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed or reset, never resumed since.
    Init,
    /// Yielded out, ready to be resumed.
    Ready,
    /// Executing on its thread right now.
    Exec,
    /// Yielded out, parked until something resumes it.
    Hold,
    /// Callback returned normally.
    Term,
    /// Callback panicked; caught at the trampoline.
    Except,
}

/// A stackful, cooperatively scheduled unit of execution.
///
/// Worker fibers are created with [`Fiber::new`]; the stack-less main
/// fiber of each thread is synthesized by the registry on first use and
/// never driven through `resume`.
pub struct Fiber {
    /// 0 for main fibers, monotonic otherwise.
    id: u64,
    state: Cell<State>,
    stack: Option<Stack>,
    ctx: ExecutionContext,
    cb: RefCell<Option<FiberCallback>>,
    caller_mode: bool,
}

impl Fiber {
    /// Create a worker fiber with its own stack.
    ///
    /// `stack_size` of 0 selects the configured default. `caller_mode`
    /// marks this fiber as the privileged scheduling context of its
    /// thread, driven through [`call`](Self::call)/[`back`](Self::back)
    /// instead of [`resume`](Self::resume) and the yield family.
    pub fn new(cb: impl FnOnce() + 'static, stack_size: usize, caller_mode: bool) -> Self {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        let size = if stack_size == 0 {
            config::config().stack_size
        } else {
            stack_size
        };
        let stack = Stack::allocate(size);
        let mut ctx = ExecutionContext::capture();
        ctx.bind(&stack, fiber_entry);
        log::info!("fiber created, id={id} stack={size}");
        Fiber {
            id,
            state: Cell::new(State::Init),
            stack: Some(stack),
            ctx,
            cb: RefCell::new(Some(Box::new(cb))),
            caller_mode,
        }
    }

    /// The main fiber: the thread's native stack, already executing.
    pub(crate) fn new_main() -> Self {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::info!("main fiber synthesized");
        Fiber {
            id: 0,
            state: Cell::new(State::Exec),
            stack: None,
            ctx: ExecutionContext::capture(),
            cb: RefCell::new(None),
            caller_mode: false,
        }
    }

    /// Reinstall a callback on a finished (or never started) fiber,
    /// reusing its stack. Contract violation on a stack-less fiber or in
    /// any state outside {INIT, TERM, EXCEPT}.
    pub fn reset(&mut self, cb: impl FnOnce() + 'static) {
        let stack = self.stack.as_ref().expect("reset() on a stack-less fiber");
        let st = self.state.get();
        assert!(
            matches!(st, State::Init | State::Term | State::Except),
            "reset() on fiber {} in state {:?}",
            self.id,
            st
        );
        let mut ctx = ExecutionContext::capture();
        ctx.bind(stack, fiber_entry);
        self.ctx = ctx;
        *self.cb.get_mut() = Some(Box::new(cb));
        self.state.set(State::Init);
    }

    /// Swap the thread's main fiber out and this fiber in. Returns, from
    /// the caller's point of view, when the fiber yields or finishes.
    pub fn resume(&self) {
        assert!(
            !self.caller_mode,
            "fiber {} is caller-mode, drive it via call()",
            self.id
        );
        let st = self.state.get();
        assert!(
            matches!(st, State::Init | State::Ready | State::Hold),
            "fiber {} resumed in state {:?}",
            self.id,
            st
        );
        self.switch_in();
    }

    /// [`resume`](Self::resume) for a caller-mode fiber. Unlike `resume`
    /// this accepts a fiber left EXEC by [`back`](Self::back), which does
    /// not demote the state on the way out.
    pub fn call(&self) {
        assert!(
            self.caller_mode,
            "call() on fiber {} which is not caller-mode",
            self.id
        );
        let st = self.state.get();
        assert!(
            !matches!(st, State::Term | State::Except),
            "fiber {} called after finishing",
            self.id
        );
        self.switch_in();
    }

    /// Hand control back to the thread's main fiber without touching our
    /// state. The counterpart of [`call`](Self::call).
    pub fn back(&self) {
        assert!(
            self.caller_mode,
            "back() on fiber {} which is not caller-mode",
            self.id
        );
        self.switch_out();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    fn switch_in(&self) {
        assert!(self.stack.is_some(), "the main fiber cannot be resumed");
        let cur = registry::current();
        let main = registry::main_fiber().expect("no main fiber on this thread");
        assert!(
            std::ptr::eq(cur.as_ptr(), main.as_ptr()),
            "fiber {} resumed from a context other than the thread's main fiber",
            self.id
        );
        registry::set_current(Some(NonNull::from(self)));
        self.state.set(State::Exec);
        // SAFETY: `main` points at this thread's boxed main fiber, alive
        // for the thread's lifetime; our own context is bound to a stack
        // we still own. Both contexts belong to this thread.
        unsafe { ExecutionContext::swap(&(*main.as_ptr()).ctx, &self.ctx) };
    }

    fn switch_out(&self) {
        let main = registry::main_fiber().expect("no main fiber on this thread");
        registry::set_current(Some(main));
        // SAFETY: as in switch_in; the main context holds the state saved
        // by the swap that resumed us.
        unsafe { ExecutionContext::swap(&self.ctx, &(*main.as_ptr()).ctx) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        log::info!("fiber destroyed, id={}", self.id);
        if self.stack.is_some() {
            let st = self.state.get();
            if !matches!(st, State::Init | State::Term | State::Except)
                && !std::thread::panicking()
            {
                panic!("fiber {} destroyed while {:?}", self.id, st);
            }
        } else {
            // The thread's own teardown, not a logic error.
            debug_assert!(self.cb.get_mut().is_none());
            registry::clear_current_if(self);
        }
    }
}

/// Id of the fiber currently executing on this thread; 0 when the thread
/// has never touched the fiber machinery (or is on its main fiber).
pub fn current_id() -> u64 {
    // SAFETY: the registry's current pointer refers either to the boxed
    // main fiber or to a worker whose resume frame is live on this
    // thread's stack; both outlive this call.
    registry::try_current()
        .map(|f| unsafe { f.as_ref() }.id)
        .unwrap_or(0)
}

/// Process-wide count of live fibers, main fibers included.
pub fn total_live() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}

/// Yield the current fiber to its thread's main fiber, marking it READY.
pub fn yield_ready() {
    yield_with(State::Ready);
}

/// Yield the current fiber to its thread's main fiber, parking it HOLD.
pub fn yield_hold() {
    yield_with(State::Hold);
}

/// Terminal yield: the fiber will not run again unless `reset`.
pub fn yield_term() {
    let cur = registry::current();
    // SAFETY: see current_id().
    let cur = unsafe { cur.as_ref() };
    assert!(cur.stack.is_some(), "the main fiber cannot yield");
    let st = cur.state.get();
    assert!(
        st != State::Term && st != State::Except,
        "fiber {} already finished",
        cur.id
    );
    cur.state.set(State::Term);
    cur.switch_out();
}

fn yield_with(target: State) {
    let cur = registry::current();
    // SAFETY: see current_id().
    let cur = unsafe { cur.as_ref() };
    assert!(cur.stack.is_some(), "the main fiber cannot yield");
    assert_eq!(
        cur.state.get(),
        State::Exec,
        "fiber {} yielded while not executing",
        cur.id
    );
    cur.state.set(target);
    cur.switch_out();
}

/// First entry of every worker fiber context.
///
/// Runs the installed callback behind a catch-all boundary, records the
/// terminal state, drops the callback's captures, then yields back to the
/// main fiber for good. The context must never be swapped in past that
/// final yield.
extern "C" fn fiber_entry() {
    {
        let cb = {
            let cur = registry::current();
            // SAFETY: entered via a switch_in whose frame keeps the fiber
            // alive until we yield back.
            let cur = unsafe { cur.as_ref() };
            cur.cb
                .borrow_mut()
                .take()
                .expect("fiber entered without a callback")
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(cb));
        // The callback may have yielded, and the suspended Fiber value may
        // have been moved before the resume that brought us back. Every
        // switch_in re-registers the fiber's address, so re-read it rather
        // than write through the one captured at entry.
        let cur = registry::current();
        // SAFETY: re-registered by the switch_in that resumed us.
        let cur = unsafe { cur.as_ref() };
        match outcome {
            Ok(()) => cur.state.set(State::Term),
            Err(payload) => {
                cur.state.set(State::Except);
                log::error!(
                    "fiber failed, id={} panic={}\nbacktrace:\n{}",
                    cur.id,
                    panic_message(&payload),
                    Backtrace::force_capture()
                );
            }
        }
        cur.switch_out();
    }
    // Swapped back into a finished context: nothing sane can happen.
    log::error!("terminated fiber context re-entered, id={}", current_id());
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
