// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread fiber slots.
//!
//! Each OS thread carries two lazily initialized slots: the fiber
//! executing right now and the synthesized main fiber standing in for the
//! thread's native stack. `current` is a raw, non-owning back-reference
//! reassigned on every transition; the main fiber is owned here and torn
//! down with the thread.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::fiber::Fiber;

thread_local! {
    static CURRENT: Cell<Option<NonNull<Fiber>>> = const { Cell::new(None) };
    static MAIN: RefCell<Option<Box<Fiber>>> = const { RefCell::new(None) };
}

/// Raw reassignment of the current-fiber slot.
pub(crate) fn set_current(fiber: Option<NonNull<Fiber>>) {
    CURRENT.with(|slot| slot.set(fiber));
}

/// The current fiber of this thread, synthesizing the main fiber on
/// first access.
pub(crate) fn current() -> NonNull<Fiber> {
    match CURRENT.with(|slot| slot.get()) {
        Some(fiber) => fiber,
        None => init_main(),
    }
}

/// The current fiber, without synthesizing anything.
pub(crate) fn try_current() -> Option<NonNull<Fiber>> {
    CURRENT.with(|slot| slot.get())
}

/// This thread's main fiber, if it has been synthesized.
pub(crate) fn main_fiber() -> Option<NonNull<Fiber>> {
    MAIN.with(|slot| slot.borrow().as_ref().map(|f| NonNull::from(&**f)))
}

fn init_main() -> NonNull<Fiber> {
    MAIN.with(|slot| {
        let mut slot = slot.borrow_mut();
        debug_assert!(slot.is_none());
        let main = Box::new(Fiber::new_main());
        let ptr = NonNull::from(&*main);
        *slot = Some(main);
        set_current(Some(ptr));
        ptr
    })
}

/// Called by the stack-less fiber's destructor when it is still the
/// registered current fiber: the thread's own teardown path, not a logic
/// error.
pub(crate) fn clear_current_if(fiber: *const Fiber) {
    // The slot may already be gone during thread-local teardown.
    let _ = CURRENT.try_with(|slot| {
        if let Some(cur) = slot.get() {
            if std::ptr::eq(cur.as_ptr(), fiber) {
                slot.set(None);
            }
        }
    });
}
