// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stack allocation.
//!
//! Stacks come from a pluggable allocator; the default is the plain heap.
//! A pooled or guard-paged allocator can be dropped in behind the same
//! trait later.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Stack alignment required by the platform ABI.
const STACK_ALIGN: usize = 16;

/// Where fiber stacks come from.
pub trait StackAllocator {
    fn allocate(&self, size: usize) -> *mut u8;

    /// # Safety
    /// `ptr` must have come from `allocate` on this allocator with the
    /// same `size`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize);
}

/// Global-allocator-backed stacks.
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .expect("invalid stack layout");
        // SAFETY: size is non-zero for any fiber stack (enforced by the
        // config minimum) and the layout is valid.
        unsafe { alloc::alloc(layout) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .expect("invalid stack layout");
        unsafe { alloc::dealloc(ptr, layout) };
    }
}

const STACK_ALLOCATOR: HeapStackAllocator = HeapStackAllocator;

/// An owned fiber stack buffer.
pub(crate) struct Stack {
    ptr: NonNull<u8>,
    size: usize,
}

impl Stack {
    /// Allocate a stack of `size` bytes. Fatal on failure: a fiber
    /// without a stack cannot exist, and the caller is past the point of
    /// recovering.
    pub fn allocate(size: usize) -> Self {
        let raw = STACK_ALLOCATOR.allocate(size);
        let Some(ptr) = NonNull::new(raw) else {
            log::error!("fiber stack allocation failed, size={size}");
            std::process::abort();
        };
        Stack { ptr, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what allocate() produced.
        unsafe { STACK_ALLOCATOR.deallocate(self.ptr.as_ptr(), self.size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_aligned_stack() {
        let stack = Stack::allocate(64 * 1024);
        assert_eq!(stack.size(), 64 * 1024);
        assert_eq!(stack.base() as usize % STACK_ALIGN, 0);
    }
}
