// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: stackful cooperative fibers on plain OS threads.
//!
//! A fiber is a unit of execution with its own stack, driven by explicit,
//! synchronous context swaps against the thread's main fiber. Exactly one
//! fiber executes per OS thread at any instant; fibers never migrate
//! between threads. Multi-thread fan-out means running independent fiber
//! chains on separate [`FiberThread`]s, each with its own registry.
//!
//! Components:
//! - `fiber`    — state machine, trampoline, yield family
//! - `registry` — per-thread current/main fiber slots
//! - `thread`   — named OS thread wrapper with a startup rendezvous
//! - `context`  — unsafe boundary over the OS context-swap primitive
//! - `stack`    — fiber stack allocation
//! - `config`   — default stack size

pub mod config;
mod context;
pub mod fiber;
mod registry;
pub mod stack;
pub mod thread;

pub use fiber::{Fiber, State};
pub use thread::FiberThread;
