// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named OS thread wrapper with a startup rendezvous.
//!
//! `FiberThread::new` does not return until the worker has published its
//! kernel id and installed its thread-locals, so `id()`/`name()` are
//! valid immediately after construction. Dropping without `join()`
//! detaches: the thread keeps running and the callback's captures must
//! stay valid on their own.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Name reported for threads the runtime has not named.
pub const DEFAULT_THREAD_NAME: &str = "UNKNOWN";

/// Record shared between a `FiberThread` object and the OS thread it
/// owns. Outlives whichever side goes away first.
struct Shared {
    name: Mutex<String>,
    /// Kernel tid, published by the worker before the rendezvous fires.
    id: AtomicI32,
    started: (Mutex<bool>, Condvar),
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from(DEFAULT_THREAD_NAME));
}

/// An OS thread with a display name, a kernel id, and explicit join
/// semantics.
pub struct FiberThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl FiberThread {
    /// Spawn a named worker thread and block until it has published its
    /// identity. Empty names fall back to [`DEFAULT_THREAD_NAME`]. Fatal
    /// if the OS refuses to spawn.
    pub fn new(cb: impl FnOnce() + Send + 'static, name: &str) -> Self {
        let name = if name.is_empty() {
            DEFAULT_THREAD_NAME.to_string()
        } else {
            name.to_string()
        };
        let shared = Arc::new(Shared {
            name: Mutex::new(name.clone()),
            id: AtomicI32::new(-1),
            started: (Mutex::new(false), Condvar::new()),
        });

        let worker_shared = shared.clone();
        // The std spawner truncates the native name to the platform
        // limit for us.
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run(worker_shared, cb));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("failed to spawn fiber thread, name={name}: {err}");
                panic!("failed to spawn fiber thread {name:?}: {err}");
            }
        };

        // Rendezvous: wait for the worker's identity to become visible.
        let (lock, cvar) = &shared.started;
        let mut started = lock.lock().unwrap();
        while !*started {
            started = cvar.wait(started).unwrap();
        }
        drop(started);

        log::debug!("fiber thread started, name={name}");
        FiberThread {
            shared,
            handle: Some(handle),
        }
    }

    fn run(shared: Arc<Shared>, cb: impl FnOnce()) {
        let name = shared.name.lock().unwrap().clone();
        THREAD_NAME.with(|n| *n.borrow_mut() = name);
        CURRENT_THREAD.with(|t| *t.borrow_mut() = Some(shared.clone()));
        shared.id.store(os_thread_id(), Ordering::Release);

        let (lock, cvar) = &shared.started;
        let mut started = lock.lock().unwrap();
        *started = true;
        cvar.notify_one();
        drop(started);

        cb();
    }

    /// Kernel id of the worker thread. Valid from the moment the
    /// constructor returns.
    pub fn id(&self) -> i32 {
        self.shared.id.load(Ordering::Acquire)
    }

    /// Display name of the worker thread.
    pub fn name(&self) -> String {
        self.shared.name.lock().unwrap().clone()
    }

    /// Wait for the worker to finish. Idempotent: the handle is cleared
    /// after the first join. Fatal if the worker panicked out of its
    /// callback.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("fiber thread panicked, name={}", self.name());
                panic!("fiber thread {:?} panicked", self.name());
            }
        }
    }
}

impl Drop for FiberThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Detach. The thread runs on independently.
            drop(handle);
            log::debug!("fiber thread detached, name={}", self.name());
        }
    }
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> i32 {
    // The kernel tid, the same id /proc and `top -H` show.
    unsafe { libc::gettid() }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> i32 {
    unsafe { libc::pthread_self() as i32 }
}

/// Name of the calling thread as the runtime knows it.
pub fn current_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

/// Rename the calling thread. Empty names are ignored. If the calling
/// thread is owned by a live `FiberThread`, its stored name is updated
/// as well.
pub fn set_name(name: &str) {
    if name.is_empty() {
        return;
    }
    CURRENT_THREAD.with(|t| {
        if let Some(shared) = t.borrow().as_ref() {
            *shared.name.lock().unwrap() = name.to_string();
        }
    });
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// Kernel id of the calling thread.
pub fn current_id() -> i32 {
    os_thread_id()
}

/// Whether the calling thread was spawned by a `FiberThread`.
pub fn is_runtime_thread() -> bool {
    CURRENT_THREAD.with(|t| t.borrow().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_run_and_join() {
        const THREADS: usize = 8;
        const LOOPS: i32 = 10_000;
        let counter = Arc::new(AtomicI32::new(0));
        let mut threads = Vec::new();
        for i in 0..THREADS {
            let counter = counter.clone();
            threads.push(FiberThread::new(
                move || {
                    for _ in 0..LOOPS {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                },
                &format!("thread_{i}"),
            ));
        }
        for thread in &mut threads {
            thread.join();
        }
        assert_eq!(counter.load(Ordering::Relaxed), LOOPS * THREADS as i32);
    }

    #[test]
    fn id_is_valid_immediately_after_construction() {
        let mut thread = FiberThread::new(
            || std::thread::sleep(std::time::Duration::from_millis(20)),
            "worker-1",
        );
        // The rendezvous completed before any sleep in the callback.
        assert!(thread.id() >= 0);
        assert_eq!(thread.name(), "worker-1");
        thread.join();
        // join() is idempotent.
        thread.join();
    }

    #[test]
    fn empty_name_falls_back_to_default() {
        let mut thread = FiberThread::new(|| {}, "");
        assert_eq!(thread.name(), DEFAULT_THREAD_NAME);
        thread.join();
    }

    #[test]
    fn set_name_updates_the_owning_object() {
        let mut thread = FiberThread::new(
            || {
                assert!(is_runtime_thread());
                assert_eq!(current_name(), "before");
                set_name("after");
                assert_eq!(current_name(), "after");
                // Ignored, not an error.
                set_name("");
                assert_eq!(current_name(), "after");
            },
            "before",
        );
        thread.join();
        assert_eq!(thread.name(), "after");
    }

    #[test]
    fn unowned_threads_report_defaults() {
        let handle = std::thread::spawn(|| (current_name(), is_runtime_thread()));
        let (name, owned) = handle.join().unwrap();
        assert_eq!(name, DEFAULT_THREAD_NAME);
        assert!(!owned);
    }

    #[test]
    fn dropping_without_join_detaches() {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = FiberThread::new(
            move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                let _ = tx.send(());
            },
            "detached",
        );
        drop(thread);
        // The worker keeps running after the handle is gone.
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
}
