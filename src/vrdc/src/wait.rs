//! Single-shot rendezvous wait queues
//!
//! A [`WaitQueue`] has no memory. [`WaitQueue::wake_all`] releases the threads
//! that are waiting at that moment; a thread that starts waiting afterwards
//! waits for the next call. There is no ordering among the woken threads.
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

/// The deadline of a wait operation passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout;

#[derive(Debug)]
struct Waiter {
    thread: Thread,
    /// Set by the waker while it holds the queue lock. A waiter whose flag is
    /// clear is still present in the queue.
    woken: AtomicBool,
}

pub struct WaitQueue {
    waiters: SpinMutex<Slab<Arc<Waiter>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: SpinMutex::new(Slab::new()),
        }
    }

    /// Block the current thread until the next call to [`Self::wake_all`] or
    /// until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = Instant::now().checked_add(timeout);

        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            woken: AtomicBool::new(false),
        });
        let key = self.waiters.lock().insert(Arc::clone(&waiter));

        loop {
            if waiter.woken.load(Ordering::Acquire) {
                return Ok(());
            }

            // `park_timeout` may return spuriously, so check the flag again
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }

        let mut waiters = self.waiters.lock();
        if waiter.woken.load(Ordering::Acquire) {
            // Woken between the deadline check and taking the lock. The
            // waker has already removed our entry.
            return Ok(());
        }
        waiters.remove(key);
        Err(WaitTimeout)
    }

    /// Wake up all threads currently waiting. Returns the number of woken
    /// threads.
    pub fn wake_all(&self) -> usize {
        let woken: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters
                .drain()
                .inspect(|waiter| waiter.woken.store(true, Ordering::Release))
                .collect()
        };

        for waiter in woken.iter() {
            waiter.thread.unpark();
        }

        woken.len()
    }

    /// Get the number of threads currently waiting.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .finish()
    }
}
