// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Global quiescence.
//!
//! A protocol-level pause of every transactional thread, used for the clock
//! rollover and for external "wait until all current transactions finish"
//! clients. The design is a barrier rather than a reader-writer lock:
//! active transactions must fully drain before anyone mutates the clock and
//! the lock array underneath them.

use crate::transaction::{is_active, TX_IDLE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "no_deadlocks")]
use no_deadlocks::{Condvar, Mutex};
#[cfg(not(feature = "no_deadlocks"))]
use std::sync::{Condvar, Mutex};

/// No pause in progress.
pub(crate) const QUIESCE_NONE: usize = 0;
/// A barrier (rollover) is draining the instance.
pub(crate) const QUIESCE_BARRIER: usize = 1;
/// A non-blocking pause was requested; new transactions spin in
/// [`Quiescence::check`] until it clears.
pub(crate) const QUIESCE_PAUSE: usize = 2;

struct Registry {
    /// Registered descriptors, represented by their shared status words.
    threads: Vec<Arc<AtomicUsize>>,
    /// Registered threads not currently blocked on the barrier.
    live: usize,
}

pub(crate) struct Quiescence {
    state: Mutex<Registry>,
    cond: Condvar,
    /// Mutated only under the mutex; read lock-free by [`check`](Self::check).
    word: AtomicUsize,
    max_threads: usize,
}

impl Quiescence {
    pub fn new(max_threads: usize) -> Self {
        Self {
            state: Mutex::new(Registry {
                threads: Vec::new(),
                live: 0,
            }),
            cond: Condvar::new(),
            word: AtomicUsize::new(QUIESCE_NONE),
            max_threads,
        }
    }

    /// Links a descriptor's status word into the registry.
    pub fn enter(&self, status: Arc<AtomicUsize>) {
        let mut registry = self.state.lock().expect("quiescence mutex poisoned");
        assert!(
            registry.threads.len() < self.max_threads,
            "thread limit exceeded"
        );

        registry.live += 1;
        registry.threads.push(status);
    }

    /// Unlinks a descriptor. Wakes barrier waiters, since an exiting thread
    /// may be the one they were waiting for.
    pub fn exit(&self, status: &AtomicUsize) {
        let mut registry = self.state.lock().expect("quiescence mutex poisoned");
        let target = status as *const AtomicUsize;
        registry.threads.retain(|s| !std::ptr::eq(s.as_ref(), target));
        registry.live -= 1;

        if self.word.load(Ordering::Acquire) != QUIESCE_NONE {
            self.cond.notify_all();
        }
    }

    /// Parks the calling thread until every registered thread has reached
    /// the barrier, then runs `task` on exactly one of them and releases
    /// everybody.
    ///
    /// Must only be called with an inactive transaction. A caller arriving
    /// after the episode completed returns without `task` having run, so
    /// callers must re-check their trigger condition afterwards.
    pub fn barrier<F: FnOnce()>(&self, task: F) {
        let mut registry = self.state.lock().expect("quiescence mutex poisoned");
        registry.live -= 1;

        if self.word.load(Ordering::Acquire) == QUIESCE_NONE {
            self.word.store(QUIESCE_BARRIER, Ordering::SeqCst);
        }

        let mut task = Some(task);
        while self.word.load(Ordering::Acquire) == QUIESCE_BARRIER {
            if registry.live == 0 {
                if let Some(run) = task.take() {
                    run();
                }
                self.word.store(QUIESCE_NONE, Ordering::SeqCst);
                self.cond.notify_all();
            } else {
                registry = self
                    .cond
                    .wait(registry)
                    .expect("quiescence mutex poisoned");
            }
        }

        registry.live += 1;
    }

    /// Requests a pause and blocks until every transaction that was active
    /// at the time of the call has finished.
    pub fn drain(&self) {
        let mut registry = self.state.lock().expect("quiescence mutex poisoned");
        while self.word.load(Ordering::Acquire) != QUIESCE_NONE {
            registry = self
                .cond
                .wait(registry)
                .expect("quiescence mutex poisoned");
        }
        self.word.store(QUIESCE_PAUSE, Ordering::SeqCst);

        loop {
            let busy = registry
                .threads
                .iter()
                .any(|status| is_active(status.load(Ordering::Acquire)));
            if !busy {
                break;
            }

            drop(registry);
            std::thread::yield_now();
            registry = self.state.lock().expect("quiescence mutex poisoned");
        }

        self.word.store(QUIESCE_NONE, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Called on entry to `ACTIVE`, before the transaction touches any lock.
    /// If a pause is pending the transaction steps aside until it clears.
    /// Returns whether it had to wait.
    pub fn check(&self, status: &AtomicUsize) -> bool {
        if self.word.load(Ordering::Acquire) != QUIESCE_PAUSE {
            return false;
        }

        let saved = status.swap(TX_IDLE, Ordering::SeqCst);
        while self.word.load(Ordering::Acquire) == QUIESCE_PAUSE {
            std::hint::spin_loop();
        }
        status.store(saved, Ordering::SeqCst);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TX_ACTIVE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_barrier_runs_task_once() {
        let quiesce = Arc::new(Quiescence::new(64));
        let ran = Arc::new(AtomicUsize::new(0));
        let workers = 4;

        let statuses: Vec<_> = (0..workers)
            .map(|_| Arc::new(AtomicUsize::new(TX_IDLE)))
            .collect();
        for status in &statuses {
            quiesce.enter(status.clone());
        }

        let handles: Vec<_> = statuses
            .iter()
            .map(|_| {
                let quiesce = quiesce.clone();
                let ran = ran.clone();
                std::thread::spawn(move || {
                    quiesce.barrier(|| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("barrier thread panicked");
        }

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        for status in &statuses {
            quiesce.exit(status);
        }
    }

    #[test]
    fn test_drain_waits_for_active() {
        let quiesce = Arc::new(Quiescence::new(64));
        let status = Arc::new(AtomicUsize::new(TX_ACTIVE));
        quiesce.enter(status.clone());

        let finisher = {
            let status = status.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                status.store(TX_IDLE, Ordering::SeqCst);
            })
        };

        quiesce.drain();
        assert!(!is_active(status.load(Ordering::SeqCst)));

        finisher.join().expect("finisher panicked");
        quiesce.exit(&status);
    }
}
