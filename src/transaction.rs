// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction descriptors and the write-back encounter-time-locking engine.
//!
//! Reads are invisible: they record `(version, stripe)` pairs and are
//! revalidated whenever the snapshot must move forward. Writes acquire the
//! target stripe at the first store and buffer the value in the write log;
//! commit takes a timestamp from the global clock, validates the read log if
//! anything committed in between, writes the log back and reopens every
//! owned stripe with the new version. Conflicts never block: the loser rolls
//! back and the retry loop runs it again on a fresh snapshot.

use crate::error::{Reason, TxError};
use crate::hooks::EventHooks;
use crate::rwset::{ReadSet, WriteEntry, WriteSet};
use crate::stm::{Shared, SpecificKey, MAX_SPECIFIC};
use crate::types::{TWord, Word};
use crate::version::{is_owned, owner_entry, timestamp_of, versioned};
use log::{debug, trace};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

/// Descriptor status words. The low bit flags an active transaction.
pub(crate) const TX_IDLE: usize = 0;
pub(crate) const TX_ACTIVE: usize = 1;
pub(crate) const TX_COMMITTED: usize = 1 << 1;
pub(crate) const TX_ABORTED: usize = 2 << 1;
pub(crate) const TX_COMMITTING: usize = TX_COMMITTED | TX_ACTIVE;
pub(crate) const TX_ABORTING: usize = TX_ABORTED | TX_ACTIVE;
pub(crate) const TX_KILLED: usize = (3 << 1) | TX_ACTIVE;

#[inline]
pub(crate) const fn is_active(status: usize) -> bool {
    status & TX_ACTIVE != 0
}

/// Transaction attributes, fixed for the lifetime of one `execute` block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Attributes {
    /// The block performs no stores. Reads skip the read log, and any
    /// attempted store aborts with `RO_WRITE` (the retry loop then upgrades
    /// the block to an update transaction).
    pub read_only: bool,
    /// Surface aborts to the caller instead of retrying.
    pub no_retry: bool,
}

#[derive(Default)]
struct Stats {
    nb_commits: Word,
    nb_aborts: Word,
    nb_retries: Word,
    last_abort: Option<Reason>,
}

/// A per-thread transaction descriptor.
///
/// Created through [`Stm::context`](crate::Stm::context) and registered with
/// the instance until dropped. The lifetime parameter ties the context to
/// the [`TWord`]s it may access: every word passed to [`load`](Self::load)
/// or [`store`](Self::store) must outlive the context, which is what keeps
/// the write log's pointers valid while foreign threads inspect them
/// through the lock array.
///
/// High-level use goes through [`execute`](Self::execute); the
/// `start`/`load`/`store`/`commit` layer underneath is public for callers
/// that drive the retry themselves.
pub struct Context<'env> {
    shared: Arc<Shared>,
    status: Arc<AtomicUsize>,
    start: Word,
    end: Word,
    attr: Attributes,
    nesting: usize,
    r_set: ReadSet,
    w_set: WriteSet,
    hooks: Vec<Arc<dyn EventHooks>>,
    specific: [Option<Arc<dyn Any + Send + Sync>>; MAX_SPECIFIC],
    stats: Stats,
    // pins the lifetime of every word the log may point to
    _words: PhantomData<fn(&'env TWord) -> &'env TWord>,
}

// The write log holds raw pointers to `TWord`s, which are themselves Sync;
// the log is only ever dereferenced by the owning thread.
unsafe impl Send for Context<'_> {}

impl<'env> Context<'env> {
    pub(crate) fn init(shared: Arc<Shared>) -> Self {
        let status = Arc::new(AtomicUsize::new(TX_IDLE));
        shared.quiesce.enter(status.clone());

        let hooks = shared
            .hooks
            .lock()
            .expect("hook registry poisoned")
            .clone();
        for hook in &hooks {
            hook.on_init_thread();
        }

        let capacity = shared.config.rw_set_capacity;
        Self {
            status,
            r_set: ReadSet::with_capacity(capacity),
            w_set: WriteSet::with_capacity(capacity),
            hooks,
            specific: Default::default(),
            start: 0,
            end: 0,
            attr: Attributes::default(),
            nesting: 0,
            stats: Stats::default(),
            shared,
            _words: PhantomData,
        }
    }

    /// Starts a transaction. Returns `true` for the outermost invocation;
    /// a nested call binds the block to the enclosing transaction (flat
    /// nesting) and returns `false`.
    pub fn start(&mut self, attr: Attributes) -> bool {
        if self.nesting > 0 && is_active(self.status.load(Ordering::Relaxed)) {
            self.nesting += 1;
            return false;
        }

        self.attr = attr;
        self.nesting = 1;
        self.prepare();
        true
    }

    /// Drains the logs, snapshots the clock (rolling it over if it hit the
    /// version limit) and activates the descriptor.
    fn prepare(&mut self) {
        self.r_set.clear();
        self.w_set.reset();

        loop {
            self.start = self.shared.clock.get();
            self.end = self.start;
            if self.start < self.shared.config.version_max {
                break;
            }

            debug!(
                "clock hit the version limit at {}, draining for rollover",
                self.start
            );
            let shared = &self.shared;
            shared.quiesce.barrier(|| {
                shared.clock.reset();
                shared.locks.reset();
            });
        }

        self.status.store(TX_ACTIVE, Ordering::SeqCst);
        self.shared.quiesce.check(&self.status);

        for hook in &self.hooks {
            hook.on_start();
        }
        trace!("tx start, snapshot {}", self.start);
    }

    /// Transactional load.
    ///
    /// Returns the word value consistent with the running snapshot. For
    /// non-read-only transactions the read is logged so it can be
    /// revalidated when the snapshot is extended.
    pub fn load(&mut self, word: &'env TWord) -> Result<Word, TxError> {
        debug_assert!(self.active(), "load outside a transaction");
        let stripe = self.shared.locks.stripe_of(word.addr());
        let mut lock = self.shared.locks.load(stripe);

        loop {
            if is_owned(lock) {
                let head = match self.w_set.index_of(owner_entry(lock)) {
                    Some(head) => head,
                    None => return Err(self.rollback(Reason::RW_CONFLICT)),
                };

                // we own the stripe: serve the value from our own log
                let mut index = head;
                loop {
                    let entry = self.w_set.entry(index);
                    if std::ptr::eq(entry.addr, word) {
                        return Ok(if entry.mask == 0 {
                            word.read_atomic()
                        } else {
                            entry.value
                        });
                    }
                    match entry.next {
                        Some(next) => index = next,
                        // same stripe, different address: memory is current
                        None => return Ok(word.read_atomic()),
                    }
                }
            }

            // free stripe: load the value, then re-check the lock. A writer
            // acquiring in between would otherwise hand us a value that
            // belongs to no consistent snapshot.
            let value = word.read_atomic();
            let recheck = self.shared.locks.load(stripe);
            if recheck != lock {
                lock = recheck;
                continue;
            }

            let version = timestamp_of(lock);
            if version > self.end {
                // a read-only transaction has no read log to revalidate
                if self.attr.read_only || !self.extend() {
                    return Err(self.rollback(Reason::VAL_READ));
                }
                lock = self.shared.locks.load(stripe);
                continue;
            }

            if !self.attr.read_only {
                self.r_set.push(version, stripe);
            }
            return Ok(value);
        }
    }

    /// Transactional store of a full word.
    pub fn store(&mut self, word: &'env TWord, value: Word) -> Result<(), TxError> {
        self.write(word, value, Word::MAX)
    }

    /// Transactional store of the bits selected by `mask`. A zero mask
    /// acquires the stripe without scheduling a write (read-for-write
    /// priming).
    pub fn store_masked(
        &mut self,
        word: &'env TWord,
        value: Word,
        mask: Word,
    ) -> Result<(), TxError> {
        self.write(word, value, mask)
    }

    /// Encounter-time locking write. After return the stripe is owned by
    /// this transaction and the write log covers `word`.
    fn write(&mut self, word: &'env TWord, value: Word, mask: Word) -> Result<(), TxError> {
        debug_assert!(self.active(), "store outside a transaction");
        if self.attr.read_only {
            return Err(self.rollback(Reason::RO_WRITE));
        }

        let stripe = self.shared.locks.stripe_of(word.addr());
        loop {
            let lock = self.shared.locks.load(stripe);

            if is_owned(lock) {
                let head = match self.w_set.index_of(owner_entry(lock)) {
                    Some(head) => head,
                    None => return Err(self.rollback(Reason::WW_CONFLICT)),
                };

                // merge into an existing entry, or extend the chain
                let mut index = head;
                let tail = loop {
                    let entry = self.w_set.entry(index);
                    if std::ptr::eq(entry.addr, word) {
                        if mask == 0 {
                            return Ok(());
                        }

                        let was_priming = entry.mask == 0;
                        let merged = if mask == Word::MAX {
                            value
                        } else {
                            // materialize the missing bits before merging
                            let base = if was_priming {
                                word.read_atomic()
                            } else {
                                entry.value
                            };
                            (base & !mask) | (value & mask)
                        };

                        let entry = self.w_set.entry_mut(index);
                        entry.value = merged;
                        entry.mask |= mask;
                        if was_priming {
                            self.w_set.has_writes += 1;
                        }
                        return Ok(());
                    }

                    match entry.next {
                        Some(next) => index = next,
                        None => break index,
                    }
                };

                if self.w_set.is_full() {
                    return Err(self.rollback(Reason::EXTEND_WS));
                }

                let version = self.w_set.entry(tail).version;
                let appended = self.w_set.append(WriteEntry {
                    addr: word,
                    value: merge_from_memory(word, value, mask),
                    mask,
                    version,
                    stripe,
                    next: None,
                });
                self.w_set.entry_mut(tail).next = Some(appended);
                return Ok(());
            }

            let version = timestamp_of(lock);
            if version > self.end && self.r_set.has_stripe(stripe) {
                // we already read an older snapshot of this stripe
                return Err(self.rollback(Reason::VAL_WRITE));
            }

            if self.w_set.is_full() {
                return Err(self.rollback(Reason::EXTEND_WS));
            }

            let slot = self.w_set.next_slot_addr();
            if !self.shared.locks.try_acquire(stripe, lock, slot) {
                // lost the race, re-inspect the lock
                continue;
            }

            self.w_set.append(WriteEntry {
                addr: word,
                value: merge_from_memory(word, value, mask),
                mask,
                version,
                stripe,
                next: None,
            });
            return Ok(());
        }
    }

    /// Checks every logged read against the current lock state.
    fn validate(&self) -> bool {
        for read in self.r_set.iter() {
            let lock = self.shared.locks.load(read.stripe);
            if is_owned(lock) {
                // owned by us means we are the writer; anyone else is a
                // conflict
                if self.w_set.index_of(owner_entry(lock)).is_none() {
                    return false;
                }
            } else if timestamp_of(lock) != read.version {
                return false;
            }
        }
        true
    }

    /// Moves the snapshot upper bound to the current clock if every logged
    /// read is still valid.
    fn extend(&mut self) -> bool {
        let now = self.shared.clock.get();
        if self.validate() {
            trace!("tx extend {} -> {}", self.end, now);
            self.end = now;
            true
        } else {
            false
        }
    }

    /// Commits the transaction. A nested commit only closes its block; the
    /// outermost commit publishes the write log and reopens the stripes.
    pub fn commit(&mut self) -> Result<(), TxError> {
        debug_assert!(self.nesting > 0, "commit outside a transaction");
        self.nesting -= 1;
        if self.nesting > 0 {
            return Ok(());
        }

        for hook in &self.hooks {
            hook.on_precommit();
        }

        if self.w_set.nb_entries == 0 {
            // nothing acquired, nothing to publish
            self.status.store(TX_COMMITTED, Ordering::SeqCst);
            self.stats.nb_commits += 1;
            for hook in &self.hooks {
                hook.on_commit();
            }
            return Ok(());
        }

        self.status.store(TX_COMMITTING, Ordering::SeqCst);
        let timestamp = self.shared.clock.fetch_inc() + 1;

        // someone committed since our snapshot: the reads must be rechecked
        if self.start != timestamp - 1 && !self.validate() {
            return Err(self.rollback(Reason::VALIDATE));
        }

        // write the log back, then publish each chain by reopening its tail;
        // the release store on the tail is what makes the values visible
        if self.w_set.has_writes > 0 {
            for entry in self.w_set.iter() {
                if entry.mask != 0 {
                    unsafe { (*entry.addr).write_atomic(entry.value) };
                }
            }
        }
        for entry in self.w_set.iter() {
            if entry.next.is_none() {
                self.shared.locks.release(entry.stripe, versioned(timestamp));
            }
        }

        self.status.store(TX_COMMITTED, Ordering::SeqCst);
        self.stats.nb_commits += 1;
        for hook in &self.hooks {
            hook.on_commit();
        }
        trace!("tx committed at {}", timestamp);
        Ok(())
    }

    /// User-requested abort. Rolls back and returns the error to propagate
    /// out of the transaction block.
    pub fn abort(&mut self) -> TxError {
        self.rollback(Reason::EXPLICIT)
    }

    /// Like [`abort`](Self::abort), but also suppresses the retry.
    pub fn abort_no_retry(&mut self) -> TxError {
        self.rollback(Reason::EXPLICIT | Reason::NO_RETRY)
    }

    /// Reopens every owned stripe with its pre-acquisition version and
    /// marks the descriptor aborted.
    fn rollback(&mut self, reason: Reason) -> TxError {
        self.status.store(TX_ABORTING, Ordering::SeqCst);

        for entry in self.w_set.iter() {
            if entry.next.is_none() {
                self.shared
                    .locks
                    .release(entry.stripe, versioned(entry.version));
            }
        }
        fence(Ordering::Release);
        self.status.store(TX_ABORTED, Ordering::SeqCst);

        self.stats.nb_aborts += 1;
        self.stats.last_abort = Some(reason);
        debug!("tx rollback ({:?})", reason);

        if reason.contains(Reason::EXTEND_WS) {
            // every stripe is free again, so the log may move
            self.w_set.grow();
        }

        self.nesting = 1;
        for hook in &self.hooks {
            hook.on_abort(reason);
        }

        if self.attr.no_retry || reason.contains(Reason::NO_RETRY) {
            self.nesting = 0;
            return TxError::Aborted(reason | Reason::NO_RETRY);
        }
        TxError::Aborted(reason | Reason::PATH_INSTRUMENTED)
    }

    /// Runs `body` as one atomic transaction, retrying on conflicts until
    /// it commits.
    ///
    /// The block re-runs with a fresh snapshot and the same attributes after
    /// every retryable abort; with `attr.no_retry` (or an abort carrying
    /// `NO_RETRY`) the `Aborted` error surfaces instead. Nested calls bind
    /// to the enclosing transaction and never retry on their own.
    pub fn execute<R, F>(&mut self, attr: Attributes, mut body: F) -> Result<R, TxError>
    where
        F: FnMut(&mut Context<'env>) -> Result<R, TxError>,
    {
        if !self.start(attr) {
            // flat nested block: run against the enclosing transaction and
            // leave retry decisions to it
            let value = body(&mut *self)?;
            self.commit()?;
            return Ok(value);
        }

        let mut attr = attr;
        loop {
            match body(&mut *self) {
                Ok(value) => match self.commit() {
                    Ok(()) => return Ok(value),
                    Err(TxError::Aborted(reason)) if reason.retryable() => {
                        self.stats.nb_retries += 1;
                        self.retry(attr);
                    }
                    Err(err) => return Err(err),
                },
                Err(TxError::Aborted(reason)) if reason.retryable() => {
                    if reason.contains(Reason::RO_WRITE) {
                        // upgrade to an update transaction
                        attr.read_only = false;
                    }
                    self.stats.nb_retries += 1;
                    self.retry(attr);
                }
                Err(err) => {
                    if self.active() {
                        // the body bailed out without aborting
                        let _ = self.rollback(Reason::EXPLICIT | Reason::NO_RETRY);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn retry(&mut self, attr: Attributes) {
        self.attr = attr;
        self.nesting = 1;
        self.prepare();
    }

    /// Whether a transaction is currently running on this descriptor.
    pub fn active(&self) -> bool {
        is_active(self.status.load(Ordering::SeqCst))
    }

    /// Whether the last transaction on this descriptor rolled back.
    pub fn aborted(&self) -> bool {
        self.status.load(Ordering::SeqCst) == TX_ABORTED
    }

    /// Whether the descriptor was killed by a contention manager. Always
    /// `false` here: the built-in manager only ever aborts the calling
    /// transaction.
    pub fn killed(&self) -> bool {
        self.status.load(Ordering::SeqCst) == TX_KILLED
    }

    /// Whether the running transaction is irrevocable. Always `false`: this
    /// configuration provides no irrevocability entry point.
    pub fn irrevocable(&self) -> bool {
        false
    }

    /// Stores a value in a transaction-specific slot.
    pub fn set_specific(&mut self, key: SpecificKey, value: Arc<dyn Any + Send + Sync>) {
        self.specific[key.0] = Some(value);
    }

    /// Reads back a transaction-specific slot.
    pub fn get_specific(&self, key: SpecificKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.specific[key.0].clone()
    }

    /// Per-descriptor introspection.
    pub fn get_stats(&self, name: &str) -> Option<Word> {
        match name {
            "read_set_size" => Some(self.r_set.capacity()),
            "read_set_nb_entries" => Some(self.r_set.len()),
            "write_set_size" => Some(self.w_set.capacity()),
            "write_set_nb_entries" => Some(self.w_set.nb_entries),
            "read_only" => Some(self.attr.read_only as Word),
            "nb_commits" => Some(self.stats.nb_commits),
            "nb_aborts" => Some(self.stats.nb_aborts),
            "nb_retries" => Some(self.stats.nb_retries),
            "last_abort_reason" => self.stats.last_abort.map(|reason| reason.bits()),
            _ => None,
        }
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        // a panicking body must not leave stripes owned
        if self.active() {
            let _ = self.rollback(Reason::EXPLICIT | Reason::NO_RETRY);
        }

        for hook in &self.hooks {
            hook.on_exit_thread();
        }
        self.shared.quiesce.exit(&self.status);
    }
}

/// Materializes the bits `mask` does not cover from current memory. Full
/// and empty masks need no memory round-trip.
fn merge_from_memory(word: &TWord, value: Word, mask: Word) -> Word {
    if mask == 0 || mask == Word::MAX {
        value
    } else {
        (word.read_atomic() & !mask) | (value & mask)
    }
}
