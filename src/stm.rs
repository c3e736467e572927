// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The shared STM instance.
//!
//! [`Stm`] bundles the pieces every transaction consults: the global commit
//! clock, the striped lock array, the quiescence machinery and the hook
//! registry. It is a cheap clonable handle; clones share state, so one
//! instance can be handed to any number of threads.

use crate::error::TxError;
use crate::hooks::{EventHooks, MAX_CALLBACKS};
use crate::quiesce::Quiescence;
use crate::stripe::LockArray;
use crate::transaction::Context;
use crate::types::Word;
use crate::version::{VersionClock, VERSION_MAX};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum number of transaction-specific slots per instance.
pub(crate) const MAX_SPECIFIC: usize = 7;

/// Instance tunables.
///
/// The defaults match the compile-time values of the reference design; the
/// struct mainly exists so tests can shrink the lock array or lower the
/// clock range to exercise the rollover path.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Log2 of the lock-array length.
    pub lock_log_size: u32,
    /// Initial capacity of the per-transaction read and write logs.
    pub rw_set_capacity: usize,
    /// Clock value that triggers the quiescent rollover.
    pub version_max: Word,
    /// Maximum number of simultaneously registered contexts.
    pub max_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_log_size: 20,
            rw_set_capacity: 4096,
            version_max: VERSION_MAX,
            max_threads: 8192,
        }
    }
}

/// Introspection values returned by [`Stm::get_parameter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    Text(&'static str),
    Number(Word),
}

/// Key for a transaction-specific slot, obtained from
/// [`Stm::create_specific`].
#[derive(Clone, Copy, Debug)]
pub struct SpecificKey(pub(crate) usize);

pub(crate) struct Shared {
    pub clock: VersionClock,
    pub locks: LockArray,
    pub quiesce: Quiescence,
    pub hooks: Mutex<Vec<Arc<dyn EventHooks>>>,
    pub specific_keys: AtomicUsize,
    pub config: Config,
}

/// Handle to one STM instance.
///
/// # Example
/// ```
/// use stronghold_wstm::{Attributes, Stm, TWord};
///
/// let stm = Stm::default();
/// let account = TWord::new(100);
///
/// let mut ctx = stm.context();
/// ctx.execute(Attributes::default(), |tx| {
///     let balance = tx.load(&account)?;
///     tx.store(&account, balance + 25)
/// })
/// .expect("transaction failed");
///
/// assert_eq!(account.read_atomic(), 125);
/// ```
#[derive(Clone)]
pub struct Stm {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock: VersionClock::default(),
                locks: LockArray::new(config.lock_log_size),
                quiesce: Quiescence::new(config.max_threads),
                hooks: Mutex::new(Vec::new()),
                specific_keys: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Creates and registers a per-thread transaction descriptor.
    ///
    /// Every word the context will touch must outlive it; in practice,
    /// declare (or `Arc`) the [`TWord`](crate::TWord)s before the context.
    pub fn context<'env>(&self) -> Context<'env> {
        Context::init(self.shared.clone())
    }

    /// Current value of the global commit clock.
    pub fn get_clock(&self) -> Word {
        self.shared.clock.get()
    }

    /// Blocks until every transaction active at the time of the call has
    /// finished. New transactions step aside until the drain completes.
    ///
    /// Call this from a thread whose own context (if any) has no running
    /// transaction; a drain cannot wait on its own caller.
    pub fn quiesce(&self) {
        self.shared.quiesce.drain();
    }

    /// Registers a lifecycle hook set, invoked in registration order.
    ///
    /// Contexts snapshot the registry when they are created; register hooks
    /// before calling [`context`](Self::context).
    pub fn register_hooks(&self, hooks: Arc<dyn EventHooks>) -> Result<(), TxError> {
        let mut registry = self.shared.hooks.lock().expect("hook registry poisoned");
        if registry.len() == MAX_CALLBACKS {
            return Err(TxError::CallbackLimit);
        }

        registry.push(hooks);
        Ok(())
    }

    /// Allocates a transaction-specific slot key.
    pub fn create_specific(&self) -> Result<SpecificKey, TxError> {
        self.shared
            .specific_keys
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |keys| {
                (keys < MAX_SPECIFIC).then(|| keys + 1)
            })
            .map(SpecificKey)
            .map_err(|_| TxError::SpecificLimit)
    }

    /// Introspection over the instance configuration.
    pub fn get_parameter(&self, name: &str) -> Option<Param> {
        match name {
            "contention_manager" => Some(Param::Text("suicide")),
            "design" => Some(Param::Text("write-back-etl")),
            "initial_rw_set_size" => Some(Param::Number(self.shared.config.rw_set_capacity)),
            "lock_array_log_size" => Some(Param::Number(self.shared.config.lock_log_size as Word)),
            "version_max" => Some(Param::Number(self.shared.config.version_max)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Param, Stm, MAX_SPECIFIC};
    use crate::hooks::{EventHooks, MAX_CALLBACKS};
    use std::sync::Arc;

    struct Noop;
    impl EventHooks for Noop {}

    fn small() -> Stm {
        Stm::with_config(Config {
            lock_log_size: 10,
            ..Config::default()
        })
    }

    #[test]
    fn test_parameters() {
        let stm = small();
        assert_eq!(
            stm.get_parameter("design"),
            Some(Param::Text("write-back-etl"))
        );
        assert_eq!(
            stm.get_parameter("contention_manager"),
            Some(Param::Text("suicide"))
        );
        assert_eq!(
            stm.get_parameter("initial_rw_set_size"),
            Some(Param::Number(4096))
        );
        assert_eq!(stm.get_parameter("no_such_parameter"), None);
    }

    #[test]
    fn test_specific_key_limit() {
        let stm = small();
        for expected in 0..MAX_SPECIFIC {
            let key = stm.create_specific().expect("slot available");
            assert_eq!(key.0, expected);
        }
        assert!(stm.create_specific().is_err());
    }

    #[test]
    fn test_callback_limit() {
        let stm = small();
        for _ in 0..MAX_CALLBACKS {
            stm.register_hooks(Arc::new(Noop)).expect("slot available");
        }
        assert!(stm.register_hooks(Arc::new(Noop)).is_err());
    }
}
