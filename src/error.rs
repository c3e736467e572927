// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Abort reasons and the user-visible error type.

use bitflags::bitflags;
use thiserror::Error as DeriveError;

bitflags! {
    /// Reason bits carried by a transactional abort.
    ///
    /// Aborts are expected events: the engine rolls the transaction back and
    /// the retry loop re-runs it, so these bits are diagnostics and retry
    /// advice rather than failures. `NO_RETRY` is the exception: it tells
    /// the retry loop to surface the abort to the caller.
    pub struct Reason: usize {
        /// A read observed a stripe owned by another transaction.
        const RW_CONFLICT = 0x001;
        /// A write observed a stripe owned by another transaction.
        const WW_CONFLICT = 0x002;
        /// Extending the snapshot during a read failed validation.
        const VAL_READ = 0x004;
        /// A write targeted a stripe read under an older snapshot.
        const VAL_WRITE = 0x008;
        /// Commit-time validation failed.
        const VALIDATE = 0x010;
        /// The write log is full; the rollback path reallocates before the
        /// retry.
        const EXTEND_WS = 0x020;
        /// A store was attempted under a read-only attribute; the retry
        /// loop upgrades the transaction to an update transaction.
        const RO_WRITE = 0x040;
        /// An irrevocable transaction is in progress.
        const IRREVOCABLE = 0x080;
        /// User-requested abort.
        const EXPLICIT = 0x100;
        /// Suppresses the automatic retry.
        const NO_RETRY = 0x200;
        /// Advises the retry target to re-enter the instrumented code path.
        const PATH_INSTRUMENTED = 0x400;
    }
}

impl Reason {
    /// Whether the retry loop may re-run the transaction.
    pub fn retryable(self) -> bool {
        !self.contains(Reason::NO_RETRY)
    }
}

/// Errors surfaced to callers of the transactional API.
#[derive(Debug, DeriveError)]
pub enum TxError {
    /// The transaction was rolled back. Retryable aborts are normally
    /// consumed by [`Context::execute`](crate::Context::execute); callers
    /// only see this with `NO_RETRY` set or when driving the low-level
    /// layer themselves.
    #[error("transaction aborted ({0:?})")]
    Aborted(Reason),

    /// The callback registry is full.
    #[error("callback limit reached")]
    CallbackLimit,

    /// All transaction-specific slots are taken.
    #[error("specific slot limit reached")]
    SpecificLimit,
}

impl TxError {
    /// The abort reason, if this error is an abort.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            TxError::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Reason;

    #[test]
    fn test_reason_bits_disjoint() {
        let all = [
            Reason::RW_CONFLICT,
            Reason::WW_CONFLICT,
            Reason::VAL_READ,
            Reason::VAL_WRITE,
            Reason::VALIDATE,
            Reason::EXTEND_WS,
            Reason::RO_WRITE,
            Reason::IRREVOCABLE,
            Reason::EXPLICIT,
            Reason::NO_RETRY,
            Reason::PATH_INSTRUMENTED,
        ];

        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!((*a & *b).is_empty());
            }
        }
    }

    #[test]
    fn test_retry_advice() {
        assert!(Reason::WW_CONFLICT.retryable());
        assert!((Reason::EXPLICIT | Reason::PATH_INSTRUMENTED).retryable());
        assert!(!(Reason::EXPLICIT | Reason::NO_RETRY).retryable());
    }
}
