// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Word-Granular Software Transactional Memory
//!
//! This crate implements a word-based software transactional memory with
//! invisible reads, encounter-time locking and write-back commit. Shared
//! memory is organized as [`TWord`] cells whose addresses hash into a fixed
//! striped array of versioned lock words; a global clock orders commits and
//! lets live transactions prove that the snapshot they observe is
//! consistent (opacity). Conflicting transactions never block each other:
//! the losing side rolls back and re-runs on a fresh snapshot.
//!
//! # Example
//! ```
//! use stronghold_wstm::{Attributes, Stm, TWord};
//!
//! // transfer between two accounts, atomically
//! let stm = Stm::default();
//! let alice = TWord::new(100);
//! let bob = TWord::new(0);
//!
//! let mut ctx = stm.context();
//! ctx.execute(Attributes::default(), |tx| {
//!     let amount = 30;
//!     let from = tx.load(&alice)?;
//!     let to = tx.load(&bob)?;
//!     tx.store(&alice, from - amount)?;
//!     tx.store(&bob, to + amount)
//! })
//! .expect("transfer failed");
//!
//! assert_eq!(alice.read_atomic() + bob.read_atomic(), 100);
//! ```

pub mod error;
pub mod hooks;
pub mod stm;
pub mod transaction;
pub mod types;

mod quiesce;
mod rwset;
mod stripe;
mod version;

pub use error::{Reason, TxError};
pub use hooks::EventHooks;
pub use stm::{Config, Param, SpecificKey, Stm};
pub use transaction::{Attributes, Context};
pub use types::{TWord, Word};
pub use version::VERSION_MAX;

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL: Stm = Stm::new();
}

/// Returns the process-wide default [`Stm`] instance.
///
/// Handy when threading an instance through every call site is not worth
/// it; independent instances via [`Stm::new`] remain the composable option.
pub fn global() -> &'static Stm {
    &GLOBAL
}
