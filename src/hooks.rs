// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle extension hooks.

use crate::error::Reason;

/// Maximum number of hook sets one instance accepts.
pub(crate) const MAX_CALLBACKS: usize = 7;

/// Capability set invoked at descriptor and transaction lifecycle points.
///
/// Register implementations with [`Stm::register_hooks`](crate::Stm::register_hooks)
/// before creating contexts; each context snapshots the registry at creation.
/// Hooks fire in registration order. Every method has a no-op default, so an
/// implementation only overrides the points it cares about.
pub trait EventHooks: Send + Sync {
    /// A descriptor was created.
    fn on_init_thread(&self) {}

    /// A descriptor is being torn down.
    fn on_exit_thread(&self) {}

    /// A transaction (re)started with a fresh snapshot.
    fn on_start(&self) {}

    /// Commit is about to take its timestamp.
    fn on_precommit(&self) {}

    /// The transaction committed.
    fn on_commit(&self) {}

    /// The transaction rolled back.
    fn on_abort(&self, _reason: Reason) {}
}
