//! The Small POS - offline-first sync core.
//!
//! Keeps the terminal usable without a server: reads come from a local
//! SQLite mirror of the server collections, writes that cannot reach the
//! server are queued with an optimistic local effect, and a reconciler
//! refreshes the mirror and drains the queues whenever the server is
//! reachable again.
//!
//! Entry point for embedders is [`engine::PosEngine`].

pub mod api;
pub mod collections;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod mutations;
pub mod orders;
pub mod queue;
pub mod reconciler;

#[cfg(test)]
mod testing;

pub use collections::Collection;
pub use config::CoreConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use engine::PosEngine;
pub use error::{CoreError, CoreResult};
pub use mirror::{MirrorView, Snapshot};
pub use mutations::{MutationClient, SubmitResult};
pub use orders::OrderClient;
pub use queue::{MutationKind, PendingMutation, PendingOrder, QueueStatus};
pub use reconciler::{DrainReport, RefreshOutcome, SyncEvent, SyncReconciler, SyncStatus};
