//! # ember-mvcc
//!
//! Multi-version concurrency control for EmberDB.
//!
//! This crate implements:
//! - Version chain storage with `xmin`/`xmax` tagging
//! - Snapshot visibility
//! - First-committer-wins write-write conflict detection
//! - Garbage collection of versions no active snapshot can see
//!
//! Readers never block: visibility is decided by comparing commit
//! timestamps against the reading transaction's snapshot. Writers are
//! serialized per key by the lock manager (in `ember-txn`), not by the
//! data structures here.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Conflict errors.
pub mod error;

/// Garbage collection.
pub mod gc;

/// Snapshot visibility.
pub mod snapshot;

/// Version chain storage.
pub mod version;

pub use error::{ConflictError, MvccResult};
pub use gc::{GarbageCollector, GcConfig, GcHandle, GcStats, OldestSnapshot};
pub use snapshot::Snapshot;
pub use version::{Version, VersionChain, VersionEnd, VersionStore};
