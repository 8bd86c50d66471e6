//! # ember-txn
//!
//! Transaction management for the EmberDB concurrency core.
//!
//! This crate provides:
//!
//! - **Transaction Lifecycle**: begin, read, write, delete, commit, abort,
//!   plus prepare/commit-prepared for two-phase commit participants.
//!
//! - **Lock Management**: row-level Shared and Exclusive locks with FIFO
//!   fair wait queues (a queued Exclusive request blocks later Shared
//!   requests from jumping ahead).
//!
//! - **Deadlock Detection**: periodic wait-for-graph cycle detection with
//!   youngest-victim selection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   TransactionManager                     │
//! │                          │                               │
//! │        ┌─────────────────┼─────────────────┐             │
//! │        ▼                 ▼                 ▼             │
//! │ ┌─────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │ │ Sequencers  │  │ VersionStore │  │   LockManager    │  │
//! │ │ (TxnId/Ts)  │  │ (ember-mvcc) │  │        │         │  │
//! │ └─────────────┘  └──────────────┘  │        ▼         │  │
//! │                                    │ DeadlockDetector │  │
//! │                                    └──────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Deadlock detection.
pub mod deadlock;

/// Row-level lock table.
pub mod lock;

/// Transaction lifecycle management.
pub mod manager;

pub use deadlock::{DeadlockDetector, DeadlockStats, DetectorHandle, WaitForGraph};
pub use lock::{LockError, LockManager, LockManagerConfig, LockMode, LockStats};
pub use manager::{
    AbortReason, IsolationLevel, TransactionManager, TransactionManagerConfig, TransactionState,
    TransactionStats, TxnError, TxnResult,
};
