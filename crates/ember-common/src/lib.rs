//! # ember-common
//!
//! Shared types for the EmberDB concurrency-control core.
//!
//! This crate provides the typed identifiers and sequencers used by every
//! other crate in the workspace:
//!
//! - [`types::TxnId`], [`types::ParticipantId`], [`types::DistTxnId`]:
//!   type-safe identifier wrappers.
//! - [`types::CommitTs`]: commit timestamps defining the total commit order.
//! - [`types::CommitSequencer`], [`types::TxnIdSequencer`]: strictly
//!   monotonic atomic allocators.
//! - [`types::RowKey`]: variable-length row keys.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Core type definitions.
pub mod types;

pub use types::{
    CommitSequencer, CommitTs, DistTxnId, ParticipantId, RowKey, TxnId, TxnIdSequencer,
};
