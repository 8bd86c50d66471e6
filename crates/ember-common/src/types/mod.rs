//! Core type definitions for EmberDB.
//!
//! These types are deliberately small wrappers: mixing up a transaction id
//! and a commit timestamp is a bug the type system should catch.

mod ids;
mod keys;
mod timestamps;

pub use ids::{DistTxnId, ParticipantId, TxnId};
pub use keys::RowKey;
pub use timestamps::{CommitSequencer, CommitTs, TxnIdSequencer};
