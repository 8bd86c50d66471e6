//! # ember-coordinator
//!
//! Two-phase commit over EmberDB transaction managers.
//!
//! A distributed transaction spans local transactions on several
//! participants. The [`CommitCoordinator`] drives the protocol:
//!
//! 1. **Prepare**: every participant is asked to prepare its local
//!    transaction. A participant that prepares successfully votes yes
//!    and holds its locks; any failure is a no vote.
//! 2. **Decide**: unanimous yes means commit, anything else means
//!    abort. The decision is appended to a durable [`DecisionLog`]
//!    *before* any commit or rollback message leaves the coordinator.
//!    That append is the single point of no return.
//! 3. **Deliver**: the decision goes out to every participant; failed
//!    deliveries are retried by [`CommitCoordinator::recover`], which
//!    never revisits a logged decision.
//!
//! Recovery is presumed-abort: a distributed transaction found in the
//! log without a decision record is rolled back.
//!
//! The transport is pluggable through [`ParticipantTransport`]; the
//! in-process [`MemoryTransport`] supports partition injection so tests
//! can exercise crash and message-loss scenarios.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Coordinator state machine.
pub mod coordinator;

/// Durable decision log.
pub mod log;

/// Protocol messages.
pub mod message;

/// Participant-side protocol handler.
pub mod participant;

/// Message transport between coordinator and participants.
pub mod transport;

pub use coordinator::{
    CommitCoordinator, CoordinatorConfig, CoordinatorError, CoordinatorStats, DistTxnState,
};
pub use log::{Decision, DecisionLog, FileDecisionLog, LogError, LogRecord, MemoryDecisionLog};
pub use message::{CoordinatorMessage, ParticipantReply};
pub use participant::Participant;
pub use transport::{MemoryTransport, ParticipantTransport, TransportError};
