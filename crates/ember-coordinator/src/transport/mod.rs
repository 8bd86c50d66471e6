//! Message transport between coordinator and participants.
//!
//! The coordinator only needs request-reply delivery, abstracted behind
//! [`ParticipantTransport`]. [`MemoryTransport`] is the in-process
//! implementation: it dispatches directly into registered
//! [`Participant`]s and can inject one-way partitions, which is how the
//! tests simulate lost deliveries and coordinator crashes.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use ember_common::types::ParticipantId;
use parking_lot::RwLock;
use thiserror::Error;

use crate::message::{CoordinatorMessage, ParticipantReply};
use crate::participant::Participant;

/// Errors from message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No reply arrived in time; the message may or may not have been
    /// delivered.
    #[error("delivery to participant {0} timed out")]
    Timeout(ParticipantId),
    /// The participant is not registered.
    #[error("unknown participant {0}")]
    Unknown(ParticipantId),
}

/// Request-reply delivery to participants.
pub trait ParticipantTransport: Send + Sync {
    /// Delivers `msg` to participant `to` and returns its reply.
    fn send(
        &self,
        to: ParticipantId,
        msg: CoordinatorMessage,
    ) -> Result<ParticipantReply, TransportError>;
}

/// In-process transport with partition injection.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    participants: DashMap<ParticipantId, Arc<Participant>>,
    /// Participants currently unreachable from the coordinator.
    partitioned: RwLock<HashSet<ParticipantId>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant.
    pub fn register(&self, participant: Arc<Participant>) {
        self.participants.insert(participant.id(), participant);
    }

    /// Makes a participant unreachable; sends to it fail with
    /// [`TransportError::Timeout`] until healed.
    pub fn partition(&self, id: ParticipantId) {
        self.partitioned.write().insert(id);
    }

    /// Restores reachability of one participant.
    pub fn heal(&self, id: ParticipantId) {
        self.partitioned.write().remove(&id);
    }

    /// Restores reachability of every participant.
    pub fn heal_all(&self) {
        self.partitioned.write().clear();
    }

    /// Returns true if sends to `id` are currently dropped.
    pub fn is_partitioned(&self, id: ParticipantId) -> bool {
        self.partitioned.read().contains(&id)
    }
}

impl ParticipantTransport for MemoryTransport {
    fn send(
        &self,
        to: ParticipantId,
        msg: CoordinatorMessage,
    ) -> Result<ParticipantReply, TransportError> {
        if self.is_partitioned(to) {
            return Err(TransportError::Timeout(to));
        }
        let participant = self
            .participants
            .get(&to)
            .ok_or(TransportError::Unknown(to))?;
        Ok(participant.handle(msg))
    }
}
