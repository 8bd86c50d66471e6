//! Protocol messages between coordinator and participants.

use ember_common::types::{DistTxnId, TxnId};
use serde::{Deserialize, Serialize};

/// A message from the coordinator to a participant.
///
/// Every message names both the distributed transaction and the
/// participant's local transaction, so a participant never has to keep
/// its own mapping between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    /// Phase one: prepare the local transaction and vote.
    Prepare {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// The participant's local transaction.
        txn_id: TxnId,
    },
    /// Phase two: the decision was commit.
    Commit {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// The participant's local transaction.
        txn_id: TxnId,
    },
    /// Phase two: the decision was abort.
    Rollback {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// The participant's local transaction.
        txn_id: TxnId,
    },
}

impl CoordinatorMessage {
    /// Returns the distributed transaction this message concerns.
    pub fn dist_txn(&self) -> DistTxnId {
        match *self {
            CoordinatorMessage::Prepare { dist_txn, .. }
            | CoordinatorMessage::Commit { dist_txn, .. }
            | CoordinatorMessage::Rollback { dist_txn, .. } => dist_txn,
        }
    }

    /// Returns the participant-local transaction this message concerns.
    pub fn txn_id(&self) -> TxnId {
        match *self {
            CoordinatorMessage::Prepare { txn_id, .. }
            | CoordinatorMessage::Commit { txn_id, .. }
            | CoordinatorMessage::Rollback { txn_id, .. } => txn_id,
        }
    }
}

/// A participant's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantReply {
    /// Prepared and holding locks; will honor either decision.
    VoteYes,
    /// Could not prepare (or refuses the request); aborted locally.
    VoteNo,
    /// Phase-two message applied.
    Acked,
}
