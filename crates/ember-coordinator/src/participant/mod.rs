//! Participant-side protocol handler.
//!
//! A participant wraps a local [`TransactionManager`] and its own
//! decision log. The contract of a yes vote: the local transaction is
//! Prepared (staged versions and locks intact) and the prepared record
//! is durable, so the participant can honor either decision even after
//! a restart.
//!
//! Between voting yes and receiving the decision the participant is
//! blocked: it holds its locks and cannot unilaterally resolve the
//! transaction. [`Participant::recover`] surfaces transactions stuck in
//! that window.

use std::sync::Arc;

use ember_common::types::{DistTxnId, ParticipantId};
use ember_txn::manager::{TransactionManager, TransactionState, TxnError};
use tracing::{debug, warn};

use crate::log::{Decision, DecisionLog, LogRecord};
use crate::message::{CoordinatorMessage, ParticipantReply};

/// One participant in the two-phase commit protocol.
pub struct Participant {
    id: ParticipantId,
    manager: Arc<TransactionManager>,
    log: Arc<dyn DecisionLog>,
}

impl Participant {
    /// Creates a participant over a local transaction manager.
    pub fn new(
        id: ParticipantId,
        manager: Arc<TransactionManager>,
        log: Arc<dyn DecisionLog>,
    ) -> Self {
        Self { id, manager, log }
    }

    /// Returns this participant's ID.
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Returns the local transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Handles one coordinator message.
    pub fn handle(&self, msg: CoordinatorMessage) -> ParticipantReply {
        match msg {
            CoordinatorMessage::Prepare { dist_txn, txn_id } => {
                if let Err(err) = self.manager.prepare(txn_id) {
                    debug!(participant = %self.id, %dist_txn, %err, "prepare failed, voting no");
                    let _ = self.manager.abort(txn_id);
                    return ParticipantReply::VoteNo;
                }
                // A yes vote without a durable prepared record would be
                // unrecoverable; abort instead.
                let record = LogRecord::Prepared { dist_txn, txn_id };
                if let Err(err) = self.log.append(&record) {
                    warn!(participant = %self.id, %dist_txn, %err, "prepared record not durable, voting no");
                    let _ = self.manager.abort(txn_id);
                    return ParticipantReply::VoteNo;
                }
                ParticipantReply::VoteYes
            }
            CoordinatorMessage::Commit { dist_txn, txn_id } => {
                match self.manager.commit_prepared(txn_id) {
                    Ok(_) => {}
                    // Retried delivery of a decision already applied.
                    Err(TxnError::InvalidState {
                        state: TransactionState::Committed,
                        ..
                    }) => {}
                    Err(err) => {
                        warn!(participant = %self.id, %dist_txn, %err, "commit decision not applicable");
                        return ParticipantReply::VoteNo;
                    }
                }
                if let Err(err) = self.log.append(&LogRecord::Decision {
                    dist_txn,
                    decision: Decision::Commit,
                }) {
                    warn!(participant = %self.id, %dist_txn, %err, "decision record not durable");
                }
                ParticipantReply::Acked
            }
            CoordinatorMessage::Rollback { dist_txn, txn_id } => {
                match self.manager.abort(txn_id) {
                    // Unknown or already aborted both satisfy a rollback.
                    Ok(()) | Err(TxnError::NotFound(_)) | Err(TxnError::Aborted { .. }) => {}
                    Err(err) => {
                        warn!(participant = %self.id, %dist_txn, %err, "rollback decision not applicable");
                        return ParticipantReply::VoteNo;
                    }
                }
                if let Err(err) = self.log.append(&LogRecord::Decision {
                    dist_txn,
                    decision: Decision::Abort,
                }) {
                    warn!(participant = %self.id, %dist_txn, %err, "decision record not durable");
                }
                ParticipantReply::Acked
            }
        }
    }

    /// Returns distributed transactions this participant prepared but
    /// never saw a decision for.
    ///
    /// These are in doubt: their local transactions hold locks until the
    /// coordinator's recovery (or an operator) resolves them.
    pub fn recover(&self) -> Result<Vec<DistTxnId>, crate::log::LogError> {
        let records = self.log.read_all()?;
        let decided: Vec<DistTxnId> = records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Decision { dist_txn, .. } => Some(*dist_txn),
                _ => None,
            })
            .collect();

        let mut in_doubt: Vec<DistTxnId> = records
            .iter()
            .filter_map(|r| match r {
                LogRecord::Prepared { dist_txn, .. } if !decided.contains(dist_txn) => {
                    Some(*dist_txn)
                }
                _ => None,
            })
            .collect();
        in_doubt.sort();
        in_doubt.dedup();

        for dist_txn in &in_doubt {
            warn!(participant = %self.id, %dist_txn, "prepared with no decision, still holding locks");
        }
        Ok(in_doubt)
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant").field("id", &self.id).finish()
    }
}
