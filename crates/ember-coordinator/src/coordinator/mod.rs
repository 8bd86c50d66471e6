//! The two-phase commit coordinator.
//!
//! Per distributed transaction the coordinator runs
//!
//! ```text
//! Init ──► Preparing ──► Committing ──► Committed
//!              │
//!              └────────► Aborting ───► Aborted
//! ```
//!
//! The ordering rule everything hangs on: the decision record is
//! appended to the durable log **before** the first phase-two message
//! leaves. Once that append returns, the outcome is fixed; delivery
//! failures are retried (by [`CommitCoordinator::recover`]) but the
//! decision is never revisited. A distributed transaction whose log
//! carries no decision record is presumed aborted on recovery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_common::types::{DistTxnId, ParticipantId, TxnId};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::log::{Decision, DecisionLog, LogError, LogRecord};
use crate::message::{CoordinatorMessage, ParticipantReply};
use crate::transport::ParticipantTransport;

/// Coordinator-side state of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistTxnState {
    /// Registered, prepare phase not started.
    Init,
    /// Prepare messages sent; votes being collected.
    Preparing,
    /// Commit decision durable; deliveries in progress.
    Committing,
    /// Abort decision durable; deliveries in progress.
    Aborting,
    /// Terminal: commit decision acked by every participant.
    Committed,
    /// Terminal: abort decision acked by every participant.
    Aborted,
}

/// Errors from coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No distributed transaction with this ID is known.
    #[error("distributed transaction {0} not found")]
    NotFound(DistTxnId),
    /// The operation is not legal in the transaction's current state.
    #[error("distributed transaction {dist_txn} is {state:?}, expected {expected}")]
    InvalidState {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// Its actual state.
        state: DistTxnState,
        /// The state the operation required.
        expected: &'static str,
    },
    /// The decision log refused an append; commits cannot finalize
    /// until it recovers.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Budget for the whole prepare phase; participants not reached in
    /// time count as no votes.
    pub prepare_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters for coordinator activity.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Distributed transactions begun.
    pub begun: AtomicU64,
    /// Commit decisions logged.
    pub committed: AtomicU64,
    /// Abort decisions logged.
    pub aborted: AtomicU64,
    /// Phase-two deliveries that failed and await retry.
    pub deliveries_failed: AtomicU64,
    /// Transactions resolved or re-driven by recovery.
    pub recovered: AtomicU64,
}

#[derive(Debug)]
struct DistTxn {
    state: DistTxnState,
    participants: Vec<(ParticipantId, TxnId)>,
    decision: Option<Decision>,
    /// Participants that have not acked the decision yet.
    unacked: HashSet<ParticipantId>,
}

/// Drives two-phase commit across participants.
pub struct CommitCoordinator {
    ids: AtomicU64,
    transport: Arc<dyn ParticipantTransport>,
    log: Arc<dyn DecisionLog>,
    txns: RwLock<HashMap<DistTxnId, Mutex<DistTxn>>>,
    config: CoordinatorConfig,
    stats: CoordinatorStats,
}

impl CommitCoordinator {
    /// Creates a coordinator with default configuration.
    pub fn new(transport: Arc<dyn ParticipantTransport>, log: Arc<dyn DecisionLog>) -> Self {
        Self::with_config(transport, log, CoordinatorConfig::default())
    }

    /// Creates a coordinator with custom configuration.
    pub fn with_config(
        transport: Arc<dyn ParticipantTransport>,
        log: Arc<dyn DecisionLog>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ids: AtomicU64::new(1),
            transport,
            log,
            txns: RwLock::new(HashMap::new()),
            config,
            stats: CoordinatorStats::default(),
        }
    }

    /// Returns coordinator statistics.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Registers a distributed transaction over already-running local
    /// transactions, one per participant.
    pub fn begin_distributed(&self, participants: Vec<(ParticipantId, TxnId)>) -> DistTxnId {
        let dist_txn = DistTxnId::new(self.ids.fetch_add(1, AtomicOrdering::SeqCst));
        let unacked = participants.iter().map(|&(p, _)| p).collect();
        self.txns.write().insert(
            dist_txn,
            Mutex::new(DistTxn {
                state: DistTxnState::Init,
                participants,
                decision: None,
                unacked,
            }),
        );
        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(%dist_txn, "distributed transaction begun");
        dist_txn
    }

    /// Returns the coordinator-side state of a distributed transaction.
    pub fn state(&self, dist_txn: DistTxnId) -> Result<DistTxnState, CoordinatorError> {
        let txns = self.txns.read();
        let txn = txns
            .get(&dist_txn)
            .ok_or(CoordinatorError::NotFound(dist_txn))?
            .lock();
        Ok(txn.state)
    }

    /// Runs the prepare phase and returns the tentative decision.
    ///
    /// The participant set is made durable first, so recovery can reach
    /// every participant even if the coordinator dies mid-phase. Any no
    /// vote, transport failure or deadline overrun makes the tentative
    /// decision Abort. Nothing is delivered to participants until
    /// [`CommitCoordinator::decide`].
    pub fn prepare(&self, dist_txn: DistTxnId) -> Result<Decision, CoordinatorError> {
        let txns = self.txns.read();
        let mut txn = txns
            .get(&dist_txn)
            .ok_or(CoordinatorError::NotFound(dist_txn))?
            .lock();
        if txn.state != DistTxnState::Init {
            return Err(self.state_error(dist_txn, &txn, "Init"));
        }

        self.log.append(&LogRecord::Begun {
            dist_txn,
            participants: txn.participants.clone(),
        })?;
        txn.state = DistTxnState::Preparing;

        let deadline = Instant::now() + self.config.prepare_timeout;
        let mut decision = Decision::Commit;
        for &(participant, txn_id) in &txn.participants {
            if Instant::now() >= deadline {
                warn!(%dist_txn, %participant, "prepare deadline passed, counting as no");
                decision = Decision::Abort;
                break;
            }
            let vote = self
                .transport
                .send(participant, CoordinatorMessage::Prepare { dist_txn, txn_id });
            match vote {
                Ok(ParticipantReply::VoteYes) => {}
                Ok(reply) => {
                    debug!(%dist_txn, %participant, ?reply, "no vote");
                    decision = Decision::Abort;
                    break;
                }
                Err(err) => {
                    warn!(%dist_txn, %participant, %err, "prepare delivery failed, counting as no");
                    decision = Decision::Abort;
                    break;
                }
            }
        }

        txn.decision = Some(decision);
        Ok(decision)
    }

    /// Logs the decision, then delivers it.
    ///
    /// The decision record is appended before any phase-two message is
    /// sent; a failed append aborts the operation with nothing
    /// delivered. Delivery failures leave the participant in the
    /// unacked set for [`CommitCoordinator::recover`] to retry.
    pub fn decide(&self, dist_txn: DistTxnId) -> Result<Decision, CoordinatorError> {
        let txns = self.txns.read();
        let mut txn = txns
            .get(&dist_txn)
            .ok_or(CoordinatorError::NotFound(dist_txn))?
            .lock();
        if txn.state != DistTxnState::Preparing {
            return Err(self.state_error(dist_txn, &txn, "Preparing"));
        }
        let Some(decision) = txn.decision else {
            return Err(self.state_error(dist_txn, &txn, "Preparing with votes collected"));
        };

        // Point of no return.
        self.log.append(&LogRecord::Decision { dist_txn, decision })?;
        txn.state = match decision {
            Decision::Commit => {
                self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
                DistTxnState::Committing
            }
            Decision::Abort => {
                self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
                DistTxnState::Aborting
            }
        };
        info!(%dist_txn, %decision, "decision logged");

        self.deliver_decision(dist_txn, &mut txn, decision);
        Ok(decision)
    }

    /// Convenience: prepare then decide.
    pub fn commit(&self, dist_txn: DistTxnId) -> Result<Decision, CoordinatorError> {
        self.prepare(dist_txn)?;
        self.decide(dist_txn)
    }

    /// Replays the decision log and finishes unfinished business.
    ///
    /// A transaction with a durable decision gets the decision re-sent
    /// to every participant not yet acked; one without a decision is
    /// presumed aborted, gets an Abort decision appended and rollbacks
    /// sent. Returns each transaction handled with its decision.
    ///
    /// Built to run on a fresh coordinator instance over an existing
    /// log, which is exactly the crash-restart case.
    pub fn recover(&self) -> Result<Vec<(DistTxnId, Decision)>, CoordinatorError> {
        struct Replayed {
            participants: Vec<(ParticipantId, TxnId)>,
            decision: Option<Decision>,
            forgotten: bool,
        }

        let mut replayed: Vec<(DistTxnId, Replayed)> = Vec::new();
        for record in self.log.read_all()? {
            match record {
                LogRecord::Begun {
                    dist_txn,
                    participants,
                } => replayed.push((
                    dist_txn,
                    Replayed {
                        participants,
                        decision: None,
                        forgotten: false,
                    },
                )),
                LogRecord::Decision { dist_txn, decision } => {
                    if let Some((_, r)) = replayed.iter_mut().find(|(id, _)| *id == dist_txn) {
                        r.decision = Some(decision);
                    }
                }
                LogRecord::Forgotten { dist_txn } => {
                    if let Some((_, r)) = replayed.iter_mut().find(|(id, _)| *id == dist_txn) {
                        r.forgotten = true;
                    }
                }
                // Participant-side records never appear in this log.
                LogRecord::Prepared { .. } => {}
            }
        }

        let mut handled = Vec::new();
        for (dist_txn, replay) in replayed {
            if replay.forgotten {
                continue;
            }

            let decision = match replay.decision {
                Some(d) => d,
                None => {
                    // Presumed abort: no decision ever became durable.
                    self.log.append(&LogRecord::Decision {
                        dist_txn,
                        decision: Decision::Abort,
                    })?;
                    self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
                    info!(%dist_txn, "no durable decision, presuming abort");
                    Decision::Abort
                }
            };

            // Rebuild (or refresh) the in-memory entry; ack state does
            // not survive a restart, so every participant is re-sent.
            let unacked: HashSet<ParticipantId> =
                replay.participants.iter().map(|&(p, _)| p).collect();
            let entry = Mutex::new(DistTxn {
                state: match decision {
                    Decision::Commit => DistTxnState::Committing,
                    Decision::Abort => DistTxnState::Aborting,
                },
                participants: replay.participants,
                decision: Some(decision),
                unacked,
            });
            self.txns.write().insert(dist_txn, entry);

            let txns = self.txns.read();
            if let Some(cell) = txns.get(&dist_txn) {
                let mut txn = cell.lock();
                self.deliver_decision(dist_txn, &mut txn, decision);
            }

            self.stats.recovered.fetch_add(1, AtomicOrdering::Relaxed);
            handled.push((dist_txn, decision));
        }
        Ok(handled)
    }

    /// Sends the decision to every unacked participant; acks shrink the
    /// set, and an empty set finishes the transaction.
    fn deliver_decision(&self, dist_txn: DistTxnId, txn: &mut DistTxn, decision: Decision) {
        let targets: Vec<(ParticipantId, TxnId)> = txn
            .participants
            .iter()
            .filter(|(p, _)| txn.unacked.contains(p))
            .copied()
            .collect();

        for (participant, txn_id) in targets {
            let msg = match decision {
                Decision::Commit => CoordinatorMessage::Commit { dist_txn, txn_id },
                Decision::Abort => CoordinatorMessage::Rollback { dist_txn, txn_id },
            };
            match self.transport.send(participant, msg) {
                Ok(ParticipantReply::Acked) => {
                    txn.unacked.remove(&participant);
                }
                Ok(reply) => {
                    warn!(%dist_txn, %participant, ?reply, "decision not acked");
                    self.stats
                        .deliveries_failed
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(err) => {
                    warn!(%dist_txn, %participant, %err, "decision delivery failed, will retry");
                    self.stats
                        .deliveries_failed
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
        }

        if txn.unacked.is_empty() {
            txn.state = match decision {
                Decision::Commit => DistTxnState::Committed,
                Decision::Abort => DistTxnState::Aborted,
            };
            // Forgetting is an optimization; a failed append only means
            // a redundant resend on the next recovery.
            if let Err(err) = self.log.append(&LogRecord::Forgotten { dist_txn }) {
                warn!(%dist_txn, %err, "forgotten record not durable");
            }
            debug!(%dist_txn, %decision, "all participants acked");
        }
    }

    fn state_error(
        &self,
        dist_txn: DistTxnId,
        txn: &DistTxn,
        expected: &'static str,
    ) -> CoordinatorError {
        CoordinatorError::InvalidState {
            dist_txn,
            state: txn.state,
            expected,
        }
    }
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("transactions", &self.txns.read().len())
            .finish()
    }
}
