use crate::consensus::{Consensus, ConsensusRound, OpId, ReplicateMsg, ReplicatedCallback};
use crate::error::OperationError;
use crate::log::{Index, InMemoryLog, Log, LogEntry};
use std::sync::{Arc, Mutex};

/// LocalConsensus is a single-peer consensus: every round it accepts is immediately
/// appended to the local log and completed, synchronously and in log order. It gives the
/// operation pipeline (and its tests and demos) the full leader-side replication flow
/// without any peers on the other end.
pub struct LocalConsensus {
    tablet_id: String,
    peer_uuid: String,
    logger: slog::Logger,
    log: Mutex<InMemoryLog>,
    fail_next: Mutex<Option<OperationError>>,
}

impl LocalConsensus {
    pub fn new(tablet_id: impl Into<String>, peer_uuid: impl Into<String>, logger: slog::Logger) -> Self {
        LocalConsensus {
            tablet_id: tablet_id.into(),
            peer_uuid: peer_uuid.into(),
            logger,
            log: Mutex::new(InMemoryLog::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// `fail_next_replication()` makes the next round complete with `error` after it has
    /// been appended. One-shot; test use only.
    pub fn fail_next_replication(&self, error: OperationError) {
        *self.fail_next.lock().expect("fail_next lock poisoned") = Some(error);
    }

    pub fn appended_entries(&self) -> u64 {
        self.log.lock().expect("local consensus log lock poisoned").next_index().val() - 1
    }

    pub fn read_entry(&self, index: Index) -> Option<LogEntry> {
        self.log
            .lock()
            .expect("local consensus log lock poisoned")
            .read(index)
            .expect("in-memory log reads cannot fail")
    }
}

impl Consensus for LocalConsensus {
    fn new_round(&self, replicate_msg: ReplicateMsg, replicated_cb: ReplicatedCallback) -> Arc<ConsensusRound> {
        Arc::new(ConsensusRound::new(replicate_msg, replicated_cb))
    }

    fn replicate_batch(&self, rounds: &[Arc<ConsensusRound>]) -> Result<(), OperationError> {
        for round in rounds {
            let term = round.bound_term().ok_or_else(|| {
                OperationError::IllegalState("replicating a round that was never bound to a term".to_string())
            })?;

            // Stamp before append, so the logged bytes carry the hybrid time.
            round.notify_append();

            let index = {
                let mut log = self.log.lock().expect("local consensus log lock poisoned");
                log.append(LogEntry {
                    term,
                    msg: round.with_replicate_msg(|msg| msg.clone()),
                })?
            };
            let op_id = OpId { term, index };
            round.set_id(op_id);

            match self.fail_next.lock().expect("fail_next lock poisoned").take() {
                Some(error) => {
                    slog::debug!(self.logger, "injecting replication failure"; "op_id" => %op_id);
                    round.notify_replicated(Err(error), Some(term));
                }
                None => round.notify_replicated(Ok(()), Some(term)),
            }
        }
        Ok(())
    }

    fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }
}
