use crate::clock::HybridTime;
use crate::error::OperationError;
use crate::log::Index;
use crate::operations::OperationType;
use bytes::Bytes;
use std::fmt;
use std::sync::{Mutex, Weak};

/// Term is the consensus leadership term an operation was replicated under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OpId is a position in the replicated log: the term the entry was written under and its
/// log index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpId {
    pub term: Term,
    pub index: Index,
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// ReplicateMsg is the wire rendition of one operation: exactly the bytes consensus appends
/// to the log and ships to followers.
#[derive(Debug, Clone)]
pub struct ReplicateMsg {
    pub op_type: OperationType,
    /// Unset until consensus is about to append; stamped by the driver's append callback.
    pub hybrid_time: Option<HybridTime>,
    pub monotonic_counter: i64,
    pub payload: Bytes,
}

/// Invoked exactly once when consensus finishes replicating a round, with the outcome and
/// the term of the leader that committed it.
pub type ReplicatedCallback = Box<dyn Fn(Result<(), OperationError>, Option<Term>) + Send + Sync>;

/// ConsensusAppendCallback fires right before consensus appends a round's message to the
/// log, giving the owner a last chance to stamp the bytes about to become durable.
pub trait ConsensusAppendCallback: Send + Sync {
    fn handle_consensus_append(&self);
}

/// ConsensusRound is the bookkeeping for replicating one message: the message itself, the
/// term it is bound to, and the op id it gets once the log accepts it.
///
/// The round sits inside the operation's state, which the driver owns; the append callback
/// is therefore a weak reference, so a round never keeps a driver alive on its own.
pub struct ConsensusRound {
    replicate_msg: Mutex<ReplicateMsg>,
    bound_term: Mutex<Option<Term>>,
    assigned_id: Mutex<Option<OpId>>,
    replicated_cb: ReplicatedCallback,
    append_cb: Mutex<Option<Weak<dyn ConsensusAppendCallback>>>,
}

impl ConsensusRound {
    pub fn new(replicate_msg: ReplicateMsg, replicated_cb: ReplicatedCallback) -> Self {
        ConsensusRound {
            replicate_msg: Mutex::new(replicate_msg),
            bound_term: Mutex::new(None),
            assigned_id: Mutex::new(None),
            replicated_cb,
            append_cb: Mutex::new(None),
        }
    }

    pub fn bind_term(&self, term: Term) {
        let mut bound = self.bound_term.lock().expect("round term lock poisoned");
        assert!(bound.is_none(), "consensus round bound to a term twice");
        *bound = Some(term);
    }

    pub fn bound_term(&self) -> Option<Term> {
        *self.bound_term.lock().expect("round term lock poisoned")
    }

    pub fn set_append_callback(&self, callback: Weak<dyn ConsensusAppendCallback>) {
        *self.append_cb.lock().expect("round append callback lock poisoned") = Some(callback);
    }

    pub fn id(&self) -> Option<OpId> {
        *self.assigned_id.lock().expect("round id lock poisoned")
    }

    pub fn set_id(&self, id: OpId) {
        let mut assigned = self.assigned_id.lock().expect("round id lock poisoned");
        assert!(assigned.is_none(), "consensus round assigned an op id twice");
        *assigned = Some(id);
    }

    pub fn with_replicate_msg<R>(&self, f: impl FnOnce(&ReplicateMsg) -> R) -> R {
        f(&self.replicate_msg.lock().expect("round message lock poisoned"))
    }

    pub fn with_replicate_msg_mut<R>(&self, f: impl FnOnce(&mut ReplicateMsg) -> R) -> R {
        f(&mut self.replicate_msg.lock().expect("round message lock poisoned"))
    }

    /// Fires the append callback if its owner is still alive. Called by consensus with no
    /// locks of its own held; the callback will reach back into the owner.
    pub fn notify_append(&self) {
        let callback = self
            .append_cb
            .lock()
            .expect("round append callback lock poisoned")
            .clone();
        if let Some(callback) = callback.and_then(|weak| weak.upgrade()) {
            callback.handle_consensus_append();
        }
    }

    pub fn notify_replicated(&self, result: Result<(), OperationError>, leader_term: Option<Term>) {
        (self.replicated_cb)(result, leader_term);
    }
}

impl fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("bound_term", &self.bound_term())
            .field("id", &self.id())
            .finish()
    }
}
