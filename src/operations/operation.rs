use crate::clock::HybridTime;
use crate::consensus::{ConsensusRound, OpId, ReplicateMsg, Term};
use crate::error::OperationError;
use crate::tablet::TabletContext;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// OperationType tags the concrete kind of a replicated operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationType {
    Write,
    ChangeMetadata,
    Snapshot,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Write => "WRITE",
            OperationType::ChangeMetadata => "CHANGE_METADATA",
            OperationType::Snapshot => "SNAPSHOT",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CompletionCallback answers the client that submitted an operation: the assigned op id on
/// success, the sticky status on abort. Dropping the receiver is fine; a response nobody is
/// waiting for is discarded.
pub struct CompletionCallback(oneshot::Sender<Result<OpId, OperationError>>);

impl CompletionCallback {
    pub fn new() -> (Self, oneshot::Receiver<Result<OpId, OperationError>>) {
        let (tx, rx) = oneshot::channel();
        (CompletionCallback(tx), rx)
    }

    pub fn send(self, result: Result<OpId, OperationError>) {
        let _ = self.0.send(result);
    }
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCallback").finish()
    }
}

const HYBRID_TIME_UNSET: u64 = 0;

/// OperationState is the part of an operation shared between the operation itself, its
/// driver, and the consensus round: the tablet it targets, the hybrid time it was assigned,
/// the op id it ends up with, and the round replicating it.
pub struct OperationState {
    tablet: Arc<TabletContext>,
    hybrid_time: AtomicU64,
    op_id: Mutex<Option<OpId>>,
    consensus_round: Mutex<Option<Arc<ConsensusRound>>>,
}

impl OperationState {
    pub fn new(tablet: Arc<TabletContext>) -> Arc<Self> {
        Arc::new(OperationState {
            tablet,
            hybrid_time: AtomicU64::new(HYBRID_TIME_UNSET),
            op_id: Mutex::new(None),
            consensus_round: Mutex::new(None),
        })
    }

    pub fn tablet(&self) -> &Arc<TabletContext> {
        &self.tablet
    }

    pub fn hybrid_time(&self) -> Option<HybridTime> {
        match self.hybrid_time.load(Ordering::Acquire) {
            HYBRID_TIME_UNSET => None,
            raw => Some(HybridTime::from_u64(raw)),
        }
    }

    pub fn set_hybrid_time(&self, hybrid_time: HybridTime) {
        self.hybrid_time.store(hybrid_time.as_u64(), Ordering::Release);
    }

    /// Start-time assignment: leaders take a fresh hybrid time here; followers arrive with
    /// the leader's already set and keep it.
    pub fn assign_hybrid_time_if_unset(&self) {
        if self.hybrid_time().is_none() {
            self.set_hybrid_time(self.tablet.clock().now());
        }
    }

    pub fn op_id(&self) -> Option<OpId> {
        *self.op_id.lock().expect("operation op id lock poisoned")
    }

    pub fn set_op_id(&self, op_id: OpId) {
        *self.op_id.lock().expect("operation op id lock poisoned") = Some(op_id);
    }

    pub fn consensus_round(&self) -> Option<Arc<ConsensusRound>> {
        self.consensus_round
            .lock()
            .expect("operation round lock poisoned")
            .clone()
    }

    pub fn set_consensus_round(&self, round: Arc<ConsensusRound>) {
        *self
            .consensus_round
            .lock()
            .expect("operation round lock poisoned") = Some(round);
    }
}

/// Operation is the capability set a driver consumes: the four lifecycle hooks plus access
/// to the shared state. Concrete kinds (write, change-metadata, snapshot) implement it; the
/// driver never knows which kind it is sequencing.
pub trait Operation: Send + fmt::Debug {
    fn op_type(&self) -> OperationType;

    fn state(&self) -> &Arc<OperationState>;

    /// `new_replicate_msg()` renders the operation into the message consensus will
    /// replicate. Called once, at driver init, before replication is armed.
    fn new_replicate_msg(&self) -> ReplicateMsg;

    /// Validation and resource acquisition. Runs on the preparer's worker; a failure here
    /// aborts the operation before it reaches consensus.
    fn prepare(&self) -> Result<(), OperationError>;

    /// `start()` runs once the operation's hybrid time must become visible. Always ordered
    /// before apply.
    fn start(&self) {
        self.state().assign_hybrid_time_if_unset();
    }

    /// The apply hook: replication succeeded and the operation commits its effects.
    /// `leader_term` is the committing leader's term, or `None` when apply was triggered
    /// from the prepare path.
    fn replicated(&self, leader_term: Option<Term>) -> Result<(), OperationError>;

    /// The operation will never be applied; `status` is the first error the driver saw.
    fn aborted(&self, status: &OperationError);

    /// Approximate in-memory footprint, used by the tracker for admission accounting.
    fn payload_bytes(&self) -> usize {
        0
    }
}
