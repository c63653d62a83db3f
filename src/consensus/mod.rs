mod local;
mod round;

pub use local::LocalConsensus;
pub use round::ConsensusAppendCallback;
pub use round::ConsensusRound;
pub use round::OpId;
pub use round::ReplicateMsg;
pub use round::ReplicatedCallback;
pub use round::Term;

use crate::error::OperationError;
use std::sync::Arc;

/// Consensus replicates operations across a tablet's peers and reports back, per round,
/// once an operation has a durable place in the log.
pub trait Consensus: Send + Sync {
    /// `new_round()` wraps one replicate message into a round. The callback is invoked
    /// exactly once when replication of that round finishes, successfully or not.
    fn new_round(&self, replicate_msg: ReplicateMsg, replicated_cb: ReplicatedCallback) -> Arc<ConsensusRound>;

    /// `replicate_batch()` starts replication of prepared rounds, in order. Per-round
    /// failures are reported through each round's callback; an error here means the batch
    /// was never submitted at all.
    fn replicate_batch(&self, rounds: &[Arc<ConsensusRound>]) -> Result<(), OperationError>;

    fn tablet_id(&self) -> &str;

    fn peer_uuid(&self) -> &str;
}
