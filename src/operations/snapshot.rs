use crate::consensus::{ReplicateMsg, Term};
use crate::error::OperationError;
use crate::operations::operation::{Operation, OperationState, OperationType};
use crate::tablet::TabletContext;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// SnapshotOperation marks a consistent cut of the tablet at its own hybrid time. The
/// marker rides through the log so every peer agrees on where the cut sits relative to
/// other operations.
pub struct SnapshotOperation {
    state: Arc<OperationState>,
}

impl SnapshotOperation {
    pub fn new(tablet: Arc<TabletContext>) -> Self {
        SnapshotOperation {
            state: OperationState::new(tablet),
        }
    }
}

impl Operation for SnapshotOperation {
    fn op_type(&self) -> OperationType {
        OperationType::Snapshot
    }

    fn state(&self) -> &Arc<OperationState> {
        &self.state
    }

    fn new_replicate_msg(&self) -> ReplicateMsg {
        ReplicateMsg {
            op_type: OperationType::Snapshot,
            hybrid_time: None,
            monotonic_counter: 0,
            payload: Bytes::new(),
        }
    }

    fn prepare(&self) -> Result<(), OperationError> {
        Ok(())
    }

    fn replicated(&self, _leader_term: Option<Term>) -> Result<(), OperationError> {
        let hybrid_time = self.state.hybrid_time().ok_or_else(|| {
            OperationError::IllegalState("snapshot applied without a hybrid time".to_string())
        })?;
        self.state.tablet().record_snapshot(hybrid_time);
        Ok(())
    }

    fn aborted(&self, _status: &OperationError) {}
}

impl fmt::Debug for SnapshotOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotOperation")
            .field("hybrid_time", &self.state.hybrid_time())
            .finish()
    }
}
