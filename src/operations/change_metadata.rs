use crate::consensus::{OpId, ReplicateMsg, Term};
use crate::error::OperationError;
use crate::operations::operation::{CompletionCallback, Operation, OperationState, OperationType};
use crate::tablet::TabletContext;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::{Arc, Mutex};

/// ChangeMetadataOperation installs a new schema version on the tablet. Replicated like any
/// write so every peer applies the metadata change at the same log position.
pub struct ChangeMetadataOperation {
    state: Arc<OperationState>,
    new_schema_version: u32,
    completion: Mutex<Option<CompletionCallback>>,
}

impl ChangeMetadataOperation {
    pub fn new(tablet: Arc<TabletContext>, new_schema_version: u32) -> Self {
        ChangeMetadataOperation {
            state: OperationState::new(tablet),
            new_schema_version,
            completion: Mutex::new(None),
        }
    }

    pub fn set_completion(&self, completion: CompletionCallback) {
        *self
            .completion
            .lock()
            .expect("change metadata completion lock poisoned") = Some(completion);
    }

    fn respond(&self, result: Result<OpId, OperationError>) {
        if let Some(completion) = self
            .completion
            .lock()
            .expect("change metadata completion lock poisoned")
            .take()
        {
            completion.send(result);
        }
    }
}

impl Operation for ChangeMetadataOperation {
    fn op_type(&self) -> OperationType {
        OperationType::ChangeMetadata
    }

    fn state(&self) -> &Arc<OperationState> {
        &self.state
    }

    fn new_replicate_msg(&self) -> ReplicateMsg {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(self.new_schema_version);
        ReplicateMsg {
            op_type: OperationType::ChangeMetadata,
            hybrid_time: None,
            monotonic_counter: 0,
            payload: payload.freeze(),
        }
    }

    fn prepare(&self) -> Result<(), OperationError> {
        let current = self.state.tablet().schema_version();
        if self.new_schema_version <= current {
            return Err(OperationError::InvalidArgument(format!(
                "schema version must advance: current {}, requested {}",
                current, self.new_schema_version
            )));
        }
        Ok(())
    }

    fn replicated(&self, _leader_term: Option<Term>) -> Result<(), OperationError> {
        let op_id = self.state.op_id().ok_or_else(|| {
            OperationError::IllegalState("metadata change applied without an op id".to_string())
        })?;
        self.state.tablet().install_schema_version(self.new_schema_version);
        self.respond(Ok(op_id));
        Ok(())
    }

    fn aborted(&self, status: &OperationError) {
        self.respond(Err(status.clone()));
    }
}

impl fmt::Debug for ChangeMetadataOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeMetadataOperation")
            .field("new_schema_version", &self.new_schema_version)
            .field("op_id", &self.state.op_id())
            .finish()
    }
}
