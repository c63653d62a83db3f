use crate::consensus::{OpId, ReplicateMsg, Term};
use crate::error::OperationError;
use crate::operations::operation::{CompletionCallback, Operation, OperationState, OperationType};
use crate::tablet::TabletContext;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::{Arc, Mutex};

/// WriteBatch is the set of row puts one write operation carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    rows: Vec<(Bytes, Bytes)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.rows.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[(Bytes, Bytes)] {
        &self.rows
    }

    fn data_bytes(&self) -> usize {
        self.rows.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Encodes as:
    /// | u32 row count | (u32 key len | key | u32 value len | value)* |
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.rows.len() * 8 + self.data_bytes());
        buf.put_u32(self.rows.len() as u32);
        for (key, value) in &self.rows {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, OperationError> {
        if bytes.remaining() < 4 {
            return Err(Self::truncated());
        }
        let count = bytes.get_u32() as usize;
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let key = Self::take_chunk(&mut bytes)?;
            let value = Self::take_chunk(&mut bytes)?;
            rows.push((key, value));
        }
        Ok(WriteBatch { rows })
    }

    fn take_chunk(bytes: &mut Bytes) -> Result<Bytes, OperationError> {
        if bytes.remaining() < 4 {
            return Err(Self::truncated());
        }
        let len = bytes.get_u32() as usize;
        if bytes.remaining() < len {
            return Err(Self::truncated());
        }
        Ok(bytes.split_to(len))
    }

    fn truncated() -> OperationError {
        OperationError::InvalidArgument("truncated write batch".to_string())
    }
}

/// WriteOperation applies a batch of row puts to the tablet.
pub struct WriteOperation {
    state: Arc<OperationState>,
    batch: WriteBatch,
    completion: Mutex<Option<CompletionCallback>>,
}

impl WriteOperation {
    pub fn new(tablet: Arc<TabletContext>, batch: WriteBatch) -> Self {
        WriteOperation {
            state: OperationState::new(tablet),
            batch,
            completion: Mutex::new(None),
        }
    }

    pub fn set_completion(&self, completion: CompletionCallback) {
        *self.completion.lock().expect("write completion lock poisoned") = Some(completion);
    }

    /// Follower-side rebuild from a replicated message that already has its place in the
    /// log. Advances the local clock past the leader-assigned hybrid time.
    pub fn from_replicated(
        tablet: Arc<TabletContext>,
        msg: &ReplicateMsg,
        op_id: OpId,
    ) -> Result<Self, OperationError> {
        let batch = WriteBatch::decode(msg.payload.clone())?;
        let operation = WriteOperation::new(tablet, batch);
        operation.state.set_op_id(op_id);
        if let Some(hybrid_time) = msg.hybrid_time {
            operation.state.tablet().clock().observe(hybrid_time);
            operation.state.set_hybrid_time(hybrid_time);
        }
        Ok(operation)
    }

    fn respond(&self, result: Result<OpId, OperationError>) {
        if let Some(completion) = self
            .completion
            .lock()
            .expect("write completion lock poisoned")
            .take()
        {
            completion.send(result);
        }
    }
}

impl Operation for WriteOperation {
    fn op_type(&self) -> OperationType {
        OperationType::Write
    }

    fn state(&self) -> &Arc<OperationState> {
        &self.state
    }

    fn new_replicate_msg(&self) -> ReplicateMsg {
        ReplicateMsg {
            op_type: OperationType::Write,
            hybrid_time: None,
            monotonic_counter: 0,
            payload: self.batch.encode(),
        }
    }

    fn prepare(&self) -> Result<(), OperationError> {
        if self.batch.is_empty() {
            return Err(OperationError::InvalidArgument("write batch is empty".to_string()));
        }
        Ok(())
    }

    fn replicated(&self, _leader_term: Option<Term>) -> Result<(), OperationError> {
        let op_id = self
            .state
            .op_id()
            .ok_or_else(|| OperationError::IllegalState("write applied without an op id".to_string()))?;
        self.state.tablet().apply_write(op_id, self.batch.rows().to_vec());
        self.respond(Ok(op_id));
        Ok(())
    }

    fn aborted(&self, status: &OperationError) {
        self.respond(Err(status.clone()));
    }

    fn payload_bytes(&self) -> usize {
        self.batch.data_bytes()
    }
}

impl fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOperation")
            .field("rows", &self.batch.len())
            .field("op_id", &self.state.op_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HybridClock;
    use crate::tablet::TableType;

    fn test_tablet() -> Arc<TabletContext> {
        TabletContext::new("tablet-1", TableType::User, Arc::new(HybridClock::system()))
    }

    #[test]
    fn batch_survives_an_encode_decode_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(Bytes::from_static(b"k1"), Bytes::from_static(b"hello"));
        batch.put(Bytes::from_static(b""), Bytes::from_static(b"empty key is legal"));

        let decoded = WriteBatch::decode(batch.encode()).unwrap();

        assert_eq!(decoded, batch);
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        let mut batch = WriteBatch::new();
        batch.put(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let encoded = batch.encode();

        let truncated = encoded.slice(0..encoded.len() - 1);

        assert_eq!(
            WriteBatch::decode(truncated),
            Err(OperationError::InvalidArgument("truncated write batch".to_string()))
        );
    }

    #[test]
    fn prepare_rejects_an_empty_batch() {
        let operation = WriteOperation::new(test_tablet(), WriteBatch::new());

        assert_eq!(
            operation.prepare(),
            Err(OperationError::InvalidArgument("write batch is empty".to_string()))
        );
    }
}
