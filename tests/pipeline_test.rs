//! End-to-end scenarios through the real pipeline: driver + tracker + preparer worker +
//! local consensus, observed through completion callbacks and tablet state.

use bytes::Bytes;
use std::sync::Arc;
use tablet::{
    ChangeMetadataOperation, CompletionCallback, Consensus, HybridClock, HybridTime, Index, LocalConsensus,
    OpId, OperationDriver, OperationError, OperationOrderVerifier, OperationTracker, OperationType, Preparer,
    ReplicateMsg, SnapshotOperation, TableType, TabletContext, Term, WriteBatch, WriteOperation,
};
use tokio::sync::oneshot;

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

struct Pipeline {
    tablet: Arc<TabletContext>,
    tracker: Arc<OperationTracker>,
    consensus: Arc<LocalConsensus>,
    preparer: Arc<Preparer>,
    verifier: Arc<OperationOrderVerifier>,
}

impl Pipeline {
    fn new(tablet_id: &str) -> Self {
        let consensus = Arc::new(LocalConsensus::new(tablet_id, "peer-1", test_logger()));
        Pipeline {
            tablet: TabletContext::new(tablet_id, TableType::User, Arc::new(HybridClock::system())),
            tracker: Arc::new(OperationTracker::new(test_logger(), None)),
            preparer: Arc::new(Preparer::start(consensus.clone(), test_logger())),
            consensus,
            verifier: Arc::new(OperationOrderVerifier::new()),
        }
    }

    fn driver(&self) -> Arc<OperationDriver> {
        OperationDriver::new(
            self.tablet.clone(),
            self.tracker.clone(),
            Some(self.consensus.clone() as Arc<dyn Consensus>),
            self.preparer.clone(),
            self.verifier.clone(),
            test_logger(),
        )
    }

    fn submit_write(&self, term: u64, rows: &[(&str, &str)]) -> oneshot::Receiver<Result<OpId, OperationError>> {
        let mut batch = WriteBatch::new();
        for (key, value) in rows {
            batch.put(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
        }
        let operation = WriteOperation::new(self.tablet.clone(), batch);
        let (completion, receiver) = CompletionCallback::new();
        operation.set_completion(completion);

        let driver = self.driver();
        driver
            .init(Box::new(operation), Some(Term::new(term)))
            .expect("tracker admission");
        driver.execute_async();
        receiver
    }
}

#[tokio::test]
async fn leader_write_reaches_the_tablet_and_reports_its_op_id() {
    let pipeline = Pipeline::new("tablet-s1");
    pipeline.tablet.set_monotonic_counter(42);

    let receiver = pipeline.submit_write(7, &[("k", "v1")]);
    let op_id = receiver.await.expect("pipeline alive").expect("write replicated");

    assert_eq!(op_id, OpId { term: Term::new(7), index: Index::new(1) });
    assert_eq!(pipeline.tablet.read(b"k"), Some(Bytes::from_static(b"v1")));
    assert_eq!(pipeline.tablet.last_applied_op_id(), Some(op_id));
    assert_eq!(pipeline.tracker.in_flight(), 0);

    // The logged bytes carry the clock assignment made on the append path.
    assert_eq!(pipeline.consensus.appended_entries(), 1);
    let entry = pipeline.consensus.read_entry(Index::new(1)).expect("entry logged");
    assert_eq!(entry.term, Term::new(7));
    assert!(entry.msg.hybrid_time.is_some());
    assert_eq!(entry.msg.monotonic_counter, 42);
}

#[tokio::test]
async fn follower_write_applies_after_the_replication_callback() {
    let pipeline = Pipeline::new("tablet-s2");

    // The message as a leader would have logged it: hybrid time stamped, batch encoded.
    let mut batch = WriteBatch::new();
    batch.put(Bytes::from_static(b"k"), Bytes::from_static(b"from-leader"));
    let leader_time = HybridTime::from_micros(5_000_000);
    let msg = ReplicateMsg {
        op_type: OperationType::Write,
        hybrid_time: Some(leader_time),
        monotonic_counter: 4,
        payload: batch.encode(),
    };
    let assigned = OpId { term: Term::new(5), index: Index::new(100) };

    let operation = WriteOperation::from_replicated(pipeline.tablet.clone(), &msg, assigned).unwrap();
    let (completion, receiver) = CompletionCallback::new();
    operation.set_completion(completion);

    let driver = pipeline.driver();
    driver.init(Box::new(operation), None).expect("tracker admission");
    driver.set_propagated_safe_time(leader_time);
    driver.execute_async();

    // Replication is externally driven on this path; the leader's commit arrives while the
    // preparer may not even have run yet.
    driver.replication_finished(Ok(()), Some(Term::new(5)));

    let op_id = receiver.await.expect("pipeline alive").expect("write applied");
    assert_eq!(op_id, assigned);
    assert_eq!(pipeline.tablet.read(b"k"), Some(Bytes::from_static(b"from-leader")));
    assert_eq!(pipeline.tablet.mvcc().propagated_safe_time(), Some(leader_time));
    // The local clock moved past the leader-assigned time.
    assert!(pipeline.tablet.clock().now() > leader_time);
    assert_eq!(pipeline.tracker.in_flight(), 0);
}

#[tokio::test]
async fn a_burst_of_writes_applies_in_log_order() {
    let pipeline = Pipeline::new("tablet-order");

    let keys: Vec<String> = (0..20).map(|i| format!("key-{}", i)).collect();
    let receivers: Vec<_> = keys
        .iter()
        .map(|key| pipeline.submit_write(7, &[(key.as_str(), "value")]))
        .collect();

    let mut last_index = 0;
    for receiver in receivers {
        let op_id = receiver.await.expect("pipeline alive").expect("write replicated");
        assert_eq!(op_id.term, Term::new(7));
        assert!(op_id.index.val() > last_index, "applies must follow log order");
        last_index = op_id.index.val();
    }

    assert_eq!(last_index, 20);
    assert_eq!(pipeline.tablet.row_count(), 20);
    assert_eq!(
        pipeline.tablet.last_applied_op_id(),
        Some(OpId { term: Term::new(7), index: Index::new(20) })
    );
    assert_eq!(pipeline.tracker.in_flight(), 0);
}

#[tokio::test]
async fn replication_failure_aborts_the_write_without_applying() {
    let pipeline = Pipeline::new("tablet-fail");
    pipeline
        .consensus
        .fail_next_replication(OperationError::Io("wal device lost".to_string()));

    let receiver = pipeline.submit_write(7, &[("k", "v")]);
    let result = receiver.await.expect("pipeline alive");

    assert_eq!(result, Err(OperationError::Io("wal device lost".to_string())));
    assert_eq!(pipeline.tablet.row_count(), 0);
    assert_eq!(pipeline.tracker.in_flight(), 0);
}

#[tokio::test]
async fn metadata_change_installs_the_new_schema_version() {
    let pipeline = Pipeline::new("tablet-meta");

    let operation = ChangeMetadataOperation::new(pipeline.tablet.clone(), 2);
    let (completion, receiver) = CompletionCallback::new();
    operation.set_completion(completion);

    let driver = pipeline.driver();
    driver
        .init(Box::new(operation), Some(Term::new(3)))
        .expect("tracker admission");
    driver.execute_async();

    receiver.await.expect("pipeline alive").expect("metadata change replicated");
    assert_eq!(pipeline.tablet.schema_version(), 2);
    assert_eq!(pipeline.tracker.in_flight(), 0);
}

#[tokio::test]
async fn snapshot_marks_the_tablet_at_its_hybrid_time() {
    let pipeline = Pipeline::new("tablet-snap");

    let driver = pipeline.driver();
    driver
        .init(Box::new(SnapshotOperation::new(pipeline.tablet.clone())), Some(Term::new(2)))
        .expect("tracker admission");
    driver.execute_async();

    // The preparer queue is FIFO: once this write has applied, the snapshot before it has
    // too.
    let receiver = pipeline.submit_write(2, &[("k", "v")]);
    receiver.await.expect("pipeline alive").expect("write replicated");

    assert!(pipeline.tablet.last_snapshot_hybrid_time().is_some());
    assert_eq!(pipeline.tracker.in_flight(), 0);
}

#[tokio::test]
async fn submission_after_preparer_shutdown_aborts_with_service_unavailable() {
    let pipeline = Pipeline::new("tablet-shutdown");
    pipeline.preparer.shutdown();

    let receiver = pipeline.submit_write(7, &[("k", "v")]);
    let result = receiver.await.expect("abort still answers the caller");

    assert!(matches!(result, Err(OperationError::ServiceUnavailable(_))));
    assert_eq!(pipeline.tablet.row_count(), 0);
    assert_eq!(pipeline.tracker.in_flight(), 0);
}
