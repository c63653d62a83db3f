//! Wires the whole operation pipeline against a single-node consensus and pushes a few
//! writes and a schema change through it.

use bytes::Bytes;
use slog::Drain;
use std::sync::Arc;
use tablet::{
    ChangeMetadataOperation, CompletionCallback, Consensus, HybridClock, LocalConsensus, OperationDriver,
    OperationOrderVerifier, OperationTracker, Preparer, TableType, TabletContext, Term, WriteBatch,
    WriteOperation,
};

#[tokio::main]
async fn main() {
    let logger = create_root_logger();

    let tablet = TabletContext::new("demo-tablet", TableType::User, Arc::new(HybridClock::system()));
    let consensus = Arc::new(LocalConsensus::new("demo-tablet", "demo-peer", logger.clone()));
    let tracker = Arc::new(OperationTracker::new(logger.clone(), Some(64 * 1024 * 1024)));
    let preparer = Arc::new(Preparer::start(consensus.clone(), logger.clone()));
    let verifier = Arc::new(OperationOrderVerifier::new());

    let new_driver = || {
        OperationDriver::new(
            tablet.clone(),
            tracker.clone(),
            Some(consensus.clone() as Arc<dyn Consensus>),
            preparer.clone(),
            verifier.clone(),
            logger.clone(),
        )
    };

    for (key, value) in [("user:1", "alice"), ("user:2", "bob"), ("user:3", "carol")] {
        let mut batch = WriteBatch::new();
        batch.put(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
        let operation = WriteOperation::new(tablet.clone(), batch);
        let (completion, receiver) = CompletionCallback::new();
        operation.set_completion(completion);

        let driver = new_driver();
        driver
            .init(Box::new(operation), Some(Term::new(1)))
            .expect("tracker admission");
        driver.execute_async();

        let op_id = receiver.await.expect("pipeline alive").expect("write replicated");
        slog::info!(logger, "write applied"; "key" => key, "op_id" => %op_id);
    }

    let schema_change = ChangeMetadataOperation::new(tablet.clone(), 1);
    let (completion, receiver) = CompletionCallback::new();
    schema_change.set_completion(completion);

    let driver = new_driver();
    driver
        .init(Box::new(schema_change), Some(Term::new(1)))
        .expect("tracker admission");
    driver.execute_async();
    let op_id = receiver
        .await
        .expect("pipeline alive")
        .expect("metadata change replicated");
    slog::info!(logger, "schema change applied"; "op_id" => %op_id);

    slog::info!(logger, "final tablet state";
        "rows" => tablet.row_count(),
        "schema_version" => tablet.schema_version(),
        "last_applied" => ?tablet.last_applied_op_id(),
    );
}

fn create_root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("tablet" => "demo-tablet"))
}
