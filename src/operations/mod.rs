mod change_metadata;
mod driver;
mod operation;
mod order_verifier;
mod preparer;
mod snapshot;
mod tracker;
mod write;

pub use change_metadata::ChangeMetadataOperation;
pub use driver::OperationDriver;
pub use driver::RejectedOperation;
pub use driver::TEST_DELAY_EXECUTE_ASYNC_MS;
pub use operation::CompletionCallback;
pub use operation::Operation;
pub use operation::OperationState;
pub use operation::OperationType;
pub use order_verifier::OperationOrderVerifier;
pub use preparer::Preparer;
pub use snapshot::SnapshotOperation;
pub use tracker::OperationTracker;
pub use write::WriteBatch;
pub use write::WriteOperation;
