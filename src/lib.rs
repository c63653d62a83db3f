//! The per-tablet operation pipeline of a replicated database: every command a tablet
//! executes is owned by one `OperationDriver`, which sequences it through prepare, start,
//! replicate and apply, arbitrating between the preparer's and consensus's completions so
//! that exactly one of them triggers apply.

mod clock;
mod consensus;
mod error;
mod log;
mod operations;
mod tablet;

pub use clock::HybridClock;
pub use clock::HybridTime;
pub use clock::ManualClock;
pub use clock::PhysicalClock;
pub use clock::SystemClock;
pub use consensus::Consensus;
pub use consensus::ConsensusAppendCallback;
pub use consensus::ConsensusRound;
pub use consensus::LocalConsensus;
pub use consensus::OpId;
pub use consensus::ReplicateMsg;
pub use consensus::ReplicatedCallback;
pub use consensus::Term;
pub use error::OperationError;
pub use log::InMemoryLog;
pub use log::Index;
pub use log::Log;
pub use log::LogEntry;
pub use operations::ChangeMetadataOperation;
pub use operations::CompletionCallback;
pub use operations::Operation;
pub use operations::OperationDriver;
pub use operations::OperationOrderVerifier;
pub use operations::OperationState;
pub use operations::OperationTracker;
pub use operations::OperationType;
pub use operations::Preparer;
pub use operations::RejectedOperation;
pub use operations::SnapshotOperation;
pub use operations::WriteBatch;
pub use operations::WriteOperation;
pub use operations::TEST_DELAY_EXECUTE_ASYNC_MS;
pub use tablet::MvccManager;
pub use tablet::TableType;
pub use tablet::TabletContext;
