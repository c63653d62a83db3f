use std::io;

/// OperationError is the status type carried by the operation pipeline. A driver records the
/// first error it sees and sticks to it; everything downstream (abort hooks, completion
/// callbacks, diagnostics) reports that first error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(String),

    // Returned on admission failure (tracker over its limit, preparer shut down). Retryable
    // from the caller's point of view; the pipeline itself never retries.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<io::Error> for OperationError {
    fn from(e: io::Error) -> Self {
        OperationError::Io(e.to_string())
    }
}
