use crate::error::OperationError;
use crate::operations::driver::{DriverId, OperationDriver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// OperationTracker is the registry of in-flight operation drivers. It holds the strong
/// reference that keeps a driver alive from admission to its terminal outcome, and accounts
/// for payload bytes so a tablet under memory pressure can refuse new operations.
pub struct OperationTracker {
    logger: slog::Logger,
    limit_bytes: Option<usize>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    drivers: HashMap<DriverId, Tracked>,
    total_bytes: usize,
}

struct Tracked {
    driver: Arc<OperationDriver>,
    bytes: usize,
}

impl OperationTracker {
    pub fn new(logger: slog::Logger, limit_bytes: Option<usize>) -> Self {
        OperationTracker {
            logger,
            limit_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// `add()` admits a driver, or refuses it when admission would exceed the byte limit.
    pub fn add(&self, driver: &Arc<OperationDriver>) -> Result<(), OperationError> {
        let bytes = driver.payload_bytes();
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if let Some(limit) = self.limit_bytes {
            if inner.total_bytes + bytes > limit {
                return Err(OperationError::ServiceUnavailable(format!(
                    "operation tracker over its limit of {} bytes: {} bytes across {} operations in flight, \
                     new operation needs {}",
                    limit,
                    inner.total_bytes,
                    inner.drivers.len(),
                    bytes
                )));
            }
        }
        inner.total_bytes += bytes;
        inner.drivers.insert(
            driver.driver_id(),
            Tracked {
                driver: Arc::clone(driver),
                bytes,
            },
        );
        Ok(())
    }

    /// `release()` drops the tracker's reference. Tolerates a driver that was already
    /// released: the abort path and the start-time reclaim check can race to be the one
    /// that lets go.
    pub fn release(&self, driver: &OperationDriver) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        match inner.drivers.remove(&driver.driver_id()) {
            Some(tracked) => inner.total_bytes -= tracked.bytes,
            None => slog::debug!(self.logger, "released a driver that was not tracked"; "driver" => %driver),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").drivers.len()
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").total_bytes
    }

    /// Snapshot of every in-flight driver, for shutdown diagnostics.
    pub fn in_flight_drivers(&self) -> Vec<Arc<OperationDriver>> {
        self.inner
            .lock()
            .expect("tracker lock poisoned")
            .drivers
            .values()
            .map(|tracked| Arc::clone(&tracked.driver))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HybridClock;
    use crate::consensus::{LocalConsensus, Term};
    use crate::operations::order_verifier::OperationOrderVerifier;
    use crate::operations::preparer::Preparer;
    use crate::operations::write::{WriteBatch, WriteOperation};
    use crate::tablet::{TableType, TabletContext};
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_preparer() -> Arc<Preparer> {
        let consensus = Arc::new(LocalConsensus::new("tablet-1", "peer-1", test_logger()));
        Arc::new(Preparer::start(consensus, test_logger()))
    }

    fn write_operation(tablet: &Arc<TabletContext>, key: &'static str, value: &'static str) -> Box<WriteOperation> {
        let mut batch = WriteBatch::new();
        batch.put(Bytes::from_static(key.as_bytes()), Bytes::from_static(value.as_bytes()));
        Box::new(WriteOperation::new(tablet.clone(), batch))
    }

    #[tokio::test]
    async fn admission_accounts_bytes_and_release_returns_them() {
        let tablet = TabletContext::new("tablet-1", TableType::User, Arc::new(HybridClock::system()));
        let tracker = Arc::new(OperationTracker::new(test_logger(), None));
        let preparer = test_preparer();
        let verifier = Arc::new(OperationOrderVerifier::new());

        let driver = OperationDriver::new(
            tablet.clone(),
            tracker.clone(),
            None,
            preparer,
            verifier,
            test_logger(),
        );
        driver
            .init(write_operation(&tablet, "key", "value"), Some(Term::new(1)))
            .unwrap();

        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.in_flight_bytes(), "key".len() + "value".len());
        assert_eq!(tracker.in_flight_drivers().len(), 1);

        tracker.release(&driver);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.in_flight_bytes(), 0);

        // Double release is quietly ignored.
        tracker.release(&driver);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn over_limit_admission_hands_the_operation_back() {
        let tablet = TabletContext::new("tablet-1", TableType::User, Arc::new(HybridClock::system()));
        let tracker = Arc::new(OperationTracker::new(test_logger(), Some(4)));
        let preparer = test_preparer();
        let verifier = Arc::new(OperationOrderVerifier::new());

        let driver = OperationDriver::new(
            tablet.clone(),
            tracker.clone(),
            None,
            preparer,
            verifier,
            test_logger(),
        );

        let rejected = driver
            .init(write_operation(&tablet, "key", "a value too large"), Some(Term::new(1)))
            .expect_err("admission should fail");

        assert!(matches!(rejected.cause, OperationError::ServiceUnavailable(_)));
        // The operation came back with the error, ready for the caller to dispose of.
        assert_eq!(rejected.operation.payload_bytes(), "key".len() + "a value too large".len());
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.in_flight_bytes(), 0);
    }
}
