use crate::log::Index;
use std::sync::Mutex;

/// OperationOrderVerifier asserts the invariant binding log order to apply order: per
/// tablet, operations apply in strictly increasing log-index order, and the physical time
/// captured at prepare never regresses between applies.
///
/// A violation is a bug in the pipeline, not a recoverable condition, so this panics.
/// `check_apply()` is safe to call with the driver lock held: it only takes its own lock
/// and never calls back into a driver.
pub struct OperationOrderVerifier {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    last_index: Option<Index>,
    last_prepare_micros: u64,
}

impl OperationOrderVerifier {
    pub fn new() -> Self {
        OperationOrderVerifier {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn check_apply(&self, index: Index, prepare_physical_micros: u64) {
        let mut inner = self.inner.lock().expect("order verifier lock poisoned");
        if let Some(last_index) = inner.last_index {
            assert!(
                index > last_index,
                "operation applied out of order: index {} after {}",
                index,
                last_index
            );
        }
        assert!(
            prepare_physical_micros >= inner.last_prepare_micros,
            "prepare physical time regressed: {} after {}",
            prepare_physical_micros,
            inner.last_prepare_micros
        );
        inner.last_index = Some(index);
        inner.last_prepare_micros = prepare_physical_micros;
    }
}

impl Default for OperationOrderVerifier {
    fn default() -> Self {
        Self::new()
    }
}
