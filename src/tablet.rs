use crate::clock::{HybridClock, HybridTime};
use crate::consensus::OpId;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// TableType tags what kind of table a tablet serves. The apply layer and test hooks treat
/// user and system tablets differently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableType {
    User,
    System,
}

/// MvccManager holds the tablet's safe-time bookkeeping. On followers the leader's safe
/// time arrives piggybacked on replicated operations and is pushed here by the driver.
pub struct MvccManager {
    propagated_safe_time: Mutex<Option<HybridTime>>,
}

impl MvccManager {
    fn new() -> Self {
        MvccManager {
            propagated_safe_time: Mutex::new(None),
        }
    }

    /// Safe time only moves forward; a stale propagation is dropped.
    pub fn set_propagated_safe_time_on_follower(&self, safe_time: HybridTime) {
        let mut current = self
            .propagated_safe_time
            .lock()
            .expect("propagated safe time lock poisoned");
        if current.map_or(true, |cur| safe_time > cur) {
            *current = Some(safe_time);
        }
    }

    pub fn propagated_safe_time(&self) -> Option<HybridTime> {
        *self
            .propagated_safe_time
            .lock()
            .expect("propagated safe time lock poisoned")
    }
}

/// TabletContext is the slice of one tablet that the operation pipeline touches: identity,
/// the hybrid clock, the monotonic counter stamped into replicated messages, MVCC safe
/// time, and the in-memory stand-in for the store the apply phase writes into.
pub struct TabletContext {
    tablet_id: String,
    table_type: TableType,
    clock: Arc<HybridClock>,
    monotonic_counter: AtomicI64,
    mvcc: MvccManager,
    schema_version: AtomicU32,
    data: Mutex<BTreeMap<Bytes, Bytes>>,
    last_applied_op_id: Mutex<Option<OpId>>,
    last_snapshot_hybrid_time: Mutex<Option<HybridTime>>,
}

impl TabletContext {
    pub fn new(tablet_id: impl Into<String>, table_type: TableType, clock: Arc<HybridClock>) -> Arc<Self> {
        Arc::new(TabletContext {
            tablet_id: tablet_id.into(),
            table_type,
            clock,
            monotonic_counter: AtomicI64::new(0),
            mvcc: MvccManager::new(),
            schema_version: AtomicU32::new(0),
            data: Mutex::new(BTreeMap::new()),
            last_applied_op_id: Mutex::new(None),
            last_snapshot_hybrid_time: Mutex::new(None),
        })
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn monotonic_counter(&self) -> i64 {
        self.monotonic_counter.load(Ordering::Acquire)
    }

    pub fn set_monotonic_counter(&self, value: i64) {
        self.monotonic_counter.store(value, Ordering::Release);
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::Acquire)
    }

    pub(crate) fn install_schema_version(&self, version: u32) {
        self.schema_version.store(version, Ordering::Release);
    }

    // Apply order across operations is enforced upstream by the order verifier; here the
    // rows land and the high-water mark is recorded.
    pub(crate) fn apply_write(&self, op_id: OpId, rows: Vec<(Bytes, Bytes)>) {
        let mut data = self.data.lock().expect("tablet data lock poisoned");
        for (key, value) in rows {
            data.insert(key, value);
        }
        drop(data);
        *self
            .last_applied_op_id
            .lock()
            .expect("last applied lock poisoned") = Some(op_id);
    }

    pub(crate) fn record_snapshot(&self, hybrid_time: HybridTime) {
        *self
            .last_snapshot_hybrid_time
            .lock()
            .expect("snapshot marker lock poisoned") = Some(hybrid_time);
    }

    pub fn read(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().expect("tablet data lock poisoned").get(key).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.data.lock().expect("tablet data lock poisoned").len()
    }

    pub fn last_applied_op_id(&self) -> Option<OpId> {
        *self
            .last_applied_op_id
            .lock()
            .expect("last applied lock poisoned")
    }

    pub fn last_snapshot_hybrid_time(&self) -> Option<HybridTime> {
        *self
            .last_snapshot_hybrid_time
            .lock()
            .expect("snapshot marker lock poisoned")
    }
}
