use chrono::Utc;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Low bits of a hybrid time reserved for the logical component.
const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// HybridTime is a logical-plus-physical timestamp: wall-clock microseconds in the high bits,
/// a logical counter in the low bits so that times assigned within one microsecond still
/// order totally.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime(u64);

impl HybridTime {
    pub fn from_micros(physical_micros: u64) -> Self {
        HybridTime(physical_micros << LOGICAL_BITS)
    }

    pub fn from_u64(raw: u64) -> Self {
        HybridTime(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HT{{ p: {} l: {} }}", self.physical_micros(), self.logical())
    }
}

/// PhysicalClock is the wall-clock source under a hybrid clock. Pluggable so tests can run
/// on a hand-cranked clock.
pub trait PhysicalClock: Send + Sync {
    fn now_micros(&self) -> u64;
}

#[derive(Copy, Clone)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_micros(&self) -> u64 {
        Utc::now().timestamp_micros() as u64
    }
}

/// ManualClock only moves when told to. Test use only.
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        ManualClock {
            micros: AtomicU64::new(start_micros),
        }
    }

    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }
}

impl PhysicalClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Acquire)
    }
}

/// HybridClock issues hybrid times for one tablet server process.
///
/// `now()` is strictly monotonic across threads: if the physical clock stalls (or steps
/// backwards), the logical component keeps times moving forward. `observe()` folds in hybrid
/// times received from remote peers so that times issued here never trail what this process
/// has already seen on the wire.
pub struct HybridClock {
    physical: Arc<dyn PhysicalClock>,
    last: AtomicU64,
}

impl HybridClock {
    pub fn new(physical: Arc<dyn PhysicalClock>) -> Self {
        HybridClock {
            physical,
            last: AtomicU64::new(0),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> HybridTime {
        loop {
            let last = self.last.load(Ordering::Acquire);
            let physical = HybridTime::from_micros(self.physical.now_micros()).as_u64();
            let next = cmp::max(physical, last + 1);
            if self
                .last
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return HybridTime::from_u64(next);
            }
        }
    }

    /// `observe()` ratchets the clock forward to a remotely assigned hybrid time.
    pub fn observe(&self, remote: HybridTime) {
        self.last.fetch_max(remote.as_u64(), Ordering::AcqRel);
    }

    /// Raw physical microseconds, for callers that want a plain wall-clock reading.
    pub fn physical_micros(&self) -> u64 {
        self.physical.now_micros()
    }
}
