use crate::clock::HybridTime;
use crate::consensus::{Consensus, ConsensusAppendCallback, ConsensusRound, OpId, ReplicatedCallback, Term};
use crate::error::OperationError;
use crate::operations::operation::{Operation, OperationState, OperationType};
use crate::operations::order_verifier::OperationOrderVerifier;
use crate::operations::preparer::Preparer;
use crate::operations::tracker::OperationTracker;
use crate::tablet::{TableType, TabletContext};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Delays `execute_async()` of user-table write operations by this many milliseconds.
/// Test-only knob, mirroring a runtime flag; leave at 0 outside of tests.
pub static TEST_DELAY_EXECUTE_ASYNC_MS: AtomicU64 = AtomicU64::new(0);

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// DriverId keys one driver in the operation tracker's registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DriverId(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ReplicationState {
    NotReplicating,
    Replicating,
    ReplicationFailed,
    Replicated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PrepareState {
    NotPrepared,
    Prepared,
}

fn state_string(repl_state: ReplicationState, prep_state: PrepareState) -> String {
    let repl = match repl_state {
        ReplicationState::NotReplicating => "NR",
        ReplicationState::Replicating => "R",
        ReplicationState::ReplicationFailed => "RF",
        ReplicationState::Replicated => "RD",
    };
    let prep = match prep_state {
        PrepareState::Prepared => "P",
        PrepareState::NotPrepared => "NP",
    };
    format!("{}-{}", repl, prep)
}

struct StateInner {
    replication_state: ReplicationState,
    prepare_state: PrepareState,
    /// Sticky first-error record. Once set it is never overwritten.
    operation_status: Option<OperationError>,
}

/// What the preparer should do with a driver after `prepare_and_start_task()`.
pub(crate) enum PrepareOutcome {
    /// The driver newly entered replication; hand its round to consensus.
    ReadyToReplicate(Arc<ConsensusRound>),
    /// Nothing to trigger: replication was already running, apply already fired, or the
    /// operation failed.
    NothingToTrigger,
}

/// Returned by `init()` when the tracker refuses admission. The operation travels back in
/// the error so the caller can retry or respond without leaking it.
#[derive(Debug)]
pub struct RejectedOperation {
    pub operation: Box<dyn Operation>,
    pub cause: OperationError,
}

/// OperationDriver sequences one replicated operation through prepare, start, replicate and
/// apply. It is the meeting point of two asynchronous completions, the preparer finishing
/// `prepare()` and consensus finishing replication, and guarantees that exactly one of
/// them triggers apply, whichever lands second.
///
/// A driver is owned by the tracker from `init()` until the operation reaches a terminal
/// outcome; consensus reaches it only through weak references held by the round.
pub struct OperationDriver {
    driver_id: DriverId,
    logger: slog::Logger,
    tablet: Arc<TabletContext>,
    tracker: Arc<OperationTracker>,
    // None in driver-only unit tests; everything that needs consensus degrades to
    // "(unknown)" diagnostics or no-ops.
    consensus: Option<Arc<dyn Consensus>>,
    preparer: Arc<Preparer>,
    order_verifier: Arc<OperationOrderVerifier>,
    start_time: Instant,
    table_type: TableType,

    /// Owned operation payload. Moved out on init failure and consumed by the abort path,
    /// which is what makes repeated aborts idempotent.
    operation: Mutex<Option<Box<dyn Operation>>>,
    /// Handle to the operation's shared state, snapshotted at init so diagnostics and the
    /// replication callback never contend with the operation slot.
    op_state: Mutex<Option<Arc<OperationState>>>,
    /// Primary lock. Never held across calls into the operation or collaborators, except
    /// `OperationOrderVerifier::check_apply` which is lock-compatible.
    state: Mutex<StateInner>,
    /// Split from `state` so `op_id()` readers don't contend with state transitions.
    op_id_copy: Mutex<Option<OpId>>,
    prepare_physical_micros: AtomicU64,
    propagated_safe_time: Mutex<Option<HybridTime>>,
}

impl OperationDriver {
    pub fn new(
        tablet: Arc<TabletContext>,
        tracker: Arc<OperationTracker>,
        consensus: Option<Arc<dyn Consensus>>,
        preparer: Arc<Preparer>,
        order_verifier: Arc<OperationOrderVerifier>,
        logger: slog::Logger,
    ) -> Arc<Self> {
        let table_type = tablet.table_type();
        Arc::new(OperationDriver {
            driver_id: DriverId(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed)),
            logger,
            tablet,
            tracker,
            consensus,
            preparer,
            order_verifier,
            start_time: Instant::now(),
            table_type,
            operation: Mutex::new(None),
            op_state: Mutex::new(None),
            state: Mutex::new(StateInner {
                replication_state: ReplicationState::NotReplicating,
                prepare_state: PrepareState::NotPrepared,
                operation_status: None,
            }),
            op_id_copy: Mutex::new(None),
            prepare_physical_micros: AtomicU64::new(0),
            propagated_safe_time: Mutex::new(None),
        })
    }

    /// `init()` admits the driver to the tracker and arms replication.
    ///
    /// `term == None` is the follower / already-assigned path: the operation arrived
    /// through replication and carries its op id; replication is externally driven and
    /// will complete by callback. With a term, the driver is originating the operation:
    /// it allocates a consensus round for the operation's replicate message, binds it to
    /// `term`, and registers itself as the round's append callback.
    pub fn init(self: &Arc<Self>, operation: Box<dyn Operation>, term: Option<Term>) -> Result<(), RejectedOperation> {
        let op_state = operation.state().clone();
        *self.op_state.lock().expect("driver op state lock poisoned") = Some(op_state.clone());

        match term {
            None => {
                let op_id = op_state.op_id();
                debug_assert!(op_id.is_some(), "follower operation must carry an op id");
                *self.op_id_copy.lock().expect("driver op id lock poisoned") = op_id;
                self.state.lock().expect("driver state lock poisoned").replication_state =
                    ReplicationState::Replicating;
            }
            Some(term) => {
                if let Some(consensus) = &self.consensus {
                    // The round must not keep the driver alive: both of its callbacks go
                    // through weak references and become no-ops once the tracker lets go.
                    let weak = Arc::downgrade(self);
                    let replicated_cb: ReplicatedCallback = Box::new(move |result, leader_term| {
                        if let Some(driver) = weak.upgrade() {
                            driver.replication_finished(result, leader_term);
                        }
                    });
                    let round = consensus.new_round(operation.new_replicate_msg(), replicated_cb);
                    round.bind_term(term);
                    let driver_clone: Arc<OperationDriver> = Arc::clone(self);
                    let append_cb: Arc<dyn ConsensusAppendCallback> = driver_clone;
                    round.set_append_callback(Arc::downgrade(&append_cb));
                    op_state.set_consensus_round(round);
                }
            }
        }

        *self.operation.lock().expect("driver operation lock poisoned") = Some(operation);

        if let Err(cause) = self.tracker.add(self) {
            let operation = self
                .operation
                .lock()
                .expect("driver operation lock poisoned")
                .take()
                .expect("operation was just installed");
            return Err(RejectedOperation { operation, cause });
        }
        Ok(())
    }

    pub(crate) fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    pub fn op_id(&self) -> Option<OpId> {
        *self.op_id_copy.lock().expect("driver op id lock poisoned")
    }

    pub fn op_type(&self) -> Option<OperationType> {
        self.operation
            .lock()
            .expect("driver operation lock poisoned")
            .as_ref()
            .map(|op| op.op_type())
    }

    /// The sticky first-error status. An operation that was aborted mid-replication still
    /// applies; this is where the recorded abort remains observable.
    pub fn operation_status(&self) -> Option<OperationError> {
        self.state
            .lock()
            .expect("driver state lock poisoned")
            .operation_status
            .clone()
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    /// Follower-side MVCC propagation value, pushed to the tablet when the operation
    /// starts.
    pub fn set_propagated_safe_time(&self, safe_time: HybridTime) {
        *self
            .propagated_safe_time
            .lock()
            .expect("driver safe time lock poisoned") = Some(safe_time);
    }

    pub(crate) fn payload_bytes(&self) -> usize {
        self.operation
            .lock()
            .expect("driver operation lock poisoned")
            .as_ref()
            .map(|op| op.payload_bytes())
            .unwrap_or(0)
    }

    fn operation_state(&self) -> Option<Arc<OperationState>> {
        self.op_state.lock().expect("driver op state lock poisoned").clone()
    }

    /// `execute_async()` hands the driver to the preparer. A submission failure falls
    /// through to the failure path rather than surfacing to the caller.
    pub fn execute_async(self: &Arc<Self>) {
        slog::trace!(self.logger, "{}execute_async()", self.log_prefix());

        let delay_ms = TEST_DELAY_EXECUTE_ASYNC_MS.load(Ordering::Relaxed);
        if delay_ms != 0 && self.op_type() == Some(OperationType::Write) && self.table_type == TableType::User {
            slog::info!(self.logger, "{}debug sleep for {} ms", self.log_prefix(), delay_ms);
            std::thread::sleep(std::time::Duration::from_millis(delay_ms));
        }

        if let Err(error) = self.preparer.submit(Arc::clone(self)) {
            self.handle_failure(Some(error));
        }
    }

    /// `start_operation()` invokes the operation's start hook and pushes any stashed safe
    /// time to MVCC. Returns false if the operation was reclaimed by a concurrent abort,
    /// in which case the driver releases itself.
    fn start_operation(&self) -> bool {
        let present = {
            let guard = self.operation.lock().expect("driver operation lock poisoned");
            if let Some(operation) = guard.as_ref() {
                operation.start();
            }
            guard.is_some()
        };
        if let Some(safe_time) = *self
            .propagated_safe_time
            .lock()
            .expect("driver safe time lock poisoned")
        {
            self.tablet.mvcc().set_propagated_safe_time_on_follower(safe_time);
        }
        if !present {
            self.tracker.release(self);
        }
        present
    }

    /// Runs on the preparer's worker. Failures route into the failure path here, so the
    /// worker never has to understand them.
    pub(crate) fn prepare_and_start_task(self: &Arc<Self>) -> PrepareOutcome {
        match self.prepare_and_start() {
            Ok(outcome) => outcome,
            Err(error) => {
                self.handle_failure(Some(error));
                PrepareOutcome::NothingToTrigger
            }
        }
    }

    fn prepare_and_start(self: &Arc<Self>) -> Result<PrepareOutcome, OperationError> {
        slog::trace!(self.logger, "{}prepare_and_start()", self.log_prefix());
        self.prepare_physical_micros
            .store(self.tablet.clock().physical_micros(), Ordering::Release);

        {
            let guard = self.operation.lock().expect("driver operation lock poisoned");
            if let Some(operation) = guard.as_ref() {
                operation.prepare()?;
            }
        }

        // Only hold the lock long enough to snapshot the replication state. This snapshot
        // plus the re-read below is what makes exactly one of the prepare/replicate
        // completions trigger apply.
        let repl_state_copy = {
            let guard = self.state.lock().expect("driver state lock poisoned");
            assert_eq!(
                guard.prepare_state,
                PrepareState::NotPrepared,
                "prepare must run once per operation"
            );
            guard.replication_state
        };

        if repl_state_copy != ReplicationState::NotReplicating {
            // Replication is already running, so the operation has its hybrid time; call
            // start() now, before PREPARED is published, so apply can assume it happened.
            if !self.start_operation() {
                return Ok(PrepareOutcome::NothingToTrigger);
            }
        }

        let repl_state_copy = {
            let mut guard = self.state.lock().expect("driver state lock poisoned");
            assert_eq!(
                guard.prepare_state,
                PrepareState::NotPrepared,
                "prepare must run once per operation"
            );
            // From here the replication-finished callback is allowed to fire apply.
            guard.prepare_state = PrepareState::Prepared;
            // Re-read: replication may have finished while start() ran above. That
            // completion saw NOT_PREPARED and did not fire apply, so it is on us now.
            guard.replication_state
        };

        match repl_state_copy {
            ReplicationState::NotReplicating => {
                self.state.lock().expect("driver state lock poisoned").replication_state =
                    ReplicationState::Replicating;
                match self.operation_state().and_then(|state| state.consensus_round()) {
                    Some(round) => Ok(PrepareOutcome::ReadyToReplicate(round)),
                    // No consensus wired up (unit tests); nothing to submit.
                    None => Ok(PrepareOutcome::NothingToTrigger),
                }
            }
            ReplicationState::Replicating => Ok(PrepareOutcome::NothingToTrigger),
            ReplicationState::ReplicationFailed | ReplicationState::Replicated => {
                // Apply routes the REPLICATION_FAILED case into the failure path itself.
                self.apply_operation(None);
                Ok(PrepareOutcome::NothingToTrigger)
            }
        }
    }

    /// Consensus callback: the round finished replicating with `result` under
    /// `leader_term`. Publishes the assigned op id, transitions the replication state,
    /// and fires apply if prepare already completed.
    pub fn replication_finished(self: &Arc<Self>, result: Result<(), OperationError>, leader_term: Option<Term>) {
        let op_state = self.operation_state();
        let round_id = op_state.as_ref().and_then(|state| state.consensus_round()).and_then(|round| round.id());

        let op_id_local = {
            let mut op_id = self.op_id_copy.lock().expect("driver op id lock poisoned");
            if let Some(id) = round_id {
                *op_id = Some(id);
            }
            if result.is_ok() {
                assert!(op_id.is_some(), "replication succeeded without an op id");
            }
            *op_id
        };

        let prepare_state_copy = {
            let mut guard = self.state.lock().expect("driver state lock poisoned");
            // Publish the id into the operation's state before REPLICATED becomes
            // visible, so apply always sees an initialized op id.
            if let (Some(state), Some(id)) = (&op_state, op_id_local) {
                state.set_op_id(id);
            }
            assert_eq!(
                guard.replication_state,
                ReplicationState::Replicating,
                "replication finished while not replicating"
            );
            match &result {
                Ok(()) => guard.replication_state = ReplicationState::Replicated,
                Err(error) => {
                    guard.replication_state = ReplicationState::ReplicationFailed;
                    if guard.operation_status.is_none() {
                        guard.operation_status = Some(error.clone());
                    }
                }
            }
            guard.prepare_state
        };

        slog::trace!(self.logger, "{}replication_finished()", self.log_prefix());

        if prepare_state_copy == PrepareState::Prepared {
            self.apply_operation(leader_term);
        }
    }

    /// Local replication failure reported by consensus outside the finished callback.
    /// No-op if the state already reflects a failed replication.
    pub fn replication_failed(&self, replication_status: OperationError) {
        {
            let mut guard = self.state.lock().expect("driver state lock poisoned");
            if guard.replication_state == ReplicationState::ReplicationFailed {
                return;
            }
            assert_eq!(
                guard.replication_state,
                ReplicationState::Replicating,
                "replication can only fail while replicating"
            );
            if guard.operation_status.is_none() {
                guard.operation_status = Some(replication_status);
            }
            guard.replication_state = ReplicationState::ReplicationFailed;
        }
        self.handle_failure(None);
    }

    /// `abort()` requests cancellation. Only an operation that has not started replicating
    /// can actually be cancelled; in every other state the operation runs to completion
    /// and the sticky status merely records that an abort was asked for.
    pub fn abort(&self, status: OperationError) {
        let repl_state_copy = {
            let mut guard = self.state.lock().expect("driver state lock poisoned");
            if guard.operation_status.is_none() {
                guard.operation_status = Some(status);
            }
            guard.replication_state
        };

        if repl_state_copy == ReplicationState::NotReplicating {
            self.handle_failure(None);
        }
    }

    /// `handle_failure()` merges `status` into the sticky first-error record and aborts
    /// the operation if it never reached replication. A failure request for an operation
    /// consensus has already accepted cannot be honored (the entry is in the log and will
    /// be applied), so that is fatal.
    fn handle_failure(&self, status: Option<OperationError>) {
        let (status, repl_state_copy) = {
            let mut guard = self.state.lock().expect("driver state lock poisoned");
            let status = match status {
                Some(new_status) => {
                    if let Some(existing) = &guard.operation_status {
                        panic!(
                            "operation failed twice: already recorded '{}', new status '{}'",
                            existing, new_status
                        );
                    }
                    guard.operation_status = Some(new_status.clone());
                    new_status
                }
                None => guard
                    .operation_status
                    .clone()
                    .expect("failure path entered with no recorded status"),
            };
            (status, guard.replication_state)
        };

        slog::debug!(self.logger, "{}failed operation: {}", self.log_prefix(), status);

        match repl_state_copy {
            ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                let operation = self.operation.lock().expect("driver operation lock poisoned").take();
                if let Some(operation) = operation {
                    operation.aborted(&status);
                    self.tracker.release(self);
                }
            }
            ReplicationState::Replicating | ReplicationState::Replicated => {
                panic!(
                    "cannot cancel an operation that has already been replicated: {} operation: {}",
                    status, self
                );
            }
        }
    }

    /// `apply_operation()` runs once both completions have landed. On the success path it
    /// checks apply ordering and hands off to the apply task; a failed replication is
    /// dispatched to the failure path and the operation is never applied.
    fn apply_operation(self: &Arc<Self>, leader_term: Option<Term>) {
        {
            let guard = self.state.lock().expect("driver state lock poisoned");
            assert_eq!(
                guard.prepare_state,
                PrepareState::Prepared,
                "apply before prepare completed"
            );
            match guard.replication_state {
                ReplicationState::Replicated => {
                    let op_id = (*self.op_id_copy.lock().expect("driver op id lock poisoned"))
                        .expect("applying without an op id");
                    self.order_verifier.check_apply(
                        op_id.index,
                        self.prepare_physical_micros.load(Ordering::Acquire),
                    );
                }
                ReplicationState::ReplicationFailed => {
                    debug_assert!(guard.operation_status.is_some());
                    drop(guard);
                    self.handle_failure(None);
                    return;
                }
                other => panic!("apply entered in replication state {:?}", other),
            }
        }

        self.apply_task(leader_term);
    }

    /// `apply_task()` drives the operation to its final commit and drops the tracker's
    /// reference.
    fn apply_task(self: &Arc<Self>, leader_term: Option<Term>) {
        // Applying may synchronously finish the operation and release the tracker's
        // reference; this borrow of the caller's Arc keeps the driver alive through the
        // rest of the call.
        let _keep_alive = Arc::clone(self);

        {
            let guard = self.state.lock().expect("driver state lock poisoned");
            debug_assert_eq!(guard.replication_state, ReplicationState::Replicated);
            debug_assert_eq!(guard.prepare_state, PrepareState::Prepared);
        }

        let result = {
            let guard = self.operation.lock().expect("driver operation lock poisoned");
            let operation = guard.as_ref().expect("applying a reclaimed operation");
            operation.replicated(leader_term)
        };
        if let Err(error) = result {
            panic!("operation failed to apply: {} operation: {}", error, self);
        }

        slog::debug!(
            self.logger,
            "{}applied in {:?}",
            self.log_prefix(),
            self.start_time.elapsed()
        );
        self.tracker.release(self);
    }

    /// `log_prefix()` identifies the tablet (T), the peer (P), the driver state (S) and
    /// the operation's hybrid time (Ts) for every log line about this driver.
    pub fn log_prefix(&self) -> String {
        let (repl_state, prep_state) = {
            let guard = self.state.lock().expect("driver state lock poisoned");
            (guard.replication_state, guard.prepare_state)
        };
        let ts = self
            .operation_state()
            .and_then(|state| state.hybrid_time())
            .map(|ht| ht.to_string())
            .unwrap_or_else(|| "No hybrid_time".to_string());
        let (tablet_id, peer_uuid) = match &self.consensus {
            Some(consensus) => (consensus.tablet_id().to_string(), consensus.peer_uuid().to_string()),
            None => ("(unknown)".to_string(), "(unknown)".to_string()),
        };
        format!(
            "T {} P {} S {} Ts {}: ",
            tablet_id,
            peer_uuid,
            state_string(repl_state, prep_state),
            ts
        )
    }
}

impl ConsensusAppendCallback for OperationDriver {
    /// Consensus is about to append this round's message to the log: start the operation
    /// and stamp the clock assignment into the bytes that will become durable.
    fn handle_consensus_append(&self) {
        if !self.start_operation() {
            return;
        }
        let state = self.operation_state().expect("append callback before init");
        let round = state.consensus_round().expect("append callback without a consensus round");
        let hybrid_time = state.hybrid_time().expect("start() must assign a hybrid time");
        round.with_replicate_msg_mut(|msg| {
            assert!(
                msg.hybrid_time.is_none(),
                "replicate message already carries a hybrid time"
            );
            msg.hybrid_time = Some(hybrid_time);
            msg.monotonic_counter = self.tablet.monotonic_counter();
        });
    }
}

impl fmt::Display for OperationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (repl_state, prep_state) = {
            let guard = self.state.lock().expect("driver state lock poisoned");
            (guard.replication_state, guard.prepare_state)
        };
        let state_str = state_string(repl_state, prep_state);
        let guard = self.operation.lock().expect("driver operation lock poisoned");
        match guard.as_ref() {
            Some(operation) => write!(f, "{} {:?}", state_str, operation),
            None => write!(f, "{} [unknown operation]", state_str),
        }
    }
}
