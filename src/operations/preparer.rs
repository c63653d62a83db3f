use crate::consensus::Consensus;
use crate::error::OperationError;
use crate::operations::driver::{OperationDriver, PrepareOutcome};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How many operations one worker pass will prepare and hand to consensus as one batch.
const MAX_BATCH_SIZE: usize = 16;

/// Preparer is the batching submission queue between operation drivers and consensus.
/// `submit()` enqueues a driver; a background worker drains the queue in batches, runs each
/// driver's prepare-and-start step, and submits the rounds of drivers that newly entered
/// replication to consensus as one batch.
pub struct Preparer {
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<OperationDriver>>>>,
}

impl Preparer {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(consensus: Arc<dyn Consensus>, logger: slog::Logger) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = PreparerTask {
            receiver,
            consensus,
            logger,
        };
        tokio::task::spawn(task.run());
        Preparer {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn submit(&self, driver: Arc<OperationDriver>) -> Result<(), OperationError> {
        let guard = self.sender.lock().expect("preparer sender lock poisoned");
        match guard.as_ref() {
            Some(sender) => sender
                .send(driver)
                .map_err(|_| OperationError::ServiceUnavailable("operation preparer is shut down".to_string())),
            None => Err(OperationError::ServiceUnavailable(
                "operation preparer is shut down".to_string(),
            )),
        }
    }

    /// `shutdown()` closes the queue. The worker drains what was already submitted, then
    /// exits; further submissions fail.
    pub fn shutdown(&self) {
        self.sender.lock().expect("preparer sender lock poisoned").take();
    }
}

struct PreparerTask {
    receiver: mpsc::UnboundedReceiver<Arc<OperationDriver>>,
    consensus: Arc<dyn Consensus>,
    logger: slog::Logger,
}

impl PreparerTask {
    async fn run(mut self) {
        while let Some(first) = self.receiver.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH_SIZE {
                match self.receiver.try_recv() {
                    Ok(driver) => batch.push(driver),
                    Err(_) => break,
                }
            }
            self.process_batch(batch);
        }
        slog::debug!(self.logger, "preparer worker exiting");
    }

    fn process_batch(&self, batch: Vec<Arc<OperationDriver>>) {
        let mut rounds = Vec::with_capacity(batch.len());
        for driver in &batch {
            if let PrepareOutcome::ReadyToReplicate(round) = driver.prepare_and_start_task() {
                rounds.push(round);
            }
        }
        if rounds.is_empty() {
            return;
        }

        slog::trace!(self.logger, "replicating batch"; "rounds" => rounds.len());
        if let Err(error) = self.consensus.replicate_batch(&rounds) {
            // The batch never reached consensus, so each round still owes its completion.
            slog::warn!(self.logger, "consensus rejected a replicate batch"; "error" => %error);
            for round in rounds {
                round.notify_replicated(Err(error.clone()), None);
            }
        }
    }
}
