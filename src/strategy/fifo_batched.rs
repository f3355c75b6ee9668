//! FIFO-batched strategy: contiguous group batches
//!
//! Leases one maximal run of consecutive sequence numbers from a single
//! group and dispatches it as a batch. Outcomes apply in sequence
//! order: successes acknowledge wherever they sit, the first failure
//! nacks with backoff (or dead-letters when non-retryable or
//! exhausted), and every later failed message is released with zero
//! delay so it stays visible behind the blocking retry. The group's
//! head rule then keeps the whole group parked until the failure
//! resolves.

use std::sync::Arc;
use std::time::Duration;

use super::{
    dedup_gate, dispatch_batch, handle_cycle_error, idle_sleep, record_outcome, CycleBackoff,
    CycleDisposition, StrategyEnv,
};
use crate::core::envelope::MessageEnvelope;
use crate::handler::{BatchMessageHandler, HandlerError, HandlerResult};

/// Ordered batch processing strategy
pub struct FifoBatchedStrategy {
    env: StrategyEnv,
    handler: Arc<dyn BatchMessageHandler>,
}

impl FifoBatchedStrategy {
    pub(crate) fn new(env: StrategyEnv, handler: Arc<dyn BatchMessageHandler>) -> Self {
        Self { env, handler }
    }

    /// Drive the loop until stop or a fatal storage error
    pub async fn run(self) {
        let mut backoff = CycleBackoff::new();

        tracing::info!(inbox = %self.env.config.name, "processing loop started");
        while !self.env.stop.is_stopped() {
            match self
                .env
                .resources
                .storage
                .lease_batch(self.env.config.batch_size, self.env.config.visibility_timeout)
                .await
            {
                Ok(batch) if batch.is_empty() => {
                    let _ = self.env.resources.dedup.purge(self.env.clock.utc_now()).await;
                    idle_sleep(&self.env.stop, self.env.config.poll_interval).await;
                }
                Ok(batch) => {
                    backoff.reset();
                    self.process_run(batch).await;
                }
                Err(error) => {
                    if matches!(
                        handle_cycle_error(&self.env, &mut backoff, error).await,
                        CycleDisposition::Pause
                    ) {
                        break;
                    }
                }
            }
        }
        tracing::info!(inbox = %self.env.config.name, "processing loop stopped");
    }

    /// Gate, dispatch, and record one leased group run
    async fn process_run(&self, batch: Vec<MessageEnvelope>) {
        // Dedup-collapsed messages acknowledge immediately, which
        // resolves their slot in the sequence; the rest dispatch
        let mut dispatched = Vec::with_capacity(batch.len());
        for message in batch {
            match dedup_gate(&self.env, &message).await {
                Ok(true) => dispatched.push(message),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        inbox = %self.env.config.name,
                        message_id = %message.id,
                        error = %error,
                        "dedup gate failed; leaving message to lease reclaim"
                    );
                }
            }
        }
        if dispatched.is_empty() {
            return;
        }

        let outcomes = dispatch_batch(&self.env, self.handler.clone(), dispatched.clone()).await;
        self.record_ordered(&dispatched, outcomes).await;
    }

    /// Apply outcomes in sequence order with head-of-line semantics
    async fn record_ordered(&self, dispatched: &[MessageEnvelope], outcomes: Vec<HandlerResult>) {
        let mut failure_seen = false;
        for (index, message) in dispatched.iter().enumerate() {
            let outcome = match outcomes.get(index) {
                Some(result) => result.clone(),
                None => Err(HandlerError::retryable("handler returned no outcome")),
            };

            let recorded = match outcome {
                Ok(()) => record_outcome(&self.env, message, Ok(())).await,
                Err(error) if !failure_seen => {
                    failure_seen = true;
                    record_outcome(&self.env, message, Err(error)).await
                }
                Err(_) => {
                    // Later failures park behind the blocking retry
                    // without consuming an attempt
                    match message.lease.as_deref() {
                        Some(lease) => {
                            self.env
                                .resources
                                .storage
                                .release(&message.id, lease, Duration::ZERO)
                                .await
                        }
                        None => Ok(()),
                    }
                }
            };

            if let Err(error) = recorded {
                tracing::warn!(
                    inbox = %self.env.config.name,
                    message_id = %message.id,
                    error = %error,
                    "failed to record dispatch outcome"
                );
            }
        }
    }
}
