//! Batched strategy: whole batches, per-message outcomes
//!
//! Leases up to `batch_size` messages per cycle. With a batch handler
//! bound, the whole batch goes out in one call and the handler reports
//! an outcome per message; with a single-message handler bound, the
//! batch fans out across worker tasks bounded by the configured
//! concurrency. Either way outcomes apply independently: one failing
//! message never nacks its siblings.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{
    dedup_gate, dispatch_batch, handle_cycle_error, idle_sleep, process_single_message,
    record_outcome, CycleBackoff, CycleDisposition, StrategyEnv,
};
use crate::core::envelope::MessageEnvelope;
use crate::handler::{HandlerBinding, HandlerError};

/// Batch processing strategy
pub struct BatchedStrategy {
    env: StrategyEnv,
    binding: HandlerBinding,
}

impl BatchedStrategy {
    pub(crate) fn new(env: StrategyEnv, binding: HandlerBinding) -> Self {
        Self { env, binding }
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
                    self.process_batch(batch).await;
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

    /// Gate, dispatch, and record one leased batch; completes every
    /// ack/nack before returning so shutdown never abandons a lease
    async fn process_batch(&self, batch: Vec<MessageEnvelope>) {
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

        match &self.binding {
            HandlerBinding::Batch(handler) => {
                let outcomes =
                    dispatch_batch(&self.env, handler.clone(), dispatched.clone()).await;
                for (index, message) in dispatched.iter().enumerate() {
                    let result = match outcomes.get(index) {
                        Some(result) => result.clone(),
                        None => Err(HandlerError::retryable("handler returned no outcome")),
                    };
                    if let Err(error) = record_outcome(&self.env, message, result).await {
                        tracing::warn!(
                            inbox = %self.env.config.name,
                            message_id = %message.id,
                            error = %error,
                            "failed to record dispatch outcome"
                        );
                    }
                }
            }
            HandlerBinding::Single(handler) => {
                let concurrency = self.env.config.effective_concurrency().max(1);
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let mut tasks = Vec::with_capacity(dispatched.len());

                for message in dispatched {
                    let env = self.env.clone();
                    let handler = handler.clone();
                    let semaphore = Arc::clone(&semaphore);
                    tasks.push(tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return;
                        };
                        let message_id = message.id.clone();
                        if let Err(error) = process_single_message(&env, handler, message).await {
                            tracing::warn!(
                                inbox = %env.config.name,
                                message_id = %message_id,
                                error = %error,
                                "failed to record dispatch outcome"
                            );
                        }
                    }));
                }
                join_all(tasks).await;
            }
        }
    }
}
