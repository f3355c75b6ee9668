//! Processing strategies
//!
//! Four worker-loop variants over the storage contract, selected by the
//! inbox type:
//!
//! - `Default`: one message at a time, optionally fanned out
//! - `Batched`: whole batches with per-message outcomes
//! - `Fifo`: strict per-group ordering, one message per group in flight
//! - `FifoBatched`: contiguous group batches with head-of-line blocking
//!
//! All variants share the same skeleton: while the inbox is running,
//! lease from storage, gate on deduplication, dispatch, record the
//! outcome, sleep on empty cycles, and exit promptly on the stop token.
//! Storage errors classified transient back the cycle off (capped);
//! fatal errors stop this inbox without touching its siblings.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, InboxConfig};
use crate::core::clock::Clock;
use crate::core::envelope::MessageEnvelope;
use crate::dedup::DedupOutcome;
use crate::handler::{HandlerBinding, HandlerContext, HandlerError, HandlerResult};
use crate::lifecycle::StopToken;
use crate::storage::{InboxResources, StorageError, StorageResult};

pub mod batched;
pub mod default;
pub mod fifo;
pub mod fifo_batched;

pub use batched::BatchedStrategy;
pub use default::DefaultStrategy;
pub use fifo::FifoStrategy;
pub use fifo_batched::FifoBatchedStrategy;

/// Everything a strategy loop needs from its inbox
#[derive(Clone)]
pub(crate) struct StrategyEnv {
    pub config: InboxConfig,
    pub resources: Arc<InboxResources>,
    pub clock: Arc<dyn Clock>,
    pub stop: StopToken,
}

impl StrategyEnv {
    /// Context for a dispatch covering the given leased messages
    pub fn handler_context(&self, messages: &[MessageEnvelope]) -> HandlerContext {
        let leases = messages
            .iter()
            .filter_map(|m| Some((m.id.clone(), m.lease.clone()?)))
            .collect();
        HandlerContext::new(
            self.config.name.clone(),
            self.stop.clone(),
            self.clock.clone(),
            self.resources.storage.clone(),
            leases,
        )
    }
}

/// The per-inbox processing strategy, one of four variants
pub enum ProcessingStrategy {
    /// One-at-a-time dispatch
    Default(DefaultStrategy),
    /// Batch dispatch with per-message outcomes
    Batched(BatchedStrategy),
    /// Strict per-group ordering
    Fifo(FifoStrategy),
    /// Contiguous group batches
    FifoBatched(FifoBatchedStrategy),
}

impl ProcessingStrategy {
    /// Materialize the strategy matching the inbox's type, validating
    /// the handler binding against it
    pub fn for_config(
        config: InboxConfig,
        resources: Arc<InboxResources>,
        clock: Arc<dyn Clock>,
        stop: StopToken,
        binding: HandlerBinding,
    ) -> Result<Self, ConfigError> {
        use crate::config::InboxType;

        let env = StrategyEnv {
            config,
            resources,
            clock,
            stop,
        };
        let mismatch = ConfigError::HandlerMismatch {
            inbox: env.config.name.clone(),
            inbox_type: env.config.inbox_type,
        };

        match env.config.inbox_type {
            InboxType::Default => match binding {
                HandlerBinding::Single(handler) => {
                    Ok(ProcessingStrategy::Default(DefaultStrategy::new(env, handler)))
                }
                HandlerBinding::Batch(_) => Err(mismatch),
            },
            InboxType::Batched => Ok(ProcessingStrategy::Batched(BatchedStrategy::new(
                env, binding,
            ))),
            InboxType::Fifo => match binding {
                HandlerBinding::Single(handler) => {
                    Ok(ProcessingStrategy::Fifo(FifoStrategy::new(env, handler)))
                }
                HandlerBinding::Batch(_) => Err(mismatch),
            },
            InboxType::FifoBatched => match binding {
                HandlerBinding::Batch(handler) => Ok(ProcessingStrategy::FifoBatched(
                    FifoBatchedStrategy::new(env, handler),
                )),
                HandlerBinding::Single(_) => Err(mismatch),
            },
        }
    }

    /// Drive the loop until the stop token fires or a fatal storage
    /// error pauses the inbox
    pub async fn run(self) {
        match self {
            ProcessingStrategy::Default(strategy) => strategy.run().await,
            ProcessingStrategy::Batched(strategy) => strategy.run().await,
            ProcessingStrategy::Fifo(strategy) => strategy.run().await,
            ProcessingStrategy::FifoBatched(strategy) => strategy.run().await,
        }
    }
}

/// Capped exponential backoff for storage-error cycles
pub(crate) struct CycleBackoff {
    current: Duration,
}

impl CycleBackoff {
    const INITIAL: Duration = Duration::from_millis(50);
    const CAP: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    /// Current delay, doubling for the next error up to the cap
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

/// Sleep for `interval`, returning early when the stop token fires
pub(crate) async fn idle_sleep(stop: &StopToken, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = stop.stopped() => {}
    }
}

/// Outcome of one poll cycle, decided by the shared error policy
pub(crate) enum CycleDisposition {
    /// Keep polling
    Continue,
    /// Fatal storage error; pause this inbox
    Pause,
}

/// Apply the storage error policy for a failed poll cycle
pub(crate) async fn handle_cycle_error(
    env: &StrategyEnv,
    backoff: &mut CycleBackoff,
    error: StorageError,
) -> CycleDisposition {
    if error.is_transient() {
        let delay = backoff.next();
        tracing::warn!(
            inbox = %env.config.name,
            error = %error,
            backoff_ms = delay.as_millis() as u64,
            "transient storage error; backing off"
        );
        idle_sleep(&env.stop, delay).await;
        CycleDisposition::Continue
    } else {
        tracing::error!(
            inbox = %env.config.name,
            error = %error,
            "fatal storage error; pausing inbox"
        );
        CycleDisposition::Pause
    }
}

/// Deduplication gate, run between lease and dispatch.
///
/// Returns `true` when the message should dispatch. A message whose
/// key is owned by another live message is acknowledged without
/// dispatch; its own mark is refreshed instead.
pub(crate) async fn dedup_gate(env: &StrategyEnv, message: &MessageEnvelope) -> StorageResult<bool> {
    let Some(key) = &message.dedup_key else {
        return Ok(true);
    };
    let outcome = env
        .resources
        .dedup
        .try_mark(key, &message.id, env.config.dedup_ttl)
        .await?;
    if outcome == DedupOutcome::Duplicate {
        tracing::debug!(
            inbox = %env.config.name,
            message_id = %message.id,
            dedup_key = %key,
            "dedup collapse; acknowledging without dispatch"
        );
        if let Some(lease) = &message.lease {
            env.resources.storage.acknowledge(&message.id, lease).await?;
        }
        return Ok(false);
    }
    Ok(true)
}

/// Dispatch one message on its own task so a panicking handler is a
/// failed outcome rather than a crashed loop
pub(crate) async fn dispatch_single(
    env: &StrategyEnv,
    handler: Arc<dyn crate::handler::MessageHandler>,
    message: MessageEnvelope,
) -> HandlerResult {
    let ctx = env.handler_context(std::slice::from_ref(&message));
    let joined = tokio::spawn(async move { handler.handle(&message, &ctx).await }).await;
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(HandlerError::retryable(format!(
            "handler panicked: {join_error}"
        ))),
    }
}

/// Dispatch a batch on its own task; a panic fails every message
pub(crate) async fn dispatch_batch(
    env: &StrategyEnv,
    handler: Arc<dyn crate::handler::BatchMessageHandler>,
    messages: Vec<MessageEnvelope>,
) -> Vec<HandlerResult> {
    let count = messages.len();
    let ctx = env.handler_context(&messages);
    let joined = tokio::spawn(async move { handler.handle_batch(&messages, &ctx).await }).await;
    match joined {
        Ok(outcomes) => outcomes,
        Err(join_error) => {
            let reason = format!("handler panicked: {join_error}");
            (0..count)
                .map(|_| Err(HandlerError::retryable(reason.clone())))
                .collect()
        }
    }
}

/// Record a single-dispatch outcome: ack on success, nack on failure
pub(crate) async fn record_outcome(
    env: &StrategyEnv,
    message: &MessageEnvelope,
    result: HandlerResult,
) -> StorageResult<()> {
    let Some(lease) = &message.lease else {
        return Err(StorageError::LeaseExpired(message.id.clone()));
    };
    match result {
        Ok(()) => {
            env.resources.storage.acknowledge(&message.id, lease).await?;
            tracing::debug!(
                inbox = %env.config.name,
                message_id = %message.id,
                "message succeeded"
            );
        }
        Err(error) => {
            let outcome = env
                .resources
                .storage
                .nack(&message.id, lease, &error.reason, error.retryable)
                .await?;
            tracing::info!(
                inbox = %env.config.name,
                message_id = %message.id,
                reason = %error.reason,
                outcome = ?outcome,
                "message failed"
            );
        }
    }
    Ok(())
}

/// Dedup-gate, dispatch, and record one message
pub(crate) async fn process_single_message(
    env: &StrategyEnv,
    handler: Arc<dyn crate::handler::MessageHandler>,
    message: MessageEnvelope,
) -> StorageResult<()> {
    if !dedup_gate(env, &message).await? {
        return Ok(());
    }
    let result = dispatch_single(env, handler, message.clone()).await;
    record_outcome(env, &message, result).await
}

/// Shared loop for the single-dispatch variants (Default, Fifo).
///
/// Leases one message per cycle and dispatches it on a worker task;
/// the semaphore bounds in-flight dispatches at the configured
/// concurrency (1 for Fifo by default, so groups resolve strictly in
/// order). On exit the loop re-acquires every permit, so in-flight
/// messages always reach ack or nack before the task finishes.
pub(crate) async fn run_single_dispatch_loop(
    env: StrategyEnv,
    handler: Arc<dyn crate::handler::MessageHandler>,
) {
    let concurrency = env.config.effective_concurrency().max(1);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
    let mut backoff = CycleBackoff::new();

    tracing::info!(inbox = %env.config.name, "processing loop started");
    while !env.stop.is_stopped() {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = env.stop.stopped() => break,
        };

        match env
            .resources
            .storage
            .lease_batch(1, env.config.visibility_timeout)
            .await
        {
            Ok(batch) => {
                backoff.reset();
                let Some(message) = batch.into_iter().next() else {
                    drop(permit);
                    let _ = env.resources.dedup.purge(env.clock.utc_now()).await;
                    idle_sleep(&env.stop, env.config.poll_interval).await;
                    continue;
                };

                let task_env = env.clone();
                let task_handler = handler.clone();
                tokio::spawn(async move {
                    let message_id = message.id.clone();
                    if let Err(error) =
                        process_single_message(&task_env, task_handler, message).await
                    {
                        tracing::warn!(
                            inbox = %task_env.config.name,
                            message_id = %message_id,
                            error = %error,
                            "failed to record dispatch outcome"
                        );
                    }
                    drop(permit);
                });
            }
            Err(error) => {
                drop(permit);
                if matches!(
                    handle_cycle_error(&env, &mut backoff, error).await,
                    CycleDisposition::Pause
                ) {
                    break;
                }
            }
        }
    }

    // Drain in-flight dispatches so every lease resolves before exit
    let _ = semaphore.acquire_many(concurrency as u32).await;
    tracing::info!(inbox = %env.config.name, "processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_backoff_doubles_to_cap() {
        let mut backoff = CycleBackoff::new();
        assert_eq!(backoff.next(), Duration::from_millis(50));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));

        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(50));
    }
}
