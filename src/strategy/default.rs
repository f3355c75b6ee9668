//! Default strategy: one message at a time
//!
//! Leases a single message per cycle and dispatches it to the bound
//! handler; ack on success, nack on failure. Independent messages can
//! fan out across worker tasks up to the configured concurrency, which
//! suits workloads with no ordering requirements.

use std::sync::Arc;

use super::{run_single_dispatch_loop, StrategyEnv};
use crate::handler::MessageHandler;

/// One-at-a-time processing strategy
pub struct DefaultStrategy {
    env: StrategyEnv,
    handler: Arc<dyn MessageHandler>,
}

impl DefaultStrategy {
    pub(crate) fn new(env: StrategyEnv, handler: Arc<dyn MessageHandler>) -> Self {
        Self { env, handler }
    }

    /// Drive the loop until stop or a fatal storage error
    pub async fn run(self) {
        run_single_dispatch_loop(self.env, self.handler).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InboxConfig;
    use crate::core::clock::SystemClock;
    use crate::core::envelope::MessageEnvelope;
    use crate::handler::{HandlerContext, HandlerError, HandlerResult};
    use crate::lifecycle::InboxLifecycle;
    use crate::storage::ProviderFactory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(
            &self,
            _message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(HandlerError::retryable("transient failure"));
            }
            Ok(())
        }
    }

    async fn run_inbox(handler: Arc<CountingHandler>, messages: usize) -> crate::storage::StorageStats {
        let config = InboxConfig::new("default-test")
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(crate::core::backoff::BackoffPolicy {
                initial: Duration::from_millis(5),
                multiplier: 2.0,
                cap: Duration::from_millis(50),
                jitter: 0.0,
            });
        let clock = Arc::new(SystemClock);
        let factory = ProviderFactory::new(clock.clone());
        let resources = factory.resources_for(&config).await.unwrap();

        for i in 0..messages {
            resources
                .storage
                .enqueue(MessageEnvelope::with_id(format!("msg-{i}"), vec![]))
                .await
                .unwrap();
        }

        let lifecycle = InboxLifecycle::new();
        lifecycle.start();
        let env = StrategyEnv {
            config,
            resources: resources.clone(),
            clock,
            stop: lifecycle.stop_token(),
        };
        let strategy = DefaultStrategy::new(env, handler);
        let task = tokio::spawn(strategy.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        lifecycle.stop();
        task.await.unwrap();

        resources.storage.stats().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processes_all_messages() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        let stats = run_inbox(handler.clone(), 5).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retries_failed_message() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: true,
        });
        let stats = run_inbox(handler.clone(), 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.dead_lettered, 0);
    }
}
