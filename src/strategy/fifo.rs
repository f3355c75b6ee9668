//! FIFO strategy: strict per-group ordering
//!
//! Leases one message per cycle through the provider's FIFO contract:
//! only a group's head is ever leased, and the group lock keeps a
//! single message of each group in flight. A failing head blocks its
//! group until it is acknowledged or dead-lettered; other groups keep
//! progressing independently.

use std::sync::Arc;

use super::{run_single_dispatch_loop, StrategyEnv};
use crate::handler::MessageHandler;

/// Strictly ordered processing strategy
pub struct FifoStrategy {
    env: StrategyEnv,
    handler: Arc<dyn MessageHandler>,
}

impl FifoStrategy {
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
    use crate::config::{InboxConfig, InboxType};
    use crate::core::clock::SystemClock;
    use crate::core::envelope::MessageEnvelope;
    use crate::handler::{HandlerContext, HandlerResult};
    use crate::lifecycle::InboxLifecycle;
    use crate::storage::ProviderFactory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingHandler {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(
            &self,
            message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            self.seen.lock().push(message.group_seq.unwrap_or(-1));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_group_dispatches_in_sequence_order() {
        let config = InboxConfig::new("fifo-test")
            .with_type(InboxType::Fifo)
            .with_poll_interval(Duration::from_millis(5));
        let clock = Arc::new(SystemClock);
        let factory = ProviderFactory::new(clock.clone());
        let resources = factory.resources_for(&config).await.unwrap();

        // Enqueue out of id order; sequence order must still win
        for seq in [2i64, 0, 1, 4, 3] {
            resources
                .storage
                .enqueue(MessageEnvelope::with_id(format!("m-{seq}"), vec![]).with_group("g", seq))
                .await
                .unwrap();
        }

        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let lifecycle = InboxLifecycle::new();
        lifecycle.start();
        let env = StrategyEnv {
            config,
            resources: resources.clone(),
            clock,
            stop: lifecycle.stop_token(),
        };
        let task = tokio::spawn(FifoStrategy::new(env, handler.clone()).run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        lifecycle.stop();
        task.await.unwrap();

        assert_eq!(*handler.seen.lock(), vec![0, 1, 2, 3, 4]);
    }
}
