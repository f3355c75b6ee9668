// Integration tests for the inbox runtime over the in-memory backend

#[cfg(test)]
mod inbox_integration_tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use postbox::{
        BackoffPolicy, ConfigRegistry, EnqueueResponse, HandlerContext, HandlerError,
        HandlerResult, InboxConfig, InboxManager, MessageEnvelope, MessageHandler,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("postbox=debug")
            .try_init();
    }

    fn fast_backoff(initial_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(initial_ms),
            multiplier: 2.0,
            cap: Duration::from_millis(100),
            jitter: 0.0,
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(
            &self,
            _message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFailingHandler {
        call_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl MessageHandler for AlwaysFailingHandler {
        async fn handle(
            &self,
            _message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            self.call_times.lock().push(Instant::now());
            Err(HandlerError::retryable("simulated failure"))
        }
    }

    struct SlowHandler {
        entered: AtomicU32,
        completed: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(
            &self,
            _message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_default_happy_path() {
        init_tracing();
        let mut registry = ConfigRegistry::new();
        registry
            .register(InboxConfig::new("orders").with_poll_interval(Duration::from_millis(5)))
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        manager.bind_handler("orders", handler.clone());
        manager.start().await.unwrap();

        for i in 0..10 {
            let response = manager
                .enqueue(
                    "orders",
                    MessageEnvelope::with_id(format!("msg-{i}"), b"{}".to_vec()),
                )
                .await
                .unwrap();
            assert_eq!(response, EnqueueResponse::Accepted);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = manager.stats("orders").await.unwrap();
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.dead_lettered, 0);
        assert!(manager.dead_letters("orders", 0, 10).await.unwrap().is_empty());

        manager.stop().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_then_dead_letter() {
        init_tracing();
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("flaky")
                    .with_poll_interval(Duration::from_millis(2))
                    .with_max_attempts(3)
                    .with_backoff(fast_backoff(10)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(AlwaysFailingHandler {
            call_times: Mutex::new(Vec::new()),
        });
        manager.bind_handler("flaky", handler.clone());
        manager.start().await.unwrap();

        manager
            .enqueue("flaky", MessageEnvelope::with_id("doomed", b"x".to_vec()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        // Exactly max_attempts dispatches, spaced by the backoff curve
        let times = handler.call_times.lock().clone();
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_millis(10));
        assert!(times[2] - times[1] >= Duration::from_millis(20));

        let dead = manager.dead_letters("flaky", 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, "doomed");
        assert_eq!(dead[0].final_attempt, 3);
        assert_eq!(dead[0].reason, "simulated failure");

        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dedup_collapses_second_enqueue() {
        init_tracing();
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("dedup")
                    .with_poll_interval(Duration::from_millis(5))
                    .with_dedup_ttl(Duration::from_secs(1)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        manager.bind_handler("dedup", handler.clone());
        manager.start().await.unwrap();

        let first = manager
            .enqueue(
                "dedup",
                MessageEnvelope::with_id("a", b"x".to_vec()).with_dedup_key("k"),
            )
            .await
            .unwrap();
        assert_eq!(first, EnqueueResponse::Accepted);

        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = manager
            .enqueue(
                "dedup",
                MessageEnvelope::with_id("b", b"x".to_vec()).with_dedup_key("k"),
            )
            .await
            .unwrap();
        assert_eq!(second, EnqueueResponse::DedupHit);

        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_dead_letter() {
        init_tracing();
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("replay")
                    .with_poll_interval(Duration::from_millis(2))
                    .with_max_attempts(1)
                    .with_backoff(fast_backoff(5)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let failures = Arc::new(AlwaysFailingHandler {
            call_times: Mutex::new(Vec::new()),
        });
        manager.bind_handler("replay", failures.clone());
        manager.start().await.unwrap();

        manager
            .enqueue("replay", MessageEnvelope::with_id("m", b"x".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.dead_letters("replay", 0, 10).await.unwrap().len(), 1);

        // Replay puts it back on the queue; with max_attempts already
        // consumed it dead-letters again on the next failure
        let response = manager.replay_dead_letter("replay", "m").await.unwrap();
        assert_eq!(response, EnqueueResponse::Accepted);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let dead = manager.dead_letters("replay", 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].final_attempt > 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graceful_shutdown_drains_in_flight() {
        init_tracing();
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("bulk")
                    .with_poll_interval(Duration::from_millis(2))
                    .with_stop_grace(Duration::from_secs(5)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(SlowHandler {
            entered: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        });
        manager.bind_handler("bulk", handler.clone());
        manager.start().await.unwrap();

        for i in 0..100 {
            manager
                .enqueue("bulk", MessageEnvelope::with_id(format!("msg-{i}"), vec![]))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop().await.unwrap();

        // Every dispatch that entered the handler ran to completion
        assert_eq!(
            handler.entered.load(Ordering::SeqCst),
            handler.completed.load(Ordering::SeqCst)
        );
        let after_stop = handler.completed.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        assert!(after_stop < 100);

        // Remaining messages kept their visibility: a restart picks
        // them all up exactly where they were left
        manager.start().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = manager.stats("bulk").await.unwrap();
            if stats.ready == 0 && stats.leased == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "messages stuck after restart");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.stop().await.unwrap();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 100);
    }
}
