// Integration tests for the FIFO processing strategies

#[cfg(test)]
mod fifo_integration_tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use postbox::{
        BackoffPolicy, BatchMessageHandler, ConfigRegistry, HandlerContext, HandlerError,
        HandlerResult, InboxConfig, InboxManager, InboxType, MessageEnvelope, MessageHandler,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fast_backoff(initial_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(initial_ms),
            multiplier: 2.0,
            cap: Duration::from_millis(100),
            jitter: 0.0,
        }
    }

    fn fifo_message(group: &str, seq: i64) -> MessageEnvelope {
        MessageEnvelope::with_id(format!("{group}-{seq}"), format!("seq {seq}").into_bytes())
            .with_group(group, seq)
    }

    async fn wait_until(manager: &InboxManager, inbox: &str, drained: impl Fn(u64, u64) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = manager.stats(inbox).await.unwrap();
            if drained(stats.ready + stats.leased, stats.dead_lettered) {
                return;
            }
            assert!(Instant::now() < deadline, "inbox did not drain in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct SeqRecorder {
        seen: Mutex<Vec<i64>>,
        fail_seq: Option<i64>,
    }

    #[async_trait]
    impl MessageHandler for SeqRecorder {
        async fn handle(
            &self,
            message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            let seq = message.group_seq.unwrap_or(-1);
            self.seen.lock().push(seq);
            if self.fail_seq == Some(seq) {
                return Err(HandlerError::retryable("simulated failure"));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_dispatches_in_sequence_order() {
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("ordered")
                    .with_type(InboxType::Fifo)
                    .with_poll_interval(Duration::from_millis(2)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(SeqRecorder {
            seen: Mutex::new(Vec::new()),
            fail_seq: None,
        });
        manager.bind_handler("ordered", handler.clone());
        manager.start().await.unwrap();

        for seq in 0..10 {
            manager
                .enqueue("ordered", fifo_message("g", seq))
                .await
                .unwrap();
        }

        wait_until(&manager, "ordered", |pending, _| pending == 0).await;
        manager.stop().await.unwrap();

        assert_eq!(*handler.seen.lock(), (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_message_blocks_group_until_dead_lettered() {
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("blocked")
                    .with_type(InboxType::Fifo)
                    .with_poll_interval(Duration::from_millis(2))
                    .with_max_attempts(2)
                    .with_backoff(fast_backoff(10)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(SeqRecorder {
            seen: Mutex::new(Vec::new()),
            fail_seq: Some(3),
        });
        manager.bind_handler("blocked", handler.clone());
        manager.start().await.unwrap();

        for seq in 0..10 {
            manager
                .enqueue("blocked", fifo_message("g", seq))
                .await
                .unwrap();
        }

        wait_until(&manager, "blocked", |pending, dead| pending == 0 && dead == 1).await;
        manager.stop().await.unwrap();

        // 0..2 succeed; 3 retries max_attempts times while 4..9 wait;
        // once 3 is dead-lettered the tail proceeds in order
        assert_eq!(
            *handler.seen.lock(),
            vec![0, 1, 2, 3, 3, 4, 5, 6, 7, 8, 9]
        );
    }

    struct BatchSeqRecorder {
        batches: Mutex<Vec<Vec<i64>>>,
        failed_once: Mutex<bool>,
        fail_seq: i64,
    }

    #[async_trait]
    impl BatchMessageHandler for BatchSeqRecorder {
        async fn handle_batch(
            &self,
            messages: &[MessageEnvelope],
            _ctx: &HandlerContext,
        ) -> Vec<HandlerResult> {
            let seqs: Vec<i64> = messages.iter().filter_map(|m| m.group_seq).collect();
            self.batches.lock().push(seqs);

            messages
                .iter()
                .map(|message| {
                    let mut failed_once = self.failed_once.lock();
                    if message.group_seq == Some(self.fail_seq) && !*failed_once {
                        *failed_once = true;
                        Err(HandlerError::retryable("simulated failure"))
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_batched_partial_failure_blocks_head_of_line() {
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("batched")
                    .with_type(InboxType::FifoBatched)
                    .with_batch_size(5)
                    .with_poll_interval(Duration::from_millis(2))
                    .with_max_attempts(3)
                    .with_backoff(fast_backoff(10)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        let handler = Arc::new(BatchSeqRecorder {
            batches: Mutex::new(Vec::new()),
            failed_once: Mutex::new(false),
            fail_seq: 2,
        });
        manager.bind_batch_handler("batched", handler.clone());

        // Enqueue the whole group before the loop starts so the first
        // lease sees one full contiguous run
        for seq in 0..10 {
            manager
                .enqueue("batched", fifo_message("g", seq))
                .await
                .unwrap();
        }

        manager.start().await.unwrap();
        wait_until(&manager, "batched", |pending, _| pending == 0).await;

        let stats = manager.stats("batched").await.unwrap();
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.dead_lettered, 0);

        manager.stop().await.unwrap();

        // First the full run; the failure at seq 2 blocks the group,
        // retries alone, then the tail ships as one batch
        let batches = handler.batches.lock().clone();
        assert_eq!(batches[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(batches[1], vec![2]);
        assert_eq!(batches[2], vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_groups_progress_independently() {
        let mut registry = ConfigRegistry::new();
        registry
            .register(
                InboxConfig::new("multi")
                    .with_type(InboxType::Fifo)
                    .with_poll_interval(Duration::from_millis(2))
                    .with_max_attempts(1)
                    .with_backoff(fast_backoff(10)),
            )
            .unwrap();

        let manager = InboxManager::new(registry);
        // Group "bad" fails at its head; group "good" must not care
        let handler = Arc::new(SeqRecorder {
            seen: Mutex::new(Vec::new()),
            fail_seq: Some(100),
        });
        manager.bind_handler("multi", handler.clone());
        manager.start().await.unwrap();

        manager
            .enqueue("multi", fifo_message("bad", 100))
            .await
            .unwrap();
        for seq in 0..5 {
            manager
                .enqueue("multi", fifo_message("good", seq))
                .await
                .unwrap();
        }

        wait_until(&manager, "multi", |pending, dead| pending == 0 && dead == 1).await;

        let dead = manager.dead_letters("multi", 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, "bad-100");

        manager.stop().await.unwrap();

        let seen = handler.seen.lock().clone();
        let good: Vec<i64> = seen.iter().copied().filter(|s| *s < 100).collect();
        assert_eq!(good, vec![0, 1, 2, 3, 4]);
    }
}
