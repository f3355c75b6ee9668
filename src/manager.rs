//! Inbox manager
//!
//! Orchestrates every registered inbox: runs lifecycle hooks, builds
//! per-inbox resources through the provider factory, spawns one
//! strategy task per inbox, and drains them on stop within the
//! configured grace period. Also the front door for transports
//! (`enqueue`) and operators (stats, dead-letter paging and replay).

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ConfigRegistry, InboxConfig, InboxType};
use crate::core::clock::{Clock, SystemClock};
use crate::core::envelope::{EnqueueOutcome, MessageEnvelope};
use crate::deadletter::DeadLetterEntry;
use crate::handler::{BatchMessageHandler, HandlerBinding, MessageHandler};
use crate::lifecycle::{InboxLifecycle, LifecycleHook};
use crate::storage::{InboxResources, ProviderFactory, StorageError, StorageStats};
use crate::strategy::ProcessingStrategy;

/// Manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("startup hook failed: {0}")]
    HookFailed(String),

    #[error("manager is already running")]
    AlreadyRunning,

    #[error("unknown inbox: {0}")]
    UnknownInbox(String),
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Outcome of `enqueue` at the manager boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResponse {
    /// Persisted and eligible for dispatch
    Accepted,
    /// An envelope with this id already exists in the inbox
    DuplicateId,
    /// Collapsed by a live deduplication entry
    DedupHit,
    /// No inbox with that name is registered
    InboxUnknown,
}

impl From<EnqueueOutcome> for EnqueueResponse {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Accepted => EnqueueResponse::Accepted,
            EnqueueOutcome::DuplicateId => EnqueueResponse::DuplicateId,
            EnqueueOutcome::DedupHit => EnqueueResponse::DedupHit,
        }
    }
}

/// One started inbox: its resources, lifecycle, and loop task
struct InboxRuntime {
    config: InboxConfig,
    resources: Arc<InboxResources>,
    lifecycle: Arc<InboxLifecycle>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Orchestrates start/stop of all registered inboxes
pub struct InboxManager {
    registry: ConfigRegistry,
    clock: Arc<dyn Clock>,
    factory: ProviderFactory,
    bindings: DashMap<String, HandlerBinding>,
    hooks: Mutex<Vec<Arc<dyn LifecycleHook>>>,
    runtimes: DashMap<String, Arc<InboxRuntime>>,
    lifecycle: Mutex<Option<Arc<InboxLifecycle>>>,
    running: AtomicBool,
}

impl InboxManager {
    /// Create a manager over the given registry with the system clock
    pub fn new(registry: ConfigRegistry) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    /// Create a manager with an injected clock
    pub fn with_clock(registry: ConfigRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            factory: ProviderFactory::new(clock.clone()),
            clock,
            bindings: DashMap::new(),
            hooks: Mutex::new(Vec::new()),
            runtimes: DashMap::new(),
            lifecycle: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Bind a single-message handler to an inbox
    pub fn bind_handler(&self, inbox: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.bindings
            .insert(inbox.into(), HandlerBinding::Single(handler));
    }

    /// Bind a batch handler to an inbox
    pub fn bind_batch_handler(
        &self,
        inbox: impl Into<String>,
        handler: Arc<dyn BatchMessageHandler>,
    ) {
        self.bindings
            .insert(inbox.into(), HandlerBinding::Batch(handler));
    }

    /// Register a lifecycle hook; `on_start` runs in registration
    /// order, `on_stop` in reverse
    pub fn add_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.lock().push(hook);
    }

    /// Whether the manager has started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binding checks that must fail before any hook or backend runs
    fn validate_bindings(&self) -> ManagerResult<()> {
        for config in self.registry.iter() {
            let binding = self
                .bindings
                .get(&config.name)
                .ok_or_else(|| ConfigError::MissingHandler(config.name.clone()))?;
            let matches = match config.inbox_type {
                InboxType::Default | InboxType::Fifo => !binding.is_batch(),
                InboxType::FifoBatched => binding.is_batch(),
                InboxType::Batched => true,
            };
            if !matches {
                return Err(ConfigError::HandlerMismatch {
                    inbox: config.name.clone(),
                    inbox_type: config.inbox_type,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Start every registered inbox.
    ///
    /// Runs `on_start` hooks in registration order (aborting on the
    /// first failure), builds each inbox's resources, then spawns one
    /// strategy loop per inbox.
    pub async fn start(&self) -> ManagerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyRunning);
        }
        if let Err(error) = self.validate_bindings() {
            self.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let manager_lifecycle = Arc::new(InboxLifecycle::new());
        manager_lifecycle.start();
        *self.lifecycle.lock() = Some(manager_lifecycle.clone());

        let hooks = self.hooks.lock().clone();
        for hook in &hooks {
            if let Err(error) = hook.on_start(manager_lifecycle.stop_token()).await {
                tracing::error!(error = %error, "startup hook failed; aborting start");
                manager_lifecycle.stop();
                self.running.store(false, Ordering::SeqCst);
                return Err(ManagerError::HookFailed(error.to_string()));
            }
        }

        // Build everything before spawning anything, so a failing
        // backend aborts startup without half a fleet running
        let pending = match self.build_runtimes().await {
            Ok(pending) => pending,
            Err(error) => {
                manager_lifecycle.stop();
                self.running.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        for (config, resources, lifecycle, strategy) in pending {
            lifecycle.start();
            let task = tokio::spawn(strategy.run());
            tracing::info!(inbox = %config.name, inbox_type = ?config.inbox_type, "inbox started");
            self.runtimes.insert(
                config.name.clone(),
                Arc::new(InboxRuntime {
                    config,
                    resources,
                    lifecycle,
                    task: Mutex::new(Some(task)),
                }),
            );
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    async fn build_runtimes(
        &self,
    ) -> ManagerResult<
        Vec<(
            InboxConfig,
            Arc<InboxResources>,
            Arc<InboxLifecycle>,
            ProcessingStrategy,
        )>,
    > {
        let mut pending = Vec::new();
        for config in self.registry.iter() {
            let resources = self.factory.resources_for(config).await?;
            let binding = self
                .bindings
                .get(&config.name)
                .map(|b| b.clone())
                .ok_or_else(|| ConfigError::MissingHandler(config.name.clone()))?;

            let lifecycle = Arc::new(InboxLifecycle::new());
            let strategy = ProcessingStrategy::for_config(
                config.clone(),
                resources.clone(),
                self.clock.clone(),
                lifecycle.stop_token(),
                binding,
            )?;
            pending.push((config.clone(), resources, lifecycle, strategy));
        }
        Ok(pending)
    }

    /// Stop every inbox, draining in-flight dispatches.
    ///
    /// Signals every stop token, waits up to each inbox's grace period
    /// for its loop to finish (abandoning it past the deadline; the
    /// backend's visibility timeout reclaims any abandoned lease), then
    /// runs `on_stop` hooks in reverse order. Idempotent.
    pub async fn stop(&self) -> ManagerResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let runtimes: Vec<Arc<InboxRuntime>> =
            self.runtimes.iter().map(|r| r.value().clone()).collect();
        for runtime in &runtimes {
            runtime.lifecycle.stop();
        }

        for runtime in &runtimes {
            let task = runtime.task.lock().take();
            if let Some(task) = task {
                match tokio::time::timeout(runtime.config.stop_grace, task).await {
                    Ok(_) => {
                        tracing::info!(inbox = %runtime.config.name, "inbox stopped");
                    }
                    Err(_) => {
                        tracing::warn!(
                            inbox = %runtime.config.name,
                            grace_ms = runtime.config.stop_grace.as_millis() as u64,
                            "inbox did not drain within grace; abandoning task"
                        );
                    }
                }
            }
        }

        let manager_lifecycle = self.lifecycle.lock().take();
        if let Some(manager_lifecycle) = &manager_lifecycle {
            manager_lifecycle.stop();
        }

        let hooks: Vec<Arc<dyn LifecycleHook>> = self.hooks.lock().iter().rev().cloned().collect();
        for hook in hooks {
            let token = manager_lifecycle
                .as_ref()
                .map(|l| l.stop_token())
                .unwrap_or_else(crate::lifecycle::StopToken::never);
            if let Err(error) = hook.on_stop(token).await {
                tracing::warn!(error = %error, "shutdown hook failed");
            }
        }

        self.runtimes.clear();
        Ok(())
    }

    /// Resources for a registered inbox, whether or not its loop is
    /// running yet; pre-start enqueues land in the same storage the
    /// loop will drain
    async fn inbox_resources(&self, inbox: &str) -> ManagerResult<Option<Arc<InboxResources>>> {
        if let Some(runtime) = self.runtimes.get(inbox) {
            return Ok(Some(runtime.resources.clone()));
        }
        let Some(config) = self.registry.get(inbox) else {
            return Ok(None);
        };
        Ok(Some(self.factory.resources_for(config).await?))
    }

    /// Persist an envelope into the named inbox.
    ///
    /// The transport-facing entry point. Works before `start`: the
    /// envelope is durably stored and dispatched once the inbox runs.
    pub async fn enqueue(
        &self,
        inbox: &str,
        envelope: MessageEnvelope,
    ) -> ManagerResult<EnqueueResponse> {
        let Some(resources) = self.inbox_resources(inbox).await? else {
            return Ok(EnqueueResponse::InboxUnknown);
        };
        let outcome = resources.storage.enqueue(envelope).await?;
        Ok(outcome.into())
    }

    /// Queue depth counters for one inbox
    pub async fn stats(&self, inbox: &str) -> ManagerResult<StorageStats> {
        let resources = self
            .inbox_resources(inbox)
            .await?
            .ok_or_else(|| ManagerError::UnknownInbox(inbox.to_string()))?;
        Ok(resources.storage.stats().await?)
    }

    /// Page through an inbox's dead-letter entries
    pub async fn dead_letters(
        &self,
        inbox: &str,
        offset: u64,
        limit: u64,
    ) -> ManagerResult<Vec<DeadLetterEntry>> {
        let resources = self
            .inbox_resources(inbox)
            .await?
            .ok_or_else(|| ManagerError::UnknownInbox(inbox.to_string()))?;
        Ok(resources.deadletter.page(offset, limit).await?)
    }

    /// Re-enqueue a dead-lettered message by id.
    ///
    /// The envelope returns to the queue immediately visible with its
    /// attempt counter preserved; a message that fails again
    /// dead-letters on the next nack.
    pub async fn replay_dead_letter(
        &self,
        inbox: &str,
        message_id: &str,
    ) -> ManagerResult<EnqueueResponse> {
        let resources = self
            .inbox_resources(inbox)
            .await?
            .ok_or_else(|| ManagerError::UnknownInbox(inbox.to_string()))?;
        let entry = resources
            .deadletter
            .take(message_id)
            .await?
            .ok_or_else(|| StorageError::MessageNotFound(message_id.to_string()))?;

        let envelope = entry.replay_envelope(self.clock.utc_now())?;
        let outcome = resources.storage.enqueue(envelope).await?;
        tracing::info!(
            inbox = %inbox,
            message_id = %message_id,
            outcome = ?outcome,
            "dead-lettered message replayed"
        );
        Ok(outcome.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct OkHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for OkHandler {
        async fn handle(
            &self,
            _message: &MessageEnvelope,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OrderedHook {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_on_start: bool,
    }

    #[async_trait]
    impl LifecycleHook for OrderedHook {
        async fn on_start(&self, _token: crate::lifecycle::StopToken) -> anyhow::Result<()> {
            self.log.lock().push(format!("start:{}", self.label));
            if self.fail_on_start {
                anyhow::bail!("{} refused to start", self.label);
            }
            Ok(())
        }

        async fn on_stop(&self, _token: crate::lifecycle::StopToken) -> anyhow::Result<()> {
            self.log.lock().push(format!("stop:{}", self.label));
            Ok(())
        }
    }

    fn registry(name: &str) -> ConfigRegistry {
        let mut registry = ConfigRegistry::new();
        registry
            .register(InboxConfig::new(name).with_poll_interval(Duration::from_millis(5)))
            .unwrap();
        registry
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_process_stop() {
        let manager = InboxManager::new(registry("orders"));
        let handler = Arc::new(OkHandler {
            calls: AtomicU32::new(0),
        });
        manager.bind_handler("orders", handler.clone());

        manager.start().await.unwrap();
        assert!(manager.is_running());

        for i in 0..5 {
            let response = manager
                .enqueue("orders", MessageEnvelope::with_id(format!("msg-{i}"), vec![]))
                .await
                .unwrap();
            assert_eq!(response, EnqueueResponse::Accepted);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop().await.unwrap();
        assert!(!manager.is_running());

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_unknown_inbox() {
        let manager = InboxManager::new(registry("orders"));
        manager.bind_handler(
            "orders",
            Arc::new(OkHandler {
                calls: AtomicU32::new(0),
            }),
        );
        manager.start().await.unwrap();

        let response = manager
            .enqueue("missing", MessageEnvelope::new(vec![]))
            .await
            .unwrap();
        assert_eq!(response, EnqueueResponse::InboxUnknown);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_handler_fails_start() {
        let manager = InboxManager::new(registry("orders"));
        let error = manager.start().await.unwrap_err();
        assert!(matches!(
            error,
            ManagerError::Config(ConfigError::MissingHandler(_))
        ));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_reverse() {
        let manager = InboxManager::new(registry("orders"));
        manager.bind_handler(
            "orders",
            Arc::new(OkHandler {
                calls: AtomicU32::new(0),
            }),
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        manager.add_hook(Arc::new(OrderedHook {
            label: "a",
            log: log.clone(),
            fail_on_start: false,
        }));
        manager.add_hook(Arc::new(OrderedHook {
            label: "b",
            log: log.clone(),
            fail_on_start: false,
        }));

        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_start() {
        let manager = InboxManager::new(registry("orders"));
        manager.bind_handler(
            "orders",
            Arc::new(OkHandler {
                calls: AtomicU32::new(0),
            }),
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        manager.add_hook(Arc::new(OrderedHook {
            label: "bad",
            log: log.clone(),
            fail_on_start: true,
        }));
        manager.add_hook(Arc::new(OrderedHook {
            label: "never",
            log: log.clone(),
            fail_on_start: false,
        }));

        let error = manager.start().await.unwrap_err();
        assert!(matches!(error, ManagerError::HookFailed(_)));
        assert!(!manager.is_running());
        // The second hook never ran
        assert_eq!(*log.lock(), vec!["start:bad"]);
    }
}
