//! Handler capabilities
//!
//! Applications bind one handler per inbox: a [`MessageHandler`] for
//! single-dispatch inbox types (Default, Fifo) or a
//! [`BatchMessageHandler`] for batched types (Batched, FifoBatched).
//! Handlers report success by returning `Ok(())`; failures carry a
//! reason and a retryable flag. A non-retryable failure bypasses the
//! remaining attempts and dead-letters directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::clock::Clock;
use crate::core::envelope::MessageEnvelope;
use crate::lifecycle::StopToken;
use crate::storage::{StorageProvider, StorageResult};

/// A failed dispatch as reported by a handler
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct HandlerError {
    /// What went wrong; recorded as the nack reason
    pub reason: String,
    /// Whether the runtime should retry within the remaining attempts
    pub retryable: bool,
}

impl HandlerError {
    /// A failure the runtime should retry
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// A failure that goes straight to the dead-letter store
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Per-message dispatch outcome
pub type HandlerResult = Result<(), HandlerError>;

/// Runtime context handed to handlers on every dispatch
pub struct HandlerContext {
    inbox: String,
    stop: StopToken,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn StorageProvider>,
    leases: Vec<(String, String)>,
}

impl HandlerContext {
    pub(crate) fn new(
        inbox: impl Into<String>,
        stop: StopToken,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn StorageProvider>,
        leases: Vec<(String, String)>,
    ) -> Self {
        Self {
            inbox: inbox.into(),
            stop,
            clock,
            storage,
            leases,
        }
    }

    /// Name of the inbox dispatching this message
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Stop token of the owning inbox; long-running handlers should
    /// poll it and wind down early on shutdown
    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    /// Current UTC time from the inbox's clock
    pub fn utc_now(&self) -> DateTime<Utc> {
        self.clock.utc_now()
    }

    /// Extend every lease in this dispatch scope by `additional`;
    /// call before the visibility timeout lapses on long work
    pub async fn extend_lease(&self, additional: Duration) -> StorageResult<()> {
        for (id, lease) in &self.leases {
            self.storage.extend(id, lease, additional).await?;
        }
        Ok(())
    }
}

/// Single-message handler capability
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message; `Ok` acknowledges, `Err` nacks
    async fn handle(&self, message: &MessageEnvelope, ctx: &HandlerContext) -> HandlerResult;
}

/// Batch handler capability
#[async_trait]
pub trait BatchMessageHandler: Send + Sync {
    /// Process a batch and report one outcome per message, in order.
    /// Missing trailing outcomes are treated as retryable failures.
    async fn handle_batch(
        &self,
        messages: &[MessageEnvelope],
        ctx: &HandlerContext,
    ) -> Vec<HandlerResult>;
}

/// The handler bound to an inbox
#[derive(Clone)]
pub enum HandlerBinding {
    /// Dispatch one message at a time
    Single(Arc<dyn MessageHandler>),
    /// Dispatch whole batches
    Batch(Arc<dyn BatchMessageHandler>),
}

impl HandlerBinding {
    /// Whether this binding dispatches batches
    pub fn is_batch(&self) -> bool {
        matches!(self, HandlerBinding::Batch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let retry = HandlerError::retryable("timeout");
        assert!(retry.retryable);
        assert_eq!(retry.to_string(), "timeout");

        let permanent = HandlerError::permanent("bad payload");
        assert!(!permanent.retryable);
    }

    #[test]
    fn test_binding_kind() {
        struct Noop;

        #[async_trait]
        impl MessageHandler for Noop {
            async fn handle(
                &self,
                _message: &MessageEnvelope,
                _ctx: &HandlerContext,
            ) -> HandlerResult {
                Ok(())
            }
        }

        let binding = HandlerBinding::Single(Arc::new(Noop));
        assert!(!binding.is_batch());
    }
}
