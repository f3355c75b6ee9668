//! # POSTBOX - Transactional Inbox Runtime
//!
//! A runtime for reliable message processing built in Rust.
//!
//! Transports enqueue messages into named inboxes; each inbox durably
//! persists its envelopes, leases them to a processing strategy, and
//! delivers them to an application handler with at-least-once semantics
//! plus deduplication, FIFO ordering, batching, retry with backoff, and
//! dead-lettering.
//!
//! ## Architecture
//!
//! - `core`: envelope, clock, backoff policy, identifier sanitization
//! - `config`: per-inbox configuration and the registry
//! - `handler`: handler capabilities bound by the application
//! - `storage`: the durable queue contract and its three backends
//!   (in-memory, PostgreSQL, Redis)
//! - `dedup`: TTL'd deduplication store per backend
//! - `deadletter`: terminal failure log with paging and replay
//! - `strategy`: the four processing loops (Default, Batched, Fifo,
//!   FifoBatched)
//! - `lifecycle`: per-inbox run flag, stop token, lifecycle hooks
//! - `manager`: orchestration and the transport-facing enqueue API

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundational types
pub mod core;

// Per-inbox configuration
pub mod config;

// Handler capabilities
pub mod handler;

// Deduplication store
pub mod dedup;

// Dead-letter store
pub mod deadletter;

// Storage providers
pub mod storage;

// Processing strategies
pub mod strategy;

// Lifecycle and hooks
pub mod lifecycle;

// Orchestration
pub mod manager;

// Re-export commonly used types
pub use config::{BackendConfig, ConfigError, ConfigRegistry, InboxConfig, InboxType};
pub use crate::core::{
    backoff::{BackoffPolicy, RetryPolicy},
    clock::{Clock, ManualClock, SystemClock},
    envelope::{EnqueueOutcome, MessageEnvelope, MessageState},
};
pub use handler::{
    BatchMessageHandler, HandlerBinding, HandlerContext, HandlerError, HandlerResult,
    MessageHandler,
};
pub use lifecycle::{InboxLifecycle, LifecycleHook, StopToken};
pub use manager::{EnqueueResponse, InboxManager, ManagerError, ManagerResult};
pub use storage::{
    NackOutcome, StorageError, StorageProvider, StorageResult, StorageStats,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
