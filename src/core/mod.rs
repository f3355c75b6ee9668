//! Foundational types for the inbox runtime
//!
//! - `clock`: injectable UTC time source
//! - `envelope`: the persisted message unit and its states
//! - `backoff`: retry backoff policy
//! - `identifier`: backend identifier sanitization

pub mod backoff;
pub mod clock;
pub mod envelope;
pub mod identifier;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{EnqueueOutcome, MessageEnvelope, MessageState};
pub use identifier::{sanitize_identifier, POSTGRES_IDENTIFIER_LIMIT};
