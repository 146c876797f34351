//! # Mentor Rating Consumer
//!
//! Turns review events from the broker into rating deltas.
//!
//! ```text
//! subscribe(topic, group)
//!   │ Assigned / Revoked / Message
//!   ▼
//! ReviewEventConsumer ──► PartitionWorker (one per partition, sequential)
//!                              │ decode ─► RatingApplier::apply ─► commit
//!                              │ undecodable ─► commit (dropped)
//!                              └ failing ─► backoff, retry; DeadLetterSink after N attempts
//! ```
//!
//! Delivery is at least once. A crash between apply and commit replays the
//! message; events carrying a sequence number are deduplicated by the
//! aggregate store, events without one are counted twice.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod retry;
pub mod shutdown;
pub mod state;
mod worker;

pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{DEFAULT_PARTITION_BUFFER, ReadySignal, ReviewEventConsumer, ReviewEventConsumerBuilder};
pub use dead_letter::LoggingDeadLetterSink;
pub use error::ConsumerError;
pub use retry::RetryPolicy;
pub use state::ConsumerState;
pub use worker::PoisonPolicy;
