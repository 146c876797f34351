//! # Mentor Rating Core
//!
//! Shared contracts for the review-to-rating propagation pipeline.
//!
//! A review mutation is committed to the review store, turned into one or two
//! [`ReviewEvent`](event::ReviewEvent)s, published to a partitioned broker keyed
//! by review id, consumed by the rating consumer and applied as a delta to the
//! mentor's running aggregate through the aggregate service.
//!
//! ## Data Flow
//!
//! ```text
//! review write ──► producer ──► broker (partition = hash(review id))
//!                                   │
//!                                   ▼
//!                        consumer (one worker per partition)
//!                                   │  RatingRequest
//!                                   ▼
//!                          aggregate service ──► aggregate store
//!                                   │                (atomic delta)
//!                                   ▼
//!                            offset committed
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the wire event and its closed action type
//! - [`event_bus`]: the narrow broker interface (publish / subscribe / commit / pause)
//! - [`aggregate`]: the mentor aggregate and the store contract
//! - [`rpc`]: request/response shapes of the aggregate service and its client traits
//! - [`dead_letter`]: side channel for messages that exhausted their retries

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod dead_letter;
pub mod event;
pub mod event_bus;
pub mod rpc;

// Re-export commonly used types
pub use aggregate::{AggregateError, AggregateStore, ApplyOutcome, Delta, EventSequence, MentorAggregate};
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use event::{EventError, ReviewAction, ReviewEvent};
pub use event_bus::{
    BusEvent, ConsumerRecord, Delivery, EventBus, EventBusError, EventStream, OffsetCommitter, PartitionFlow,
    Subscription,
};
pub use rpc::{MentorDirectory, RatingApplier, RatingRequest, RpcError, RpcResponse};
