//! # Mentor Rating Testing
//!
//! In-memory doubles for the external collaborators of the rating pipeline:
//!
//! - [`InMemoryEventBus`]: partitioned log with consumer groups, committed
//!   offsets, redelivery on re-subscribe and simulated rebalances
//! - [`InMemoryAggregateStore`]: mutex-guarded aggregate rows with replay
//!   detection and injectable failures
//! - [`InMemoryDeadLetterSink`]: captures parked messages
//!
//! ## Example
//!
//! ```ignore
//! use mentor_rating_testing::{InMemoryAggregateStore, InMemoryEventBus};
//!
//! let bus = InMemoryEventBus::new(4);
//! let store = InMemoryAggregateStore::new();
//! store.insert_mentor("mentor@x.com", "@mentor");
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks
#![allow(clippy::missing_panics_doc)]

pub mod aggregate_store;
pub mod dead_letter;
pub mod event_bus;

pub use aggregate_store::InMemoryAggregateStore;
pub use dead_letter::InMemoryDeadLetterSink;
pub use event_bus::InMemoryEventBus;

/// Install a test `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; output is captured by the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
