//! # Mentor Rating Service
//!
//! The aggregate side of the rating pipeline:
//!
//! - [`AggregateService`]: resolves rating requests into deltas against an
//!   [`AggregateStore`](mentor_rating_core::aggregate::AggregateStore), plus
//!   mentor registration, existence checks and the ranked listing
//! - [`router`]: JSON-over-HTTP binding of the service methods (axum)
//! - [`MentorServiceClient`]: the matching HTTP client (reqwest), implementing
//!   [`RatingApplier`](mentor_rating_core::rpc::RatingApplier) and
//!   [`MentorDirectory`](mentor_rating_core::rpc::MentorDirectory)
//!
//! The `mentor-service` binary wires the service to the Postgres store.
//! [`install_exporter`], [`init_tracing`] and [`wait_for_signal`] are shared
//! with the consumer binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod router;
pub mod service;
pub mod shutdown;

pub use client::MentorServiceClient;
pub use config::{ConfigError, ServiceConfig};
pub use error::ServiceError;
pub use metrics::{MetricsError, install_exporter};
pub use router::router;
pub use service::AggregateService;
pub use shutdown::wait_for_signal;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
