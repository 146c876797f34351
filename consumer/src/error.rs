//! Consumer errors.

use mentor_rating_core::event_bus::EventBusError;
use thiserror::Error;

/// Failure of a consumer run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Joining the consumer group failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] EventBusError),

    /// The subscription stream ended without a shutdown request
    #[error("Subscription for topic '{topic}' closed unexpectedly")]
    SubscriptionClosed {
        /// Subscribed topic
        topic: String,
    },

    /// A builder was missing a required collaborator
    #[error("Missing required component: {0}")]
    MissingComponent(&'static str),
}
