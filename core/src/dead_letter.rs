//! Side channel for messages that could not be applied after bounded retries.

use crate::event_bus::ConsumerRecord;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// A message parked after exhausting its apply attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    /// The original message, payload untouched.
    pub record: ConsumerRecord,
    /// Error text of the last failed attempt.
    pub error_message: String,
    /// How many apply attempts were made.
    pub attempts: u32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the last attempt failed.
    pub last_failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Park `letter`.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure. The consumer then keeps the
    /// message uncommitted and retries it.
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}
