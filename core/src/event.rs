//! Review events as they travel through the broker.
//!
//! A [`ReviewEvent`] is produced once per review state transition and carries
//! everything the aggregate side needs to apply a delta: the action, the
//! review id (also the partition key), the mentor and the score.
//!
//! # Wire Format
//!
//! Events are JSON so that any producer speaking the topic contract can
//! publish them:
//!
//! ```json
//! {"action": "updated", "id": 7, "email": "mentor@x.com", "score": 4.0}
//! ```
//!
//! An optional `"seq"` field carries the per-review sequence number used for
//! replay detection. It is omitted when absent.
//!
//! # Action Tags
//!
//! The action is a closed set resolved once during deserialization. A payload
//! with an unknown tag fails to decode and never reaches the apply logic.
//!
//! # Example
//!
//! ```
//! use mentor_rating_core::event::{ReviewAction, ReviewEvent};
//!
//! let event = ReviewEvent::updated(7, "mentor@x.com", 4.0).with_seq(2);
//! let bytes = event.to_json().unwrap();
//!
//! let decoded = ReviewEvent::from_json(&bytes).unwrap();
//! assert_eq!(decoded.action, ReviewAction::Updated);
//! assert_eq!(decoded.partition_key(), "7");
//! ```

use crate::aggregate::Delta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Action tag outside of `created`, `updated`, `deleted`.
    #[error("Unknown review action: {0}")]
    UnknownAction(String),
}

/// What happened to a review.
///
/// `Created` and `Updated` add the score to the mentor aggregate, `Deleted`
/// retracts it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    /// A new review was committed.
    Created,
    /// A review now carries this score (second half of an edit).
    Updated,
    /// A review's score is retracted (deletion, or first half of an edit).
    Deleted,
}

impl ReviewAction {
    /// Wire tag for this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownAction`] for any tag outside the closed set.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            other => Err(EventError::UnknownAction(other.to_string())),
        }
    }

    /// The aggregate delta this action produces for `score`.
    #[must_use]
    pub fn delta(self, score: f32) -> Delta {
        match self {
            Self::Created | Self::Updated => Delta::add(score),
            Self::Deleted => Delta::retract(score),
        }
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewAction {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A single review state transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewEvent {
    /// What happened.
    pub action: ReviewAction,

    /// Id of the review. Also the partition key.
    #[serde(rename = "id")]
    pub review_id: i64,

    /// Mentor whose aggregate the event affects.
    #[serde(rename = "email")]
    pub mentor_email: String,

    /// Score to add or retract.
    pub score: f32,

    /// Per-review monotonic sequence number, if the producer assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl ReviewEvent {
    /// Create an event without a sequence number.
    #[must_use]
    pub fn new(action: ReviewAction, review_id: i64, mentor_email: impl Into<String>, score: f32) -> Self {
        Self {
            action,
            review_id,
            mentor_email: mentor_email.into(),
            score,
            seq: None,
        }
    }

    /// A `created` event.
    #[must_use]
    pub fn created(review_id: i64, mentor_email: impl Into<String>, score: f32) -> Self {
        Self::new(ReviewAction::Created, review_id, mentor_email, score)
    }

    /// An `updated` event (apply half of an edit).
    #[must_use]
    pub fn updated(review_id: i64, mentor_email: impl Into<String>, score: f32) -> Self {
        Self::new(ReviewAction::Updated, review_id, mentor_email, score)
    }

    /// A `deleted` event (deletion, or retract half of an edit).
    #[must_use]
    pub fn deleted(review_id: i64, mentor_email: impl Into<String>, score: f32) -> Self {
        Self::new(ReviewAction::Deleted, review_id, mentor_email, score)
    }

    /// Attach a sequence number.
    #[must_use]
    pub const fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Broker partition key: the review id in decimal.
    ///
    /// Every event about the same review shares this key and therefore lands
    /// on the same partition in publish order.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.review_id.to_string()
    }

    /// The aggregate delta carried by this event.
    #[must_use]
    pub fn delta(&self) -> Delta {
        self.action.delta(self.score)
    }

    /// Encode as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails
    /// (non-finite scores cannot be represented in JSON).
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        if !self.score.is_finite() {
            return Err(EventError::SerializationError(format!(
                "score must be finite, got {}",
                self.score
            )));
        }
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decode a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not a
    /// valid event, including an unknown action tag.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for ReviewEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReviewEvent {{ action: {}, review: {}, mentor: {}, score: {} }}",
            self.action, self.review_id, self.mentor_email, self.score
        )
    }
}
