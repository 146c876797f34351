//! Request and response shapes of the mentor service, and the client-side
//! traits the pipeline calls through.
//!
//! The shapes are a fixed contract shared by the server (`service` crate) and
//! every client. `action` travels as a string on this boundary; the server
//! resolves it into [`ReviewAction`] and answers `success = false` for tags it
//! does not know.

use crate::event::{ReviewAction, ReviewEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Method paths of the mentor service.
pub mod paths {
    /// Apply a rating delta.
    pub const METHOD_MENTOR_RATING: &str = "/mentor.v1.MentorService/MethodMentorRating";
    /// Check mentor existence.
    pub const CHECK_MENTOR: &str = "/mentor.v1.MentorService/CheckMentor";
    /// Register a mentor.
    pub const NEW_MENTOR: &str = "/mentor.v1.MentorService/NewMentor";
    /// List aggregates.
    pub const LIST_MENTORS: &str = "/mentor.v1.MentorService/ListMentors";
}

/// Apply request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingRequest {
    /// `created`, `updated` or `deleted`
    pub action: String,
    /// Mentor whose aggregate changes
    pub mentor_email: String,
    /// Score to add or retract
    pub rating: f32,
    /// Review the event belongs to (for replay detection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<i64>,
    /// Per-review sequence number (for replay detection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl RatingRequest {
    /// Build a plain request without replay detection.
    #[must_use]
    pub fn new(action: ReviewAction, mentor_email: impl Into<String>, rating: f32) -> Self {
        Self {
            action: action.as_str().to_string(),
            mentor_email: mentor_email.into(),
            rating,
            review_id: None,
            seq: None,
        }
    }
}

impl From<&ReviewEvent> for RatingRequest {
    fn from(event: &ReviewEvent) -> Self {
        Self {
            action: event.action.as_str().to_string(),
            mentor_email: event.mentor_email.clone(),
            rating: event.score,
            review_id: event.seq.map(|_| event.review_id),
            seq: event.seq,
        }
    }
}

/// Generic response of mutating methods.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Whether the request took effect (or was a recognised replay)
    pub success: bool,
    /// Short status text
    pub message: String,
}

impl RpcResponse {
    /// `success = true`.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// `success = false`.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Mentor registration request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentorRequest {
    /// Mentor identity
    pub mentor_email: String,
    /// Contact shown with the mentor
    pub contact: String,
}

/// Existence check request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Mentor to look up
    pub mentor_email: String,
}

/// Existence check response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Whether the lookup itself succeeded
    pub success: bool,
    /// Whether the mentor is registered
    pub exists: bool,
    /// Short status text
    pub message: String,
}

/// One row of the mentor listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MentorSummary {
    /// Mentor identity
    pub mentor_email: String,
    /// Contact shown with the mentor
    pub contact: String,
    /// `sum_rating / count_reviews`, 0 without reviews
    pub average_rating: f64,
    /// Number of applied reviews
    pub count_reviews: i64,
}

/// Listing response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListMentorsResponse {
    /// Highest average rating first
    pub mentors: Vec<MentorSummary>,
}

/// Failures seen by callers of the mentor service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The call did not complete (dial failure, timeout, 5xx).
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The server answered `success = false`.
    #[error("server responded with success=false, message={0}")]
    Rejected(String),

    /// The response body could not be decoded.
    #[error("RPC decode error: {0}")]
    Decode(String),
}

/// Applies rating deltas. Implemented by the RPC client and, in-process, by
/// the aggregate service itself.
pub trait RatingApplier: Send + Sync {
    /// Apply one request. No internal retry.
    ///
    /// # Errors
    ///
    /// Any transport failure or `success = false` answer.
    fn apply(
        &self,
        request: RatingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + '_>>;
}

/// Answers whether a mentor exists. Gates review creation.
pub trait MentorDirectory: Send + Sync {
    /// Whether `mentor_email` is a registered mentor.
    ///
    /// # Errors
    ///
    /// Transport failures, or a server-side lookup failure.
    fn check_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RpcError>> + Send + '_>>;
}
