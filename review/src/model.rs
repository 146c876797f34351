//! Reviews as the write path sees them.

use chrono::{DateTime, Utc};

/// A stored review.
///
/// `revision` starts at 1 and is incremented by the store on every update.
/// Event sequence numbers are derived from it.
#[derive(Clone, Debug, PartialEq)]
pub struct Review {
    /// Store-assigned id; also the broker partition key
    pub id: i64,
    /// Author
    pub user_id: i64,
    /// Reviewed mentor
    pub mentor_email: String,
    /// Score
    pub rating: f32,
    /// Free text
    pub comment: String,
    /// How the mentor can reach the author
    pub contact: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Store-owned revision counter
    pub revision: i64,
}

/// A committed update: the row as it was replaced and as it now stands.
///
/// Both states come from the same store transaction, so `before` is the
/// revision `after` superseded even when other writers raced.
#[derive(Clone, Debug, PartialEq)]
pub struct ReviewChange {
    /// State at `after.revision - 1`
    pub before: Review,
    /// State written by the update
    pub after: Review,
}

/// Input of a create.
#[derive(Clone, Debug, PartialEq)]
pub struct NewReview {
    /// Author
    pub user_id: i64,
    /// Reviewed mentor
    pub mentor_email: String,
    /// Score
    pub rating: f32,
    /// Free text
    pub comment: String,
    /// How the mentor can reach the author
    pub contact: String,
}

/// Replacement state of an update. The author cannot change.
#[derive(Clone, Debug, PartialEq)]
pub struct ReviewUpdate {
    /// Reviewed mentor (may move the review to another mentor)
    pub mentor_email: String,
    /// Score
    pub rating: f32,
    /// Free text
    pub comment: String,
    /// How the mentor can reach the author
    pub contact: String,
}

impl ReviewUpdate {
    /// Update that keeps everything of `review` but the rating.
    #[must_use]
    pub fn rating_of(review: &Review, rating: f32) -> Self {
        Self {
            mentor_email: review.mentor_email.clone(),
            rating,
            comment: review.comment.clone(),
            contact: review.contact.clone(),
        }
    }
}

/// Check the fields shared by creates and updates.
pub(crate) fn validate(mentor_email: &str, rating: f32) -> Result<(), String> {
    let mut parts = mentor_email.split('@');
    let well_formed = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty()
    );
    if !well_formed {
        return Err(format!("invalid mentor email: {mentor_email:?}"));
    }
    if !rating.is_finite() {
        return Err(format!("rating must be a finite number, got {rating}"));
    }
    Ok(())
}
