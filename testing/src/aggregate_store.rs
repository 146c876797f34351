//! In-memory aggregate store.
//!
//! Each call takes the store lock once, which gives the same per-call
//! atomicity the Postgres store gets from a single `UPDATE`.

use mentor_rating_core::aggregate::{
    AggregateError, AggregateStore, ApplyOutcome, Delta, EventSequence, MentorAggregate,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct StoreState {
    mentors: HashMap<String, MentorAggregate>,
    last_applied: HashMap<i64, u64>,
    apply_failures_remaining: usize,
    apply_calls: usize,
}

/// In-memory [`AggregateStore`] for tests.
///
/// # Example
///
/// ```
/// use mentor_rating_core::aggregate::{AggregateStore, Delta};
/// use mentor_rating_testing::InMemoryAggregateStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryAggregateStore::new();
/// store.insert_mentor("mentor@x.com", "@mentor");
///
/// store.apply_delta("mentor@x.com", Delta::add(4.0), None).await.unwrap();
/// assert_eq!(store.snapshot("mentor@x.com").unwrap().count_reviews, 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryAggregateStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryAggregateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mentor directly.
    pub fn insert_mentor(&self, mentor_email: &str, contact: &str) {
        self.state
            .lock()
            .unwrap()
            .mentors
            .insert(mentor_email.to_string(), MentorAggregate::new(mentor_email, contact));
    }

    /// Current aggregate of a mentor.
    #[must_use]
    pub fn snapshot(&self, mentor_email: &str) -> Option<MentorAggregate> {
        self.state.lock().unwrap().mentors.get(mentor_email).cloned()
    }

    /// `(sum_rating, count_reviews)` of a mentor, `(0, 0)` if unknown.
    #[must_use]
    pub fn totals(&self, mentor_email: &str) -> (f64, i64) {
        self.snapshot(mentor_email)
            .map_or((0.0, 0), |m| (m.sum_rating, m.count_reviews))
    }

    /// Make the next `count` apply calls fail with a database error.
    pub fn fail_next_applies(&self, count: usize) {
        self.state.lock().unwrap().apply_failures_remaining = count;
    }

    /// Number of apply calls received, failed ones included.
    #[must_use]
    pub fn apply_calls(&self) -> usize {
        self.state.lock().unwrap().apply_calls
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn apply_delta(
        &self,
        mentor_email: &str,
        delta: Delta,
        sequence: Option<EventSequence>,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.apply_calls += 1;

            if state.apply_failures_remaining > 0 {
                state.apply_failures_remaining -= 1;
                return Err(AggregateError::Database("injected apply failure".to_string()));
            }

            if let Some(EventSequence { review_id, seq }) = sequence {
                if state.last_applied.get(&review_id).is_some_and(|last| *last >= seq) {
                    return Ok(ApplyOutcome::Duplicate);
                }
            }

            let mentor = state
                .mentors
                .get_mut(&mentor_email)
                .ok_or_else(|| AggregateError::MentorNotFound(mentor_email.clone()))?;
            mentor.apply(delta)?;

            if let Some(EventSequence { review_id, seq }) = sequence {
                state.last_applied.insert(review_id, seq);
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn create_mentor(
        &self,
        mentor_email: &str,
        contact: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        let contact = contact.to_string();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.mentors.contains_key(&mentor_email) {
                return Err(AggregateError::MentorExists(mentor_email));
            }
            state
                .mentors
                .insert(mentor_email.clone(), MentorAggregate::new(mentor_email, contact));
            Ok(())
        })
    }

    fn mentor_exists(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move { Ok(self.state.lock().unwrap().mentors.contains_key(&mentor_email)) })
    }

    fn get_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MentorAggregate>, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move { Ok(self.snapshot(&mentor_email)) })
    }

    fn list_mentors(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MentorAggregate>, AggregateError>> + Send + '_>> {
        Box::pin(async move {
            let mut mentors: Vec<MentorAggregate> =
                self.state.lock().unwrap().mentors.values().cloned().collect();
            mentors.sort_by(|a, b| b.average_rating().total_cmp(&a.average_rating()));
            Ok(mentors)
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replayed_sequence_is_a_no_op() {
        let store = InMemoryAggregateStore::new();
        store.insert_mentor("m@x.com", "");
        let seq = Some(EventSequence { review_id: 1, seq: 2 });

        let first = store.apply_delta("m@x.com", Delta::add(4.0), seq).await.expect("apply");
        let second = store.apply_delta("m@x.com", Delta::add(4.0), seq).await.expect("apply");

        assert_eq!(first, ApplyOutcome::Applied);
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(store.totals("m@x.com"), (4.0, 1));
    }

    #[tokio::test]
    async fn failed_apply_does_not_record_sequence() {
        let store = InMemoryAggregateStore::new();
        let seq = Some(EventSequence { review_id: 1, seq: 2 });

        let err = store.apply_delta("m@x.com", Delta::add(4.0), seq).await.unwrap_err();
        assert_eq!(err, AggregateError::MentorNotFound("m@x.com".to_string()));

        store.insert_mentor("m@x.com", "");
        let outcome = store.apply_delta("m@x.com", Delta::add(4.0), seq).await.expect("apply");
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn list_is_sorted_by_average_descending() {
        let store = InMemoryAggregateStore::new();
        store.insert_mentor("low@x.com", "");
        store.insert_mentor("high@x.com", "");
        store.apply_delta("low@x.com", Delta::add(1.0), None).await.expect("apply");
        store.apply_delta("high@x.com", Delta::add(5.0), None).await.expect("apply");

        let mentors = store.list_mentors().await.expect("list");
        let emails: Vec<&str> = mentors.iter().map(|m| m.mentor_email.as_str()).collect();
        assert_eq!(emails, vec!["high@x.com", "low@x.com"]);
    }
}
