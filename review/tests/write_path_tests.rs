//! Review mutations against the in-memory broker, review store and an
//! in-process mentor service.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use mentor_rating_core::event::{ReviewAction, ReviewEvent};
use mentor_rating_core::rpc::{MentorDirectory, RatingRequest, RpcError};
use mentor_rating_review::{
    InMemoryReviewStore, NewReview, Review, ReviewChange, ReviewError, ReviewEventProducer, ReviewMutations,
    ReviewStore, ReviewStoreError, ReviewUpdate,
};
use mentor_rating_service::AggregateService;
use mentor_rating_testing::{InMemoryAggregateStore, InMemoryEventBus};
use proptest::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Barrier;

const TOPIC: &str = "reviews";
const MENTOR: &str = "mentor@x.com";
const OTHER_MENTOR: &str = "other@x.com";

struct WritePath {
    bus: InMemoryEventBus,
    reviews: InMemoryReviewStore,
    aggregates: InMemoryAggregateStore,
    service: Arc<AggregateService>,
    mutations: ReviewMutations,
}

impl WritePath {
    fn new() -> Self {
        let reviews = InMemoryReviewStore::new();
        Self::over(reviews.clone(), Arc::new(reviews))
    }

    /// Write path whose mutations go through `store`, which wraps `reviews`.
    fn over(reviews: InMemoryReviewStore, store: Arc<dyn ReviewStore>) -> Self {
        let bus = InMemoryEventBus::new(4);
        let aggregates = InMemoryAggregateStore::new();
        aggregates.insert_mentor(MENTOR, "@mentor");
        aggregates.insert_mentor(OTHER_MENTOR, "@other");
        let service = Arc::new(AggregateService::new(Arc::new(aggregates.clone())));

        let mutations = ReviewMutations::new(
            store,
            Arc::clone(&service) as Arc<dyn MentorDirectory>,
            ReviewEventProducer::new(Arc::new(bus.clone()), TOPIC),
        );

        Self {
            bus,
            reviews,
            aggregates,
            service,
            mutations,
        }
    }

    /// Published events, partition by partition in offset order.
    fn events(&self) -> Vec<ReviewEvent> {
        self.bus
            .messages(TOPIC)
            .iter()
            .map(|m| ReviewEvent::from_json(m.payload.as_deref().unwrap()).unwrap())
            .collect()
    }

    fn events_of(&self, review_id: i64) -> Vec<ReviewEvent> {
        self.events().into_iter().filter(|e| e.review_id == review_id).collect()
    }

    /// Apply every published event through the aggregate service.
    async fn fold_into_aggregates(&self) {
        for event in self.events() {
            let response = self.service.apply(RatingRequest::from(&event)).await.unwrap();
            assert!(response.success, "{event} was rejected: {}", response.message);
        }
    }
}

fn new_review(user_id: i64, mentor_email: &str, rating: f32) -> NewReview {
    NewReview {
        user_id,
        mentor_email: mentor_email.to_string(),
        rating,
        comment: "clear explanations".to_string(),
        contact: format!("@user{user_id}"),
    }
}

/// Holds every `get` until `readers` callers are reading at once.
struct LockstepReads {
    inner: InMemoryReviewStore,
    readers: Barrier,
}

impl ReviewStore for LockstepReads {
    fn find_by_author(
        &self,
        user_id: i64,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, ReviewStoreError>> + Send + '_>> {
        self.inner.find_by_author(user_id, mentor_email)
    }

    fn insert(&self, review: NewReview) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>> {
        self.inner.insert(review)
    }

    fn get(&self, id: i64) -> Pin<Box<dyn Future<Output = Result<Option<Review>, ReviewStoreError>> + Send + '_>> {
        Box::pin(async move {
            let review = self.inner.get(id).await;
            self.readers.wait().await;
            review
        })
    }

    fn update(
        &self,
        id: i64,
        user_id: i64,
        update: ReviewUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<ReviewChange, ReviewStoreError>> + Send + '_>> {
        self.inner.update(id, user_id, update)
    }

    fn delete(&self, id: i64, user_id: i64) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>> {
        self.inner.delete(id, user_id)
    }

    fn list_by_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Review>, ReviewStoreError>> + Send + '_>> {
        self.inner.list_by_mentor(mentor_email)
    }
}

struct UnreachableDirectory;

impl MentorDirectory for UnreachableDirectory {
    fn check_mentor(&self, _mentor_email: &str) -> Pin<Box<dyn Future<Output = Result<bool, RpcError>> + Send + '_>> {
        Box::pin(async { Err(RpcError::Transport("connection refused".to_string())) })
    }
}

#[tokio::test]
async fn create_publishes_created_keyed_by_review_id() {
    let path = WritePath::new();

    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    let messages = path.bus.messages(TOPIC);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key.as_deref(), Some(review.id.to_string().as_str()));
    assert_eq!(
        path.events(),
        vec![ReviewEvent::created(review.id, MENTOR, 4.0).with_seq(2)]
    );
}

#[tokio::test]
async fn create_requires_a_registered_mentor() {
    let path = WritePath::new();

    let err = path.mutations.create(new_review(1, "ghost@x.com", 4.0)).await.unwrap_err();

    assert_eq!(err, ReviewError::MentorNotFound("ghost@x.com".to_string()));
    assert!(path.reviews.all().is_empty());
    assert!(path.events().is_empty());
}

#[tokio::test]
async fn create_rejects_invalid_input_before_any_call() {
    let path = WritePath::new();

    let err = path.mutations.create(new_review(1, "not-an-email", 4.0)).await.unwrap_err();
    assert!(matches!(err, ReviewError::Invalid(_)));

    let err = path.mutations.create(new_review(1, MENTOR, f32::NAN)).await.unwrap_err();
    assert!(matches!(err, ReviewError::Invalid(_)));
    assert!(path.events().is_empty());
}

#[tokio::test]
async fn one_review_per_user_and_mentor() {
    let path = WritePath::new();
    path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    let err = path.mutations.create(new_review(1, MENTOR, 5.0)).await.unwrap_err();
    assert_eq!(
        err,
        ReviewError::AlreadyReviewed {
            user_id: 1,
            mentor_email: MENTOR.to_string()
        }
    );

    path.mutations.create(new_review(2, MENTOR, 5.0)).await.unwrap();
    path.mutations.create(new_review(1, OTHER_MENTOR, 5.0)).await.unwrap();
    assert_eq!(path.events().len(), 3);
}

#[tokio::test]
async fn update_publishes_retract_then_apply() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    let updated = path
        .mutations
        .update(1, review.id, ReviewUpdate::rating_of(&review, 2.0))
        .await
        .unwrap();

    assert_eq!(updated.revision, 2);
    assert_eq!(
        path.events_of(review.id),
        vec![
            ReviewEvent::created(review.id, MENTOR, 4.0).with_seq(2),
            ReviewEvent::deleted(review.id, MENTOR, 4.0).with_seq(3),
            ReviewEvent::updated(review.id, MENTOR, 2.0).with_seq(4),
        ]
    );
}

#[tokio::test]
async fn concurrent_updates_retract_the_revision_they_replace() {
    let reviews = InMemoryReviewStore::new();
    let store = Arc::new(LockstepReads {
        inner: reviews.clone(),
        readers: Barrier::new(2),
    });
    let path = WritePath::over(reviews, store);
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    // Both updates read revision 1 (rating 4) before either commits.
    let (first, second) = tokio::join!(
        path.mutations.update(1, review.id, ReviewUpdate::rating_of(&review, 3.0)),
        path.mutations.update(1, review.id, ReviewUpdate::rating_of(&review, 2.0)),
    );
    first.unwrap();
    second.unwrap();

    let stored = path.reviews.all();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].revision, 3);

    // Each retract carries the rating its own update replaced.
    let events = path.events_of(review.id);
    let seqs: Vec<Option<u64>> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![Some(2), Some(3), Some(4), Some(5), Some(6)]);
    assert_eq!(events[1].score, 4.0);
    assert_eq!(events[3].score, events[2].score);
    assert_eq!(events[4].score, stored[0].rating);

    path.fold_into_aggregates().await;
    assert_eq!(path.aggregates.totals(MENTOR), (f64::from(stored[0].rating), 1));
}

#[tokio::test]
async fn only_the_author_may_update_or_delete() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    let err = path
        .mutations
        .update(2, review.id, ReviewUpdate::rating_of(&review, 1.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ReviewError::Forbidden {
            review_id: review.id,
            user_id: 2
        }
    );
    assert!(matches!(
        path.mutations.delete(2, review.id).await,
        Err(ReviewError::Forbidden { .. })
    ));
    assert_eq!(path.mutations.delete(1, 999).await.unwrap_err(), ReviewError::NotFound(999));

    assert_eq!(path.events().len(), 1);
    assert_eq!(path.reviews.all()[0].rating, 4.0);
}

#[tokio::test]
async fn delete_publishes_retract_after_last_revision() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();
    let review = path
        .mutations
        .update(1, review.id, ReviewUpdate::rating_of(&review, 3.0))
        .await
        .unwrap();

    let deleted = path.mutations.delete(1, review.id).await.unwrap();

    assert_eq!(deleted.rating, 3.0);
    assert_eq!(
        path.events_of(review.id).last(),
        Some(&ReviewEvent::deleted(review.id, MENTOR, 3.0).with_seq(5))
    );
    assert!(path.reviews.all().is_empty());
}

#[tokio::test]
async fn publish_failure_does_not_fail_the_mutation() {
    let path = WritePath::new();
    path.bus.fail_next_publishes(1);

    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    assert_eq!(path.reviews.all(), vec![review]);
    assert!(path.events().is_empty());
}

#[tokio::test]
async fn failed_retract_skips_the_apply_event() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();
    path.bus.fail_next_publishes(1);

    let updated = path
        .mutations
        .update(1, review.id, ReviewUpdate::rating_of(&review, 2.0))
        .await
        .unwrap();

    assert_eq!(updated.rating, 2.0);
    assert_eq!(path.events(), vec![ReviewEvent::created(review.id, MENTOR, 4.0).with_seq(2)]);

    // The aggregate keeps the old score instead of counting the review twice.
    path.fold_into_aggregates().await;
    assert_eq!(path.aggregates.totals(MENTOR), (4.0, 1));
}

#[tokio::test]
async fn failed_persistence_publishes_nothing() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();
    path.reviews.fail_next_writes(1);

    let err = path
        .mutations
        .update(1, review.id, ReviewUpdate::rating_of(&review, 2.0))
        .await
        .unwrap_err();

    assert!(matches!(err, ReviewError::Store(_)));
    assert_eq!(path.events().len(), 1);
}

#[tokio::test]
async fn mentor_check_failure_is_reported() {
    let reviews = InMemoryReviewStore::new();
    let bus = InMemoryEventBus::new(1);
    let mutations = ReviewMutations::new(
        Arc::new(reviews.clone()),
        Arc::new(UnreachableDirectory),
        ReviewEventProducer::new(Arc::new(bus.clone()), TOPIC),
    );

    let err = mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap_err();

    assert!(matches!(err, ReviewError::Directory(RpcError::Transport(_))));
    assert!(reviews.all().is_empty());
    assert!(bus.messages(TOPIC).is_empty());
}

#[tokio::test]
async fn moving_a_review_retracts_from_the_old_mentor() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(1, MENTOR, 4.0)).await.unwrap();

    let update = ReviewUpdate {
        mentor_email: OTHER_MENTOR.to_string(),
        ..ReviewUpdate::rating_of(&review, 5.0)
    };
    path.mutations.update(1, review.id, update).await.unwrap();
    path.fold_into_aggregates().await;

    assert_eq!(path.aggregates.totals(MENTOR), (0.0, 0));
    assert_eq!(path.aggregates.totals(OTHER_MENTOR), (5.0, 1));
    assert_eq!(path.mutations.reviews_of(OTHER_MENTOR).await.unwrap().len(), 1);
}

#[tokio::test]
async fn review_seven_lifecycle_nets_to_zero() {
    let path = WritePath::new();
    let review = path.mutations.create(new_review(7, MENTOR, 4.0)).await.unwrap();
    path.mutations
        .update(7, review.id, ReviewUpdate::rating_of(&review, 2.0))
        .await
        .unwrap();
    path.mutations.delete(7, review.id).await.unwrap();

    let actions: Vec<ReviewAction> = path.events_of(review.id).iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            ReviewAction::Created,
            ReviewAction::Deleted,
            ReviewAction::Updated,
            ReviewAction::Deleted
        ]
    );

    path.fold_into_aggregates().await;
    assert_eq!(path.aggregates.totals(MENTOR), (0.0, 0));
}

#[derive(Clone, Debug)]
enum Op {
    Create { user: i64, mentor: usize, rating: u8 },
    Update { user: i64, pick: usize, mentor: usize, rating: u8 },
    Delete { user: i64, pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..4, 0usize..2, 1u8..=5).prop_map(|(user, mentor, rating)| Op::Create { user, mentor, rating }),
        (0i64..4, 0usize..8, 0usize..2, 1u8..=5)
            .prop_map(|(user, pick, mentor, rating)| Op::Update { user, pick, mentor, rating }),
        (0i64..4, 0usize..8).prop_map(|(user, pick)| Op::Delete { user, pick }),
    ]
}

async fn run_ops(path: &WritePath, ops: Vec<Op>) {
    let mentors = [MENTOR, OTHER_MENTOR];
    for op in ops {
        let existing = path.reviews.all();
        // Refusals (duplicates, foreign reviews) are part of the exercise.
        let _ = match op {
            Op::Create { user, mentor, rating } => path
                .mutations
                .create(new_review(user, mentors[mentor], f32::from(rating)))
                .await
                .map(|_| ()),
            Op::Update {
                user,
                pick,
                mentor,
                rating,
            } => match existing.get(pick % existing.len().max(1)) {
                Some(review) => {
                    let update = ReviewUpdate {
                        mentor_email: mentors[mentor].to_string(),
                        ..ReviewUpdate::rating_of(review, f32::from(rating))
                    };
                    path.mutations.update(user, review.id, update).await.map(|_| ())
                },
                None => Ok(()),
            },
            Op::Delete { user, pick } => match existing.get(pick % existing.len().max(1)) {
                Some(review) => path.mutations.delete(user, review.id).await.map(|_| ()),
                None => Ok(()),
            },
        };
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn net_deltas_match_stored_reviews(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let path = WritePath::new();

        runtime.block_on(async {
            run_ops(&path, ops).await;
            path.fold_into_aggregates().await;
        });

        for mentor in [MENTOR, OTHER_MENTOR] {
            let stored: Vec<_> = path.reviews.all().into_iter().filter(|r| r.mentor_email == mentor).collect();
            let expected_sum: f64 = stored.iter().map(|r| f64::from(r.rating)).sum();
            let (sum, count) = path.aggregates.totals(mentor);

            prop_assert_eq!(count, i64::try_from(stored.len()).unwrap());
            prop_assert!((sum - expected_sum).abs() < 1e-9);
        }

        // Replaying the whole log changes nothing.
        let before = (path.aggregates.totals(MENTOR), path.aggregates.totals(OTHER_MENTOR));
        runtime.block_on(path.fold_into_aggregates());
        prop_assert_eq!(before, (path.aggregates.totals(MENTOR), path.aggregates.totals(OTHER_MENTOR)));
    }
}
