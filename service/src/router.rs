//! HTTP routes of the mentor service.
//!
//! ```text
//! POST /mentor.v1.MentorService/MethodMentorRating   RatingRequest  -> RpcResponse
//! POST /mentor.v1.MentorService/CheckMentor          CheckRequest   -> CheckResponse
//! POST /mentor.v1.MentorService/NewMentor            MentorRequest  -> RpcResponse
//! POST /mentor.v1.MentorService/ListMentors          {}             -> ListMentorsResponse
//! GET  /health
//! ```
//!
//! Rejections are HTTP 200 with `success = false`; store failures are HTTP 500.

use crate::error::ServiceError;
use crate::service::AggregateService;
use axum::{Json, Router, extract::State, http::StatusCode, routing::{get, post}};
use mentor_rating_core::rpc::{
    CheckRequest, CheckResponse, ListMentorsResponse, MentorRequest, RatingRequest, RpcResponse, paths,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the service router.
pub fn router(service: Arc<AggregateService>) -> Router {
    Router::new()
        .route(paths::METHOD_MENTOR_RATING, post(method_mentor_rating))
        .route(paths::CHECK_MENTOR, post(check_mentor))
        .route(paths::NEW_MENTOR, post(new_mentor))
        .route(paths::LIST_MENTORS, post(list_mentors))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn method_mentor_rating(
    State(service): State<Arc<AggregateService>>,
    Json(request): Json<RatingRequest>,
) -> Result<Json<RpcResponse>, ServiceError> {
    Ok(Json(service.apply(request).await?))
}

async fn check_mentor(
    State(service): State<Arc<AggregateService>>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ServiceError> {
    Ok(Json(service.check_mentor(&request.mentor_email).await?))
}

async fn new_mentor(
    State(service): State<Arc<AggregateService>>,
    Json(request): Json<MentorRequest>,
) -> Result<Json<RpcResponse>, ServiceError> {
    Ok(Json(service.new_mentor(request).await?))
}

async fn list_mentors(
    State(service): State<Arc<AggregateService>>,
) -> Result<Json<ListMentorsResponse>, ServiceError> {
    Ok(Json(service.list_mentors().await?))
}

/// Liveness probe. Does not touch the database.
#[allow(clippy::unused_async)]
async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
