//! HTTP mapping of service failures.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mentor_rating_core::aggregate::AggregateError;
use mentor_rating_core::rpc::RpcResponse;
use std::fmt;

/// Failure of a service call.
///
/// Store failures become HTTP 500 with the generic body
/// `{"success": false, "message": "error"}`; the cause is logged, not exposed.
#[derive(Debug)]
pub struct ServiceError {
    status: StatusCode,
    source: AggregateError,
}

impl ServiceError {
    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AggregateError> for ServiceError {
    fn from(source: AggregateError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            source,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status.as_u16(), self.source)
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!(
            status = %self.status,
            error = %self.source,
            "Mentor service call failed"
        );

        (self.status, Json(RpcResponse::rejected("error"))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_internal() {
        let err = ServiceError::from(AggregateError::Database("connection reset".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "[500] Database error: connection reset");
    }
}
