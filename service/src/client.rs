//! HTTP client for the mentor service.
//!
//! Used by the rating consumer to apply deltas and by the review write path
//! to check mentor existence. Every call has a deadline (the client timeout)
//! and no internal retry: a failed call is reported to the caller, whose own
//! redelivery handles it.

use mentor_rating_core::rpc::{
    CheckRequest, CheckResponse, ListMentorsResponse, MentorDirectory, MentorRequest, RatingApplier,
    RatingRequest, RpcError, RpcResponse, paths,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Mentor service client.
#[derive(Clone, Debug)]
pub struct MentorServiceClient {
    client: Client,
    base_url: String,
}

impl MentorServiceClient {
    /// Create a client for the service at `address`.
    ///
    /// `address` may be a bare `host:port` (as in `MENTOR_SERVICE_ADDRESS`);
    /// `http://` is assumed then.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] if the HTTP client cannot be built.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_address(address),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call `MethodMentorRating`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn method_mentor_rating(&self, request: &RatingRequest) -> Result<RpcResponse, RpcError> {
        self.call(paths::METHOD_MENTOR_RATING, request).await
    }

    /// Call `CheckMentor`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn check(&self, mentor_email: &str) -> Result<CheckResponse, RpcError> {
        let request = CheckRequest {
            mentor_email: mentor_email.to_string(),
        };
        self.call(paths::CHECK_MENTOR, &request).await
    }

    /// Call `NewMentor`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn new_mentor(&self, request: &MentorRequest) -> Result<RpcResponse, RpcError> {
        self.call(paths::NEW_MENTOR, request).await
    }

    /// Call `ListMentors`.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx statuses and undecodable bodies.
    pub async fn list_mentors(&self) -> Result<ListMentorsResponse, RpcError> {
        self.call(paths::LIST_MENTORS, &serde_json::json!({})).await
    }

    async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Transport(format!("{path} returned {status}: {body}")));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))
    }
}

fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

impl RatingApplier for MentorServiceClient {
    fn apply(
        &self,
        request: RatingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + '_>> {
        Box::pin(async move {
            let response = self.method_mentor_rating(&request).await?;
            if response.success {
                Ok(())
            } else {
                Err(RpcError::Rejected(response.message))
            }
        })
    }
}

impl MentorDirectory for MentorServiceClient {
    fn check_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RpcError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move {
            let response = self.check(&mentor_email).await?;
            if response.success {
                Ok(response.exists)
            } else {
                Err(RpcError::Rejected(response.message))
            }
        })
    }
}
