//! HTTP client for the platform messaging API.
//!
//! Requests carry the engine's idempotency key in an `Idempotency-Key`
//! header, so a retried send is collapsed by the platform.

use async_trait::async_trait;
use replyflow_engine::{CommentReply, DirectMessage, GatewayError, MessagingGateway};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Header carrying the idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Response body for a successful send.
#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Messaging gateway backed by the platform's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpMessagingGateway {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpMessagingGateway {
    /// Creates a gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| GatewayError::Permanent {
            message: format!("invalid gateway base url: {e}"),
        })?;
        url.path_segments_mut()
            .map_err(|()| GatewayError::Permanent {
                message: "gateway base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        url: Url,
        idempotency_key: &str,
        body: &T,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_status(status, &body);
            warn!(%status, retryable = error.is_retryable(), "gateway call rejected");
            return Err(error);
        }

        let sent: SendResponse = response.json().await.map_err(|e| GatewayError::Permanent {
            message: format!("unexpected gateway response: {e}"),
        })?;
        debug!(id = %sent.id, "gateway call accepted");
        Ok(sent.id)
    }
}

/// Maps a non-success HTTP status to a gateway error.
///
/// Rate limits, server errors and request timeouts are transient; any other
/// rejection is permanent.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        GatewayError::Transient { message }
    } else {
        GatewayError::Permanent { message }
    }
}

fn classify_transport(e: &reqwest::Error) -> GatewayError {
    if e.is_builder() {
        return GatewayError::Permanent {
            message: e.to_string(),
        };
    }
    GatewayError::Transient {
        message: e.to_string(),
    }
}

#[async_trait]
impl MessagingGateway for HttpMessagingGateway {
    #[instrument(
        skip(self, message),
        fields(
            channel_id = %message.channel_id,
            external_user_id = %message.external_user_id,
            idempotency_key = %message.idempotency_key,
        )
    )]
    async fn send_direct_message(&self, message: &DirectMessage) -> Result<String, GatewayError> {
        let url = self.endpoint(&["messages"])?;
        self.post(url, &message.idempotency_key, message).await
    }

    #[instrument(
        skip(self, reply),
        fields(
            channel_id = %reply.channel_id,
            comment_id = %reply.comment_id,
            idempotency_key = %reply.idempotency_key,
        )
    )]
    async fn reply_to_comment(&self, reply: &CommentReply) -> Result<String, GatewayError> {
        let url = self.endpoint(&["comments", &reply.comment_id, "replies"])?;
        self.post(url, &reply.idempotency_key, reply).await
    }
}
