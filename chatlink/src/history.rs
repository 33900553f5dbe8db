//! History fetcher: request/response retrieval of prior messages.
//!
//! One GET per conversation selection, bearer-authenticated, returning the
//! ordered list of message records the server has stored. The fetcher only
//! reads — the store decides what to adopt.

use std::time::Duration;

use chatlink_proto::codec::{self, CodecError};
use chatlink_proto::message::{ChatMessage, UserId};
use url::Url;

/// Errors from a history fetch.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// No credential was available, or the server rejected the one sent.
    #[error("unauthorized")]
    Unauthorized,

    /// The response body is not an ordered list of message records.
    #[error("invalid response format: {0}")]
    InvalidFormat(#[from] CodecError),

    /// The request itself failed (timeout, DNS, connection refused, 5xx).
    #[error("history request failed: {0}")]
    Request(String),
}

/// Request/response access to a conversation's stored messages.
pub trait HistoryApi: Send + Sync {
    /// Fetch the ordered message history for the conversation with `peer`.
    ///
    /// `token` is the current bearer credential; callers check for its
    /// presence before invoking this (an absent credential never reaches
    /// the network).
    fn fetch_conversation(
        &self,
        peer: &UserId,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, HistoryError>> + Send;
}

/// HTTP implementation of [`HistoryApi`].
///
/// Calls `GET {api_base}/chat-history/{peer}/` with a bearer header and
/// decodes the body as a JSON array of message records.
#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    http: reqwest::Client,
    api_base: Url,
}

impl HttpHistoryClient {
    /// Creates a client for the given API base URL.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error if the HTTP client cannot be
    /// constructed (TLS backend initialization, in practice).
    pub fn new(api_base: Url, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, api_base })
    }

    fn history_url(&self, peer: &UserId) -> Result<Url, HistoryError> {
        self.api_base
            .join(&format!("/chat-history/{peer}/"))
            .map_err(|e| HistoryError::Request(format!("bad history url: {e}")))
    }
}

impl HistoryApi for HttpHistoryClient {
    async fn fetch_conversation(
        &self,
        peer: &UserId,
        token: &str,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = self.history_url(peer)?;
        tracing::debug!(peer = %peer, url = %url, "fetching conversation history");

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HistoryError::Unauthorized);
        }
        if !status.is_success() {
            return Err(HistoryError::Request(format!("history GET: status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;
        let messages = codec::decode_history(&body)?;
        tracing::debug!(peer = %peer, count = messages.len(), "history fetched");
        Ok(messages)
    }
}
