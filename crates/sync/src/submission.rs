//! Delivery of a single job and classification of the server's answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use wardsync_core::Job;

use crate::auth::TokenProvider;

pub const FHIR_JSON: &str = "application/fhir+json";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_BODY_SNIPPET: usize = 512;

/// Why a delivery is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RetryReason {
    Status(u16),
    Timeout,
    Network(String),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Status(status) => write!(f, "HTTP {status}"),
            RetryReason::Timeout => f.write_str("request timed out"),
            RetryReason::Network(err) => write!(f, "network error: {err}"),
        }
    }
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted (2xx).
    Success { status: u16 },
    /// The server already has this content (409/412); as good as delivered.
    DuplicateSkip { status: u16 },
    Retryable(RetryReason),
    /// No token, or the server rejected it (401/403).
    AuthExpired { status: Option<u16> },
    /// Rejected for good; retrying the same bytes will not help.
    Fatal { status: Option<u16>, body: String },
}

/// Map an HTTP status to an [`Outcome`].
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success { status },
        409 | 412 => Outcome::DuplicateSkip { status },
        408 | 429 | 500..=599 => Outcome::Retryable(RetryReason::Status(status)),
        401 | 403 => Outcome::AuthExpired { status: Some(status) },
        _ => Outcome::Fatal {
            status: Some(status),
            body: String::new(),
        },
    }
}

/// One delivery attempt of one job. No side effects beyond the network call.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, job: &Job) -> Outcome;
}

#[async_trait]
impl<T: Submitter + ?Sized> Submitter for Arc<T> {
    async fn submit(&self, job: &Job) -> Outcome {
        (**self).submit(job).await
    }
}

/// Posts job payloads as FHIR JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpSubmitter<T> {
    client: reqwest::Client,
    endpoint: String,
    tokens: T,
}

impl<T: TokenProvider> HttpSubmitter<T> {
    pub fn new(
        endpoint: impl Into<String>,
        tokens: T,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, tokens))
    }

    /// Use a preconfigured client (its timeout applies per request).
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>, tokens: T) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            tokens,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl<T: TokenProvider> Submitter for HttpSubmitter<T> {
    async fn submit(&self, job: &Job) -> Outcome {
        let Some(token) = self.tokens.get_token().await else {
            tracing::warn!(job_id = %job.id, "no access token, not sending");
            return Outcome::AuthExpired { status: None };
        };

        let body = match serde_json::to_vec(&job.payload) {
            Ok(body) => body,
            Err(err) => {
                return Outcome::Fatal {
                    status: None,
                    body: format!("failed to serialize payload: {err}"),
                };
            }
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header(ACCEPT, FHIR_JSON)
            .header(IDEMPOTENCY_KEY_HEADER, job.idempotency_key.as_str())
            .bearer_auth(token)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return classify_transport_error(&err),
        };

        let status = response.status().as_u16();
        tracing::debug!(job_id = %job.id, status, "bundle submitted");

        match classify_status(status) {
            Outcome::Fatal { status, .. } => Outcome::Fatal {
                status,
                body: read_snippet(response).await,
            },
            outcome => outcome,
        }
    }
}

fn classify_transport_error(err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        Outcome::Retryable(RetryReason::Timeout)
    } else if err.is_builder() {
        Outcome::Fatal {
            status: None,
            body: err.to_string(),
        }
    } else {
        Outcome::Retryable(RetryReason::Network(err.to_string()))
    }
}

// Reads at most `MAX_BODY_SNIPPET` bytes of the body; the rest is never buffered.
async fn read_snippet(mut response: reqwest::Response) -> String {
    let mut buf = Vec::with_capacity(MAX_BODY_SNIPPET);
    let mut truncated = false;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_BODY_SNIPPET - buf.len();
                if chunk.len() > room {
                    buf.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("failed to read error body: {err}");
                break;
            }
        }
    }
    snippet(&buf, truncated)
}

fn snippet(bytes: &[u8], truncated: bool) -> String {
    if !truncated {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    // Drop a multi-byte character cut in half by the limit.
    let end = match std::str::from_utf8(bytes) {
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        _ => bytes.len(),
    };
    format!("{}…", String::from_utf8_lossy(&bytes[..end]))
}
