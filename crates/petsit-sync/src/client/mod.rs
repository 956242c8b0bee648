//! REST client for the PetSit Connect API.
//!
//! Every response is a JSON envelope `{success: bool, ...}`. A `success:
//! false` body or a 4xx status is a rejection; 5xx statuses, timeouts and
//! connection failures are transient network errors.

mod auth;
mod endpoint;
mod retry;

pub use auth::{AuthProvider, StaticToken};
pub use endpoint::{normalize_base_url, EndpointResolver};
pub use retry::RetryPolicy;

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::ClientError;
use crate::util::compact_text;

pub struct ApiClient {
    http: reqwest::Client,
    endpoints: EndpointResolver,
    auth: Arc<dyn AuthProvider>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoints", &self.endpoints)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(config: &SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, ClientError> {
        let endpoints = EndpointResolver::new(config.api_base_urls.iter().cloned())?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| {
                ClientError::Configuration(format!("failed to build HTTP client: {error}"))
            })?;
        Ok(Self {
            http,
            endpoints,
            auth,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub const fn endpoints(&self) -> &EndpointResolver {
        &self.endpoints
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// GET `path`; retried on transient failures
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ClientError> {
        self.execute(Method::GET, path, query, None).await
    }

    /// POST `path` with a JSON body; retried only when the connection could
    /// not be established
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, ClientError> {
        let body = serde_json::to_value(body).map_err(|error| {
            ClientError::Configuration(format!("request body is not serializable: {error}"))
        })?;
        self.execute(Method::POST, path, &[], Some(&body)).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let idempotent = method == Method::GET;
        let mut attempt = 0;
        let mut refreshed = false;

        loop {
            attempt += 1;
            let base = self.endpoints.resolve(&self.http).await?;
            let mut request = self
                .http
                .request(method.clone(), format!("{base}{path}"))
                .header(reqwest::header::ACCEPT, "application/json");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(token) = self.auth.token() {
                request = request.bearer_auth(token);
            }

            let outcome = match request.send().await {
                Err(error) => {
                    let never_sent = error.is_connect();
                    let failure = ClientError::from(error);
                    if failure.is_retryable() {
                        self.endpoints.invalidate();
                    }
                    (failure, idempotent || never_sent)
                }
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        refreshed = true;
                        if self.auth.refresh().await?.is_some() {
                            tracing::debug!(%path, "Retrying after token refresh");
                            attempt -= 1;
                            continue;
                        }
                    }
                    match read_envelope(response).await {
                        Ok(value) => return Ok(value),
                        Err(failure) => {
                            let retryable = idempotent && failure.is_retryable();
                            (failure, retryable)
                        }
                    }
                }
            };

            let (failure, retryable) = outcome;
            if !retryable || !self.retry.allows_another(attempt) {
                if failure.is_retryable() {
                    tracing::warn!(%method, %path, attempt, error = %failure, "API request failed");
                }
                return Err(failure);
            }
            let delay = self.retry.delay_after(attempt);
            tracing::debug!(%method, %path, attempt, ?delay, error = %failure, "Retrying API request");
            tokio::time::sleep(delay).await;
        }
    }
}

async fn read_envelope(response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_server_error() {
        return Err(ClientError::Network(parse_api_error(status, &body)));
    }
    if !status.is_success() {
        return Err(ClientError::Rejected {
            status: Some(status.as_u16()),
            message: parse_api_error(status, &body),
        });
    }

    let value: Value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body).map_err(|error| ClientError::Rejected {
            status: Some(status.as_u16()),
            message: format!("malformed response body: {error}"),
        })?
    };
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(ClientError::Rejected {
            status: Some(status.as_u16()),
            message: envelope_message(&value).unwrap_or_else(|| "request was not successful".to_string()),
        });
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn envelope_message(value: &Value) -> Option<String> {
    let body = ApiErrorBody::deserialize(value).ok()?;
    body.message
        .or(body.error)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        if let Some(message) = envelope_message(&payload) {
            return format!("{message} ({})", status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}
