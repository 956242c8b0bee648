//! Base URL selection across candidate servers

use std::sync::RwLock;
use std::time::Duration;

use crate::error::ClientError;
use crate::util::{is_http_url, non_blank};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Picks the first reachable base URL and caches it until invalidated
#[derive(Debug)]
pub struct EndpointResolver {
    candidates: Vec<String>,
    resolved: RwLock<Option<String>>,
}

impl EndpointResolver {
    pub fn new(candidates: impl IntoIterator<Item = String>) -> Result<Self, ClientError> {
        let candidates = candidates
            .into_iter()
            .map(normalize_base_url)
            .collect::<Result<Vec<_>, _>>()?;
        if candidates.is_empty() {
            return Err(ClientError::Configuration(
                "at least one API base URL is required".to_string(),
            ));
        }
        let resolved = (candidates.len() == 1).then(|| candidates[0].clone());
        Ok(Self {
            candidates,
            resolved: RwLock::new(resolved),
        })
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Cached base URL, if one has been resolved
    pub fn current(&self) -> Option<String> {
        self.resolved.read().ok().and_then(|resolved| resolved.clone())
    }

    /// Forget the cached choice after a transport-level failure
    pub fn invalidate(&self) {
        if self.candidates.len() == 1 {
            return;
        }
        if let Ok(mut resolved) = self.resolved.write() {
            if resolved.take().is_some() {
                tracing::debug!("Invalidated resolved API endpoint");
            }
        }
    }

    /// Return the cached base URL or probe the candidates in order.
    /// Any HTTP status below 500 counts as reachable.
    pub async fn resolve(&self, http: &reqwest::Client) -> Result<String, ClientError> {
        if let Some(url) = self.current() {
            return Ok(url);
        }

        for candidate in &self.candidates {
            let probe = http
                .get(format!("{candidate}/"))
                .timeout(PROBE_TIMEOUT)
                .send()
                .await;
            match probe {
                Ok(response) if response.status().as_u16() < 500 => {
                    tracing::info!(endpoint = %candidate, "Resolved API endpoint");
                    if let Ok(mut resolved) = self.resolved.write() {
                        *resolved = Some(candidate.clone());
                    }
                    return Ok(candidate.clone());
                }
                Ok(response) => {
                    tracing::debug!(endpoint = %candidate, status = response.status().as_u16(), "Endpoint unhealthy");
                }
                Err(error) => {
                    tracing::debug!(endpoint = %candidate, %error, "Endpoint unreachable");
                }
            }
        }

        Err(ClientError::Network(format!(
            "none of {} API endpoints is reachable",
            self.candidates.len()
        )))
    }
}

/// Trim, require an http(s) scheme and drop trailing slashes
pub fn normalize_base_url(raw: String) -> Result<String, ClientError> {
    let url = non_blank(&raw).ok_or_else(|| {
        ClientError::Configuration("API base URL must not be empty".to_string())
    })?;
    if is_http_url(url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(ClientError::Configuration(format!(
            "API base URL '{url}' must include http:// or https://"
        )))
    }
}
