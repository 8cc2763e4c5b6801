//! Token-stamped HTTP dispatch with 401-triggered refresh and replay.
//!
//! Flow Overview:
//! 1) Every outbound request reads the token cache at send time and stamps
//!    `Authorization: Bearer <token>`; auth endpoints carry cookie
//!    credentials instead and are never stamped.
//! 2) A 401 on a non-auth request enters the renewal protocol: activity
//!    gate, single-flight refresh, then exactly one replay with the fresh
//!    token.
//! 3) A replay that fails again is terminal for that request; it never
//!    starts another refresh cycle.
//! 4) 403 and 503 responses force logout with `security_violation` and
//!    `maintenance` reasons; the response error itself is returned
//!    unchanged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use url::Url;

use super::refresh::{RefreshError, RefreshOutcome, TokenRefresher};
use super::tokens::AccessSession;
use super::{LogoutReason, SessionHandle};

/// Path prefix owned by the authentication endpoints (login, register,
/// refresh). Requests here rely on cookie credentials and never enter the
/// refresh protocol on their own 401/403.
const AUTH_PATH_PREFIX: &str = "v1/auth/";
/// Maximum number of error body characters surfaced to callers.
const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Request failed ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Request error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// HTTP status of the failing response, when there was one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Refresh endpoint response; the expiry is best-effort and may be absent.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_in: Option<u64>,
}

/// Production refresher: posts to the refresh endpoint, relying on the
/// cookie-based refresh credential carried by the shared client.
pub struct HttpTokenRefresher {
    client: Client,
    refresh_url: Url,
}

impl HttpTokenRefresher {
    /// # Errors
    /// Returns an error if the refresh URL cannot be parsed.
    pub fn new(client: Client, refresh_url: &str) -> Result<Self> {
        let refresh_url = Url::parse(refresh_url).context("invalid refresh URL")?;
        Ok(Self {
            client,
            refresh_url,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<AccessSession, RefreshError> {
        let response = self
            .client
            .post(self.refresh_url.clone())
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;
        let expires_at = body
            .expires_in
            .map(|seconds| Instant::now() + Duration::from_secs(seconds));
        Ok(AccessSession::new(SecretString::from(body.token), expires_at))
    }
}

/// Outer request layer owned by one composition root. Independent pipelines
/// (and their sessions) cannot cross-talk, so tests can run any number side
/// by side.
pub struct RequestPipeline {
    client: Client,
    base_url: Url,
    session: Arc<SessionHandle>,
    refresher: Arc<dyn TokenRefresher>,
}

impl RequestPipeline {
    /// # Errors
    /// Returns an error if the base URL cannot be parsed.
    pub fn new(
        client: Client,
        base_url: &str,
        session: Arc<SessionHandle>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid base URL")?;
        Ok(Self {
            client,
            base_url,
            session,
            refresher,
        })
    }

    /// # Errors
    /// Returns the original HTTP error of the failing response, or a
    /// transport error if the server was unreachable.
    pub async fn get(&self, path: &str) -> Result<Response, PipelineError> {
        self.execute(Method::GET, path, None).await
    }

    /// # Errors
    /// Returns the original HTTP error of the failing response, or a
    /// transport error if the server was unreachable.
    pub async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, PipelineError> {
        let payload = serde_json::to_value(body).map_err(|err| {
            PipelineError::Serialization(format!("Failed to encode request: {err}"))
        })?;
        self.execute(Method::POST, path, Some(payload)).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, PipelineError> {
        let auth_endpoint = is_auth_endpoint(path);
        let response = self
            .dispatch(method.clone(), path, body.as_ref(), !auth_endpoint)
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if auth_endpoint {
            return Err(http_error(response).await);
        }

        match status.as_u16() {
            401 => {
                let original = http_error(response).await;
                match self.session.renew(Arc::clone(&self.refresher)).await {
                    RefreshOutcome::Refreshed => {
                        let retry = self.dispatch(method, path, body.as_ref(), true).await?;
                        if retry.status().is_success() {
                            Ok(retry)
                        } else {
                            // One replay per request; a second failure is
                            // terminal and never starts another refresh
                            // cycle.
                            warn!(path, "Replayed request failed again");
                            Err(http_error(retry).await)
                        }
                    }
                    RefreshOutcome::SkippedInactive | RefreshOutcome::Failed(_) => Err(original),
                }
            }
            403 => {
                self.session
                    .force_logout(LogoutReason::SecurityViolation)
                    .await;
                Err(http_error(response).await)
            }
            503 => {
                self.session.force_logout(LogoutReason::Maintenance).await;
                Err(http_error(response).await)
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        stamp: bool,
    ) -> Result<Response, PipelineError> {
        let url = self.build_url(path);
        let mut request = self.client.request(method, url);
        if stamp {
            // Read at send time: a replay picks up the freshly issued token.
            if let Some(session) = self.session.tokens().get().await {
                request = request.bearer_auth(session.access_token().expose_secret());
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(map_transport_error)
    }

    fn build_url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/{}", path.trim_start_matches('/'))
    }
}

fn is_auth_endpoint(path: &str) -> bool {
    path.trim_start_matches('/').starts_with(AUTH_PATH_PREFIX)
}

fn map_transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout("Request timed out".to_string())
    } else {
        PipelineError::Network(format!("Unable to reach the server: {err}"))
    }
}

async fn http_error(response: Response) -> PipelineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PipelineError::Http {
        status,
        message: sanitize_body(body),
    }
}

fn sanitize_body(body: String) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Request failed.".to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{is_auth_endpoint, sanitize_body, PipelineError};

    #[test]
    fn auth_paths_are_detected_with_or_without_leading_slash() {
        assert!(is_auth_endpoint("/v1/auth/login"));
        assert!(is_auth_endpoint("v1/auth/refresh"));
        assert!(is_auth_endpoint("/v1/auth/register"));
        assert!(!is_auth_endpoint("/v1/patients"));
        assert!(!is_auth_endpoint("/v1/authors"));
    }

    #[test]
    fn sanitize_body_trims_and_truncates() {
        assert_eq!(sanitize_body(String::new()), "Request failed.");
        assert_eq!(sanitize_body("  denied \n".to_string()), "denied");
        let long = "x".repeat(500);
        assert_eq!(sanitize_body(long).len(), 200);
    }

    #[test]
    fn status_is_exposed_for_http_errors_only() {
        let http = PipelineError::Http {
            status: 401,
            message: "Unauthorized".to_string(),
        };
        assert_eq!(http.status(), Some(401));
        assert_eq!(PipelineError::Network("down".to_string()).status(), None);
    }
}
