use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::refresh::{RefreshCoordinator, RefreshTicket};
use super::transport::{ApiRequest, ApiResponse, HttpTransport};
use super::{Notice, SessionStore};
use crate::error::{AuthError, GatewayError, NetworkError};

const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Automatic retries for idempotent requests
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Timeout of the first attempt; attempt `n` gets `n` times this
    pub base_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(4000),
            base_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `min(max, base * retry^2)`
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(retry.saturating_mul(retry))
            .min(self.max_delay)
    }

    /// Timeout for the zero-based `attempt`
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.base_timeout.saturating_mul(attempt + 1)
    }
}

#[derive(Debug, Deserialize)]
struct TokenPair {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// The single path for every call to the remote API: retries with backoff,
/// failover to alternate base URLs, and single-flight credential refresh.
pub struct RequestGateway {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    fallback_urls: Vec<String>,
    policy: RetryPolicy,
    session: SessionStore,
    refresh: RefreshCoordinator,
    notice_tx: mpsc::UnboundedSender<Notice>,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &str,
        session: SessionStore,
        notice_tx: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback_urls: Vec::new(),
            policy: RetryPolicy::default(),
            session,
            refresh: RefreshCoordinator::new(),
            notice_tx,
        }
    }

    pub fn with_fallbacks(mut self, fallback_urls: Vec<String>) -> Self {
        self.fallback_urls = fallback_urls;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        let bearer = if request.authenticated {
            self.session.access_token().await
        } else {
            None
        };

        let response = self.dispatch(&mut request, bearer.as_deref()).await?;

        if response.status == 401 && request.authenticated && !request.auth_retried {
            let token = self.refreshed_credential(bearer.as_deref()).await?;
            request.auth_retried = true;
            debug!(path = %request.path, "Replaying request with refreshed credential");
            let replayed = self.dispatch(&mut request, Some(&token)).await?;
            return into_result(replayed);
        }

        into_result(response)
    }

    /// Send and parse a JSON body in one step
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, GatewayError> {
        self.send(request).await?.json()
    }

    async fn dispatch(
        &self,
        request: &mut ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, NetworkError> {
        match self.send_with_retry(&self.base_url, request, bearer).await {
            Err(err)
                if err.is_no_response()
                    && !request.failover_attempted
                    && !self.fallback_urls.is_empty() =>
            {
                request.failover_attempted = true;
                self.failover(request, bearer, err).await
            }
            outcome => outcome,
        }
    }

    async fn send_with_retry(
        &self,
        base_url: &str,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, NetworkError> {
        let max_retries = request.max_retries.unwrap_or(if request.is_idempotent() {
            self.policy.max_retries
        } else {
            0
        });

        let mut attempt = 0;
        loop {
            let timeout = self.policy.timeout_for(attempt);
            let outcome = self
                .transport
                .execute(base_url, request, bearer, timeout)
                .await;

            let retryable = match &outcome {
                Ok(response) => NetworkError::RETRYABLE_STATUSES.contains(&response.status),
                Err(err) => err.is_retryable(),
            };
            if !retryable || attempt >= max_retries {
                return outcome;
            }

            attempt += 1;
            let delay = self.policy.backoff(attempt);
            debug!(
                path = %request.path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn failover(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
        primary_error: NetworkError,
    ) -> Result<ApiResponse, NetworkError> {
        warn!(path = %request.path, error = %primary_error, "Primary endpoint unreachable, trying alternates");

        let mut last_error = primary_error;
        for base_url in &self.fallback_urls {
            let timeout = self.policy.timeout_for(0);
            match self.transport.execute(base_url, request, bearer, timeout).await {
                Ok(response) => {
                    info!(base_url = %base_url, "Alternate endpoint answered");
                    let _ = self
                        .notice_tx
                        .send(Notice::Status(format!("Primary server unreachable, using {}", base_url)));
                    return Ok(response);
                }
                Err(err) => {
                    warn!(base_url = %base_url, error = %err, "Alternate endpoint unreachable");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Obtain a credential newer than `stale`, refreshing at most once for
    /// any number of concurrent callers.
    async fn refreshed_credential(&self, stale: Option<&str>) -> Result<String, AuthError> {
        match self.session.access_token().await {
            // Someone else already rotated the credential since this request went out
            Some(current) if Some(current.as_str()) != stale => return Ok(current),
            // A failed refresh already cleared the session and told the user
            None if stale.is_some() => return Err(AuthError::SignedOut),
            _ => {}
        }

        match self.refresh.acquire() {
            RefreshTicket::Waiter(rx) => rx.await.unwrap_or(Err(AuthError::Interrupted)),
            RefreshTicket::Leader(guard) => {
                let outcome = self.perform_refresh().await;
                let queued = guard.release(outcome.clone());
                match &outcome {
                    Ok(_) => info!(queued, "Credential refreshed"),
                    Err(err) => {
                        warn!(queued, error = %err, "Credential refresh failed, signing out");
                        self.session.clear().await;
                        let _ = self.notice_tx.send(Notice::SessionExpired);
                    }
                }
                outcome
            }
        }
    }

    async fn perform_refresh(&self) -> Result<String, AuthError> {
        let refresh_token = self
            .session
            .refresh_token()
            .await
            .ok_or(AuthError::MissingRefreshToken)?;

        let mut request =
            ApiRequest::post(REFRESH_PATH, json!({ "refresh_token": refresh_token })).unauthenticated();
        let response = self
            .dispatch(&mut request, None)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        if !response.is_success() {
            return Err(AuthError::Rejected(response.status));
        }

        let tokens: TokenPair = response
            .json()
            .map_err(|e| AuthError::Refresh(e.to_string()))?;
        self.session
            .update_tokens(&tokens.access_token, tokens.refresh_token.as_deref())
            .await;

        Ok(tokens.access_token)
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, GatewayError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(NetworkError::Status {
            status: response.status,
            body: response.text(),
        }
        .into())
    }
}
