//! Authenticated backend client with token refresh and bounded retry.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::identity::{IdentityError, IdentityProvider, TokenBundle};
use super::retry::{ErrorTally, RetryPolicy, Verdict, classify, tally};
use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use super::types::{ApiError, RequestResult};
use crate::config::{Config, ExpectedErrorConfig};
use crate::lifecycle::Pacer;
use crate::metrics::{self, MetricsSink};

/// A rejection that is part of normal flow and not counted as an API error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedError {
    pub method: Method,
    pub path: String,
    pub code: i64,
}

impl ExpectedError {
    fn from_config(config: &ExpectedErrorConfig) -> Option<Self> {
        let method = if config.method.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if config.method.eq_ignore_ascii_case("POST") {
            Method::Post
        } else {
            warn!("Ignoring expected error with unknown method {}", config.method);
            return None;
        };
        Some(Self {
            method,
            path: config.path.trim_start_matches('/').to_string(),
            code: config.code,
        })
    }

    fn matches(&self, method: Method, path: &str, code: Option<i64>) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.method == method && self.path == path && code == Some(self.code)
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    access_token: String,
    expires_at: Instant,
    refresh_token: Option<String>,
}

/// Static parts of every request, shared by all VUs of a run
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub client_version: String,
    pub server_version: String,
    pub os_version: String,
    pub policy: RetryPolicy,
    pub refresh_margin: Duration,
    pub expected: Vec<ExpectedError>,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            client_version: config.client_version.clone(),
            server_version: config.min_server_version.clone(),
            os_version: config.os_version.clone(),
            policy: RetryPolicy::from(&config.retry),
            refresh_margin: config.auth.refresh_margin,
            expected: config
                .expected_errors
                .iter()
                .filter_map(ExpectedError::from_config)
                .collect(),
        }
    }
}

/// Per-VU backend client.
///
/// Holds the VU's bearer token and refreshes it before expiry. Requests are
/// strictly sequential; `&mut self` on every call keeps one in flight.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    metrics: Arc<dyn MetricsSink>,
    pacer: Pacer,
    settings: Arc<ClientSettings>,
    device_id: String,
    username: Option<String>,
    credentials: Option<Credentials>,
    /// Retry backoff jitter
    rng: StdRng,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        metrics: Arc<dyn MetricsSink>,
        pacer: Pacer,
        settings: Arc<ClientSettings>,
        instance: u32,
    ) -> Self {
        Self {
            transport,
            identity,
            metrics,
            pacer,
            settings,
            device_id: device_id(instance),
            username: None,
            credentials: None,
            rng: StdRng::seed_from_u64(u64::from(instance)),
        }
    }

    /// Reseed the retry backoff jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Sign up (tolerating an existing account), then run the challenge flow.
    pub async fn auth(&mut self, username: &str) -> Result<(), IdentityError> {
        self.username = Some(username.to_string());
        self.credentials = None;
        match self.identity.sign_up(username).await {
            Ok(()) | Err(IdentityError::UsernameExists) => {}
            Err(IdentityError::Rejected(e)) if e.status == Some(400) => {
                debug!("Sign up rejected for {}: {}", username, e.message);
            }
            Err(e) => return Err(e),
        }
        let challenge = self.identity.initiate_auth(username).await?;
        let tokens = self.identity.respond_to_challenge(username, &challenge).await?;
        self.store(tokens);
        Ok(())
    }

    fn store(&mut self, tokens: TokenBundle) {
        let refresh_token = tokens
            .refresh_token
            .or_else(|| self.credentials.as_ref().and_then(|c| c.refresh_token.clone()));
        self.credentials = Some(Credentials {
            access_token: tokens.access_token,
            expires_at: Instant::now() + tokens.expires_in,
            refresh_token,
        });
    }

    /// Whether the token is within the refresh margin of expiring.
    pub fn needs_refresh(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| {
            c.refresh_token.is_some() && Instant::now() + self.settings.refresh_margin >= c.expires_at
        })
    }

    async fn refresh_if_needed(&mut self) -> Result<(), ApiError> {
        if !self.needs_refresh() {
            return Ok(());
        }
        let (Some(username), Some(refresh_token)) = (
            self.username.clone(),
            self.credentials.as_ref().and_then(|c| c.refresh_token.clone()),
        ) else {
            return Ok(());
        };
        warn!("Refreshing access token: {}", username);
        match self.identity.refresh(&username, &refresh_token).await {
            Ok(tokens) => {
                self.store(tokens);
                Ok(())
            }
            Err(e) => {
                if let Some(c) = self.credentials.as_mut() {
                    c.access_token.clear();
                }
                Err(e.to_api_error())
            }
        }
    }

    pub async fn get(&mut self, path: &str) -> RequestResult {
        self.execute(Method::Get, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized>(&mut self, path: &str, body: &B) -> RequestResult {
        match serde_json::to_string(body) {
            Ok(body) => self.execute(Method::Post, path, Some(body)).await,
            Err(e) => RequestResult::failed(ApiError::client(format!(
                "Failed to encode body for {path}: {e}"
            ))),
        }
    }

    async fn execute(&mut self, method: Method, path: &str, body: Option<String>) -> RequestResult {
        if let Err(e) = self.refresh_if_needed().await {
            return RequestResult::failed(e);
        }
        let url = format!("{}{}", self.settings.base_url, path);
        let max_attempts = self.settings.policy.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self.build_request(method, &url, body.clone());
            let response = self.transport.send(request.clone()).await;
            trace!("{} {} {:?}: {}", method, path, response.status, response.body);
            let result = RequestResult::from_response(&request, &response);
            self.record_errors(method, path, &response, &result);

            match classify(response.status) {
                Verdict::Success | Verdict::Rejected => return result,
                Verdict::Retry if attempt >= max_attempts => return result,
                Verdict::Retry => {
                    warn!(
                        "{} {} retrying after attempt {}/{}: {}",
                        method,
                        path,
                        attempt,
                        max_attempts,
                        result.message()
                    );
                    let (min, max) = self.settings.policy.backoff_secs();
                    if !self.pacer.delay_range(&mut self.rng, min, max).await {
                        return result;
                    }
                }
            }
        }
    }

    fn build_request(&self, method: Method, url: &str, body: Option<String>) -> HttpRequest {
        let token = self
            .credentials
            .as_ref()
            .map(|c| c.access_token.as_str())
            .unwrap_or("");
        let mut request = match body {
            Some(body) => HttpRequest::post(url, body).header("Content-Type", "application/json"),
            None => HttpRequest::get(url),
        };
        request.method = method;
        request
            .header("Authorization", format!("Bearer {token}"))
            .header("X-TU-device-Id", self.device_id.clone())
            .header("X-TU-Client-Version", self.settings.client_version.clone())
            .header("X-TU-Server-Version", self.settings.server_version.clone())
            .header("X-TU-OS-Version", self.settings.os_version.clone())
    }

    fn record_errors(&self, method: Method, path: &str, response: &HttpResponse, result: &RequestResult) {
        let tags = [("method", method.as_str().to_string())];
        match tally(response) {
            Some(ErrorTally::Api) => {
                let code = result.code();
                if self
                    .settings
                    .expected
                    .iter()
                    .any(|e| e.matches(method, path, code))
                {
                    debug!("{} {} returned expected error {:?}", method, path, code);
                } else {
                    self.metrics.counter(metrics::API_ERRORS, 1, &tags);
                }
            }
            Some(ErrorTally::Timeout) => self.metrics.counter(metrics::TIMEOUTS, 1, &tags),
            Some(ErrorTally::Network) => self.metrics.counter(metrics::NETWORK_ERRORS, 1, &tags),
            None => {}
        }
    }
}

/// Device id header value: the instance number in the low bits of a nil UUID.
pub fn device_id(instance: u32) -> String {
    Uuid::from_u128(u128::from(instance)).hyphenated().to_string()
}
