//! Common Test Utilities for Integration Tests
//!
//! A scripted fake backend served by axum on an ephemeral port, and an
//! in-memory identity provider.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use towerload_loadgen::Config;
use towerload_loadgen::client::{AuthChallenge, IdentityError, IdentityProvider, TokenBundle};
use towerload_loadgen::lifecycle::Stage;

/// One request seen by the fake backend
#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    /// Path without the leading slash or query
    pub path: String,
    pub query: Option<String>,
    pub body: Value,
    pub authorization: Option<String>,
    pub device_id: Option<String>,
    pub target: Option<String>,
}

impl Hit {
    /// Username encoded in the fake identity's bearer token.
    pub fn username(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|a| a.strip_prefix("Bearer token-"))
    }
}

/// Status and JSON body for a hit
pub type Reply = (u16, Value);

pub type Script = Arc<dyn Fn(&Hit) -> Reply + Send + Sync>;

#[derive(Clone)]
struct BackendState {
    hits: Arc<Mutex<Vec<Hit>>>,
    script: Script,
}

/// Handle on a running fake backend
pub struct FakeBackend {
    pub url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl FakeBackend {
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.hits().iter().filter(|h| h.path == path).count()
    }

    pub fn hits_to(&self, path: &str) -> Vec<Hit> {
        self.hits().into_iter().filter(|h| h.path == path).collect()
    }
}

async fn record(
    State(state): State<BackendState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let hit = Hit {
        method: method.to_string(),
        path: uri.path().trim_start_matches('/').to_string(),
        query: uri.query().map(String::from),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        authorization: header("authorization"),
        device_id: header("x-tu-device-id"),
        target: header("x-amz-target"),
    };
    let (status, reply) = (state.script)(&hit);
    state.hits.lock().unwrap().push(hit);
    (
        StatusCode::from_u16(status).unwrap(),
        [("content-type", "application/json")],
        reply.to_string(),
    )
}

/// Serve `script` on an ephemeral local port.
pub async fn spawn_backend<F>(script: F) -> FakeBackend
where
    F: Fn(&Hit) -> Reply + Send + Sync + 'static,
{
    let hits = Arc::new(Mutex::new(Vec::new()));
    let state = BackendState {
        hits: hits.clone(),
        script: Arc::new(script),
    };
    let app = Router::new().fallback(record).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeBackend {
        url: format!("http://{addr}/"),
        hits,
    }
}

/// Base URL of a port nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}

pub fn ok(data: Value) -> Reply {
    (200, json!({ "data": data }))
}

pub fn app_error(status: u16, code: i64, msg: &str) -> Reply {
    (status, json!({ "error": { "code": code, "msg": msg } }))
}

/// User snapshot as the backend sends it.
pub fn user_payload(username: &str, activated: bool) -> Value {
    json!({
        "username": username,
        "phone": username,
        "account": 0.0,
        "secondaryAccount": 0.0,
        "rank": 1,
        "xp": 0.0,
        "inventory": [],
        "sessions": [],
        "inviteData": { "status": if activated { "playing" } else { "waiting" }, "invited": false },
        "available_games": {},
    })
}

/// Fast, deterministic run settings against `base_url`.
///
/// Two VUs over a sub-second ramp with every pacing delay scaled to zero.
pub fn test_config(base_url: &str) -> Config {
    let mut config = Config {
        base_url: base_url.to_string(),
        vus_max: 2,
        stages: vec![
            Stage::new(Duration::from_millis(200), 2),
            Stage::new(Duration::from_millis(300), 2),
            Stage::new(Duration::from_millis(300), 0),
        ],
        grace_period: Duration::from_millis(300),
        seed: Some(7),
        enable_delays: false,
        delay_scale: 0.0,
        request_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    config.retry.backoff_min = Duration::ZERO;
    config.retry.backoff_max = Duration::ZERO;
    config
}

/// Identity provider that accepts everyone.
///
/// Access tokens are `token-<username>` so the fake backend can tell VUs
/// apart.
#[derive(Debug, Default)]
pub struct FakeIdentity {
    pub sign_ups: AtomicUsize,
    pub refreshes: AtomicUsize,
    /// Lifetime of issued tokens; one hour when zero
    pub expires_in: Duration,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self, username: &str, refresh_token: Option<String>) -> TokenBundle {
        let expires_in = if self.expires_in.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.expires_in
        };
        TokenBundle {
            access_token: format!("token-{username}"),
            expires_in,
            refresh_token,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn sign_up(&self, _username: &str) -> Result<(), IdentityError> {
        self.sign_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn initiate_auth(&self, username: &str) -> Result<AuthChallenge, IdentityError> {
        Ok(AuthChallenge {
            session: format!("session-{username}"),
        })
    }

    async fn respond_to_challenge(
        &self,
        username: &str,
        _challenge: &AuthChallenge,
    ) -> Result<TokenBundle, IdentityError> {
        Ok(self.tokens(username, Some(format!("refresh-{username}"))))
    }

    async fn refresh(&self, username: &str, _refresh_token: &str) -> Result<TokenBundle, IdentityError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.tokens(username, None))
    }
}
