//! Load generator configuration
//!
//! Defaults are compiled in. An optional JSON scenario file (path in
//! `LOADGEN_CONFIG`, camelCase keys) is layered on top, then individual
//! environment variables.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{ForcedSequence, WeightOverrides};
use crate::lifecycle::Stage;
use crate::vu::naming;

/// Default backend code for "user not found" on first contact.
pub const DEFAULT_USER_NOT_FOUND_CODE: i64 = 1004;

/// Configuration errors, reported once at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main load generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Backend base URL, including trailing slash
    pub base_url: String,
    /// Sent as X-TU-Client-Version
    pub client_version: String,
    /// Sent as X-TU-Server-Version
    pub min_server_version: String,
    /// Sent as X-TU-OS-Version
    pub os_version: String,
    /// Index of this generator process among parallel tasks
    pub task_index: u32,
    /// Shared identifier of the test run across tasks
    pub test_id: Option<String>,
    /// Maximum concurrent VUs in this task
    pub vus_max: u32,
    /// Ramp stages; the last one is the ramp-down window
    pub stages: Vec<Stage>,
    /// Enables events, social and pvp screens
    pub play_async: bool,
    /// Replace VU 1 with a health monitor
    pub heartbeat: bool,
    /// Health endpoint polled by the heartbeat monitor, `<baseUrl>health`
    /// when unset
    pub health_url: Option<String>,
    /// Extra time after the last stage before in-flight VUs are cancelled
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Base seed for VU randomness; random when unset
    pub seed: Option<u64>,
    /// Randomize delays; when false every delay uses its minimum
    pub enable_delays: bool,
    /// Multiplier applied to every pacing delay
    pub delay_scale: f64,
    /// Re-draw bound for no-repeat and no-op outcomes
    pub max_action_retries: u32,
    /// Per-dispatcher weight overrides
    pub action_weights: WeightOverrides,
    /// newTab / settings / walletDetails shares of the menu bar weight
    pub menu_bar_shares: [f64; 3],
    /// Diagnostic forced sequence, `"<dispatcher>[?].<action>"`
    pub forced_actions: Vec<String>,
    /// Limit on joined hidden tournaments
    pub max_hidden_tournaments: usize,
    /// Special event templates known to this test
    pub events: Vec<EventTemplate>,
    #[serde(with = "humantime_serde")]
    pub matchmaking_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    pub retry: RetryConfig,
    pub auth: AuthConfig,
    pub error_codes: ErrorCodeConfig,
    /// Rejections that are part of normal flow and not counted as API errors
    pub expected_errors: Vec<ExpectedErrorConfig>,

    /// Prometheus exporter listen address
    pub metrics_listen: Option<SocketAddr>,
    /// Per-module log levels, `"*"` is the default
    pub log_levels: HashMap<String, String>,
}

/// Retry and backoff bounds for backend requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_min: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

/// Identity provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub endpoint: String,
    pub client_id: String,
    pub password: String,
    pub challenge_answer: String,
    /// Refresh the access token this long before it expires
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Abort the whole run on the first identity throttle
    pub abort_on_throttle: bool,
}

/// Backend application error codes the VUs react to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorCodeConfig {
    pub user_not_found: i64,
    pub user_already_matched: Option<i64>,
    pub rank_too_low: Option<i64>,
}

/// A (method, path, code) triple that is not counted as an API error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedErrorConfig {
    pub method: String,
    pub path: String,
    pub code: i64,
}

/// Special event template, matched against backend events by name and type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub is_hidden: bool,
    pub invite_code: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            client_version: "1.0.0".to_string(),
            min_server_version: "1.0.0".to_string(),
            os_version: "towerload".to_string(),
            task_index: 0,
            test_id: None,
            vus_max: 10,
            stages: vec![
                Stage::new(Duration::from_secs(5 * 60), 10),
                Stage::new(Duration::from_secs(30 * 60), 10),
                Stage::new(Duration::from_secs(5 * 60), 0),
            ],
            play_async: false,
            heartbeat: false,
            health_url: None,
            grace_period: Duration::from_secs(30),
            seed: None,
            enable_delays: true,
            delay_scale: 1.0,
            max_action_retries: 10,
            action_weights: WeightOverrides::new(),
            menu_bar_shares: [0.833_333_333_333_34, 0.1, 0.066_666_666_666_667],
            forced_actions: Vec::new(),
            max_hidden_tournaments: 2,
            events: Vec::new(),
            matchmaking_timeout: Duration::from_secs(180),
            request_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            auth: AuthConfig::default(),
            error_codes: ErrorCodeConfig::default(),
            expected_errors: vec![ExpectedErrorConfig {
                method: "POST".to_string(),
                path: "users/session_start".to_string(),
                code: DEFAULT_USER_NOT_FOUND_CODE,
            }],
            metrics_listen: None,
            log_levels: HashMap::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://cognito-idp.us-west-2.amazonaws.com/".to_string(),
            client_id: String::new(),
            password: "Password1!".to_string(),
            challenge_answer: "123456".to_string(),
            refresh_margin: Duration::from_secs(60),
            abort_on_throttle: true,
        }
    }
}

impl Default for ErrorCodeConfig {
    fn default() -> Self {
        Self {
            user_not_found: DEFAULT_USER_NOT_FOUND_CODE,
            user_already_matched: None,
            rank_too_low: None,
        }
    }
}

impl Config {
    /// Load configuration from `LOADGEN_CONFIG` (if set) and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("LOADGEN_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };

        if let Ok(url) = env::var("BASE_URL") {
            config.base_url = url;
        }
        if let Ok(val) = env::var("TASK_INDEX")
            && let Ok(v) = val.parse()
        {
            config.task_index = v;
        }
        if let Ok(id) = env::var("TEST_ID")
            && !id.is_empty()
        {
            config.test_id = Some(id);
        }
        if let Ok(val) = env::var("VUS_MAX")
            && let Ok(v) = val.parse()
        {
            config.vus_max = v;
        }
        if let Ok(val) = env::var("STAGES") {
            config.stages = parse_stages(&val)?;
        }
        if let Ok(val) = env::var("PLAY_ASYNC") {
            config.play_async = parse_flag(&val);
        }
        if let Ok(val) = env::var("HEARTBEAT") {
            config.heartbeat = parse_flag(&val);
        }
        if let Ok(url) = env::var("HEALTH_URL")
            && !url.is_empty()
        {
            config.health_url = Some(url);
        }
        if let Ok(val) = env::var("ENABLE_DELAYS") {
            config.enable_delays = parse_flag(&val);
        }
        if let Ok(val) = env::var("DELAY_SCALE")
            && let Ok(v) = val.parse()
        {
            config.delay_scale = v;
        }
        if let Ok(val) = env::var("SEED")
            && let Ok(v) = val.parse()
        {
            config.seed = Some(v);
        }
        if let Ok(val) = env::var("MAX_ACTION_RETRIES")
            && let Ok(v) = val.parse()
        {
            config.max_action_retries = v;
        }
        if let Ok(val) = env::var("FORCED_ACTIONS") {
            config.forced_actions = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(id) = env::var("IDP_CLIENT_ID") {
            config.auth.client_id = id;
        }
        if let Ok(url) = env::var("IDP_ENDPOINT") {
            config.auth.endpoint = url;
        }
        if let Ok(val) = env::var("METRICS_LISTEN")
            && let Ok(addr) = val.parse()
        {
            config.metrics_listen = Some(addr);
        }

        Ok(config)
    }

    /// Load a JSON scenario file; absent keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reject malformed values before any VU starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vus_max == 0 {
            return Err(ConfigError::Invalid("vusMax must be at least 1".into()));
        }
        let highest = naming::instance_number(self.task_index, self.vus_max, self.vus_max);
        if highest.is_none_or(|n| n >= naming::MAX_INSTANCES) {
            return Err(ConfigError::Invalid(format!(
                "taskIndex {} with vusMax {} exceeds the {} load-test identities",
                self.task_index,
                self.vus_max,
                naming::MAX_INSTANCES
            )));
        }
        if self.stages.len() < 3 {
            return Err(ConfigError::Invalid(format!(
                "at least 3 stages are required (ramp-up, steady, ramp-down), got {}",
                self.stages.len()
            )));
        }
        if self.stages.last().is_some_and(|s| s.duration.is_zero()) {
            return Err(ConfigError::Invalid(
                "the ramp-down stage must have a non-zero duration".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".into()));
        }
        if self.retry.backoff_min > self.retry.backoff_max {
            return Err(ConfigError::Invalid(format!(
                "retry.backoffMin ({:?}) exceeds retry.backoffMax ({:?})",
                self.retry.backoff_min, self.retry.backoff_max
            )));
        }
        if !self.delay_scale.is_finite() || self.delay_scale < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "delayScale must be a non-negative number, got {}",
                self.delay_scale
            )));
        }
        for (dispatcher, weights) in &self.action_weights {
            for (action, weight) in weights {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "actionWeights.{dispatcher}.{action} must be a non-negative number, got {weight}"
                    )));
                }
            }
        }
        if self.menu_bar_shares.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "menuBarShares must be non-negative, got {:?}",
                self.menu_bar_shares
            )));
        }
        let total: f64 = self.menu_bar_shares.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "menuBarShares must sum to 1, got {total}"
            )));
        }
        if !self.forced_actions.is_empty() {
            ForcedSequence::parse(&self.forced_actions)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn health_url(&self) -> String {
        self.health_url
            .clone()
            .unwrap_or_else(|| format!("{}health", self.base_url))
    }

    /// Tracing filter directive built from `logLevels`
    pub fn log_directive(&self) -> String {
        let default = self
            .log_levels
            .get("*")
            .map(|level| level.to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let mut directives = vec![format!("towerload={default}")];
        let mut modules: Vec<_> = self
            .log_levels
            .iter()
            .filter(|(module, _)| module.as_str() != "*")
            .collect();
        modules.sort();
        for (module, level) in modules {
            directives.push(format!(
                "towerload_loadgen::{module}={}",
                level.to_lowercase()
            ));
        }
        directives.insert(1, format!("towerload_loadgen={default}"));
        directives.join(",")
    }
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Parse `"5m:100,30m:100,5m:0"` into stages
pub fn parse_stages(val: &str) -> Result<Vec<Stage>, ConfigError> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|stage| {
            let (duration, target) = stage.split_once(':').ok_or_else(|| {
                ConfigError::Invalid(format!("stage '{stage}' must be <duration>:<target>"))
            })?;
            let duration = humantime::parse_duration(duration.trim()).map_err(|e| {
                ConfigError::Invalid(format!("stage '{stage}' has a bad duration: {e}"))
            })?;
            let target = target.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("stage '{stage}' has a bad target"))
            })?;
            Ok(Stage::new(duration, target))
        })
        .collect()
}
