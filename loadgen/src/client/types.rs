//! Uniform request result and error shapes.

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::transport::{HttpRequest, HttpResponse, Method, TransportFailure};
use crate::config::ErrorCodeConfig;
use crate::dispatch::ActionOutcome;

/// Where a failed request went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failure, no status
    Network,
    /// Request timed out, no status
    Timeout,
    /// Non-2xx status without an application code
    Http,
    /// Backend rejected the request with an application code
    Application,
    /// Raised on this side without contacting the backend
    Client,
}

/// Error half of a [`RequestResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub code: Option<i64>,
    pub message: String,
    pub method: Option<Method>,
    pub url: Option<String>,
    /// `x-amz-target` of an identity provider call
    pub target: Option<String>,
    /// `__type` of an identity provider error body
    pub type_name: Option<String>,
}

impl ApiError {
    /// An error detected locally, e.g. no user loaded yet.
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Client,
            status: None,
            code: None,
            message: message.into(),
            method: None,
            url: None,
            target: None,
            type_name: None,
        }
    }

    /// Unattributable or client side errors end the VU.
    ///
    /// Transport failures that outlived their retries are ordinary errors.
    pub fn is_fatal(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Timeout => false,
            _ => self.status.is_none() || self.code.is_none(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API error!")?;
        if let (Some(method), Some(url)) = (self.method, &self.url) {
            write!(f, " {method} {url}")?;
        }
        if let Some(target) = &self.target {
            write!(f, " (target={target})")?;
        }
        match (self.status, self.code) {
            (Some(status), Some(code)) => write!(f, " {status} {code}")?,
            (Some(status), None) => write!(f, " {status}")?,
            (None, Some(code)) => write!(f, " code {code}")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Parsed response body plus an optional error.
///
/// Transport success with an application error body still carries an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestResult {
    pub body: Value,
    pub error: Option<ApiError>,
}

impl RequestResult {
    pub fn ok(body: Value) -> Self {
        Self { body, error: None }
    }

    pub fn failed(error: ApiError) -> Self {
        Self {
            body: Value::Null,
            error: Some(error),
        }
    }

    /// Shape a raw response.
    pub fn from_response(request: &HttpRequest, response: &HttpResponse) -> Self {
        let trimmed = response.body.trim_start();
        let mut body = Value::Null;
        let mut parse_error = None;
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            match serde_json::from_str(trimmed) {
                Ok(json) => body = json,
                Err(e) => parse_error = Some(format!("Malformed response body: {e}")),
            }
        }

        let error_obj = body.get("error").filter(|e| e.is_object());
        let mut code = error_obj.and_then(|e| e.get("code")).and_then(Value::as_i64);
        let mut message = error_obj
            .and_then(|e| e.get("msg").or_else(|| e.get("message")))
            .and_then(Value::as_str)
            .map(String::from);
        let mut has_error = error_obj.is_some();
        let mut status = None;

        if let Some(failure) = &response.failure {
            has_error = true;
            message = Some(failure.to_string());
            code = Some(failure.code());
        }
        if let Some(s) = response.status
            && !(200..300).contains(&s)
        {
            has_error = true;
            status = Some(s);
            if message.is_none() {
                message = Some(format!("HTTP status {s}"));
            }
        }
        if !has_error && let Some(e) = parse_error {
            has_error = true;
            message = Some(e);
        }
        // Identity provider errors carry their type at the top level
        let type_name = body.get("__type").and_then(Value::as_str).map(String::from);
        if !has_error {
            return Self::ok(body);
        }

        let kind = match (&response.failure, status, code) {
            (Some(TransportFailure::Timeout(_)), ..) => ErrorKind::Timeout,
            (Some(TransportFailure::Connection(_)), ..) => ErrorKind::Network,
            (None, _, Some(_)) => ErrorKind::Application,
            (None, Some(_), None) => ErrorKind::Http,
            (None, None, None) => ErrorKind::Client,
        };
        let error = ApiError {
            kind,
            status,
            code,
            message: message.unwrap_or_else(|| "Unknown error".to_string()),
            method: Some(request.method),
            url: Some(request.url.clone()),
            target: request.header_value("x-amz-target").map(String::from),
            type_name,
        };
        Self {
            body,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(ApiError::is_fatal)
    }

    pub fn status(&self) -> Option<u16> {
        self.error.as_ref().and_then(|e| e.status)
    }

    pub fn code(&self) -> Option<i64> {
        self.error.as_ref().and_then(|e| e.code)
    }

    pub fn message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }

    /// The `data` payload, if present and not null.
    pub fn data(&self) -> Option<&Value> {
        self.body.get("data").filter(|d| !d.is_null())
    }

    /// Deserialize `data`, `None` when absent or of the wrong shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data().and_then(|d| T::deserialize(d).ok())
    }

    /// Fatal error ends the VU, any other error is handled, otherwise continue.
    pub fn to_outcome(&self) -> ActionOutcome {
        match &self.error {
            Some(e) if e.is_fatal() => ActionOutcome::FatalAbort,
            Some(_) => ActionOutcome::HandledError,
            None => ActionOutcome::Continue,
        }
    }

    /// Only a fatal error changes the flow.
    pub fn ok_or_fatal(&self) -> ActionOutcome {
        if self.is_fatal() {
            ActionOutcome::FatalAbort
        } else {
            ActionOutcome::Continue
        }
    }

    /// Like [`Self::ok_or_fatal`], but leaves the screen when `draw < back_chance`.
    pub fn ok_or_back(&self, back_chance: f64, draw: f64) -> ActionOutcome {
        if self.is_fatal() {
            ActionOutcome::FatalAbort
        } else if draw < back_chance {
            ActionOutcome::LeaveScreen
        } else {
            ActionOutcome::Continue
        }
    }
}

/// Typed application error codes the simulation reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    UserNotFound,
    UserAlreadyMatched,
    RankTooLow,
    Other(i64),
    /// No code and no recognizable message
    Unknown,
}

const ALREADY_MATCHED_PREFIX: &str = "User is already matched.";
const RANK_TOO_LOW_PREFIX: &str = "User rank is too low";

/// Maps backend error codes to [`AppErrorCode`].
///
/// Codes the backend contract does not pin down fall back to message prefixes.
#[derive(Debug, Clone)]
pub struct ErrorCatalog {
    user_not_found: i64,
    user_already_matched: Option<i64>,
    rank_too_low: Option<i64>,
}

impl ErrorCatalog {
    pub fn new(codes: &ErrorCodeConfig) -> Self {
        Self {
            user_not_found: codes.user_not_found,
            user_already_matched: codes.user_already_matched,
            rank_too_low: codes.rank_too_low,
        }
    }

    pub fn user_not_found(&self) -> i64 {
        self.user_not_found
    }

    pub fn classify(&self, error: &ApiError) -> AppErrorCode {
        if let Some(code) = error.code {
            if code == self.user_not_found {
                return AppErrorCode::UserNotFound;
            }
            if self.user_already_matched == Some(code) {
                return AppErrorCode::UserAlreadyMatched;
            }
            if self.rank_too_low == Some(code) {
                return AppErrorCode::RankTooLow;
            }
        }
        if self.user_already_matched.is_none() && error.message.starts_with(ALREADY_MATCHED_PREFIX) {
            return AppErrorCode::UserAlreadyMatched;
        }
        if self.rank_too_low.is_none() && error.message.starts_with(RANK_TOO_LOW_PREFIX) {
            return AppErrorCode::RankTooLow;
        }
        error.code.map_or(AppErrorCode::Unknown, AppErrorCode::Other)
    }

    /// Classification of a result's error, `None` on success.
    pub fn classify_result(&self, result: &RequestResult) -> Option<AppErrorCode> {
        result.error.as_ref().map(|e| self.classify(e))
    }
}

impl Default for ErrorCatalog {
    fn default() -> Self {
        Self::new(&ErrorCodeConfig::default())
    }
}
