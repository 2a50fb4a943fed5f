//! HTTP transport seam.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// HTTP methods the backend uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: String) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Failure below the HTTP layer: no usable status was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("Timeout")]
    Timeout(String),
    #[error("{0}")]
    Connection(String),
}

/// Error code reported for a timed out request
pub const TIMEOUT_CODE: i64 = 1211;
/// Error code reported for any other connection failure
pub const CONNECTION_CODE: i64 = 1200;

impl TransportFailure {
    pub fn code(&self) -> i64 {
        match self {
            Self::Timeout(_) => TIMEOUT_CODE,
            Self::Connection(_) => CONNECTION_CODE,
        }
    }
}

/// Raw response. `status` is `None` when `failure` is set.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: Option<u16>,
    pub body: String,
    pub failure: Option<TransportFailure>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
            failure: None,
        }
    }

    pub fn failed(failure: TransportFailure) -> Self {
        Self {
            status: None,
            body: String::new(),
            failure: Some(failure),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, Some(TransportFailure::Timeout(_)))
    }
}

/// Sends one HTTP request. Never retries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> HttpResponse;
}

/// `reqwest` backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return HttpResponse::failed(map_error(&e)),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => HttpResponse::new(status, body),
            Err(e) => HttpResponse::failed(map_error(&e)),
        }
    }
}

fn map_error(e: &reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout(e.to_string())
    } else {
        TransportFailure::Connection(e.to_string())
    }
}
