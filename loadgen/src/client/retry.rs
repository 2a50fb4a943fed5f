//! Retry policy and response classification

use std::time::Duration;

use crate::config::RetryConfig;

use super::transport::HttpResponse;

/// Bounded retry with a jittered pause between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max.max(config.backoff_min),
        }
    }
}

impl RetryPolicy {
    /// Backoff bounds in seconds, as taken by the pacer.
    pub fn backoff_secs(&self) -> (f64, f64) {
        (self.backoff_min.as_secs_f64(), self.backoff_max.as_secs_f64())
    }
}

/// What to do with one attempt's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Definitive rejection, returned to the caller as is
    Rejected,
    Retry,
}

/// Only a missing status or a server error is worth another attempt.
pub fn classify(status: Option<u16>) -> Verdict {
    match status {
        None => Verdict::Retry,
        Some(s) if (200..300).contains(&s) => Verdict::Success,
        Some(s) if s >= 500 => Verdict::Retry,
        Some(_) => Verdict::Rejected,
    }
}

/// Error counter an attempt contributes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTally {
    Timeout,
    Network,
    Api,
}

/// Status below 200 or in [300, 502) is an API error; 502 and above is
/// counted with connection failures as a network error.
pub fn tally(response: &HttpResponse) -> Option<ErrorTally> {
    match response.status {
        None if response.is_timeout() => Some(ErrorTally::Timeout),
        None => Some(ErrorTally::Network),
        Some(s) if s < 200 || (300..502).contains(&s) => Some(ErrorTally::Api),
        Some(s) if s >= 502 => Some(ErrorTally::Network),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::TransportFailure;

    #[test]
    fn test_classify() {
        assert_eq!(classify(None), Verdict::Retry);
        assert_eq!(classify(Some(200)), Verdict::Success);
        assert_eq!(classify(Some(204)), Verdict::Success);
        assert_eq!(classify(Some(302)), Verdict::Rejected);
        assert_eq!(classify(Some(404)), Verdict::Rejected);
        assert_eq!(classify(Some(500)), Verdict::Retry);
        assert_eq!(classify(Some(503)), Verdict::Retry);
    }

    #[test]
    fn test_tally() {
        assert_eq!(
            tally(&HttpResponse::failed(TransportFailure::Timeout("t".into()))),
            Some(ErrorTally::Timeout)
        );
        assert_eq!(
            tally(&HttpResponse::failed(TransportFailure::Connection("refused".into()))),
            Some(ErrorTally::Network)
        );
        assert_eq!(tally(&HttpResponse::new(200, "")), None);
        assert_eq!(tally(&HttpResponse::new(400, "")), Some(ErrorTally::Api));
        assert_eq!(tally(&HttpResponse::new(501, "")), Some(ErrorTally::Api));
        assert_eq!(tally(&HttpResponse::new(503, "")), Some(ErrorTally::Network));
    }

    #[test]
    fn test_policy_from_config_clamps() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(1),
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_secs(), (2.0, 2.0));
    }
}
