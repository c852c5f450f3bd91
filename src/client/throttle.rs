//! Response classification and request accounting.
//!
//! Epistemic foundation:
//! - K_i: A 403 mentioning "wait", a 429, or a `RATE_LIMITED` GraphQL error
//!   means the hourly quota is used up
//! - K_i: Every other non-2xx status is fatal
//! - I^B: Quota windows are unknowable → fixed cooldown then retry

use crate::client::RawResponse;
use crate::models::ExportError;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of one HTTP exchange.
#[derive(Debug)]
pub enum Classified {
    /// Usable JSON body
    Success(Value),
    /// Quota exhausted, worth sleeping and retrying
    RateLimited,
    /// Never retried
    Fatal(ExportError),
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorsBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Sort a response into success, rate limiting or a fatal error.
pub fn classify(response: &RawResponse) -> Classified {
    let status = response.status;
    let body = &response.body;

    if !(200..300).contains(&status) {
        if status == 429 || (status == 403 && body.contains("wait")) {
            return Classified::RateLimited;
        }

        if status == 401 {
            if let Ok(parsed) = serde_json::from_str::<MessageBody>(body) {
                if !parsed.message.is_empty() {
                    return Classified::Fatal(ExportError::AuthenticationFailed {
                        status,
                        message: parsed.message,
                    });
                }
            }
        }

        return Classified::Fatal(ExportError::HttpStatus {
            status,
            body: body.clone(),
        });
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return Classified::Fatal(ExportError::Parse(format!(
                "response is not valid JSON: {e}"
            )));
        }
    };

    // GraphQL origins report quota and query failures inside a 200.
    if let Ok(ErrorsBody { errors }) = serde_json::from_value::<ErrorsBody>(value.clone()) {
        if let Some(first) = errors.into_iter().next() {
            if first.kind == "RATE_LIMITED" {
                return Classified::RateLimited;
            }
            return Classified::Fatal(ExportError::Api {
                kind: first.kind,
                message: first.message,
            });
        }
    }

    Classified::Success(value)
}

/// Request counters shared by every call of a requester.
#[derive(Debug, Default)]
pub struct RequestStats {
    total_requests: AtomicU64,
    throttled: AtomicU64,
    retries: AtomicU64,
    slept_ms: AtomicU64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sleep(&self, slept: Duration) {
        self.slept_ms
            .fetch_add(slept.as_millis() as u64, Ordering::Relaxed);
    }

    /// Get statistics.
    pub fn snapshot(&self) -> RequestStatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let throttled = self.throttled.load(Ordering::Relaxed);

        RequestStatsSnapshot {
            total_requests,
            throttled,
            retries: self.retries.load(Ordering::Relaxed),
            total_sleep_secs: self.slept_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            throttle_ratio: if total_requests > 0 {
                throttled as f64 / total_requests as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time copy of [`RequestStats`].
#[derive(Debug, Clone)]
pub struct RequestStatsSnapshot {
    pub total_requests: u64,
    pub throttled: u64,
    pub retries: u64,
    pub total_sleep_secs: f64,
    pub throttle_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_rate_limit_signals() {
        assert!(matches!(
            classify(&resp(403, "You have triggered an abuse detection mechanism. Please wait a few minutes")),
            Classified::RateLimited
        ));
        assert!(matches!(classify(&resp(429, "")), Classified::RateLimited));
        assert!(matches!(
            classify(&resp(200, r#"{"errors":[{"type":"RATE_LIMITED","message":"API rate limit exceeded"}]}"#)),
            Classified::RateLimited
        ));
    }

    #[test]
    fn test_forbidden_without_wait_is_fatal() {
        match classify(&resp(403, "forbidden")) {
            Classified::Fatal(ExportError::HttpStatus { status, .. }) => assert_eq!(status, 403),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unauthorized() {
        assert!(matches!(
            classify(&resp(401, r#"{"message":"Bad credentials"}"#)),
            Classified::Fatal(ExportError::AuthenticationFailed { .. })
        ));
        assert!(matches!(
            classify(&resp(401, "")),
            Classified::Fatal(ExportError::HttpStatus { status: 401, .. })
        ));
    }

    #[test]
    fn test_graphql_error_is_fatal_api_error() {
        match classify(&resp(200, r#"{"errors":[{"type":"NOT_FOUND","message":"no repo"}]}"#)) {
            Classified::Fatal(ExportError::Api { kind, message }) => {
                assert_eq!(kind, "NOT_FOUND");
                assert_eq!(message, "no repo");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_success_and_invalid_json() {
        assert!(matches!(
            classify(&resp(200, r#"{"data":{"x":1},"errors":[]}"#)),
            Classified::Success(_)
        ));
        assert!(matches!(
            classify(&resp(200, "[1,2]")),
            Classified::Success(_)
        ));
        assert!(matches!(
            classify(&resp(200, "<html>")),
            Classified::Fatal(ExportError::Parse(_))
        ));
    }

    #[test]
    fn test_stats_ratio() {
        let stats = RequestStats::new();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_throttled();
        stats.record_sleep(Duration::from_millis(1500));
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 4);
        assert!((snap.throttle_ratio - 0.25).abs() < f64::EPSILON);
        assert!((snap.total_sleep_secs - 1.5).abs() < f64::EPSILON);
    }
}
