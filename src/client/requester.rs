//! Rate-limit aware retrying requester.
//!
//! Epistemic foundation:
//! - K_i: Two nested budgets per logical request: general (transport
//!   failures) outside, throttled (quota exhaustion) inside
//! - K_i: The admission gate bounds in-flight requests; the permit is
//!   released on every return path
//! - I^B: Network and quota state unknowable → bounded sleep-and-retry
//! - I^B: Cancellation may arrive at any await → every call and sleep races it

use crate::client::{ApiRequest, Classified, RawResponse, RequestStats, Transport, classify};
use crate::models::{ExportError, RequesterConfig, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry ceilings and delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_general_retries: u32,
    /// Sleep before general retry `n` is `(1 + n) * general_retry_unit`
    pub general_retry_unit: Duration,
    pub max_throttled_retries: u32,
    pub throttle_cooldown: Duration,
}

impl From<&RequesterConfig> for RetryPolicy {
    fn from(config: &RequesterConfig) -> Self {
        Self {
            max_general_retries: config.max_general_retries,
            general_retry_unit: Duration::from_secs(config.general_retry_unit_secs),
            max_throttled_retries: config.max_throttled_retries,
            throttle_cooldown: Duration::from_secs(config.throttle_cooldown_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RequesterConfig::default())
    }
}

/// Retries consumed by one logical request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    pub general: u32,
    pub throttled: u32,
}

/// Issues requests through a [`Transport`] with retry, throttling and an
/// admission gate.
pub struct Requester {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: Arc<RequestStats>,
}

impl Requester {
    /// Create a requester with its own admission gate of `max_concurrency` permits.
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_gate(
            transport,
            policy,
            Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel,
        )
    }

    /// Create a requester sharing an existing admission gate.
    pub fn with_gate(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        gate: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            policy,
            gate,
            cancel,
            stats: Arc::new(RequestStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<RequestStats> {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Execute one logical request and return its JSON body.
    ///
    /// B_i(origin available) → Result
    /// I^B(quota) → sleep `throttle_cooldown`, at most `max_throttled_retries` times
    /// I^B(network) → sleep `(1 + n) * general_retry_unit`, at most `max_general_retries` times
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ExportError::Cancelled),
            permit = self.gate.acquire() => permit
                .map_err(|_| ExportError::Internal("admission gate closed".into()))?,
        };

        let mut budget = RetryBudget::default();
        loop {
            let err = match self.execute_throttled(request, &mut budget).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if budget.general >= self.policy.max_general_retries {
                return Err(ExportError::RetriesExhausted {
                    attempts: budget.general + 1,
                    last_error: err.to_string(),
                });
            }

            let delay = self.policy.general_retry_unit * (1 + budget.general);
            budget.general += 1;
            self.stats.record_retry();
            warn!(
                path = request.path(),
                error = %err,
                retry = budget.general,
                delay_secs = delay.as_secs(),
                "Request failed, retrying"
            );
            self.sleep(delay).await?;
        }
    }

    async fn execute_throttled(&self, request: &ApiRequest, budget: &mut RetryBudget) -> Result<Value> {
        loop {
            let response = self.send_once(request).await?;
            match classify(&response) {
                Classified::Success(value) => return Ok(value),
                Classified::Fatal(e) => {
                    debug!(path = request.path(), status = response.status, "Request failed");
                    return Err(e);
                }
                Classified::RateLimited => {
                    self.stats.record_throttled();
                    if budget.throttled >= self.policy.max_throttled_retries {
                        info!(body = %response.body, "Rate limited, no throttle retries left");
                        return Err(rate_limit_exhausted(budget.throttled + 1, response));
                    }
                    budget.throttled += 1;
                    warn!(
                        path = request.path(),
                        retry = budget.throttled,
                        cooldown_secs = self.policy.throttle_cooldown.as_secs(),
                        "Request throttled, quota likely used up; sleeping before retry"
                    );
                    self.sleep(self.policy.throttle_cooldown).await?;
                }
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<RawResponse> {
        self.stats.record_request();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExportError::Cancelled),
            response = self.transport.send(request) => response,
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExportError::Cancelled),
            _ = tokio::time::sleep(duration) => {
                self.stats.record_sleep(duration);
                Ok(())
            }
        }
    }
}

fn rate_limit_exhausted(attempts: u32, response: RawResponse) -> ExportError {
    ExportError::RateLimitExhausted {
        attempts,
        status: response.status,
        body: response.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted outcomes, repeating the last one forever.
    struct Scripted {
        script: Mutex<VecDeque<std::result::Result<RawResponse, &'static str>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<std::result::Result<RawResponse, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _request: &ApiRequest) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            match next {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(msg)) => Err(ExportError::Connection(msg.to_string())),
                None => Err(ExportError::Internal("empty script".into())),
            }
        }
    }

    fn ok(body: &str) -> std::result::Result<RawResponse, &'static str> {
        Ok(RawResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16, body: &str) -> std::result::Result<RawResponse, &'static str> {
        Ok(RawResponse {
            status: code,
            body: body.to_string(),
        })
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_general_retries: 2,
            general_retry_unit: Duration::ZERO,
            max_throttled_retries: 3,
            throttle_cooldown: Duration::ZERO,
        }
    }

    fn requester(transport: Arc<Scripted>) -> Requester {
        Requester::new(transport, instant_policy(), 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let t = Scripted::new(vec![ok(r#"{"data":1}"#)]);
        let value = requester(t.clone()).execute(&ApiRequest::get("/x")).await.unwrap();
        assert_eq!(value["data"], 1);
        assert_eq!(t.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_throttle_fails_after_ceiling() {
        let t = Scripted::new(vec![status(403, "please wait")]);
        let r = requester(t.clone());
        let err = r.execute(&ApiRequest::get("/x")).await.unwrap_err();

        assert_eq!(t.calls(), 4);
        match err {
            ExportError::RateLimitExhausted { attempts, status, body } => {
                assert_eq!(attempts, 4);
                assert_eq!(status, 403);
                assert_eq!(body, "please wait");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.stats().snapshot().throttled, 4);
    }

    #[tokio::test]
    async fn test_throttle_then_success() {
        let t = Scripted::new(vec![
            ok(r#"{"errors":[{"type":"RATE_LIMITED","message":"slow down"}]}"#),
            ok(r#"{"data":2}"#),
        ]);
        let value = requester(t.clone()).execute(&ApiRequest::get("/x")).await.unwrap();
        assert_eq!(value["data"], 2);
        assert_eq!(t.calls(), 2);
    }

    #[tokio::test]
    async fn test_general_retries_exhausted() {
        let t = Scripted::new(vec![Err("connection reset")]);
        let err = requester(t.clone()).execute(&ApiRequest::get("/x")).await.unwrap_err();
        assert_eq!(t.calls(), 3);
        assert!(matches!(err, ExportError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_transport_error_then_success() {
        let t = Scripted::new(vec![Err("reset"), ok("{}")]);
        requester(t.clone()).execute(&ApiRequest::get("/x")).await.unwrap();
        assert_eq!(t.calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_status_not_retried() {
        let t = Scripted::new(vec![status(500, "boom")]);
        let err = requester(t.clone()).execute(&ApiRequest::get("/x")).await.unwrap_err();
        assert_eq!(t.calls(), 1);
        assert!(matches!(err, ExportError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let t = Scripted::new(vec![ok("{}")]);
        let cancel = CancellationToken::new();
        let r = Requester::new(t.clone(), instant_policy(), 1, cancel.clone());
        cancel.cancel();
        let err = r.execute(&ApiRequest::get("/x")).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(t.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_cooldown() {
        let t = Scripted::new(vec![status(429, "")]);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            throttle_cooldown: Duration::from_secs(3600),
            ..instant_policy()
        };
        let r = Requester::new(t.clone(), policy, 1, cancel.clone());

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let err = r.execute(&ApiRequest::get("/x")).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(t.calls(), 1);
    }

    /// Tracks the highest number of simultaneous sends.
    struct Concurrency {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Concurrency {
        async fn send(&self, _request: &ApiRequest) -> Result<RawResponse> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(RawResponse {
                status: 200,
                body: "{}".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_admission_gate_limits_in_flight() {
        let t = Arc::new(Concurrency {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let r = Arc::new(Requester::new(t.clone(), instant_policy(), 1, CancellationToken::new()));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let r = Arc::clone(&r);
            set.spawn(async move { r.execute(&ApiRequest::get("/x")).await });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        assert_eq!(t.peak.load(Ordering::SeqCst), 1);
    }
}
