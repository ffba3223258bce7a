//! Resilient outbound HTTP.
//!
//! Every external call (LLM providers, the OCR vision model) goes through a
//! [`ResilientCaller`]: per-attempt timeout, retry with capped exponential
//! backoff and ±20% jitter, cancellation, default-header injection, and a
//! consecutive-failure circuit breaker. The wire itself sits behind the
//! [`HttpTransport`] trait so tests can script upstream behaviour.
//!
//! # Retry classification
//!
//! | Outcome | Retried | Counts against breaker |
//! |---------|---------|------------------------|
//! | network error, timeout | yes | yes, once retries are exhausted |
//! | HTTP 5xx, 429 | yes | yes, once retries are exhausted |
//! | HTTP 4xx (other) | no | no |
//! | cancellation | no | no |

use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Ask the upstream for an event stream; the body is still collected
    /// in full before returning.
    pub streaming: bool,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body.to_string().into_bytes()),
            streaming: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            streaming: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replaces any header of the same (case-insensitive) name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

/// One HTTP exchange, no retries.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("contract-lens/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Network(format!("bad method: {}", e)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.streaming {
            builder = builder.header("Accept", "text/event-stream");
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out")]
    Timeout,
    #[error("upstream returned HTTP {status}")]
    Http { status: u16, body: String },
    #[error("circuit open; upstream marked unavailable")]
    CircuitOpen,
    #[error("canceled")]
    Canceled,
}

impl CallError {
    /// Transient failures are retried; anything else is returned at once.
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::Network(_) | CallError::Timeout => true,
            CallError::Http { status, .. } => *status == 429 || *status >= 500,
            CallError::CircuitOpen | CallError::Canceled => false,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            CallError::Network(_) => "network_error",
            CallError::Timeout => "timeout",
            CallError::Http { .. } => "http_error",
            CallError::CircuitOpen => "circuit_open",
            CallError::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Relative jitter applied to each backoff interval.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_provider(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.retry_count,
            initial_interval: Duration::from_secs(config.retry_wait_time),
            max_interval: Duration::from_secs(config.retry_max_interval),
            timeout: Duration::from_secs(config.timeout),
            jitter: 0.2,
        }
    }

    /// `min(max_interval, initial_interval · 2^n)` before jitter.
    pub fn base_interval(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32);
        let scaled = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_interval(retry).as_secs_f64();
        let jitter = self.jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl BreakerPolicy {
    pub fn from_provider(config: &ProviderConfig) -> Self {
        Self {
            failure_threshold: config.breaker_threshold.max(1),
            open_duration: Duration::from_secs(config.breaker_open_secs),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure breaker. Once open it rejects calls until
/// `open_until`, then admits a single trial call.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn admit(&self) -> Result<Admission, CallError> {
        let mut state = self.state.lock().map_err(|_| CallError::CircuitOpen)?;
        match state.open_until {
            None => Ok(Admission::Closed),
            Some(until) if Instant::now() < until => Err(CallError::CircuitOpen),
            Some(_) if state.trial_in_flight => Err(CallError::CircuitOpen),
            Some(_) => {
                state.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    fn record_success(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = BreakerState::default();
        }
    }

    fn record_failure(&self, admission: Admission) {
        if let Ok(mut state) = self.state.lock() {
            state.trial_in_flight = false;
            state.failure_count += 1;
            if admission == Admission::Trial || state.failure_count >= self.policy.failure_threshold
            {
                state.open_until = Some(Instant::now() + self.policy.open_duration);
            }
        }
    }

    fn release(&self, admission: Admission) {
        if admission == Admission::Trial {
            if let Ok(mut state) = self.state.lock() {
                state.trial_in_flight = false;
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.open_until.is_some_and(|until| Instant::now() < until))
            .unwrap_or(true)
    }
}

/// Retrying, timing-out, breaker-gated caller for one upstream target.
pub struct ResilientCaller {
    target: String,
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    default_headers: Vec<(String, String)>,
    metrics: Arc<Metrics>,
}

impl ResilientCaller {
    pub fn new(
        target: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        retry: RetryPolicy,
        breaker: BreakerPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            target: target.into(),
            transport,
            retry,
            breaker: CircuitBreaker::new(breaker),
            default_headers: Vec::new(),
            metrics,
        }
    }

    /// Headers added to every request unless the request already sets them.
    pub fn with_default_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub async fn call(
        &self,
        cancel: &CancellationToken,
        mut request: HttpRequest,
    ) -> Result<HttpResponse, CallError> {
        let started = Instant::now();
        let admission = match self.breaker.admit() {
            Ok(a) => a,
            Err(e) => {
                self.record(&Err(e.outcome()), started);
                return Err(e);
            }
        };

        for (name, value) in &self.default_headers {
            if !request.has_header(name) {
                request.set_header(name, value);
            }
        }

        let result = self.attempt_all(cancel, &request).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            // The upstream answered; a permanent rejection says nothing about
            // its availability.
            Err(e @ CallError::Http { .. }) if !e.is_transient() => self.breaker.record_success(),
            Err(CallError::Canceled) => self.breaker.release(admission),
            Err(_) => self.breaker.record_failure(admission),
        }

        self.record(&result.as_ref().map(|_| ()).map_err(|e| e.outcome()), started);
        result
    }

    async fn attempt_all(
        &self,
        cancel: &CancellationToken,
        request: &HttpRequest,
    ) -> Result<HttpResponse, CallError> {
        let mut retry = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CallError::Canceled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Canceled),
                r = tokio::time::timeout(self.retry.timeout, self.transport.send(request)) => r,
            };

            let err = match outcome {
                Ok(Ok(response)) if response.status < 400 => return Ok(response),
                Ok(Ok(response)) => CallError::Http {
                    status: response.status,
                    body: response.body,
                },
                Ok(Err(TransportError::Timeout)) | Err(_) => CallError::Timeout,
                Ok(Err(TransportError::Network(msg))) => CallError::Network(msg),
            };

            if !err.is_transient() || retry >= self.retry.max_retries {
                return Err(err);
            }

            let wait = self.retry.backoff(retry);
            tracing::warn!(
                target_name = %self.target,
                attempt = retry + 1,
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "upstream call failed, retrying"
            );
            retry += 1;

            tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn record(&self, outcome: &Result<(), &'static str>, started: Instant) {
        let outcome = match outcome {
            Ok(()) => "success",
            Err(o) => o,
        };
        self.metrics.incr(
            "http_client_requests_total",
            &[("target", &self.target), ("outcome", outcome)],
        );
        self.metrics.observe(
            "http_client_request_duration_seconds",
            &[("target", &self.target)],
            started.elapsed(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: AtomicUsize,
        seen_headers: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                seen_headers: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_headers
                .lock()
                .unwrap()
                .push(request.headers.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(200)))
        }
    }

    fn status(code: u16) -> HttpResponse {
        HttpResponse {
            status: code,
            body: format!("status {}", code),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            timeout: Duration::from_secs(5),
            jitter: 0.2,
        }
    }

    fn caller(transport: Arc<Scripted>, retries: u32, threshold: u32) -> ResilientCaller {
        ResilientCaller::new(
            "test",
            transport,
            fast_retry(retries),
            BreakerPolicy {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(60),
            },
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_interval(0), Duration::from_secs(1));
        assert_eq!(policy.base_interval(1), Duration::from_secs(2));
        assert_eq!(policy.base_interval(3), Duration::from_secs(8));
        assert_eq!(policy.base_interval(4), Duration::from_secs(10));
        assert_eq!(policy.base_interval(60), Duration::from_secs(10));
        for n in 0..6 {
            let d = policy.backoff(n).as_secs_f64();
            let base = policy.base_interval(n).as_secs_f64();
            assert!(d >= base * 0.8 - 1e-9 && d <= base * 1.2 + 1e-9);
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let transport = Scripted::new(vec![
            Err(TransportError::Network("reset".into())),
            Ok(status(503)),
            Ok(status(429)),
            Ok(status(200)),
        ]);
        let c = caller(transport.clone(), 3, 5);
        let resp = c
            .call(&CancellationToken::new(), HttpRequest::get("http://x"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let transport = Scripted::new(vec![Ok(status(500)); 10]);
        let c = caller(transport.clone(), 2, 50);
        let err = c
            .call(&CancellationToken::new(), HttpRequest::get("http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Http { status: 500, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Scripted::new(vec![Ok(status(400)), Ok(status(200))]);
        let c = caller(transport.clone(), 3, 5);
        let err = c
            .call(&CancellationToken::new(), HttpRequest::get("http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Http { status: 400, .. }));
        assert!(!err.is_transient());
        assert_eq!(transport.calls(), 1);
        assert!(!c.breaker_open());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold() {
        let transport = Scripted::new(vec![Ok(status(502)); 10]);
        let c = caller(transport.clone(), 0, 2);
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let _ = c.call(&cancel, HttpRequest::get("http://x")).await;
        }
        assert!(c.breaker_open());
        let err = c
            .call(&cancel, HttpRequest::get("http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn canceled_token_short_circuits() {
        let transport = Scripted::new(vec![]);
        let c = caller(transport.clone(), 3, 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c
            .call(&cancel, HttpRequest::get("http://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Canceled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn default_headers_do_not_override_request_headers() {
        let transport = Scripted::new(vec![]);
        let c = caller(transport.clone(), 0, 5)
            .with_default_header("X-Title", "contract-lens")
            .with_default_header("Authorization", "Bearer default");
        let req = HttpRequest::get("http://x").header("Authorization", "Bearer mine");
        c.call(&CancellationToken::new(), req).await.unwrap();
        let seen = transport.seen_headers.lock().unwrap()[0].clone();
        assert!(seen.contains(&("X-Title".to_string(), "contract-lens".to_string())));
        assert!(seen.contains(&("Authorization".to_string(), "Bearer mine".to_string())));
        assert!(!seen.contains(&("Authorization".to_string(), "Bearer default".to_string())));
    }
}
