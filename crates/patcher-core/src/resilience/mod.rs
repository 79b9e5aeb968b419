//! Resilient access to the reasoning backend.
//!
//! [`ResilientClient::complete`] wraps every outbound call with, in order:
//! - a TTL+LRU response cache (hits skip everything below)
//! - a three-state circuit breaker
//! - a token bucket plus per-minute/per-hour windows
//! - a per-call timeout
//! - retry with exponential backoff and jitter for transient failures
//! - JSON Schema validation with one corrective retry
//!
//! The limiter, breaker and cache each sit behind their own lock. Locks
//! are held only for the check-and-update, never across an await, so one
//! client can be cloned into any number of concurrent sessions.

pub mod backend;
pub mod cache;
pub mod circuit;
pub mod rate_limit;
pub mod retry;
pub mod schema;
pub mod stats;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub use backend::{
    BackendError, BackendErrorKind, BackendRequest, BackendResponse, Message, ReasoningBackend,
    ResponseSchema, Role, TokenUsage,
};
pub use cache::{CacheConfig, ResponseCache};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::RetryConfig;
pub use stats::ResilienceStats;

use crate::domain::{PatcherError, Result};
use stats::Counters;

/// What a caller wants when the rate limiter has no capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Wait for capacity, up to the configured maximum.
    #[default]
    Blocking,
    /// Fail immediately with `RateLimited`.
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub call_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            call_timeout_ms: 60_000,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Serialize)]
struct NormalizedRequest<'a> {
    model: Option<&'a str>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    schema: Option<&'a serde_json::Value>,
    messages: Vec<(Role, String)>,
}

/// Stable SHA-256 fingerprint of a request, insensitive to whitespace layout.
pub fn fingerprint(request: &BackendRequest) -> String {
    let normalized = NormalizedRequest {
        model: request.model.as_deref(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        schema: request.schema.as_ref().map(|s| &s.schema),
        messages: request
            .messages
            .iter()
            .map(|m| (m.role, m.content.split_whitespace().collect::<Vec<_>>().join(" ")))
            .collect(),
    };
    let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Why one attempt did not produce a response.
enum AttemptError {
    /// Rejected locally before reaching the backend. Never retried.
    Rejected(PatcherError),
    /// The backend call itself failed.
    Backend(PatcherError, Option<Duration>),
}

struct Shared<B> {
    backend: B,
    config: ResilienceConfig,
    limiter: Mutex<RateLimiter>,
    breaker: Mutex<CircuitBreaker>,
    cache: Mutex<ResponseCache>,
    counters: Counters,
}

/// Shared, lock-protected handle around a [`ReasoningBackend`].
pub struct ResilientClient<B> {
    inner: Arc<Shared<B>>,
}

impl<B> Clone for ResilientClient<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ReasoningBackend> ResilientClient<B> {
    pub fn new(backend: B, config: ResilienceConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Shared {
                limiter: Mutex::new(RateLimiter::new(config.rate_limit.clone(), now)),
                breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker.clone())),
                cache: Mutex::new(ResponseCache::new(&config.cache)),
                counters: Counters::default(),
                backend,
                config,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        lock(&self.inner.breaker).state(Instant::now())
    }

    pub fn stats(&self) -> ResilienceStats {
        let state = self.circuit_state();
        self.inner.counters.snapshot(state)
    }

    /// Send `request`, returning a validated response or a classified error.
    ///
    /// `cost_usd` on the result covers every backend call made on its
    /// behalf, including retries and the corrective attempt.
    pub async fn complete(&self, request: &BackendRequest, mode: CallMode) -> Result<BackendResponse> {
        let key = fingerprint(request);
        let hit = lock(&self.inner.cache).get(&key, Instant::now());
        if let Some(mut response) = hit {
            self.inner.counters.inc_cache_hit();
            tracing::debug!(key = &key[..12], "response served from cache");
            response.cached = true;
            response.cost_usd = 0.0;
            return Ok(response);
        }
        self.inner.counters.inc_cache_miss();

        let mut current = request.clone();
        let mut retries = 0u32;
        let mut corrected = false;
        let mut total_cost = 0.0;

        loop {
            let (err, retry_after) = match self.attempt(&current, mode).await {
                Ok(mut response) => {
                    total_cost += response.cost_usd;
                    let Some(schema) = current.schema.as_ref() else {
                        return Ok(self.finish(key, response, total_cost));
                    };
                    match schema::check(&schema.schema, &response.content) {
                        Ok(data) => {
                            response.data = Some(data);
                            return Ok(self.finish(key, response, total_cost));
                        }
                        Err(reason) if !corrected => {
                            corrected = true;
                            self.inner.counters.inc_schema_retry();
                            tracing::warn!(schema = %schema.name, %reason, "response failed validation, asking for a correction");
                            let instruction = schema::corrective_instruction(&schema.name, &reason);
                            current.messages.push(Message::assistant(response.content));
                            current.messages.push(Message::user(instruction));
                            continue;
                        }
                        Err(reason) => return Err(PatcherError::SchemaValidation(reason)),
                    }
                }
                Err(AttemptError::Rejected(err)) => return Err(err),
                Err(AttemptError::Backend(err, retry_after)) => {
                    if !err.is_transient() || retries >= self.inner.config.retry.max_retries {
                        return Err(err);
                    }
                    (err, retry_after)
                }
            };
            retries += 1;
            self.inner.counters.inc_retry();
            let delay = self.inner.config.retry.backoff(retries, retry_after);
            tracing::info!(attempt = retries, delay_ms = delay.as_millis() as u64, error = %err, "retrying backend call");
            tokio::time::sleep(delay).await;
        }
    }

    fn finish(&self, key: String, mut response: BackendResponse, total_cost: f64) -> BackendResponse {
        response.cached = false;
        response.cost_usd = total_cost;
        lock(&self.inner.cache).insert(key, response.clone(), Instant::now());
        response
    }

    async fn acquire_rate_slot(&self, mode: CallMode) -> std::result::Result<(), Duration> {
        let max_wait = Duration::from_millis(self.inner.config.rate_limit.max_wait_ms);
        let mut waited = Duration::ZERO;
        loop {
            let wait = match lock(&self.inner.limiter).try_acquire(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            if mode == CallMode::NonBlocking || waited.saturating_add(wait) > max_wait {
                return Err(wait);
            }
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting for capacity");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    async fn attempt(&self, request: &BackendRequest, mode: CallMode) -> std::result::Result<BackendResponse, AttemptError> {
        let permit = lock(&self.inner.breaker).try_acquire(Instant::now());
        let permit = match permit {
            Ok(permit) => BreakerPermit::new(&self.inner, permit),
            Err(_) => {
                self.inner.counters.inc_fail_fast();
                return Err(AttemptError::Rejected(PatcherError::CircuitOpen));
            }
        };

        if let Err(wait) = self.acquire_rate_slot(mode).await {
            permit.release();
            self.inner.counters.inc_rate_limited();
            return Err(AttemptError::Rejected(PatcherError::RateLimited {
                retry_after: Some(wait),
            }));
        }

        self.inner.counters.inc_backend_call();
        let timeout = Duration::from_millis(self.inner.config.call_timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.inner.backend.send(request)).await;

        match outcome {
            Ok(Ok(response)) => {
                permit.succeed();
                Ok(response)
            }
            Ok(Err(err)) => {
                if err.counts_against_circuit() {
                    permit.fail(self.inner.backend.name());
                } else {
                    permit.release();
                }
                let retry_after = err.retry_after;
                Err(AttemptError::Backend(err.into(), retry_after))
            }
            Err(_) => {
                permit.fail(self.inner.backend.name());
                Err(AttemptError::Backend(
                    PatcherError::TransientBackend(format!(
                        "{} call timed out after {}ms",
                        self.inner.backend.name(),
                        timeout.as_millis()
                    )),
                    None,
                ))
            }
        }
    }
}

/// Breaker admission held for the duration of one backend call.
///
/// A trial permit dropped without a verdict (the caller stopped polling
/// mid-call) counts as a failed trial, so the circuit reopens with a fresh
/// cool-down instead of staying half-open with its only trial slot taken.
struct BreakerPermit<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    counters: &'a Counters,
    permit: Option<Permit>,
}

impl<'a> BreakerPermit<'a> {
    fn new<B>(shared: &'a Shared<B>, permit: Permit) -> Self {
        Self {
            breaker: &shared.breaker,
            counters: &shared.counters,
            permit: Some(permit),
        }
    }

    fn succeed(mut self) {
        self.permit = None;
        lock(self.breaker).record_success();
    }

    fn fail(mut self, backend: &str) {
        self.permit = None;
        if self.open_on_failure() {
            tracing::warn!(backend, "circuit breaker opened");
        }
    }

    fn release(mut self) {
        if let Some(permit) = self.permit.take() {
            lock(self.breaker).release(permit);
        }
    }

    fn open_on_failure(&self) -> bool {
        let opened = lock(self.breaker).record_failure(Instant::now());
        if opened {
            self.counters.inc_circuit_opened();
        }
        opened
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.permit.take() == Some(Permit::Trial) && self.open_on_failure() {
            tracing::warn!("half-open trial abandoned, circuit reopened");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that replays scripted results and counts calls.
    struct Scripted {
        script: Mutex<VecDeque<std::result::Result<BackendResponse, BackendError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<std::result::Result<BackendResponse, BackendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReasoningBackend for Scripted {
        async fn send(&self, _request: &BackendRequest) -> std::result::Result<BackendResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or_else(|| Err(BackendError::transient("script exhausted")))
        }
    }

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                jitter: 0.0,
                ..RetryConfig::default()
            },
            ..ResilienceConfig::default()
        }
    }

    fn request(text: &str) -> BackendRequest {
        BackendRequest::new(vec![Message::system("fix tests"), Message::user(text)])
    }

    fn ok(text: &str) -> std::result::Result<BackendResponse, BackendError> {
        Ok(BackendResponse::text(text).with_cost(0.01))
    }

    #[test]
    fn test_fingerprint_ignores_whitespace_layout() {
        let a = request("name 'sqrt'   is\nnot defined");
        let b = request("name 'sqrt' is not defined");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        let c = request("name 'sqrt' is not defined").with_model("other");
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_backend_and_rate_limit() {
        let cfg = ResilienceConfig {
            rate_limit: RateLimitConfig {
                bucket_capacity: 1,
                refill_per_minute: 1,
                ..RateLimitConfig::default()
            },
            ..config()
        };
        let client = ResilientClient::new(Scripted::new(vec![ok("plan")]), cfg);

        let first = client.complete(&request("x"), CallMode::NonBlocking).await.expect("first");
        assert!(!first.cached);
        assert!((first.cost_usd - 0.01).abs() < 1e-9);

        // Bucket is empty now; a cache hit must still succeed.
        let second = client.complete(&request("x"), CallMode::NonBlocking).await.expect("cached");
        assert!(second.cached);
        assert_eq!(second.cost_usd, 0.0);
        assert_eq!(client.backend().calls(), 1);

        let stats = client.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));

        let err = client
            .complete(&request("y"), CallMode::NonBlocking)
            .await
            .expect_err("bucket empty");
        assert!(matches!(err, PatcherError::RateLimited { .. }));
        assert_eq!(client.stats().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_mode_waits_for_capacity() {
        let cfg = ResilienceConfig {
            rate_limit: RateLimitConfig {
                bucket_capacity: 1,
                refill_per_minute: 60,
                ..RateLimitConfig::default()
            },
            ..config()
        };
        let client = ResilientClient::new(Scripted::new(vec![ok("a"), ok("b")]), cfg);
        let start = Instant::now();
        client.complete(&request("1"), CallMode::Blocking).await.expect("first");
        client.complete(&request("2"), CallMode::Blocking).await.expect("second waits");
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(client.stats().rate_limited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let client = ResilientClient::new(
            Scripted::new(vec![
                Err(BackendError::transient("502")),
                Err(BackendError::rate_limited("429", Some(Duration::from_secs(5)))),
                ok("done"),
            ]),
            config(),
        );
        let start = Instant::now();
        let response = client.complete(&request("x"), CallMode::Blocking).await.expect("third try");
        assert_eq!(response.content, "done");
        assert_eq!(client.stats().retries, 2);
        // 1s backoff, then the 5s Retry-After hint beats the 2s backoff.
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_errors_are_not_retried() {
        let client = ResilientClient::new(
            Scripted::new(vec![Err(BackendError::auth("401")), ok("unreachable")]),
            config(),
        );
        let err = client.complete(&request("x"), CallMode::Blocking).await.expect_err("auth");
        assert!(matches!(err, PatcherError::Auth(_)));
        assert_eq!(client.backend().calls(), 1);
        assert_eq!(client.stats().retries, 0);
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust() {
        let cfg = ResilienceConfig {
            retry: RetryConfig {
                max_retries: 2,
                jitter: 0.0,
                ..RetryConfig::default()
            },
            ..config()
        };
        let client = ResilientClient::new(Scripted::new(vec![]), cfg);
        let err = client.complete(&request("x"), CallMode::Blocking).await.expect_err("exhausted");
        assert!(matches!(err, PatcherError::TransientBackend(_)));
        assert_eq!(client.backend().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_fails_fast_then_recovers() {
        let cfg = ResilienceConfig {
            retry: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            ..config()
        };
        let mut script: Vec<_> = (0..5).map(|_| Err(BackendError::transient("503"))).collect();
        script.push(ok("recovered"));
        let client = ResilientClient::new(Scripted::new(script), cfg);

        for i in 0..5 {
            let err = client
                .complete(&request(&format!("r{i}")), CallMode::Blocking)
                .await
                .expect_err("503");
            assert!(matches!(err, PatcherError::TransientBackend(_)));
        }
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let err = client.complete(&request("blocked"), CallMode::Blocking).await.expect_err("open");
        assert!(matches!(err, PatcherError::CircuitOpen));
        assert_eq!(client.backend().calls(), 5, "fail fast never reaches the backend");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(client.circuit_state(), CircuitState::HalfOpen);
        let response = client.complete(&request("trial"), CallMode::Blocking).await.expect("trial");
        assert_eq!(response.content, "recovered");
        assert_eq!(client.circuit_state(), CircuitState::Closed);

        let stats = client.stats();
        assert_eq!(stats.circuit_opened, 1);
        assert_eq!(stats.fail_fast, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient_and_counts_against_circuit() {
        let cfg = ResilienceConfig {
            call_timeout_ms: 100,
            retry: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_secs: 30,
            },
            ..config()
        };
        let mut backend = Scripted::new(vec![ok("slow")]);
        backend.delay = Duration::from_secs(1);
        let client = ResilientClient::new(backend, cfg);
        let err = client.complete(&request("x"), CallMode::Blocking).await.expect_err("timeout");
        assert!(matches!(err, PatcherError::TransientBackend(ref m) if m.contains("timed out")));
        assert_eq!(client.circuit_state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_reopens_circuit() {
        let cfg = ResilienceConfig {
            retry: RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown_secs: 30,
            },
            ..config()
        };
        let mut backend = Scripted::new(vec![Err(BackendError::transient("503")), ok("recovered")]);
        backend.delay = Duration::from_secs(5);
        let client = ResilientClient::new(backend, cfg);
        client.complete(&request("a"), CallMode::Blocking).await.expect_err("503");
        assert_eq!(client.circuit_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(client.circuit_state(), CircuitState::HalfOpen);
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            client.complete(&request("trial"), CallMode::Blocking),
        )
        .await;
        assert!(abandoned.is_err(), "caller gave up while the trial was in flight");
        assert_eq!(client.circuit_state(), CircuitState::Open);
        assert_eq!(client.stats().circuit_opened, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let response = client
            .complete(&request("again"), CallMode::Blocking)
            .await
            .expect("fresh trial after cool-down");
        assert_eq!(response.content, "recovered");
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_failure_gets_one_corrective_retry() {
        let schema = json!({"type": "object", "required": ["summary"]});
        let client = ResilientClient::new(
            Scripted::new(vec![ok("sure! the fix is easy"), ok("```json\n{\"summary\": \"add import\"}\n```")]),
            config(),
        );
        let req = request("plan").with_schema("fix_plan", schema.clone());
        let response = client.complete(&req, CallMode::Blocking).await.expect("corrected");
        assert_eq!(response.data, Some(json!({"summary": "add import"})));
        assert!((response.cost_usd - 0.02).abs() < 1e-9, "both calls are billed");
        assert_eq!(client.stats().schema_retries, 1);

        let client = ResilientClient::new(Scripted::new(vec![ok("{}"), ok("{\"other\": 1}")]), config());
        let req = request("plan").with_schema("fix_plan", schema);
        let err = client.complete(&req, CallMode::Blocking).await.expect_err("still invalid");
        assert!(matches!(err, PatcherError::SchemaValidation(_)));
        assert_eq!(client.backend().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_handle_across_tasks() {
        let script: Vec<_> = (0..8).map(|i| ok(&format!("r{i}"))).collect();
        let client = ResilientClient::new(Scripted::new(script), config());
        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.complete(&request(&format!("session {i}")), CallMode::Blocking).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("complete");
        }
        let stats = client.stats();
        assert_eq!(stats.backend_calls, 8);
        assert_eq!(stats.cache_misses, 8);
    }
}
