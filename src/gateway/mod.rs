//! Sole egress point to the e-commerce backend.
//!
//! Every outbound call goes through [`Gateway::call`], which enforces a
//! per-call timeout, bounded retry with exponential backoff for transport
//! failures, a circuit breaker per endpoint, and an optional client-side
//! rate limit. Failures are returned as typed [`GatewayFailure`] values;
//! the dispatcher decides recovery policy.

pub mod circuit;
pub mod http;
pub mod limiter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;

pub use circuit::{CircuitBreaker, CircuitState, Permit};
pub use http::HttpBackend;
pub use limiter::RateLimiter;

/// Typed operations the backend exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetProduct,
    GetCart,
    ListOrders,
    UpdateOrderState,
    SendNotification,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetProduct => "get_product",
            Self::GetCart => "get_cart",
            Self::ListOrders => "list_orders",
            Self::UpdateOrderState => "update_order_state",
            Self::SendNotification => "send_notification",
        }
    }

    /// Backend endpoint group; one circuit breaker per endpoint
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::GetProduct => "products",
            Self::GetCart => "cart",
            Self::ListOrders | Self::UpdateOrderState => "orders",
            Self::SendNotification => "notifications",
        }
    }

    /// Whether the call changes backend state
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::UpdateOrderState | Self::SendNotification)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCall {
    pub operation: Operation,

    /// Structured parameters (ids, new state, message body)
    pub params: serde_json::Value,

    /// Overrides the configured per-call timeout
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Forwarded to the backend so repeated mutations are not applied twice
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl GatewayCall {
    pub fn new(operation: Operation, params: serde_json::Value) -> Self {
        Self {
            operation,
            params,
            timeout: None,
            idempotency_key: None,
        }
    }

    pub fn get_product(product_id: &str) -> Self {
        Self::new(
            Operation::GetProduct,
            serde_json::json!({ "product_id": product_id }),
        )
    }

    pub fn get_cart(user_id: &str) -> Self {
        Self::new(Operation::GetCart, serde_json::json!({ "user_id": user_id }))
    }

    pub fn list_orders(resource_id: &str) -> Self {
        Self::new(
            Operation::ListOrders,
            serde_json::json!({ "resource_id": resource_id }),
        )
    }

    pub fn update_order_state(order_id: &str, state: &str, details: serde_json::Value) -> Self {
        Self::new(
            Operation::UpdateOrderState,
            serde_json::json!({ "order_id": order_id, "state": state, "details": details }),
        )
    }

    pub fn send_notification(recipient: &str, subject: &str, body: &str) -> Self {
        Self::new(
            Operation::SendNotification,
            serde_json::json!({ "recipient": recipient, "subject": subject, "body": body }),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Read a mandatory string parameter; absence is a bad request
    pub fn required_str(&self, key: &str) -> Result<&str, GatewayFailure> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayFailure::Rejected {
                operation: self.operation,
                status: None,
                reason: format!("missing parameter '{}'", key),
            })
    }
}

/// Successful backend response
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub operation: Operation,
    pub data: serde_json::Value,
    pub latency: Duration,
    pub attempts: u32,
}

/// Typed failure of a gateway call
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum GatewayFailure {
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: Operation, elapsed_ms: u64 },

    #[error("{operation} rate limited")]
    RateLimited {
        operation: Operation,
        retry_after_ms: Option<u64>,
    },

    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: Operation,
        status: Option<u16>,
        reason: String,
    },

    #[error("{operation} unavailable: {reason}")]
    Unavailable {
        operation: Operation,
        reason: String,
        circuit_open: bool,
    },
}

impl GatewayFailure {
    /// Transient failures may succeed later; permanent ones never will
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Retried inside the gateway (timeouts and unreachable endpoints only)
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Unavailable { circuit_open, .. } => !circuit_open,
            _ => false,
        }
    }

    /// Counts against the endpoint's circuit breaker
    fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { circuit_open: false, .. }
        )
    }

    /// Short outcome label for logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

/// Result of a gateway call
pub type GatewayResult = Result<GatewayResponse, GatewayFailure>;

/// Transport to the external backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Perform one attempt of a call
    async fn execute(&self, call: &GatewayCall) -> Result<serde_json::Value, GatewayFailure>;
}

/// Gateway tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-call timeout in milliseconds (default: 5s)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Retry policy for timeouts and unavailable endpoints
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Consecutive failures before an endpoint's breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting a probe
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    /// Outbound call rate limit (unlimited when absent)
    #[serde(default)]
    pub rate_limit_per_second: Option<f64>,
}

fn default_base_url() -> String {
    "http://frontend:80/api".to_string()
}
fn default_call_timeout() -> u64 {
    5000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            call_timeout_ms: default_call_timeout(),
            retry: RetryPolicy::default(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
            rate_limit_per_second: None,
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Reject values the gateway cannot honour
    pub fn validate(&self) -> Result<(), String> {
        match self.rate_limit_per_second {
            Some(rate) if !limiter::is_valid_rate(rate) => Err(format!(
                "rate_limit_per_second must be a positive number, got {}",
                rate
            )),
            _ => Ok(()),
        }
    }
}

/// Policy-enforcing mediator for all backend calls
pub struct Gateway {
    backend: Arc<dyn Backend>,
    config: GatewayConfig,
    breakers: DashMap<&'static str, Arc<CircuitBreaker>>,
    limiter: Option<RateLimiter>,
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>, config: GatewayConfig) -> Self {
        let limiter = config.rate_limit_per_second.and_then(RateLimiter::new);
        Self {
            backend,
            config,
            breakers: DashMap::new(),
            limiter,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn breaker(&self, endpoint: &'static str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    endpoint,
                    self.config.failure_threshold,
                    self.config.cooldown(),
                ))
            })
            .clone()
    }

    /// Breaker state for an endpoint (closed if never used)
    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.breakers
            .get(endpoint)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Execute a call with timeout, retry, breaker and rate limit
    pub async fn call(&self, call: GatewayCall) -> GatewayResult {
        let operation = call.operation;
        let endpoint = operation.endpoint();
        let timeout = call.timeout.unwrap_or_else(|| self.config.call_timeout());
        let breaker = self.breaker(endpoint);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Some(limiter) = &self.limiter {
                if let Err(wait) = limiter.acquire(timeout).await {
                    warn!(
                        %operation,
                        endpoint,
                        wait_ms = wait.as_millis() as u64,
                        outcome = "rate_limited",
                        "Gateway call throttled locally"
                    );
                    return Err(GatewayFailure::RateLimited {
                        operation,
                        retry_after_ms: Some(wait.as_millis() as u64),
                    });
                }
            }

            let Some(permit) = breaker.try_acquire() else {
                warn!(%operation, endpoint, attempt, outcome = "circuit_open", "Gateway call short-circuited");
                return Err(GatewayFailure::Unavailable {
                    operation,
                    reason: format!("circuit open for endpoint '{}'", endpoint),
                    circuit_open: true,
                });
            };

            let attempt_start = Instant::now();
            let result = match tokio::time::timeout(timeout, self.backend.execute(&call)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayFailure::Timeout {
                    operation,
                    elapsed_ms: timeout.as_millis() as u64,
                }),
            };
            let latency_ms = attempt_start.elapsed().as_millis() as u64;

            match result {
                Ok(data) => {
                    permit.succeeded();
                    info!(%operation, endpoint, attempt, latency_ms, outcome = "ok", "Gateway call");
                    return Ok(GatewayResponse {
                        operation,
                        data,
                        latency: started.elapsed(),
                        attempts: attempt,
                    });
                }
                Err(failure) => {
                    if failure.trips_breaker() {
                        permit.failed();
                    } else {
                        permit.succeeded();
                    }

                    warn!(
                        %operation,
                        endpoint,
                        attempt,
                        latency_ms,
                        outcome = failure.code(),
                        error = %failure,
                        "Gateway call failed"
                    );

                    if failure.is_retryable() && self.config.retry.should_retry(attempt) {
                        let delay = self.config.retry.delay_for_attempt(attempt);
                        debug!(%operation, attempt, delay_ms = delay.as_millis() as u64, "Retrying gateway call");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(failure);
                }
            }
        }
    }

    pub async fn get_product(&self, product_id: &str) -> GatewayResult {
        self.call(GatewayCall::get_product(product_id)).await
    }

    pub async fn get_cart(&self, user_id: &str) -> GatewayResult {
        self.call(GatewayCall::get_cart(user_id)).await
    }

    pub async fn list_orders(&self, resource_id: &str) -> GatewayResult {
        self.call(GatewayCall::list_orders(resource_id)).await
    }

    pub async fn update_order_state(
        &self,
        order_id: &str,
        state: &str,
        details: serde_json::Value,
    ) -> GatewayResult {
        self.call(GatewayCall::update_order_state(order_id, state, details))
            .await
    }

    pub async fn send_notification(&self, recipient: &str, subject: &str, body: &str) -> GatewayResult {
        self.call(GatewayCall::send_notification(recipient, subject, body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that replays a fixed script of outcomes, then succeeds
    struct ScriptedBackend {
        script: parking_lot::Mutex<Vec<GatewayFailure>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(mut script: Vec<GatewayFailure>) -> Self {
            script.reverse();
            Self {
                script: parking_lot::Mutex::new(script),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _call: &GatewayCall) -> Result<serde_json::Value, GatewayFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop() {
                Some(failure) => Err(failure),
                None => Ok(serde_json::json!({"ok": true})),
            }
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn unavailable() -> GatewayFailure {
        GatewayFailure::Unavailable {
            operation: Operation::ListOrders,
            reason: "connection refused".to_string(),
            circuit_open: false,
        }
    }

    #[tokio::test]
    async fn test_retries_unavailable_then_succeeds() {
        let backend = Arc::new(ScriptedBackend::new(vec![unavailable(), unavailable()]));
        let gateway = Gateway::new(backend.clone(), fast_config());

        let response = gateway.list_orders("order-1").await.unwrap();
        assert_eq!(response.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_retries_rejected() {
        let rejected = GatewayFailure::Rejected {
            operation: Operation::UpdateOrderState,
            status: Some(422),
            reason: "order already shipped".to_string(),
        };
        let backend = Arc::new(ScriptedBackend::new(vec![rejected.clone()]));
        let gateway = Gateway::new(backend.clone(), fast_config());

        let result = gateway
            .update_order_state("order-1", "rerouted", serde_json::json!({}))
            .await;
        assert_eq!(result, Err(rejected));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.circuit_state("orders"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let backend = Arc::new(ScriptedBackend::new(vec![unavailable(); 10]));
        let config = GatewayConfig {
            failure_threshold: 5,
            ..fast_config()
        };
        let gateway = Gateway::new(backend.clone(), config);

        // 3 attempts, then 2 more: five consecutive failures open the breaker
        assert!(gateway.list_orders("order-1").await.is_err());
        let second = gateway.list_orders("order-1").await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            second,
            Err(GatewayFailure::Unavailable { circuit_open: true, .. })
        ));
        assert_eq!(gateway.circuit_state("orders"), CircuitState::Open);

        let third = gateway.list_orders("order-1").await;
        assert!(matches!(
            third,
            Err(GatewayFailure::Unavailable { circuit_open: true, .. })
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);

        // Other endpoints are unaffected
        assert_eq!(gateway.circuit_state("products"), CircuitState::Closed);
    }

    /// Fails once, hangs on the second call, then answers
    #[derive(Default)]
    struct StallingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for StallingBackend {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn execute(&self, _call: &GatewayCall) -> Result<serde_json::Value, GatewayFailure> {
            match self.calls.fetch_add(1, Ordering::SeqCst) + 1 {
                1 => Err(unavailable()),
                2 => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!({}))
                }
                _ => Ok(serde_json::json!({"orders": []})),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_does_not_wedge_breaker() {
        let backend = Arc::new(StallingBackend::default());
        let config = GatewayConfig {
            failure_threshold: 1,
            cooldown_ms: 10,
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let gateway = Gateway::new(backend.clone(), config);

        assert!(gateway.list_orders("order-1").await.is_err());
        assert_eq!(gateway.circuit_state("orders"), CircuitState::Open);

        // Half-open probe whose caller gives up mid-request
        tokio::time::sleep(Duration::from_millis(20)).await;
        let dropped = tokio::time::timeout(Duration::from_millis(5), gateway.list_orders("order-1")).await;
        assert!(dropped.is_err());
        assert_eq!(gateway.circuit_state("orders"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = gateway.list_orders("order-1").await.unwrap();
        assert_eq!(response.data, serde_json::json!({"orders": []}));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.circuit_state("orders"), CircuitState::Closed);
    }

    #[test]
    fn test_missing_parameter_is_rejection() {
        let call = GatewayCall::new(Operation::GetProduct, serde_json::json!({}));
        let err = call.required_str("product_id").unwrap_err();
        assert!(!err.is_transient());
    }
}
