//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use aegis::core::{Dispatcher, DispatcherConfig, RetryPolicy, WorkflowStore};
use aegis::domain::{Decision, Event, EventCategory};
use aegis::gateway::{Backend, Gateway, GatewayCall, GatewayConfig, GatewayFailure};
use aegis::reasoning::{Reasoner, ReasoningConfig, ReasoningFailure, ReasoningRequest};
use aegis::workers::{fallback_decision, WorkerRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

/// How the mock backend answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    /// Every call fails with a transient error
    Unavailable,
}

/// Backend that records every call
pub struct MockBackend {
    mode: Mode,
    calls: Mutex<Vec<GatewayCall>>,
}

impl MockBackend {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Mutating calls only (update order state, send notification)
    pub fn mutations(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation.is_mutation())
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, call: &GatewayCall) -> Result<Value, GatewayFailure> {
        self.calls.lock().push(call.clone());
        match self.mode {
            Mode::Healthy => Ok(json!({"ok": true})),
            Mode::Unavailable => Err(GatewayFailure::Unavailable {
                operation: call.operation,
                reason: "503 Service Unavailable".to_string(),
                circuit_open: false,
            }),
        }
    }
}

/// Answers with the deterministic fallback for the context
pub struct Rules;

#[async_trait]
impl Reasoner for Rules {
    fn name(&self) -> &str {
        "rules"
    }

    async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
        Ok(fallback_decision(&request.context))
    }
}

/// Plays back scripted answers, then repeats the last one
pub struct Scripted {
    script: Mutex<VecDeque<Result<Decision, ReasoningFailure>>>,
    calls: Mutex<u32>,
}

impl Scripted {
    pub fn new(script: Vec<Result<Decision, ReasoningFailure>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl Reasoner for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn infer(&self, _request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
        *self.calls.lock() += 1;
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

/// Blocks every call until the gate is opened, then answers by rule
pub struct Gated {
    gate: Semaphore,
    entered: Semaphore,
}

impl Gated {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            entered: Semaphore::new(0),
        })
    }

    /// Wait until a call is parked at the gate
    pub async fn wait_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Reasoner for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
        self.entered.add_permits(1);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ReasoningFailure::QuotaExceeded)?;
        Ok(fallback_decision(&request.context))
    }
}

pub fn gateway(backend: Arc<dyn Backend>) -> Arc<Gateway> {
    Arc::new(Gateway::new(
        backend,
        GatewayConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        },
    ))
}

pub fn quick_config() -> DispatcherConfig {
    DispatcherConfig {
        step_backoff: RetryPolicy::default().with_initial_delay(std::time::Duration::from_millis(1)),
        defer_backoff: RetryPolicy {
            max_attempts: u32::MAX,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn dispatcher(
    config: DispatcherConfig,
    registry: WorkerRegistry,
    backend: Arc<dyn Backend>,
    store: Arc<WorkflowStore>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        config,
        ReasoningConfig::default(),
        registry,
        gateway(backend),
        store,
    ))
}

pub fn event(category: EventCategory, resource_id: &str, payload: Value) -> Event {
    Event::new(category, resource_id, payload, "test")
}
