//! Dispatcher: the single logical arbiter per resource.
//!
//! For each event the dispatcher resolves the claiming worker, takes the
//! resource lock without blocking, loads or creates the workflow, and
//! drives its state machine until it rests or terminates. Every outcome
//! is written to the workflow's history; nothing escapes as a panic or an
//! unhandled error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::journal::generate_idempotency_key;
use super::lock::{LockTable, ResourceLock};
use super::machine::{self, EventEffect, FailurePlan, Interpretation, MachineLimits, Step};
use super::metrics::{Incident, IncidentLog, Metrics, MetricsSnapshot};
use super::retry::RetryPolicy;
use super::store::WorkflowStore;
use crate::bus::{Delivery, EventBus};
use crate::domain::{
    AnomalyState, Decision, Event, EventCategory, HistoryEvent, IngestError, Workflow,
    WorkflowKey, WorkflowKind, WorkflowState,
};
use crate::gateway::Gateway;
use crate::reasoning::{ReasoningConfig, WorkflowContext};
use crate::workers::{Worker, WorkerRegistry};

/// Dispatcher tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Max age of a workflow before it is forced terminal (default: 15 min)
    #[serde(default = "default_ttl")]
    pub workflow_ttl_ms: u64,

    /// Lease on a resource lock; a crashed holder frees it at expiry
    #[serde(default = "default_ttl")]
    pub lock_lease_ms: u64,

    #[serde(default = "default_anomaly_max_retries")]
    pub anomaly_max_retries: u32,

    #[serde(default = "default_notification_max_retries")]
    pub notification_max_retries: u32,

    /// Transient step failures tolerated before a workflow fails
    #[serde(default = "default_retry_budget")]
    pub workflow_retry_budget: u32,

    /// Backoff between dispatcher-level step retries
    #[serde(default = "default_step_backoff")]
    pub step_backoff: RetryPolicy,

    /// Backoff for events deferred on lock contention
    #[serde(default = "default_defer_backoff")]
    pub defer_backoff: RetryPolicy,

    /// Deliveries handled concurrently by `run`
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,

    /// How often the sweeper enforces TTLs and purges stale locks
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_ttl() -> u64 {
    15 * 60 * 1000
}
fn default_anomaly_max_retries() -> u32 {
    3
}
fn default_notification_max_retries() -> u32 {
    2
}
fn default_retry_budget() -> u32 {
    3
}
fn default_step_backoff() -> RetryPolicy {
    RetryPolicy::default().with_initial_delay(Duration::from_millis(500))
}
fn default_defer_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: u32::MAX,
        initial_delay_ms: 100,
        max_delay_ms: 5000,
        backoff_multiplier: 2.0,
    }
}
fn default_max_concurrent() -> usize {
    64
}
fn default_sweep_interval() -> u64 {
    5000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workflow_ttl_ms: default_ttl(),
            lock_lease_ms: default_ttl(),
            anomaly_max_retries: default_anomaly_max_retries(),
            notification_max_retries: default_notification_max_retries(),
            workflow_retry_budget: default_retry_budget(),
            step_backoff: default_step_backoff(),
            defer_backoff: default_defer_backoff(),
            max_concurrent_workflows: default_max_concurrent(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl DispatcherConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.workflow_ttl_ms.min(i64::MAX as u64) as i64)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn limits(&self) -> MachineLimits {
        MachineLimits {
            anomaly_max_retries: self.anomaly_max_retries,
            notification_max_retries: self.notification_max_retries,
            workflow_retry_budget: self.workflow_retry_budget,
        }
    }
}

/// What happened to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The workflow reached a terminal state and was archived
    Terminated { workflow_id: Uuid, state: WorkflowState },
    /// The workflow is waiting for another event; its lock is released
    Rested { workflow_id: Uuid, state: WorkflowState },
    /// The resource is held by another workflow; redeliver later
    Deferred { holder: Uuid },
    /// Already absorbed; ack without side effects
    Duplicate,
    /// No worker claims the event
    Unclaimed,
}

impl DispatchOutcome {
    /// Whether the delivery should be acked
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Deferred { .. })
    }
}

/// Dispatch failure
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid event: {0}")]
    Invalid(#[from] IngestError),

    #[error("failed to persist workflow: {0}")]
    Persistence(String),
}

/// Operator view of one workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub resource_id: String,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    pub active: bool,
    pub holds_lock: bool,
    pub retries: u32,
    pub history_len: usize,
    pub rationale: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl WorkflowStatus {
    fn new(workflow: &Workflow, holds_lock: bool) -> Self {
        Self {
            workflow_id: workflow.workflow_id,
            resource_id: workflow.resource_id.clone(),
            kind: workflow.kind,
            state: workflow.state,
            active: !workflow.is_terminal(),
            holds_lock,
            retries: workflow.retries,
            history_len: workflow.history.len(),
            rationale: workflow.last_rationale().map(str::to_string),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        }
    }
}

/// What the sweeper did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_workflows: Vec<Uuid>,
    pub purged_locks: Vec<String>,
}

/// A call interrupted before its result could be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Expired,
}

/// Routes events to workers and drives workflows
pub struct Dispatcher {
    config: DispatcherConfig,
    reasoning: ReasoningConfig,
    registry: WorkerRegistry,
    gateway: Arc<Gateway>,
    store: Arc<WorkflowStore>,
    locks: LockTable,
    inflight: DashMap<Uuid, CancellationToken>,
    /// Cancelled while another workflow held the resource
    pending_cancels: DashMap<Uuid, String>,
    metrics: Metrics,
    incidents: IncidentLog,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        reasoning: ReasoningConfig,
        registry: WorkerRegistry,
        gateway: Arc<Gateway>,
        store: Arc<WorkflowStore>,
    ) -> Self {
        Self {
            config,
            reasoning,
            registry,
            gateway,
            store,
            locks: LockTable::new(),
            inflight: DashMap::new(),
            pending_cancels: DashMap::new(),
            metrics: Metrics::default(),
            incidents: IncidentLog::default(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.all()
    }

    /// Workflow currently holding a resource
    pub fn lock_holder(&self, resource_id: &str) -> Option<Uuid> {
        self.locks.holder(resource_id)
    }

    /// Rebuild workflows and locks from the store's journal
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let locks = self.store.load().await?;
        let restored = locks.len();
        for lock in locks {
            self.locks.restore(lock);
        }
        info!(locks = restored, active = self.store.active().len(), "Recovered from journal");
        Ok(restored)
    }

    /// Process one event
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, category = %event.category, resource_id = %event.resource_id)
    )]
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        event.validate()?;

        if self.store.has_seen(&event.id) {
            self.metrics.duplicates();
            debug!("Duplicate delivery acked");
            return Ok(DispatchOutcome::Duplicate);
        }

        let Some(worker) = self.registry.claimant(event) else {
            self.metrics.unclaimed();
            warn!("No worker claims event");
            self.incidents.push(Incident::for_resource(
                &event.resource_id,
                format!("no worker claims {} event {}", event.category, event.id),
            ));
            return Ok(DispatchOutcome::Unclaimed);
        };

        let key = WorkflowKey::new(event.resource_id.clone(), worker.kind());
        let candidate = self
            .store
            .get(&key)
            .map(|w| w.workflow_id)
            .unwrap_or_else(Uuid::new_v4);

        let mut lock = match self
            .locks
            .try_acquire(&event.resource_id, candidate, self.config.lock_lease())
        {
            Ok(lock) => lock,
            Err(contention) => {
                self.metrics.deferred();
                info!(holder = %contention.holder, kind = %worker.kind(), "Resource busy, deferring event");
                return Ok(DispatchOutcome::Deferred {
                    holder: contention.holder,
                });
            }
        };

        let result = self.process(worker, &key, event, &mut lock).await;
        self.locks.release(&event.resource_id, lock.holder_workflow_id);
        self.settle_pending_cancels(&event.resource_id).await;
        result
    }

    async fn process(
        &self,
        worker: &Worker,
        key: &WorkflowKey,
        event: &Event,
        lock: &mut ResourceLock,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (mut workflow, mut created) = self.store.get_or_create(key, lock.holder_workflow_id);
        self.bind_lock(lock, workflow.workflow_id);

        if workflow.has_seen(&event.id) || self.store.has_seen(&event.id) {
            self.metrics.duplicates();
            debug!(workflow_id = %workflow.workflow_id, "Duplicate delivery acked");
            return Ok(DispatchOutcome::Duplicate);
        }

        if !created && workflow.is_expired(Utc::now(), self.config.ttl()) {
            self.expire(&mut workflow);
            self.finish(&workflow).await?;
            let (fresh, _) = self.store.get_or_create(key, Uuid::new_v4());
            self.bind_lock(lock, fresh.workflow_id);
            workflow = fresh;
            created = true;
        }

        if created {
            info!(workflow_id = %workflow.workflow_id, kind = %workflow.kind, "Workflow started");
            workflow.record(HistoryEvent::Created {
                event_id: event.id,
                category: event.category,
            });
        } else {
            workflow.record(HistoryEvent::EventReceived { event_id: event.id });
        }
        workflow.seen_events.insert(event.id);
        self.metrics.processed();

        match machine::on_event(&mut workflow, event, &self.config.limits()) {
            EventEffect::Proceed => {}
            EventEffect::Transition(to, rationale) => workflow.transition(to, None, rationale),
            EventEffect::Ignore(reason) => workflow.record(HistoryEvent::EventIgnored {
                event_id: event.id,
                reason,
            }),
        }

        let token = CancellationToken::new();
        self.inflight.insert(workflow.workflow_id, token.clone());
        if self.pending_cancels.remove(&workflow.workflow_id).is_some() {
            token.cancel();
        }

        let driven = self.drive(worker, &mut workflow, event, lock, &token).await;
        self.inflight.remove(&workflow.workflow_id);
        driven?;

        self.finish(&workflow).await?;
        if workflow.is_terminal() {
            Ok(DispatchOutcome::Terminated {
                workflow_id: workflow.workflow_id,
                state: workflow.state,
            })
        } else {
            Ok(DispatchOutcome::Rested {
                workflow_id: workflow.workflow_id,
                state: workflow.state,
            })
        }
    }

    fn bind_lock(&self, lock: &mut ResourceLock, workflow_id: Uuid) {
        if lock.holder_workflow_id != workflow_id
            && self
                .locks
                .rebind(&lock.resource_id, lock.holder_workflow_id, workflow_id)
        {
            lock.holder_workflow_id = workflow_id;
        }
    }

    /// Drive the machine until it rests or terminates
    async fn drive(
        &self,
        worker: &Worker,
        workflow: &mut Workflow,
        event: &Event,
        lock: &ResourceLock,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let limits = self.config.limits();
        let remaining = match workflow.created_at.checked_add_signed(self.config.ttl()) {
            Some(expires_at) => (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => Duration::from_secs(u64::from(u32::MAX)),
        };
        let deadline = Instant::now() + remaining;

        loop {
            if token.is_cancelled() {
                self.abandon(workflow, "cancelled by operator");
                return Ok(());
            }
            if workflow.is_expired(Utc::now(), self.config.ttl()) {
                self.expire(workflow);
                return Ok(());
            }

            match machine::next_step(workflow) {
                Step::Terminal | Step::Rest => return Ok(()),

                Step::Advance(to) => {
                    workflow.transition(to, None, "automatic");
                }

                Step::Decide => {
                    let decision = match self.decide(worker, workflow, event, deadline, token).await {
                        Ok(decision) => decision,
                        Err(interrupt) => {
                            self.interrupted(workflow, interrupt);
                            return Ok(());
                        }
                    };
                    workflow.last_decision = Some(decision.clone());

                    match machine::interpret(workflow.state, &decision) {
                        Ok(Interpretation::Transition(to)) => {
                            workflow.transition(to, Some(&decision), "");
                        }
                        Ok(Interpretation::Execute) => {}
                        Ok(Interpretation::Hold) => {
                            workflow.transition(workflow.state, Some(&decision), "");
                            self.save(workflow, Some(lock)).await?;
                            return Ok(());
                        }
                        Err(invalid) => {
                            warn!(workflow_id = %workflow.workflow_id, error = %invalid, "Invalid decision");
                            workflow.record(HistoryEvent::InvalidDecision {
                                action: invalid.action,
                                state: invalid.state,
                            });
                            workflow.transition(
                                workflow.kind.failure_state(),
                                Some(&decision),
                                format!("worker recommended {}", invalid),
                            );
                        }
                    }
                }

                Step::Execute(effect) => {
                    let operation = effect.call.operation;
                    let key = generate_idempotency_key(
                        workflow.workflow_id,
                        &workflow.state,
                        &effect.call.params,
                    );

                    if workflow.completed_steps.contains(&key) {
                        debug!(idempotency_key = %key, "Step already applied, skipping");
                        workflow.record(HistoryEvent::StepSkipped {
                            idempotency_key: key,
                        });
                        let decision = workflow.last_decision.clone();
                        workflow.transition(
                            effect.on_success,
                            decision.as_ref(),
                            "side effect already applied",
                        );
                        self.save(workflow, Some(lock)).await?;
                        continue;
                    }

                    let call = effect.call.with_idempotency_key(key.clone());
                    let result = match self.race(self.gateway.call(call), deadline, token).await {
                        Ok(result) => result,
                        Err(interrupt) => {
                            self.interrupted(workflow, interrupt);
                            return Ok(());
                        }
                    };

                    match result {
                        Ok(_) => {
                            workflow.completed_steps.insert(key.clone());
                            workflow.record(HistoryEvent::GatewayCallSucceeded {
                                operation: operation.to_string(),
                                idempotency_key: key,
                            });
                            let decision = workflow.last_decision.clone();
                            workflow.transition(effect.on_success, decision.as_ref(), "");
                        }
                        Err(failure) => {
                            self.metrics.gateway_failures();
                            warn!(
                                workflow_id = %workflow.workflow_id,
                                %operation,
                                error = %failure,
                                "Workflow step failed"
                            );
                            workflow.record(HistoryEvent::GatewayCallFailed {
                                operation: operation.to_string(),
                                reason: failure.to_string(),
                                transient: failure.is_transient(),
                            });

                            match machine::on_effect_failure(workflow, &failure, &limits) {
                                FailurePlan::RetryStep => {
                                    self.save(workflow, Some(lock)).await?;
                                    let attempt = workflow.step_failures.max(workflow.retries);
                                    let delay = self.config.step_backoff.delay_for_attempt(attempt);
                                    if let Err(interrupt) =
                                        self.race(tokio::time::sleep(delay), deadline, token).await
                                    {
                                        self.interrupted(workflow, interrupt);
                                        return Ok(());
                                    }
                                    continue;
                                }
                                FailurePlan::Transition(to) => {
                                    workflow.transition(to, None, format!("{} failed: {}", operation, failure));
                                }
                                FailurePlan::Fail(to) => {
                                    let rationale = if failure.is_transient() {
                                        format!("{} kept failing, retry budget exhausted: {}", operation, failure)
                                    } else {
                                        format!("{} rejected: {}", operation, failure)
                                    };
                                    workflow.transition(to, None, rationale);
                                }
                            }
                        }
                    }
                }
            }

            self.save(workflow, Some(lock)).await?;
        }
    }

    /// Ground, then ask the worker, with bounded retries and a fallback
    async fn decide(
        &self,
        worker: &Worker,
        workflow: &mut Workflow,
        event: &Event,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<Decision, Interrupt> {
        let mut grounding = serde_json::Map::new();
        for call in worker.grounding(event) {
            let operation = call.operation;
            match self.race(self.gateway.call(call), deadline, token).await? {
                Ok(response) => {
                    grounding.insert(operation.to_string(), response.data);
                }
                Err(failure) => {
                    self.metrics.gateway_failures();
                    workflow.record(HistoryEvent::GroundingUnavailable {
                        operation: operation.to_string(),
                        reason: failure.to_string(),
                    });
                }
            }
        }

        let context = WorkflowContext {
            event: event.clone(),
            workflow_id: workflow.workflow_id,
            kind: workflow.kind,
            state: workflow.state,
            history: workflow.history.clone(),
            retries: workflow.retries,
            grounding,
        };

        let timeout = self.reasoning.timeout();
        for attempt in 1..=self.reasoning.max_attempts.max(1) {
            let call = tokio::time::timeout(timeout, worker.handle(&context));
            let reason = match self.race(call, deadline, token).await? {
                Ok(Ok(decision)) => {
                    debug!(
                        workflow_id = %workflow.workflow_id,
                        action = %decision.action,
                        confidence = decision.confidence,
                        attempt,
                        "Worker decided"
                    );
                    return Ok(decision);
                }
                Ok(Err(failure)) => failure.to_string(),
                Err(_) => format!("reasoning timed out after {:?}", timeout),
            };

            self.metrics.reasoning_failures();
            warn!(workflow_id = %workflow.workflow_id, attempt, %reason, "Reasoning failed");
            workflow.record(HistoryEvent::ReasoningFailed { attempt, reason });
        }

        let decision = worker.fallback(&context);
        warn!(
            workflow_id = %workflow.workflow_id,
            action = %decision.action,
            "Reasoning exhausted, applying fallback"
        );
        workflow.record(HistoryEvent::FallbackApplied {
            action: decision.action,
            reason: format!(
                "reasoning failed {} times",
                self.reasoning.max_attempts.max(1)
            ),
        });
        Ok(decision)
    }

    /// Await a call, bounded by the TTL deadline; a cancellation observed
    /// once the call completes discards its result
    async fn race<F>(&self, call: F, deadline: Instant, token: &CancellationToken) -> Result<F::Output, Interrupt>
    where
        F: Future,
    {
        let output = tokio::select! {
            output = call => output,
            _ = tokio::time::sleep_until(deadline) => return Err(Interrupt::Expired),
        };
        if token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(output)
    }

    fn interrupted(&self, workflow: &mut Workflow, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Cancelled => self.abandon(workflow, "cancelled by operator"),
            Interrupt::Expired => self.expire(workflow),
        }
    }

    fn abandon(&self, workflow: &mut Workflow, reason: &str) {
        info!(workflow_id = %workflow.workflow_id, resource_id = %workflow.resource_id, reason, "Workflow cancelled");
        workflow.record(HistoryEvent::Cancelled {
            reason: reason.to_string(),
        });
        workflow.cancelled = true;
        workflow.transition(workflow.kind.cancelled_state(), None, reason);
    }

    fn expire(&self, workflow: &mut Workflow) {
        let age = workflow.age(Utc::now());
        warn!(
            workflow_id = %workflow.workflow_id,
            resource_id = %workflow.resource_id,
            age_seconds = age.num_seconds(),
            "Workflow exceeded max age"
        );
        workflow.record(HistoryEvent::Expired {
            age_seconds: age.num_seconds(),
        });
        workflow.transition(
            workflow.kind.expired_state(),
            None,
            format!(
                "workflow exceeded max age of {}s",
                self.config.ttl().num_seconds()
            ),
        );
    }

    /// Persist the final snapshot of a drive; archive terminal workflows
    async fn finish(&self, workflow: &Workflow) -> Result<(), DispatchError> {
        if !workflow.is_terminal() {
            return self.save(workflow, None).await;
        }

        self.metrics.terminated();

        if workflow.state == WorkflowState::Anomaly(AnomalyState::Escalated) {
            error!(
                workflow_id = %workflow.workflow_id,
                resource_id = %workflow.resource_id,
                rationale = workflow.last_rationale().unwrap_or_default(),
                "Workflow escalated to operators"
            );
        }
        if workflow.state.is_failure() && !workflow.cancelled {
            self.incidents.push(Incident::for_workflow(
                workflow,
                workflow.last_rationale().unwrap_or("workflow failed"),
            ));
        }

        self.store
            .archive(workflow)
            .await
            .map_err(|e| DispatchError::Persistence(format!("{:#}", e)))
    }

    async fn save(&self, workflow: &Workflow, lock: Option<&ResourceLock>) -> Result<(), DispatchError> {
        self.store
            .save(workflow, lock)
            .await
            .map_err(|e| DispatchError::Persistence(format!("{:#}", e)))
    }

    /// Active and archived workflows for a resource
    pub fn status(&self, resource_id: &str) -> Vec<WorkflowStatus> {
        let holder = self.locks.holder(resource_id);
        self.store
            .by_resource(resource_id)
            .iter()
            .map(|w| WorkflowStatus::new(w, holder == Some(w.workflow_id)))
            .collect()
    }

    /// Cancel every active workflow of a resource.
    ///
    /// In-flight workflows observe the cancellation once their current call
    /// completes; resting ones are abandoned immediately, or as soon as the
    /// workflow holding the resource lets go of it. Returns the number of
    /// workflows cancelled or signalled.
    pub async fn cancel(&self, resource_id: &str) -> Result<usize, DispatchError> {
        let mut count = 0;

        for workflow in self.store.by_resource(resource_id) {
            if workflow.is_terminal() {
                continue;
            }
            let id = workflow.workflow_id;
            count += 1;

            if let Some(token) = self.inflight.get(&id) {
                token.cancel();
                continue;
            }

            if !self.abandon_resting(&workflow.key(), id).await? {
                self.pending_cancels.insert(id, resource_id.to_string());
                if let Some(token) = self.inflight.get(&id) {
                    token.cancel();
                }
            }
        }

        info!(resource_id, cancelled = count, "Cancellation requested");
        Ok(count)
    }

    /// Abandon a resting workflow under its resource lock; false when the
    /// resource is busy
    async fn abandon_resting(&self, key: &WorkflowKey, id: Uuid) -> Result<bool, DispatchError> {
        if self
            .locks
            .try_acquire(&key.resource_id, id, self.config.lock_lease())
            .is_err()
        {
            return Ok(false);
        }

        let result = match self.store.get(key) {
            Some(mut current) if current.workflow_id == id && !current.is_terminal() => {
                self.abandon(&mut current, "cancelled by operator");
                self.finish(&current).await
            }
            _ => Ok(()),
        };
        self.locks.release(&key.resource_id, id);
        result.map(|()| true)
    }

    /// Apply cancellations that arrived while the resource was busy
    async fn settle_pending_cancels(&self, resource_id: &str) {
        let pending: Vec<Uuid> = self
            .pending_cancels
            .iter()
            .filter(|entry| entry.value() == resource_id)
            .map(|entry| *entry.key())
            .collect();
        if pending.is_empty() {
            return;
        }

        let workflows = self.store.by_resource(resource_id);
        for id in pending {
            let Some(workflow) = workflows.iter().find(|w| w.workflow_id == id) else {
                self.pending_cancels.remove(&id);
                continue;
            };
            if workflow.is_terminal() {
                self.pending_cancels.remove(&id);
                continue;
            }
            if self.inflight.contains_key(&id) {
                continue;
            }

            match self.abandon_resting(&workflow.key(), id).await {
                Ok(true) => {
                    self.pending_cancels.remove(&id);
                }
                Ok(false) => {}
                Err(e) => error!(workflow_id = %id, error = %e, "Failed to apply cancellation"),
            }
        }
    }

    /// Enforce TTLs on idle workflows and purge expired locks
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let ttl = self.config.ttl();

        let mut resources: Vec<String> = self
            .pending_cancels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        resources.sort();
        resources.dedup();
        for resource_id in resources {
            self.settle_pending_cancels(&resource_id).await;
        }

        for key in self.store.expired(Utc::now(), ttl) {
            let Some(workflow) = self.store.get(&key) else {
                continue;
            };
            let id = workflow.workflow_id;
            if self.inflight.contains_key(&id) {
                continue;
            }
            if self
                .locks
                .try_acquire(&key.resource_id, id, self.config.lock_lease())
                .is_err()
            {
                continue;
            }

            if let Some(mut current) = self.store.get(&key) {
                if current.workflow_id == id && current.is_expired(Utc::now(), ttl) {
                    self.expire(&mut current);
                    match self.finish(&current).await {
                        Ok(()) => report.expired_workflows.push(id),
                        Err(e) => error!(workflow_id = %id, error = %e, "Failed to archive expired workflow"),
                    }
                }
            }
            self.locks.release(&key.resource_id, id);
        }

        for lock in self.locks.purge_expired() {
            warn!(
                resource_id = %lock.resource_id,
                holder = %lock.holder_workflow_id,
                "Purged expired resource lock"
            );
            report.purged_locks.push(lock.resource_id);
        }

        report
    }

    /// Dispatch a bus delivery and settle it
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let event = delivery.event().clone();
        match self.dispatch(&event).await {
            Ok(outcome) if outcome.is_settled() => delivery.ack(),
            Ok(_) => {
                let delay = self.config.defer_backoff.delay_for_attempt(delivery.attempt());
                delivery.defer(delay);
            }
            Err(DispatchError::Invalid(e)) => {
                warn!(event_id = %event.id, error = %e, "Dropping invalid event");
                delivery.ack();
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Dispatch failed, will redeliver");
                let delay = self.config.defer_backoff.delay_for_attempt(delivery.attempt());
                delivery.defer(delay);
            }
        }
    }

    /// Consume every category until `shutdown` fires
    pub async fn run(self: Arc<Self>, bus: Arc<EventBus>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_workflows.max(1)));
        let mut consumers = JoinSet::new();

        for category in EventCategory::ALL {
            let dispatcher = Arc::clone(&self);
            let mut subscription = bus.subscribe(category);
            let permits = Arc::clone(&permits);
            let shutdown = shutdown.clone();

            consumers.spawn(async move {
                let mut handlers = JoinSet::new();
                loop {
                    let delivery = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        delivery = subscription.next() => delivery,
                    };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = Arc::clone(&permits).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let dispatcher = Arc::clone(&dispatcher);
                    handlers.spawn(async move {
                        dispatcher.handle_delivery(delivery).await;
                        drop(permit);
                    });
                    while handlers.try_join_next().is_some() {}
                }
                while handlers.join_next().await.is_some() {}
                debug!(category = %subscription.category(), "Consumer stopped");
            });
        }

        let sweeper = {
            let dispatcher = Arc::clone(&self);
            let shutdown = shutdown.clone();
            async move {
                let mut interval = tokio::time::interval(dispatcher.config.sweep_interval());
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            let report = dispatcher.sweep().await;
                            if !report.expired_workflows.is_empty() || !report.purged_locks.is_empty() {
                                info!(
                                    expired = report.expired_workflows.len(),
                                    purged_locks = report.purged_locks.len(),
                                    "Sweep finished"
                                );
                            }
                        }
                    }
                }
            }
        };
        consumers.spawn(sweeper);

        info!("Dispatcher running");
        while let Some(joined) = consumers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatcher task failed");
            }
        }
        info!("Dispatcher stopped");
    }

    /// Run until the bus drains or `timeout` elapses; true if drained
    pub async fn run_until_idle(self: &Arc<Self>, bus: Arc<EventBus>, timeout: Duration) -> bool {
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(self).run(Arc::clone(&bus), shutdown.clone()));

        let deadline = Instant::now() + timeout;
        let drained = loop {
            if bus.is_idle() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        shutdown.cancel();
        if let Err(e) = runner.await {
            error!(error = %e, "Dispatcher run task failed");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, NotificationState};
    use crate::gateway::{Backend, GatewayCall, GatewayConfig, GatewayFailure};
    use crate::reasoning::{Reasoner, ReasoningFailure, ReasoningRequest};
    use async_trait::async_trait;
    use serde_json::json;

    struct OkBackend;

    #[async_trait]
    impl Backend for OkBackend {
        fn name(&self) -> &str {
            "ok"
        }
        async fn execute(&self, _call: &GatewayCall) -> Result<serde_json::Value, GatewayFailure> {
            Ok(json!({}))
        }
    }

    struct Fixed(Action);

    #[async_trait]
    impl Reasoner for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn infer(&self, _request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
            Ok(Decision::new(self.0, 0.9, "fixed"))
        }
    }

    fn dispatcher(action: Action, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(
            config,
            ReasoningConfig::default(),
            WorkerRegistry::standard(Arc::new(Fixed(action))),
            Arc::new(Gateway::new(Arc::new(OkBackend), GatewayConfig::default())),
            Arc::new(WorkflowStore::new()),
        )
    }

    #[tokio::test]
    async fn test_notification_rests_then_acknowledges() {
        let d = dispatcher(Action::SendNotification, DispatcherConfig::default());

        let first = Event::new(EventCategory::Notification, "order-1", json!({"event_type": "order_created"}), "test");
        let outcome = d.dispatch(&first).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Rested { state: WorkflowState::Notification(NotificationState::Sent), .. }
        ));
        assert_eq!(d.lock_holder("order-1"), None);

        let ack = Event::new(EventCategory::Notification, "order-1", json!({"acknowledged": true}), "test");
        let outcome = d.dispatch(&ack).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Terminated { state: WorkflowState::Notification(NotificationState::Acknowledged), .. }
        ));

        assert_eq!(d.dispatch(&ack).await.unwrap(), DispatchOutcome::Duplicate);
        assert_eq!(d.metrics().duplicates, 1);
    }

    #[tokio::test]
    async fn test_invalid_decision_escalates() {
        let d = dispatcher(Action::Recommend, DispatcherConfig::default());
        let event = Event::new(EventCategory::Anomaly, "order-9", json!({"reason": "payment_failed"}), "test");

        let outcome = d.dispatch(&event).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Terminated { state: WorkflowState::Anomaly(AnomalyState::Escalated), .. }
        ));

        let status = d.status("order-9");
        assert_eq!(status.len(), 1);
        assert!(!status[0].active);
        assert_eq!(d.incidents().len(), 1);

        let archived = d.store().archived();
        assert_eq!(
            archived[0].count_history(|e| matches!(e, HistoryEvent::InvalidDecision { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_resting_workflow() {
        let d = dispatcher(Action::SendNotification, DispatcherConfig::default());
        let event = Event::new(EventCategory::Notification, "order-3", json!({}), "test");
        d.dispatch(&event).await.unwrap();

        assert_eq!(d.cancel("order-3").await.unwrap(), 1);
        let status = d.status("order-3");
        assert_eq!(
            status[0].state,
            WorkflowState::Notification(NotificationState::Abandoned)
        );
        assert!(d.incidents().is_empty());
        assert_eq!(d.cancel("order-3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_event() {
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            ReasoningConfig::default(),
            WorkerRegistry::new(),
            Arc::new(Gateway::new(Arc::new(OkBackend), GatewayConfig::default())),
            Arc::new(WorkflowStore::new()),
        );
        let event = Event::new(EventCategory::Personalization, "user-1", json!({}), "test");

        assert_eq!(d.dispatch(&event).await.unwrap(), DispatchOutcome::Unclaimed);
        assert_eq!(d.metrics().unclaimed, 1);
        assert_eq!(d.incidents().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_resting_workflow() {
        let d = dispatcher(
            Action::SendNotification,
            DispatcherConfig {
                workflow_ttl_ms: 50,
                ..Default::default()
            },
        );
        let event = Event::new(EventCategory::Notification, "order-5", json!({}), "test");
        assert!(matches!(
            d.dispatch(&event).await.unwrap(),
            DispatchOutcome::Rested { .. }
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = d.sweep().await;
        assert_eq!(report.expired_workflows.len(), 1);
        assert_eq!(
            d.status("order-5")[0].state,
            WorkflowState::Notification(NotificationState::Failed)
        );
    }
}
