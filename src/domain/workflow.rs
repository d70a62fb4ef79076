//! Workflow state and history.
//!
//! A Workflow is a multi-step resolution process tied to one resource.
//! Only the dispatcher mutates workflows; every mutation is recorded in
//! `history` so the operator can see why a workflow ended where it did.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::{Action, Decision};
use super::events::EventCategory;

/// Kind of multi-step process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    Personalization,
    InventoryReroute,
    AnomalyResolution,
    CustomerNotification,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personalization => "personalization",
            Self::InventoryReroute => "inventory-reroute",
            Self::AnomalyResolution => "anomaly-resolution",
            Self::CustomerNotification => "customer-notification",
        }
    }

    /// State a freshly created workflow starts in
    pub fn initial_state(&self) -> WorkflowState {
        match self {
            Self::Personalization => WorkflowState::Personalization(PersonalizationState::Requested),
            Self::InventoryReroute => WorkflowState::Inventory(InventoryState::MonitoringStock),
            Self::AnomalyResolution => WorkflowState::Anomaly(AnomalyState::Detected),
            Self::CustomerNotification => WorkflowState::Notification(NotificationState::Pending),
        }
    }

    /// Terminal state forced when retries or budgets run out
    pub fn failure_state(&self) -> WorkflowState {
        match self {
            Self::Personalization => WorkflowState::Personalization(PersonalizationState::Failed),
            Self::InventoryReroute => WorkflowState::Inventory(InventoryState::Failed),
            Self::AnomalyResolution => WorkflowState::Anomaly(AnomalyState::Escalated),
            Self::CustomerNotification => WorkflowState::Notification(NotificationState::Failed),
        }
    }

    /// Terminal state for operator cancellation
    pub fn cancelled_state(&self) -> WorkflowState {
        match self {
            Self::Personalization => WorkflowState::Personalization(PersonalizationState::Abandoned),
            Self::InventoryReroute => WorkflowState::Inventory(InventoryState::Abandoned),
            Self::AnomalyResolution => WorkflowState::Anomaly(AnomalyState::Abandoned),
            Self::CustomerNotification => {
                WorkflowState::Notification(NotificationState::Abandoned)
            }
        }
    }

    /// Terminal state for a workflow that outlived its TTL
    pub fn expired_state(&self) -> WorkflowState {
        match self {
            Self::CustomerNotification => WorkflowState::Notification(NotificationState::Failed),
            other => other.cancelled_state(),
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the anomaly-resolution machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyState {
    Detected,
    Diagnosing,
    Retrying,
    Rerouting,
    Escalated,
    Resolved,
    Abandoned,
}

/// States of the inventory-reroute machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryState {
    MonitoringStock,
    ShortageProjected,
    ReroutingOrders,
    NotifyingCustomers,
    Completed,
    Failed,
    Abandoned,
}

/// States of the customer-notification machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Abandoned,
}

/// States of the single-shot personalization machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalizationState {
    Requested,
    Delivered,
    Failed,
    Abandoned,
}

/// Kind-specific workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "machine", content = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Anomaly(AnomalyState),
    Inventory(InventoryState),
    Notification(NotificationState),
    Personalization(PersonalizationState),
}

impl WorkflowState {
    /// Kind this state belongs to
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Anomaly(_) => WorkflowKind::AnomalyResolution,
            Self::Inventory(_) => WorkflowKind::InventoryReroute,
            Self::Notification(_) => WorkflowKind::CustomerNotification,
            Self::Personalization(_) => WorkflowKind::Personalization,
        }
    }

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Anomaly(s) => matches!(
                s,
                AnomalyState::Escalated | AnomalyState::Resolved | AnomalyState::Abandoned
            ),
            Self::Inventory(s) => matches!(
                s,
                InventoryState::Completed | InventoryState::Failed | InventoryState::Abandoned
            ),
            Self::Notification(s) => matches!(
                s,
                NotificationState::Acknowledged
                    | NotificationState::Failed
                    | NotificationState::Abandoned
            ),
            Self::Personalization(s) => !matches!(s, PersonalizationState::Requested),
        }
    }

    /// Terminal states that represent a failure surfaced to operators
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Anomaly(AnomalyState::Escalated | AnomalyState::Abandoned)
                | Self::Inventory(InventoryState::Failed | InventoryState::Abandoned)
                | Self::Notification(NotificationState::Failed | NotificationState::Abandoned)
                | Self::Personalization(PersonalizationState::Failed | PersonalizationState::Abandoned)
        )
    }

    /// Short state name without the machine prefix
    pub fn name(&self) -> String {
        let value = match self {
            Self::Anomaly(s) => serde_json::to_value(s),
            Self::Inventory(s) => serde_json::to_value(s),
            Self::Notification(s) => serde_json::to_value(s),
            Self::Personalization(s) => serde_json::to_value(s),
        };
        value
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Store key: one active workflow per resource and kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub resource_id: String,
    pub kind: WorkflowKind,
}

impl WorkflowKey {
    pub fn new(resource_id: impl Into<String>, kind: WorkflowKind) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind,
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.kind)
    }
}

/// A stateful resolution process tied to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow
    pub workflow_id: Uuid,

    /// Resource this workflow owns
    pub resource_id: String,

    /// Which state machine drives it
    pub kind: WorkflowKind,

    /// Current state
    pub state: WorkflowState,

    /// Ordered record of everything that happened
    pub history: Vec<HistoryEntry>,

    /// When the workflow was created
    pub created_at: DateTime<Utc>,

    /// When the workflow last changed
    pub updated_at: DateTime<Utc>,

    /// Kind-specific retry counter (anomaly retry cycles, notification resends)
    #[serde(default)]
    pub retries: u32,

    /// Consecutive transient failures of the current step
    #[serde(default)]
    pub step_failures: u32,

    /// Events already absorbed (duplicate delivery guard)
    #[serde(default)]
    pub seen_events: BTreeSet<Uuid>,

    /// Idempotency keys of side effects already applied
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,

    /// Most recent decision, read by execute-states
    #[serde(default)]
    pub last_decision: Option<Decision>,

    /// Ended by an operator rather than by failure
    #[serde(default)]
    pub cancelled: bool,
}

impl Workflow {
    /// Create a workflow in its kind's initial state
    pub fn new(workflow_id: Uuid, resource_id: impl Into<String>, kind: WorkflowKind) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            resource_id: resource_id.into(),
            kind,
            state: kind.initial_state(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            retries: 0,
            step_failures: 0,
            seen_events: BTreeSet::new(),
            completed_steps: BTreeSet::new(),
            last_decision: None,
            cancelled: false,
        }
    }

    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(self.resource_id.clone(), self.kind)
    }

    /// Append a history entry
    pub fn record(&mut self, event: HistoryEvent) {
        let now = Utc::now();
        self.history.push(HistoryEntry { at: now, event });
        self.updated_at = now;
    }

    /// Move to a new state, recording the decision that caused it
    pub fn transition(&mut self, to: WorkflowState, decision: Option<&Decision>, rationale: impl Into<String>) {
        let from = self.state;
        let mut rationale = rationale.into();
        if rationale.is_empty() {
            if let Some(decision) = decision {
                rationale = decision.rationale.clone();
            }
        }
        self.state = to;
        self.step_failures = 0;
        self.record(HistoryEvent::Transition {
            from,
            to,
            action: decision.map(|d| d.action),
            rationale,
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Has this event already been absorbed
    pub fn has_seen(&self, event_id: &Uuid) -> bool {
        self.seen_events.contains(event_id)
    }

    /// Age relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Check the max-age TTL
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) >= ttl
    }

    /// Rationale of the most recent transition, for operator display
    pub fn last_rationale(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|entry| match &entry.event {
            HistoryEvent::Transition { rationale, .. } if !rationale.is_empty() => {
                Some(rationale.as_str())
            }
            _ => None,
        })
    }

    /// Count history entries matching a predicate
    pub fn count_history<F>(&self, predicate: F) -> usize
    where
        F: Fn(&HistoryEvent) -> bool,
    {
        self.history.iter().filter(|e| predicate(&e.event)).count()
    }
}

/// One timestamped history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// What happened to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Workflow created for an event
    Created {
        event_id: Uuid,
        category: EventCategory,
    },

    /// Event absorbed by an existing workflow
    EventReceived { event_id: Uuid },

    /// Event arrived while resting but did not move the machine
    EventIgnored { event_id: Uuid, reason: String },

    /// State change
    Transition {
        from: WorkflowState,
        to: WorkflowState,
        action: Option<Action>,
        rationale: String,
    },

    /// Reasoning call failed (timeout, malformed output, quota)
    ReasoningFailed { attempt: u32, reason: String },

    /// Deterministic decision used after reasoning gave up
    FallbackApplied { action: Action, reason: String },

    /// Worker recommended an action the current state does not allow
    InvalidDecision { action: Action, state: WorkflowState },

    /// Read-only grounding fetch failed; reasoning proceeds without it
    GroundingUnavailable { operation: String, reason: String },

    /// Side effect applied through the gateway
    GatewayCallSucceeded {
        operation: String,
        idempotency_key: String,
    },

    /// Side effect failed
    GatewayCallFailed {
        operation: String,
        reason: String,
        transient: bool,
    },

    /// Side effect already applied earlier; not sent again
    StepSkipped { idempotency_key: String },

    /// Operator cancellation
    Cancelled { reason: String },

    /// Max-age TTL exceeded
    Expired { age_seconds: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_creation() {
        let id = Uuid::new_v4();
        let workflow = Workflow::new(id, "order-42", WorkflowKind::AnomalyResolution);

        assert_eq!(workflow.workflow_id, id);
        assert_eq!(workflow.state, WorkflowState::Anomaly(AnomalyState::Detected));
        assert!(!workflow.is_terminal());
        assert!(workflow.history.is_empty());
    }

    #[test]
    fn test_transition_records_history() {
        let mut workflow = Workflow::new(Uuid::new_v4(), "order-42", WorkflowKind::AnomalyResolution);
        let decision = Decision::new(Action::Escalate, 0.9, "card declined twice");

        workflow.transition(
            WorkflowState::Anomaly(AnomalyState::Escalated),
            Some(&decision),
            "",
        );

        assert!(workflow.is_terminal());
        assert_eq!(workflow.last_rationale(), Some("card declined twice"));
        match &workflow.history[0].event {
            HistoryEvent::Transition { from, action, .. } => {
                assert_eq!(*from, WorkflowState::Anomaly(AnomalyState::Detected));
                assert_eq!(*action, Some(Action::Escalate));
            }
            other => panic!("unexpected history entry: {:?}", other),
        }
    }

    #[test]
    fn test_state_display_and_serde() {
        let state = WorkflowState::Inventory(InventoryState::ShortageProjected);
        assert_eq!(state.to_string(), "inventory-reroute:shortage_projected");

        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["machine"], "inventory");
        assert_eq!(json["state"], "shortage_projected");
    }

    #[test]
    fn test_kind_specific_terminal_states() {
        assert_eq!(
            WorkflowKind::CustomerNotification.expired_state(),
            WorkflowState::Notification(NotificationState::Failed)
        );
        assert_eq!(
            WorkflowKind::AnomalyResolution.expired_state(),
            WorkflowState::Anomaly(AnomalyState::Abandoned)
        );
        assert!(!WorkflowState::Notification(NotificationState::Sent).is_terminal());
        assert!(WorkflowState::Personalization(PersonalizationState::Delivered).is_terminal());
        assert!(!WorkflowState::Personalization(PersonalizationState::Delivered).is_failure());
    }

    #[test]
    fn test_ttl_zero_is_expired() {
        let workflow = Workflow::new(Uuid::new_v4(), "order-1", WorkflowKind::Personalization);
        assert!(workflow.is_expired(Utc::now(), Duration::zero()));
        assert!(!workflow.is_expired(Utc::now(), Duration::minutes(15)));
    }
}
