//! Per-kind workflow state machines.
//!
//! Pure functions over [`Workflow`]: what the next step is, how a decision
//! moves the machine, what a failed side effect does, and how an event
//! wakes a resting workflow. The dispatcher owns all I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    Action, AnomalyState, Decision, Event, InventoryState, NotificationState,
    PersonalizationState, Workflow, WorkflowKind, WorkflowState,
};
use crate::gateway::{GatewayCall, GatewayFailure};
use crate::workers::templates;

/// Counters bounding the machines' loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLimits {
    /// Failed retry/reroute cycles before an anomaly is escalated
    pub anomaly_max_retries: u32,

    /// Resends of a notification before it fails
    pub notification_max_retries: u32,

    /// Consecutive transient failures of one step (inventory, personalization)
    pub workflow_retry_budget: u32,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            anomaly_max_retries: 3,
            notification_max_retries: 2,
            workflow_retry_budget: 3,
        }
    }
}

/// A side effect and the state it leads to
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub call: GatewayCall,
    pub on_success: WorkflowState,
}

/// What the dispatcher does next with a workflow
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Move without consulting a worker
    Advance(WorkflowState),
    /// Ask the worker for a decision
    Decide,
    /// Apply a side effect through the gateway
    Execute(Effect),
    /// Wait for an external event; the lock is released
    Rest,
    Terminal,
}

/// How a decision moves the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    Transition(WorkflowState),
    /// Stay in place; the stored decision drives the next side effect
    Execute,
    /// Stay in place and rest
    Hold,
}

/// Decision not allowed in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("action '{action}' is not valid in state {state}")]
pub struct InvalidTransition {
    pub state: WorkflowState,
    pub action: Action,
}

/// Outcome of a failed side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePlan {
    /// Try the same step again after a backoff
    RetryStep,
    /// Go back to an earlier state
    Transition(WorkflowState),
    /// Retry budget exhausted or permanent failure
    Fail(WorkflowState),
}

/// How an incoming event affects an existing workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    /// Continue driving from the current state
    Proceed,
    Transition(WorkflowState, String),
    /// Record and stay resting
    Ignore(String),
}

/// Next step for a workflow in its current state
pub fn next_step(workflow: &Workflow) -> Step {
    use WorkflowState::*;

    if workflow.is_terminal() {
        return Step::Terminal;
    }

    let last_action = workflow.last_decision.as_ref().map(|d| d.action);
    match workflow.state {
        Anomaly(AnomalyState::Detected) => Step::Advance(Anomaly(AnomalyState::Diagnosing)),
        Anomaly(AnomalyState::Diagnosing) => Step::Decide,
        Anomaly(AnomalyState::Retrying) => Step::Execute(Effect {
            call: GatewayCall::update_order_state(
                &workflow.resource_id,
                "payment_retry",
                decision_params(workflow),
            ),
            on_success: Anomaly(AnomalyState::Resolved),
        }),
        Anomaly(AnomalyState::Rerouting) => Step::Execute(Effect {
            call: GatewayCall::update_order_state(
                &workflow.resource_id,
                "rerouted",
                decision_params(workflow),
            ),
            on_success: Anomaly(AnomalyState::Resolved),
        }),

        Inventory(InventoryState::MonitoringStock) | Inventory(InventoryState::ShortageProjected) => {
            Step::Decide
        }
        Inventory(InventoryState::ReroutingOrders) => {
            let order_id = decision_str(workflow, "order_id").unwrap_or(workflow.resource_id.as_str());
            Step::Execute(Effect {
                call: GatewayCall::update_order_state(order_id, "rerouted", decision_params(workflow)),
                on_success: Inventory(InventoryState::NotifyingCustomers),
            })
        }
        Inventory(InventoryState::NotifyingCustomers) => {
            let fallback = templates::template("delay_notification");
            Step::Execute(Effect {
                call: GatewayCall::send_notification(
                    decision_str(workflow, "recipient").unwrap_or(workflow.resource_id.as_str()),
                    decision_str(workflow, "subject").unwrap_or(fallback.subject),
                    decision_str(workflow, "message").unwrap_or(fallback.body),
                ),
                on_success: Inventory(InventoryState::Completed),
            })
        }

        Notification(NotificationState::Pending) => match last_action {
            Some(Action::SendNotification) => Step::Execute(Effect {
                call: notification_call(workflow),
                on_success: Notification(NotificationState::Sent),
            }),
            _ => Step::Decide,
        },
        Notification(NotificationState::Sent) => Step::Rest,

        Personalization(PersonalizationState::Requested) => match last_action {
            Some(Action::Recommend) => Step::Execute(Effect {
                call: recommendation_call(workflow),
                on_success: Personalization(PersonalizationState::Delivered),
            }),
            _ => Step::Decide,
        },

        _ => Step::Terminal,
    }
}

/// Actions a worker may return in a state
pub fn allowed_actions(state: WorkflowState) -> &'static [Action] {
    use WorkflowState::*;

    match state {
        Anomaly(AnomalyState::Diagnosing) => &[
            Action::Retry,
            Action::Reroute,
            Action::Escalate,
            Action::Resolve,
            Action::Abandon,
        ],
        Inventory(InventoryState::MonitoringStock) => &[
            Action::ProjectShortage,
            Action::Hold,
            Action::Resolve,
            Action::Abandon,
        ],
        Inventory(InventoryState::ShortageProjected) => {
            &[Action::RerouteOrders, Action::Resolve, Action::Abandon]
        }
        Notification(NotificationState::Pending) => &[Action::SendNotification, Action::Abandon],
        Personalization(PersonalizationState::Requested) => &[Action::Recommend, Action::Abandon],
        _ => &[],
    }
}

/// Interpret a decision against the current state
pub fn interpret(state: WorkflowState, decision: &Decision) -> Result<Interpretation, InvalidTransition> {
    use WorkflowState::*;

    let action = decision.action;
    let invalid = || InvalidTransition { state, action };

    if !allowed_actions(state).contains(&action) {
        return Err(invalid());
    }
    if action == Action::Abandon {
        return Ok(Interpretation::Transition(state.kind().cancelled_state()));
    }

    let interpretation = match (state, action) {
        (Anomaly(AnomalyState::Diagnosing), Action::Retry) => {
            Interpretation::Transition(Anomaly(AnomalyState::Retrying))
        }
        (Anomaly(AnomalyState::Diagnosing), Action::Reroute) => {
            Interpretation::Transition(Anomaly(AnomalyState::Rerouting))
        }
        (Anomaly(AnomalyState::Diagnosing), Action::Escalate) => {
            Interpretation::Transition(Anomaly(AnomalyState::Escalated))
        }
        (Anomaly(AnomalyState::Diagnosing), Action::Resolve) => {
            Interpretation::Transition(Anomaly(AnomalyState::Resolved))
        }

        (Inventory(InventoryState::MonitoringStock), Action::ProjectShortage) => {
            Interpretation::Transition(Inventory(InventoryState::ShortageProjected))
        }
        (Inventory(InventoryState::MonitoringStock), Action::Hold) => Interpretation::Hold,
        (Inventory(_), Action::Resolve) => {
            Interpretation::Transition(Inventory(InventoryState::Completed))
        }
        (Inventory(InventoryState::ShortageProjected), Action::RerouteOrders) => {
            Interpretation::Transition(Inventory(InventoryState::ReroutingOrders))
        }

        (Notification(NotificationState::Pending), Action::SendNotification) => Interpretation::Execute,
        (Personalization(PersonalizationState::Requested), Action::Recommend) => Interpretation::Execute,

        _ => return Err(invalid()),
    };
    Ok(interpretation)
}

/// Plan recovery from a failed side effect, updating the retry counters
pub fn on_effect_failure(
    workflow: &mut Workflow,
    failure: &GatewayFailure,
    limits: &MachineLimits,
) -> FailurePlan {
    let failed = workflow.kind.failure_state();

    match workflow.kind {
        WorkflowKind::AnomalyResolution => {
            if !failure.is_transient() {
                return FailurePlan::Fail(failed);
            }
            workflow.retries += 1;
            if workflow.retries >= limits.anomaly_max_retries {
                FailurePlan::Fail(failed)
            } else {
                FailurePlan::Transition(WorkflowState::Anomaly(AnomalyState::Diagnosing))
            }
        }
        WorkflowKind::CustomerNotification => {
            if !failure.is_transient() {
                return FailurePlan::Fail(failed);
            }
            workflow.retries += 1;
            if workflow.retries > limits.notification_max_retries {
                FailurePlan::Fail(failed)
            } else {
                FailurePlan::RetryStep
            }
        }
        WorkflowKind::InventoryReroute | WorkflowKind::Personalization => {
            if !failure.is_transient() {
                return FailurePlan::Fail(failed);
            }
            workflow.step_failures += 1;
            if workflow.step_failures >= limits.workflow_retry_budget {
                FailurePlan::Fail(failed)
            } else {
                FailurePlan::RetryStep
            }
        }
    }
}

/// Effect of a new event on an existing, non-terminal workflow
pub fn on_event(workflow: &mut Workflow, event: &Event, limits: &MachineLimits) -> EventEffect {
    match workflow.state {
        WorkflowState::Notification(NotificationState::Sent) => {
            if event.payload_flag("acknowledged") {
                EventEffect::Transition(
                    WorkflowState::Notification(NotificationState::Acknowledged),
                    "customer acknowledged the notification".to_string(),
                )
            } else if event.payload_flag("delivery_failed") {
                workflow.retries += 1;
                if workflow.retries > limits.notification_max_retries {
                    EventEffect::Transition(
                        WorkflowState::Notification(NotificationState::Failed),
                        format!(
                            "delivery failed {} times, resend budget exhausted",
                            workflow.retries
                        ),
                    )
                } else {
                    EventEffect::Transition(
                        WorkflowState::Notification(NotificationState::Pending),
                        "delivery failed, resending".to_string(),
                    )
                }
            } else {
                EventEffect::Ignore("waiting for acknowledgement".to_string())
            }
        }
        _ => EventEffect::Proceed,
    }
}

fn decision_params(workflow: &Workflow) -> serde_json::Value {
    workflow
        .last_decision
        .as_ref()
        .map(|d| d.parameters.clone())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn decision_str<'a>(workflow: &'a Workflow, key: &str) -> Option<&'a str> {
    workflow.last_decision.as_ref().and_then(|d| d.param_str(key))
}

fn notification_call(workflow: &Workflow) -> GatewayCall {
    let template = templates::template(
        decision_str(workflow, "template").unwrap_or(templates::GENERIC),
    );
    let mut call = GatewayCall::send_notification(
        decision_str(workflow, "recipient").unwrap_or(workflow.resource_id.as_str()),
        decision_str(workflow, "subject").unwrap_or(template.subject),
        decision_str(workflow, "body").unwrap_or(template.body),
    );
    // Resends differ from the original send so they are not deduplicated
    if let Some(params) = call.params.as_object_mut() {
        params.insert("resend".to_string(), workflow.retries.into());
    }
    call
}

fn recommendation_call(workflow: &Workflow) -> GatewayCall {
    let items: Vec<String> = workflow
        .last_decision
        .as_ref()
        .and_then(|d| d.parameters.get("recommendations"))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let body = if items.is_empty() {
        "Discover what's new in our catalog.".to_string()
    } else {
        format!("Picked for you: {}", items.join(", "))
    };

    let mut call = GatewayCall::send_notification(&workflow.resource_id, "Recommended for you", &body);
    if let Some(params) = call.params.as_object_mut() {
        params.insert("recommendations".to_string(), items.into());
    }
    call
}
