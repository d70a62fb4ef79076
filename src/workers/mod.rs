//! Specialized workers.
//!
//! A closed set of worker variants, each producing a [`Decision`] for one
//! workflow kind. Workers never touch the backend themselves: they name
//! the read-only calls that ground their reasoning, and the dispatcher
//! performs them through the gateway.

pub mod registry;
pub mod templates;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::machine;
use crate::domain::{
    Action, Decision, Event, EventCategory, InventoryState, WorkflowKind, WorkflowState,
};
use crate::gateway::GatewayCall;
use crate::reasoning::{Reasoner, ReasoningFailure, ReasoningRequest, WorkflowContext};

pub use registry::WorkerRegistry;

/// Inventory reasons that are handled as anomalies
pub const ANOMALY_REASONS: &[&str] = &["stock_discrepancy", "negative_stock", "system_error"];

/// Stock level at or below which a shortage is projected
const DEFAULT_STOCK_THRESHOLD: i64 = 10;

/// A capability-typed unit producing decisions from context
#[derive(Clone)]
pub enum Worker {
    Personalization(Arc<dyn Reasoner>),
    Inventory(Arc<dyn Reasoner>),
    Communication(Arc<dyn Reasoner>),
    Anomaly(Arc<dyn Reasoner>),
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker({}, reasoner={})", self.name(), self.reasoner().name())
    }
}

impl Worker {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Personalization(_) => "personalization",
            Self::Inventory(_) => "inventory",
            Self::Communication(_) => "communication",
            Self::Anomaly(_) => "anomaly",
        }
    }

    /// Workflow kind this worker drives
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Personalization(_) => WorkflowKind::Personalization,
            Self::Inventory(_) => WorkflowKind::InventoryReroute,
            Self::Communication(_) => WorkflowKind::CustomerNotification,
            Self::Anomaly(_) => WorkflowKind::AnomalyResolution,
        }
    }

    /// Default priority within a category (higher first)
    pub fn priority(&self) -> i32 {
        match self {
            Self::Anomaly(_) => 10,
            _ => 0,
        }
    }

    fn reasoner(&self) -> &Arc<dyn Reasoner> {
        match self {
            Self::Personalization(r) | Self::Inventory(r) | Self::Communication(r) | Self::Anomaly(r) => r,
        }
    }

    /// Does this worker take ownership of the event
    pub fn claims(&self, event: &Event) -> bool {
        match self {
            Self::Personalization(_) => event.category == EventCategory::Personalization,
            Self::Inventory(_) => {
                event.category == EventCategory::Inventory && !is_inventory_anomaly(event)
            }
            Self::Communication(_) => event.category == EventCategory::Notification,
            Self::Anomaly(_) => {
                event.category == EventCategory::Anomaly || is_inventory_anomaly(event)
            }
        }
    }

    /// Read-only calls whose results ground the reasoning request
    pub fn grounding(&self, event: &Event) -> Vec<GatewayCall> {
        let resource = event.resource_id.as_str();
        match self {
            Self::Personalization(_) => {
                let mut calls = vec![GatewayCall::get_cart(resource)];
                if let Some(product) = event.payload_str("product_id") {
                    calls.push(GatewayCall::get_product(product));
                }
                calls
            }
            Self::Inventory(_) => vec![
                GatewayCall::get_product(event.payload_str("product_id").unwrap_or(resource)),
                GatewayCall::list_orders(resource),
            ],
            Self::Communication(_) | Self::Anomaly(_) => vec![GatewayCall::list_orders(resource)],
        }
    }

    /// Worker-specific hints for the reasoning engine
    pub fn hints(&self, context: &WorkflowContext) -> serde_json::Value {
        let event = &context.event;
        match self {
            Self::Anomaly(_) => {
                let anomaly = anomaly_type(event);
                json!({
                    "anomaly_type": anomaly,
                    "severity": severity(anomaly),
                    "strategies": resolution_strategies(anomaly),
                    "retries": context.retries,
                })
            }
            Self::Communication(_) => {
                let name = message_template(event);
                let template = templates::template(name);
                json!({
                    "template": name,
                    "subject": template.subject,
                    "body": template.body,
                })
            }
            Self::Inventory(_) => json!({
                "current_stock": event.payload.get("current_stock"),
                "threshold": stock_threshold(event),
            }),
            Self::Personalization(_) => json!({}),
        }
    }

    /// Ask the reasoning engine for a decision
    pub async fn handle(&self, context: &WorkflowContext) -> Result<Decision, ReasoningFailure> {
        let request = ReasoningRequest {
            worker: self.name().to_string(),
            context: context.clone(),
            allowed_actions: machine::allowed_actions(context.state).to_vec(),
            hints: self.hints(context),
        };

        let decision = self.reasoner().infer(&request).await?;
        decision.check().map_err(ReasoningFailure::MalformedOutput)?;
        Ok(decision)
    }

    /// Deterministic decision used when reasoning keeps failing
    pub fn fallback(&self, context: &WorkflowContext) -> Decision {
        fallback_decision(context)
    }
}

/// Deterministic decision for a context, by workflow kind
pub fn fallback_decision(context: &WorkflowContext) -> Decision {
    let event = &context.event;
    match context.kind {
        WorkflowKind::AnomalyResolution => {
            let anomaly = anomaly_type(event);
            Decision::new(
                Action::Escalate,
                0.6,
                format!("Manual intervention required for {}", anomaly),
            )
            .with_parameters(json!({ "priority": severity(anomaly) }))
        }
        WorkflowKind::InventoryReroute => match context.state {
            WorkflowState::Inventory(InventoryState::ShortageProjected) => {
                let template = templates::template("delay_notification");
                Decision::new(
                    Action::RerouteOrders,
                    0.5,
                    "Projected shortage; rerouting affected orders",
                )
                .with_parameters(json!({
                    "subject": template.subject,
                    "message": template.body,
                }))
            }
            _ => {
                let threshold = stock_threshold(event);
                match event.payload.get("current_stock").and_then(|v| v.as_i64()) {
                    Some(stock) if stock <= threshold => Decision::new(
                        Action::ProjectShortage,
                        0.5,
                        format!("Stock {} at or below threshold {}", stock, threshold),
                    ),
                    _ => Decision::new(Action::Hold, 0.5, "Stock level not conclusive; monitoring"),
                }
            }
        },
        WorkflowKind::CustomerNotification => {
            let name = message_template(event);
            let template = templates::template(name);
            Decision::new(Action::SendNotification, 0.5, "Fallback message")
                .with_parameters(json!({
                    "recipient": event.payload_str("user_id").unwrap_or(&event.resource_id),
                    "template": name,
                    "subject": template.subject,
                    "body": template.body,
                }))
        }
        WorkflowKind::Personalization => {
            let recommendations = event
                .payload
                .get("recommendations")
                .cloned()
                .unwrap_or_else(|| json!([]));
            Decision::new(Action::Recommend, 0.4, "Fallback recommendations")
                .with_parameters(json!({ "recommendations": recommendations }))
        }
    }
}

/// Reasoner that always answers with the deterministic fallback decision
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleReasoner;

#[async_trait]
impl Reasoner for RuleReasoner {
    fn name(&self) -> &str {
        "rules"
    }

    async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
        Ok(fallback_decision(&request.context))
    }
}

fn is_inventory_anomaly(event: &Event) -> bool {
    event.category == EventCategory::Inventory
        && event
            .payload_str("reason")
            .map_or(false, |reason| ANOMALY_REASONS.contains(&reason))
}

/// Anomaly type from the payload (`reason`, then `event_type`)
fn anomaly_type(event: &Event) -> &str {
    event
        .payload_str("reason")
        .or_else(|| event.payload_str("event_type"))
        .unwrap_or("generic")
}

/// Severity of an anomaly type
pub fn severity(anomaly_type: &str) -> &'static str {
    match anomaly_type {
        "system_error" => "critical",
        "payment_failed" | "security_alert" => "high",
        "inventory_low" | "shipping_delayed" | "performance_degradation" => "medium",
        "stock_discrepancy" | "negative_stock" => "high",
        _ => "medium",
    }
}

/// Known resolution strategies for an anomaly type
pub fn resolution_strategies(anomaly_type: &str) -> &'static [&'static str] {
    match anomaly_type {
        "payment_failed" => &["retry_payment", "alternative_payment", "manual_review"],
        "inventory_low" => &["reorder_stock", "redistribute_inventory", "substitute_product"],
        "shipping_delayed" => &["expedite_shipping", "alternative_carrier", "compensate_customer"],
        "system_error" => &["restart_service", "failover", "escalate_support"],
        "performance_degradation" => &["scale_resources", "optimize_queries", "cache_data"],
        "security_alert" => &["block_suspicious_activity", "notify_security_team", "audit_logs"],
        _ => &["escalate_support"],
    }
}

/// Template named in the payload, else the one matching its event type
fn message_template(event: &Event) -> &'static str {
    event
        .payload_str("template")
        .and_then(templates::known)
        .unwrap_or_else(|| templates::for_event_type(event.payload_str("event_type").unwrap_or_default()))
}

fn stock_threshold(event: &Event) -> i64 {
    event
        .payload
        .get("threshold")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_STOCK_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AnomalyState;
    use uuid::Uuid;

    fn context(kind: WorkflowKind, event: Event) -> WorkflowContext {
        WorkflowContext {
            event,
            workflow_id: Uuid::new_v4(),
            kind,
            state: kind.initial_state(),
            history: Vec::new(),
            retries: 0,
            grounding: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_inventory_claims_split() {
        let anomaly = Worker::Anomaly(Arc::new(RuleReasoner));
        let inventory = Worker::Inventory(Arc::new(RuleReasoner));

        let low = Event::new(EventCategory::Inventory, "sku-1", json!({"reason": "low_stock"}), "test");
        let broken = Event::new(EventCategory::Inventory, "sku-1", json!({"reason": "negative_stock"}), "test");

        assert!(inventory.claims(&low));
        assert!(!anomaly.claims(&low));
        assert!(anomaly.claims(&broken));
        assert!(!inventory.claims(&broken));
    }

    #[test]
    fn test_anomaly_fallback_escalates() {
        let event = Event::new(EventCategory::Anomaly, "order-42", json!({"reason": "payment_failed"}), "test");
        let mut ctx = context(WorkflowKind::AnomalyResolution, event);
        ctx.state = WorkflowState::Anomaly(AnomalyState::Diagnosing);

        let decision = fallback_decision(&ctx);
        assert_eq!(decision.action, Action::Escalate);
        assert_eq!(decision.param_str("priority"), Some("high"));
        assert!(decision.rationale.contains("payment_failed"));
    }

    #[test]
    fn test_inventory_fallback_uses_threshold() {
        let low = Event::new(
            EventCategory::Inventory,
            "sku-1",
            json!({"current_stock": 3, "threshold": 5}),
            "test",
        );
        assert_eq!(
            fallback_decision(&context(WorkflowKind::InventoryReroute, low)).action,
            Action::ProjectShortage
        );

        let plenty = Event::new(EventCategory::Inventory, "sku-1", json!({"current_stock": 50}), "test");
        assert_eq!(
            fallback_decision(&context(WorkflowKind::InventoryReroute, plenty)).action,
            Action::Hold
        );
    }

    #[test]
    fn test_communication_fallback_uses_template() {
        let event = Event::new(
            EventCategory::Notification,
            "order-7",
            json!({"event_type": "shipping_delayed"}),
            "test",
        );
        let decision = fallback_decision(&context(WorkflowKind::CustomerNotification, event));
        assert_eq!(decision.action, Action::SendNotification);
        assert_eq!(decision.param_str("template"), Some("delay_notification"));
        assert_eq!(decision.param_str("subject"), Some("Update on Your Order"));
        assert_eq!(decision.param_str("recipient"), Some("order-7"));
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(severity("system_error"), "critical");
        assert_eq!(severity("payment_failed"), "high");
        assert_eq!(severity("shipping_delayed"), "medium");
        assert_eq!(resolution_strategies("payment_failed")[0], "retry_payment");
    }

    #[tokio::test]
    async fn test_handle_sends_allowed_actions() {
        struct Capture(parking_lot::Mutex<Option<ReasoningRequest>>);

        #[async_trait]
        impl Reasoner for Capture {
            fn name(&self) -> &str {
                "capture"
            }
            async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure> {
                *self.0.lock() = Some(request.clone());
                Ok(Decision::new(Action::Retry, 0.9, "try again"))
            }
        }

        let capture = Arc::new(Capture(parking_lot::Mutex::new(None)));
        let worker = Worker::Anomaly(capture.clone());
        let event = Event::new(EventCategory::Anomaly, "order-42", json!({"reason": "system_error"}), "test");
        let mut ctx = context(WorkflowKind::AnomalyResolution, event);
        ctx.state = WorkflowState::Anomaly(AnomalyState::Diagnosing);

        let decision = worker.handle(&ctx).await.unwrap();
        assert_eq!(decision.action, Action::Retry);

        let request = capture.0.lock().clone().unwrap();
        assert_eq!(request.worker, "anomaly");
        assert!(request.allowed_actions.contains(&Action::Escalate));
        assert_eq!(request.hints["severity"], "critical");
    }
}
