//! Decisions produced by workers.
//!
//! A decision is consumed immediately by the dispatcher to pick the next
//! transition; it is kept on the workflow only so execute-states can read
//! the parameters it carried.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured output of a reasoning call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// What the worker recommends doing next
    pub action: Action,

    /// Action parameters (message text, recipient, order ids, ...)
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,

    /// Self-reported confidence in [0, 1]
    pub confidence: f64,

    /// Human-readable justification
    #[serde(default)]
    pub rationale: String,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Decision {
    /// Create a decision with no parameters
    pub fn new(action: Action, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            action,
            parameters: empty_parameters(),
            confidence,
            rationale: rationale.into(),
        }
    }

    /// Attach parameters
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Read a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Check structural validity (confidence range, parameter shape)
    pub fn check(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if !self.parameters.is_object() {
            return Err("parameters must be a JSON object".to_string());
        }
        Ok(())
    }
}

/// Closed set of actions a worker may recommend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Retry the failed operation (anomaly)
    Retry,

    /// Reroute the order (anomaly)
    Reroute,

    /// Hand the problem to a human
    Escalate,

    /// Nothing left to do
    Resolve,

    /// Give up without further calls
    Abandon,

    /// Stock will run out (inventory)
    ProjectShortage,

    /// Keep monitoring (inventory)
    Hold,

    /// Move affected orders to other stock (inventory)
    RerouteOrders,

    /// Send a message to the customer
    SendNotification,

    /// Deliver product recommendations
    Recommend,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Reroute => "reroute",
            Self::Escalate => "escalate",
            Self::Resolve => "resolve",
            Self::Abandon => "abandon",
            Self::ProjectShortage => "project_shortage",
            Self::Hold => "hold",
            Self::RerouteOrders => "reroute_orders",
            Self::SendNotification => "send_notification",
            Self::Recommend => "recommend",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_defaults_parameters() {
        let decision: Decision =
            serde_json::from_str(r#"{"action": "retry", "confidence": 0.8}"#).unwrap();

        assert_eq!(decision.action, Action::Retry);
        assert!(decision.parameters.is_object());
        assert!(decision.rationale.is_empty());
        assert!(decision.check().is_ok());
    }

    #[test]
    fn test_decision_check_rejects_bad_confidence() {
        let decision = Decision::new(Action::Escalate, 1.5, "too sure");
        assert!(decision.check().is_err());

        let decision = Decision::new(Action::Escalate, f64::NAN, "unsure");
        assert!(decision.check().is_err());
    }

    #[test]
    fn test_unknown_action_fails_to_parse() {
        let parsed = serde_json::from_str::<Decision>(r#"{"action": "refund", "confidence": 0.5}"#);
        assert!(parsed.is_err());
    }
}
