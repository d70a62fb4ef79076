//! Backend notification mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::{Event, EventCategory, IngestError};

/// A raw notification as emitted by the e-commerce backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendNotification {
    /// Backend event type (`order_created`, `inventory_low`, ...)
    pub event_type: String,

    /// Event fields as sent by the backend
    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub id: Option<Uuid>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Category and the data field naming the resource, per backend type
fn route(event_type: &str) -> Option<(EventCategory, &'static str)> {
    match event_type {
        "order_created" | "shipping_delayed" => Some((EventCategory::Notification, "order_id")),
        "cart_updated" | "user_browsing" => Some((EventCategory::Personalization, "user_id")),
        "inventory_low" => Some((EventCategory::Inventory, "product_id")),
        "payment_failed" => Some((EventCategory::Anomaly, "order_id")),
        "system_error" => Some((EventCategory::Anomaly, "service")),
        _ => None,
    }
}

impl BackendNotification {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data: match data {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            id: None,
            timestamp: None,
        }
    }

    /// Parse a notification from backend JSON
    pub fn from_json(json: &str) -> Result<Self, IngestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Map onto a typed event.
    ///
    /// The payload carries every data field plus `event_type`; anomalies
    /// also get a `reason` so workers can classify them.
    pub fn into_event(self, source: impl Into<String>) -> Result<Event, IngestError> {
        let event_type = self.event_type.trim().to_string();
        let (category, resource_field) =
            route(&event_type).ok_or_else(|| IngestError::UnknownEventType(event_type.clone()))?;

        let resource_id = match self.data.get(resource_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ if event_type == "system_error" => "platform".to_string(),
            _ => String::new(),
        };

        let mut payload = self.data;
        payload.insert("event_type".to_string(), Value::String(event_type.clone()));
        if category == EventCategory::Anomaly {
            payload
                .entry("reason")
                .or_insert_with(|| Value::String(event_type.clone()));
        }
        if event_type == "user_browsing" && !payload.contains_key("product_id") {
            let first_viewed = payload
                .get("products_viewed")
                .and_then(|v| v.as_array())
                .and_then(|viewed| viewed.first())
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(product) = first_viewed {
                payload.insert("product_id".to_string(), Value::String(product));
            }
        }

        let mut event = Event::new(category, resource_id, Value::Object(payload), source);
        if let Some(id) = self.id {
            event.id = id;
        }
        if let Some(timestamp) = self.timestamp {
            event.timestamp = timestamp;
        }
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_created_becomes_notification() {
        let event = BackendNotification::new(
            "order_created",
            json!({"order_id": "order-7", "user_id": "u-1"}),
        )
        .into_event("webhook")
        .unwrap();

        assert_eq!(event.category, EventCategory::Notification);
        assert_eq!(event.resource_id, "order-7");
        assert_eq!(event.payload_str("event_type"), Some("order_created"));
        assert_eq!(event.payload_str("user_id"), Some("u-1"));
        assert_eq!(event.source, "webhook");
    }

    #[test]
    fn test_anomalies_carry_reason() {
        let payment = BackendNotification::new(
            "payment_failed",
            json!({"order_id": "order-42", "error_reason": "card declined"}),
        )
        .into_event("webhook")
        .unwrap();
        assert_eq!(payment.category, EventCategory::Anomaly);
        assert_eq!(payment.payload_str("reason"), Some("payment_failed"));

        let outage = BackendNotification::new("system_error", json!({"message": "db down"}))
            .into_event("webhook")
            .unwrap();
        assert_eq!(outage.resource_id, "platform");
        assert_eq!(outage.payload_str("reason"), Some("system_error"));
    }

    #[test]
    fn test_browsing_picks_first_viewed_product() {
        let event = BackendNotification::new(
            "user_browsing",
            json!({"user_id": "u-9", "products_viewed": ["p-1", "p-2"]}),
        )
        .into_event("webhook")
        .unwrap();

        assert_eq!(event.category, EventCategory::Personalization);
        assert_eq!(event.resource_id, "u-9");
        assert_eq!(event.payload_str("product_id"), Some("p-1"));
    }

    #[test]
    fn test_numeric_resource_ids() {
        let event = BackendNotification::new("inventory_low", json!({"product_id": 17, "current_stock": 2}))
            .into_event("poller")
            .unwrap();
        assert_eq!(event.category, EventCategory::Inventory);
        assert_eq!(event.resource_id, "17");
    }

    #[test]
    fn test_rejections() {
        let unknown = BackendNotification::new("order_teleported", json!({"order_id": "o-1"}))
            .into_event("webhook");
        assert!(matches!(unknown, Err(IngestError::UnknownEventType(t)) if t == "order_teleported"));

        let missing = BackendNotification::new("cart_updated", json!({"cart_data": {}}))
            .into_event("webhook");
        assert!(matches!(missing, Err(IngestError::MissingResourceId)));
    }
}
