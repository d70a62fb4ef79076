//! Inbound events routed by the dispatcher.
//!
//! Events are immutable once created. The bus hands them to the dispatcher,
//! which acks them only after the owning workflow has absorbed them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single event observed on the e-commerce backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Routing category
    pub category: EventCategory,

    /// Resource the event is about (order id, product id, user id)
    pub resource_id: String,

    /// Free-form payload from the producer
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the event was produced
    pub timestamp: DateTime<Utc>,

    /// Producer name (poller, webhook, operator)
    pub source: String,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp
    pub fn new(
        category: EventCategory,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            resource_id: resource_id.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Check the ingestion schema
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.resource_id.trim().is_empty() {
            return Err(IngestError::MissingResourceId);
        }
        Ok(())
    }

    /// Parse and validate an event from producer JSON.
    ///
    /// `id`, `timestamp` and `source` are optional on the wire; `category`
    /// and `resource_id` are mandatory and must be non-empty.
    pub fn from_json(json: &str) -> Result<Self, IngestError> {
        let raw: RawEvent = serde_json::from_str(json)?;
        raw.try_into()
    }

    /// Read a string field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Read a boolean flag from the payload (missing means false)
    pub fn payload_flag(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Wire shape accepted from producers before validation
#[derive(Debug, Deserialize)]
struct RawEvent {
    id: Option<Uuid>,
    #[serde(default)]
    category: String,
    #[serde(default)]
    resource_id: String,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: Option<DateTime<Utc>>,
    source: Option<String>,
}

impl TryFrom<RawEvent> for Event {
    type Error = IngestError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        if raw.category.trim().is_empty() {
            return Err(IngestError::MissingCategory);
        }
        let category = raw.category.parse()?;

        let event = Event {
            id: raw.id.unwrap_or_else(Uuid::new_v4),
            category,
            resource_id: raw.resource_id,
            payload: raw.payload,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            source: raw
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        event.validate()?;
        Ok(event)
    }
}

/// Routing category of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Browsing and cart activity
    Personalization,

    /// Stock level changes
    Inventory,

    /// Customer communication requests and acknowledgements
    Notification,

    /// Problems with an order or the platform
    Anomaly,
}

impl EventCategory {
    /// All categories, in subscription order
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Personalization,
        EventCategory::Inventory,
        EventCategory::Notification,
        EventCategory::Anomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personalization => "personalization",
            Self::Inventory => "inventory",
            Self::Notification => "notification",
            Self::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "personalization" => Ok(Self::Personalization),
            "inventory" => Ok(Self::Inventory),
            "notification" => Ok(Self::Notification),
            "anomaly" => Ok(Self::Anomaly),
            other => Err(IngestError::UnknownCategory(other.to_string())),
        }
    }
}

/// Schema violations rejected at ingestion
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Event is missing a category")]
    MissingCategory,

    #[error("Unknown event category: {0}")]
    UnknownCategory(String),

    #[error("Event is missing a resource_id")]
    MissingResourceId,

    #[error("Unknown backend event type: {0}")]
    UnknownEventType(String),

    #[error("Malformed event JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            EventCategory::Anomaly,
            "order-42",
            serde_json::json!({"reason": "payment_failed"}),
            "webhook",
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert_eq!(parsed.payload_str("reason"), Some("payment_failed"));
    }

    #[test]
    fn test_from_json_fills_optional_fields() {
        let event =
            Event::from_json(r#"{"category": "inventory", "resource_id": "sku-1"}"#).unwrap();

        assert_eq!(event.category, EventCategory::Inventory);
        assert_eq!(event.resource_id, "sku-1");
        assert_eq!(event.source, "unknown");
    }

    #[test]
    fn test_from_json_rejects_missing_fields() {
        let missing_category = Event::from_json(r#"{"resource_id": "order-1"}"#);
        assert!(matches!(missing_category, Err(IngestError::MissingCategory)));

        let blank_resource = Event::from_json(r#"{"category": "anomaly", "resource_id": "  "}"#);
        assert!(matches!(blank_resource, Err(IngestError::MissingResourceId)));

        let unknown = Event::from_json(r#"{"category": "billing", "resource_id": "order-1"}"#);
        assert!(matches!(unknown, Err(IngestError::UnknownCategory(c)) if c == "billing"));
    }

    #[test]
    fn test_payload_flag_defaults_false() {
        let event = Event::new(
            EventCategory::Notification,
            "order-7",
            serde_json::json!({"acknowledged": true}),
            "test",
        );
        assert!(event.payload_flag("acknowledged"));
        assert!(!event.payload_flag("delivery_failed"));
    }
}
