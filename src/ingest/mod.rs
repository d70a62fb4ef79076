//! Event ingestion.
//!
//! Producers either publish typed [`Event`](crate::domain::Event)s directly
//! or hand over raw backend notifications, which are mapped onto a routing
//! category and resource here. Both shapes can be mixed in a JSONL file:
//!
//! ```text
//! {"category": "anomaly", "resource_id": "order-42", "payload": {"reason": "payment_failed"}}
//! {"event_type": "shipping_delayed", "data": {"order_id": "order-7", "user_id": "u-1"}}
//! ```

pub mod backend;
pub mod file;

// Re-export key types
pub use backend::BackendNotification;
pub use file::{parse_line, read_events, EventLine};
