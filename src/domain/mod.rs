//! Domain types for the coordination core.
//!
//! This module contains the core data structures:
//! - Events: Immutable inbound records routed by the dispatcher
//! - Workflow: Per-resource state machines and their history
//! - Decision: Worker output consumed to drive transitions

pub mod decision;
pub mod events;
pub mod workflow;

// Re-export commonly used types
pub use decision::{Action, Decision};
pub use events::{Event, EventCategory, IngestError};
pub use workflow::{
    AnomalyState, HistoryEntry, HistoryEvent, InventoryState, NotificationState,
    PersonalizationState, Workflow, WorkflowKey, WorkflowKind, WorkflowState,
};
