//! Core coordination logic.
//!
//! This module contains:
//! - Dispatcher: Routes events to workers and drives workflows
//! - Machine: Per-kind state machines as pure functions
//! - Store: Workflow store with its append-only journal
//! - Lock: Per-resource lock table
//! - Retry: Backoff policy shared across components

pub mod dispatcher;
pub mod journal;
pub mod lock;
pub mod machine;
pub mod metrics;
pub mod retry;
pub mod store;

// Re-export commonly used types
pub use dispatcher::{
    DispatchError, DispatchOutcome, Dispatcher, DispatcherConfig, SweepReport, WorkflowStatus,
};
pub use journal::{generate_idempotency_key, JournalRecord, WorkflowJournal};
pub use lock::{LockContention, LockTable, ResourceLock};
pub use machine::{InvalidTransition, MachineLimits};
pub use metrics::{Incident, MetricsSnapshot};
pub use retry::RetryPolicy;
pub use store::WorkflowStore;
