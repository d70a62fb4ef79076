//! aegis - Coordination core for autonomous e-commerce workflows
//!
//! An external layer that watches an unmodified e-commerce backend and
//! resolves what it sees through multi-step workflows, without ever
//! letting two workflows act on the same resource at once.
//!
//! # Architecture
//!
//! ```text
//! backend -> ingest -> EventBus -> Dispatcher -> WorkerRegistry -> Worker
//!                                      |                             |
//!                                 WorkflowStore                 Reasoner
//!                                      |
//!                                   Gateway -> backend
//! ```
//!
//! - Every event is owned by at most one workflow per resource; a busy
//!   resource defers the event instead of blocking.
//! - Workflows are explicit state machines whose history records every
//!   transition, failure and fallback.
//! - All backend traffic goes through the gateway's timeouts, retries
//!   and circuit breakers.
//!
//! # Modules
//!
//! - `bus`: In-process event bus with per-resource ordering and redelivery
//! - `core`: Dispatcher, state machines, locks, workflow store
//! - `domain`: Data structures (Event, Workflow, Decision)
//! - `gateway`: Policy-enforcing backend access
//! - `ingest`: Backend notification mapping and event files
//! - `reasoning`: Reasoning engine interface
//! - `workers`: Worker variants and registry
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Replay an event file through the core
//! aegis run --events events.jsonl
//!
//! # Inspect workflows for a resource
//! aegis status order-42 --history
//! ```

pub mod bus;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod gateway;
pub mod ingest;
pub mod reasoning;
pub mod workers;

// Re-export main types at crate root for convenience
pub use bus::{BusConfig, EventBus};
pub use config::Settings;
pub use core::{DispatchOutcome, Dispatcher, DispatcherConfig, WorkflowStore};
pub use domain::{Decision, Event, EventCategory, Workflow, WorkflowKind, WorkflowState};
pub use gateway::{Backend, Gateway, GatewayConfig};
pub use reasoning::{Reasoner, ReasoningConfig};
pub use workers::{Worker, WorkerRegistry};
