//! Dispatcher counters and operator-visible incidents.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Workflow, WorkflowState};

/// Monotonic dispatcher counters
#[derive(Debug, Default)]
pub struct Metrics {
    processed: AtomicU64,
    deferred: AtomicU64,
    duplicates: AtomicU64,
    unclaimed: AtomicU64,
    reasoning_failures: AtomicU64,
    gateway_failures: AtomicU64,
    terminated: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events absorbed by a workflow
    pub processed: u64,
    /// Events deferred on lock contention
    pub deferred: u64,
    /// Redelivered events acked without side effects
    pub duplicates: u64,
    /// Events no worker claimed
    pub unclaimed: u64,
    pub reasoning_failures: u64,
    pub gateway_failures: u64,
    /// Workflows that reached a terminal state
    pub terminated: u64,
}

macro_rules! counter {
    ($name:ident) => {
        pub fn $name(&self) {
            self.$name.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    counter!(processed);
    counter!(deferred);
    counter!(duplicates);
    counter!(unclaimed);
    counter!(reasoning_failures);
    counter!(gateway_failures);
    counter!(terminated);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unclaimed: self.unclaimed.load(Ordering::Relaxed),
            reasoning_failures: self.reasoning_failures.load(Ordering::Relaxed),
            gateway_failures: self.gateway_failures.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
        }
    }
}

/// Operator-visible error record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub at: DateTime<Utc>,
    pub resource_id: String,
    pub workflow_id: Option<Uuid>,
    pub state: Option<WorkflowState>,
    pub reason: String,
}

impl Incident {
    pub fn for_workflow(workflow: &Workflow, reason: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            resource_id: workflow.resource_id.clone(),
            workflow_id: Some(workflow.workflow_id),
            state: Some(workflow.state),
            reason: reason.into(),
        }
    }

    pub fn for_resource(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            resource_id: resource_id.into(),
            workflow_id: None,
            state: None,
            reason: reason.into(),
        }
    }
}

/// Append-only incident list
#[derive(Debug, Default)]
pub struct IncidentLog {
    incidents: Mutex<Vec<Incident>>,
}

impl IncidentLog {
    pub fn push(&self, incident: Incident) {
        self.incidents.lock().push(incident);
    }

    pub fn all(&self) -> Vec<Incident> {
        self.incidents.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.incidents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::default();
        metrics.deferred();
        metrics.deferred();
        metrics.processed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.deferred, 2);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.terminated, 0);
    }
}
