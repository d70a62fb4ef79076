//! Worker registry: which workers serve which event category.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::Worker;
use crate::domain::{Event, EventCategory};
use crate::reasoning::Reasoner;

#[derive(Debug, Clone)]
struct Registration {
    priority: i32,
    worker: Worker,
}

/// Category to ordered worker list
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    registrations: HashMap<EventCategory, Vec<Registration>>,
    resolved: HashMap<EventCategory, Vec<Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in workers sharing one reasoner
    pub fn standard(reasoner: Arc<dyn Reasoner>) -> Self {
        let mut registry = Self::new();
        registry.register(EventCategory::Inventory, Worker::Inventory(reasoner.clone()));
        registry.register(EventCategory::Inventory, Worker::Anomaly(reasoner.clone()));
        registry.register(EventCategory::Anomaly, Worker::Anomaly(reasoner.clone()));
        registry.register(EventCategory::Notification, Worker::Communication(reasoner.clone()));
        registry.register(EventCategory::Personalization, Worker::Personalization(reasoner));
        registry
    }

    /// Register a worker at its default priority
    pub fn register(&mut self, category: EventCategory, worker: Worker) {
        let priority = worker.priority();
        self.register_with_priority(category, worker, priority);
    }

    /// Register a worker; higher priority is consulted first, ties keep
    /// registration order
    pub fn register_with_priority(&mut self, category: EventCategory, worker: Worker, priority: i32) {
        debug!(%category, worker = worker.name(), priority, "Registering worker");
        let entries = self.registrations.entry(category).or_default();
        entries.push(Registration { priority, worker });
        entries.sort_by_key(|r| std::cmp::Reverse(r.priority));

        self.resolved
            .insert(category, entries.iter().map(|r| r.worker.clone()).collect());
    }

    /// Workers for a category in priority order
    pub fn resolve(&self, category: EventCategory) -> &[Worker] {
        self.resolved
            .get(&category)
            .map(|workers| workers.as_slice())
            .unwrap_or(&[])
    }

    /// First worker in priority order that claims the event
    pub fn claimant(&self, event: &Event) -> Option<&Worker> {
        self.resolve(event.category)
            .iter()
            .find(|worker| worker.claims(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkflowKind;
    use crate::workers::RuleReasoner;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        let registry = WorkerRegistry::standard(Arc::new(RuleReasoner));

        let names: Vec<&str> = registry
            .resolve(EventCategory::Inventory)
            .iter()
            .map(|w| w.name())
            .collect();
        assert_eq!(names, vec!["anomaly", "inventory"]);
        assert_eq!(registry.resolve(EventCategory::Notification).len(), 1);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let mut registry = WorkerRegistry::new();
        let reasoner: Arc<dyn Reasoner> = Arc::new(RuleReasoner);
        registry.register_with_priority(EventCategory::Anomaly, Worker::Communication(reasoner.clone()), 5);
        registry.register_with_priority(EventCategory::Anomaly, Worker::Anomaly(reasoner.clone()), 5);
        registry.register_with_priority(EventCategory::Anomaly, Worker::Inventory(reasoner), 1);

        let names: Vec<&str> = registry
            .resolve(EventCategory::Anomaly)
            .iter()
            .map(|w| w.name())
            .collect();
        assert_eq!(names, vec!["communication", "anomaly", "inventory"]);
    }

    #[test]
    fn test_claimant_short_circuits() {
        let registry = WorkerRegistry::standard(Arc::new(RuleReasoner));

        let discrepancy = Event::new(
            EventCategory::Inventory,
            "sku-1",
            json!({"reason": "stock_discrepancy"}),
            "test",
        );
        let low = Event::new(EventCategory::Inventory, "sku-1", json!({"current_stock": 2}), "test");

        assert_eq!(
            registry.claimant(&discrepancy).map(|w| w.kind()),
            Some(WorkflowKind::AnomalyResolution)
        );
        assert_eq!(
            registry.claimant(&low).map(|w| w.kind()),
            Some(WorkflowKind::InventoryReroute)
        );
        assert!(WorkerRegistry::new().claimant(&low).is_none());
    }
}
