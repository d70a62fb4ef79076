//! Journal Integration Tests
//!
//! Tests for persisting workflows to the JSONL journal and recovering
//! state, history and lock ownership from it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aegis::core::{DispatchOutcome, LockTable, WorkflowJournal, WorkflowStore};
use aegis::domain::{
    EventCategory, HistoryEvent, NotificationState, WorkflowKey, WorkflowKind, WorkflowState,
};
use aegis::workers::WorkerRegistry;
use common::{Mode, MockBackend, Rules};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

async fn journaled_store(dir: &TempDir) -> Arc<WorkflowStore> {
    let journal = WorkflowJournal::open(dir.path().join("state").join("workflows.jsonl"))
        .await
        .unwrap();
    Arc::new(WorkflowStore::with_journal(journal))
}

#[tokio::test]
async fn test_resting_workflow_survives_restart() {
    let dir = TempDir::new().unwrap();

    let before = {
        let dispatcher = common::dispatcher(
            common::quick_config(),
            WorkerRegistry::standard(Arc::new(Rules)),
            MockBackend::new(Mode::Healthy),
            journaled_store(&dir).await,
        );
        let event = common::event(EventCategory::Notification, "order-7", json!({"event_type": "order_created"}));
        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Rested { .. }));

        let replayed = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(replayed, DispatchOutcome::Duplicate);
        (dispatcher.status("order-7"), event)
    };
    let (statuses, first_event) = before;

    // Fresh process over the same journal
    let backend = MockBackend::new(Mode::Healthy);
    let store = journaled_store(&dir).await;
    let dispatcher = common::dispatcher(
        common::quick_config(),
        WorkerRegistry::standard(Arc::new(Rules)),
        backend.clone(),
        store.clone(),
    );
    assert_eq!(dispatcher.recover().await.unwrap(), 0);

    assert_eq!(dispatcher.status("order-7"), statuses);
    let key = WorkflowKey::new("order-7", WorkflowKind::CustomerNotification);
    let restored = store.get(&key).unwrap();
    assert_eq!(restored.state, WorkflowState::Notification(NotificationState::Sent));
    assert_eq!(restored.completed_steps.len(), 1);

    // Already absorbed before the restart
    assert_eq!(
        dispatcher.dispatch(&first_event).await.unwrap(),
        DispatchOutcome::Duplicate
    );

    let ack = common::event(EventCategory::Notification, "order-7", json!({"acknowledged": true}));
    assert!(matches!(
        dispatcher.dispatch(&ack).await.unwrap(),
        DispatchOutcome::Terminated {
            state: WorkflowState::Notification(NotificationState::Acknowledged),
            ..
        }
    ));
    assert!(backend.mutations().is_empty());
}

#[tokio::test]
async fn test_store_round_trip_with_lock() {
    let dir = TempDir::new().unwrap();
    let store = journaled_store(&dir).await;

    let key = WorkflowKey::new("sku-9", WorkflowKind::InventoryReroute);
    let (mut workflow, _) = store.get_or_create(&key, Uuid::new_v4());
    workflow.record(HistoryEvent::EventReceived {
        event_id: Uuid::new_v4(),
    });
    workflow.retries = 2;

    let locks = LockTable::new();
    let lock = locks
        .try_acquire("sku-9", workflow.workflow_id, Duration::from_secs(600))
        .unwrap();
    store.save(&workflow, Some(&lock)).await.unwrap();

    let reopened = journaled_store(&dir).await;
    let restored_locks = reopened.load().await.unwrap();

    assert_eq!(restored_locks, vec![lock]);
    assert_eq!(reopened.get(&key), Some(workflow));
}

#[tokio::test]
async fn test_recovered_lock_defers_other_workflows() {
    let dir = TempDir::new().unwrap();
    let store = journaled_store(&dir).await;

    // A workflow that crashed mid-step while holding order-3
    let key = WorkflowKey::new("order-3", WorkflowKind::AnomalyResolution);
    let (workflow, _) = store.get_or_create(&key, Uuid::new_v4());
    let lock = LockTable::new()
        .try_acquire("order-3", workflow.workflow_id, Duration::from_secs(600))
        .unwrap();
    store.save(&workflow, Some(&lock)).await.unwrap();

    let dispatcher = common::dispatcher(
        common::quick_config(),
        WorkerRegistry::standard(Arc::new(Rules)),
        MockBackend::new(Mode::Healthy),
        journaled_store(&dir).await,
    );
    assert_eq!(dispatcher.recover().await.unwrap(), 1);
    assert_eq!(dispatcher.lock_holder("order-3"), Some(workflow.workflow_id));

    let event = common::event(EventCategory::Notification, "order-3", json!({}));
    assert_eq!(
        dispatcher.dispatch(&event).await.unwrap(),
        DispatchOutcome::Deferred {
            holder: workflow.workflow_id
        }
    );
}
