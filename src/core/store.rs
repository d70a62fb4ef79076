//! Workflow store.
//!
//! Holds active workflows keyed by `(resource_id, kind)`, an archive of
//! terminal ones, and an event-id index for duplicate detection. The store
//! is injected into the dispatcher; it is the only place workflow state
//! lives.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::journal::{JournalRecord, WorkflowJournal};
use super::lock::ResourceLock;
use crate::domain::{Workflow, WorkflowKey};

/// In-memory workflow store with an optional journal
#[derive(Default)]
pub struct WorkflowStore {
    active: DashMap<WorkflowKey, Workflow>,
    archived: DashMap<Uuid, Workflow>,
    seen: DashMap<Uuid, Uuid>,
    journal: Option<WorkflowJournal>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that appends every save and archive to a journal
    pub fn with_journal(journal: WorkflowJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn journal(&self) -> Option<&WorkflowJournal> {
        self.journal.as_ref()
    }

    /// Active workflow for a key
    pub fn get(&self, key: &WorkflowKey) -> Option<Workflow> {
        self.active.get(key).map(|w| w.clone())
    }

    /// Active workflow for a key, created in its initial state if absent.
    /// Returns the workflow and whether it was created.
    pub fn get_or_create(&self, key: &WorkflowKey, workflow_id: Uuid) -> (Workflow, bool) {
        let mut created = false;
        let workflow = self
            .active
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Workflow::new(workflow_id, key.resource_id.clone(), key.kind)
            })
            .clone();
        if created {
            debug!(workflow_id = %workflow_id, key = %key, "Workflow created");
        }
        (workflow, created)
    }

    /// Persist the latest snapshot of an active workflow
    pub async fn save(&self, workflow: &Workflow, lock: Option<&ResourceLock>) -> Result<()> {
        self.index(workflow);
        self.active.insert(workflow.key(), workflow.clone());
        self.append(workflow, lock, false).await
    }

    /// Move a workflow to the archive
    pub async fn archive(&self, workflow: &Workflow) -> Result<()> {
        self.index(workflow);
        self.active
            .remove_if(&workflow.key(), |_, w| w.workflow_id == workflow.workflow_id);
        self.archived.insert(workflow.workflow_id, workflow.clone());
        info!(
            workflow_id = %workflow.workflow_id,
            resource_id = %workflow.resource_id,
            state = %workflow.state,
            "Workflow archived"
        );
        self.append(workflow, None, true).await
    }

    async fn append(&self, workflow: &Workflow, lock: Option<&ResourceLock>, archived: bool) -> Result<()> {
        match &self.journal {
            Some(journal) => {
                journal
                    .append(&JournalRecord {
                        workflow: workflow.clone(),
                        lock: lock.cloned(),
                        archived,
                    })
                    .await
            }
            None => Ok(()),
        }
    }

    fn index(&self, workflow: &Workflow) {
        for event_id in &workflow.seen_events {
            self.seen.insert(*event_id, workflow.workflow_id);
        }
    }

    /// Active and archived workflows for a resource, oldest first
    pub fn by_resource(&self, resource_id: &str) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .active
            .iter()
            .filter(|e| e.key().resource_id == resource_id)
            .map(|e| e.value().clone())
            .chain(
                self.archived
                    .iter()
                    .filter(|e| e.value().resource_id == resource_id)
                    .map(|e| e.value().clone()),
            )
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    /// All active workflows
    pub fn active(&self) -> Vec<Workflow> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// All archived workflows
    pub fn archived(&self) -> Vec<Workflow> {
        self.archived.iter().map(|e| e.value().clone()).collect()
    }

    /// Archived workflow by id
    pub fn archived_by_id(&self, workflow_id: &Uuid) -> Option<Workflow> {
        self.archived.get(workflow_id).map(|w| w.clone())
    }

    /// Keys of active workflows older than `ttl`
    pub fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<WorkflowKey> {
        self.active
            .iter()
            .filter(|e| e.value().is_expired(now, ttl))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Has any workflow absorbed this event
    pub fn has_seen(&self, event_id: &Uuid) -> bool {
        self.seen.contains_key(event_id)
    }

    /// Rebuild from journal records, returning the locks still held.
    ///
    /// The last record per workflow wins; a resource's lock is the one in
    /// its most recent record.
    pub fn restore(&self, records: Vec<JournalRecord>) -> Vec<ResourceLock> {
        let mut latest: HashMap<Uuid, JournalRecord> = HashMap::new();
        let mut order: Vec<Uuid> = Vec::new();
        let mut locks: HashMap<String, Option<ResourceLock>> = HashMap::new();

        for record in records {
            locks.insert(record.workflow.resource_id.clone(), record.lock.clone());
            let id = record.workflow.workflow_id;
            if latest.insert(id, record).is_none() {
                order.push(id);
            }
        }

        for id in order {
            let Some(record) = latest.remove(&id) else {
                continue;
            };
            self.index(&record.workflow);
            if record.archived {
                self.active
                    .remove_if(&record.workflow.key(), |_, w| w.workflow_id == id);
                self.archived.insert(id, record.workflow);
            } else {
                self.active.insert(record.workflow.key(), record.workflow);
            }
        }

        info!(
            active = self.active.len(),
            archived = self.archived.len(),
            "Workflow store restored"
        );

        locks.into_values().flatten().collect()
    }

    /// Replay the attached journal into this store
    pub async fn load(&self) -> Result<Vec<ResourceLock>> {
        match &self.journal {
            Some(journal) => {
                let records = journal.replay().await?;
                Ok(self.restore(records))
            }
            None => Ok(Vec::new()),
        }
    }
}
