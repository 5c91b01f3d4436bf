//! Instance records and checkpointed execution
//!
//! A [`PersistedRecord`] is what an application stores per instance: the
//! opaque engine state plus the status and waiting tasks it needs to query
//! without decoding that state. The [`Checkpointer`] runs engine calls and
//! writes the record back after each one, marking it failed when a handler
//! error escapes.

use crate::engine::{AdvanceOutcome, Engine, TaskCompletion};
use crate::events::ExecutionContext;
use chrono::{DateTime, Utc};
use procflow_types::{DataBag, DefinitionSet, InstanceStatus, TaskId, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    /// Process id of the root definition
    pub definition_id: String,
    pub state: Vec<u8>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub current_waiting_task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PersistedRecord {
    pub fn new(definition_id: impl Into<String>, state: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_key: None,
            definition_id: definition_id.into(),
            state,
            status: InstanceStatus::Running,
            current_waiting_task_ids: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Record a successful engine call
    pub fn apply_outcome(&mut self, state: Vec<u8>, outcome: &AdvanceOutcome) {
        let now = Utc::now();
        self.state = state;
        self.status = outcome.status;
        self.current_waiting_task_ids = outcome.waiting_task_ids.clone();
        self.error_message = None;
        self.updated_at = now;
        if outcome.is_completed() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    /// Record a failed engine call; `state` is the last consistent state
    pub fn mark_failed(&mut self, state: Vec<u8>, message: impl Into<String>) {
        self.state = state;
        self.status = InstanceStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Instance record not found: {0}")]
    NotFound(String),

    #[error("Instance record already exists: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for instance records
pub trait InstanceStore {
    fn insert(&mut self, record: PersistedRecord) -> StoreResult<()>;
    fn update(&mut self, record: PersistedRecord) -> StoreResult<()>;
    fn get(&self, id: &str) -> StoreResult<PersistedRecord>;
    fn find_by_business_key(&self, key: &str) -> Option<PersistedRecord>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryInstanceStore {
    records: HashMap<String, PersistedRecord>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn insert(&mut self, record: PersistedRecord) -> StoreResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn update(&mut self, record: PersistedRecord) -> StoreResult<()> {
        match self.records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    fn get(&self, id: &str) -> StoreResult<PersistedRecord> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn find_by_business_key(&self, key: &str) -> Option<PersistedRecord> {
        self.records
            .values()
            .find(|r| r.business_key.as_deref() == Some(key))
            .cloned()
    }
}

// ── Checkpointer ─────────────────────────────────────────────────────

/// Runs engine calls against stored records
///
/// Every call loads the record, works on the decoded instance and saves the
/// record again, whether the call succeeded or not. On failure the record
/// keeps the state from just before the failing handler, so the same task
/// is retried by the next resume.
pub struct Checkpointer<P, S> {
    engine: Engine<P>,
    store: S,
}

impl<P, S: InstanceStore> Checkpointer<P, S> {
    pub fn new(engine: Engine<P>, store: S) -> Self {
        Self { engine, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create an instance, store it and advance it
    pub fn start(
        &mut self,
        definitions: DefinitionSet,
        data: DataBag,
        business_key: Option<String>,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> StoreResult<(PersistedRecord, AdvanceOutcome)> {
        let mut instance = self.engine.create(definitions, data, ctx)?;
        let mut record = PersistedRecord::new(
            instance.process_id.clone(),
            self.engine.persist(&instance)?,
        );
        record.business_key = business_key;
        self.store.insert(record.clone())?;
        tracing::info!(
            record_id = %record.id,
            instance_id = %instance.id.short(),
            process_id = %record.definition_id,
            "Instance record created"
        );

        let result = self.engine.advance(&mut instance, ctx);
        let state = self.engine.persist(&instance)?;
        let outcome = self.checkpoint(&mut record, state, result)?;
        Ok((record, outcome))
    }

    /// Resume a stored instance, optionally completing a WAITING task
    pub fn resume(
        &mut self,
        record_id: &str,
        completion: Option<TaskCompletion>,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> StoreResult<AdvanceOutcome> {
        let mut record = self.store.get(record_id)?;
        let mut instance = self.engine.restore(&record.state)?;

        let result = match completion {
            Some(c) => self
                .engine
                .complete_waiting(&mut instance, &c.task, c.data, ctx)
                .and_then(|_| self.engine.advance(&mut instance, ctx)),
            None => self.engine.advance(&mut instance, ctx),
        };
        let state = self.engine.persist(&instance)?;
        self.checkpoint(&mut record, state, result)
    }

    /// Correlate a message to a stored instance and advance it
    pub fn correlate(
        &mut self,
        record_id: &str,
        event_name: &str,
        payload: DataBag,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> StoreResult<AdvanceOutcome> {
        let mut record = self.store.get(record_id)?;
        let mut instance = self.engine.restore(&record.state)?;

        // Correlation errors leave the record untouched
        self.engine
            .correlate_event(&mut instance, event_name, payload, ctx)?;
        let result = self.engine.advance(&mut instance, ctx);
        let state = self.engine.persist(&instance)?;
        self.checkpoint(&mut record, state, result)
    }

    fn checkpoint(
        &mut self,
        record: &mut PersistedRecord,
        state: Vec<u8>,
        result: Result<AdvanceOutcome, WorkflowError>,
    ) -> StoreResult<AdvanceOutcome> {
        match result {
            Ok(outcome) => {
                record.apply_outcome(state, &outcome);
                self.store.update(record.clone())?;
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Instance failed");
                record.mark_failed(state, e.to_string());
                self.store.update(record.clone())?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRegistry;

    fn outcome(status: InstanceStatus, waiting: Vec<usize>) -> AdvanceOutcome {
        AdvanceOutcome {
            status,
            waiting_task_ids: waiting.into_iter().map(TaskId).collect(),
        }
    }

    #[test]
    fn test_apply_outcome_clears_error() {
        let mut record = PersistedRecord::new("p", vec![1]);
        record.mark_failed(vec![2], "boom");
        assert_eq!(record.status, InstanceStatus::Failed);

        record.apply_outcome(vec![3], &outcome(InstanceStatus::Waiting, vec![4]));
        assert_eq!(record.status, InstanceStatus::Waiting);
        assert_eq!(record.error_message, None);
        assert_eq!(record.current_waiting_task_ids, vec![TaskId(4)]);
        assert_eq!(record.state, vec![3]);
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_completed_outcome_sets_timestamp() {
        let mut record = PersistedRecord::new("p", vec![]);
        record.apply_outcome(vec![], &outcome(InstanceStatus::Completed, vec![]));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_store_insert_get_update() {
        let mut store = InMemoryInstanceStore::new();
        let record = PersistedRecord::new("p", vec![]).with_business_key("APP-1");
        let id = record.id.clone();
        store.insert(record.clone()).unwrap();

        assert!(matches!(
            store.insert(record.clone()),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.find_by_business_key("APP-1").unwrap().id, id);

        let mut changed = store.get(&id).unwrap();
        changed.status = InstanceStatus::Waiting;
        store.update(changed).unwrap();
        assert_eq!(store.get(&id).unwrap().status, InstanceStatus::Waiting);
    }

    #[test]
    fn test_update_missing_record() {
        let mut store = InMemoryInstanceStore::new();
        assert!(matches!(
            store.update(PersistedRecord::new("p", vec![])),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get("nope").is_err());
    }

    #[test]
    fn test_resume_unknown_record() {
        let engine: Engine<()> = Engine::new(HandlerRegistry::empty());
        let mut checkpointer = Checkpointer::new(engine, InMemoryInstanceStore::new());
        let mut unit = ();
        let result = checkpointer.resume("missing", None, &mut ExecutionContext::new(&mut unit));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
