//! Service task handlers and their registry
//!
//! A handler implements one service task. Handlers are registered once,
//! at process start, under either a qualified key `"{process_id}.{node_id}"`
//! or a bare node id; lookup tries the qualified key first. The registry is
//! immutable after it is built and may be shared across threads.
//!
//! `P` is the persistence context the application threads through to its
//! handlers (a database transaction, a repository handle, ...).

use procflow_types::{DataBag, TaskId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ── Contexts ─────────────────────────────────────────────────────────

/// What a handler sees of the task it executes
///
/// `data` is a working copy of the instance-wide data bag and `local` a
/// copy of the task's own data. Both are written back to the instance only
/// when the handler succeeds.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub node_id: String,
    pub name: String,
    /// Process id of the definition the task belongs to
    pub process_id: String,
    pub data: DataBag,
    pub local: DataBag,
}

impl TaskContext {
    /// Read an instance-wide value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set an instance-wide value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Read an instance-wide value that the handler requires
    pub fn require(&self, key: &str) -> Result<&Value, HandlerError> {
        self.data
            .get(key)
            .ok_or_else(|| HandlerError::MissingData(key.to_string()))
    }
}

/// The authenticated actor on whose behalf the engine is advancing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActorContext {
    pub id: String,
    pub attributes: BTreeMap<String, String>,
}

impl ActorContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ── Handler Trait ────────────────────────────────────────────────────

/// Errors a handler may report
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Missing required field: {0}")]
    MissingData(String),

    #[error("Invalid data for '{field}': {message}")]
    InvalidData { field: String, message: String },

    #[error("Handler rejected task: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Implementation of a service task
pub trait ServiceHandler<P>: Send + Sync {
    fn handle(
        &self,
        task: &mut TaskContext,
        persistence: &mut P,
        actor: Option<&ActorContext>,
    ) -> Result<(), HandlerError>;
}

impl<P, F> ServiceHandler<P> for F
where
    F: Fn(&mut TaskContext, &mut P, Option<&ActorContext>) -> Result<(), HandlerError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        task: &mut TaskContext,
        persistence: &mut P,
        actor: Option<&ActorContext>,
    ) -> Result<(), HandlerError> {
        self(task, persistence, actor)
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Immutable map from task key to handler
pub struct HandlerRegistry<P> {
    handlers: HashMap<String, Arc<dyn ServiceHandler<P>>>,
}

impl<P> HandlerRegistry<P> {
    pub fn builder() -> HandlerRegistryBuilder<P> {
        HandlerRegistryBuilder::new()
    }

    /// A registry with no handlers; every service task is skipped
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Find the handler for `node_id` in `process_id`
    pub fn lookup(&self, process_id: &str, node_id: &str) -> Option<&Arc<dyn ServiceHandler<P>>> {
        self.handlers
            .get(&qualified_key(process_id, node_id))
            .or_else(|| self.handlers.get(node_id))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl<P> std::fmt::Debug for HandlerRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Builds a [`HandlerRegistry`]
pub struct HandlerRegistryBuilder<P> {
    handlers: HashMap<String, Arc<dyn ServiceHandler<P>>>,
}

impl<P> HandlerRegistryBuilder<P> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under a bare node id or a `"{process}.{node}"` key.
    /// A later registration under the same key replaces the earlier one.
    pub fn register(
        mut self,
        key: impl Into<String>,
        handler: impl ServiceHandler<P> + 'static,
    ) -> Self {
        let key = key.into();
        if self.handlers.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(key = %key, "Service handler replaced");
        }
        self
    }

    /// Register a handler for `node_id` within `process_id` only
    pub fn register_for(
        self,
        process_id: &str,
        node_id: &str,
        handler: impl ServiceHandler<P> + 'static,
    ) -> Self {
        self.register(qualified_key(process_id, node_id), handler)
    }

    pub fn build(self) -> HandlerRegistry<P> {
        tracing::debug!(handlers = self.handlers.len(), "Handler registry built");
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

impl<P> Default for HandlerRegistryBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn qualified_key(process_id: &str, node_id: &str) -> String {
    format!("{}.{}", process_id, node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(node: &str) -> TaskContext {
        TaskContext {
            task_id: TaskId(3),
            node_id: node.into(),
            name: node.into(),
            process_id: "assign_application_v1".into(),
            data: DataBag::new(),
            local: DataBag::new(),
        }
    }

    fn mark(
        value: &'static str,
    ) -> impl Fn(&mut TaskContext, &mut Vec<String>, Option<&ActorContext>) -> Result<(), HandlerError>
    {
        move |_, log: &mut Vec<String>, _| {
            log.push(value.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_qualified_key_preferred() {
        let registry = HandlerRegistry::builder()
            .register("prepare_context", mark("plain"))
            .register_for("assign_application_v1", "prepare_context", mark("qualified"))
            .build();

        let mut log = Vec::new();
        let mut ctx = context("prepare_context");
        registry
            .lookup("assign_application_v1", "prepare_context")
            .unwrap()
            .handle(&mut ctx, &mut log, None)
            .unwrap();
        registry
            .lookup("other_process", "prepare_context")
            .unwrap()
            .handle(&mut ctx, &mut log, None)
            .unwrap();

        assert_eq!(log, vec!["qualified", "plain"]);
    }

    #[test]
    fn test_missing_handler_is_none() {
        let registry: HandlerRegistry<()> = HandlerRegistry::empty();
        assert!(registry.lookup("p", "n").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_sees_actor_and_data() {
        let registry = HandlerRegistry::builder()
            .register(
                "auto_assign",
                |task: &mut TaskContext,
                 _: &mut (),
                 actor: Option<&ActorContext>|
                 -> Result<(), HandlerError> {
                    let officer = actor.map(|a| a.id.clone()).unwrap_or_default();
                    task.set("assigned_to", officer);
                    Ok(())
                },
            )
            .build();

        let mut ctx = context("auto_assign");
        let actor = ActorContext::new("officer-7").with_attribute("role", "admissions");
        registry
            .lookup("p", "auto_assign")
            .unwrap()
            .handle(&mut ctx, &mut (), Some(&actor))
            .unwrap();

        assert_eq!(ctx.get("assigned_to"), Some(&Value::from("officer-7")));
    }

    #[test]
    fn test_require_reports_missing_field() {
        let ctx = context("n");
        assert!(matches!(
            ctx.require("application_id"),
            Err(HandlerError::MissingData(field)) if field == "application_id"
        ));
    }

    #[test]
    fn test_keys_sorted() {
        let registry = HandlerRegistry::builder()
            .register("b", mark("b"))
            .register("a", mark("a"))
            .build();
        assert_eq!(registry.keys(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
