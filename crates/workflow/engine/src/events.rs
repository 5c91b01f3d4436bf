//! Engine events and the per-call execution context
//!
//! Every state change the engine makes is described by an [`EngineEvent`].
//! Events are always written to `tracing`; callers that want them as data
//! attach an [`EventSink`] to the [`ExecutionContext`].

use crate::handlers::ActorContext;
use procflow_types::{InstanceId, InstanceStatus, RunId, TaskId};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceCreated {
        process_id: String,
    },
    TaskReady {
        task: TaskId,
        node: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        via_flow: Option<String>,
    },
    TaskWaiting {
        task: TaskId,
        node: String,
    },
    TaskCompleted {
        task: TaskId,
        node: String,
    },
    TaskCancelled {
        task: TaskId,
        node: String,
        reason: String,
    },
    HandlerMissing {
        task: TaskId,
        node: String,
    },
    HandlerFailed {
        task: TaskId,
        node: String,
        message: String,
    },
    SubprocessEntered {
        task: TaskId,
        called_element: String,
        run: RunId,
    },
    SubprocessCompleted {
        task: TaskId,
        run: RunId,
    },
    ConditionFailed {
        gateway: String,
        flow: String,
        message: String,
    },
    BranchReconciled {
        gateway: String,
        kept: TaskId,
        cancelled: Vec<TaskId>,
    },
    ReconciliationWarning {
        gateway: String,
        message: String,
    },
    EventCorrelated {
        task: TaskId,
        event_name: String,
    },
    StatusChanged {
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceCreated { .. } => "instance_created",
            Self::TaskReady { .. } => "task_ready",
            Self::TaskWaiting { .. } => "task_waiting",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::HandlerMissing { .. } => "handler_missing",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::SubprocessEntered { .. } => "subprocess_entered",
            Self::SubprocessCompleted { .. } => "subprocess_completed",
            Self::ConditionFailed { .. } => "condition_failed",
            Self::BranchReconciled { .. } => "branch_reconciled",
            Self::ReconciliationWarning { .. } => "reconciliation_warning",
            Self::EventCorrelated { .. } => "event_correlated",
            Self::StatusChanged { .. } => "status_changed",
        }
    }

    /// Write the event to `tracing` at a level matching its severity
    pub fn log(&self, instance: &InstanceId) {
        let id = instance.short();
        match self {
            Self::InstanceCreated { process_id } => {
                tracing::info!(instance_id = %id, process_id = %process_id, "Instance created");
            }
            Self::TaskReady { task, node, via_flow } => {
                tracing::debug!(instance_id = %id, task = %task, node = %node, via_flow = ?via_flow, "Task ready");
            }
            Self::TaskWaiting { task, node } => {
                tracing::info!(instance_id = %id, task = %task, node = %node, "Task waiting");
            }
            Self::TaskCompleted { task, node } => {
                tracing::debug!(instance_id = %id, task = %task, node = %node, "Task completed");
            }
            Self::TaskCancelled { task, node, reason } => {
                tracing::debug!(instance_id = %id, task = %task, node = %node, reason = %reason, "Task cancelled");
            }
            Self::HandlerMissing { task, node } => {
                tracing::warn!(instance_id = %id, task = %task, node = %node, "No handler registered, completing task");
            }
            Self::HandlerFailed { task, node, message } => {
                tracing::error!(instance_id = %id, task = %task, node = %node, error = %message, "Service handler failed");
            }
            Self::SubprocessEntered { task, called_element, run } => {
                tracing::debug!(instance_id = %id, task = %task, called_element = %called_element, run = %run, "Subprocess entered");
            }
            Self::SubprocessCompleted { task, run } => {
                tracing::debug!(instance_id = %id, task = %task, run = %run, "Subprocess completed");
            }
            Self::ConditionFailed { gateway, flow, message } => {
                tracing::warn!(instance_id = %id, gateway = %gateway, flow = %flow, error = %message, "Condition could not be evaluated");
            }
            Self::BranchReconciled { gateway, kept, cancelled } => {
                tracing::info!(instance_id = %id, gateway = %gateway, kept = %kept, cancelled = cancelled.len(), "Gateway branches reconciled");
            }
            Self::ReconciliationWarning { gateway, message } => {
                tracing::warn!(instance_id = %id, gateway = %gateway, "{}", message);
            }
            Self::EventCorrelated { task, event_name } => {
                tracing::info!(instance_id = %id, task = %task, event = %event_name, "Event correlated");
            }
            Self::StatusChanged { from, to } => {
                tracing::info!(instance_id = %id, from = %from, to = %to, "Instance status changed");
            }
        }
    }
}

// ── Sinks ────────────────────────────────────────────────────────────

/// Receives engine events as they happen
pub trait EventSink {
    fn record(&mut self, instance: &InstanceId, event: EngineEvent);
}

/// Keeps every event in memory
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Vec<(InstanceId, EngineEvent)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[(InstanceId, EngineEvent)] {
        &self.events
    }

    /// Event names in order of emission
    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(|(_, e)| e.name()).collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&mut self, instance: &InstanceId, event: EngineEvent) {
        self.events.push((instance.clone(), event));
    }
}

// ── Execution Context ────────────────────────────────────────────────

/// What the caller hands to one engine call: the persistence context passed
/// through to handlers, the acting user, and an optional event sink
pub struct ExecutionContext<'a, P> {
    pub persistence: &'a mut P,
    pub actor: Option<&'a ActorContext>,
    events: Option<&'a mut dyn EventSink>,
}

impl<'a, P> ExecutionContext<'a, P> {
    pub fn new(persistence: &'a mut P) -> Self {
        Self {
            persistence,
            actor: None,
            events: None,
        }
    }

    pub fn with_actor(mut self, actor: &'a ActorContext) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_events(mut self, sink: &'a mut dyn EventSink) -> Self {
        self.events = Some(sink);
        self
    }
}

/// Where the engine sends events while it works
pub(crate) trait Emit {
    fn emit(&mut self, instance: &InstanceId, event: EngineEvent);
}

impl<P> Emit for ExecutionContext<'_, P> {
    fn emit(&mut self, instance: &InstanceId, event: EngineEvent) {
        event.log(instance);
        if let Some(sink) = self.events.as_mut() {
            sink.record(instance, event);
        }
    }
}
