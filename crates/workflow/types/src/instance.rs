//! Workflow instances: the run-time task graph of one execution
//!
//! An Instance holds the definitions it executes, a flat table of runs
//! (one per executed definition, root first) and a flat table of tasks.
//! Tasks and runs are addressed by their index in those tables, and every
//! parent/child relation is stored as an index, so the whole structure
//! serializes as plain JSON with no shared references.

use crate::{
    DataBag, DefinitionSet, ElementKind, FlowElement, ProcessDefinition, WorkflowError,
    WorkflowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a workflow instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a task in its instance's task table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a run in its instance's run table; the root run is 0
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub usize);

impl RunId {
    pub const ROOT: RunId = RunId(0);
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── States ───────────────────────────────────────────────────────────

/// Overall status of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    /// Stopped at a user task or an event wait
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Whether no further progress is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle state of a task
///
/// `Ready -> Completed | Cancelled`, or `Ready -> Waiting -> Completed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Ready,
    Waiting,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check a transition is allowed by the task state machine
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Ready, Self::Waiting)
                | (Self::Ready, Self::Completed)
                | (Self::Ready, Self::Cancelled)
                | (Self::Waiting, Self::Completed)
                | (Self::Waiting, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// How the engine treats a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Service,
    User,
    CallActivity,
    /// Start/end events, gateways and message catch events
    GatewayOrEvent,
}

impl From<&ElementKind> for TaskKind {
    fn from(kind: &ElementKind) -> Self {
        match kind {
            ElementKind::ServiceTask { .. } => Self::Service,
            ElementKind::UserTask { .. } => Self::User,
            ElementKind::CallActivity { .. } => Self::CallActivity,
            ElementKind::StartEvent
            | ElementKind::EndEvent
            | ElementKind::ExclusiveGateway
            | ElementKind::MessageCatchEvent { .. } => Self::GatewayOrEvent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Active,
    Completed,
}

// ── Runs and Tasks ───────────────────────────────────────────────────

/// One execution of one definition inside an instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Called element of the definition; `None` for the root definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    /// The call activity task that opened this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<TaskId>,
    pub state: RunState,
}

/// One instantiated flow element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run: RunId,
    /// Id of the flow element this task instantiates
    pub node_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskId>,
    /// The sequence flow that activated this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_flow: Option<String>,
    /// Nested run opened by a call activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_run: Option<RunId>,
    /// Task-local data
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    pub data: DataBag,
}

// ── Instance ─────────────────────────────────────────────────────────

/// A live execution of a process definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub process_id: String,
    pub definitions: DefinitionSet,
    pub runs: Vec<Run>,
    pub tasks: Vec<Task>,
    /// Data shared by every run of this instance
    pub data: DataBag,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Create an instance with no runs or tasks yet
    pub fn new(definitions: DefinitionSet, data: DataBag) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            process_id: definitions.root.process_id.clone(),
            definitions,
            runs: Vec::new(),
            tasks: Vec::new(),
            data,
            status: InstanceStatus::Running,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Open a new run of `definition` (`None` = root)
    pub fn open_run(&mut self, definition: Option<String>, parent_task: Option<TaskId>) -> RunId {
        let id = RunId(self.runs.len());
        self.runs.push(Run {
            id,
            definition,
            parent_task,
            state: RunState::Active,
        });
        if let Some(parent) = parent_task.and_then(|p| self.tasks.get_mut(p.0)) {
            parent.child_run = Some(id);
        }
        id
    }

    /// Append a READY task to the table and link it to its parent
    pub fn add_task(
        &mut self,
        run: RunId,
        node_id: impl Into<String>,
        kind: TaskKind,
        parent: Option<TaskId>,
        via_flow: Option<String>,
    ) -> TaskId {
        let id = self.next_task_id();
        self.tasks.push(Task {
            id,
            run,
            node_id: node_id.into(),
            kind,
            state: TaskState::Ready,
            parent,
            children: Vec::new(),
            via_flow,
            child_run: None,
            data: DataBag::new(),
        });
        if let Some(parent) = parent.and_then(|p| self.tasks.get_mut(p.0)) {
            parent.children.push(id);
        }
        id
    }

    /// Id the next [`Instance::add_task`] call will assign
    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.tasks.len())
    }

    pub fn task(&self, id: TaskId) -> WorkflowResult<&Task> {
        self.tasks.get(id.0).ok_or(WorkflowError::TaskNotFound(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> WorkflowResult<&mut Task> {
        self.tasks.get_mut(id.0).ok_or(WorkflowError::TaskNotFound(id))
    }

    pub fn run(&self, id: RunId) -> Option<&Run> {
        self.runs.get(id.0)
    }

    pub fn run_mut(&mut self, id: RunId) -> Option<&mut Run> {
        self.runs.get_mut(id.0)
    }

    /// The first READY task in insertion order
    pub fn next_ready(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .find(|t| t.state == TaskState::Ready)
            .map(|t| t.id)
    }

    /// Ids of all tasks in `state`, in insertion order
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.id)
            .collect()
    }

    /// The definition a run executes
    pub fn definition_for(&self, run: RunId) -> WorkflowResult<&ProcessDefinition> {
        let run = self.run(run).ok_or_else(|| {
            WorkflowError::InvalidDefinition(format!("run {} does not exist", run))
        })?;
        self.definitions
            .get(run.definition.as_deref())
            .ok_or_else(|| {
                crate::LookupError::UnresolvedCalledElement(
                    run.definition.clone().unwrap_or_default(),
                )
                .into()
            })
    }

    /// The flow element a task instantiates
    pub fn element_for(&self, task: TaskId) -> WorkflowResult<&FlowElement> {
        let task = self.task(task)?;
        let definition = self.definition_for(task.run)?;
        definition
            .element(&task.node_id)
            .ok_or_else(|| WorkflowError::ElementNotFound {
                process: definition.process_id.clone(),
                element: task.node_id.clone(),
            })
    }

    /// Whether the root run has reached its end event
    pub fn root_completed(&self) -> bool {
        self.runs
            .first()
            .map(|r| r.state == RunState::Completed)
            .unwrap_or(false)
    }

    /// Refresh the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SequenceFlow, START_EVENT_ID};

    fn instance() -> Instance {
        let mut def = ProcessDefinition::new("p");
        def.elements.push(FlowElement::start_event(START_EVENT_ID));
        def.elements.push(FlowElement::user_task("review", "Review"));
        def.flows.push(SequenceFlow::new("f", START_EVENT_ID, "review"));
        Instance::new(DefinitionSet::new(def), DataBag::new())
    }

    #[test]
    fn test_instance_id_generation() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_short_id_respects_char_boundaries() {
        let id = InstanceId::new("abcdefgéhij");
        assert_eq!(id.short(), "abcdefgé");
        assert_eq!(InstanceId::new("日本語").short(), "日本語");
        assert_eq!(InstanceId::new("").short(), "");
    }

    #[test]
    fn test_add_task_links_parent() {
        let mut inst = instance();
        let run = inst.open_run(None, None);
        let start = inst.add_task(run, START_EVENT_ID, TaskKind::GatewayOrEvent, None, None);
        let review = inst.add_task(run, "review", TaskKind::User, Some(start), Some("f".into()));

        assert_eq!(inst.task(start).unwrap().children, vec![review]);
        assert_eq!(inst.task(review).unwrap().parent, Some(start));
        assert_eq!(inst.next_ready(), Some(start));
        assert_eq!(inst.next_task_id(), TaskId(2));
        assert_eq!(inst.element_for(review).unwrap().name(), "Review");
    }

    #[test]
    fn test_next_ready_skips_finished() {
        let mut inst = instance();
        let run = inst.open_run(None, None);
        let a = inst.add_task(run, START_EVENT_ID, TaskKind::GatewayOrEvent, None, None);
        let b = inst.add_task(run, "review", TaskKind::User, Some(a), None);
        inst.task_mut(a).unwrap().state = TaskState::Completed;

        assert_eq!(inst.next_ready(), Some(b));
        assert_eq!(inst.tasks_in_state(TaskState::Completed), vec![a]);
    }

    #[test]
    fn test_task_not_found() {
        let inst = instance();
        assert!(matches!(
            inst.task(TaskId(7)),
            Err(WorkflowError::TaskNotFound(TaskId(7)))
        ));
    }

    #[test]
    fn test_task_state_machine() {
        assert!(TaskState::Ready.can_transition_to(TaskState::Waiting));
        assert!(TaskState::Waiting.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Ready));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn test_instance_serde_round_trip() {
        let mut inst = instance();
        let run = inst.open_run(None, None);
        inst.add_task(run, START_EVENT_ID, TaskKind::GatewayOrEvent, None, None);
        inst.data.insert("x".into(), serde_json::json!(3));

        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn test_status_terminal() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Waiting.is_terminal());
    }
}
