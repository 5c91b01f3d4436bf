//! The engine: drives instances through their task graph
//!
//! One [`Engine`] is built per process from a handler registry and shared
//! by every caller. All instance state lives in the [`Instance`] value the
//! caller owns; the engine itself is immutable.

use crate::config::{EngineConfig, GatewayActivation};
use crate::events::{Emit, EngineEvent, ExecutionContext};
use crate::expression::evaluate;
use crate::handlers::{HandlerRegistry, TaskContext};
use crate::reconcile::{BranchCandidate, BranchReconciler, ConditionReconciler};
use crate::snapshot;
use chrono::Utc;
use procflow_types::{
    merge_data, DataBag, DefinitionSet, ElementKind, Instance, InstanceStatus, LookupError, RunId,
    RunState, SequenceFlow, TaskId, TaskKind, TaskState, WorkflowError, WorkflowResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where an instance stopped after a call to [`Engine::advance`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub status: InstanceStatus,
    /// WAITING tasks the caller must act on (user tasks, or event waits)
    pub waiting_task_ids: Vec<TaskId>,
}

impl AdvanceOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == InstanceStatus::Completed
    }
}

/// Completion of a WAITING task supplied on resume
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// Task id, or the node id of a WAITING task
    pub task: String,
    #[serde(default)]
    pub data: DataBag,
}

impl TaskCompletion {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            data: DataBag::new(),
        }
    }

    pub fn with_data(mut self, data: DataBag) -> Self {
        self.data = data;
        self
    }
}

pub struct Engine<P> {
    handlers: Arc<HandlerRegistry<P>>,
    reconciler: Arc<dyn BranchReconciler>,
    config: EngineConfig,
}

impl<P> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            reconciler: Arc::clone(&self.reconciler),
            config: self.config.clone(),
        }
    }
}

impl<P> std::fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish()
    }
}

impl<P> Engine<P> {
    pub fn new(handlers: HandlerRegistry<P>) -> Self {
        Self {
            handlers: Arc::new(handlers),
            reconciler: Arc::new(ConditionReconciler),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reconciler(mut self, reconciler: impl BranchReconciler + 'static) -> Self {
        self.reconciler = Arc::new(reconciler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry<P> {
        &self.handlers
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Create an instance and complete its root start event
    ///
    /// Every subprocess the root may call must already be in `definitions`.
    pub fn create(
        &self,
        definitions: DefinitionSet,
        data: DataBag,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<Instance> {
        definitions.validate()?;
        let start_id = definitions
            .root
            .start_event()
            .map(|e| e.id.clone())
            .ok_or_else(|| {
                WorkflowError::InvalidDefinition(format!(
                    "process '{}' has no start event",
                    definitions.root.process_id
                ))
            })?;

        let mut instance = Instance::new(definitions, data);
        ctx.emit(
            &instance.id,
            EngineEvent::InstanceCreated {
                process_id: instance.process_id.clone(),
            },
        );

        let run = instance.open_run(None, None);
        let start = instance.add_task(run, start_id, TaskKind::GatewayOrEvent, None, None);
        self.complete_task(&mut instance, start, ctx)?;
        Ok(instance)
    }

    /// Run READY tasks until the instance completes or has to wait
    ///
    /// A handler error stops the loop and is returned as-is. The failing
    /// task stays READY and nothing it did is applied, so the instance is
    /// left as it was just before the handler ran.
    pub fn advance(
        &self,
        instance: &mut Instance,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<AdvanceOutcome> {
        ensure_active(instance)?;
        set_status(instance, InstanceStatus::Running, ctx);

        let mut steps = 0;
        while let Some(task_id) = instance.next_ready() {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(WorkflowError::StepLimitExceeded(self.config.max_steps));
            }

            let kind = instance.element_for(task_id)?.kind.clone();
            match kind {
                ElementKind::UserTask { .. } => {
                    wait(instance, task_id, ctx)?;
                    return Ok(settle(instance, ctx));
                }
                ElementKind::MessageCatchEvent { .. } => wait(instance, task_id, ctx)?,
                ElementKind::CallActivity { called_element, .. } => {
                    enter_subprocess(instance, task_id, &called_element, ctx)?
                }
                ElementKind::ServiceTask { .. } => self.run_service(instance, task_id, ctx)?,
                ElementKind::StartEvent | ElementKind::EndEvent | ElementKind::ExclusiveGateway => {
                    self.complete_task(instance, task_id, ctx)?
                }
            }
        }

        let outcome = settle(instance, ctx);
        tracing::debug!(
            instance_id = %instance.id.short(),
            steps = steps,
            status = %outcome.status,
            "Advance finished"
        );
        Ok(outcome)
    }

    /// Encode an instance for storage
    pub fn persist(&self, instance: &Instance) -> WorkflowResult<Vec<u8>> {
        snapshot::encode(instance)
    }

    /// Decode an instance produced by [`Engine::persist`]
    pub fn restore(&self, state: &[u8]) -> WorkflowResult<Instance> {
        snapshot::decode(state)
    }

    /// Restore, optionally complete one WAITING task, then advance
    pub fn resume(
        &self,
        state: &[u8],
        completion: Option<TaskCompletion>,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<(Instance, AdvanceOutcome)> {
        let mut instance = self.restore(state)?;
        if let Some(completion) = completion {
            self.complete_waiting(&mut instance, &completion.task, completion.data, ctx)?;
        }
        let outcome = self.advance(&mut instance, ctx)?;
        Ok((instance, outcome))
    }

    /// Complete a WAITING task, selected by task id or node id
    ///
    /// `data` is merged into the instance data and the task's own data.
    /// The instance is not advanced.
    pub fn complete_waiting(
        &self,
        instance: &mut Instance,
        selector: &str,
        data: DataBag,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<TaskId> {
        ensure_active(instance)?;
        let task_id = find_waiting(instance, selector)
            .ok_or_else(|| WorkflowError::TaskNotWaiting(selector.to_string()))?;

        merge_data(&mut instance.data, &data);
        merge_data(&mut instance.task_mut(task_id)?.data, &data);
        self.complete_task(instance, task_id, ctx)?;
        instance.touch();
        Ok(task_id)
    }

    /// Deliver a named message to the single task waiting for it
    ///
    /// The payload is merged into the instance data and the waiting task
    /// completes. The caller advances the instance afterwards.
    pub fn correlate_event(
        &self,
        instance: &mut Instance,
        event_name: &str,
        payload: DataBag,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<TaskId> {
        ensure_active(instance)?;

        let matches: Vec<TaskId> = instance
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Waiting)
            .filter(|t| {
                matches!(
                    instance.element_for(t.id).map(|e| &e.kind),
                    Ok(ElementKind::MessageCatchEvent { event_name: name }) if name == event_name
                )
            })
            .map(|t| t.id)
            .collect();

        let task_id = match matches.as_slice() {
            [] => {
                return Err(WorkflowError::NotWaiting {
                    event: event_name.to_string(),
                })
            }
            [only] => *only,
            _ => {
                return Err(WorkflowError::AmbiguousCorrelation {
                    event: event_name.to_string(),
                    matches: matches.len(),
                })
            }
        };

        merge_data(&mut instance.data, &payload);
        merge_data(&mut instance.task_mut(task_id)?.data, &payload);

        ctx.emit(
            &instance.id,
            EngineEvent::EventCorrelated {
                task: task_id,
                event_name: event_name.to_string(),
            },
        );
        self.complete_task(instance, task_id, ctx)?;
        instance.touch();
        Ok(task_id)
    }

    /// Cancel every open task and mark the instance cancelled
    pub fn cancel(
        &self,
        instance: &mut Instance,
        reason: &str,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<()> {
        ensure_active(instance)?;
        let open = instance
            .tasks_in_state(TaskState::Ready)
            .into_iter()
            .chain(instance.tasks_in_state(TaskState::Waiting));
        for task in open {
            cancel_task(instance, task, reason, ctx)?;
        }
        set_status(instance, InstanceStatus::Cancelled, ctx);
        Ok(())
    }

    // ── Task Execution ───────────────────────────────────────────────

    fn run_service(
        &self,
        instance: &mut Instance,
        task_id: TaskId,
        ctx: &mut ExecutionContext<'_, P>,
    ) -> WorkflowResult<()> {
        let task = instance.task(task_id)?;
        let node_id = task.node_id.clone();
        let local = task.data.clone();
        let process_id = instance.definition_for(task.run)?.process_id.clone();
        let name = instance.element_for(task_id)?.name().to_string();

        match self.handlers.lookup(&process_id, &node_id) {
            Some(handler) => {
                let mut task_ctx = TaskContext {
                    task_id,
                    node_id: node_id.clone(),
                    name,
                    process_id,
                    data: instance.data.clone(),
                    local,
                };
                if let Err(e) = handler.handle(&mut task_ctx, &mut *ctx.persistence, ctx.actor) {
                    let message = e.to_string();
                    ctx.emit(
                        &instance.id,
                        EngineEvent::HandlerFailed {
                            task: task_id,
                            node: node_id.clone(),
                            message: message.clone(),
                        },
                    );
                    return Err(WorkflowError::Handler {
                        task: task_id,
                        node: node_id,
                        message,
                    });
                }
                instance.data = task_ctx.data;
                instance.task_mut(task_id)?.data = task_ctx.local;
            }
            None => ctx.emit(
                &instance.id,
                EngineEvent::HandlerMissing {
                    task: task_id,
                    node: node_id,
                },
            ),
        }

        self.complete_task(instance, task_id, ctx)
    }

    /// Mark a task COMPLETED and activate what follows it
    fn complete_task(
        &self,
        instance: &mut Instance,
        task_id: TaskId,
        out: &mut dyn Emit,
    ) -> WorkflowResult<()> {
        let kind = instance.element_for(task_id)?.kind.clone();
        if kind == ElementKind::ExclusiveGateway {
            return self.take_gateway(instance, task_id, out);
        }

        let (run, node) = mark_completed(instance, task_id, out)?;
        match kind {
            ElementKind::EndEvent => finish_run(instance, run, out),
            _ => {
                let flows = outgoing(instance, run, &node)?;
                fire(instance, task_id, &flows, out).map(|_| ())
            }
        }
    }

    // ── Gateways ─────────────────────────────────────────────────────

    /// Choose the surviving branch, then complete the gateway
    ///
    /// Nothing changes until a branch is chosen: when none qualifies the
    /// gateway stays READY and a later `advance` evaluates it again.
    fn take_gateway(
        &self,
        instance: &mut Instance,
        gateway: TaskId,
        out: &mut dyn Emit,
    ) -> WorkflowResult<()> {
        let task = instance.task(gateway)?;
        let (run, node) = (task.run, task.node_id.clone());
        let flows = outgoing(instance, run, &node)?;

        let chosen = match self.config.gateway_activation {
            GatewayActivation::Evaluate => vec![select_flow(instance, &node, &flows, out)?],
            GatewayActivation::Eager => flows,
        };

        // Branch tasks take the next ids in flow order once fired
        let first = instance.next_task_id().0;
        let candidates: Vec<BranchCandidate> = chosen
            .iter()
            .enumerate()
            .map(|(offset, flow)| BranchCandidate {
                task: TaskId(first + offset),
                flow_id: flow.id.clone(),
                condition: flow.condition.clone(),
                is_default: flow.is_default,
            })
            .collect();

        if candidates.len() > 1 {
            out.emit(
                &instance.id,
                EngineEvent::ReconciliationWarning {
                    gateway: node.clone(),
                    message: format!(
                        "gateway '{}' activated {} branches",
                        node,
                        candidates.len()
                    ),
                },
            );
        }

        let decision = self.reconciler.reconcile(&node, &candidates, &instance.data);
        for message in decision.warnings {
            out.emit(
                &instance.id,
                EngineEvent::ReconciliationWarning {
                    gateway: node.clone(),
                    message,
                },
            );
        }
        let kept = decision
            .keep
            .filter(|kept| candidates.iter().any(|c| c.task == *kept))
            .ok_or_else(|| WorkflowError::NoBranchTaken(node.clone()))?;

        mark_completed(instance, gateway, out)?;
        fire(instance, gateway, &chosen, out)?;

        let cancelled: Vec<TaskId> = decision
            .cancel
            .into_iter()
            .filter(|t| *t != kept)
            .collect();
        for &task in &cancelled {
            cancel_task(instance, task, "branch not taken", out)?;
        }
        if candidates.len() > 1 {
            out.emit(
                &instance.id,
                EngineEvent::BranchReconciled {
                    gateway: node,
                    kept,
                    cancelled,
                },
            );
        }
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn ensure_active(instance: &Instance) -> WorkflowResult<()> {
    match instance.status {
        InstanceStatus::Completed => Err(WorkflowError::AlreadyCompleted),
        InstanceStatus::Cancelled => Err(WorkflowError::InstanceCancelled(instance.id.clone())),
        _ => Ok(()),
    }
}

fn set_status(instance: &mut Instance, status: InstanceStatus, out: &mut dyn Emit) {
    if instance.status != status {
        out.emit(
            &instance.id,
            EngineEvent::StatusChanged {
                from: instance.status,
                to: status,
            },
        );
        instance.status = status;
    }
    if status == InstanceStatus::Completed && instance.completed_at.is_none() {
        instance.completed_at = Some(Utc::now());
    }
    instance.touch();
}

/// Decide where an instance stands once nothing is READY
fn settle(instance: &mut Instance, out: &mut dyn Emit) -> AdvanceOutcome {
    let waiting_users: Vec<TaskId> = instance
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Waiting && t.kind == TaskKind::User)
        .map(|t| t.id)
        .collect();

    let (status, waiting_task_ids) = if !waiting_users.is_empty() {
        (InstanceStatus::Waiting, waiting_users)
    } else if instance.root_completed() {
        (InstanceStatus::Completed, Vec::new())
    } else {
        (
            InstanceStatus::Waiting,
            instance.tasks_in_state(TaskState::Waiting),
        )
    };

    set_status(instance, status, out);
    AdvanceOutcome {
        status,
        waiting_task_ids,
    }
}

fn transition(instance: &mut Instance, task_id: TaskId, to: TaskState) -> WorkflowResult<()> {
    let task = instance.task_mut(task_id)?;
    if !task.state.can_transition_to(to) {
        return Err(WorkflowError::InvalidTransition {
            task: task_id,
            from: task.state,
            to,
        });
    }
    task.state = to;
    Ok(())
}

fn mark_completed(
    instance: &mut Instance,
    task_id: TaskId,
    out: &mut dyn Emit,
) -> WorkflowResult<(RunId, String)> {
    transition(instance, task_id, TaskState::Completed)?;
    let task = instance.task(task_id)?;
    let (run, node) = (task.run, task.node_id.clone());
    out.emit(
        &instance.id,
        EngineEvent::TaskCompleted {
            task: task_id,
            node: node.clone(),
        },
    );
    Ok((run, node))
}

fn wait(instance: &mut Instance, task_id: TaskId, out: &mut dyn Emit) -> WorkflowResult<()> {
    transition(instance, task_id, TaskState::Waiting)?;
    let node = instance.task(task_id)?.node_id.clone();
    out.emit(&instance.id, EngineEvent::TaskWaiting { task: task_id, node });
    Ok(())
}

fn cancel_task(
    instance: &mut Instance,
    task_id: TaskId,
    reason: &str,
    out: &mut dyn Emit,
) -> WorkflowResult<()> {
    let task = instance.task_mut(task_id)?;
    if task.state.is_finished() {
        return Ok(());
    }
    task.state = TaskState::Cancelled;
    let node = task.node_id.clone();
    out.emit(
        &instance.id,
        EngineEvent::TaskCancelled {
            task: task_id,
            node,
            reason: reason.to_string(),
        },
    );
    Ok(())
}

fn find_waiting(instance: &Instance, selector: &str) -> Option<TaskId> {
    let waiting = || {
        instance
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Waiting)
    };
    waiting()
        .find(|t| t.id.to_string() == selector)
        .or_else(|| waiting().find(|t| t.node_id == selector))
        .map(|t| t.id)
}

fn outgoing(instance: &Instance, run: RunId, node: &str) -> WorkflowResult<Vec<SequenceFlow>> {
    Ok(instance
        .definition_for(run)?
        .outgoing(node)
        .into_iter()
        .cloned()
        .collect())
}

/// Create a READY task for the target of each flow, in the source's run
fn fire(
    instance: &mut Instance,
    source: TaskId,
    flows: &[SequenceFlow],
    out: &mut dyn Emit,
) -> WorkflowResult<Vec<TaskId>> {
    let run = instance.task(source)?.run;
    let definition = instance.definition_for(run)?;

    let mut targets = Vec::with_capacity(flows.len());
    for flow in flows {
        let element =
            definition
                .element(&flow.target)
                .ok_or_else(|| WorkflowError::ElementNotFound {
                    process: definition.process_id.clone(),
                    element: flow.target.clone(),
                })?;
        targets.push((flow.id.clone(), element.id.clone(), TaskKind::from(&element.kind)));
    }

    let mut created = Vec::with_capacity(targets.len());
    for (flow_id, node, kind) in targets {
        let task = instance.add_task(run, node.clone(), kind, Some(source), Some(flow_id.clone()));
        out.emit(
            &instance.id,
            EngineEvent::TaskReady {
                task,
                node,
                via_flow: Some(flow_id),
            },
        );
        created.push(task);
    }
    Ok(created)
}

/// First conditional flow that holds, else the default flow
fn select_flow(
    instance: &Instance,
    gateway: &str,
    flows: &[SequenceFlow],
    out: &mut dyn Emit,
) -> WorkflowResult<SequenceFlow> {
    for flow in flows.iter().filter(|f| !f.is_default) {
        let Some(condition) = flow.condition.as_deref() else {
            continue;
        };
        match evaluate(condition, &instance.data) {
            Ok(true) => return Ok(flow.clone()),
            Ok(false) => {}
            Err(e) => out.emit(
                &instance.id,
                EngineEvent::ConditionFailed {
                    gateway: gateway.to_string(),
                    flow: flow.id.clone(),
                    message: e.to_string(),
                },
            ),
        }
    }

    flows
        .iter()
        .find(|f| f.is_default || f.condition.is_none())
        .cloned()
        .ok_or_else(|| WorkflowError::NoBranchTaken(gateway.to_string()))
}

/// Mark a call activity COMPLETED and start its subprocess run
fn enter_subprocess(
    instance: &mut Instance,
    task_id: TaskId,
    called_element: &str,
    out: &mut dyn Emit,
) -> WorkflowResult<()> {
    let start_id = instance
        .definitions
        .subprocesses
        .get(called_element)
        .ok_or_else(|| LookupError::UnresolvedCalledElement(called_element.to_string()))?
        .start_event()
        .map(|e| e.id.clone())
        .ok_or_else(|| {
            WorkflowError::InvalidDefinition(format!(
                "subprocess '{}' has no start event",
                called_element
            ))
        })?;

    mark_completed(instance, task_id, out)?;

    let run = instance.open_run(Some(called_element.to_string()), Some(task_id));
    out.emit(
        &instance.id,
        EngineEvent::SubprocessEntered {
            task: task_id,
            called_element: called_element.to_string(),
            run,
        },
    );

    let start = instance.add_task(
        run,
        start_id.clone(),
        TaskKind::GatewayOrEvent,
        Some(task_id),
        None,
    );
    out.emit(
        &instance.id,
        EngineEvent::TaskReady {
            task: start,
            node: start_id,
            via_flow: None,
        },
    );
    Ok(())
}

/// Close a run at its end event; a subprocess run resumes its caller
fn finish_run(instance: &mut Instance, run_id: RunId, out: &mut dyn Emit) -> WorkflowResult<()> {
    let run = instance.run_mut(run_id).ok_or_else(|| {
        WorkflowError::InvalidDefinition(format!("run {} does not exist", run_id))
    })?;
    if run.state == RunState::Completed {
        return Ok(());
    }
    run.state = RunState::Completed;
    let Some(parent) = run.parent_task else {
        return Ok(());
    };

    out.emit(
        &instance.id,
        EngineEvent::SubprocessCompleted {
            task: parent,
            run: run_id,
        },
    );
    let task = instance.task(parent)?;
    let (parent_run, node) = (task.run, task.node_id.clone());
    let flows = outgoing(instance, parent_run, &node)?;
    fire(instance, parent, &flows, out)?;
    Ok(())
}
