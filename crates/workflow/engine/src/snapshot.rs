//! Serialized instance state
//!
//! An instance persists as a JSON envelope carrying a format marker and a
//! version next to the instance itself. Decoding checks the envelope and
//! the internal consistency of the task graph before handing it back.

use procflow_types::{Instance, WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};

pub const STATE_FORMAT: &str = "procflow/instance";
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: &'a str,
    version: u32,
    instance: &'a Instance,
}

#[derive(Deserialize)]
struct Snapshot {
    format: String,
    version: u32,
    instance: Instance,
}

/// Encode an instance into opaque bytes
pub fn encode(instance: &Instance) -> WorkflowResult<Vec<u8>> {
    let bytes = serde_json::to_vec(&SnapshotRef {
        format: STATE_FORMAT,
        version: STATE_VERSION,
        instance,
    })?;
    Ok(bytes)
}

/// Decode bytes produced by [`encode`]
pub fn decode(bytes: &[u8]) -> WorkflowResult<Instance> {
    let snapshot: Snapshot = serde_json::from_slice(bytes)?;
    if snapshot.format != STATE_FORMAT {
        return Err(WorkflowError::Serialization(format!(
            "unknown state format '{}'",
            snapshot.format
        )));
    }
    if snapshot.version != STATE_VERSION {
        return Err(WorkflowError::Serialization(format!(
            "unsupported state version {} (expected {})",
            snapshot.version, STATE_VERSION
        )));
    }
    check_integrity(&snapshot.instance)?;
    Ok(snapshot.instance)
}

fn check_integrity(instance: &Instance) -> WorkflowResult<()> {
    instance.definitions.validate()?;

    let corrupt = |what: String| Err(WorkflowError::Serialization(format!("corrupt state: {}", what)));
    let runs = instance.runs.len();
    let tasks = instance.tasks.len();

    for (index, run) in instance.runs.iter().enumerate() {
        if run.id.0 != index {
            return corrupt(format!("run {} stored at index {}", run.id, index));
        }
        if run.parent_task.is_some_and(|t| t.0 >= tasks) {
            return corrupt(format!("run {} has a dangling parent task", run.id));
        }
        if instance.definitions.get(run.definition.as_deref()).is_none() {
            return corrupt(format!("run {} executes an unknown definition", run.id));
        }
    }

    for (index, task) in instance.tasks.iter().enumerate() {
        if task.id.0 != index {
            return corrupt(format!("task {} stored at index {}", task.id, index));
        }
        let dangling = task.run.0 >= runs
            || task.parent.is_some_and(|p| p.0 >= tasks)
            || task.children.iter().any(|c| c.0 >= tasks)
            || task.child_run.is_some_and(|r| r.0 >= runs);
        if dangling {
            return corrupt(format!("task {} references a missing task or run", task.id));
        }
        instance.element_for(task.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_types::{
        DataBag, DefinitionSet, FlowElement, ProcessDefinition, SequenceFlow, TaskKind,
        START_EVENT_ID,
    };

    fn instance() -> Instance {
        let mut def = ProcessDefinition::new("p");
        def.add_element(FlowElement::start_event(START_EVENT_ID)).unwrap();
        def.add_element(FlowElement::user_task("review", "Review")).unwrap();
        def.add_element(FlowElement::end_event("end")).unwrap();
        def.add_flow(SequenceFlow::new("f1", START_EVENT_ID, "review")).unwrap();
        def.add_flow(SequenceFlow::new("f2", "review", "end")).unwrap();
        let mut inst = Instance::new(DefinitionSet::new(def), DataBag::new());
        let run = inst.open_run(None, None);
        inst.add_task(run, START_EVENT_ID, TaskKind::GatewayOrEvent, None, None);
        inst
    }

    #[test]
    fn test_encode_decode() {
        let inst = instance();
        let decoded = decode(&encode(&inst).unwrap()).unwrap();
        assert_eq!(decoded.id, inst.id);
        assert_eq!(decoded.tasks.len(), 1);
    }

    #[test]
    fn test_rejects_other_version() {
        let mut value: serde_json::Value = serde_json::from_slice(&encode(&instance()).unwrap()).unwrap();
        value["version"] = 99.into();
        let result = decode(&serde_json::to_vec(&value).unwrap());
        assert!(matches!(result, Err(WorkflowError::Serialization(m)) if m.contains("version 99")));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            decode(b"not json"),
            Err(WorkflowError::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_dangling_parent() {
        let mut inst = instance();
        inst.tasks[0].parent = Some(procflow_types::TaskId(42));
        let result = decode(&encode(&inst).unwrap());
        assert!(matches!(result, Err(WorkflowError::Serialization(m)) if m.contains("corrupt")));
    }
}
