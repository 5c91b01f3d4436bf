//! Instance commands: run, resume, correlate, cancel, show

use super::manifest::{load_catalog, read_manifest};
use crate::config::CliConfig;
use crate::output::{print_events, print_json, print_success};
use anyhow::Context;
use clap::Args;
use procflow_dsl::{loader, resolve_subprocesses};
use procflow_engine::{
    AdvanceOutcome, Engine, ExecutionContext, HandlerRegistry, RecordingSink, TaskCompletion,
};
use procflow_types::{DataBag, Instance, InstanceStatus, RunId, TaskId, TaskKind, TaskState};
use serde::Serialize;

#[derive(Args)]
pub struct RunArgs {
    /// Manifest file
    pub manifest: String,

    /// State file to write
    #[arg(short, long)]
    pub state: String,

    /// Initial data, a JSON object or @file
    #[arg(short, long)]
    pub data: Option<String>,
}

#[derive(Args)]
pub struct ResumeArgs {
    /// State file
    #[arg(short, long)]
    pub state: String,

    /// Waiting task to complete, by task id or node id
    #[arg(short, long)]
    pub task: Option<String>,

    /// Data merged on completion, a JSON object or @file
    #[arg(short, long, requires = "task")]
    pub data: Option<String>,
}

#[derive(Args)]
pub struct CorrelateArgs {
    /// State file
    #[arg(short, long)]
    pub state: String,

    /// Message name
    #[arg(short, long)]
    pub event: String,

    /// Message payload, a JSON object or @file
    #[arg(short, long)]
    pub payload: Option<String>,
}

#[derive(Args)]
pub struct CancelArgs {
    /// State file
    #[arg(short, long)]
    pub state: String,

    /// Reason recorded on cancelled tasks
    #[arg(short, long, default_value = "cancelled by operator")]
    pub reason: String,
}

/// What a command reports about an instance
#[derive(Debug, Serialize)]
struct InstanceSummary {
    instance_id: String,
    process_id: String,
    status: InstanceStatus,
    waiting: Vec<WaitingTask>,
}

#[derive(Debug, Serialize)]
struct WaitingTask {
    id: TaskId,
    node: String,
}

/// Table row for `show`
#[derive(Debug, Serialize)]
struct TaskRow {
    id: TaskId,
    run: RunId,
    node: String,
    kind: TaskKind,
    state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    via_flow: Option<String>,
}

impl InstanceSummary {
    fn new(instance: &Instance, waiting: &[TaskId]) -> Self {
        Self {
            instance_id: instance.id.to_string(),
            process_id: instance.process_id.clone(),
            status: instance.status,
            waiting: waiting
                .iter()
                .filter_map(|id| instance.task(*id).ok())
                .map(|t| WaitingTask {
                    id: t.id,
                    node: t.node_id.clone(),
                })
                .collect(),
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

pub fn run(args: RunArgs, config: &CliConfig, show_events: bool) -> anyhow::Result<()> {
    let manifest = read_manifest(&args.manifest)?;
    let catalog = load_catalog(config)?;
    let compiled = procflow_dsl::compile(&manifest, &catalog)?;
    let subprocesses = resolve_subprocesses(&compiled.subflow_refs, &catalog)?;
    let definitions = loader::definition_set(compiled.definition, subprocesses)?;

    let engine = engine(config);
    let data = parse_data(args.data.as_deref())?;
    let mut unit = ();
    let mut sink = RecordingSink::new();
    let mut instance = {
        let mut ctx = ExecutionContext::new(&mut unit).with_events(&mut sink);
        engine.create(definitions, data, &mut ctx)?
    };
    let result = advance_and_save(&engine, &mut instance, &args.state, &mut sink);
    if show_events {
        print_events(&sink)?;
    }
    let outcome = result?;
    print_json(&InstanceSummary::new(&instance, &outcome.waiting_task_ids))
}

pub fn resume(args: ResumeArgs, config: &CliConfig, show_events: bool) -> anyhow::Result<()> {
    let engine = engine(config);
    let state = read_state(&args.state)?;
    let completion = match args.task {
        Some(task) => Some(TaskCompletion::new(task).with_data(parse_data(args.data.as_deref())?)),
        None => None,
    };

    let mut unit = ();
    let mut sink = RecordingSink::new();
    let (instance, outcome) = {
        let mut ctx = ExecutionContext::new(&mut unit).with_events(&mut sink);
        engine.resume(&state, completion, &mut ctx)?
    };
    write_state(&engine, &instance, &args.state)?;
    if show_events {
        print_events(&sink)?;
    }
    print_json(&InstanceSummary::new(&instance, &outcome.waiting_task_ids))
}

pub fn correlate(args: CorrelateArgs, config: &CliConfig, show_events: bool) -> anyhow::Result<()> {
    let engine = engine(config);
    let mut instance = engine.restore(&read_state(&args.state)?)?;
    let payload = parse_data(args.payload.as_deref())?;

    let mut unit = ();
    let mut sink = RecordingSink::new();
    let task = {
        let mut ctx = ExecutionContext::new(&mut unit).with_events(&mut sink);
        engine
            .correlate_event(&mut instance, &args.event, payload, &mut ctx)
            .with_context(|| format!("cannot deliver '{}'", args.event))?
    };
    tracing::info!(task = %task, event = %args.event, "Message delivered");

    let result = advance_and_save(&engine, &mut instance, &args.state, &mut sink);
    if show_events {
        print_events(&sink)?;
    }
    let outcome = result?;
    print_json(&InstanceSummary::new(&instance, &outcome.waiting_task_ids))
}

pub fn cancel(args: CancelArgs, config: &CliConfig, show_events: bool) -> anyhow::Result<()> {
    let engine = engine(config);
    let mut instance = engine.restore(&read_state(&args.state)?)?;
    let mut unit = ();
    let mut sink = RecordingSink::new();
    {
        let mut ctx = ExecutionContext::new(&mut unit).with_events(&mut sink);
        engine.cancel(&mut instance, &args.reason, &mut ctx)?;
    }
    write_state(&engine, &instance, &args.state)?;
    if show_events {
        print_events(&sink)?;
    }
    print_success(&format!("Instance {} cancelled", instance.id.short()));
    Ok(())
}

pub fn show(state: &str, config: &CliConfig) -> anyhow::Result<()> {
    let engine = engine(config);
    let instance = engine.restore(&read_state(state)?)?;
    let rows: Vec<TaskRow> = instance
        .tasks
        .iter()
        .map(|t| TaskRow {
            id: t.id,
            run: t.run,
            node: t.node_id.clone(),
            kind: t.kind,
            state: t.state,
            via_flow: t.via_flow.clone(),
        })
        .collect();

    let waiting = instance.tasks_in_state(TaskState::Waiting);
    print_json(&serde_json::json!({
        "instance": InstanceSummary::new(&instance, &waiting),
        "data": instance.data,
        "tasks": rows,
    }))
}

// ── Helpers ──────────────────────────────────────────────────────────

/// The CLI has no service handlers; service tasks complete untouched
fn engine(config: &CliConfig) -> Engine<()> {
    Engine::new(HandlerRegistry::empty()).with_config(config.engine.clone())
}

fn advance_and_save(
    engine: &Engine<()>,
    instance: &mut Instance,
    state_path: &str,
    sink: &mut RecordingSink,
) -> anyhow::Result<AdvanceOutcome> {
    let mut unit = ();
    let result = {
        let mut ctx = ExecutionContext::new(&mut unit).with_events(sink);
        engine.advance(instance, &mut ctx)
    };
    // Saved either way; a failed advance leaves the failing task READY
    write_state(engine, instance, state_path)?;
    Ok(result?)
}

fn read_state(path: &str) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read state file {}", path))
}

fn write_state(engine: &Engine<()>, instance: &Instance, path: &str) -> anyhow::Result<()> {
    std::fs::write(path, engine.persist(instance)?)
        .with_context(|| format!("cannot write state file {}", path))?;
    tracing::debug!(path = %path, status = %instance.status, "State saved");
    Ok(())
}

/// Parse a JSON object given inline or as `@path`
pub fn parse_data(input: Option<&str>) -> anyhow::Result<DataBag> {
    let Some(input) = input else {
        return Ok(DataBag::new());
    };
    let text = match input.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?
        }
        None => input.to_string(),
    };
    match serde_json::from_str::<serde_json::Value>(&text).context("data is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("data must be a JSON object, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inline_object() {
        let data = parse_data(Some(r#"{"x": 1}"#)).unwrap();
        assert_eq!(data["x"], 1);
    }

    #[test]
    fn test_parse_missing_is_empty() {
        assert!(parse_data(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(parse_data(Some("[1, 2]")).is_err());
        assert!(parse_data(Some("{oops")).is_err());
    }

    #[test]
    fn test_parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"approved": true}"#).unwrap();

        let data = parse_data(Some(&format!("@{}", path.display()))).unwrap();
        assert_eq!(data["approved"], true);
    }
}
