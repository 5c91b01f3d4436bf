//! Process definitions: compiled, executable graphs
//!
//! A ProcessDefinition is a flat list of flow elements joined by sequence
//! flows. Definitions are produced by the compiler (from manifests) or
//! published to the subflow catalog, and are immutable once built.
//! Every flow endpoint refers to an element of the same definition; the
//! only outward references are call activities' `called_element` strings.

use crate::{parse_called_element, LookupError, SequenceFlow, WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Id of the synthetic start event every compiled definition begins with
pub const START_EVENT_ID: &str = "StartEvent_1";

// ── Flow Elements ────────────────────────────────────────────────────

/// One element of a process definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowElement {
    pub id: String,
    #[serde(flatten)]
    pub kind: ElementKind,
}

/// What a flow element does when a token reaches it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    /// Invoke another process definition as a nested run
    CallActivity {
        name: String,
        called_element: String,
        subflow_key: String,
        subflow_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy_ref: Option<String>,
    },
    ExclusiveGateway,
    /// Automated step executed by a registered service handler
    ServiceTask { name: String },
    /// Human step; execution stops until it is completed externally
    UserTask { name: String },
    /// Wait point satisfied by correlating a named message
    MessageCatchEvent { event_name: String },
}

impl ElementKind {
    /// Snake-case label of the element kind
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartEvent => "start_event",
            Self::EndEvent => "end_event",
            Self::CallActivity { .. } => "call_activity",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ServiceTask { .. } => "service_task",
            Self::UserTask { .. } => "user_task",
            Self::MessageCatchEvent { .. } => "message_catch_event",
        }
    }
}

impl FlowElement {
    pub fn start_event(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::StartEvent,
        }
    }

    pub fn end_event(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::EndEvent,
        }
    }

    pub fn call_activity(
        id: impl Into<String>,
        name: impl Into<String>,
        subflow_key: impl Into<String>,
        subflow_version: u32,
    ) -> Self {
        let subflow_key = subflow_key.into();
        Self {
            id: id.into(),
            kind: ElementKind::CallActivity {
                name: name.into(),
                called_element: crate::called_element(&subflow_key, subflow_version),
                subflow_key,
                subflow_version,
                policy_ref: None,
            },
        }
    }

    pub fn exclusive_gateway(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::ExclusiveGateway,
        }
    }

    pub fn service_task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::ServiceTask { name: name.into() },
        }
    }

    pub fn user_task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::UserTask { name: name.into() },
        }
    }

    pub fn message_catch_event(id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::MessageCatchEvent {
                event_name: event_name.into(),
            },
        }
    }

    /// Attach a policy annotation (call activities only)
    pub fn with_policy_ref(mut self, policy: impl Into<String>) -> Self {
        if let ElementKind::CallActivity { policy_ref, .. } = &mut self.kind {
            *policy_ref = Some(policy.into());
        }
        self
    }

    /// Display name, falling back to the element id
    pub fn name(&self) -> &str {
        match &self.kind {
            ElementKind::CallActivity { name, .. }
            | ElementKind::ServiceTask { name }
            | ElementKind::UserTask { name } => name,
            _ => &self.id,
        }
    }

    /// The called element of a call activity
    pub fn called_element(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::CallActivity { called_element, .. } => Some(called_element),
            _ => None,
        }
    }
}

// ── Process Definition ───────────────────────────────────────────────

/// A compiled, executable process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub elements: Vec<FlowElement>,
    pub flows: Vec<SequenceFlow>,
}

impl ProcessDefinition {
    /// Create an empty definition
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            name: None,
            elements: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an element, rejecting duplicate ids
    pub fn add_element(&mut self, element: FlowElement) -> WorkflowResult<()> {
        if self.element(&element.id).is_some() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "duplicate element id '{}' in process '{}'",
                element.id, self.process_id
            )));
        }
        self.elements.push(element);
        Ok(())
    }

    /// Add a flow whose endpoints must already exist
    pub fn add_flow(&mut self, flow: SequenceFlow) -> WorkflowResult<()> {
        for endpoint in [&flow.source, &flow.target] {
            if self.element(endpoint).is_none() {
                return Err(WorkflowError::ElementNotFound {
                    process: self.process_id.clone(),
                    element: endpoint.clone(),
                });
            }
        }
        self.flows.push(flow);
        Ok(())
    }

    /// Get an element by id
    pub fn element(&self, id: &str) -> Option<&FlowElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Flows leaving an element, in definition order
    pub fn outgoing(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == element_id).collect()
    }

    /// Flows entering an element
    pub fn incoming(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.target == element_id).collect()
    }

    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// The start event
    pub fn start_event(&self) -> Option<&FlowElement> {
        self.elements
            .iter()
            .find(|e| e.kind == ElementKind::StartEvent)
    }

    pub fn end_events(&self) -> Vec<&FlowElement> {
        self.elements
            .iter()
            .filter(|e| e.kind == ElementKind::EndEvent)
            .collect()
    }

    /// All call activities, in definition order
    pub fn call_activities(&self) -> Vec<&FlowElement> {
        self.elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::CallActivity { .. }))
            .collect()
    }

    /// Check the definition is referentially closed and executable
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |msg: String| {
            Err(WorkflowError::InvalidDefinition(format!(
                "process '{}': {}",
                self.process_id, msg
            )))
        };

        if self.process_id.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "process id must not be empty".into(),
            ));
        }

        let mut ids = HashSet::new();
        for element in &self.elements {
            if !ids.insert(element.id.as_str()) {
                return invalid(format!("duplicate element id '{}'", element.id));
            }
            if let Some(called) = element.called_element() {
                if parse_called_element(called).is_none() {
                    return Err(LookupError::MalformedCalledElement(called.to_string()).into());
                }
            }
        }

        let starts = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::StartEvent)
            .count();
        if starts != 1 {
            return invalid(format!("expected exactly one start event, found {}", starts));
        }

        let mut flow_ids = HashSet::new();
        for flow in &self.flows {
            if !flow_ids.insert(flow.id.as_str()) {
                return invalid(format!("duplicate flow id '{}'", flow.id));
            }
            for endpoint in [&flow.source, &flow.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(WorkflowError::ElementNotFound {
                        process: self.process_id.clone(),
                        element: endpoint.clone(),
                    });
                }
            }
        }

        for element in &self.elements {
            let outgoing = self.outgoing(&element.id);
            let defaults = outgoing.iter().filter(|f| f.is_default).count();
            if element.kind == ElementKind::ExclusiveGateway {
                if defaults > 1 {
                    return invalid(format!(
                        "gateway '{}' has {} default flows",
                        element.id, defaults
                    ));
                }
            } else if defaults > 0 || outgoing.iter().any(|f| f.is_conditional()) {
                return invalid(format!(
                    "only gateways may carry conditional or default flows ('{}')",
                    element.id
                ));
            }
        }

        Ok(())
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

// ── Subflow References ───────────────────────────────────────────────

/// A distinct catalog subflow that a compiled process calls
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubflowReference {
    pub subflow_key: String,
    pub version: u32,
    #[serde(rename = "calledElement")]
    pub called_element: String,
    /// Ids of the call activities that invoke this subflow
    #[serde(default)]
    pub called_by: Vec<String>,
}

impl SubflowReference {
    pub fn new(subflow_key: impl Into<String>, version: u32) -> Self {
        let subflow_key = subflow_key.into();
        Self {
            called_element: crate::called_element(&subflow_key, version),
            subflow_key,
            version,
            called_by: Vec::new(),
        }
    }
}

/// Output of compiling a manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledProcess {
    pub definition: ProcessDefinition,
    pub subflow_refs: Vec<SubflowReference>,
}

// ── Definition Set ───────────────────────────────────────────────────

/// The root definition plus every subprocess definition it may call,
/// keyed by called element
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionSet {
    pub root: ProcessDefinition,
    #[serde(default)]
    pub subprocesses: BTreeMap<String, ProcessDefinition>,
}

impl DefinitionSet {
    pub fn new(root: ProcessDefinition) -> Self {
        Self {
            root,
            subprocesses: BTreeMap::new(),
        }
    }

    pub fn with_subprocess(
        mut self,
        called_element: impl Into<String>,
        definition: ProcessDefinition,
    ) -> Self {
        self.subprocesses.insert(called_element.into(), definition);
        self
    }

    /// Resolve a run's definition: `None` is the root
    pub fn get(&self, called_element: Option<&str>) -> Option<&ProcessDefinition> {
        match called_element {
            None => Some(&self.root),
            Some(called) => self.subprocesses.get(called),
        }
    }

    /// Validate every definition and check each call activity resolves
    pub fn validate(&self) -> WorkflowResult<()> {
        for definition in std::iter::once(&self.root).chain(self.subprocesses.values()) {
            definition.validate()?;
            for call in definition.call_activities() {
                if let Some(called) = call.called_element() {
                    if !self.subprocesses.contains_key(called) {
                        return Err(LookupError::UnresolvedCalledElement(called.to_string()).into());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("linear");
        def.add_element(FlowElement::start_event(START_EVENT_ID)).unwrap();
        def.add_element(FlowElement::service_task("work", "Do work")).unwrap();
        def.add_element(FlowElement::end_event("done")).unwrap();
        def.add_flow(SequenceFlow::new("f1", START_EVENT_ID, "work")).unwrap();
        def.add_flow(SequenceFlow::new("f2", "work", "done")).unwrap();
        def
    }

    #[test]
    fn test_valid_definition() {
        let def = linear();
        assert!(def.validate().is_ok());
        assert_eq!(def.start_event().unwrap().id, START_EVENT_ID);
        assert_eq!(def.outgoing("work").len(), 1);
        assert_eq!(def.incoming("work")[0].id, "f1");
        assert_eq!(def.element("work").unwrap().name(), "Do work");
    }

    #[test]
    fn test_duplicate_element_rejected() {
        let mut def = linear();
        let result = def.add_element(FlowElement::end_event("done"));
        assert!(matches!(result, Err(WorkflowError::InvalidDefinition(_))));
    }

    #[test]
    fn test_flow_to_unknown_element_rejected() {
        let mut def = linear();
        let result = def.add_flow(SequenceFlow::new("f3", "work", "nowhere"));
        assert!(matches!(result, Err(WorkflowError::ElementNotFound { .. })));
    }

    #[test]
    fn test_two_defaults_rejected() {
        let mut def = ProcessDefinition::new("p");
        def.elements.push(FlowElement::start_event(START_EVENT_ID));
        def.elements.push(FlowElement::exclusive_gateway("g"));
        def.elements.push(FlowElement::end_event("a"));
        def.elements.push(FlowElement::end_event("b"));
        def.flows.push(SequenceFlow::new("f0", START_EVENT_ID, "g"));
        def.flows.push(SequenceFlow::new("f1", "g", "a").as_default());
        def.flows.push(SequenceFlow::new("f2", "g", "b").as_default());
        assert!(matches!(def.validate(), Err(WorkflowError::InvalidDefinition(_))));
    }

    #[test]
    fn test_conditional_flow_outside_gateway_rejected() {
        let mut def = linear();
        def.flows[1].condition = Some("x > 1".into());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_element_serialization_shape() {
        let element = FlowElement::call_activity("c1", "Check", "docs.check", 2)
            .with_policy_ref("policy.strict");
        let json = serde_json::to_value(&element).unwrap();
        assert_eq!(json["kind"], "call_activity");
        assert_eq!(json["called_element"], "docs.check@v2");
        assert_eq!(json["policy_ref"], "policy.strict");

        let back: FlowElement = serde_json::from_value(json).unwrap();
        assert_eq!(back, element);
    }

    #[test]
    fn test_definition_set_requires_subprocesses() {
        let mut root = ProcessDefinition::new("root");
        root.elements.push(FlowElement::start_event(START_EVENT_ID));
        root.elements.push(FlowElement::call_activity("c1", "c1", "sub", 1));
        root.elements.push(FlowElement::end_event("end"));
        root.flows.push(SequenceFlow::new("f0", START_EVENT_ID, "c1"));
        root.flows.push(SequenceFlow::new("f1", "c1", "end"));

        let set = DefinitionSet::new(root.clone());
        assert!(matches!(
            set.validate(),
            Err(WorkflowError::Lookup(LookupError::UnresolvedCalledElement(_)))
        ));

        let set = DefinitionSet::new(root).with_subprocess("sub@v1", linear());
        assert!(set.validate().is_ok());
        assert_eq!(set.get(Some("sub@v1")).unwrap().process_id, "linear");
        assert_eq!(set.get(None).unwrap().process_id, "root");
    }
}
