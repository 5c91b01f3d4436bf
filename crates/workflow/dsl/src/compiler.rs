//! Compiler: converts manifests into ProcessDefinitions
//!
//! Takes a Manifest, validates it, and produces a ProcessDefinition plus
//! the list of catalog subflows it calls. Element and flow ids are derived
//! only from the manifest, so compiling the same manifest twice yields
//! identical output.

use crate::catalog::SubflowCatalog;
use crate::errors::{DslError, DslResult, ValidationError};
use crate::validator;
use procflow_types::*;
use std::collections::HashMap;

/// Id of the flow from the synthetic start event
pub const START_FLOW_ID: &str = "Flow__Start";

/// Compile manifest JSON text
pub fn compile_json(input: &str, catalog: &dyn SubflowCatalog) -> DslResult<CompiledProcess> {
    let manifest = Manifest::from_json(input)?;
    compile(&manifest, catalog)
}

/// Compile a manifest, checking every called subflow exists in `catalog`
pub fn compile(manifest: &Manifest, catalog: &dyn SubflowCatalog) -> DslResult<CompiledProcess> {
    validator::validate(manifest)?;

    let process_id = manifest.process_identifier();
    let mut def = ProcessDefinition::new(&process_id);
    if let Some(name) = &manifest.workflow_name {
        def = def.with_name(name);
    }

    let nodes = manifest.nodes();
    let index: HashMap<&str, &ManifestNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    def.add_element(FlowElement::start_event(START_EVENT_ID))?;

    // Elements
    let mut refs: Vec<SubflowReference> = Vec::new();
    for node in nodes {
        match node.kind {
            NodeKind::Call => {
                let (element, key, version) = compile_call(node)?;
                catalog.lookup(key, version)?;
                record_reference(&mut refs, key, version, &node.id);
                def.add_element(element)?;
            }
            NodeKind::Gateway => def.add_element(FlowElement::exclusive_gateway(&node.id))?,
            NodeKind::End => def.add_element(FlowElement::end_event(end_event_id(&node.id)))?,
            NodeKind::Start => {}
        }
    }

    // Start event to the start node
    let start = manifest.start.as_deref().ok_or(ValidationError::MissingStart)?;
    let target = element_id(start, &index)?;
    def.add_flow(SequenceFlow::new(START_FLOW_ID, START_EVENT_ID, target))?;

    // Linear next relationships
    let mut flow_idx = 1;
    for node in nodes.iter().filter(|n| n.kind == NodeKind::Call) {
        if let Some(next) = &node.next {
            let target = element_id(next, &index)?;
            def.add_flow(SequenceFlow::new(format!("Flow__{}", flow_idx), &node.id, target))?;
            flow_idx += 1;
        }
    }

    // Call nodes without next end the process
    for node in nodes.iter().filter(|n| n.kind == NodeKind::Call && n.next.is_none()) {
        let end_id = end_event_id(&node.id);
        def.add_element(FlowElement::end_event(&end_id))?;
        def.add_flow(SequenceFlow::new(
            format!("Flow__End__{}", node.id),
            &node.id,
            end_id,
        ))?;
    }

    // Gateway branches
    for gateway in nodes.iter().filter(|n| n.kind == NodeKind::Gateway) {
        for branch in &gateway.branches {
            let target = element_id(&branch.to, &index)?;
            let id = format!("Flow__{}", flow_idx);
            let flow = match (branch.otherwise, branch.condition()) {
                (false, Some(condition)) => {
                    SequenceFlow::conditional(id, &gateway.id, target, condition)
                }
                _ => SequenceFlow::new(id, &gateway.id, target).as_default(),
            };
            def.add_flow(flow)?;
            flow_idx += 1;
        }
    }

    def.validate()?;

    tracing::debug!(
        process = %process_id,
        elements = def.element_count(),
        flows = def.flow_count(),
        subflows = refs.len(),
        "Manifest compiled"
    );

    Ok(CompiledProcess {
        definition: def,
        subflow_refs: refs,
    })
}

fn compile_call(node: &ManifestNode) -> DslResult<(FlowElement, &str, u32)> {
    let missing = |field: &str| ValidationError::MissingCallField {
        node: node.id.clone(),
        field: field.to_string(),
    };
    let key = node.subflow_key.as_deref().ok_or_else(|| missing("subflow_key"))?;
    let version = node.subflow_version.ok_or_else(|| missing("subflow_version"))?;
    let name = node.name.as_deref().unwrap_or(&node.id);

    let mut element = FlowElement::call_activity(&node.id, name, key, version);
    if let Some(policy) = &node.policy_ref {
        element = element.with_policy_ref(policy);
    }
    Ok((element, key, version))
}

fn record_reference(refs: &mut Vec<SubflowReference>, key: &str, version: u32, caller: &str) {
    match refs
        .iter_mut()
        .find(|r| r.subflow_key == key && r.version == version)
    {
        Some(existing) => existing.called_by.push(caller.to_string()),
        None => {
            let mut reference = SubflowReference::new(key, version);
            reference.called_by.push(caller.to_string());
            refs.push(reference);
        }
    }
}

/// Element id of an auto-generated or end-node end event
pub fn end_event_id(node_id: &str) -> String {
    format!("EndEvent__{}", node_id)
}

/// The element a reference to `node_id` lands on; start-type nodes are
/// passed through via their `next`
fn element_id(node_id: &str, index: &HashMap<&str, &ManifestNode>) -> DslResult<String> {
    let mut current = node_id;
    for _ in 0..=index.len() {
        let node = index.get(current).ok_or_else(|| {
            DslError::Compilation(format!("reference to unknown node '{}'", current))
        })?;
        match node.kind {
            NodeKind::Call | NodeKind::Gateway => return Ok(node.id.clone()),
            NodeKind::End => return Ok(end_event_id(&node.id)),
            NodeKind::Start => {
                current = node
                    .next
                    .as_deref()
                    .ok_or_else(|| ValidationError::StartWithoutNext(node.id.clone()))?;
            }
        }
    }
    Err(ValidationError::CycleDetected {
        node: node_id.to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use proptest::prelude::*;

    fn catalog_with(keys: &[(&str, u32)]) -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        for (key, version) in keys {
            let mut def = ProcessDefinition::new(key.replace('.', "_"));
            def.add_element(FlowElement::start_event(START_EVENT_ID)).unwrap();
            def.add_element(FlowElement::end_event("end")).unwrap();
            def.add_flow(SequenceFlow::new("f", START_EVENT_ID, "end")).unwrap();
            catalog.publish(*key, *version, def, None).unwrap();
        }
        catalog
    }

    fn end_to_end_manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "start": "s1",
                "nodes": [
                    {"id": "s1", "type": "call", "subflow_key": "k", "subflow_version": 1, "next": "g1"},
                    {"id": "g1", "type": "gateway", "branches": [
                        {"when": "x>0", "to": "c1"},
                        {"else": true, "to": "e1"}
                    ]},
                    {"id": "c1", "type": "call", "subflow_key": "k2", "subflow_version": 1},
                    {"id": "e1", "type": "end"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_end_to_end_manifest() {
        let catalog = catalog_with(&[("k", 1), ("k2", 1)]);
        let compiled = compile(&end_to_end_manifest(), &catalog).unwrap();
        let def = &compiled.definition;

        assert_eq!(def.process_id, DEFAULT_PROCESS_ID);
        assert_eq!(compiled.subflow_refs.len(), 2);
        assert_eq!(compiled.subflow_refs[0].called_element, "k@v1");
        assert_eq!(compiled.subflow_refs[1].called_by, vec!["c1".to_string()]);

        let start_flow = def.flow(START_FLOW_ID).unwrap();
        assert_eq!(start_flow.source, START_EVENT_ID);
        assert_eq!(start_flow.target, "s1");

        assert_eq!(def.flow("Flow__1").unwrap().target, "g1");
        assert_eq!(def.flow("Flow__End__c1").unwrap().target, "EndEvent__c1");

        let branches = def.outgoing("g1");
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].id, "Flow__2");
        assert_eq!(branches[0].condition.as_deref(), Some("x>0"));
        assert_eq!(branches[1].id, "Flow__3");
        assert_eq!(branches[1].target, "EndEvent__e1");
        assert!(branches[1].is_default);
    }

    #[test]
    fn test_call_activity_attributes() {
        let manifest = Manifest::new("c")
            .with_process_id("Admissions Flow")
            .with_node(
                ManifestNode::call("c", "docs.verification", 2)
                    .with_name("Verify documents")
                    .with_policy_ref("policy.docs"),
            );
        let catalog = catalog_with(&[("docs.verification", 2)]);
        let compiled = compile(&manifest, &catalog).unwrap();

        assert_eq!(compiled.definition.process_id, "Admissions_Flow");
        let call = compiled.definition.element("c").unwrap();
        assert_eq!(call.name(), "Verify documents");
        assert_eq!(
            call.kind,
            ElementKind::CallActivity {
                name: "Verify documents".into(),
                called_element: "docs.verification@v2".into(),
                subflow_key: "docs.verification".into(),
                subflow_version: 2,
                policy_ref: Some("policy.docs".into()),
            }
        );
    }

    #[test]
    fn test_missing_subflow_is_lookup_error() {
        let catalog = catalog_with(&[("k", 1)]);
        let result = compile(&end_to_end_manifest(), &catalog);
        assert!(matches!(
            result,
            Err(DslError::Lookup(LookupError::NotFound { key, version: 1 })) if key == "k2"
        ));
    }

    #[test]
    fn test_invalid_manifest_is_validation_error() {
        let catalog = catalog_with(&[]);
        let result = compile(&Manifest::default(), &catalog);
        assert!(matches!(
            result,
            Err(DslError::Validation(ValidationError::MissingStart))
        ));
    }

    #[test]
    fn test_shared_subflow_reference_deduplicated() {
        let manifest = Manifest::new("a")
            .with_node(ManifestNode::call("a", "k", 1).with_next("b"))
            .with_node(ManifestNode::call("b", "k", 1));
        let compiled = compile(&manifest, &catalog_with(&[("k", 1)])).unwrap();

        assert_eq!(compiled.subflow_refs.len(), 1);
        assert_eq!(
            compiled.subflow_refs[0].called_by,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_start_type_node_passes_through() {
        let manifest = Manifest::new("begin")
            .with_node(ManifestNode::start("begin").with_next("a"))
            .with_node(ManifestNode::call("a", "k", 1));
        let compiled = compile(&manifest, &catalog_with(&[("k", 1)])).unwrap();

        assert!(compiled.definition.element("begin").is_none());
        assert_eq!(compiled.definition.flow(START_FLOW_ID).unwrap().target, "a");
    }

    #[test]
    fn test_compile_json() {
        let catalog = catalog_with(&[("k", 1)]);
        let compiled = compile_json(
            r#"{"start": "a", "workflow_name": "demo-flow", "nodes": [{"id": "a", "type": "call", "subflow_key": "k", "subflow_version": 1}]}"#,
            &catalog,
        )
        .unwrap();
        assert_eq!(compiled.definition.process_id, "demo_flow");
        assert_eq!(compiled.definition.name.as_deref(), Some("demo-flow"));

        assert!(matches!(
            compile_json("not json", &catalog),
            Err(DslError::Parse(_))
        ));
    }

    // ── Properties ───────────────────────────────────────────────────

    /// A linear chain of call nodes ending in a gateway that splits to two
    /// end nodes
    fn chain_manifest(len: usize, threshold: i64) -> Manifest {
        let mut manifest = Manifest::new("n0");
        for i in 0..len {
            let next = if i + 1 < len {
                format!("n{}", i + 1)
            } else {
                "gw".to_string()
            };
            manifest = manifest.with_node(ManifestNode::call(format!("n{}", i), "k", 1).with_next(next));
        }
        manifest
            .with_node(ManifestNode::gateway(
                "gw",
                vec![
                    Branch::when(format!("x > {}", threshold), "high"),
                    Branch::otherwise("low"),
                ],
            ))
            .with_node(ManifestNode::end("high"))
            .with_node(ManifestNode::end("low"))
    }

    proptest! {
        #[test]
        fn prop_compilation_is_deterministic(len in 1usize..12, threshold in -50i64..50) {
            let catalog = catalog_with(&[("k", 1)]);
            let manifest = chain_manifest(len, threshold);
            let first = compile(&manifest, &catalog).unwrap();
            let second = compile(&manifest, &catalog).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_extra_default_branch_rejected(len in 1usize..8, extra in 1usize..4) {
            let catalog = catalog_with(&[("k", 1)]);
            let mut manifest = chain_manifest(len, 0);
            if let Some(gw) = manifest.nodes.as_mut().and_then(|n| n.iter_mut().find(|n| n.id == "gw")) {
                for _ in 0..extra {
                    gw.branches.push(Branch::otherwise("low"));
                }
            }
            let result = compile(&manifest, &catalog);
            let rejected = matches!(
                result,
                Err(DslError::Validation(ValidationError::DefaultBranchCount { .. }))
            );
            prop_assert!(rejected);
        }

        #[test]
        fn prop_next_cycle_rejected(len in 1usize..10, back in 0usize..10) {
            let back = back % len;
            let mut manifest = Manifest::new("n0");
            for i in 0..len {
                let next = if i + 1 < len { format!("n{}", i + 1) } else { format!("n{}", back) };
                manifest = manifest.with_node(ManifestNode::call(format!("n{}", i), "k", 1).with_next(next));
            }
            let rejected = matches!(
                validator::validate(&manifest),
                Err(ValidationError::CycleDetected { .. })
            );
            prop_assert!(rejected);
        }
    }
}
