//! Validator: checks manifests for structural and referential correctness
//!
//! Validation runs before compilation and has no side effects. The cycle
//! check follows `next` edges only; loops closed through gateway branches
//! are not detected here and are bounded by the engine's step limit.

use crate::errors::ValidationError;
use procflow_types::{Manifest, ManifestNode, NodeKind};
use std::collections::{HashMap, HashSet};

/// Validate a manifest
pub fn validate(manifest: &Manifest) -> Result<(), ValidationError> {
    let start = manifest.start.as_deref().ok_or(ValidationError::MissingStart)?;
    let nodes = manifest.nodes.as_deref().ok_or(ValidationError::MissingNodes)?;

    let index = validate_unique_node_ids(nodes)?;
    validate_start_exists(start, &index)?;
    validate_next_references(nodes, &index)?;
    validate_call_nodes(nodes)?;
    validate_gateways(nodes, &index)?;
    validate_start_references(start, nodes, &index)?;
    validate_no_next_cycles(start, &index)?;
    Ok(())
}

fn validate_unique_node_ids(
    nodes: &[ManifestNode],
) -> Result<HashMap<&str, &ManifestNode>, ValidationError> {
    let mut index = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if index.insert(node.id.as_str(), node).is_some() {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }
    Ok(index)
}

fn validate_start_exists(
    start: &str,
    index: &HashMap<&str, &ManifestNode>,
) -> Result<(), ValidationError> {
    if !index.contains_key(start) {
        return Err(ValidationError::UnknownStartNode(start.to_string()));
    }
    Ok(())
}

fn validate_next_references(
    nodes: &[ManifestNode],
    index: &HashMap<&str, &ManifestNode>,
) -> Result<(), ValidationError> {
    for node in nodes {
        if let Some(next) = &node.next {
            if !index.contains_key(next.as_str()) {
                return Err(ValidationError::UnknownNextNode {
                    node: node.id.clone(),
                    next: next.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_call_nodes(nodes: &[ManifestNode]) -> Result<(), ValidationError> {
    for node in nodes.iter().filter(|n| n.kind == NodeKind::Call) {
        let missing = if node.subflow_key.as_deref().map_or(true, str::is_empty) {
            Some("subflow_key")
        } else if node.subflow_version.is_none() {
            Some("subflow_version")
        } else {
            None
        };
        if let Some(field) = missing {
            return Err(ValidationError::MissingCallField {
                node: node.id.clone(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_gateways(
    nodes: &[ManifestNode],
    index: &HashMap<&str, &ManifestNode>,
) -> Result<(), ValidationError> {
    for gateway in nodes.iter().filter(|n| n.kind == NodeKind::Gateway) {
        if gateway.branches.is_empty() {
            return Err(ValidationError::EmptyGateway(gateway.id.clone()));
        }

        let defaults = gateway.branches.iter().filter(|b| b.is_default()).count();
        if defaults != 1 {
            return Err(ValidationError::DefaultBranchCount {
                gateway: gateway.id.clone(),
                count: defaults,
            });
        }

        for branch in &gateway.branches {
            if !index.contains_key(branch.to.as_str()) {
                return Err(ValidationError::UnknownBranchTarget {
                    gateway: gateway.id.clone(),
                    target: branch.to.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Start-type nodes compile to nothing, so anything pointing at one must be
/// able to pass through its `next`
fn validate_start_references(
    start: &str,
    nodes: &[ManifestNode],
    index: &HashMap<&str, &ManifestNode>,
) -> Result<(), ValidationError> {
    let references = std::iter::once(start)
        .chain(nodes.iter().filter_map(|n| n.next.as_deref()))
        .chain(
            nodes
                .iter()
                .filter(|n| n.kind == NodeKind::Gateway)
                .flat_map(|g| g.branches.iter().map(|b| b.to.as_str())),
        );

    for target in references {
        let mut seen = HashSet::new();
        let mut current = target;
        while let Some(node) = index.get(current).filter(|n| n.kind == NodeKind::Start) {
            if !seen.insert(current) {
                return Err(ValidationError::CycleDetected {
                    node: current.to_string(),
                });
            }
            match node.next.as_deref() {
                Some(next) => current = next,
                None => return Err(ValidationError::StartWithoutNext(node.id.clone())),
            }
        }
    }
    Ok(())
}

/// Walk the `next` chain from `start`; revisiting a node is a cycle
fn validate_no_next_cycles(
    start: &str,
    index: &HashMap<&str, &ManifestNode>,
) -> Result<(), ValidationError> {
    let mut on_path = HashSet::new();
    let mut current = Some(start);

    while let Some(id) = current {
        if !on_path.insert(id) {
            return Err(ValidationError::CycleDetected {
                node: id.to_string(),
            });
        }
        current = index.get(id).and_then(|n| n.next.as_deref());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_types::Branch;

    fn valid_manifest() -> Manifest {
        Manifest::new("s1")
            .with_node(ManifestNode::call("s1", "docs.check", 1).with_next("g1"))
            .with_node(ManifestNode::gateway(
                "g1",
                vec![Branch::when("x > 5", "c2"), Branch::otherwise("c1")],
            ))
            .with_node(ManifestNode::call("c2", "review", 1))
            .with_node(ManifestNode::call("c1", "notify", 2))
    }

    #[test]
    fn test_valid_manifest() {
        assert!(validate(&valid_manifest()).is_ok());
    }

    #[test]
    fn test_missing_start() {
        let mut manifest = valid_manifest();
        manifest.start = None;
        assert_eq!(validate(&manifest), Err(ValidationError::MissingStart));
    }

    #[test]
    fn test_missing_nodes() {
        let mut manifest = valid_manifest();
        manifest.nodes = None;
        assert_eq!(validate(&manifest), Err(ValidationError::MissingNodes));
    }

    #[test]
    fn test_duplicate_node_id() {
        let manifest = valid_manifest().with_node(ManifestNode::end("c1"));
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::DuplicateNodeId("c1".into()))
        );
    }

    #[test]
    fn test_unknown_start() {
        let mut manifest = valid_manifest();
        manifest.start = Some("nope".into());
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::UnknownStartNode("nope".into()))
        );
    }

    #[test]
    fn test_unknown_next() {
        let manifest = Manifest::new("a").with_node(ManifestNode::call("a", "k", 1).with_next("b"));
        assert!(matches!(
            validate(&manifest),
            Err(ValidationError::UnknownNextNode { node, next }) if node == "a" && next == "b"
        ));
    }

    #[test]
    fn test_call_without_version() {
        let mut node = ManifestNode::call("a", "k", 1);
        node.subflow_version = None;
        let manifest = Manifest::new("a").with_node(node);
        assert!(matches!(
            validate(&manifest),
            Err(ValidationError::MissingCallField { field, .. }) if field == "subflow_version"
        ));
    }

    #[test]
    fn test_empty_gateway() {
        let manifest = Manifest::new("g").with_node(ManifestNode::gateway("g", vec![]));
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::EmptyGateway("g".into()))
        );
    }

    #[test]
    fn test_gateway_without_default() {
        let manifest = Manifest::new("g")
            .with_node(ManifestNode::gateway("g", vec![Branch::when("x > 1", "e")]))
            .with_node(ManifestNode::end("e"));
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::DefaultBranchCount {
                gateway: "g".into(),
                count: 0
            })
        );
    }

    #[test]
    fn test_gateway_with_two_defaults() {
        let manifest = Manifest::new("g")
            .with_node(ManifestNode::gateway(
                "g",
                vec![Branch::otherwise("e"), Branch::otherwise("e")],
            ))
            .with_node(ManifestNode::end("e"));
        assert!(matches!(
            validate(&manifest),
            Err(ValidationError::DefaultBranchCount { count: 2, .. })
        ));
    }

    #[test]
    fn test_branch_to_unknown_node() {
        let manifest = Manifest::new("g")
            .with_node(ManifestNode::gateway(
                "g",
                vec![Branch::when("x", "missing"), Branch::otherwise("e")],
            ))
            .with_node(ManifestNode::end("e"));
        assert!(matches!(
            validate(&manifest),
            Err(ValidationError::UnknownBranchTarget { target, .. }) if target == "missing"
        ));
    }

    #[test]
    fn test_next_cycle_detected() {
        let manifest = Manifest::new("a")
            .with_node(ManifestNode::call("a", "k", 1).with_next("b"))
            .with_node(ManifestNode::call("b", "k", 1).with_next("a"));
        assert!(matches!(
            validate(&manifest),
            Err(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_self_loop_detected() {
        let manifest = Manifest::new("a").with_node(ManifestNode::call("a", "k", 1).with_next("a"));
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::CycleDetected { node: "a".into() })
        );
    }

    #[test]
    fn test_gateway_only_cycle_not_detected() {
        let manifest = Manifest::new("a")
            .with_node(ManifestNode::call("a", "k", 1).with_next("g"))
            .with_node(ManifestNode::gateway(
                "g",
                vec![Branch::when("again", "a"), Branch::otherwise("e")],
            ))
            .with_node(ManifestNode::end("e"));
        assert!(validate(&manifest).is_ok());
    }

    #[test]
    fn test_start_node_without_next() {
        let manifest = Manifest::new("begin").with_node(ManifestNode::start("begin"));
        assert_eq!(
            validate(&manifest),
            Err(ValidationError::StartWithoutNext("begin".into()))
        );
    }

    #[test]
    fn test_start_node_with_next() {
        let manifest = Manifest::new("begin")
            .with_node(ManifestNode::start("begin").with_next("a"))
            .with_node(ManifestNode::call("a", "k", 1));
        assert!(validate(&manifest).is_ok());
    }
}
