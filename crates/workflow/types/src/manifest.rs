//! Manifests: the user-authored description of a workflow
//!
//! A manifest names a start node and lists nodes of four kinds: `start`,
//! `call` (invoke a catalog subflow), `gateway` (exclusive decision) and
//! `end`. Linear control flow is expressed with `next`, branching with a
//! gateway's `branches`.
//!
//! `start` and `nodes` are optional here so that a manifest missing them
//! still parses and the validator can report which field is absent.

use serde::{Deserialize, Deserializer, Serialize};

/// Process identifier used when a manifest names neither `process_id` nor
/// `workflow_name`
pub const DEFAULT_PROCESS_ID: &str = "Parent";

// ── Manifest ─────────────────────────────────────────────────────────

/// A workflow manifest
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Id of the node execution starts at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Explicit process identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Human-readable workflow name, used as the identifier fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    /// The nodes of the workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<ManifestNode>>,
}

impl Manifest {
    /// Create a manifest starting at `start` with no nodes
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            process_id: None,
            workflow_name: None,
            nodes: Some(Vec::new()),
        }
    }

    /// Parse a manifest from JSON text
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn with_workflow_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }

    pub fn with_node(mut self, node: ManifestNode) -> Self {
        self.nodes.get_or_insert_with(Vec::new).push(node);
        self
    }

    /// All nodes, empty when the `nodes` field is absent
    pub fn nodes(&self) -> &[ManifestNode] {
        self.nodes.as_deref().unwrap_or(&[])
    }

    /// Get a node by id
    pub fn node(&self, id: &str) -> Option<&ManifestNode> {
        self.nodes().iter().find(|n| n.id == id)
    }

    /// The process identifier, sanitized into a legal element id.
    ///
    /// Taken from `process_id`, then `workflow_name`, then
    /// [`DEFAULT_PROCESS_ID`]. Spaces and hyphens become underscores.
    pub fn process_identifier(&self) -> String {
        let raw = self
            .process_id
            .as_deref()
            .or(self.workflow_name.as_deref())
            .unwrap_or(DEFAULT_PROCESS_ID);
        sanitize_identifier(raw)
    }
}

/// Replace characters that are not legal in element identifiers
pub fn sanitize_identifier(raw: &str) -> String {
    raw.replace([' ', '-'], "_")
}

// ── Manifest Node ────────────────────────────────────────────────────

/// The kind of a manifest node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Call,
    Gateway,
    End,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Call => write!(f, "call"),
            Self::Gateway => write!(f, "gateway"),
            Self::End => write!(f, "end"),
        }
    }
}

/// A node in a manifest
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Display name of a call node (defaults to its id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow_key: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub subflow_version: Option<u32>,
    /// Policy annotation carried onto the compiled call activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

impl ManifestNode {
    fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            name: None,
            subflow_key: None,
            subflow_version: None,
            policy_ref: None,
            branches: Vec::new(),
        }
    }

    /// Create a start node
    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    /// Create a call node invoking `subflow_key` at `version`
    pub fn call(id: impl Into<String>, subflow_key: impl Into<String>, version: u32) -> Self {
        let mut node = Self::new(id, NodeKind::Call);
        node.subflow_key = Some(subflow_key.into());
        node.subflow_version = Some(version);
        node
    }

    /// Create a gateway node
    pub fn gateway(id: impl Into<String>, branches: Vec<Branch>) -> Self {
        let mut node = Self::new(id, NodeKind::Gateway);
        node.branches = branches;
        node
    }

    /// Create an end node
    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_policy_ref(mut self, policy_ref: impl Into<String>) -> Self {
        self.policy_ref = Some(policy_ref.into());
        self
    }

    /// The called element string for a call node, `"{key}@v{version}"`
    pub fn called_element(&self) -> Option<String> {
        match (&self.subflow_key, self.subflow_version) {
            (Some(key), Some(version)) => Some(called_element(key, version)),
            _ => None,
        }
    }
}

/// Build the called element string for a subflow key and version
pub fn called_element(key: &str, version: u32) -> String {
    format!("{}@v{}", key, version)
}

/// Split a called element string back into key and version
pub fn parse_called_element(called: &str) -> Option<(&str, u32)> {
    let (key, version) = called.rsplit_once("@v")?;
    if key.is_empty() {
        return None;
    }
    version.parse().ok().map(|v| (key, v))
}

// ── Branch ───────────────────────────────────────────────────────────

/// One outgoing branch of a gateway
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(rename = "else", default, skip_serializing_if = "std::ops::Not::not")]
    pub otherwise: bool,
}

impl Branch {
    /// A conditional branch
    pub fn when(condition: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            when: Some(condition.into()),
            otherwise: false,
        }
    }

    /// An explicit `else` branch
    pub fn otherwise(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            when: None,
            otherwise: true,
        }
    }

    /// The condition expression, if any (blank conditions count as absent)
    pub fn condition(&self) -> Option<&str> {
        self.when
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Whether this branch qualifies as the gateway's default branch
    pub fn is_default(&self) -> bool {
        self.otherwise || self.condition().is_none()
    }
}

/// Accept versions written either as numbers or as numeric strings
fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Number(u32),
        Text(String),
    }

    match Option::<Version>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Version::Number(v)) => Ok(Some(v)),
        Some(Version::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid subflow_version '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_json() {
        let manifest = Manifest::from_json(
            r#"{
                "start": "s1",
                "workflow_name": "Admission Flow-2024",
                "nodes": [
                    {"id": "s1", "type": "call", "subflow_key": "k", "subflow_version": 1, "next": "g1"},
                    {"id": "g1", "type": "gateway", "branches": [
                        {"when": "x > 0", "to": "e1"},
                        {"else": true, "to": "e1"}
                    ]},
                    {"id": "e1", "type": "end"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.start.as_deref(), Some("s1"));
        assert_eq!(manifest.nodes().len(), 3);
        assert_eq!(manifest.process_identifier(), "Admission_Flow_2024");

        let gateway = manifest.node("g1").unwrap();
        assert_eq!(gateway.kind, NodeKind::Gateway);
        assert!(!gateway.branches[0].is_default());
        assert!(gateway.branches[1].is_default());
    }

    #[test]
    fn test_missing_fields_still_parse() {
        let manifest = Manifest::from_json(r#"{"process_id": "p"}"#).unwrap();
        assert!(manifest.start.is_none());
        assert!(manifest.nodes.is_none());
        assert!(manifest.nodes().is_empty());
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let result = Manifest::from_json(r#"{"start": "a", "nodes": [{"id": "a", "type": "fork"}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_string_version_accepted() {
        let manifest = Manifest::from_json(
            r#"{"start": "a", "nodes": [{"id": "a", "type": "call", "subflow_key": "k", "subflow_version": "3"}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.node("a").unwrap().subflow_version, Some(3));
        assert_eq!(
            manifest.node("a").unwrap().called_element().as_deref(),
            Some("k@v3")
        );
    }

    #[test]
    fn test_process_identifier_fallbacks() {
        assert_eq!(Manifest::new("a").process_identifier(), DEFAULT_PROCESS_ID);
        assert_eq!(
            Manifest::new("a")
                .with_workflow_name("wf name")
                .with_process_id("proc-id")
                .process_identifier(),
            "proc_id"
        );
    }

    #[test]
    fn test_blank_condition_is_default() {
        let branch = Branch {
            to: "x".into(),
            when: Some("   ".into()),
            otherwise: false,
        };
        assert!(branch.is_default());
        assert!(branch.condition().is_none());
    }

    #[test]
    fn test_called_element_round_trip() {
        assert_eq!(called_element("docs.verification", 2), "docs.verification@v2");
        assert_eq!(
            parse_called_element("docs.verification@v2"),
            Some(("docs.verification", 2))
        );
        assert_eq!(parse_called_element("no-version"), None);
        assert_eq!(parse_called_element("@v1"), None);
    }
}
