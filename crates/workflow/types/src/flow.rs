//! Sequence flows: directed connections between flow elements
//!
//! A flow out of an exclusive gateway may carry a condition expression, or
//! be marked as the gateway's default flow. All other flows are
//! unconditional.

use serde::{Deserialize, Serialize};

/// A directed connection from one flow element to another
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Condition expression evaluated against the instance data bag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Taken when no conditional sibling flow holds
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

impl SequenceFlow {
    /// Create an unconditional flow
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            is_default: false,
        }
    }

    /// Create a conditional flow
    pub fn conditional(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            condition: Some(condition.into()),
            ..Self::new(id, source, target)
        }
    }

    /// Mark this flow as the default flow of its source gateway
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self.condition = None;
        self
    }

    /// Whether the flow carries a condition
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flow_drops_condition() {
        let flow = SequenceFlow::conditional("f", "g", "t", "x > 1").as_default();
        assert!(flow.is_default);
        assert!(!flow.is_conditional());
    }

    #[test]
    fn test_serialization_omits_defaults() {
        let json = serde_json::to_value(SequenceFlow::new("f", "a", "b")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "f", "source": "a", "target": "b"})
        );
    }
}
