//! Engine configuration

use serde::{Deserialize, Serialize};

/// Upper bound on tasks processed by one `advance` call
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// How an exclusive gateway activates its outgoing flows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayActivation {
    /// Evaluate conditions and activate exactly one flow
    #[default]
    Evaluate,
    /// Activate every outgoing flow and let reconciliation prune the extras
    Eager,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gateway_activation: GatewayActivation,
    /// Loops closed through gateway branches are only bounded by this
    pub max_steps: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            gateway_activation: GatewayActivation::default(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_gateway_activation(mut self, activation: GatewayActivation) -> Self {
        self.gateway_activation = activation;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
