//! Workflow Domain Types for Procflow
//!
//! Workflows in Procflow are authored as small JSON **manifests** and
//! compiled into **process definitions**: flat graphs of events, call
//! activities, exclusive gateways and sequence flows. A definition is then
//! interpreted as a resumable task graph.
//!
//! # Key Concepts
//!
//! - **Manifest**: the user-authored description of nodes and control flow.
//! - **ProcessDefinition**: the compiled, executable graph (elements + flows).
//! - **SubflowReference**: a catalog-published subprocess a definition calls.
//! - **Instance**: one live run; a flat task table plus a shared data bag.
//! - **Task**: one instantiated element with its own lifecycle state.
//!
//! # Design Principles
//!
//! 1. Definitions are immutable once compiled.
//! 2. The run-time graph is a flat table addressed by integer ids; parent and
//!    child links are indices, so persisted state is acyclic.
//! 3. All nested runs of an instance share one data bag.

#![deny(unsafe_code)]

mod definition;
mod errors;
mod flow;
mod instance;
mod manifest;

pub use definition::*;
pub use errors::*;
pub use flow::*;
pub use instance::*;
pub use manifest::*;

/// Key-value data visible across an instance and all of its nested runs
pub type DataBag = serde_json::Map<String, serde_json::Value>;

/// Shallow-merge `source` into `target`, overwriting existing keys
pub fn merge_data(target: &mut DataBag, source: &DataBag) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}
