//! Loader: JSON encoding of process definitions
//!
//! Definitions read back from JSON are checked for referential closure
//! before they are handed to the engine.

use crate::errors::DslResult;
use procflow_types::{CompiledProcess, DefinitionSet, ProcessDefinition};
use std::collections::BTreeMap;

/// Encode a definition as pretty-printed JSON
pub fn to_json(definition: &ProcessDefinition) -> DslResult<String> {
    Ok(serde_json::to_string_pretty(definition)?)
}

/// Decode and validate a definition
pub fn from_json(input: &str) -> DslResult<ProcessDefinition> {
    let definition: ProcessDefinition = serde_json::from_str(input)?;
    definition.validate()?;
    Ok(definition)
}

/// Encode compiler output (definition plus subflow references)
pub fn compiled_to_json(compiled: &CompiledProcess) -> DslResult<String> {
    Ok(serde_json::to_string_pretty(compiled)?)
}

/// Decode compiler output, validating the definition
pub fn compiled_from_json(input: &str) -> DslResult<CompiledProcess> {
    let compiled: CompiledProcess = serde_json::from_str(input)?;
    compiled.definition.validate()?;
    Ok(compiled)
}

/// Assemble the definitions an instance runs, checking every call activity
/// resolves to one of `subprocesses`
pub fn definition_set(
    root: ProcessDefinition,
    subprocesses: BTreeMap<String, ProcessDefinition>,
) -> DslResult<DefinitionSet> {
    let set = DefinitionSet { root, subprocesses };
    set.validate()?;
    Ok(set)
}
