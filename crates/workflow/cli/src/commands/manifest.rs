//! Manifest commands: validate and compile

use crate::config::CliConfig;
use crate::output::{print_success, print_json};
use anyhow::Context;
use procflow_dsl::{loader, InMemoryCatalog};
use procflow_types::Manifest;

pub fn read_manifest(path: &str) -> anyhow::Result<Manifest> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
    Manifest::from_json(&text).with_context(|| format!("{} is not manifest JSON", path))
}

/// The configured catalog, or an empty one
pub fn load_catalog(config: &CliConfig) -> anyhow::Result<InMemoryCatalog> {
    match &config.catalog.dir {
        Some(dir) => InMemoryCatalog::load_dir(dir)
            .with_context(|| format!("cannot load catalog from {}", dir.display())),
        None => {
            tracing::warn!("No catalog directory configured; call nodes will not resolve");
            Ok(InMemoryCatalog::new())
        }
    }
}

pub fn validate(path: &str) -> anyhow::Result<()> {
    let manifest = read_manifest(path)?;
    procflow_dsl::validate(&manifest).with_context(|| format!("{} is invalid", path))?;
    print_success(&format!(
        "{} is valid ({} nodes)",
        path,
        manifest.nodes().len()
    ));
    Ok(())
}

pub fn compile(path: &str, out: Option<&str>, config: &CliConfig) -> anyhow::Result<()> {
    let manifest = read_manifest(path)?;
    let catalog = load_catalog(config)?;
    let compiled = procflow_dsl::compile(&manifest, &catalog)?;
    tracing::info!(
        process_id = %compiled.definition.process_id,
        elements = compiled.definition.element_count(),
        flows = compiled.definition.flow_count(),
        subflows = compiled.subflow_refs.len(),
        "Manifest compiled"
    );

    match out {
        Some(out) => {
            std::fs::write(out, loader::compiled_to_json(&compiled)?)
                .with_context(|| format!("cannot write {}", out))?;
            print_success(&format!(
                "{} compiled to {}",
                compiled.definition.process_id, out
            ));
            Ok(())
        }
        None => print_json(&compiled),
    }
}
