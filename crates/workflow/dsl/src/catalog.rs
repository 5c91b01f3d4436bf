//! Subflow catalog: published, versioned subprocess definitions
//!
//! The compiler consults a catalog to check that every called subflow
//! exists, and callers use it to pre-fetch the subprocess definitions an
//! instance needs before it is created. Only published entries resolve.

use crate::errors::{DslError, DslResult};
use procflow_types::{
    called_element, parse_called_element, LookupError, ProcessDefinition, SubflowReference,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

/// What a successful catalog lookup reports
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Process id of the published definition
    pub process_id: String,
    /// Content checksum, `"blake3:<hex>"`
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Lookup of subflows by key and version
pub trait SubflowCatalog {
    /// Resolve a published subflow
    fn lookup(&self, key: &str, version: u32) -> Result<CatalogEntry, LookupError>;

    /// Fetch the definition of a published subflow
    fn definition(&self, key: &str, version: u32) -> Result<ProcessDefinition, LookupError>;
}

/// Checksum of a definition's canonical JSON encoding
pub fn checksum(definition: &ProcessDefinition) -> DslResult<String> {
    let bytes = serde_json::to_vec(definition)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"procflow-definition-v1:");
    hasher.update(&bytes);
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

// ── In-Memory Catalog ────────────────────────────────────────────────

/// One stored catalog entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub definition: ProcessDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_published")]
    pub published: bool,
}

fn default_published() -> bool {
    true
}

/// A catalog held in memory, optionally loaded from a directory
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    entries: HashMap<(String, u32), (CatalogRecord, String)>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store and publish a definition under `key`/`version`
    pub fn publish(
        &mut self,
        key: impl Into<String>,
        version: u32,
        definition: ProcessDefinition,
        description: Option<String>,
    ) -> DslResult<CatalogEntry> {
        self.insert(
            key.into(),
            version,
            CatalogRecord {
                definition,
                description,
                published: true,
            },
        )
    }

    /// Store a definition without publishing it; lookups will not see it
    pub fn stage(
        &mut self,
        key: impl Into<String>,
        version: u32,
        definition: ProcessDefinition,
    ) -> DslResult<()> {
        self.insert(
            key.into(),
            version,
            CatalogRecord {
                definition,
                description: None,
                published: false,
            },
        )
        .map(|_| ())
    }

    fn insert(&mut self, key: String, version: u32, record: CatalogRecord) -> DslResult<CatalogEntry> {
        record.definition.validate()?;
        let sum = checksum(&record.definition)?;
        let entry = CatalogEntry {
            process_id: record.definition.process_id.clone(),
            checksum: sum.clone(),
            description: record.description.clone(),
        };
        tracing::debug!(
            subflow = %called_element(&key, version),
            published = record.published,
            "Catalog entry stored"
        );
        self.entries.insert((key, version), (record, sum));
        Ok(entry)
    }

    /// Load every `<key>@v<version>.json` file in `dir`
    ///
    /// Each file holds a [`CatalogRecord`]; `published` defaults to true.
    pub fn load_dir(dir: impl AsRef<Path>) -> DslResult<Self> {
        let mut catalog = Self::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let (key, version) = parse_called_element(stem)
                .ok_or_else(|| LookupError::MalformedCalledElement(stem.to_string()))?;
            let text = std::fs::read_to_string(&path)?;
            let record: CatalogRecord = serde_json::from_str(&text).map_err(|e| {
                DslError::Parse(format!("{}: {}", path.display(), e))
            })?;
            catalog.insert(key.to_string(), version, record)?;
        }
        tracing::info!(entries = catalog.len(), "Catalog loaded");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn published(&self, key: &str, version: u32) -> Result<&(CatalogRecord, String), LookupError> {
        self.entries
            .get(&(key.to_string(), version))
            .filter(|(record, _)| record.published)
            .ok_or_else(|| LookupError::NotFound {
                key: key.to_string(),
                version,
            })
    }
}

impl SubflowCatalog for InMemoryCatalog {
    fn lookup(&self, key: &str, version: u32) -> Result<CatalogEntry, LookupError> {
        let (record, sum) = self.published(key, version)?;
        Ok(CatalogEntry {
            process_id: record.definition.process_id.clone(),
            checksum: sum.clone(),
            description: record.description.clone(),
        })
    }

    fn definition(&self, key: &str, version: u32) -> Result<ProcessDefinition, LookupError> {
        self.published(key, version)
            .map(|(record, _)| record.definition.clone())
    }
}

// ── Subprocess Resolution ────────────────────────────────────────────

/// Fetch every subprocess definition reachable from `refs`
///
/// Call activities inside fetched subprocesses are followed too, so the
/// result is closed: every called element of every returned definition
/// has an entry. Keys are called elements (`"<key>@v<version>"`).
pub fn resolve_subprocesses(
    refs: &[SubflowReference],
    catalog: &dyn SubflowCatalog,
) -> Result<BTreeMap<String, ProcessDefinition>, LookupError> {
    let mut resolved = BTreeMap::new();
    let mut pending: VecDeque<(String, u32)> = refs
        .iter()
        .map(|r| (r.subflow_key.clone(), r.version))
        .collect();

    while let Some((key, version)) = pending.pop_front() {
        let called = called_element(&key, version);
        if resolved.contains_key(&called) {
            continue;
        }
        let definition = catalog.definition(&key, version)?;
        for call in definition.call_activities() {
            if let Some(nested) = call.called_element() {
                let (k, v) = parse_called_element(nested)
                    .ok_or_else(|| LookupError::MalformedCalledElement(nested.to_string()))?;
                pending.push_back((k.to_string(), v));
            }
        }
        resolved.insert(called, definition);
    }

    Ok(resolved)
}
