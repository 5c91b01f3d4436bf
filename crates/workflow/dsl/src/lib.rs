//! Manifest Validation and Process Compilation for Procflow
//!
//! Workflows are authored as JSON manifests and compiled into executable
//! process definitions:
//!
//! ```json
//! {
//!   "start": "verify",
//!   "workflow_name": "admission",
//!   "nodes": [
//!     {"id": "verify", "type": "call", "subflow_key": "docs.verification",
//!      "subflow_version": 2, "next": "decide"},
//!     {"id": "decide", "type": "gateway", "branches": [
//!       {"when": "docs_ok == true", "to": "offer"},
//!       {"else": true, "to": "rejected"}
//!     ]},
//!     {"id": "offer", "type": "call", "subflow_key": "communication.send_offer",
//!      "subflow_version": 1},
//!     {"id": "rejected", "type": "end"}
//!   ]
//! }
//! ```
//!
//! Subflows are resolved through a [`SubflowCatalog`]; only published
//! entries resolve.

#![deny(unsafe_code)]

pub mod catalog;
pub mod compiler;
pub mod errors;
pub mod loader;
pub mod validator;

pub use catalog::{resolve_subprocesses, CatalogEntry, CatalogRecord, InMemoryCatalog, SubflowCatalog};
pub use compiler::{compile, compile_json};
pub use errors::{DslError, DslResult, ValidationError};
pub use validator::validate;
