//! CLI command implementations

pub mod instance;
pub mod manifest;
