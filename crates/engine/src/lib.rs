//! External code-model engine interface.
//!
//! The engine is a black-box collaborator: it builds in-memory project models
//! from on-disk descriptors and answers semantic queries against them. This
//! crate defines the trait the rest of the workspace talks through, plus a
//! stub implementation used by tests and stub deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod stub;

pub use error::{EngineError, Result};
pub use stub::StubEngine;

/// Opaque token for a loaded project model. Only the issuing engine can
/// interpret it; the workspace layer treats it as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineProject(pub u64);

/// A single text replacement, byte-offset addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEdit {
    pub start: usize,
    pub end: usize,
    pub new_text: String,
}

#[async_trait]
pub trait CodeModelEngine: Send + Sync {
    /// Build a project model from the descriptor at `root`. Expensive.
    async fn load_project(&self, root: &Path) -> Result<EngineProject>;

    /// Tear down a project model. Idempotent for unknown tokens.
    async fn unload(&self, project: EngineProject) -> Result<()>;

    /// Current engine-side text of one document.
    async fn get_document(&self, project: EngineProject, path: &Path) -> Result<String>;

    /// Replace the engine-side text of one document with `text`, tagging it
    /// with the caller's `version` token.
    async fn set_document_text(
        &self,
        project: EngineProject,
        path: &Path,
        text: &str,
        version: u64,
    ) -> Result<()>;

    /// Apply an edit to a document and return the resulting text.
    async fn apply_edit(
        &self,
        project: EngineProject,
        path: &Path,
        edit: &TextEdit,
    ) -> Result<String>;

    /// Run a semantic query against the project model.
    async fn query(
        &self,
        project: EngineProject,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}
