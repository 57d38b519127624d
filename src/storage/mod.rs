pub mod json_store;
pub mod locks;
pub mod memory_store;

use std::path::{Component, Path};

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::errors::PipelineError;
use crate::engine::types::WorkflowState;

/// Trait for workflow state persistence, one record per project key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the record for a project, creating and persisting a default
    /// record if none exists yet.
    async fn load(&self, project: &str) -> Result<WorkflowState>;

    /// Stamp `updated_at` and persist the full record atomically.
    async fn save(&self, project: &str, state: &mut WorkflowState) -> Result<()>;
}

/// Canonical spelling of a project key: its relative path components joined
/// by `/`, or `"."` for the workspace root. `"p"`, `"./p"` and `"p/."` are
/// all `"p"`, so every lock and file lookup agrees on one name per project.
///
/// Empty keys, absolute keys and keys containing `..` are rejected.
pub fn canonical_key(project: &str) -> Result<String, PipelineError> {
    let invalid = || PipelineError::InvalidProjectKey {
        key: project.to_string(),
    };

    if project.is_empty() {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for component in Path::new(project).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }

    if parts.is_empty() {
        Ok(".".to_string())
    } else {
        Ok(parts.join("/"))
    }
}
