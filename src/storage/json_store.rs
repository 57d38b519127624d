use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::errors::PipelineError;
use crate::engine::types::WorkflowState;
use crate::storage::{StateStore, canonical_key};
use crate::storage::locks::KeyedLocks;

/// Location of the state file inside a project workspace.
pub const STATE_FILE: &str = "data/shared/workflow_state.json";

/// File-based JSON state store. Each project keeps its record at
/// `<root>/<project>/data/shared/workflow_state.json`.
pub struct JsonStateStore {
    root: PathBuf,
    locks: KeyedLocks,
}

impl JsonStateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace directory for a project key. `"."` is the root itself.
    pub fn project_dir(&self, project: &str) -> Result<PathBuf, PipelineError> {
        project_dir(&self.root, project)
    }

    pub fn state_path(&self, project: &str) -> Result<PathBuf, PipelineError> {
        Ok(self.project_dir(project)?.join(STATE_FILE))
    }

    async fn read_state(&self, path: &Path) -> Result<Option<WorkflowState>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", path.display()));
            }
        };
        let state: WorkflowState = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Some(state))
    }

    async fn write_state(&self, path: &Path, state: &WorkflowState) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        // Unique temp name so a stale temp file from a killed process never
        // collides with this write.
        let tmp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));

        let data = serde_json::to_string_pretty(state)?;
        let result = async {
            tokio::fs::write(&tmp_path, &data)
                .await
                .with_context(|| format!("Failed to write state file: {}", tmp_path.display()))?;
            tokio::fs::rename(&tmp_path, path)
                .await
                .with_context(|| format!("Failed to replace state file: {}", path.display()))
        }
        .await;

        // A partial write or failed rename must not leave the temp file behind.
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, project: &str) -> Result<WorkflowState> {
        let key = canonical_key(project)?;
        let path = self.state_path(&key)?;
        let _lock = self.locks.lock(&key).await;

        if let Some(state) = self.read_state(&path).await? {
            return Ok(state);
        }

        let state = WorkflowState::default();
        self.write_state(&path, &state).await?;
        info!(project = %project, path = %path.display(), "Created default workflow state");
        Ok(state)
    }

    async fn save(&self, project: &str, state: &mut WorkflowState) -> Result<()> {
        let key = canonical_key(project)?;
        let path = self.state_path(&key)?;
        let _lock = self.locks.lock(&key).await;

        state.updated_at = Utc::now();
        self.write_state(&path, state).await?;
        debug!(project = %project, current = %state.current_agent, "Saved workflow state");
        Ok(())
    }
}

/// Resolve a project key against a workspace root, rejecting absolute keys
/// and any key that climbs out of the root.
pub fn project_dir(root: &Path, project: &str) -> Result<PathBuf, PipelineError> {
    let key = canonical_key(project)?;
    if key == "." {
        Ok(root.to_path_buf())
    } else {
        Ok(root.join(key))
    }
}
