use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::engine::types::WorkflowState;
use crate::storage::StateStore;

/// In-memory state store. Records live only as long as the store instance.
pub struct MemoryStateStore {
    projects: Mutex<HashMap<String, WorkflowState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Number of projects that have a record.
    pub fn len(&self) -> usize {
        self.projects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, project: &str) -> Result<WorkflowState> {
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .entry(project.to_string())
            .or_default()
            .clone())
    }

    async fn save(&self, project: &str, state: &mut WorkflowState) -> Result<()> {
        state.updated_at = Utc::now();
        self.projects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project.to_string(), state.clone());
        Ok(())
    }
}
