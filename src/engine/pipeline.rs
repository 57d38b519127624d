use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::errors::PipelineError;
use crate::engine::stages::{self, StageSpec};
use crate::engine::types::{Score, WorkflowState};
use crate::storage::{StateStore, canonical_key};
use crate::storage::locks::KeyedLocks;

/// Rework ceiling used when a request does not name one.
pub const DEFAULT_MAX_LOOPS: u32 = 3;

/// A downstream stage asking for an earlier stage to be redone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReworkRequest {
    pub from_stage: String,
    pub target_stage: String,
    pub reason: String,
    /// Caller-chosen counter key, e.g. `review_loop`.
    pub loop_key: String,
    #[serde(default)]
    pub max_loops: Option<u32>,
}

impl ReworkRequest {
    pub fn new(from_stage: &str, target_stage: &str, reason: &str, loop_key: &str) -> Self {
        Self {
            from_stage: from_stage.to_string(),
            target_stage: target_stage.to_string(),
            reason: reason.to_string(),
            loop_key: loop_key.to_string(),
            max_loops: None,
        }
    }

    pub fn with_max_loops(mut self, max_loops: u32) -> Self {
        self.max_loops = Some(max_loops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReworkOutcome {
    /// The pipeline moved back to the target stage.
    Granted {
        target_stage: String,
        loop_count: u32,
        max_loops: u32,
    },
    /// The loop is exhausted: the cursor did not move and a blocker was
    /// recorded. The caller should proceed without further rework.
    CeilingReached {
        loop_key: String,
        loop_count: u32,
        max_loops: u32,
        blocker: String,
    },
}

impl ReworkOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ReworkOutcome::Granted { .. })
    }
}

/// The authoritative state machine over [`WorkflowState`].
///
/// Project keys are canonicalized first (see [`canonical_key`]), so every
/// spelling of a key shares one lock and one stored record.
/// Each mutation runs under a per-project lock: load, compute the complete
/// next record in memory, then a single save. A failure anywhere before the
/// save leaves the stored record as it was.
pub struct PipelineEngine {
    store: Arc<dyn StateStore>,
    locks: KeyedLocks,
    default_max_loops: u32,
}

impl PipelineEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            default_max_loops: DEFAULT_MAX_LOOPS,
        }
    }

    pub fn with_default_max_loops(mut self, max_loops: u32) -> Self {
        self.default_max_loops = max_loops;
        self
    }

    pub fn default_max_loops(&self) -> u32 {
        self.default_max_loops
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn mutate<T, F>(&self, project: &str, f: F) -> Result<(T, WorkflowState), PipelineError>
    where
        F: FnOnce(&mut WorkflowState) -> T + Send,
        T: Send,
    {
        let key = canonical_key(project)?;
        let _guard = self.locks.lock(&key).await;

        let mut next = self
            .store
            .load(&key)
            .await
            .map_err(|e| PipelineError::storage(&key, e))?;
        let out = f(&mut next);
        self.store
            .save(&key, &mut next)
            .await
            .map_err(|e| PipelineError::storage(&key, e))?;

        Ok((out, next))
    }

    /// Hard reset to the baseline: first stage, every collection empty.
    pub async fn initialize(
        &self,
        project: &str,
        project_name: &str,
    ) -> Result<WorkflowState, PipelineError> {
        let key = canonical_key(project)?;
        let _guard = self.locks.lock(&key).await;

        let mut state = WorkflowState::new(project_name);
        self.store
            .save(&key, &mut state)
            .await
            .map_err(|e| PipelineError::storage(&key, e))?;

        info!(project = %project, name = %project_name, first = %state.current_agent, "Project initialized");
        Ok(state)
    }

    /// Record a stage's score and move to the following stage.
    ///
    /// The score is stored whether or not it clears the stage's gate; gate
    /// enforcement belongs to the caller. Advancing the last stage, or a name
    /// outside the pipeline, completes the run. Returns the new current stage.
    pub async fn advance(
        &self,
        project: &str,
        stage: &str,
        score: Score,
        notes: Option<&str>,
    ) -> Result<String, PipelineError> {
        if !stages::is_known(stage) {
            warn!(project = %project, stage = %stage, "Advancing from a stage outside the pipeline; completing run");
        }

        let (next, _) = self
            .mutate(project, |state| {
                state.quality_scores.insert(stage.to_string(), score);
                state.mark_completed(stage);

                if let Some(notes) = notes.filter(|n| !n.is_empty()) {
                    state.shared_context.insert(
                        format!("{}_notes", stage),
                        serde_json::Value::String(notes.to_string()),
                    );
                }

                match stages::next_stage(stage) {
                    Some(next) => state.set_current(next.name),
                    None => state.mark_complete(),
                }
                state.current_agent.clone()
            })
            .await?;

        info!(project = %project, stage = %stage, score = %score, next = %next, "Stage advanced");
        Ok(next)
    }

    /// Send the pipeline back to an earlier stage, bounded per loop key.
    ///
    /// The loop counter is incremented before it is compared, and the
    /// comparison is strict: the call that brings the count to `max_loops`
    /// is still granted, the next one is refused.
    pub async fn request_rework(
        &self,
        project: &str,
        request: &ReworkRequest,
    ) -> Result<ReworkOutcome, PipelineError> {
        if !stages::is_known(&request.target_stage) {
            return Err(PipelineError::UnknownStage {
                stage: request.target_stage.clone(),
            });
        }

        let max_loops = request.max_loops.unwrap_or(self.default_max_loops);

        let (outcome, _) = self
            .mutate(project, |state| {
                let count = state.loop_count(&request.loop_key) + 1;
                state.loop_counts.insert(request.loop_key.clone(), count);

                if count > max_loops {
                    let blocker = format!(
                        "{} hit max loops ({}). Forcing advance from {}. Reason: {}",
                        request.loop_key, max_loops, request.from_stage, request.reason
                    );
                    state.blockers.push(blocker.clone());
                    return ReworkOutcome::CeilingReached {
                        loop_key: request.loop_key.clone(),
                        loop_count: count,
                        max_loops,
                        blocker,
                    };
                }

                state.set_current(&request.target_stage);
                state.shared_context.insert(
                    format!("{}_feedback", request.loop_key),
                    serde_json::Value::String(request.reason.clone()),
                );
                state
                    .completed_agents
                    .retain(|s| s != &request.target_stage);

                ReworkOutcome::Granted {
                    target_stage: request.target_stage.clone(),
                    loop_count: count,
                    max_loops,
                }
            })
            .await?;

        match &outcome {
            ReworkOutcome::Granted { loop_count, .. } => info!(
                project = %project,
                from = %request.from_stage,
                target = %request.target_stage,
                loop_key = %request.loop_key,
                loop_count,
                max_loops,
                "Rework granted"
            ),
            ReworkOutcome::CeilingReached { loop_count, .. } => warn!(
                project = %project,
                from = %request.from_stage,
                loop_key = %request.loop_key,
                loop_count,
                max_loops,
                "Rework loop ceiling reached"
            ),
        }

        Ok(outcome)
    }

    /// Last-write-wins upsert into the shared context.
    pub async fn set_context(
        &self,
        project: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), PipelineError> {
        self.mutate(project, |state| {
            state.shared_context.insert(key.to_string(), value);
        })
        .await?;

        info!(project = %project, key = %key, "Context set");
        Ok(())
    }

    /// Append a blocker. Blockers are never removed by the engine.
    pub async fn add_blocker(&self, project: &str, text: &str) -> Result<(), PipelineError> {
        self.mutate(project, |state| {
            state.blockers.push(text.to_string());
        })
        .await?;

        warn!(project = %project, blocker = %text, "Blocker added");
        Ok(())
    }

    /// Snapshot of the stored record, created with defaults on first read.
    pub async fn get_state(&self, project: &str) -> Result<WorkflowState, PipelineError> {
        let key = canonical_key(project)?;
        let _guard = self.locks.lock(&key).await;
        self.store
            .load(&key)
            .await
            .map_err(|e| PipelineError::storage(&key, e))
    }

    /// The stage whose turn it is, or `None` once the run is complete.
    pub async fn current_stage(
        &self,
        project: &str,
    ) -> Result<Option<&'static StageSpec>, PipelineError> {
        let state = self.get_state(project).await?;
        Ok(stages::stage(&state.current_agent))
    }
}
