use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::errors::PipelineError;
use crate::engine::stages;

/// Shared context visible to every stage, a JSON-compatible key-value store.
pub type Context = BTreeMap<String, serde_json::Value>;

/// Sentinel value of `current_agent` once the last stage has advanced.
pub const COMPLETE: &str = "complete";

/// Phase label attached to each stage, plus the terminal `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Architecture,
    Implementation,
    Review,
    Testing,
    Documentation,
    Git,
    Cleanup,
    Retrospective,
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Architecture => write!(f, "architecture"),
            Phase::Implementation => write!(f, "implementation"),
            Phase::Review => write!(f, "review"),
            Phase::Testing => write!(f, "testing"),
            Phase::Documentation => write!(f, "documentation"),
            Phase::Git => write!(f, "git"),
            Phase::Cleanup => write!(f, "cleanup"),
            Phase::Retrospective => write!(f, "retrospective"),
            Phase::Complete => write!(f, "complete"),
        }
    }
}

/// A quality score in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MAX: u8 = 100;

    pub fn new(value: i64) -> Result<Self, PipelineError> {
        if (0..=i64::from(Self::MAX)).contains(&value) {
            Ok(Score(value as u8))
        } else {
            Err(PipelineError::InvalidScore {
                score: value as f64,
            })
        }
    }

    /// Accept a fractional score, rounded to the nearest integer. The range
    /// check applies to the value as given, so `100.4` is rejected.
    pub fn from_f64(value: f64) -> Result<Self, PipelineError> {
        if value.is_finite() && (0.0..=f64::from(Self::MAX)).contains(&value) {
            Ok(Score(value.round() as u8))
        } else {
            Err(PipelineError::InvalidScore { score: value })
        }
    }

    /// Clamp to the valid range instead of failing.
    pub const fn saturating(value: u8) -> Self {
        if value > Self::MAX {
            Score(Self::MAX)
        } else {
            Score(value)
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = PipelineError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> u8 {
        score.0
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted record for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub project_name: String,
    pub current_agent: String,
    pub current_phase: Phase,
    /// Insertion-ordered, no duplicates.
    pub completed_agents: Vec<String>,
    pub quality_scores: BTreeMap<String, Score>,
    pub loop_counts: BTreeMap<String, u32>,
    pub blockers: Vec<String>,
    pub shared_context: Context,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        let first = stages::first_stage();
        let now = Utc::now();
        Self {
            project_name: String::new(),
            current_agent: first.name.to_string(),
            current_phase: first.phase,
            completed_agents: Vec::new(),
            quality_scores: BTreeMap::new(),
            loop_counts: BTreeMap::new(),
            blockers: Vec::new(),
            shared_context: Context::new(),
            started_at: now,
            updated_at: now,
        }
    }
}

impl WorkflowState {
    /// Fresh baseline for a newly initialized project.
    pub fn new(project_name: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_agent == COMPLETE
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_agents.iter().any(|s| s == stage)
    }

    pub fn score_for(&self, stage: &str) -> Option<Score> {
        self.quality_scores.get(stage).copied()
    }

    pub fn loop_count(&self, loop_key: &str) -> u32 {
        self.loop_counts.get(loop_key).copied().unwrap_or(0)
    }

    /// Move the cursor to `stage`, keeping the phase in step with it.
    pub(crate) fn set_current(&mut self, stage: &str) {
        match stages::stage(stage) {
            Some(spec) => {
                self.current_agent = spec.name.to_string();
                self.current_phase = spec.phase;
            }
            None => self.mark_complete(),
        }
    }

    pub(crate) fn mark_complete(&mut self) {
        self.current_agent = COMPLETE.to_string();
        self.current_phase = Phase::Complete;
    }

    pub(crate) fn mark_completed(&mut self, stage: &str) {
        if !self.is_completed(stage) {
            self.completed_agents.push(stage.to_string());
        }
    }
}
