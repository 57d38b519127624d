use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::engine::errors::PipelineError;
use crate::engine::stages;
use crate::engine::types::{Score, WorkflowState};

/// Minimum score plus required artifacts for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGate {
    pub min_score: Score,
    /// Paths or path prefixes, relative to the project workspace.
    pub required_artifacts: Vec<String>,
    pub description: String,
}

impl QualityGate {
    fn new(min_score: u8, required_artifacts: &[&str], description: &str) -> Self {
        Self {
            min_score: Score::saturating(min_score),
            required_artifacts: required_artifacts.iter().map(|a| a.to_string()).collect(),
            description: description.to_string(),
        }
    }
}

/// Partial replacement for a built-in gate, read from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GateOverride {
    pub min_score: Option<i64>,
    pub required_artifacts: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pending => write!(f, "pending"),
            GateStatus::Passed => write!(f, "passed"),
            GateStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the pipeline summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateSummary {
    pub stage: String,
    pub status: GateStatus,
    pub score: Option<Score>,
    pub threshold: Score,
}

/// Static policy table: stage name → quality gate, in pipeline order.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct GateRegistry {
    gates: Vec<(String, QualityGate)>,
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GateRegistry {
    /// The built-in gate for every pipeline stage.
    pub fn builtin() -> Self {
        let gates = vec![
            (
                "project-planner",
                QualityGate::new(
                    85,
                    &["tasks/active/project_plan.md"],
                    "Project plan with atomic tasks, dependencies, and effort estimates",
                ),
            ),
            (
                "code-architect",
                QualityGate::new(
                    85,
                    &["docs/architecture/"],
                    "Architecture decision records, tech stack selection, system design",
                ),
            ),
            (
                "implementation-agent",
                QualityGate::new(
                    80,
                    &["src/"],
                    "Working code that follows architecture decisions and coding standards",
                ),
            ),
            (
                "code-reviewer",
                QualityGate::new(
                    85,
                    &["data/reviews/"],
                    "Code review with actionable findings, security check, and quality score",
                ),
            ),
            (
                "testing-agent",
                QualityGate::new(
                    80,
                    &["tests/"],
                    "Test suite with unit, integration, and edge case coverage of at least 80%",
                ),
            ),
            (
                "documentation-agent",
                QualityGate::new(
                    80,
                    &["docs/"],
                    "README, API docs, inline docs written in simple language",
                ),
            ),
            (
                "git-agent",
                QualityGate::new(
                    90,
                    &[],
                    "Clean git history with conventional commits and proper branching",
                ),
            ),
            (
                "cleanup-agent",
                QualityGate::new(
                    85,
                    &[],
                    "No dead code, temp files cleaned, consistent formatting",
                ),
            ),
            (
                "retrospective-agent",
                QualityGate::new(
                    75,
                    &["data/knowledge_base/lessons_learned.md"],
                    "Lessons learned, patterns documented, knowledge base updated",
                ),
            ),
        ];

        Self {
            gates: gates
                .into_iter()
                .map(|(stage, gate)| (stage.to_string(), gate))
                .collect(),
        }
    }

    /// Built-in gates with configuration overrides applied.
    ///
    /// Overrides naming a stage outside the pipeline, or carrying an
    /// out-of-range score, are rejected.
    pub fn with_overrides(overrides: &BTreeMap<String, GateOverride>) -> Result<Self> {
        let mut registry = Self::builtin();

        for (stage, ov) in overrides {
            if !stages::is_known(stage) {
                bail!("Gate override for unknown stage '{}'", stage);
            }
            let Some((_, gate)) = registry.gates.iter_mut().find(|(s, _)| s == stage) else {
                bail!("No built-in gate for stage '{}'", stage);
            };

            if let Some(min) = ov.min_score {
                gate.min_score = Score::new(min)
                    .map_err(|e| anyhow::anyhow!("Gate override for '{}': {}", stage, e))?;
            }
            if let Some(ref artifacts) = ov.required_artifacts {
                gate.required_artifacts = artifacts.clone();
            }
            if let Some(ref description) = ov.description {
                gate.description = description.clone();
            }
        }

        Ok(registry)
    }

    pub fn get(&self, stage: &str) -> Option<&QualityGate> {
        self.gates
            .iter()
            .find(|(s, _)| s == stage)
            .map(|(_, gate)| gate)
    }

    /// Policy for a stage, without evaluating anything.
    pub fn requirements(&self, stage: &str) -> Result<&QualityGate, PipelineError> {
        self.get(stage).ok_or_else(|| PipelineError::UnknownStage {
            stage: stage.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QualityGate)> {
        self.gates.iter().map(|(s, gate)| (s.as_str(), gate))
    }

    pub fn stages(&self) -> Vec<&str> {
        self.gates.iter().map(|(s, _)| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Gate status for every stage based on the recorded scores.
    pub fn summary(&self, state: &WorkflowState) -> Vec<GateSummary> {
        self.iter()
            .map(|(stage, gate)| {
                let score = state.score_for(stage);
                let status = match score {
                    None => GateStatus::Pending,
                    Some(s) if s >= gate.min_score => GateStatus::Passed,
                    Some(_) => GateStatus::Failed,
                };
                GateSummary {
                    stage: stage.to_string(),
                    status,
                    score,
                    threshold: gate.min_score,
                }
            })
            .collect()
    }
}
