use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::engine::errors::PipelineError;
use crate::engine::types::Score;
use crate::gates::registry::{GateRegistry, QualityGate};

/// Answers whether a required artifact is present. Absence is `false`,
/// never an error.
pub trait ArtifactChecker: Send + Sync {
    fn exists(&self, artifact: &str) -> bool;
}

impl<F> ArtifactChecker for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn exists(&self, artifact: &str) -> bool {
        self(artifact)
    }
}

/// Checks artifacts on disk, relative to a project workspace.
pub struct FsArtifactChecker {
    root: PathBuf,
}

impl FsArtifactChecker {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ArtifactChecker for FsArtifactChecker {
    fn exists(&self, artifact: &str) -> bool {
        self.root.join(artifact).exists()
    }
}

/// Result of evaluating one stage's output against its gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub stage: String,
    pub passed: bool,
    pub score: Score,
    pub threshold: Option<Score>,
    pub violations: Vec<String>,
    pub description: String,
    /// `false` when the stage has no gate; such reports always pass.
    pub gate_defined: bool,
}

pub struct GateEvaluator {
    registry: Arc<GateRegistry>,
}

impl GateEvaluator {
    pub fn new(registry: Arc<GateRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &GateRegistry {
        &self.registry
    }

    pub fn requirements(&self, stage: &str) -> Result<&QualityGate, PipelineError> {
        self.registry.requirements(stage)
    }

    /// Judge a submitted score and the stage's artifacts. Every failed check
    /// adds its own violation; the gate passes only with none.
    pub fn evaluate(&self, stage: &str, score: Score, artifacts: &dyn ArtifactChecker) -> GateReport {
        let Some(gate) = self.registry.get(stage) else {
            return GateReport {
                stage: stage.to_string(),
                passed: true,
                score,
                threshold: None,
                violations: Vec::new(),
                description: format!("No quality gate defined for stage: {}", stage),
                gate_defined: false,
            };
        };

        let mut violations = Vec::new();

        if score < gate.min_score {
            violations.push(format!(
                "Score {} below minimum {}",
                score, gate.min_score
            ));
        }

        for artifact in &gate.required_artifacts {
            if !artifacts.exists(artifact) {
                violations.push(format!("Missing required artifact: {}", artifact));
            }
        }

        GateReport {
            stage: stage.to_string(),
            passed: violations.is_empty(),
            score,
            threshold: Some(gate.min_score),
            violations,
            description: gate.description.clone(),
            gate_defined: true,
        }
    }
}
