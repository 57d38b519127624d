use thiserror::Error;

/// Errors surfaced by the pipeline engine and gate registry.
///
/// A refused rework request is not represented here: hitting the loop
/// ceiling is a normal outcome, see [`crate::engine::pipeline::ReworkOutcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown stage '{stage}'")]
    UnknownStage { stage: String },

    #[error("Invalid score {score}: must be between 0 and 100")]
    InvalidScore { score: f64 },

    #[error("Invalid project key '{key}': must be a relative path without '..'")]
    InvalidProjectKey { key: String },

    #[error("State storage unavailable for project '{project}': {source}")]
    StorageUnavailable {
        project: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Wrap a store failure. Typed errors raised by the store itself
    /// (e.g. a rejected project key) are passed through unchanged.
    pub(crate) fn storage(project: &str, source: anyhow::Error) -> Self {
        match source.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(source) => PipelineError::StorageUnavailable {
                project: project.to_string(),
                source,
            },
        }
    }

    pub fn is_unknown_stage(&self) -> bool {
        matches!(self, PipelineError::UnknownStage { .. })
    }
}
