use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::stages::StageSpec;
use crate::engine::types::{Context, WorkflowState};

/// Request to send the pipeline back to an earlier stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReworkDirective {
    pub target_stage: String,
    pub reason: String,
    pub loop_key: String,
    #[serde(default)]
    pub max_loops: Option<u32>,
}

/// What a worker reports back after performing a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Self-assessed score in `0..=100`. Fractions are allowed and rounded
    /// by the driver; anything outside the range stops the run.
    pub score: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rework: Option<ReworkDirective>,
    /// Facts to publish into the shared context.
    #[serde(default)]
    pub context: Context,
}

impl StageOutcome {
    pub fn scored(score: impl Into<f64>) -> Self {
        Self {
            score: score.into(),
            notes: None,
            rework: None,
            context: Context::new(),
        }
    }
}

/// Performs the work of a stage. The engine only ever sees the outcome.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        stage: &StageSpec,
        project: &str,
        state: &WorkflowState,
    ) -> Result<StageOutcome>;
}

/// Runs an external command for every stage.
///
/// The child receives the stage in `PIPEWRIGHT_STAGE` / `PIPEWRIGHT_PHASE`,
/// the project key in `PIPEWRIGHT_PROJECT`, and the current state as JSON on
/// stdin. It must print a [`StageOutcome`] as JSON on stdout; when it logs
/// other lines too, the last line that parses wins.
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(
        &self,
        stage: &StageSpec,
        project: &str,
        state: &WorkflowState,
    ) -> Result<StageOutcome> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("PIPEWRIGHT_STAGE", stage.name)
            .env("PIPEWRIGHT_PHASE", stage.phase.to_string())
            .env("PIPEWRIGHT_PROJECT", project)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out stage drops this future; take the child with it.
            .kill_on_drop(true);

        if let Some(ref dir) = self.cwd {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", self.program))?;

        // Feed stdin concurrently so a child that writes before reading
        // cannot deadlock against us.
        let input = serde_json::to_vec(state)?;
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // A child that never reads its input closes the pipe early.
                let _ = stdin.write_all(&input).await;
            })
        });

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for worker '{}'", self.program))?;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            bail!(
                "Worker '{}' exited with code {} for stage '{}': {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stage.name,
                stderr.trim()
            );
        }

        debug!(stage = %stage.name, stdout = %stdout.trim(), "Worker finished");
        parse_outcome(&stdout)
            .with_context(|| format!("Worker '{}' returned no valid outcome for stage '{}'", self.program, stage.name))
    }
}

fn parse_outcome(stdout: &str) -> Result<StageOutcome> {
    if let Ok(outcome) = serde_json::from_str::<StageOutcome>(stdout.trim()) {
        return Ok(outcome);
    }

    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<StageOutcome>(line).ok())
        .ok_or_else(|| anyhow::anyhow!("Expected a JSON stage outcome on stdout"))
}
