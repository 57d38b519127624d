//! The control loop that walks a project through its stages.
//!
//! For each turn the driver asks the engine whose turn it is, hands the
//! stage to a [`Worker`], and feeds the outcome back: rework requests go to
//! the engine's bounded loops, everything else through the stage's gate.
//! Reaching a loop ceiling never stops the run; the engine has already
//! recorded a blocker and the driver advances past the stage.

pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::pipeline::{PipelineEngine, ReworkOutcome, ReworkRequest};
use crate::engine::stages::{self, StageSpec};
use crate::engine::types::{Score, WorkflowState};
use crate::engine::PipelineError;
use crate::gates::{ArtifactChecker, GateEvaluator};

pub use worker::{CommandWorker, ReworkDirective, StageOutcome, Worker};

/// Upper bound on worker invocations in one run.
pub const DEFAULT_MAX_INVOCATIONS: u32 = 100;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Per-stage time limit for the worker.
    pub stage_timeout: Option<Duration>,
    pub max_invocations: u32,
    /// Ceiling for rework loops that don't name their own.
    pub max_loops: Option<u32>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            stage_timeout: None,
            max_invocations: DEFAULT_MAX_INVOCATIONS,
            max_loops: None,
        }
    }
}

/// Counters for a single run.
#[derive(Debug, Clone)]
pub struct DriverStats {
    /// Distinct stages handed to the worker, in first-invocation order.
    pub stages_invoked: Vec<String>,
    pub invocations: u32,
    pub reworks_granted: u32,
    pub ceilings_reached: u32,
    pub gate_failures: u32,
    started: Instant,
}

impl Default for DriverStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverStats {
    pub fn new() -> Self {
        Self {
            stages_invoked: Vec::new(),
            invocations: 0,
            reworks_granted: 0,
            ceilings_reached: 0,
            gate_failures: 0,
            started: Instant::now(),
        }
    }

    fn record_invocation(&mut self, stage: &str) {
        self.invocations += 1;
        if !self.stages_invoked.iter().any(|s| s == stage) {
            self.stages_invoked.push(stage.to_string());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every stage completed with no blockers.
    Success,
    /// Completed, but blockers were recorded along the way.
    Partial,
    /// The run stopped before completion.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Final account of a driver run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub project_name: String,
    pub status: RunStatus,
    pub current_agent: String,
    pub completed_agents: Vec<String>,
    pub quality_scores: BTreeMap<String, Score>,
    pub blockers: Vec<String>,
    pub stages_invoked: Vec<String>,
    pub invocations: u32,
    pub reworks_granted: u32,
    pub ceilings_reached: u32,
    pub gate_failures: u32,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    fn new(run_id: String, state: WorkflowState, stats: &DriverStats, error: Option<String>) -> Self {
        let status = if error.is_some() || !state.is_complete() {
            RunStatus::Failed
        } else if !state.blockers.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        Self {
            run_id,
            project_name: state.project_name,
            status,
            current_agent: state.current_agent,
            completed_agents: state.completed_agents,
            quality_scores: state.quality_scores,
            blockers: state.blockers,
            stages_invoked: stats.stages_invoked.clone(),
            invocations: stats.invocations,
            reworks_granted: stats.reworks_granted,
            ceilings_reached: stats.ceilings_reached,
            gate_failures: stats.gate_failures,
            duration_seconds: stats.elapsed().as_secs_f64(),
            error,
        }
    }
}

/// Why a single turn did not complete.
enum TurnError {
    /// The worker failed or misbehaved; recorded as a blocker, run stops.
    Worker(anyhow::Error),
    /// Storage failed; the run aborts with an error.
    Engine(PipelineError),
}

impl From<PipelineError> for TurnError {
    fn from(e: PipelineError) -> Self {
        TurnError::Engine(e)
    }
}

pub struct Orchestrator {
    engine: Arc<PipelineEngine>,
    evaluator: Arc<GateEvaluator>,
    worker: Arc<dyn Worker>,
    artifacts: Arc<dyn ArtifactChecker>,
    options: DriverOptions,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<PipelineEngine>,
        evaluator: Arc<GateEvaluator>,
        worker: Arc<dyn Worker>,
        artifacts: Arc<dyn ArtifactChecker>,
    ) -> Self {
        Self {
            engine,
            evaluator,
            worker,
            artifacts,
            options: DriverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Drive `project` until it completes or a turn fails.
    ///
    /// With a `project_name` the project is initialized first; without one
    /// the run resumes from whatever state was last saved.
    pub async fn run(&self, project: &str, project_name: Option<&str>) -> Result<RunReport> {
        self.run_with_id(Uuid::new_v4().to_string(), project, project_name)
            .await
    }

    /// Same as [`run`](Self::run) under a caller-chosen run id.
    pub async fn run_with_id(
        &self,
        run_id: String,
        project: &str,
        project_name: Option<&str>,
    ) -> Result<RunReport> {
        let mut stats = DriverStats::new();

        if let Some(name) = project_name {
            self.engine.initialize(project, name).await?;
        }

        info!(run_id = %run_id, project = %project, worker = %self.worker.name(), "Starting pipeline run");

        let error = loop {
            let state = self.engine.get_state(project).await?;
            let Some(stage) = stages::stage(&state.current_agent) else {
                break None;
            };

            if stats.invocations >= self.options.max_invocations {
                let msg = format!(
                    "Invocation limit ({}) reached at stage {}",
                    self.options.max_invocations, stage.name
                );
                self.engine.add_blocker(project, &msg).await?;
                break Some(msg);
            }

            match self.turn(project, stage, &state, &mut stats).await {
                Ok(()) => {}
                Err(TurnError::Engine(e)) => return Err(e.into()),
                Err(TurnError::Worker(e)) => {
                    let msg = format!("{} failed: {:#}", stage.name, e);
                    error!(run_id = %run_id, project = %project, stage = %stage.name, error = %msg, "Stage failed");
                    self.engine.add_blocker(project, &msg).await?;
                    break Some(msg);
                }
            }
        };

        let state = self.engine.get_state(project).await?;
        let report = RunReport::new(run_id, state, &stats, error);

        info!(
            run_id = %report.run_id,
            project = %project,
            status = %report.status,
            invocations = report.invocations,
            duration_s = report.duration_seconds,
            "Pipeline run finished"
        );
        Ok(report)
    }

    async fn turn(
        &self,
        project: &str,
        stage: &StageSpec,
        state: &WorkflowState,
        stats: &mut DriverStats,
    ) -> Result<(), TurnError> {
        stats.record_invocation(stage.name);
        info!(project = %project, stage = %stage.name, phase = %stage.phase, invocation = stats.invocations, "Invoking worker");

        let outcome = self.invoke(stage, project, state).await.map_err(TurnError::Worker)?;
        let score = Score::from_f64(outcome.score).map_err(|e| TurnError::Worker(e.into()))?;
        let notes = outcome.notes.as_deref();

        for (key, value) in outcome.context.iter() {
            self.engine.set_context(project, key, value.clone()).await?;
        }

        if let Some(ref directive) = outcome.rework {
            let request = ReworkRequest {
                from_stage: stage.name.to_string(),
                target_stage: directive.target_stage.clone(),
                reason: directive.reason.clone(),
                loop_key: directive.loop_key.clone(),
                max_loops: directive.max_loops.or(self.options.max_loops),
            };

            match self.engine.request_rework(project, &request).await {
                Ok(ReworkOutcome::Granted { .. }) => {
                    stats.reworks_granted += 1;
                    return Ok(());
                }
                Ok(ReworkOutcome::CeilingReached { .. }) => {
                    stats.ceilings_reached += 1;
                    self.engine.advance(project, stage.name, score, notes).await?;
                    return Ok(());
                }
                Err(PipelineError::UnknownStage { stage: target }) => {
                    warn!(project = %project, stage = %stage.name, target = %target, "Ignoring rework of unknown stage");
                    self.engine
                        .add_blocker(
                            project,
                            &format!(
                                "{} requested rework of unknown stage '{}'. Reason: {}",
                                stage.name, target, directive.reason
                            ),
                        )
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let report = self
            .evaluator
            .evaluate(stage.name, score, self.artifacts.as_ref());

        if report.passed {
            self.engine.advance(project, stage.name, score, notes).await?;
            return Ok(());
        }

        stats.gate_failures += 1;
        warn!(project = %project, stage = %stage.name, violations = ?report.violations, "Quality gate failed");

        let mut request = ReworkRequest::new(
            stage.name,
            stage.name,
            &report.violations.join("; "),
            &format!("{}_gate_loop", stage.name),
        );
        request.max_loops = self.options.max_loops;

        match self.engine.request_rework(project, &request).await? {
            ReworkOutcome::Granted { .. } => stats.reworks_granted += 1,
            ReworkOutcome::CeilingReached { .. } => {
                stats.ceilings_reached += 1;
                self.engine.advance(project, stage.name, score, notes).await?;
            }
        }
        Ok(())
    }

    async fn invoke(
        &self,
        stage: &StageSpec,
        project: &str,
        state: &WorkflowState,
    ) -> Result<StageOutcome> {
        let fut = self.worker.run(stage, project, state);
        match self.options.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                anyhow!(
                    "Stage '{}' timed out after {:.1}s",
                    stage.name,
                    limit.as_secs_f64()
                )
            })?,
            None => fut.await,
        }
    }
}
