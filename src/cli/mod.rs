pub mod config;

pub use config::PipewrightConfig;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::api::{AppState, WorkerFactory};
use crate::driver::{CommandWorker, DriverOptions, Orchestrator, Worker};
use crate::engine::pipeline::{PipelineEngine, ReworkOutcome, ReworkRequest};
use crate::engine::stages;
use crate::engine::types::Score;
use crate::gates::{FsArtifactChecker, GateEvaluator, GateRegistry};
use crate::storage::json_store::JsonStateStore;

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Quality-gated stage pipeline orchestrator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a pipewright.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory holding project workspaces
    #[arg(long, global = true, env = "PIPEWRIGHT_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Project key, relative to the workspace ("." is the workspace itself)
    #[arg(long, global = true, default_value = ".", env = "PIPEWRIGHT_PROJECT")]
    project: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reset the project to the first stage
    Init {
        /// Human-readable project name
        name: String,
    },

    /// Print the full workflow state as JSON
    State,

    /// Record a stage's score and move to the next stage
    Advance {
        stage: String,

        #[arg(allow_hyphen_values = true)]
        score: i64,

        /// Notes stored under `<stage>_notes` in the shared context
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Send the pipeline back to an earlier stage
    Rework {
        /// Stage requesting the rework
        from: String,

        /// Stage that needs to redo its work
        target: String,

        /// Why the rework is needed
        reason: String,

        /// Loop tracking key (e.g. review_loop, test_loop)
        #[arg(long, default_value = "rework_loop")]
        loop_key: String,

        /// Maximum rework loops for this key
        #[arg(long)]
        max_loops: Option<u32>,
    },

    /// Store a shared context value (parsed as JSON, otherwise kept as a string)
    Context { key: String, value: String },

    /// Record a blocker
    Blocker { text: String },

    /// Inspect and evaluate quality gates
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },

    /// Gate status for every stage
    Summary,

    /// List pipeline stages in order
    Stages,

    /// Drive the project through its stages with an external worker command
    Run {
        /// Initialize the project with this name first (otherwise resume)
        #[arg(long)]
        name: Option<String>,

        /// Command invoked once per stage
        #[arg(long, env = "PIPEWRIGHT_WORKER_CMD")]
        worker_cmd: Option<String>,

        /// Argument passed to the worker command (repeatable)
        #[arg(long = "worker-arg")]
        worker_args: Vec<String>,

        /// Per-stage time limit in seconds
        #[arg(long)]
        stage_timeout: Option<f64>,

        /// Stop after this many worker invocations
        #[arg(long)]
        max_invocations: Option<u32>,
    },

    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
pub enum GateCommands {
    /// Evaluate a score against a stage's gate
    Check {
        stage: String,
        #[arg(allow_hyphen_values = true)]
        score: i64,
    },
    /// Show a stage's gate requirements
    Requirements { stage: String },
    /// List every gate
    List,
}

/// Everything a command needs, built once from config and flags.
struct Runtime {
    config: PipewrightConfig,
    project: String,
    store: Arc<JsonStateStore>,
    engine: Arc<PipelineEngine>,
    registry: Arc<GateRegistry>,
}

impl Runtime {
    fn build(cli: &Cli) -> Result<Self> {
        let config = PipewrightConfig::load(cli.config.as_deref())?;
        let workspace = cli
            .workspace
            .clone()
            .or_else(|| config.workspace.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let registry = Arc::new(config.gate_registry()?);
        let store = Arc::new(JsonStateStore::new(&workspace));
        let mut engine = PipelineEngine::new(store.clone());
        if let Some(max_loops) = config.max_loops {
            engine = engine.with_default_max_loops(max_loops);
        }

        Ok(Self {
            config,
            project: cli.project.clone(),
            store,
            engine: Arc::new(engine),
            registry,
        })
    }

    fn artifacts(&self) -> Result<FsArtifactChecker> {
        Ok(FsArtifactChecker::new(self.store.project_dir(&self.project)?))
    }

    /// Driver limits: flags first, then config, then defaults.
    fn driver_options(&self, stage_timeout: Option<f64>, max_invocations: Option<u32>) -> DriverOptions {
        DriverOptions {
            stage_timeout: stage_timeout
                .filter(|s| s.is_finite() && *s > 0.0)
                .map(std::time::Duration::from_secs_f64)
                .or_else(|| self.config.stage_timeout()),
            max_invocations: max_invocations
                .or(self.config.max_invocations)
                .unwrap_or(crate::driver::DEFAULT_MAX_INVOCATIONS),
            max_loops: self.config.max_loops,
        }
    }

    /// Worker factory for API-started runs, from the config's `worker_cmd`.
    fn worker_factory(&self) -> Option<WorkerFactory> {
        let program = self.config.worker_cmd.clone()?;
        let args = self.config.worker_args.clone().unwrap_or_default();
        let factory: WorkerFactory = Arc::new(move |dir: &Path| -> Arc<dyn Worker> {
            Arc::new(CommandWorker::new(program.clone(), args.clone()).with_cwd(dir))
        });
        Some(factory)
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let rt = Runtime::build(&cli)?;

    match cli.command {
        Commands::Init { name } => cmd_init(&rt, &name).await,
        Commands::State => cmd_state(&rt).await,
        Commands::Advance { stage, score, notes } => {
            cmd_advance(&rt, &stage, score, notes.as_deref()).await
        }
        Commands::Rework {
            from,
            target,
            reason,
            loop_key,
            max_loops,
        } => {
            let request = ReworkRequest {
                from_stage: from,
                target_stage: target,
                reason,
                loop_key,
                max_loops,
            };
            cmd_rework(&rt, &request).await
        }
        Commands::Context { key, value } => cmd_context(&rt, &key, &value).await,
        Commands::Blocker { text } => cmd_blocker(&rt, &text).await,
        Commands::Gate { command } => match command {
            GateCommands::Check { stage, score } => cmd_gate_check(&rt, &stage, score),
            GateCommands::Requirements { stage } => cmd_gate_requirements(&rt, &stage),
            GateCommands::List => cmd_gate_list(&rt),
        },
        Commands::Summary => cmd_summary(&rt).await,
        Commands::Stages => cmd_stages(),
        Commands::Run {
            name,
            worker_cmd,
            worker_args,
            stage_timeout,
            max_invocations,
        } => {
            cmd_run(
                &rt,
                name.as_deref(),
                worker_cmd,
                worker_args,
                stage_timeout,
                max_invocations,
            )
            .await
        }
        Commands::Serve { host, port } => {
            let host = host
                .or_else(|| rt.config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(rt.config.port).unwrap_or(3000);

            let mut state = AppState::new(rt.engine.clone(), rt.store.clone(), rt.registry.clone())
                .with_driver_options(rt.driver_options(None, None));
            match rt.worker_factory() {
                Some(factory) => state = state.with_worker_factory(factory),
                None => info!("No worker_cmd configured; POST /projects/{{project}}/runs is disabled"),
            }
            crate::api::serve(&host, port, state).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_init(rt: &Runtime, name: &str) -> Result<()> {
    let state = rt.engine.initialize(&rt.project, name).await?;
    println!(
        "Project \"{}\" initialized. Starting with {}.",
        state.project_name, state.current_agent
    );
    Ok(())
}

async fn cmd_state(rt: &Runtime) -> Result<()> {
    let state = rt.engine.get_state(&rt.project).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn cmd_advance(rt: &Runtime, stage: &str, score: i64, notes: Option<&str>) -> Result<()> {
    let score = Score::new(score)?;
    let next = rt.engine.advance(&rt.project, stage, score, notes).await?;
    println!("{} completed (score: {}/100). Next: {}", stage, score, next);
    Ok(())
}

async fn cmd_rework(rt: &Runtime, request: &ReworkRequest) -> Result<()> {
    match rt.engine.request_rework(&rt.project, request).await? {
        ReworkOutcome::Granted {
            target_stage,
            loop_count,
            max_loops,
        } => println!(
            "Rework requested: {} (loop {}/{}). Reason: {}",
            target_stage, loop_count, max_loops, request.reason
        ),
        ReworkOutcome::CeilingReached {
            loop_key, max_loops, ..
        } => println!(
            "Max loops ({}) reached for {}. Cannot rework further; proceed with current output and document issues.",
            max_loops, loop_key
        ),
    }
    Ok(())
}

async fn cmd_context(rt: &Runtime, key: &str, raw: &str) -> Result<()> {
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    rt.engine.set_context(&rt.project, key, value).await?;
    println!("Context set: {}", key);
    Ok(())
}

async fn cmd_blocker(rt: &Runtime, text: &str) -> Result<()> {
    rt.engine.add_blocker(&rt.project, text).await?;
    println!("Blocker added: {}", text);
    Ok(())
}

fn cmd_gate_check(rt: &Runtime, stage: &str, score: i64) -> Result<()> {
    let score = Score::new(score)?;
    let evaluator = GateEvaluator::new(rt.registry.clone());
    let artifacts = rt.artifacts()?;
    let report = evaluator.evaluate(stage, score, &artifacts);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed {
        anyhow::bail!(
            "Gate failed for {}: {} violation(s)",
            stage,
            report.violations.len()
        );
    }
    Ok(())
}

fn cmd_gate_requirements(rt: &Runtime, stage: &str) -> Result<()> {
    let gate = rt.registry.requirements(stage).with_context(|| {
        format!(
            "No gate defined for: {}. Known stages: {}",
            stage,
            rt.registry.stages().join(", ")
        )
    })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "stage": stage,
            "min_score": gate.min_score,
            "required_artifacts": gate.required_artifacts,
            "description": gate.description,
        }))?
    );
    Ok(())
}

fn cmd_gate_list(rt: &Runtime) -> Result<()> {
    println!("{:<24} {:<6} {}", "STAGE", "MIN", "REQUIRED ARTIFACTS");
    println!("{}", "-".repeat(72));

    for (stage, gate) in rt.registry.iter() {
        let artifacts = if gate.required_artifacts.is_empty() {
            "-".to_string()
        } else {
            gate.required_artifacts.join(", ")
        };
        println!("{:<24} {:<6} {}", stage, gate.min_score.value(), artifacts);
    }

    println!("\nTotal: {} gate(s)", rt.registry.len());
    Ok(())
}

async fn cmd_summary(rt: &Runtime) -> Result<()> {
    let state = rt.engine.get_state(&rt.project).await?;
    let summary = rt.registry.summary(&state);

    println!("{:<24} {:<10} {:<6} {}", "STAGE", "STATUS", "SCORE", "THRESHOLD");
    println!("{}", "-".repeat(52));

    for row in &summary {
        let score = row
            .score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<10} {:<6} {}",
            row.stage,
            row.status.to_string(),
            score,
            row.threshold
        );
    }

    println!("\nCurrent: {} ({})", state.current_agent, state.current_phase);
    if !state.blockers.is_empty() {
        println!("\nBlockers:");
        for blocker in &state.blockers {
            println!("  - {}", blocker);
        }
    }
    Ok(())
}

fn cmd_stages() -> Result<()> {
    println!("{:<4} {:<24} PHASE", "#", "STAGE");
    println!("{}", "-".repeat(44));

    for (idx, stage) in stages::PIPELINE.iter().enumerate() {
        println!("{:<4} {:<24} {}", idx + 1, stage.name, stage.phase);
    }
    Ok(())
}

async fn cmd_run(
    rt: &Runtime,
    name: Option<&str>,
    worker_cmd: Option<String>,
    worker_args: Vec<String>,
    stage_timeout: Option<f64>,
    max_invocations: Option<u32>,
) -> Result<()> {
    let program = worker_cmd
        .or_else(|| rt.config.worker_cmd.clone())
        .ok_or_else(|| anyhow::anyhow!("No worker command: pass --worker-cmd or set worker_cmd in config"))?;
    let args = if worker_args.is_empty() {
        rt.config.worker_args.clone().unwrap_or_default()
    } else {
        worker_args
    };

    let project_dir = rt.store.project_dir(&rt.project)?;
    let worker = CommandWorker::new(program, args).with_cwd(&project_dir);

    let options = rt.driver_options(stage_timeout, max_invocations);

    let orchestrator = Orchestrator::new(
        rt.engine.clone(),
        Arc::new(GateEvaluator::new(rt.registry.clone())),
        Arc::new(worker),
        Arc::new(FsArtifactChecker::new(&project_dir)),
    )
    .with_options(options);

    let report = orchestrator.run(&rt.project, name).await?;

    println!("\n{}", "=".repeat(60));
    println!("  PROJECT REPORT");
    println!("{}", "=".repeat(60));
    println!("  Project: {}", report.project_name);
    println!("  Run ID:  {}", report.run_id);
    println!("  Status:  {}", report.status);
    println!("  Current: {}", report.current_agent);

    if !report.quality_scores.is_empty() {
        println!("\n  Quality Scores:");
        for (stage, score) in &report.quality_scores {
            let filled = (usize::from(score.value()) + 2) / 5;
            let bar = format!("{}{}", "#".repeat(filled), ".".repeat(20 - filled));
            println!("    {:<25} {} {}/100", stage, bar, score);
        }
    }

    if !report.blockers.is_empty() {
        println!("\n  Blockers:");
        for blocker in &report.blockers {
            println!("    - {}", blocker);
        }
    }

    println!("\n  Runtime:     {:.1}s", report.duration_seconds);
    println!("  Stages:      {}", report.stages_invoked.join(", "));
    println!(
        "  Invocations: {} ({} rework, {} ceiling)",
        report.invocations, report.reworks_granted, report.ceilings_reached
    );
    println!("{}\n", "=".repeat(60));

    if let Some(ref err) = report.error {
        anyhow::bail!("Run stopped: {}", err);
    }
    Ok(())
}
