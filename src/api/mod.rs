mod errors;
pub mod handlers;
pub mod runs;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::driver::{DriverOptions, Worker};
use crate::engine::pipeline::PipelineEngine;
use crate::gates::{GateEvaluator, GateRegistry};
use crate::storage::json_store::JsonStateStore;

use runs::RunRegistry;

/// Request bodies are small JSON documents.
const MAX_BODY: usize = 1024 * 1024;

/// Builds the worker for a run, given the project's workspace directory.
pub type WorkerFactory = Arc<dyn Fn(&Path) -> Arc<dyn Worker> + Send + Sync>;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: Arc<PipelineEngine>,
    pub evaluator: Arc<GateEvaluator>,
    /// Resolves project keys to workspaces for artifact checks.
    pub store: Arc<JsonStateStore>,
    pub runs: RunRegistry,
    /// Server-side worker configuration. Runs cannot be started without it.
    pub worker_factory: Option<WorkerFactory>,
    pub driver_options: DriverOptions,
}

impl AppState {
    pub fn new(
        engine: Arc<PipelineEngine>,
        store: Arc<JsonStateStore>,
        registry: Arc<GateRegistry>,
    ) -> Self {
        Self {
            engine,
            evaluator: Arc::new(GateEvaluator::new(registry)),
            store,
            runs: RunRegistry::new(),
            worker_factory: None,
            driver_options: DriverOptions::default(),
        }
    }

    pub fn with_worker_factory(mut self, factory: WorkerFactory) -> Self {
        self.worker_factory = Some(factory);
        self
    }

    pub fn with_driver_options(mut self, options: DriverOptions) -> Self {
        self.driver_options = options;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stages", get(handlers::list_stages))
        .route("/gates", get(handlers::list_gates))
        .route("/gates/{stage}", get(handlers::get_gate))
        .route("/projects/{project}/state", get(handlers::get_state))
        .route("/projects/{project}/init", post(handlers::init_project))
        .route("/projects/{project}/advance", post(handlers::advance))
        .route("/projects/{project}/rework", post(handlers::rework))
        .route("/projects/{project}/context", post(handlers::set_context))
        .route("/projects/{project}/blockers", post(handlers::add_blocker))
        .route("/projects/{project}/summary", get(handlers::summary))
        .route(
            "/projects/{project}/gates/{stage}/evaluate",
            post(handlers::evaluate_gate),
        )
        .route("/projects/{project}/runs", post(handlers::start_run))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, state: AppState) -> Result<()> {
    let workspace = state.store.root().display().to_string();
    let runs_enabled = state.worker_factory.is_some();
    let app = router(Arc::new(state));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(workspace = %workspace, runs_enabled, "Pipewright API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
