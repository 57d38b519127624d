use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::gates::{GateOverride, GateRegistry};

/// Configuration loaded from `pipewright.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PipewrightConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Root directory that holds project workspaces.
    pub workspace: Option<String>,
    /// Default rework ceiling per loop key.
    pub max_loops: Option<u32>,
    /// Per-stage worker time limit, in seconds.
    pub stage_timeout_s: Option<f64>,
    pub max_invocations: Option<u32>,
    pub worker_cmd: Option<String>,
    pub worker_args: Option<Vec<String>>,
    /// Stage name → partial gate override.
    /// e.g. `implementation-agent: { min_score: 70 }`
    pub gates: Option<BTreeMap<String, GateOverride>>,
}

impl PipewrightConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `pipewright.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("pipewright.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: PipewrightConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Gate registry with this config's overrides applied.
    pub fn gate_registry(&self) -> Result<GateRegistry> {
        match self.gates {
            Some(ref overrides) => GateRegistry::with_overrides(overrides)
                .context("Invalid gate configuration"),
            None => Ok(GateRegistry::builtin()),
        }
    }

    pub fn stage_timeout(&self) -> Option<std::time::Duration> {
        self.stage_timeout_s
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(std::time::Duration::from_secs_f64)
    }
}
