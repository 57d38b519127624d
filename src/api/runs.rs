//! In-memory registry of pipeline runs started over HTTP.
//!
//! A project has at most one run in flight; finished runs stay listed until
//! the server restarts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::driver::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Running,
    /// The driver returned a report, whatever its status.
    Finished,
    /// The driver aborted without a report (storage failure).
    Errored,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Running => write!(f, "running"),
            RunPhase::Finished => write!(f, "finished"),
            RunPhase::Errored => write!(f, "errored"),
        }
    }
}

impl std::str::FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunPhase::Running),
            "finished" => Ok(RunPhase::Finished),
            "errored" => Ok(RunPhase::Errored),
            other => Err(format!(
                "Invalid status '{}'. Valid: running, finished, errored",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project: String,
    pub status: RunPhase,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running run for `project`.
    ///
    /// Fails with the id of the run already in flight for that project.
    pub async fn start(&self, project: &str) -> Result<RunRecord, String> {
        let mut runs = self.runs.write().await;
        if let Some(active) = runs
            .values()
            .find(|r| r.project == project && r.status == RunPhase::Running)
        {
            return Err(active.run_id.clone());
        }

        let record = RunRecord {
            run_id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            status: RunPhase::Running,
            started: Utc::now(),
            finished: None,
            report: None,
            error: None,
        };
        runs.insert(record.run_id.clone(), record.clone());
        Ok(record)
    }

    pub async fn finish(&self, run_id: &str, result: anyhow::Result<RunReport>) {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            return;
        };

        record.finished = Some(Utc::now());
        match result {
            Ok(report) => {
                record.status = RunPhase::Finished;
                record.error = report.error.clone();
                record.report = Some(report);
            }
            Err(e) => {
                record.status = RunPhase::Errored;
                record.error = Some(format!("{:#}", e));
            }
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// All runs, oldest first, optionally filtered by status.
    pub async fn list(&self, status: Option<RunPhase>) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started.cmp(&b.started));
        runs
    }
}
