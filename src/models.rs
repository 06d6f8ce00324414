// src/models.rs
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::errors::Result;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseStatus::Passed => write!(f, "PASSED"),
            CaseStatus::Failed => write!(f, "FAILED"),
            CaseStatus::Skipped => write!(f, "SKIPPED"),
            CaseStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Outcome of one case.
#[derive(Serialize, Clone, Debug)]
pub struct CaseReport {
    pub name: String,
    pub backend: String,
    pub status: CaseStatus,
    pub task: Option<String>,
    pub metric: Option<String>,
    pub score: Option<f64>,
    pub threshold: Option<f64>,
    pub message: Option<String>,
    pub result_file: Option<PathBuf>,
    pub server_log: Option<PathBuf>,
    pub duration_ms: u64,
}

impl CaseReport {
    pub fn new(name: &str, backend: &str, status: CaseStatus) -> Self {
        Self {
            name: name.to_string(),
            backend: backend.to_string(),
            status,
            task: None,
            metric: None,
            score: None,
            threshold: None,
            message: None,
            result_file: None,
            server_log: None,
            duration_ms: 0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// All case reports of one run.
#[derive(Serialize, Clone, Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cases: Vec<CaseReport>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, started_at: chrono::DateTime<chrono::Utc>, cases: Vec<CaseReport>) -> Self {
        let count = |status: CaseStatus| cases.iter().filter(|c| c.status == status).count();
        Self {
            run_id: run_id.into(),
            started_at: started_at.to_rfc3339(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            passed: count(CaseStatus::Passed),
            failed: count(CaseStatus::Failed),
            skipped: count(CaseStatus::Skipped),
            errors: count(CaseStatus::Error),
            cases,
        }
    }

    /// True when no case failed or errored. Skips do not count against a run.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
