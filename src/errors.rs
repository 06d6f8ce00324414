// src/errors.rs
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend '{0}' is not supported (expected 'vllm' or 'sglang')")]
    UnsupportedBackend(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server for '{case}' not ready in time. See logs: {}", .logs.display())]
    ServerNotReady { case: String, logs: PathBuf },

    #[error("Case timeout {timeout_secs}s for {case}")]
    CaseTimeout { case: String, timeout_secs: u64 },

    #[error("lm_eval failed (rc={code:?}).\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")]
    EvalCommandFailed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("No results JSON found under {}", .dir.display())]
    ResultsNotFound { dir: PathBuf },

    #[error("Malformed results file {}: {reason}", .path.display())]
    MalformedResults { path: PathBuf, reason: String },

    #[error("Task '{task}' missing from results (available: {available:?})")]
    TaskMissing { task: String, available: Vec<String> },

    #[error("Metric '{metric}' missing for task '{task}'")]
    MetricMissing { task: String, metric: String },
}

pub type Result<T> = std::result::Result<T, HarnessError>;
