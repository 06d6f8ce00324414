// src/results.rs
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::errors::{HarnessError, Result};

/// Parsed evaluation artifact, focused on the first requested task.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub task: String,
    /// Metrics of `task`, verbatim from the artifact.
    pub task_metrics: Map<String, Value>,
    /// The whole `results` mapping, verbatim.
    pub results: Map<String, Value>,
    pub artifact: PathBuf,
}

impl EvaluationResult {
    /// Looks up a metric of the first task.
    ///
    /// lm_eval suffixes metrics with their filter (`exact_match,strict-match`),
    /// so a bare name falls back to the first key carrying that prefix.
    pub fn metric(&self, name: &str) -> Option<f64> {
        if let Some(value) = self.task_metrics.get(name) {
            return value.as_f64();
        }
        let prefix = format!("{},", name);
        self.task_metrics
            .iter()
            .find(|(key, _)| key.starts_with(&prefix))
            .and_then(|(_, value)| value.as_f64())
    }
}

/// Finds the evaluation tool's result file under `dir`.
///
/// Prefers the first `results*.json` directly in `dir` (sorted by name), then
/// any JSON file below `dir` whose top level is an object with a `results` key.
pub fn find_results_json(dir: &Path) -> Result<PathBuf> {
    let pattern = Regex::new(r"^results.*\.json$")
        .map_err(|e| HarnessError::Config(e.to_string()))?;

    let mut direct: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| pattern.is_match(n))
            })
            .collect(),
        Err(_) => return Err(HarnessError::ResultsNotFound { dir: dir.to_path_buf() }),
    };
    direct.sort();
    if let Some(first) = direct.into_iter().next() {
        return Ok(first);
    }

    let mut candidates = Vec::new();
    collect_json_files(dir, &mut candidates);
    candidates.sort();
    candidates
        .into_iter()
        .find(|p| has_results_key(p))
        .ok_or_else(|| HarnessError::ResultsNotFound { dir: dir.to_path_buf() })
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        if path.is_dir() {
            collect_json_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
}

fn has_results_key(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .is_some_and(|v| v.get("results").is_some())
}

/// Reads `path` and extracts the metrics of `task`.
pub fn parse_results(path: &Path, task: &str) -> Result<EvaluationResult> {
    let raw = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&raw)?;

    let results = match data.get("results") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(HarnessError::MalformedResults {
                path: path.to_path_buf(),
                reason: "'results' is not an object".to_string(),
            });
        }
        None => {
            return Err(HarnessError::MalformedResults {
                path: path.to_path_buf(),
                reason: "no 'results' key".to_string(),
            });
        }
    };

    let task_metrics = match results.get(task) {
        Some(Value::Object(metrics)) => metrics.clone(),
        _ => {
            return Err(HarnessError::TaskMissing {
                task: task.to_string(),
                available: results.keys().cloned().collect(),
            });
        }
    };

    Ok(EvaluationResult {
        task: task.to_string(),
        task_metrics,
        results,
        artifact: path.to_path_buf(),
    })
}
