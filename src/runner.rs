// src/runner.rs
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use tokio::process::Command;

use crate::config::EvalOptions;
use crate::errors::{HarnessError, Result};
use crate::results::{self, EvaluationResult};

/// Runs the external evaluation tool against a served model.
pub struct EvalInvoker {
    command: Vec<String>,
    options: EvalOptions,
}

impl EvalInvoker {
    /// `command` is the tool's entrypoint, e.g. `["lm_eval"]`.
    pub fn new(command: Vec<String>, options: EvalOptions) -> Result<Self> {
        if command.is_empty() {
            return Err(HarnessError::Config("empty evaluation command".to_string()));
        }
        if options.tasks.is_empty() {
            return Err(HarnessError::Config("no evaluation tasks configured".to_string()));
        }
        Ok(Self { command, options })
    }

    /// The task whose metrics are compared against a case's threshold.
    pub fn primary_task(&self) -> &str {
        &self.options.tasks[0]
    }

    /// `k=v` pairs for `--model_args`, in a stable order. Extra args replace
    /// built-in keys in place and append new ones.
    pub fn model_args(&self, endpoint: &str, model_path: &Path) -> String {
        let mut pairs: Vec<(String, String)> = vec![
            ("model".to_string(), model_path.display().to_string()),
            ("base_url".to_string(), format!("{}/v1/completions", endpoint.trim_end_matches('/'))),
            ("num_concurrent".to_string(), self.options.num_concurrent.to_string()),
            ("max_retries".to_string(), self.options.max_retries.to_string()),
            ("max_gen_toks".to_string(), self.options.max_gen_toks.to_string()),
        ];

        for (key, value) in &self.options.extra_model_args {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value,
                None => pairs.push((key.clone(), value)),
            }
        }

        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Full argv, program first.
    pub fn build_args(&self, endpoint: &str, model_path: &Path, output_dir: &Path) -> Vec<String> {
        let opts = &self.options;
        let mut args = self.command.clone();
        args.extend([
            "--model".to_string(),
            "local-completions".to_string(),
            "--model_args".to_string(),
            self.model_args(endpoint, model_path),
            "--tasks".to_string(),
            opts.tasks.join(","),
            "--num_fewshot".to_string(),
            opts.num_fewshot.to_string(),
            "--batch_size".to_string(),
            opts.batch_size.to_string(),
            "--output_path".to_string(),
            output_dir.display().to_string(),
        ]);
        if let Some(limit) = opts.limit.filter(|n| *n > 0) {
            args.extend(["--limit".to_string(), limit.to_string()]);
        }
        if opts.apply_chat_template {
            args.push("--apply_chat_template".to_string());
        }
        args
    }

    /// Runs the evaluation to completion and parses the first task's metrics.
    ///
    /// Blocks for the tool's full run; there is no timeout here.
    pub async fn run(&self, endpoint: &str, model_path: &Path, output_dir: &Path) -> Result<EvaluationResult> {
        std::fs::create_dir_all(output_dir)?;
        let args = self.build_args(endpoint, model_path, output_dir);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| HarnessError::Config("empty evaluation command".to_string()))?;

        log::info!("Start evaluation against {}", endpoint);
        log::debug!("{} {}", program, rest.join(" "));
        let start = Instant::now();

        let output = Command::new(program)
            .args(rest)
            .output()
            .await
            .map_err(|source| HarnessError::Spawn { program: program.clone(), source })?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if !output.status.success() {
            log::warn!("Evaluation failed after {}ms: {}", elapsed_ms, output.status);
            return Err(HarnessError::EvalCommandFailed {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        log::info!("Evaluation finished in {}ms, parsing result", elapsed_ms);
        let artifact = results::find_results_json(output_dir)?;
        log::debug!("Using result artifact {}", artifact.display());
        results::parse_results(&artifact, self.primary_task())
    }
}
