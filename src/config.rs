// src/config.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{HarnessError, Result};

/// Minimum score a case must reach on one metric.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Expectation {
    pub metric: String,
    pub min: f64,
}

/// One entry of the model matrix: a model served by one backend, plus what
/// it is expected to score.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ServerCase {
    pub name: String,

    /// Backend identifier, e.g. `vllm` or `sglang`. Resolved at launch time.
    pub backend: String,

    /// Path to the model weights, passed to the server as `--model`.
    pub path: PathBuf,

    /// Extra launch parameters appended after `--model/--host/--port`.
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default)]
    pub expect: Option<Expectation>,
}

/// The model matrix, usually loaded from `models.toml`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: Vec<ServerCase>,
}

impl ModelsConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ModelsConfig = toml::from_str(raw)?;
        let mut seen = std::collections::HashSet::new();
        for case in &config.models {
            validate_case_name(&case.name)?;
            if !seen.insert(case.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate case name '{}' in model matrix",
                    case.name
                )));
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// Case names become directory and log file names.
fn validate_case_name(name: &str) -> Result<()> {
    let bad_char = name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if name.trim().is_empty() || name == "." || name == ".." || bad_char {
        return Err(HarnessError::Config(format!(
            "case name '{}' is not usable as a directory name",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Value passed to `--batch_size`: either `auto` (or `auto:N`) or a fixed size.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum BatchSize {
    Fixed(u32),
    Named(String),
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Named("auto".to_string())
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Fixed(n) => write!(f, "{}", n),
            BatchSize::Named(s) => write!(f, "{}", s),
        }
    }
}

/// Evaluation defaults shared by every case in a run.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EvalOptions {
    pub tasks: Vec<String>,
    pub num_fewshot: u32,
    /// `0` disables `--limit`.
    pub limit: Option<u64>,
    pub batch_size: BatchSize,
    pub num_concurrent: u32,
    pub max_retries: u32,
    pub max_gen_toks: u32,
    pub apply_chat_template: bool,
    /// Merged into `--model_args`; a key here replaces the built-in value.
    pub extra_model_args: BTreeMap<String, serde_json::Value>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            tasks: vec!["gsm8k".to_string()],
            num_fewshot: 5,
            limit: Some(250),
            batch_size: BatchSize::default(),
            num_concurrent: 256,
            max_retries: 10,
            max_gen_toks: 2048,
            apply_chat_template: true,
            extra_model_args: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct EvalConfigFile {
    #[serde(default)]
    lm_eval: EvalOptions,
}

impl EvalOptions {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: EvalConfigFile = toml::from_str(raw)?;
        Ok(file.lm_eval)
    }

    /// Loads the `[lm_eval]` table. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Evaluation config {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// How servers are launched, health-checked and torn down.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub vllm_command: Vec<String>,
    pub sglang_command: Vec<String>,
    pub host: String,
    /// Visible GPU ids, exported as `ROCR_VISIBLE_DEVICES` and `CUDA_VISIBLE_DEVICES`.
    pub gpu: Option<String>,
    pub extra_serve_args: Vec<String>,
    pub health_path: String,
    pub health_timeout: Duration,
    pub case_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            vllm_command: split_command("python -m vllm.entrypoints.openai.api_server"),
            sglang_command: split_command("python -m sglang.launch_server"),
            host: "127.0.0.1".to_string(),
            gpu: gpu_from_env(),
            extra_serve_args: Vec::new(),
            health_path: "/v1/models".to_string(),
            health_timeout: Duration::from_secs(300),
            case_timeout: Duration::from_secs(1200),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Splits a command line on whitespace. No shell quoting is interpreted.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

/// GPU list inherited from the environment, ROCm first.
pub fn gpu_from_env() -> Option<String> {
    ["ROCR_VISIBLE_DEVICES", "CUDA_VISIBLE_DEVICES"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_config_parse() {
        let raw = r#"
            [[models]]
            name = "llama3-8b-vllm"
            backend = "vllm"
            path = "/models/llama3"
            params = ["--tensor-parallel-size", "2"]
            expect = { metric = "exact_match", min = 0.5 }

            [[models]]
            name = "qwen-sglang"
            backend = "sglang"
            path = "/models/qwen"
        "#;

        let config = ModelsConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.models.len(), 2);

        let first = &config.models[0];
        assert_eq!(first.params, vec!["--tensor-parallel-size", "2"]);
        assert_eq!(
            first.expect,
            Some(Expectation { metric: "exact_match".to_string(), min: 0.5 })
        );

        let second = &config.models[1];
        assert!(second.params.is_empty());
        assert!(second.expect.is_none());
    }

    #[test]
    fn test_duplicate_case_names_rejected() {
        let raw = r#"
            [[models]]
            name = "a"
            backend = "vllm"
            path = "/m"

            [[models]]
            name = "a"
            backend = "sglang"
            path = "/m"
        "#;

        let err = ModelsConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_case_names_must_be_path_segments() {
        for name in ["llama/8b", "..", "", "a\\b"] {
            let raw = format!(
                "[[models]]\nname = {:?}\nbackend = \"vllm\"\npath = \"/m\"\n",
                name
            );
            let err = ModelsConfig::from_toml_str(&raw).unwrap_err();
            assert!(matches!(err, HarnessError::Config(ref msg) if msg.contains("directory name")), "{name}");
        }

        let ok = "[[models]]\nname = \"llama3.1-8b_tp2\"\nbackend = \"vllm\"\npath = \"/m\"\n";
        assert!(ModelsConfig::from_toml_str(ok).is_ok());
    }

    #[test]
    fn test_eval_options_defaults_fill_missing_keys() {
        let raw = r#"
            [lm_eval]
            tasks = ["mmlu"]
            batch_size = 64
            limit = 0
        "#;

        let options = EvalOptions::from_toml_str(raw).unwrap();
        assert_eq!(options.tasks, vec!["mmlu"]);
        assert_eq!(options.batch_size, BatchSize::Fixed(64));
        assert_eq!(options.limit, Some(0));
        assert_eq!(options.num_fewshot, 5);
        assert_eq!(options.num_concurrent, 256);
        assert!(options.apply_chat_template);
    }

    #[test]
    fn test_eval_options_missing_table() {
        let options = EvalOptions::from_toml_str("").unwrap();
        assert_eq!(options, EvalOptions::default());
        assert_eq!(options.batch_size.to_string(), "auto");
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("  python -m   sglang.launch_server "),
            vec!["python", "-m", "sglang.launch_server"]
        );
        assert!(split_command("").is_empty());
    }
}
