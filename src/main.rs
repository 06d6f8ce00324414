//! Serving accuracy benchmark.
//!
//! Launches one inference server per case of the model matrix, runs
//! `lm_eval` against it, checks the configured metric threshold and tears the
//! server down again.
//!
//! ```bash
//! servebench --models models.toml --eval-config lm_eval.toml --gpu 0,1
//! servebench --case llama3-8b-vllm --extra-serve-args "--max-model-len 8192"
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use servebench::banner;
use servebench::case::run_case;
use servebench::config::{EvalOptions, ModelsConfig, ServeConfig, gpu_from_env, split_command};
use servebench::errors::Result;
use servebench::models::{CaseStatus, RunSummary};
use servebench::runner::EvalInvoker;
use servebench::server::ServerLauncher;

#[derive(Parser, Debug)]
#[command(name = "servebench", version, about = "Benchmark served models against lm_eval thresholds")]
struct Cli {
    /// Model matrix
    #[arg(long, env = "SERVEBENCH_MODELS", default_value = "models.toml")]
    models: PathBuf,

    /// Evaluation defaults (`[lm_eval]` table); missing file means defaults
    #[arg(long, env = "SERVEBENCH_EVAL_CONFIG", default_value = "lm_eval.toml")]
    eval_config: PathBuf,

    /// vLLM server entrypoint
    #[arg(long, env = "SERVEBENCH_VLLM_BIN", default_value = "python -m vllm.entrypoints.openai.api_server")]
    vllm_bin: String,

    /// SGLang server entrypoint
    #[arg(long, env = "SERVEBENCH_SGL_BIN", default_value = "python -m sglang.launch_server")]
    sgl_bin: String,

    /// Evaluation tool entrypoint
    #[arg(long, env = "SERVEBENCH_LM_EVAL_BIN", default_value = "lm_eval")]
    lm_eval_bin: String,

    #[arg(long, env = "SERVEBENCH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Per-case timeout in seconds
    #[arg(long, env = "SERVEBENCH_CASE_TIMEOUT", default_value_t = 1200)]
    case_timeout: u64,

    /// Seconds to wait for the health endpoint
    #[arg(long, env = "SERVEBENCH_HEALTH_TIMEOUT", default_value_t = 300)]
    health_timeout: u64,

    /// Seconds between SIGTERM and SIGKILL on teardown
    #[arg(long, env = "SERVEBENCH_SHUTDOWN_GRACE", default_value_t = 10)]
    shutdown_grace: u64,

    /// Visible GPU ids; defaults to ROCR_VISIBLE_DEVICES or CUDA_VISIBLE_DEVICES
    #[arg(long, env = "SERVEBENCH_GPU")]
    gpu: Option<String>,

    /// Extra args passed to every server
    #[arg(long, env = "SERVEBENCH_EXTRA_SERVE_ARGS", default_value = "", allow_hyphen_values = true)]
    extra_serve_args: String,

    #[arg(long, env = "SERVEBENCH_HEALTH_PATH", default_value = "/v1/models")]
    health_path: String,

    /// Root directory for run outputs
    #[arg(long, env = "SERVEBENCH_OUTPUT_DIR", default_value = "bench-runs")]
    output_dir: PathBuf,

    /// Only run the named case (repeatable; comma-separated in the env var)
    #[arg(long = "case", env = "SERVEBENCH_CASE", value_delimiter = ',')]
    cases: Vec<String>,
}

impl Cli {
    fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            vllm_command: split_command(&self.vllm_bin),
            sglang_command: split_command(&self.sgl_bin),
            host: self.host.clone(),
            gpu: self.gpu.clone().or_else(gpu_from_env),
            extra_serve_args: split_command(&self.extra_serve_args),
            health_path: self.health_path.clone(),
            health_timeout: Duration::from_secs(self.health_timeout),
            case_timeout: Duration::from_secs(self.case_timeout),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    banner::print_banner();

    // .env may set RUST_LOG, so it loads before the logger.
    let dotenv = dotenvy::dotenv();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    if let Err(e) = dotenv {
        log::debug!("No .env loaded: {}", e);
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let matrix = ModelsConfig::from_file(&cli.models)?;
    let options = EvalOptions::from_file(&cli.eval_config)?;
    let invoker = EvalInvoker::new(split_command(&cli.lm_eval_bin), options)?;
    let launcher = ServerLauncher::new(cli.serve_config());

    for name in &cli.cases {
        if !matrix.models.iter().any(|c| &c.name == name) {
            log::warn!("--case {} matches nothing in {}", name, cli.models.display());
        }
    }
    let cases: Vec<_> = matrix
        .models
        .iter()
        .filter(|c| cli.cases.is_empty() || cli.cases.contains(&c.name))
        .collect();

    let started_at = chrono::Utc::now();
    let run_id = format!(
        "{}-{}",
        started_at.format("%Y%m%d-%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let run_dir = cli.output_dir.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;

    let separator = "=".repeat(60);
    println!("📦 Run {} with {} case(s), outputs in {}", run_id, cases.len(), run_dir.display());

    let mut reports = Vec::with_capacity(cases.len());
    for case in cases {
        println!("\n{}", separator);
        println!("🎯 {} ({}) {}", case.name, case.backend, case.path.display());
        println!("{}", separator);

        let report = run_case(&launcher, &invoker, case, &run_dir.join(&case.name)).await;
        let icon = match report.status {
            CaseStatus::Passed => "✅",
            CaseStatus::Failed => "❌",
            CaseStatus::Skipped => "⏭️ ",
            CaseStatus::Error => "💥",
        };
        match (&report.score, &report.message) {
            (Some(score), _) if report.status == CaseStatus::Passed => {
                println!("{} {} {} score {:.3} ({}ms)", icon, report.status, case.name, score, report.duration_ms)
            }
            (_, Some(message)) => println!("{} {} {}: {}", icon, report.status, case.name, message),
            _ => println!("{} {} {} ({}ms)", icon, report.status, case.name, report.duration_ms),
        }
        reports.push(report);
    }

    let summary = RunSummary::new(run_id, started_at, reports);
    let summary_path = run_dir.join("summary.json");
    summary.write_to(&summary_path)?;

    println!("\n{}", separator);
    println!(
        "📊 {} passed, {} failed, {} skipped, {} errors. Summary: {}",
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.errors,
        summary_path.display()
    );
    Ok(summary)
}
