// src/case.rs
use std::path::Path;
use std::time::Instant;

use crate::config::ServerCase;
use crate::errors::{HarnessError, Result};
use crate::models::{CaseReport, CaseStatus};
use crate::results::EvaluationResult;
use crate::runner::EvalInvoker;
use crate::server::{ServerHandle, ServerLauncher, allocate_port};

/// File the full results mapping is persisted to, inside the case directory.
pub const RESULT_FILE: &str = "lm_eval_result.json";

/// Runs one case end to end: launch, evaluate, compare, tear down.
///
/// Never returns an error; failures end up in the report. The server is torn
/// down before this returns, whatever happened in between.
pub async fn run_case(
    launcher: &ServerLauncher,
    invoker: &EvalInvoker,
    case: &ServerCase,
    case_dir: &Path,
) -> CaseReport {
    let start = Instant::now();
    let mut report = execute(launcher, invoker, case, case_dir).await.unwrap_or_else(|e| {
        log::error!("{} errored: {}", case.name, e);
        CaseReport::new(&case.name, &case.backend, CaseStatus::Error).with_message(e.to_string())
    });
    report.duration_ms = start.elapsed().as_millis() as u64;
    report
}

async fn execute(
    launcher: &ServerLauncher,
    invoker: &EvalInvoker,
    case: &ServerCase,
    case_dir: &Path,
) -> Result<CaseReport> {
    if !case.path.exists() {
        log::warn!("Skipping {}: model path not found", case.name);
        return Ok(CaseReport::new(&case.name, &case.backend, CaseStatus::Skipped)
            .with_message(format!("Model path not found: {}", case.path.display())));
    }

    std::fs::create_dir_all(case_dir)?;
    let host = launcher.config().host.clone();
    let port = allocate_port(&host)?;

    let mut handle = launcher.launch(case, &host, port, case_dir).await?;
    let outcome = evaluate_case(&mut handle, invoker, case, case_dir).await;
    handle.teardown().await;

    let mut report = outcome?;
    report.server_log = Some(handle.logs().to_path_buf());
    Ok(report)
}

/// Runs the evaluation against a ready server and judges the outcome.
///
/// The guard is checked before and after the evaluation.
pub async fn evaluate_case(
    handle: &mut ServerHandle,
    invoker: &EvalInvoker,
    case: &ServerCase,
    case_dir: &Path,
) -> Result<CaseReport> {
    handle.guard().check()?;
    handle.mark_in_use();

    let result = invoker
        .run(handle.endpoint(), &case.path, &case_dir.join("lm_eval"))
        .await?;
    handle.guard().check()?;
    log::info!(
        "{}: evaluation done after {:?}, {:?} left before case timeout",
        case.name,
        handle.guard().elapsed(),
        handle.guard().remaining()
    );

    let dest = case_dir.join(RESULT_FILE);
    let pretty = serde_json::to_string_pretty(&serde_json::Value::Object(result.results.clone()))?;
    std::fs::write(&dest, pretty)?;

    check_threshold(case, &result, &dest)
}

/// Compares the case's expected metric against `result`.
///
/// A score below the minimum is a `Failed` report, not an error. A case
/// without an expectation passes once the evaluation succeeded.
pub fn check_threshold(case: &ServerCase, result: &EvaluationResult, dest: &Path) -> Result<CaseReport> {
    let mut report = CaseReport::new(&case.name, &case.backend, CaseStatus::Passed);
    report.task = Some(result.task.clone());
    report.result_file = Some(dest.to_path_buf());

    let Some(expect) = &case.expect else {
        log::info!("{}: no expectation configured, evaluation completed", case.name);
        return Ok(report);
    };

    let score = result.metric(&expect.metric).ok_or_else(|| HarnessError::MetricMissing {
        task: result.task.clone(),
        metric: expect.metric.clone(),
    })?;

    report.metric = Some(expect.metric.clone());
    report.score = Some(score);
    report.threshold = Some(expect.min);

    if score >= expect.min {
        log::info!("{}: {} {:.3} >= {:.3}", case.name, expect.metric, score, expect.min);
        Ok(report)
    } else {
        report.status = CaseStatus::Failed;
        Ok(report.with_message(format!(
            "{} lm_eval {} score {:.3} < {:.3}. See {}",
            case.name,
            result.task,
            score,
            expect.min,
            dest.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvalOptions, Expectation, ServeConfig};
    use serde_json::json;
    use std::path::PathBuf;

    fn case(expect: Option<Expectation>) -> ServerCase {
        ServerCase {
            name: "llama3-8b".to_string(),
            backend: "vllm".to_string(),
            path: PathBuf::from("/models/llama3"),
            params: Vec::new(),
            expect,
        }
    }

    fn result(score: f64) -> EvaluationResult {
        EvaluationResult {
            task: "gsm8k".to_string(),
            task_metrics: json!({ "exact_match": score }).as_object().cloned().unwrap(),
            results: json!({ "gsm8k": { "exact_match": score } }).as_object().cloned().unwrap(),
            artifact: PathBuf::from("results_2024.json"),
        }
    }

    #[test]
    fn test_score_below_threshold_fails_with_context() {
        let expect = Expectation { metric: "exact_match".to_string(), min: 0.5 };
        let report = check_threshold(&case(Some(expect)), &result(0.42), Path::new("/runs/lm_eval_result.json")).unwrap();

        assert_eq!(report.status, CaseStatus::Failed);
        let message = report.message.unwrap();
        assert!(message.contains("llama3-8b"));
        assert!(message.contains("0.42"));
        assert!(message.contains("0.5"));
        assert!(message.contains("/runs/lm_eval_result.json"));
    }

    #[test]
    fn test_score_above_threshold_passes() {
        let expect = Expectation { metric: "exact_match".to_string(), min: 0.3 };
        let report = check_threshold(&case(Some(expect)), &result(0.42), Path::new("r.json")).unwrap();

        assert_eq!(report.status, CaseStatus::Passed);
        assert_eq!(report.score, Some(0.42));
        assert_eq!(report.threshold, Some(0.3));
    }

    #[test]
    fn test_missing_metric_is_error() {
        let expect = Expectation { metric: "acc_norm".to_string(), min: 0.3 };
        let err = check_threshold(&case(Some(expect)), &result(0.42), Path::new("r.json")).unwrap_err();
        assert!(matches!(err, HarnessError::MetricMissing { .. }));
    }

    #[test]
    fn test_no_expectation_passes() {
        let report = check_threshold(&case(None), &result(0.1), Path::new("r.json")).unwrap();
        assert_eq!(report.status, CaseStatus::Passed);
        assert_eq!(report.score, None);
    }

    #[tokio::test]
    async fn test_missing_model_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ServerLauncher::new(ServeConfig::default());
        let invoker = EvalInvoker::new(vec!["lm_eval".to_string()], EvalOptions::default()).unwrap();
        let mut missing = case(None);
        missing.path = dir.path().join("does-not-exist");

        let report = run_case(&launcher, &invoker, &missing, &dir.path().join("case")).await;
        assert_eq!(report.status, CaseStatus::Skipped);
        assert!(!dir.path().join("case").exists());
    }

    #[tokio::test]
    async fn test_unsupported_backend_is_error_report() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ServerLauncher::new(ServeConfig::default());
        let invoker = EvalInvoker::new(vec!["lm_eval".to_string()], EvalOptions::default()).unwrap();
        let mut tgi = case(None);
        tgi.backend = "tgi".to_string();
        tgi.path = dir.path().to_path_buf();

        let report = run_case(&launcher, &invoker, &tgi, &dir.path().join("case")).await;
        assert_eq!(report.status, CaseStatus::Error);
        assert!(report.message.unwrap().contains("tgi"));
    }
}
