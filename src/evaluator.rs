//! Stage 7 external evaluator bridge.
//!
//! The machine-learning step is a separate program fed with one dataset
//! file and a few numeric parameters. Invocation is a typed argument
//! vector, never a shell string. Everything observable about the child
//! collapses into one raw capture that a pure interpretation step maps
//! to a verdict or a structured error, so the full decision table is
//! testable without spawning anything.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Program executed per evaluation, resolved through PATH when not
    /// absolute.
    pub program: PathBuf,
    /// Arguments placed before the request arguments, e.g. a script path
    /// or `-m package.module`.
    pub leading_args: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            leading_args: Vec::new(),
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    pub dataset_path: PathBuf,
    /// Share of rows held out for validation, strictly inside (0, 1).
    pub validation_ratio: f64,
    /// Largest accepted deviation between repeated run scores.
    pub max_deviation: f64,
    /// Evaluation repetitions, at least 1.
    pub runs: u32,
}

/// Verdict the evaluator prints as a single JSON object on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvaluationOutcome {
    /// Evaluator status code, 0 for an accepted model.
    pub status: i64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Everything captured from one evaluator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvaluatorOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("invalid evaluation request: {0}")]
    InvalidRequest(String),
    #[error("failed to run evaluator {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("evaluator timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("evaluator exited with code {code}; stderr: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("evaluator exited cleanly but wrote nothing to stdout")]
    EmptyOutput,
    #[error("evaluator stdout is not a single JSON verdict: {0}")]
    MalformedOutput(String),
    #[error("evaluator reported an unsuccessful verdict (status {})", .outcome.status)]
    EvaluatorReported { outcome: EvaluationOutcome },
}

/// Positional arguments appended after any leading arguments, in the
/// order the evaluator expects them.
pub fn evaluation_argv(request: &EvaluationRequest) -> Vec<String> {
    vec![
        request.dataset_path.display().to_string(),
        request.validation_ratio.to_string(),
        request.max_deviation.to_string(),
        request.runs.to_string(),
    ]
}

/// Map one raw capture to the verdict. Exit 0 demands a parseable verdict
/// on stdout; a failing exit still surfaces the verdict when the evaluator
/// managed to print one.
pub fn interpret_evaluator_output(
    output: &RawEvaluatorOutput,
) -> Result<EvaluationOutcome, EvaluationError> {
    let stdout = output.stdout.trim();

    if output.exit_code == Some(0) {
        if stdout.is_empty() {
            return Err(EvaluationError::EmptyOutput);
        }
        return match serde_json::from_str::<EvaluationOutcome>(stdout) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(EvaluationError::MalformedOutput(err.to_string())),
        };
    }

    if !stdout.is_empty() {
        if let Ok(outcome) = serde_json::from_str::<EvaluationOutcome>(stdout) {
            return Err(EvaluationError::EvaluatorReported { outcome });
        }
    }

    // Signal-terminated children carry no exit code; report -1.
    Err(EvaluationError::NonZeroExit {
        code: output.exit_code.unwrap_or(-1),
        stderr: output.stderr.trim().to_string(),
    })
}

/// Runner seam mirroring the live subprocess: the closure maps (program,
/// argv) to a raw capture, so tests script the evaluator without spawning.
pub fn run_evaluation_with_runner<F>(
    cfg: &EvaluatorConfig,
    request: &EvaluationRequest,
    runner: F,
) -> Result<EvaluationOutcome, EvaluationError>
where
    F: FnOnce(&Path, &[String]) -> Result<RawEvaluatorOutput, String>,
{
    validate_request(request)?;

    let argv = full_argv(cfg, request);
    let raw = match runner(cfg.program.as_path(), &argv) {
        Ok(raw) => raw,
        Err(message) => {
            return Err(EvaluationError::Spawn {
                program: cfg.program.display().to_string(),
                message,
            })
        }
    };

    interpret_evaluator_output(&raw)
}

/// Run the evaluator as a real subprocess. The child is killed when the
/// deadline elapses or the future is dropped.
pub async fn evaluate_dataset(
    cfg: &EvaluatorConfig,
    request: &EvaluationRequest,
) -> Result<EvaluationOutcome, EvaluationError> {
    use tokio::time::{timeout, Duration};

    validate_request(request)?;

    let argv = full_argv(cfg, request);
    info!(
        component = "evaluator",
        event = "evaluation.start",
        program = %cfg.program.display(),
        dataset = %request.dataset_path.display(),
        runs = request.runs
    );

    let mut command = tokio::process::Command::new(&cfg.program);
    command
        .args(&argv)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return Err(EvaluationError::Spawn {
                program: cfg.program.display().to_string(),
                message: err.to_string(),
            })
        }
    };

    let waited = timeout(Duration::from_millis(cfg.timeout_ms), child.wait_with_output()).await;
    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(EvaluationError::Spawn {
                program: cfg.program.display().to_string(),
                message: err.to_string(),
            })
        }
        Err(_) => {
            warn!(
                component = "evaluator",
                event = "evaluation.timeout",
                program = %cfg.program.display(),
                timeout_ms = cfg.timeout_ms
            );
            return Err(EvaluationError::Timeout {
                timeout_ms: cfg.timeout_ms,
            });
        }
    };

    let raw = RawEvaluatorOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    let result = interpret_evaluator_output(&raw);
    match &result {
        Ok(outcome) => info!(
            component = "evaluator",
            event = "evaluation.finish",
            status = outcome.status,
            score = outcome.score
        ),
        Err(err) => warn!(
            component = "evaluator",
            event = "evaluation.failed",
            error = %err
        ),
    }
    result
}

fn full_argv(cfg: &EvaluatorConfig, request: &EvaluationRequest) -> Vec<String> {
    let mut argv = cfg.leading_args.clone();
    argv.extend(evaluation_argv(request));
    argv
}

fn validate_request(request: &EvaluationRequest) -> Result<(), EvaluationError> {
    if !request.validation_ratio.is_finite()
        || request.validation_ratio <= 0.0
        || request.validation_ratio >= 1.0
    {
        return Err(EvaluationError::InvalidRequest(format!(
            "validation_ratio {} must be strictly between 0 and 1",
            request.validation_ratio
        )));
    }

    if !request.max_deviation.is_finite() || request.max_deviation <= 0.0 {
        return Err(EvaluationError::InvalidRequest(format!(
            "max_deviation {} must be strictly positive",
            request.max_deviation
        )));
    }

    if request.runs == 0 {
        return Err(EvaluationError::InvalidRequest(
            "runs must be at least 1".to_string(),
        ));
    }

    Ok(())
}
