use std::path::PathBuf;

use edana::{
    evaluate_dataset, init_logging, log_app_start, logging_config_from_env, EvaluationRequest,
    EvaluatorConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("dataset_evaluate", &logging_cfg);

    let dataset_path = match std::env::args().nth(1) {
        Some(raw) => PathBuf::from(raw),
        None => return Err("usage: dataset_evaluate <dataset.csv>".into()),
    };

    let mut cfg = EvaluatorConfig::default();
    if let Ok(program) = std::env::var("EDANA_EVALUATOR_PROGRAM") {
        cfg.program = PathBuf::from(program);
    }
    if let Ok(args) = std::env::var("EDANA_EVALUATOR_ARGS") {
        cfg.leading_args = args.split_whitespace().map(str::to_string).collect();
    }
    if let Ok(timeout) = std::env::var("EDANA_EVALUATOR_TIMEOUT_MS") {
        cfg.timeout_ms = timeout.trim().parse()?;
    }

    let request = EvaluationRequest {
        dataset_path,
        validation_ratio: env_f64("EDANA_VALIDATION_RATIO", 0.3)?,
        max_deviation: env_f64("EDANA_MAX_DEVIATION", 0.02)?,
        runs: env_u32("EDANA_EVALUATION_RUNS", 100)?,
    };

    println!(
        "Evaluation start | program={} dataset={} runs={}",
        cfg.program.display(),
        request.dataset_path.display(),
        request.runs
    );

    let outcome = evaluate_dataset(&cfg, &request).await?;
    match outcome.score {
        Some(score) => println!(
            "Evaluation verdict | status={} score={}",
            outcome.status, score
        ),
        None => println!("Evaluation verdict | status={}", outcome.status),
    }
    for message in &outcome.errors {
        println!("evaluator message | {}", message);
    }

    Ok(())
}

fn env_f64(key: &str, default: f64) -> Result<f64, Box<dyn std::error::Error>> {
    match std::env::var(key) {
        Ok(raw) => Ok(raw.trim().parse()?),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, Box<dyn std::error::Error>> {
    match std::env::var(key) {
        Ok(raw) => Ok(raw.trim().parse()?),
        Err(_) => Ok(default),
    }
}
