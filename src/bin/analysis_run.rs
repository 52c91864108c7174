use std::path::PathBuf;

use edana::{
    init_logging, log_app_start, logging_config_from_env, parse_context_level, AnalysableOutcome,
    AnalysisOptions, Analyser, AnyAccessAfterEnd, AnyAccessBeforeStart, ByCourse, ContextLevel,
    CourseDropout, DatasetConfig, DatasetManager, Indicator, RangeProcessor, RowSource,
    SingleRange, SiteWide, SqliteActivityStore, Target, WeeklySplit,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("analysis_run", &logging_cfg);

    let store_path = std::env::var("EDANA_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/platform.sqlite"));
    let data_root = std::env::var("EDANA_DATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/analysis"));
    let scope = match std::env::var("EDANA_SCOPE") {
        Ok(raw) => parse_context_level(&raw)?,
        Err(_) => ContextLevel::Course,
    };
    let model_id: i64 = match std::env::var("EDANA_MODEL_ID") {
        Ok(raw) => raw.trim().parse()?,
        Err(_) => 1,
    };
    let reanalyse = std::env::var("EDANA_REANALYSE")
        .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let source: Box<dyn RowSource> = match scope {
        ContextLevel::Course => Box::new(ByCourse),
        ContextLevel::System => Box::new(SiteWide),
    };
    let target: Box<dyn Target> = Box::new(CourseDropout);
    let indicators: Vec<Box<dyn Indicator>> =
        vec![Box::new(AnyAccessBeforeStart), Box::new(AnyAccessAfterEnd)];
    let processors: Vec<Box<dyn RangeProcessor>> =
        vec![Box::new(SingleRange), Box::new(WeeklySplit)];

    let store = SqliteActivityStore::open(&store_path)?;
    let datasets = DatasetManager::open(DatasetConfig {
        data_root: data_root.clone(),
        ..DatasetConfig::default()
    })?;

    println!(
        "Analysis start | model_id={} scope={} store={} data_root={} reanalyse={}",
        model_id,
        scope.as_str(),
        store_path.display(),
        data_root.display(),
        reanalyse
    );

    let mut analyser = Analyser::new(
        model_id,
        source,
        target,
        indicators,
        processors,
        Box::new(store),
        datasets,
    )?;
    let outcomes = analyser.analyse(&AnalysisOptions { reanalyse })?;

    let mut analysed = 0usize;
    for (analysable_id, outcome) in &outcomes {
        match outcome {
            AnalysableOutcome::Analysed { files } => {
                analysed += 1;
                for (processor, artifact) in files {
                    println!(
                        "analysable {} | processor={} rows={} columns={} file={}",
                        analysable_id,
                        processor,
                        artifact.n_rows,
                        artifact.n_columns,
                        artifact.path.display()
                    );
                }
            }
            AnalysableOutcome::InvalidForTarget { reason } => {
                println!("analysable {} | skipped by target: {}", analysable_id, reason);
            }
            AnalysableOutcome::InvalidForRangeProcessors { message } => {
                println!("analysable {} | {}", analysable_id, message);
            }
        }
    }

    println!(
        "Analysis complete | analysables={} analysed={}",
        outcomes.len(),
        analysed
    );
    Ok(())
}
