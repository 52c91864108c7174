//! Edana core crate.
//!
//! Current implemented scope:
//! - Stage 1: platform activity store over SQLite
//! - Stage 2: per-row indicator calculation
//! - Stage 3: prediction target and analysable gating
//! - Stage 4: range processors and dataset matrix assembly
//! - Stage 5: batch analysis orchestration
//! - Stage 6: dataset persistence and run coordination
//! - Stage 7: external evaluator bridge

mod analysable;
mod analyser;
mod dataset;
mod evaluator;
mod indicator;
mod observability;
mod range;
mod store;
mod target;

pub use analysable::{
    parse_context_level, Analysable, Context, ContextLevel, EntityError, RowField, TimeRange,
};
pub use analyser::{
    AnalysableOutcome, AnalysisOptions, Analyser, ByCourse, RequirementsError, RowSource, SiteWide,
    SITE_ANALYSABLE_ID,
};
pub use dataset::{
    artifact_from_record, is_stale, parse_process_status, DatasetArtifact, DatasetConfig,
    DatasetError, DatasetManager, ProcessRecord, ProcessStatus, RunLease,
    DEFAULT_STALE_LEASE_TIMEOUT_SECS,
};
pub use evaluator::{
    evaluate_dataset, evaluation_argv, interpret_evaluator_output, run_evaluation_with_runner,
    EvaluationError, EvaluationOutcome, EvaluationRequest, EvaluatorConfig, RawEvaluatorOutput,
};
pub use indicator::{
    AnyAccessAfterEnd, AnyAccessBeforeStart, Indicator, MAX_FEATURE_VALUE, MIN_FEATURE_VALUE,
};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use range::{
    build_dataset_schema, DatasetColumn, DatasetDType, DatasetRow, DatasetSchema, RangeProcessor,
    SingleRange, WeeklySplit, DATASET_SCHEMA_VERSION, TARGET_COLUMN, WEEK_SECS,
};
pub use store::{ActivityEvent, ActivityStore, SqliteActivityStore, StoreError};
pub use target::{CourseDropout, Target};
