//! Stage 5 batch analysis orchestration.
//!
//! An analyser family ties a row universe to the calculation contracts:
//! every analysable resolves to a status instead of aborting the batch,
//! and each (analysable, processor) pair walks the
//! freshness -> lease -> calculate -> store -> close sequence.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysable::{Analysable, Context, ContextLevel, RowField};
use crate::dataset::{DatasetArtifact, DatasetError, DatasetManager, RunLease};
use crate::indicator::Indicator;
use crate::range::RangeProcessor;
use crate::store::{ActivityStore, StoreError};
use crate::target::Target;

pub const SITE_ANALYSABLE_ID: i64 = 0;

/// An analyser family: the analysable universe, the rows scored per
/// analysable, and the per-row metadata available to indicators.
pub trait RowSource {
    fn codename(&self) -> &'static str;

    /// Context level the analysis runs at; gates indicator applicability.
    fn scope(&self) -> ContextLevel;

    /// Per-row metadata fields this family supplies. Checked against every
    /// configured indicator's requirements at assembly.
    fn rows_info(&self) -> &'static [RowField];

    fn analysables(&self, data: &dyn ActivityStore) -> Result<Vec<Analysable>, StoreError>;

    fn rows(
        &self,
        analysable: &Analysable,
        data: &dyn ActivityStore,
    ) -> Result<Vec<i64>, StoreError>;
}

/// Course-scope family: one analysable per course, rows are the enrolled
/// users.
pub struct ByCourse;

impl RowSource for ByCourse {
    fn codename(&self) -> &'static str {
        "by_course"
    }

    fn scope(&self) -> ContextLevel {
        ContextLevel::Course
    }

    fn rows_info(&self) -> &'static [RowField] {
        &[
            RowField::Id,
            RowField::Context,
            RowField::StartTime,
            RowField::EndTime,
        ]
    }

    fn analysables(&self, data: &dyn ActivityStore) -> Result<Vec<Analysable>, StoreError> {
        data.courses()
    }

    fn rows(
        &self,
        analysable: &Analysable,
        data: &dyn ActivityStore,
    ) -> Result<Vec<i64>, StoreError> {
        data.enrolled_users(analysable.id)
    }
}

/// Site-scope family: a single synthetic analysable spanning the recorded
/// activity, rows are every known user. Supplies no per-row course
/// timeline, so timeline-dependent indicators cannot assemble here.
pub struct SiteWide;

impl RowSource for SiteWide {
    fn codename(&self) -> &'static str {
        "site_wide"
    }

    fn scope(&self) -> ContextLevel {
        ContextLevel::System
    }

    fn rows_info(&self) -> &'static [RowField] {
        &[RowField::Id, RowField::Context]
    }

    fn analysables(&self, data: &dyn ActivityStore) -> Result<Vec<Analysable>, StoreError> {
        Ok(match data.activity_bounds()? {
            // Pad the end so the last recorded event falls inside the
            // final half-open range.
            Some((min_ts, max_ts)) => vec![Analysable {
                id: SITE_ANALYSABLE_ID,
                context: Context::system(),
                start_ts_utc: Some(min_ts),
                end_ts_utc: Some(max_ts + 1),
            }],
            None => Vec::new(),
        })
    }

    fn rows(
        &self,
        _analysable: &Analysable,
        data: &dyn ActivityStore,
    ) -> Result<Vec<i64>, StoreError> {
        data.all_user_ids()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("indicator {indicator} requires {field} which is not provided by {family}")]
pub struct RequirementsError {
    pub indicator: &'static str,
    pub field: &'static str,
    pub family: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalysisOptions {
    /// Recompute every range even when a fresh artifact exists.
    pub reanalyse: bool,
}

/// Business outcome per analysable. Problems below this level degrade to
/// logged skips inside the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysableOutcome {
    /// At least one processor produced or reused a dataset file, keyed by
    /// processor codename.
    Analysed {
        files: BTreeMap<String, DatasetArtifact>,
    },
    /// The target refused the analysable before any calculation.
    InvalidForTarget { reason: String },
    /// Valid for the target, but no processor produced a file.
    InvalidForRangeProcessors { message: String },
}

pub struct Analyser {
    model_id: i64,
    source: Box<dyn RowSource>,
    target: Box<dyn Target>,
    indicators: Vec<Box<dyn Indicator>>,
    processors: Vec<Box<dyn RangeProcessor>>,
    data: Box<dyn ActivityStore>,
    datasets: DatasetManager,
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("model_id", &self.model_id)
            .field("source", &self.source.codename())
            .field("target", &self.target.codename())
            .field(
                "indicators",
                &self
                    .indicators
                    .iter()
                    .map(|i| i.codename())
                    .collect::<Vec<_>>(),
            )
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|p| p.codename())
                    .collect::<Vec<_>>(),
            )
            .field("datasets", &self.datasets)
            .finish_non_exhaustive()
    }
}

impl Analyser {
    /// Assemble the pipeline. Fails before touching any analysable when an
    /// indicator requirement is not provided by the family.
    pub fn new(
        model_id: i64,
        source: Box<dyn RowSource>,
        target: Box<dyn Target>,
        indicators: Vec<Box<dyn Indicator>>,
        processors: Vec<Box<dyn RangeProcessor>>,
        data: Box<dyn ActivityStore>,
        datasets: DatasetManager,
    ) -> Result<Self, RequirementsError> {
        check_indicator_requirements(source.as_ref(), &indicators)?;
        Ok(Self {
            model_id,
            source,
            target,
            indicators,
            processors,
            data,
            datasets,
        })
    }

    pub fn model_id(&self) -> i64 {
        self.model_id
    }

    pub fn datasets(&self) -> &DatasetManager {
        &self.datasets
    }

    /// Process every analysable in the family's universe. One analysable's
    /// problems never abort the others; only enumerating the universe
    /// itself can fail.
    pub fn analyse(
        &mut self,
        options: &AnalysisOptions,
    ) -> Result<BTreeMap<i64, AnalysableOutcome>, StoreError> {
        let analysables = self.source.analysables(self.data.as_ref())?;
        info!(
            component = "analyser",
            event = "analysis.batch.start",
            model_id = self.model_id,
            family = self.source.codename(),
            analysables = analysables.len(),
            reanalyse = options.reanalyse
        );

        let mut outcomes = BTreeMap::new();
        for analysable in &analysables {
            let outcome = self.process_analysable(analysable, options);
            outcomes.insert(analysable.id, outcome);
        }

        info!(
            component = "analyser",
            event = "analysis.batch.finish",
            model_id = self.model_id,
            analysables = outcomes.len()
        );
        Ok(outcomes)
    }

    /// Resolve one analysable to its outcome. Target gate first, then every
    /// configured processor in order.
    pub fn process_analysable(
        &mut self,
        analysable: &Analysable,
        options: &AnalysisOptions,
    ) -> AnalysableOutcome {
        if let Err(reason) = self.target.check_analysable(analysable) {
            info!(
                component = "analyser",
                event = "analysis.invalid_for_target",
                model_id = self.model_id,
                analysable_id = analysable.id,
                reason = %reason
            );
            return AnalysableOutcome::InvalidForTarget { reason };
        }

        let now_ts_utc = Utc::now().timestamp();
        let mut files = BTreeMap::new();
        for processor_index in 0..self.processors.len() {
            let codename = self.processors[processor_index].codename();
            if let Some(artifact) =
                self.process_range(processor_index, analysable, now_ts_utc, options)
            {
                files.insert(codename.to_string(), artifact);
            }
        }

        if files.is_empty() {
            info!(
                component = "analyser",
                event = "analysis.invalid_for_rangeprocessors",
                model_id = self.model_id,
                analysable_id = analysable.id
            );
            return AnalysableOutcome::InvalidForRangeProcessors {
                message: "analysable not valid for any of the range processors".to_string(),
            };
        }

        AnalysableOutcome::Analysed { files }
    }

    fn process_range(
        &mut self,
        processor_index: usize,
        analysable: &Analysable,
        now_ts_utc: i64,
        options: &AnalysisOptions,
    ) -> Option<DatasetArtifact> {
        let codename = self.processors[processor_index].codename();

        if !self.processors[processor_index].is_valid_analysable(analysable) {
            info!(
                component = "analyser",
                event = "analysis.range.invalid",
                model_id = self.model_id,
                analysable_id = analysable.id,
                processor = codename
            );
            return None;
        }

        if !options.reanalyse {
            match self
                .datasets
                .fresh_artifact(self.model_id, analysable.id, codename, now_ts_utc)
            {
                Ok(Some(artifact)) => {
                    info!(
                        component = "analyser",
                        event = "analysis.range.cache_hit",
                        model_id = self.model_id,
                        analysable_id = analysable.id,
                        processor = codename,
                        fingerprint = %artifact.fingerprint
                    );
                    return Some(artifact);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        component = "analyser",
                        event = "analysis.range.cache_error",
                        model_id = self.model_id,
                        analysable_id = analysable.id,
                        processor = codename,
                        error = %err,
                        "freshness lookup failed; recomputing"
                    );
                }
            }
        }

        let rows = match self.source.rows(analysable, self.data.as_ref()) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    component = "analyser",
                    event = "analysis.range.rows_error",
                    model_id = self.model_id,
                    analysable_id = analysable.id,
                    processor = codename,
                    error = %err,
                    "row enumeration failed; skipping processor"
                );
                return None;
            }
        };

        let lease = match self
            .datasets
            .init_process(self.model_id, analysable.id, codename, now_ts_utc)
        {
            Ok(lease) => lease,
            Err(DatasetError::AlreadyRunning {
                run_id,
                time_started_ts_utc,
            }) => {
                info!(
                    component = "analyser",
                    event = "analysis.range.lease_held",
                    model_id = self.model_id,
                    analysable_id = analysable.id,
                    processor = codename,
                    run_id,
                    time_started_ts_utc
                );
                return None;
            }
            Err(err) => {
                warn!(
                    component = "analyser",
                    event = "analysis.range.lease_error",
                    model_id = self.model_id,
                    analysable_id = analysable.id,
                    processor = codename,
                    error = %err,
                    "could not start run; skipping processor"
                );
                return None;
            }
        };

        let applicable = applicable_indicators(&self.indicators, self.source.scope());
        let matrix = self.processors[processor_index].calculate(
            analysable,
            &rows,
            self.target.as_ref(),
            &applicable,
            self.data.as_ref(),
        );

        let (schema, dataset_rows) = match matrix {
            Some(matrix) => matrix,
            None => {
                self.release_lease(&lease, now_ts_utc);
                info!(
                    component = "analyser",
                    event = "analysis.range.no_data",
                    model_id = self.model_id,
                    analysable_id = analysable.id,
                    processor = codename
                );
                return None;
            }
        };

        let artifact = match self.datasets.store(&lease, &schema, &dataset_rows) {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(
                    component = "analyser",
                    event = "analysis.range.store_error",
                    model_id = self.model_id,
                    analysable_id = analysable.id,
                    processor = codename,
                    error = %err,
                    "artifact write failed; abandoning run"
                );
                self.release_lease(&lease, now_ts_utc);
                return None;
            }
        };

        if let Err(err) = self.datasets.close_process(&lease, &artifact, now_ts_utc) {
            warn!(
                component = "analyser",
                event = "analysis.range.close_error",
                model_id = self.model_id,
                analysable_id = analysable.id,
                processor = codename,
                run_id = lease.run_id,
                error = %err,
                "run record not closed; artifact kept"
            );
            return None;
        }

        info!(
            component = "analyser",
            event = "analysis.range.stored",
            model_id = self.model_id,
            analysable_id = analysable.id,
            processor = codename,
            run_id = lease.run_id,
            path = %artifact.path.display(),
            n_rows = artifact.n_rows,
            n_columns = artifact.n_columns
        );
        Some(artifact)
    }

    fn release_lease(&mut self, lease: &RunLease, now_ts_utc: i64) {
        if let Err(err) = self.datasets.abandon_process(lease, now_ts_utc) {
            warn!(
                component = "analyser",
                event = "analysis.lease.release_error",
                run_id = lease.run_id,
                error = %err,
                "could not abandon run record"
            );
        }
    }
}

fn check_indicator_requirements(
    source: &dyn RowSource,
    indicators: &[Box<dyn Indicator>],
) -> Result<(), RequirementsError> {
    let provided = source.rows_info();
    for indicator in indicators {
        for field in indicator.requirements() {
            if !provided.contains(field) {
                return Err(RequirementsError {
                    indicator: indicator.codename(),
                    field: field.as_str(),
                    family: source.codename(),
                });
            }
        }
    }
    Ok(())
}

fn applicable_indicators(
    indicators: &[Box<dyn Indicator>],
    scope: ContextLevel,
) -> Vec<&dyn Indicator> {
    let mut applicable = Vec::with_capacity(indicators.len());
    for indicator in indicators {
        if indicator.min_context_depth().depth() <= scope.depth() {
            applicable.push(indicator.as_ref());
        } else {
            debug!(
                component = "analyser",
                event = "analysis.indicator.filtered",
                codename = indicator.codename(),
                min_depth = indicator.min_context_depth().as_str(),
                scope = scope.as_str()
            );
        }
    }
    applicable
}
