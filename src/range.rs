//! Stage 4 range processors and the dataset matrix calculation.
//!
//! A range processor turns one analysable timeline into ordered calculation
//! windows and assembles the row-by-column feature matrix: one row per
//! subject, one column per (range, indicator), target label last.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::analysable::{Analysable, TimeRange};
use crate::indicator::Indicator;
use crate::store::ActivityStore;
use crate::target::Target;

pub const DATASET_SCHEMA_VERSION: u32 = 1;
pub const WEEK_SECS: i64 = 7 * 24 * 60 * 60;

pub const TARGET_COLUMN: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetColumn {
    pub name: String,
    pub dtype: DatasetDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<DatasetColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub row_id: i64,
    pub values: Vec<f64>,
}

pub trait RangeProcessor {
    /// Stable machine name; keys process records and artifact paths.
    fn codename(&self) -> &'static str;

    /// Whether the analysable's timeline supports this processor at all.
    fn is_valid_analysable(&self, analysable: &Analysable) -> bool;

    /// Ordered, non-overlapping calculation windows. Empty when the
    /// analysable is not valid for this processor.
    fn ranges(&self, analysable: &Analysable) -> Vec<TimeRange>;

    /// Matrix assembly shared by every processor. `None` means no usable
    /// data: nothing to persist, nothing went wrong.
    fn calculate(
        &self,
        analysable: &Analysable,
        rows: &[i64],
        target: &dyn Target,
        indicators: &[&dyn Indicator],
        data: &dyn ActivityStore,
    ) -> Option<(DatasetSchema, Vec<DatasetRow>)> {
        let ranges = self.ranges(analysable);
        if rows.is_empty() || ranges.is_empty() || indicators.is_empty() {
            info!(
                component = "range",
                event = "range.no_data",
                processor = self.codename(),
                analysable_id = analysable.id,
                rows = rows.len(),
                ranges = ranges.len(),
                indicators = indicators.len()
            );
            return None;
        }

        let schema = build_dataset_schema(self.codename(), &ranges, indicators);
        info!(
            component = "range",
            event = "range.calculate.start",
            processor = self.codename(),
            analysable_id = analysable.id,
            rows = rows.len(),
            ranges = ranges.len(),
            columns = schema.columns.len()
        );

        let mut output_rows = Vec::with_capacity(rows.len());
        for &row_id in rows {
            let mut values = Vec::with_capacity(schema.columns.len());
            for range in &ranges {
                for indicator in indicators {
                    let raw = indicator.calculate_row(row_id, analysable, data, range);
                    values.push(bounded_feature(
                        raw,
                        indicator.min_value(),
                        indicator.max_value(),
                    ));
                }
            }
            let label = target.calculate_row(row_id, analysable, data);
            values.push(bounded_feature(
                label,
                target.min_value(),
                target.max_value(),
            ));
            output_rows.push(DatasetRow { row_id, values });
        }

        info!(
            component = "range",
            event = "range.calculate.finish",
            processor = self.codename(),
            analysable_id = analysable.id,
            output_rows = output_rows.len()
        );

        Some((schema, output_rows))
    }
}

/// One range spanning the whole analysable timeline.
pub struct SingleRange;

impl RangeProcessor for SingleRange {
    fn codename(&self) -> &'static str {
        "single_range"
    }

    fn is_valid_analysable(&self, analysable: &Analysable) -> bool {
        analysable.timeline().is_some()
    }

    fn ranges(&self, analysable: &Analysable) -> Vec<TimeRange> {
        match analysable.timeline() {
            Some((start, end)) => vec![TimeRange {
                start_ts_utc: start,
                end_ts_utc_exclusive: end,
            }],
            None => Vec::new(),
        }
    }
}

/// Consecutive whole-week windows across the analysable timeline. A
/// trailing partial week is dropped; timelines shorter than one week are
/// not valid for this processor.
pub struct WeeklySplit;

impl RangeProcessor for WeeklySplit {
    fn codename(&self) -> &'static str {
        "weekly"
    }

    fn is_valid_analysable(&self, analysable: &Analysable) -> bool {
        matches!(analysable.timeline(), Some((start, end)) if end - start >= WEEK_SECS)
    }

    fn ranges(&self, analysable: &Analysable) -> Vec<TimeRange> {
        let (start, end) = match analysable.timeline() {
            Some(timeline) => timeline,
            None => return Vec::new(),
        };

        let weeks = (end - start) / WEEK_SECS;
        (0..weeks)
            .map(|week| TimeRange {
                start_ts_utc: start + week * WEEK_SECS,
                end_ts_utc_exclusive: start + (week + 1) * WEEK_SECS,
            })
            .collect()
    }
}

pub fn build_dataset_schema(
    processor_codename: &str,
    ranges: &[TimeRange],
    indicators: &[&dyn Indicator],
) -> DatasetSchema {
    let mut columns = Vec::with_capacity(ranges.len() * indicators.len() + 1);
    for range_index in 0..ranges.len() {
        for indicator in indicators {
            columns.push(DatasetColumn {
                name: format!("{}_r{range_index}", indicator.codename()),
                dtype: DatasetDType::F64,
            });
        }
    }
    columns.push(DatasetColumn {
        name: TARGET_COLUMN.to_string(),
        dtype: DatasetDType::F64,
    });

    let fingerprint = schema_fingerprint(processor_codename, ranges, &columns);

    info!(
        component = "range",
        event = "dataset.schema.built",
        version = DATASET_SCHEMA_VERSION,
        processor = processor_codename,
        ranges = ranges.len(),
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    DatasetSchema {
        version: DATASET_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

fn schema_fingerprint(
    processor_codename: &str,
    ranges: &[TimeRange],
    columns: &[DatasetColumn],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{DATASET_SCHEMA_VERSION};"));
    hasher.update(format!("processor:{processor_codename};"));
    hasher.update("ranges:");
    for range in ranges {
        hasher.update(format!(
            "{}..{},",
            range.start_ts_utc, range.end_ts_utc_exclusive
        ));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

fn bounded_feature(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return min;
    }
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysable::{Context, ContextLevel, RowField};
    use crate::store::{ActivityEvent, SqliteActivityStore};
    use tempfile::NamedTempFile;

    struct ActivityInRange;

    impl Indicator for ActivityInRange {
        fn codename(&self) -> &'static str {
            "activity_in_range"
        }

        fn requirements(&self) -> &'static [RowField] {
            &[RowField::Context]
        }

        fn calculate_row(
            &self,
            row_id: i64,
            analysable: &Analysable,
            data: &dyn ActivityStore,
            range: &TimeRange,
        ) -> f64 {
            match data.has_activity(
                row_id,
                analysable.context,
                Some(range.start_ts_utc),
                Some(range.end_ts_utc_exclusive),
            ) {
                Ok(true) => self.max_value(),
                _ => self.min_value(),
            }
        }
    }

    struct WildIndicator;

    impl Indicator for WildIndicator {
        fn codename(&self) -> &'static str {
            "wild"
        }

        fn requirements(&self) -> &'static [RowField] {
            &[RowField::Id]
        }

        fn calculate_row(
            &self,
            _row_id: i64,
            _analysable: &Analysable,
            _data: &dyn ActivityStore,
            _range: &TimeRange,
        ) -> f64 {
            5.0
        }
    }

    struct ZeroTarget;

    impl Target for ZeroTarget {
        fn codename(&self) -> &'static str {
            "zero"
        }

        fn check_analysable(&self, _analysable: &Analysable) -> Result<(), String> {
            Ok(())
        }

        fn calculate_row(
            &self,
            _row_id: i64,
            _analysable: &Analysable,
            _data: &dyn ActivityStore,
        ) -> f64 {
            0.0
        }
    }

    fn course(start: i64, end: i64) -> Analysable {
        Analysable {
            id: 3,
            context: Context::course(3),
            start_ts_utc: Some(start),
            end_ts_utc: Some(end),
        }
    }

    fn open_course() -> Analysable {
        Analysable {
            id: 3,
            context: Context::course(3),
            start_ts_utc: Some(1_000),
            end_ts_utc: None,
        }
    }

    #[test]
    fn single_range_spans_the_timeline() {
        let analysable = course(1_000, 5_000);
        assert!(SingleRange.is_valid_analysable(&analysable));
        assert_eq!(
            SingleRange.ranges(&analysable),
            vec![TimeRange {
                start_ts_utc: 1_000,
                end_ts_utc_exclusive: 5_000,
            }]
        );

        assert!(!SingleRange.is_valid_analysable(&open_course()));
        assert!(SingleRange.ranges(&open_course()).is_empty());
    }

    #[test]
    fn weekly_needs_at_least_one_whole_week() {
        let short = course(0, WEEK_SECS - 1);
        assert!(!WeeklySplit.is_valid_analysable(&short));
        assert!(WeeklySplit.ranges(&short).is_empty());

        let exact = course(0, WEEK_SECS);
        assert!(WeeklySplit.is_valid_analysable(&exact));
        assert_eq!(WeeklySplit.ranges(&exact).len(), 1);
    }

    #[test]
    fn weekly_drops_the_partial_tail() {
        let start = 1_000;
        // 3 whole weeks plus one day.
        let end = start + 3 * WEEK_SECS + 86_400;
        let ranges = WeeklySplit.ranges(&course(start, end));

        assert_eq!(ranges.len(), 3);
        for (week, range) in ranges.iter().enumerate() {
            assert_eq!(range.start_ts_utc, start + week as i64 * WEEK_SECS);
            assert_eq!(range.duration_secs(), WEEK_SECS);
        }
        assert_eq!(ranges[2].end_ts_utc_exclusive, start + 3 * WEEK_SECS);
    }

    #[test]
    fn schema_orders_columns_range_major_with_target_last() {
        let indicators: [&dyn Indicator; 2] = [&ActivityInRange, &WildIndicator];
        let ranges = WeeklySplit.ranges(&course(0, 2 * WEEK_SECS));
        let schema = build_dataset_schema("weekly", &ranges, &indicators);

        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "activity_in_range_r0",
                "wild_r0",
                "activity_in_range_r1",
                "wild_r1",
                "target",
            ]
        );
        assert_eq!(schema.version, DATASET_SCHEMA_VERSION);
    }

    #[test]
    fn schema_names_and_fingerprint_match_their_patterns() {
        use regex::Regex;

        let re_column = Regex::new(r"^[a-z][a-z0-9_]*_r\d+$").unwrap();
        let re_fingerprint = Regex::new(r"^[0-9a-f]{64}$").unwrap();

        let indicators: [&dyn Indicator; 2] = [&ActivityInRange, &WildIndicator];
        for weeks in 1..=4 {
            let ranges = WeeklySplit.ranges(&course(0, weeks * WEEK_SECS));
            let schema = build_dataset_schema("weekly", &ranges, &indicators);

            assert!(re_fingerprint.is_match(&schema.fingerprint));
            let (target, features) = schema.columns.split_last().unwrap();
            assert_eq!(target.name, TARGET_COLUMN);
            for column in features {
                assert!(re_column.is_match(&column.name), "column {}", column.name);
            }
        }
    }

    #[test]
    fn schema_fingerprint_is_stable_and_range_sensitive() {
        let indicators: [&dyn Indicator; 1] = [&ActivityInRange];
        let two_weeks = WeeklySplit.ranges(&course(0, 2 * WEEK_SECS));

        let a = build_dataset_schema("weekly", &two_weeks, &indicators);
        let b = build_dataset_schema("weekly", &two_weeks, &indicators);
        assert_eq!(a.fingerprint, b.fingerprint);

        let shifted = WeeklySplit.ranges(&course(100, 100 + 2 * WEEK_SECS));
        let c = build_dataset_schema("weekly", &shifted, &indicators);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn calculate_builds_the_full_matrix_with_bounded_values() {
        let file = NamedTempFile::new().unwrap();
        let mut store = SqliteActivityStore::open(file.path()).unwrap();
        let analysable = course(0, 2 * WEEK_SECS);

        // User 21 active in week 1 only, user 22 in week 2 only.
        store
            .record_activity_batch(&[
                ActivityEvent {
                    user_id: 21,
                    context: Context::course(3),
                    ts_utc: 100,
                },
                ActivityEvent {
                    user_id: 22,
                    context: Context::course(3),
                    ts_utc: WEEK_SECS + 100,
                },
            ])
            .unwrap();

        let indicators: [&dyn Indicator; 2] = [&ActivityInRange, &WildIndicator];
        let (schema, rows) = WeeklySplit
            .calculate(&analysable, &[21, 22], &ZeroTarget, &indicators, &store)
            .expect("matrix");

        assert_eq!(schema.columns.len(), 5);
        assert_eq!(rows.len(), 2);

        // activity_in_range_r0, wild_r0, activity_in_range_r1, wild_r1, target
        assert_eq!(rows[0].row_id, 21);
        assert_eq!(rows[0].values, vec![1.0, 1.0, -1.0, 1.0, 0.0]);
        assert_eq!(rows[1].row_id, 22);
        assert_eq!(rows[1].values, vec![-1.0, 1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn calculate_returns_none_without_rows_or_indicators() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteActivityStore::open(file.path()).unwrap();
        let analysable = course(0, 2 * WEEK_SECS);
        let indicators: [&dyn Indicator; 1] = [&ActivityInRange];

        assert!(WeeklySplit
            .calculate(&analysable, &[], &ZeroTarget, &indicators, &store)
            .is_none());
        assert!(WeeklySplit
            .calculate(&analysable, &[21], &ZeroTarget, &[], &store)
            .is_none());
        assert!(WeeklySplit
            .calculate(&open_course(), &[21], &ZeroTarget, &indicators, &store)
            .is_none());
    }

    #[test]
    fn non_finite_and_out_of_bounds_values_are_bounded() {
        assert_eq!(bounded_feature(5.0, -1.0, 1.0), 1.0);
        assert_eq!(bounded_feature(-5.0, -1.0, 1.0), -1.0);
        assert_eq!(bounded_feature(0.25, -1.0, 1.0), 0.25);
        assert_eq!(bounded_feature(f64::NAN, -1.0, 1.0), -1.0);
        assert_eq!(bounded_feature(f64::INFINITY, -1.0, 1.0), -1.0);
    }

    #[test]
    fn min_context_depth_default_reaches_every_scope() {
        assert_eq!(ActivityInRange.min_context_depth(), ContextLevel::System);
    }
}
