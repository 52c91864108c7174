//! Stage 2 indicator calculation contract and the shipped access indicators.
//!
//! An indicator is a pure per-row calculator producing one bounded feature
//! value per (row, range). `calculate_row` is total: a missing underlying
//! fact or a store failure degrades to the indicator minimum instead of
//! failing the batch.

use tracing::warn;

use crate::analysable::{Analysable, ContextLevel, RowField, TimeRange};
use crate::store::ActivityStore;

pub const MIN_FEATURE_VALUE: f64 = -1.0;
pub const MAX_FEATURE_VALUE: f64 = 1.0;

pub trait Indicator {
    /// Stable machine name; becomes part of dataset column names.
    fn codename(&self) -> &'static str;

    /// Row metadata fields this indicator needs from the row source.
    /// Checked against the source once at analyser assembly.
    fn requirements(&self) -> &'static [RowField];

    /// Shallowest context the indicator is meaningful at. Scopes deeper
    /// than or equal to this participate; shallower scopes filter the
    /// indicator out of the schema.
    fn min_context_depth(&self) -> ContextLevel {
        ContextLevel::System
    }

    fn min_value(&self) -> f64 {
        MIN_FEATURE_VALUE
    }

    fn max_value(&self) -> f64 {
        MAX_FEATURE_VALUE
    }

    /// Feature value for one row in one range, within
    /// `[min_value, max_value]`. The minimum doubles as the missing-data
    /// sentinel.
    fn calculate_row(
        &self,
        row_id: i64,
        analysable: &Analysable,
        data: &dyn ActivityStore,
        range: &TimeRange,
    ) -> f64;
}

/// Whether the row's user touched the analysable's context at any point
/// strictly before the analysable starts.
pub struct AnyAccessBeforeStart;

impl Indicator for AnyAccessBeforeStart {
    fn codename(&self) -> &'static str {
        "any_access_before_start"
    }

    fn requirements(&self) -> &'static [RowField] {
        &[RowField::Context, RowField::StartTime]
    }

    fn calculate_row(
        &self,
        row_id: i64,
        analysable: &Analysable,
        data: &dyn ActivityStore,
        _range: &TimeRange,
    ) -> f64 {
        let start = match analysable.start_ts_utc {
            Some(start) => start,
            None => return self.min_value(),
        };

        activity_presence(self, row_id, analysable, data, None, Some(start))
    }
}

/// Whether the row's user touched the analysable's context at or after the
/// analysable ends.
pub struct AnyAccessAfterEnd;

impl Indicator for AnyAccessAfterEnd {
    fn codename(&self) -> &'static str {
        "any_access_after_end"
    }

    fn requirements(&self) -> &'static [RowField] {
        &[RowField::Context, RowField::EndTime]
    }

    fn calculate_row(
        &self,
        row_id: i64,
        analysable: &Analysable,
        data: &dyn ActivityStore,
        _range: &TimeRange,
    ) -> f64 {
        let end = match analysable.end_ts_utc {
            Some(end) => end,
            None => return self.min_value(),
        };

        activity_presence(self, row_id, analysable, data, Some(end), None)
    }
}

fn activity_presence(
    indicator: &dyn Indicator,
    row_id: i64,
    analysable: &Analysable,
    data: &dyn ActivityStore,
    from_ts_utc: Option<i64>,
    to_ts_utc_exclusive: Option<i64>,
) -> f64 {
    match data.has_activity(row_id, analysable.context, from_ts_utc, to_ts_utc_exclusive) {
        Ok(true) => indicator.max_value(),
        Ok(false) => indicator.min_value(),
        Err(err) => {
            warn!(
                component = "indicator",
                event = "indicator.store_error",
                codename = indicator.codename(),
                row_id,
                analysable_id = analysable.id,
                error = %err,
                "store query failed; degrading to indicator minimum"
            );
            indicator.min_value()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysable::Context;
    use crate::store::{ActivityEvent, StoreError};

    struct MemoryStore {
        events: Vec<ActivityEvent>,
    }

    impl ActivityStore for MemoryStore {
        fn courses(&self) -> Result<Vec<Analysable>, StoreError> {
            Ok(Vec::new())
        }

        fn enrolled_users(&self, _course_id: i64) -> Result<Vec<i64>, StoreError> {
            Ok(Vec::new())
        }

        fn all_user_ids(&self) -> Result<Vec<i64>, StoreError> {
            Ok(Vec::new())
        }

        fn activity_bounds(&self) -> Result<Option<(i64, i64)>, StoreError> {
            Ok(None)
        }

        fn has_activity(
            &self,
            user_id: i64,
            context: Context,
            from_ts_utc: Option<i64>,
            to_ts_utc_exclusive: Option<i64>,
        ) -> Result<bool, StoreError> {
            Ok(self.events.iter().any(|event| {
                event.user_id == user_id
                    && match context.level {
                        ContextLevel::System => true,
                        ContextLevel::Course => event.context == context,
                    }
                    && from_ts_utc.map_or(true, |from| event.ts_utc >= from)
                    && to_ts_utc_exclusive.map_or(true, |to| event.ts_utc < to)
            }))
        }
    }

    struct FailingStore;

    impl ActivityStore for FailingStore {
        fn courses(&self) -> Result<Vec<Analysable>, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }

        fn enrolled_users(&self, _course_id: i64) -> Result<Vec<i64>, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }

        fn all_user_ids(&self) -> Result<Vec<i64>, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }

        fn activity_bounds(&self) -> Result<Option<(i64, i64)>, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }

        fn has_activity(
            &self,
            _user_id: i64,
            _context: Context,
            _from_ts_utc: Option<i64>,
            _to_ts_utc_exclusive: Option<i64>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }
    }

    fn course(start: Option<i64>, end: Option<i64>) -> Analysable {
        Analysable {
            id: 5,
            context: Context::course(5),
            start_ts_utc: start,
            end_ts_utc: end,
        }
    }

    fn any_range() -> TimeRange {
        TimeRange {
            start_ts_utc: 0,
            end_ts_utc_exclusive: 1,
        }
    }

    #[test]
    fn before_start_is_max_only_for_pre_start_activity() {
        let store = MemoryStore {
            events: vec![
                ActivityEvent {
                    user_id: 1,
                    context: Context::course(5),
                    ts_utc: 900,
                },
                ActivityEvent {
                    user_id: 2,
                    context: Context::course(5),
                    ts_utc: 1_000,
                },
            ],
        };
        let analysable = course(Some(1_000), Some(2_000));
        let indicator = AnyAccessBeforeStart;

        let early = indicator.calculate_row(1, &analysable, &store, &any_range());
        assert_eq!(early, indicator.max_value());

        // Activity exactly at start is not "before start".
        let at_start = indicator.calculate_row(2, &analysable, &store, &any_range());
        assert_eq!(at_start, indicator.min_value());
    }

    #[test]
    fn after_end_includes_activity_exactly_at_end() {
        let store = MemoryStore {
            events: vec![
                ActivityEvent {
                    user_id: 1,
                    context: Context::course(5),
                    ts_utc: 2_000,
                },
                ActivityEvent {
                    user_id: 2,
                    context: Context::course(5),
                    ts_utc: 1_999,
                },
            ],
        };
        let analysable = course(Some(1_000), Some(2_000));
        let indicator = AnyAccessAfterEnd;

        let at_end = indicator.calculate_row(1, &analysable, &store, &any_range());
        assert_eq!(at_end, indicator.max_value());

        let inside = indicator.calculate_row(2, &analysable, &store, &any_range());
        assert_eq!(inside, indicator.min_value());
    }

    #[test]
    fn missing_timeline_metadata_degrades_to_minimum() {
        let store = MemoryStore { events: Vec::new() };

        let no_start = course(None, Some(2_000));
        let value = AnyAccessBeforeStart.calculate_row(1, &no_start, &store, &any_range());
        assert_eq!(value, MIN_FEATURE_VALUE);

        let no_end = course(Some(1_000), None);
        let value = AnyAccessAfterEnd.calculate_row(1, &no_end, &store, &any_range());
        assert_eq!(value, MIN_FEATURE_VALUE);
    }

    #[test]
    fn store_errors_degrade_to_minimum_without_panicking() {
        let analysable = course(Some(1_000), Some(2_000));

        let value = AnyAccessBeforeStart.calculate_row(1, &analysable, &FailingStore, &any_range());
        assert_eq!(value, MIN_FEATURE_VALUE);

        let value = AnyAccessAfterEnd.calculate_row(1, &analysable, &FailingStore, &any_range());
        assert_eq!(value, MIN_FEATURE_VALUE);
    }

    #[test]
    fn codenames_and_requirements_are_stable() {
        assert_eq!(AnyAccessBeforeStart.codename(), "any_access_before_start");
        assert_eq!(
            AnyAccessBeforeStart.requirements(),
            &[RowField::Context, RowField::StartTime]
        );
        assert_eq!(AnyAccessAfterEnd.codename(), "any_access_after_end");
        assert_eq!(
            AnyAccessAfterEnd.requirements(),
            &[RowField::Context, RowField::EndTime]
        );
        assert_eq!(AnyAccessBeforeStart.min_context_depth(), ContextLevel::System);
    }
}
