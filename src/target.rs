//! Stage 3 prediction target contract and the course dropout target.
//!
//! The target decides which analysables are worth analysing at all and
//! supplies the label column of every dataset.

use tracing::warn;

use crate::analysable::{Analysable, ContextLevel};
use crate::indicator::{MAX_FEATURE_VALUE, MIN_FEATURE_VALUE};
use crate::store::ActivityStore;

pub trait Target {
    /// Stable machine name; recorded with every trained model.
    fn codename(&self) -> &'static str;

    /// Eligibility gate, evaluated before any calculation starts.
    /// `Err(reason)` is a human-readable ineligibility, not a failure.
    fn check_analysable(&self, analysable: &Analysable) -> Result<(), String>;

    /// Label for the dataset's final column, bounded like features.
    /// Total: degraded facts produce `min_value`.
    fn calculate_row(&self, row_id: i64, analysable: &Analysable, data: &dyn ActivityStore)
        -> f64;

    fn min_value(&self) -> f64 {
        MIN_FEATURE_VALUE
    }

    fn max_value(&self) -> f64 {
        MAX_FEATURE_VALUE
    }
}

/// Dropout prediction over finished or running courses: a user counts as
/// dropped out when the second half of the course timeline shows no
/// activity from them in the course context.
pub struct CourseDropout;

impl Target for CourseDropout {
    fn codename(&self) -> &'static str {
        "course_dropout"
    }

    fn check_analysable(&self, analysable: &Analysable) -> Result<(), String> {
        if analysable.context.level != ContextLevel::Course {
            return Err(format!(
                "analysable context is {}, dropout prediction needs a course",
                analysable.context.level.as_str()
            ));
        }
        if analysable.start_ts_utc.is_none() {
            return Err("course has no start time".to_string());
        }
        if analysable.end_ts_utc.is_none() {
            return Err("course has no end time".to_string());
        }
        if analysable.timeline().is_none() {
            return Err("course start is not before its end".to_string());
        }
        Ok(())
    }

    fn calculate_row(
        &self,
        row_id: i64,
        analysable: &Analysable,
        data: &dyn ActivityStore,
    ) -> f64 {
        let (start, end) = match analysable.timeline() {
            Some(timeline) => timeline,
            None => return self.min_value(),
        };
        let midpoint = start + (end - start) / 2;

        match data.has_activity(row_id, analysable.context, Some(midpoint), Some(end)) {
            Ok(true) => self.min_value(),
            Ok(false) => self.max_value(),
            Err(err) => {
                warn!(
                    component = "target",
                    event = "target.store_error",
                    codename = self.codename(),
                    row_id,
                    analysable_id = analysable.id,
                    error = %err,
                    "store query failed; degrading label to minimum"
                );
                self.min_value()
            }
        }
    }
}
