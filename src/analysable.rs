//! Core entities analysed by the pipeline.
//!
//! Rules implemented:
//! - an analysable is an immutable snapshot: id, context, optional timeline
//! - context levels form a fixed depth ordering (system above course)
//! - row metadata fields are closed tokens matched by name
//! - timelines are UTC epoch seconds, open ends allowed
//! - calculation windows are half-open `[start, end)`

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextLevel {
    System,
    Course,
}

impl ContextLevel {
    /// Ordering value: smaller is closer to the platform root.
    pub fn depth(self) -> u8 {
        match self {
            ContextLevel::System => 10,
            ContextLevel::Course => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContextLevel::System => "system",
            ContextLevel::Course => "course",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub level: ContextLevel,
    pub instance_id: i64,
}

impl Context {
    pub fn system() -> Self {
        Self {
            level: ContextLevel::System,
            instance_id: 0,
        }
    }

    pub fn course(instance_id: i64) -> Self {
        Self {
            level: ContextLevel::Course,
            instance_id,
        }
    }
}

/// A unit of analysis. Snapshotted once per batch; the pipeline never
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysable {
    pub id: i64,
    pub context: Context,
    pub start_ts_utc: Option<i64>,
    pub end_ts_utc: Option<i64>,
}

impl Analysable {
    /// Both timeline ends, when present and ordered. `None` covers open
    /// ends and inverted metadata alike.
    pub fn timeline(&self) -> Option<(i64, i64)> {
        match (self.start_ts_utc, self.end_ts_utc) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }
}

/// Half-open `[start, end)` calculation window handed to indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start_ts_utc: i64,
    pub end_ts_utc_exclusive: i64,
}

impl TimeRange {
    pub fn duration_secs(&self) -> i64 {
        self.end_ts_utc_exclusive - self.start_ts_utc
    }
}

/// Per-row metadata a row source can supply to indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowField {
    Id,
    Context,
    StartTime,
    EndTime,
}

impl RowField {
    pub fn as_str(self) -> &'static str {
        match self {
            RowField::Id => "id",
            RowField::Context => "context",
            RowField::StartTime => "starttime",
            RowField::EndTime => "endtime",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityError {
    #[error("unknown context level: {0}")]
    UnknownContextLevel(String),
}

pub fn parse_context_level(input: &str) -> Result<ContextLevel, EntityError> {
    match input {
        "system" => Ok(ContextLevel::System),
        "course" => Ok(ContextLevel::Course),
        other => Err(EntityError::UnknownContextLevel(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_levels_round_trip_by_name() {
        let cases = [
            (ContextLevel::System, "system"),
            (ContextLevel::Course, "course"),
        ];

        for (level, name) in cases {
            assert_eq!(level.as_str(), name);
            assert_eq!(parse_context_level(name).unwrap(), level);
        }
    }

    #[test]
    fn unknown_context_level_is_explicit() {
        assert_eq!(
            parse_context_level("module").unwrap_err(),
            EntityError::UnknownContextLevel("module".to_string())
        );
    }

    #[test]
    fn depth_orders_system_above_course() {
        assert!(ContextLevel::System.depth() < ContextLevel::Course.depth());
    }

    #[test]
    fn timeline_requires_both_ordered_ends() {
        let base = Analysable {
            id: 7,
            context: Context::course(7),
            start_ts_utc: Some(1_700_000_000),
            end_ts_utc: Some(1_701_000_000),
        };
        assert_eq!(base.timeline(), Some((1_700_000_000, 1_701_000_000)));

        let open_end = Analysable {
            end_ts_utc: None,
            ..base
        };
        assert_eq!(open_end.timeline(), None);

        let inverted = Analysable {
            start_ts_utc: Some(1_701_000_000),
            end_ts_utc: Some(1_700_000_000),
            ..base
        };
        assert_eq!(inverted.timeline(), None);
    }

    #[test]
    fn row_field_names_are_stable() {
        let cases = [
            (RowField::Id, "id"),
            (RowField::Context, "context"),
            (RowField::StartTime, "starttime"),
            (RowField::EndTime, "endtime"),
        ];

        for (field, name) in cases {
            assert_eq!(field.as_str(), name);
        }
    }
}
