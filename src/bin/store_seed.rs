use std::path::PathBuf;

use edana::{
    init_logging, log_app_start, logging_config_from_env, ActivityEvent, Analysable, Context,
    SqliteActivityStore, WEEK_SECS,
};

const COURSE_COUNT: i64 = 3;
const USERS_PER_COURSE: i64 = 10;
const COURSE_WEEKS: i64 = 4;
const DAY_SECS: i64 = 24 * 60 * 60;
// 2025-01-01 00:00:00 UTC.
const BASE_TS_UTC: i64 = 1_735_689_600;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("store_seed", &logging_cfg);

    let store_path = std::env::var("EDANA_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/platform.sqlite"));

    let mut store = SqliteActivityStore::open(&store_path)?;

    println!(
        "Platform seed start | store={} courses={} users_per_course={}",
        store_path.display(),
        COURSE_COUNT,
        USERS_PER_COURSE
    );

    for course_index in 0..COURSE_COUNT {
        let course_id = 101 + course_index;
        let start = BASE_TS_UTC + course_index * WEEK_SECS;
        let end = start + COURSE_WEEKS * WEEK_SECS;
        let course = Analysable {
            id: course_id,
            context: Context::course(course_id),
            start_ts_utc: Some(start),
            end_ts_utc: Some(end),
        };

        store.upsert_course(&course)?;
        let events = seed_course(&mut store, &course)?;
        println!(
            "course {} | start={} end={} enrolled={} events={}",
            course_id, start, end, USERS_PER_COURSE, events
        );
    }

    let activity_rows = store.count_activity()?;
    println!(
        "Seed complete | courses={} activity_rows={}",
        COURSE_COUNT, activity_rows
    );
    Ok(())
}

fn seed_course(
    store: &mut SqliteActivityStore,
    course: &Analysable,
) -> Result<usize, Box<dyn std::error::Error>> {
    let (start, end) = course
        .timeline()
        .ok_or("seeded course must carry a full timeline")?;
    let midpoint = start + (end - start) / 2;

    let mut events = Vec::new();
    for user_index in 0..USERS_PER_COURSE {
        let user_id = course.id * 1_000 + user_index;
        store.enrol_user(course.id, user_id)?;

        // Everyone pokes the course the day before it opens.
        events.push(ActivityEvent {
            user_id,
            context: course.context,
            ts_utc: start - DAY_SECS,
        });

        // Even-numbered users stay active to the end, odd ones go silent
        // after the midpoint: the dropout half of the demo.
        let active_until = if user_index % 2 == 0 { end } else { midpoint };
        let mut ts = start + DAY_SECS;
        while ts < active_until {
            events.push(ActivityEvent {
                user_id,
                context: course.context,
                ts_utc: ts,
            });
            ts += WEEK_SECS / 2;
        }

        if user_index % 2 == 0 {
            // Completers come back after close.
            events.push(ActivityEvent {
                user_id,
                context: course.context,
                ts_utc: end + DAY_SECS,
            });
        }
    }

    store.record_activity_batch(&events)?;
    Ok(events.len())
}
