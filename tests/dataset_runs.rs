//! Run coordination across independent dataset managers sharing one
//! data root, the way separate worker processes would.

use edana::{
    build_dataset_schema, AnyAccessBeforeStart, DatasetConfig, DatasetError, DatasetManager,
    DatasetRow, DatasetSchema, Indicator, ProcessStatus, TimeRange,
    DEFAULT_STALE_LEASE_TIMEOUT_SECS,
};
use tempfile::tempdir;

const NOW_TS_UTC: i64 = 1_735_689_600;

#[test]
fn only_one_manager_wins_the_lease_for_a_key() {
    let dir = tempdir().expect("tempdir");
    let cfg = config_under(dir.path());
    let mut a = DatasetManager::open(cfg.clone()).expect("manager a");
    let mut b = DatasetManager::open(cfg).expect("manager b");

    let lease = a
        .init_process(1, 7, "weekly", NOW_TS_UTC)
        .expect("first lease");

    let err = b
        .init_process(1, 7, "weekly", NOW_TS_UTC + 10)
        .expect_err("second lease refused");
    match err {
        DatasetError::AlreadyRunning {
            run_id,
            time_started_ts_utc,
        } => {
            assert_eq!(run_id, lease.run_id);
            assert_eq!(time_started_ts_utc, NOW_TS_UTC);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Any other key is free.
    b.init_process(1, 8, "weekly", NOW_TS_UTC)
        .expect("other analysable");
    b.init_process(2, 7, "weekly", NOW_TS_UTC).expect("other model");
    b.init_process(1, 7, "single_range", NOW_TS_UTC)
        .expect("other processor");
}

#[test]
fn completion_by_the_lease_holder_is_visible_to_other_managers() {
    let dir = tempdir().expect("tempdir");
    let cfg = config_under(dir.path());
    let mut a = DatasetManager::open(cfg.clone()).expect("manager a");
    let b = DatasetManager::open(cfg.clone()).expect("manager b");

    let lease = a.init_process(1, 7, "weekly", NOW_TS_UTC).expect("lease");
    let artifact = a
        .store(&lease, &probe_schema(), &probe_rows())
        .expect("store artifact");
    a.close_process(&lease, &artifact, NOW_TS_UTC + 60)
        .expect("close");

    let record = b
        .get_run(1, 7, "weekly")
        .expect("lookup")
        .expect("record exists");
    assert_eq!(record.status, ProcessStatus::Completed);
    assert_eq!(record.time_completed_ts_utc, Some(NOW_TS_UTC + 60));

    // Fresh exactly at the window edge, stale one second past it.
    let window = cfg.freshness_window_secs;
    let at_edge = b
        .fresh_artifact(1, 7, "weekly", NOW_TS_UTC + 60 + window)
        .expect("edge lookup");
    assert_eq!(at_edge, Some(artifact.clone()));
    let past_edge = b
        .fresh_artifact(1, 7, "weekly", NOW_TS_UTC + 60 + window + 1)
        .expect("past-edge lookup");
    assert_eq!(past_edge, None);

    // The file itself is still retrievable regardless of freshness.
    let file = b
        .get_analysable_file(1, 7, "weekly")
        .expect("file lookup");
    assert_eq!(file, Some(artifact));
}

#[test]
fn stale_lease_is_reclaimed_and_the_old_run_is_audited() {
    let dir = tempdir().expect("tempdir");
    let cfg = config_under(dir.path());
    let mut a = DatasetManager::open(cfg.clone()).expect("manager a");
    let mut b = DatasetManager::open(cfg).expect("manager b");

    let stale_lease = a.init_process(1, 7, "weekly", NOW_TS_UTC).expect("lease");

    // Exactly at the timeout the lease is still honoured.
    let still_held = b.init_process(
        1,
        7,
        "weekly",
        NOW_TS_UTC + DEFAULT_STALE_LEASE_TIMEOUT_SECS,
    );
    assert!(matches!(
        still_held,
        Err(DatasetError::AlreadyRunning { .. })
    ));

    let reclaimed = b
        .init_process(
            1,
            7,
            "weekly",
            NOW_TS_UTC + DEFAULT_STALE_LEASE_TIMEOUT_SECS + 1,
        )
        .expect("reclaim past timeout");
    assert_ne!(reclaimed.run_id, stale_lease.run_id);

    // The abandoned run stays on record; the dead worker's lease is gone.
    let runs = b.count_runs(1, 7, "weekly").expect("count");
    assert_eq!(runs, 2);
    let err = a
        .store(&stale_lease, &probe_schema(), &probe_rows())
        .and_then(|artifact| a.close_process(&stale_lease, &artifact, NOW_TS_UTC + 90_000))
        .expect_err("dead lease cannot close");
    assert!(matches!(err, DatasetError::LeaseLost { .. }));
}

#[test]
fn records_and_artifacts_survive_reopening_the_data_root() {
    let dir = tempdir().expect("tempdir");
    let cfg = config_under(dir.path());

    let artifact = {
        let mut manager = DatasetManager::open(cfg.clone()).expect("first open");
        let lease = manager.init_process(1, 7, "weekly", NOW_TS_UTC).expect("lease");
        let artifact = manager
            .store(&lease, &probe_schema(), &probe_rows())
            .expect("store");
        manager
            .close_process(&lease, &artifact, NOW_TS_UTC + 5)
            .expect("close");
        artifact
    };

    let reopened = DatasetManager::open(cfg.clone()).expect("second open");
    let record = reopened
        .get_run(1, 7, "weekly")
        .expect("lookup")
        .expect("record exists");
    assert_eq!(record.status, ProcessStatus::Completed);
    assert_eq!(record.artifact_path.as_deref(), Some(artifact.path.as_path()));

    assert_eq!(
        artifact.path,
        cfg.data_root
            .join("model_1")
            .join("7")
            .join("weekly")
            .join(format!("run_{}.csv", record.run_id))
    );
    assert!(artifact.path.exists());
}

fn config_under(dir: &std::path::Path) -> DatasetConfig {
    DatasetConfig {
        data_root: dir.join("analysis"),
        ..DatasetConfig::default()
    }
}

fn probe_schema() -> DatasetSchema {
    let indicators: &[&dyn Indicator] = &[&AnyAccessBeforeStart];
    build_dataset_schema(
        "weekly",
        &[TimeRange {
            start_ts_utc: 0,
            end_ts_utc_exclusive: 100,
        }],
        indicators,
    )
}

fn probe_rows() -> Vec<DatasetRow> {
    vec![
        DatasetRow {
            row_id: 1,
            values: vec![1.0, -1.0],
        },
        DatasetRow {
            row_id: 2,
            values: vec![-1.0, 1.0],
        },
    ]
}
