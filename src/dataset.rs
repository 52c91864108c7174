//! Stage 6 dataset persistence: process records and artifact files.
//!
//! One process record per started (model, analysable, processor) run. The
//! latest record doubles as the coordination lease: a run is started by a
//! single atomically-checked transition, completed runs carry the artifact
//! reference, and artifacts themselves are immutable versioned CSV files
//! published with a write-then-rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::range::{DatasetRow, DatasetSchema, WEEK_SECS};

pub const DEFAULT_STALE_LEASE_TIMEOUT_SECS: i64 = 21_600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub data_root: PathBuf,
    pub freshness_window_secs: i64,
    pub stale_lease_timeout_secs: i64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/analysis"),
            freshness_window_secs: WEEK_SECS,
            stale_lease_timeout_secs: DEFAULT_STALE_LEASE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::InProgress => "in_progress",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Abandoned => "abandoned",
        }
    }
}

pub fn parse_process_status(input: &str) -> Result<ProcessStatus, DatasetError> {
    match input {
        "in_progress" => Ok(ProcessStatus::InProgress),
        "completed" => Ok(ProcessStatus::Completed),
        "abandoned" => Ok(ProcessStatus::Abandoned),
        other => Err(DatasetError::InvalidStatus(other.to_string())),
    }
}

/// Persisted state of one analysis run. "Not started" is the absence of
/// any record for the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub run_id: i64,
    pub model_id: i64,
    pub analysable_id: i64,
    pub processor: String,
    pub status: ProcessStatus,
    pub time_started_ts_utc: i64,
    pub time_completed_ts_utc: Option<i64>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_fingerprint: Option<String>,
    pub n_rows: Option<i64>,
    pub n_columns: Option<i64>,
}

/// Reference to one immutable dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetArtifact {
    pub path: PathBuf,
    pub fingerprint: String,
    pub n_rows: u64,
    pub n_columns: u64,
}

/// Held by the worker that won `init_process` for a key. Every transition
/// out of in-progress goes through the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub run_id: i64,
    pub model_id: i64,
    pub analysable_id: i64,
    pub processor: String,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("dataset io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv serialization error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid dataset config: {0}")]
    InvalidConfig(String),
    #[error("invalid stored status: {0}")]
    InvalidStatus(String),
    #[error("analysis already running: run {run_id} started at {time_started_ts_utc}")]
    AlreadyRunning {
        run_id: i64,
        time_started_ts_utc: i64,
    },
    #[error("lease for run {run_id} no longer held")]
    LeaseLost { run_id: i64 },
    #[error("invalid artifact path: {0}")]
    InvalidArtifactPath(String),
}

/// Stale iff strictly older than the window; a run completed exactly
/// `window_secs` ago is still fresh.
pub fn is_stale(completed_ts_utc: i64, now_ts_utc: i64, window_secs: i64) -> bool {
    now_ts_utc - completed_ts_utc > window_secs
}

pub fn artifact_from_record(record: &ProcessRecord) -> Option<DatasetArtifact> {
    match (
        &record.artifact_path,
        &record.artifact_fingerprint,
        record.n_rows,
        record.n_columns,
    ) {
        (Some(path), Some(fingerprint), Some(n_rows), Some(n_columns)) => Some(DatasetArtifact {
            path: path.clone(),
            fingerprint: fingerprint.clone(),
            n_rows: n_rows as u64,
            n_columns: n_columns as u64,
        }),
        _ => None,
    }
}

#[derive(Debug)]
pub struct DatasetManager {
    conn: Connection,
    cfg: DatasetConfig,
}

impl DatasetManager {
    pub fn open(cfg: DatasetConfig) -> Result<Self, DatasetError> {
        validate_config(&cfg)?;
        fs::create_dir_all(&cfg.data_root)?;

        let conn = Connection::open(cfg.data_root.join("analysis_runs.sqlite"))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_runs_schema(&conn)?;

        Ok(Self { conn, cfg })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.cfg
    }

    /// Latest record for the key, any status.
    pub fn get_run(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
    ) -> Result<Option<ProcessRecord>, DatasetError> {
        self.latest_run_where(model_id, analysable_id, processor, None)
    }

    pub fn latest_completed_run(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
    ) -> Result<Option<ProcessRecord>, DatasetError> {
        self.latest_run_where(
            model_id,
            analysable_id,
            processor,
            Some(ProcessStatus::Completed),
        )
    }

    /// Cache-hit lookup: artifact of the latest completed run, provided it
    /// finished within the freshness window.
    pub fn fresh_artifact(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
        now_ts_utc: i64,
    ) -> Result<Option<DatasetArtifact>, DatasetError> {
        let record = match self.latest_completed_run(model_id, analysable_id, processor)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let completed = match record.time_completed_ts_utc {
            Some(completed) => completed,
            None => return Ok(None),
        };
        if is_stale(completed, now_ts_utc, self.cfg.freshness_window_secs) {
            return Ok(None);
        }
        Ok(artifact_from_record(&record))
    }

    /// Artifact of the latest completed run, regardless of freshness.
    pub fn get_analysable_file(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
    ) -> Result<Option<DatasetArtifact>, DatasetError> {
        Ok(self
            .latest_completed_run(model_id, analysable_id, processor)?
            .as_ref()
            .and_then(artifact_from_record))
    }

    pub fn count_runs(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
    ) -> Result<u64, DatasetError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM analysis_runs
            WHERE model_id = ?1
              AND analysable_id = ?2
              AND processor = ?3
            ",
            params![model_id, analysable_id, processor],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Acquire the lease for a key. Exactly one of multiple concurrent
    /// callers wins; the rest observe `AlreadyRunning`. An in-progress
    /// record older than `stale_lease_timeout_secs` is reclaimed and kept
    /// for audit with status abandoned.
    pub fn init_process(
        &mut self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
        now_ts_utc: i64,
    ) -> Result<RunLease, DatasetError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let latest: Option<(i64, String, i64)> = tx
            .query_row(
                "
                SELECT run_id, status, time_started_ts_utc
                FROM analysis_runs
                WHERE model_id = ?1
                  AND analysable_id = ?2
                  AND processor = ?3
                ORDER BY run_id DESC
                LIMIT 1
                ",
                params![model_id, analysable_id, processor],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((run_id, status, time_started_ts_utc)) = latest {
            if status == ProcessStatus::InProgress.as_str() {
                if now_ts_utc - time_started_ts_utc <= self.cfg.stale_lease_timeout_secs {
                    return Err(DatasetError::AlreadyRunning {
                        run_id,
                        time_started_ts_utc,
                    });
                }
                warn!(
                    component = "dataset",
                    event = "dataset.lease.reclaimed",
                    run_id,
                    model_id,
                    analysable_id,
                    processor,
                    time_started_ts_utc,
                    now_ts_utc,
                    "reclaiming stale in-progress run"
                );
                tx.execute(
                    "UPDATE analysis_runs SET status = ?1, time_completed_ts_utc = ?2 WHERE run_id = ?3",
                    params![ProcessStatus::Abandoned.as_str(), now_ts_utc, run_id],
                )?;
            }
        }

        tx.execute(
            "
            INSERT INTO analysis_runs (
                model_id,
                analysable_id,
                processor,
                status,
                time_started_ts_utc
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                model_id,
                analysable_id,
                processor,
                ProcessStatus::InProgress.as_str(),
                now_ts_utc,
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            component = "dataset",
            event = "dataset.run.started",
            run_id,
            model_id,
            analysable_id,
            processor,
            time_started_ts_utc = now_ts_utc
        );

        Ok(RunLease {
            run_id,
            model_id,
            analysable_id,
            processor: processor.to_string(),
        })
    }

    /// Serialize the matrix and publish it at the run's versioned path.
    /// Pure file work; the record transition happens in `close_process`.
    pub fn store(
        &self,
        lease: &RunLease,
        schema: &DatasetSchema,
        rows: &[DatasetRow],
    ) -> Result<DatasetArtifact, DatasetError> {
        let bytes = serialize_dataset_csv(schema, rows)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let fingerprint = hex::encode(hasher.finalize());

        let path = self.artifact_path(lease);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &bytes)?;

        info!(
            component = "dataset",
            event = "dataset.artifact.stored",
            run_id = lease.run_id,
            path = %path.display(),
            fingerprint = fingerprint,
            n_rows = rows.len(),
            n_columns = schema.columns.len()
        );

        Ok(DatasetArtifact {
            path,
            fingerprint,
            n_rows: rows.len() as u64,
            n_columns: schema.columns.len() as u64,
        })
    }

    pub fn close_process(
        &mut self,
        lease: &RunLease,
        artifact: &DatasetArtifact,
        now_ts_utc: i64,
    ) -> Result<(), DatasetError> {
        let path_text = lease_artifact_path_text(artifact)?;
        let updated = self.conn.execute(
            "
            UPDATE analysis_runs SET
                status = ?1,
                time_completed_ts_utc = ?2,
                artifact_path = ?3,
                artifact_fingerprint = ?4,
                n_rows = ?5,
                n_columns = ?6
            WHERE run_id = ?7
              AND status = ?8
            ",
            params![
                ProcessStatus::Completed.as_str(),
                now_ts_utc,
                path_text,
                artifact.fingerprint,
                artifact.n_rows as i64,
                artifact.n_columns as i64,
                lease.run_id,
                ProcessStatus::InProgress.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(DatasetError::LeaseLost {
                run_id: lease.run_id,
            });
        }

        info!(
            component = "dataset",
            event = "dataset.run.completed",
            run_id = lease.run_id,
            model_id = lease.model_id,
            analysable_id = lease.analysable_id,
            processor = %lease.processor,
            time_completed_ts_utc = now_ts_utc
        );
        Ok(())
    }

    /// Release a lease without an artifact (no usable data, or the store
    /// step failed). Keeps the record for audit.
    pub fn abandon_process(
        &mut self,
        lease: &RunLease,
        now_ts_utc: i64,
    ) -> Result<(), DatasetError> {
        let updated = self.conn.execute(
            "
            UPDATE analysis_runs SET
                status = ?1,
                time_completed_ts_utc = ?2
            WHERE run_id = ?3
              AND status = ?4
            ",
            params![
                ProcessStatus::Abandoned.as_str(),
                now_ts_utc,
                lease.run_id,
                ProcessStatus::InProgress.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(DatasetError::LeaseLost {
                run_id: lease.run_id,
            });
        }

        info!(
            component = "dataset",
            event = "dataset.run.abandoned",
            run_id = lease.run_id,
            model_id = lease.model_id,
            analysable_id = lease.analysable_id,
            processor = %lease.processor,
            time_completed_ts_utc = now_ts_utc
        );
        Ok(())
    }

    fn artifact_path(&self, lease: &RunLease) -> PathBuf {
        self.cfg
            .data_root
            .join(format!("model_{}", lease.model_id))
            .join(lease.analysable_id.to_string())
            .join(&lease.processor)
            .join(format!("run_{}.csv", lease.run_id))
    }

    fn latest_run_where(
        &self,
        model_id: i64,
        analysable_id: i64,
        processor: &str,
        status: Option<ProcessStatus>,
    ) -> Result<Option<ProcessRecord>, DatasetError> {
        let raw = self
            .conn
            .query_row(
                "
                SELECT
                    run_id,
                    model_id,
                    analysable_id,
                    processor,
                    status,
                    time_started_ts_utc,
                    time_completed_ts_utc,
                    artifact_path,
                    artifact_fingerprint,
                    n_rows,
                    n_columns
                FROM analysis_runs
                WHERE model_id = ?1
                  AND analysable_id = ?2
                  AND processor = ?3
                  AND (?4 IS NULL OR status = ?4)
                ORDER BY run_id DESC
                LIMIT 1
                ",
                params![
                    model_id,
                    analysable_id,
                    processor,
                    status.map(ProcessStatus::as_str)
                ],
                map_run_row,
            )
            .optional()?;

        match raw {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }
}

struct RunRow {
    run_id: i64,
    model_id: i64,
    analysable_id: i64,
    processor: String,
    status: String,
    time_started_ts_utc: i64,
    time_completed_ts_utc: Option<i64>,
    artifact_path: Option<String>,
    artifact_fingerprint: Option<String>,
    n_rows: Option<i64>,
    n_columns: Option<i64>,
}

fn map_run_row(row: &rusqlite::Row) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        model_id: row.get(1)?,
        analysable_id: row.get(2)?,
        processor: row.get(3)?,
        status: row.get(4)?,
        time_started_ts_utc: row.get(5)?,
        time_completed_ts_utc: row.get(6)?,
        artifact_path: row.get(7)?,
        artifact_fingerprint: row.get(8)?,
        n_rows: row.get(9)?,
        n_columns: row.get(10)?,
    })
}

fn record_from_row(row: RunRow) -> Result<ProcessRecord, DatasetError> {
    Ok(ProcessRecord {
        run_id: row.run_id,
        model_id: row.model_id,
        analysable_id: row.analysable_id,
        processor: row.processor,
        status: parse_process_status(&row.status)?,
        time_started_ts_utc: row.time_started_ts_utc,
        time_completed_ts_utc: row.time_completed_ts_utc,
        artifact_path: row.artifact_path.map(PathBuf::from),
        artifact_fingerprint: row.artifact_fingerprint,
        n_rows: row.n_rows,
        n_columns: row.n_columns,
    })
}

fn validate_config(cfg: &DatasetConfig) -> Result<(), DatasetError> {
    if cfg.freshness_window_secs <= 0 {
        return Err(DatasetError::InvalidConfig(
            "freshness_window_secs must be > 0".to_string(),
        ));
    }
    if cfg.stale_lease_timeout_secs <= 0 {
        return Err(DatasetError::InvalidConfig(
            "stale_lease_timeout_secs must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn ensure_runs_schema(conn: &Connection) -> Result<(), DatasetError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS analysis_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            model_id INTEGER NOT NULL,
            analysable_id INTEGER NOT NULL,
            processor TEXT NOT NULL,
            status TEXT NOT NULL,
            time_started_ts_utc INTEGER NOT NULL,
            time_completed_ts_utc INTEGER,
            artifact_path TEXT,
            artifact_fingerprint TEXT,
            n_rows INTEGER,
            n_columns INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_runs_key
            ON analysis_runs (model_id, analysable_id, processor, run_id);
        ",
    )?;
    Ok(())
}

fn serialize_dataset_csv(
    schema: &DatasetSchema,
    rows: &[DatasetRow],
) -> Result<Vec<u8>, DatasetError> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);

        let mut header = Vec::with_capacity(schema.columns.len() + 1);
        header.push("row_id".to_string());
        header.extend(schema.columns.iter().map(|column| column.name.clone()));
        writer.write_record(&header)?;

        for row in rows {
            let mut record = Vec::with_capacity(row.values.len() + 1);
            record.push(row.row_id.to_string());
            record.extend(row.values.iter().map(|value| format!("{value}")));
            writer.write_record(&record)?;
        }

        writer.flush()?;
    }
    Ok(buf)
}

fn lease_artifact_path_text(artifact: &DatasetArtifact) -> Result<String, DatasetError> {
    match artifact.path.to_str() {
        Some(text) => Ok(text.to_string()),
        None => Err(DatasetError::InvalidArtifactPath(
            artifact.path.display().to_string(),
        )),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DatasetError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| DatasetError::InvalidArtifactPath(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
