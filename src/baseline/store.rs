//! Durable baseline storage.
//!
//! The core defines the logical record; this module provides the trait
//! collaborators implement plus a SQLite-backed default. Writes are
//! append-only: a re-capture under an existing name supersedes rather
//! than mutates, and resolution always picks the most recent row.

use super::Baseline;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Listing row for stored baselines.
#[derive(Debug, Clone)]
pub struct BaselineSummary {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub endpoint_fingerprint: String,
    pub sample_count: u32,
}

/// Pluggable persistence backend for baselines.
pub trait BaselineStore: Send + Sync {
    fn put(&self, baseline: &Baseline) -> Result<(), StoreError>;
    /// Most recent capture under `name`, if any.
    fn latest_by_name(&self, name: &str) -> Result<Option<Baseline>, StoreError>;
    /// Most recent capture whose endpoint fingerprint matches.
    fn latest_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Baseline>, StoreError>;
    fn list(&self) -> Result<Vec<BaselineSummary>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS baselines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    machine TEXT NOT NULL,
    endpoint_fingerprint TEXT NOT NULL,
    sample_count INTEGER NOT NULL,
    metrics TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_baselines_name ON baselines(name, captured_at);
CREATE INDEX IF NOT EXISTS idx_baselines_fp ON baselines(endpoint_fingerprint, captured_at);
";

/// Thread-safe SQLite baseline store.
#[derive(Clone)]
pub struct SqliteBaselineStore {
    conn: Arc<Mutex<Connection>>,
}

struct RawRow {
    name: String,
    captured_at: String,
    machine: String,
    endpoint_fingerprint: String,
    sample_count: u32,
    metrics_json: String,
}

impl RawRow {
    fn into_baseline(self) -> Result<Baseline, StoreError> {
        Ok(Baseline {
            name: self.name,
            captured_at: DateTime::parse_from_rfc3339(&self.captured_at)?.with_timezone(&Utc),
            machine: self.machine,
            endpoint_fingerprint: self.endpoint_fingerprint,
            sample_count: self.sample_count,
            metrics: serde_json::from_str(&self.metrics_json)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT name, captured_at, machine, endpoint_fingerprint, sample_count, metrics FROM baselines";

impl SqliteBaselineStore {
    /// Open (or create) a store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Ephemeral in-memory store, mostly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn latest_where(&self, clause: &str, key: &str) -> Result<Option<Baseline>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "{SELECT_COLUMNS} WHERE {clause} = ?1 ORDER BY captured_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![key], |row| {
            Ok(RawRow {
                name: row.get(0)?,
                captured_at: row.get(1)?,
                machine: row.get(2)?,
                endpoint_fingerprint: row.get(3)?,
                sample_count: row.get(4)?,
                metrics_json: row.get(5)?,
            })
        })?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_baseline()?)),
            None => Ok(None),
        }
    }
}

impl BaselineStore for SqliteBaselineStore {
    fn put(&self, baseline: &Baseline) -> Result<(), StoreError> {
        let metrics_json = serde_json::to_string(&baseline.metrics)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO baselines (name, captured_at, machine, endpoint_fingerprint, sample_count, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                baseline.name,
                baseline.captured_at.to_rfc3339(),
                baseline.machine,
                baseline.endpoint_fingerprint,
                baseline.sample_count,
                metrics_json,
            ],
        )?;
        Ok(())
    }

    fn latest_by_name(&self, name: &str) -> Result<Option<Baseline>, StoreError> {
        self.latest_where("name", name)
    }

    fn latest_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Baseline>, StoreError> {
        self.latest_where("endpoint_fingerprint", fingerprint)
    }

    fn list(&self) -> Result<Vec<BaselineSummary>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, captured_at, endpoint_fingerprint, sample_count FROM baselines
             ORDER BY captured_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (name, captured_at, endpoint_fingerprint, sample_count) = row?;
            summaries.push(BaselineSummary {
                name,
                captured_at: DateTime::parse_from_rfc3339(&captured_at)?.with_timezone(&Utc),
                endpoint_fingerprint,
                sample_count,
            });
        }
        Ok(summaries)
    }
}
