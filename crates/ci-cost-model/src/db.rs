//! SQLite store for the cost dataset and its daily rollup.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use ci_cost_core::{CostRow, Origin};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};

use crate::error::{CostError, Result};
use crate::merge::{DailyRollup, DailyTotals, DatasetMerger, MergeOutcome, RollupKey};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 2;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DATE_FORMAT: &str = "%Y-%m-%d";

const ROW_COLUMNS: &str = "project, product, graph_id, push_id, graph_date, origin, total_cost, \
                           final_run_cost, task_count, compute_time, artifact_size, artifact_cost";

/// Counts reported after a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub filled: usize,
    pub ignored: usize,
}

impl From<&MergeOutcome> for MergeStats {
    fn from(outcome: &MergeOutcome) -> Self {
        Self {
            inserted: outcome.inserted.len(),
            filled: outcome.filled.len(),
            ignored: outcome.ignored,
        }
    }
}

/// Persisted cost rows keyed by graph id, plus the daily rollup.
pub struct CostDataset {
    conn: Arc<Mutex<Connection>>,
}

impl CostDataset {
    /// Open or create a dataset at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let dataset = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        dataset.migrate()?;
        Ok(dataset)
    }

    /// Create an in-memory dataset (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let dataset = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        dataset.migrate()?;
        Ok(dataset)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CostError::Database(rusqlite::Error::InvalidParameterName(e.to_string())))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CostError::Migration(format!("failed to acquire lock: {e}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version > SCHEMA_VERSION {
            return Err(CostError::Migration(format!(
                "dataset schema version {current_version} is newer than supported version \
                 {SCHEMA_VERSION}"
            )));
        }
        if current_version < SCHEMA_VERSION {
            info!(current = current_version, target = SCHEMA_VERSION, "Running dataset migrations");
            if current_version < 1 {
                Self::migration_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migration_v2(&conn)?;
            }
        }
        Ok(())
    }

    /// Migration to version 1: graph rows and the daily rollup.
    fn migration_v1(conn: &Connection) -> Result<()> {
        debug!("Running migration v1: initial schema");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cost_rows (
                graph_id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                product TEXT NOT NULL,
                push_id INTEGER,
                graph_date TEXT NOT NULL,
                origin TEXT NOT NULL,
                total_cost REAL NOT NULL,
                final_run_cost REAL NOT NULL,
                task_count INTEGER NOT NULL,
                compute_time REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cost_rows_date
             ON cost_rows(graph_date)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_costs (
                project TEXT NOT NULL,
                product TEXT NOT NULL,
                date TEXT NOT NULL,
                origin TEXT NOT NULL,
                graph_count INTEGER NOT NULL,
                total_cost REAL NOT NULL,
                final_run_cost REAL NOT NULL,
                task_count INTEGER NOT NULL,
                compute_time REAL NOT NULL,
                PRIMARY KEY (project, product, date, origin)
            )",
            [],
        )?;

        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        info!("Migration v1 completed");
        Ok(())
    }

    /// Migration to version 2: artifact storage columns.
    fn migration_v2(conn: &Connection) -> Result<()> {
        debug!("Running migration v2: artifact columns");

        conn.execute_batch(
            "ALTER TABLE cost_rows ADD COLUMN artifact_size INTEGER;
             ALTER TABLE cost_rows ADD COLUMN artifact_cost REAL;
             ALTER TABLE daily_costs ADD COLUMN artifact_size INTEGER NOT NULL DEFAULT 0;
             ALTER TABLE daily_costs ADD COLUMN artifact_cost REAL NOT NULL DEFAULT 0;",
        )?;

        conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
        info!("Migration v2 completed: artifact columns");
        Ok(())
    }

    /// Merge new rows into the dataset.
    ///
    /// Rows for graph ids already present are ignored unless they carry
    /// artifact data the stored row lacks. The daily rollup is updated with
    /// exactly the change the merge made.
    pub fn merge_rows(&self, rows: &[CostRow]) -> Result<MergeStats> {
        if rows.is_empty() {
            return Ok(MergeStats::default());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut existing = Vec::new();
        for row in rows {
            if let Some(stored) = Self::find_row(&tx, &row.graph_id)? {
                existing.push(stored);
            }
        }

        let outcome = DatasetMerger::merge(existing, rows.to_vec());
        Self::insert_rows_in_tx(&tx, &outcome.inserted)?;
        Self::fill_artifacts_in_tx(&tx, &outcome.filled)?;
        Self::upsert_rollup_in_tx(&tx, &outcome.rollup_delta())?;
        tx.commit()?;

        let stats = MergeStats::from(&outcome);
        debug!(
            inserted = stats.inserted,
            filled = stats.filled,
            ignored = stats.ignored,
            "rows merged"
        );
        Ok(stats)
    }

    fn insert_rows_in_tx(tx: &Transaction, rows: &[CostRow]) -> Result<()> {
        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO cost_rows ({ROW_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ))?;
        for row in rows {
            stmt.execute(params![
                row.project,
                row.product,
                row.graph_id,
                row.push_id.map(|id| id as i64),
                row.graph_date.format(DATE_FORMAT).to_string(),
                row.origin.as_str(),
                row.total_cost,
                row.final_run_cost,
                row.task_count as i64,
                row.compute_time,
                row.artifact_size.map(|s| s as i64),
                row.artifact_cost,
            ])?;
        }
        Ok(())
    }

    fn fill_artifacts_in_tx(tx: &Transaction, rows: &[CostRow]) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "UPDATE cost_rows SET artifact_size = ?1, artifact_cost = ?2
             WHERE graph_id = ?3 AND artifact_size IS NULL",
        )?;
        for row in rows {
            stmt.execute(params![
                row.artifact_size.map(|s| s as i64),
                row.artifact_cost,
                row.graph_id
            ])?;
        }
        Ok(())
    }

    fn upsert_rollup_in_tx(tx: &Transaction, delta: &DailyRollup) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO daily_costs
             (project, product, date, origin, graph_count, total_cost, final_run_cost,
              task_count, compute_time, artifact_size, artifact_cost)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(project, product, date, origin) DO UPDATE SET
                graph_count = graph_count + excluded.graph_count,
                total_cost = total_cost + excluded.total_cost,
                final_run_cost = final_run_cost + excluded.final_run_cost,
                task_count = task_count + excluded.task_count,
                compute_time = compute_time + excluded.compute_time,
                artifact_size = artifact_size + excluded.artifact_size,
                artifact_cost = artifact_cost + excluded.artifact_cost",
        )?;
        for (key, totals) in delta.iter() {
            stmt.execute(params![
                key.project,
                key.product,
                key.date.format(DATE_FORMAT).to_string(),
                key.origin.as_str(),
                totals.graph_count as i64,
                totals.total_cost,
                totals.final_run_cost,
                totals.task_count as i64,
                totals.compute_time,
                totals.artifact_size as i64,
                totals.artifact_cost,
            ])?;
        }
        Ok(())
    }

    fn find_row(conn: &Connection, graph_id: &str) -> Result<Option<CostRow>> {
        let raw = conn
            .query_row(
                &format!("SELECT {ROW_COLUMNS} FROM cost_rows WHERE graph_id = ?1"),
                params![graph_id],
                RawRow::from_sql,
            )
            .optional()?;
        raw.map(RawRow::into_row).transpose()
    }

    /// Get the stored row for a graph.
    pub fn row(&self, graph_id: &str) -> Result<Option<CostRow>> {
        let conn = self.lock()?;
        Self::find_row(&conn, graph_id)
    }

    /// Every stored row, ordered by graph id.
    pub fn rows(&self) -> Result<Vec<CostRow>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM cost_rows ORDER BY graph_id"))?;
        let raw: Vec<RawRow> = stmt
            .query_map([], RawRow::from_sql)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(RawRow::into_row).collect()
    }

    /// Graph ids already present, used to skip graphs examined by earlier scans.
    pub fn graph_ids(&self) -> Result<HashSet<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT graph_id FROM cost_rows")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Graph ids whose rows already carry artifact size and cost. A scan with an
    /// object store only skips these, so rows written without one get filled later.
    pub fn graph_ids_with_artifacts(&self) -> Result<HashSet<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT graph_id FROM cost_rows
             WHERE artifact_size IS NOT NULL AND artifact_cost IS NOT NULL",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    pub fn row_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cost_rows", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Read the daily rollup, optionally restricted to one project.
    pub fn daily_rollup(&self, project: Option<&str>) -> Result<DailyRollup> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT project, product, date, origin, graph_count, total_cost, final_run_cost,
                    task_count, compute_time, artifact_size, artifact_cost
             FROM daily_costs
             WHERE ?1 IS NULL OR project = ?1
             ORDER BY date, project, product, origin",
        )?;
        let raw: Vec<(String, String, String, String, DailyTotals)> = stmt
            .query_map(params![project], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    DailyTotals {
                        graph_count: row.get::<_, i64>(4)? as u64,
                        total_cost: row.get(5)?,
                        final_run_cost: row.get(6)?,
                        task_count: row.get::<_, i64>(7)? as u64,
                        compute_time: row.get(8)?,
                        artifact_size: row.get::<_, i64>(9)? as u64,
                        artifact_cost: row.get(10)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        raw.into_iter()
            .map(|(project, product, date, origin, totals)| -> Result<(RollupKey, DailyTotals)> {
                let key = RollupKey {
                    date: parse_date(&date, &project)?,
                    origin: origin.parse::<Origin>()?,
                    project,
                    product,
                };
                Ok((key, totals))
            })
            .collect()
    }

    /// Delete rows for graphs dated before `before` and rebuild the rollup.
    ///
    /// Returns the number of rows removed.
    pub fn compact(&self, before: NaiveDate) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM cost_rows WHERE graph_date < ?1",
            params![before.format(DATE_FORMAT).to_string()],
        )?;

        tx.execute("DELETE FROM daily_costs", [])?;
        tx.execute(
            "INSERT INTO daily_costs
             (project, product, date, origin, graph_count, total_cost, final_run_cost,
              task_count, compute_time, artifact_size, artifact_cost)
             SELECT project, product, graph_date, origin, COUNT(*), SUM(total_cost),
                    SUM(final_run_cost), SUM(task_count), SUM(compute_time),
                    COALESCE(SUM(artifact_size), 0), COALESCE(SUM(artifact_cost), 0)
             FROM cost_rows
             GROUP BY project, product, graph_date, origin",
            [],
        )?;
        tx.commit()?;

        info!(removed, before = %before, "dataset compacted");
        Ok(removed)
    }
}

/// A row as read from SQLite, before typed conversion.
struct RawRow {
    project: String,
    product: String,
    graph_id: String,
    push_id: Option<i64>,
    graph_date: String,
    origin: String,
    total_cost: f64,
    final_run_cost: f64,
    task_count: i64,
    compute_time: f64,
    artifact_size: Option<i64>,
    artifact_cost: Option<f64>,
}

impl RawRow {
    fn from_sql(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            product: row.get(1)?,
            graph_id: row.get(2)?,
            push_id: row.get(3)?,
            graph_date: row.get(4)?,
            origin: row.get(5)?,
            total_cost: row.get(6)?,
            final_run_cost: row.get(7)?,
            task_count: row.get(8)?,
            compute_time: row.get(9)?,
            artifact_size: row.get(10)?,
            artifact_cost: row.get(11)?,
        })
    }

    fn into_row(self) -> Result<CostRow> {
        let graph_date = parse_date(&self.graph_date, &self.graph_id)?;
        let origin = self.origin.parse::<Origin>().map_err(|e| CostError::InvalidRow {
            graph_id: self.graph_id.clone(),
            message: e.to_string(),
        })?;
        Ok(CostRow {
            project: self.project,
            product: self.product,
            graph_id: self.graph_id,
            push_id: self.push_id.map(|id| id as u64),
            graph_date,
            origin,
            total_cost: self.total_cost,
            final_run_cost: self.final_run_cost,
            task_count: self.task_count as u64,
            compute_time: self.compute_time,
            artifact_size: self.artifact_size.map(|s| s as u64),
            artifact_cost: self.artifact_cost,
        })
    }
}

fn parse_date(value: &str, context: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| CostError::InvalidRow {
        graph_id: context.to_string(),
        message: format!("bad date '{value}': {e}"),
    })
}
