use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};

use super::{Archive, ArchiveError};
use crate::model::HistoryItem;

const SELECT_RUNS: &str = r"
    SELECT id, timestamp, success_rate, total_cycles, config, results, optimization_history
    FROM runs
";

/// Direct access to the server's run database.
pub struct SqliteArchive {
    conn: Connection,
}

/// A `runs` row before its JSON columns are decoded.
struct StoredRun {
    id: String,
    timestamp: Option<String>,
    success_rate: Option<f64>,
    total_cycles: Option<i64>,
    config: Option<String>,
    results: Option<String>,
    optimization_history: Option<String>,
}

impl SqliteArchive {
    /// Open or create the run database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the table created.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let conn = Connection::open(path)?;
        let archive = Self { conn };
        archive.configure()?;
        debug!(path = %path.display(), "opened run database");
        Ok(archive)
    }

    fn configure(&self) -> Result<(), ArchiveError> {
        // The server writes to the same file.
        self.conn.busy_timeout(Duration::from_secs(5))?;
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                timestamp TEXT,
                success_rate REAL,
                total_cycles INTEGER,
                config TEXT,
                results TEXT,
                optimization_history TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Insert a run, replacing any run with the same id. The API key is not
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the insert fails.
    pub fn save(&self, item: &HistoryItem) -> Result<(), ArchiveError> {
        let mut config = item.config.clone();
        config.api_key.clear();

        self.conn.execute(
            r"
            INSERT OR REPLACE INTO runs (
                id, timestamp, success_rate, total_cycles, config, results, optimization_history
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                item.id,
                item.timestamp,
                item.success_rate,
                i64::from(item.total_cycles),
                serde_json::to_string(&config)?,
                serde_json::to_string(&item.results)?,
                serde_json::to_string(&item.optimization_history)?,
            ],
        )?;
        Ok(())
    }

}

impl Archive for SqliteArchive {
    fn list(&self) -> Result<Vec<HistoryItem>, ArchiveError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RUNS} ORDER BY timestamp DESC"))?;
        let rows = stmt.query_map([], map_run)?;

        let mut items = Vec::new();
        for row in rows {
            let run = row?;
            let id = run.id.clone();
            match run.decode() {
                Ok(item) => items.push(item),
                Err(err) => warn!(id = %id, error = %err, "skipping corrupt run"),
            }
        }
        Ok(items)
    }

    fn fetch(&self, id: &str) -> Result<Option<HistoryItem>, ArchiveError> {
        let run = self
            .conn
            .prepare(&format!("{SELECT_RUNS} WHERE id = ?1"))?
            .query_row([id], map_run)
            .optional()?;
        run.map(StoredRun::decode).transpose()
    }

    fn delete(&self, id: &str) -> Result<(), ArchiveError> {
        let removed = self.conn.execute("DELETE FROM runs WHERE id = ?1", [id])?;
        debug!(id, removed, "deleted run");
        Ok(())
    }

    fn clear(&self) -> Result<usize, ArchiveError> {
        let removed = self.conn.execute("DELETE FROM runs", [])?;
        debug!(removed, "cleared run database");
        Ok(removed)
    }
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<StoredRun> {
    Ok(StoredRun {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        success_rate: row.get("success_rate")?,
        total_cycles: row.get("total_cycles")?,
        config: row.get("config")?,
        results: row.get("results")?,
        optimization_history: row.get("optimization_history")?,
    })
}

impl StoredRun {
    fn decode(self) -> Result<HistoryItem, ArchiveError> {
        Ok(HistoryItem {
            id: self.id,
            timestamp: self.timestamp.unwrap_or_default(),
            config: decode_column(self.config.as_deref(), "{}")?,
            success_rate: self.success_rate.unwrap_or_default(),
            total_cycles: self
                .total_cycles
                .and_then(|cycles| u32::try_from(cycles).ok())
                .unwrap_or_default(),
            results: decode_column(self.results.as_deref(), "[]")?,
            optimization_history: decode_column(self.optimization_history.as_deref(), "[]")?,
        })
    }
}

fn decode_column<T: serde::de::DeserializeOwned>(
    column: Option<&str>,
    empty: &str,
) -> Result<T, ArchiveError> {
    Ok(serde_json::from_str(column.unwrap_or(empty))?)
}
