//! SQLite storage implementation.
//!
//! A connection is opened per logical operation and dropped right after,
//! with a busy timeout so that dashboard queries running at the same time
//! make the pipeline wait instead of fail.
//!
//! ## Schema
//!
//! ```text
//! history(id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp, school_name, school_id, count)
//! students(matriculation_id TEXT PRIMARY KEY, name, class, shift,
//!          school_name, school_id, birth_date)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::{Connection, OpenFlags, params};

use crate::error::Result;
use crate::models::{HistoryEntry, StoreConfig, StudentRecord};
use crate::storage::{
    HISTORY_TIMESTAMP_FORMAT, HistoryRecorder, SchoolCount, SnapshotStore,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT,
        school_name TEXT,
        school_id TEXT,
        count INTEGER
    );
    CREATE TABLE IF NOT EXISTS students (
        matriculation_id TEXT PRIMARY KEY,
        name TEXT,
        class TEXT,
        shift TEXT,
        school_name TEXT,
        school_id TEXT,
        birth_date TEXT
    );
";

/// Snapshot and history tables in one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Create a store for the database at `path`. Nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            &config.path,
            Duration::from_secs(config.busy_timeout_secs),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the pipeline's tables if they are missing.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        open_with_timeout(&self.path, self.busy_timeout)
    }
}

/// Open a connection with the busy timeout applied.
pub(crate) fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Open an existing database without write access. Never creates the file.
pub(crate) fn open_read_only(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

impl SnapshotStore for SqliteStore {
    fn replace_all(&self) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn.execute("DELETE FROM students", [])?;
        log::debug!("Cleared {} snapshot rows", removed);
        Ok(removed)
    }

    fn upsert_batch(
        &self,
        records: &[StudentRecord],
        school_name: &str,
        school_id: &str,
    ) -> Result<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        let mut skipped = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO students
                 (matriculation_id, name, class, shift, school_name, school_id, birth_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for record in records {
                if !record.has_key() {
                    skipped += 1;
                    continue;
                }
                stmt.execute(params![
                    record.matriculation_id,
                    record.name,
                    record.class,
                    record.shift,
                    school_name,
                    school_id,
                    record.birth_date,
                ])?;
                written += 1;
            }
        }

        tx.commit()?;

        if skipped > 0 {
            log::warn!(
                "Skipped {} record(s) without a matriculation id for {}",
                skipped,
                school_name
            );
        }
        Ok(written)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn count_by_school(&self) -> Result<Vec<SchoolCount>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT school_id, school_name, COUNT(*) FROM students
             GROUP BY school_id, school_name
             ORDER BY school_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SchoolCount {
                school_id: row.get(0)?,
                school_name: row.get(1)?,
                count: row.get::<_, i64>(2)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl HistoryRecorder for SqliteStore {
    fn append(
        &self,
        school_name: &str,
        school_id: &str,
        count: usize,
        timestamp: NaiveDateTime,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO history (timestamp, school_name, school_id, count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                timestamp.format(HISTORY_TIMESTAMP_FORMAT).to_string(),
                school_name,
                school_id,
                count as i64,
            ],
        )?;
        Ok(())
    }

    fn series(&self, school_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, school_name, school_id, count FROM history
             WHERE school_id = ?1
             ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(params![school_id], history_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn latest(&self) -> Result<Vec<HistoryEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, school_name, school_id, count FROM history
             WHERE id IN (SELECT MAX(id) FROM history GROUP BY school_id)
             ORDER BY school_name",
        )?;
        let rows = stmt.query_map([], history_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        school_name: row.get(2)?,
        school_id: row.get(3)?,
        count: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> SqliteStore {
        let store = SqliteStore::new(tmp.path().join("test.db"), Duration::from_secs(1));
        store.initialize().unwrap();
        store
    }

    fn record(id: &str, name: &str) -> StudentRecord {
        StudentRecord {
            matriculation_id: id.to_string(),
            name: name.to_string(),
            ..StudentRecord::default()
        }
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        store
            .upsert_batch(&[record("100", "Old Name")], "Escola A", "A")
            .unwrap();
        store
            .upsert_batch(&[record("100", "New Name")], "Escola B", "B")
            .unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let by_school = store.count_by_school().unwrap();
        assert_eq!(by_school.len(), 1);
        assert_eq!(by_school[0].school_id, "B");

        let conn = store.open().unwrap();
        let name: String = conn
            .query_row(
                "SELECT name FROM students WHERE matriculation_id = '100'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "New Name");
    }

    #[test]
    fn test_missing_fields_stored_as_empty_strings() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.upsert_batch(&[record("1", "")], "Escola", "E").unwrap();

        let conn = store.open().unwrap();
        let (class, birth): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT class, birth_date FROM students WHERE matriculation_id = '1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(class.as_deref(), Some(""));
        assert_eq!(birth.as_deref(), Some(""));
    }

    #[test]
    fn test_replace_all_then_nothing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store
            .upsert_batch(&[record("1", "a"), record("2", "b")], "Escola", "E")
            .unwrap();

        assert_eq!(store.replace_all().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_records_without_id_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let written = store
            .upsert_batch(&[record("", "ghost"), record("7", "real")], "Escola", "E")
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_without_schema_fails() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::new(tmp.path().join("bare.db"), Duration::from_secs(1));
        assert!(store.upsert_batch(&[record("1", "a")], "E", "E").is_err());
    }

    #[test]
    fn test_history_is_append_only() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        store.append("Escola A", "A", 10, at(8)).unwrap();
        store.append("Escola B", "B", 4, at(8)).unwrap();
        store.append("Escola A", "A", 12, at(9)).unwrap();

        let series = store.series("A").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].count, 10);
        assert_eq!(series[1].count, 12);
        assert_eq!(series[1].timestamp, "2025-03-10 09:00:00");

        let latest = store.latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].school_name, "Escola A");
        assert_eq!(latest[0].count, 12);
        assert_eq!(latest[1].count, 4);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append("Escola A", "A", 1, at(1)).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.series("A").unwrap().len(), 1);
    }
}
