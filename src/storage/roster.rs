//! Target roster sources.
//!
//! The roster is owned by another collector; this module only reads it.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params};

use crate::error::{AppError, Result};
use crate::models::{Config, RosterConfig, TargetSchool};
use crate::storage::sqlite::open_read_only;

/// Read-only source of target schools for one run.
pub trait Roster {
    fn targets(&self) -> Result<Vec<TargetSchool>>;
}

/// Build the configured roster source.
pub fn from_config(config: &Config) -> Box<dyn Roster> {
    let busy_timeout = Duration::from_secs(config.store.busy_timeout_secs);
    match &config.roster {
        RosterConfig::Database {
            path,
            table,
            id_column,
            name_column,
        } => Box::new(SqliteRoster {
            path: path.clone().unwrap_or_else(|| config.store.path.clone()),
            busy_timeout,
            table: table.clone(),
            id_column: id_column.clone(),
            name_column: name_column.clone(),
        }),
        RosterConfig::File { path } => Box::new(FileRoster { path: path.clone() }),
    }
}

/// Distinct `(id, name)` pairs from a table in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteRoster {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub table: String,
    pub id_column: String,
    pub name_column: String,
}

impl Roster for SqliteRoster {
    fn targets(&self) -> Result<Vec<TargetSchool>> {
        if !self.path.is_file() {
            return Err(AppError::config(format!(
                "roster database not found at {}",
                self.path.display()
            )));
        }
        let conn = open_read_only(&self.path, self.busy_timeout)?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            log::warn!(
                "Roster table '{}' not found in {}; no targets available",
                self.table,
                self.path.display()
            );
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT DISTINCT {id}, {name} FROM {table}
             WHERE {id} IS NOT NULL AND {id} != ''
             ORDER BY {name}",
            id = self.id_column,
            name = self.name_column,
            table = self.table,
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(TargetSchool {
                id: as_text(row.get(0)?),
                name: as_text(row.get(1)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Roster columns are untyped; ids are sometimes stored as integers.
fn as_text(value: SqlValue) -> String {
    match value {
        SqlValue::Text(text) => text,
        SqlValue::Integer(n) => n.to_string(),
        SqlValue::Real(x) => x.to_string(),
        SqlValue::Null | SqlValue::Blob(_) => String::new(),
    }
}

/// Targets listed in a JSON file.
#[derive(Debug, Clone)]
pub struct FileRoster {
    pub path: PathBuf,
}

impl Roster for FileRoster {
    fn targets(&self) -> Result<Vec<TargetSchool>> {
        TargetSchool::load_all(&self.path)
    }
}
