//! Storage abstractions for harvested data.
//!
//! Two tables back the reporting dashboard:
//! - `students`: the current snapshot, one row per matriculation id,
//!   cleared at the start of every run and repopulated page by page.
//! - `history`: append-only, one row per (school, run), used for trends.
//!
//! A third table, the target roster, belongs to another collector and is
//! only ever read (see [`roster`]).

pub mod roster;
pub mod sqlite;

use chrono::NaiveDateTime;

use crate::error::Result;
use crate::models::{HistoryEntry, StudentRecord};

// Re-export for convenience
pub use roster::{FileRoster, Roster, SqliteRoster};
pub use sqlite::SqliteStore;

/// Timestamp format used for history rows.
pub const HISTORY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current-state student table.
///
/// Readers may observe the previous snapshot, an empty table, or a
/// partially repopulated one; runs are serialized by the gate, reads are not.
pub trait SnapshotStore: Send + Sync {
    /// Clear the whole table. Returns the number of rows removed.
    fn replace_all(&self) -> Result<usize>;

    /// Insert-or-replace each record keyed by matriculation id.
    ///
    /// Records without an id are skipped and left out of the returned
    /// count of rows written. Callers still count them as received, so the
    /// history total for a target includes them.
    fn upsert_batch(
        &self,
        records: &[StudentRecord],
        school_name: &str,
        school_id: &str,
    ) -> Result<usize>;

    /// Total rows in the snapshot.
    fn count(&self) -> Result<usize>;

    /// Row counts grouped by `(school_id, school_name)`.
    fn count_by_school(&self) -> Result<Vec<SchoolCount>>;
}

/// Append-only per-school observation log.
pub trait HistoryRecorder: Send + Sync {
    /// Record one observation. Never updates existing rows.
    fn append(
        &self,
        school_name: &str,
        school_id: &str,
        count: usize,
        timestamp: NaiveDateTime,
    ) -> Result<()>;

    /// All observations for one school, oldest first.
    fn series(&self, school_id: &str) -> Result<Vec<HistoryEntry>>;

    /// The most recent observation of every school.
    fn latest(&self) -> Result<Vec<HistoryEntry>>;
}

/// Snapshot rows for one school.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolCount {
    pub school_id: String,
    pub school_name: String,
    pub count: usize,
}
