//! History database operations
//!
//! One row per source identifier. A row is inserted the first time a
//! transfer is seen active and updated in place on every terminal
//! transition afterwards. A `completed` row is final.

use crate::db::Database;
use crate::error::Result;
use crate::types::{HistoryRecord, TaskStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// History database operations
pub struct HistoryDb;

impl HistoryDb {
    /// Record the first active sighting of a source
    ///
    /// Returns `true` when a new row was created. An existing row is never
    /// duplicated; if it ended cancelled or in error it is reactivated.
    pub fn record_active(
        db: &Database,
        source_identifier: &str,
        display_name: &str,
        size_bytes: Option<u64>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO history
                (source_identifier, display_name, added_at, completed_at, final_status, size_bytes)
                VALUES (?1, ?2, ?3, NULL, ?4, ?5)
                "#,
                params![
                    source_identifier,
                    display_name,
                    now,
                    TaskStatus::Downloading.to_string(),
                    size_bytes.map(|s| s as i64),
                ],
            )?;

            if inserted == 0 {
                conn.execute(
                    r#"
                    UPDATE history
                    SET final_status = ?1, completed_at = NULL
                    WHERE source_identifier = ?2 AND final_status IN ('cancelled', 'error')
                    "#,
                    params![TaskStatus::Downloading.to_string(), source_identifier],
                )?;
            }

            Ok(inserted == 1)
        })
    }

    /// Move a record to a terminal status
    ///
    /// A record that already reached `completed` is left untouched. Returns
    /// whether a row was updated.
    pub fn finalize(
        db: &Database,
        source_identifier: &str,
        status: TaskStatus,
        size_bytes: Option<u64>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                UPDATE history
                SET final_status = ?1,
                    completed_at = ?2,
                    size_bytes = COALESCE(?3, size_bytes)
                WHERE source_identifier = ?4 AND final_status != 'completed'
                "#,
                params![
                    status.to_string(),
                    now,
                    size_bytes.map(|s| s as i64),
                    source_identifier,
                ],
            )?;
            Ok(updated > 0)
        })
    }

    /// Get a record by source identifier
    pub fn get(db: &Database, source_identifier: &str) -> Result<Option<HistoryRecord>> {
        db.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT source_identifier, display_name, added_at, completed_at, final_status, size_bytes
                FROM history WHERE source_identifier = ?1
                "#,
                params![source_identifier],
                |row| row_to_record(row),
            )
            .optional()
        })
    }

    /// All records, newest first
    pub fn list(db: &Database) -> Result<Vec<HistoryRecord>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT source_identifier, display_name, added_at, completed_at, final_status, size_bytes
                FROM history
                ORDER BY added_at DESC
                "#,
            )?;

            let records = stmt
                .query_map([], |row| row_to_record(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(records)
        })
    }

    /// Delete every record, returning how many were removed
    pub fn clear(db: &Database) -> Result<usize> {
        db.with_conn(|conn| conn.execute("DELETE FROM history", []))
    }

    /// Delete one record
    pub fn remove_one(db: &Database, source_identifier: &str) -> Result<bool> {
        db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM history WHERE source_identifier = ?1",
                params![source_identifier],
            )?;
            Ok(removed > 0)
        })
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<HistoryRecord> {
    let status_str: String = row.get(4)?;

    Ok(HistoryRecord {
        source_identifier: row.get(0)?,
        display_name: row.get(1)?,
        added_at: row.get(2)?,
        completed_at: row.get(3)?,
        final_status: TaskStatus::from(status_str.as_str()),
        size_bytes: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
    })
}
