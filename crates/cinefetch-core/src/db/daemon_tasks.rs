//! Mirror of daemon task handles
//!
//! The daemon keeps running when we exit, so the handles we own are written
//! here and reloaded on the next start.

use crate::db::Database;
use crate::error::Result;
use crate::types::TaskKind;
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::path::PathBuf;

/// A daemon task as remembered across restarts
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredTask {
    pub id: String,
    pub source_uri: String,
    pub title: String,
    pub kind: TaskKind,
    pub destination: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Daemon handle mirror operations
pub struct DaemonTasksDb;

impl DaemonTasksDb {
    pub fn save(db: &Database, task: &MirroredTask) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO daemon_tasks
                (id, source_uri, title, kind, destination, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    task.id,
                    task.source_uri,
                    task.title,
                    task.kind.to_string(),
                    task.destination.to_string_lossy().to_string(),
                    task.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list(db: &Database) -> Result<Vec<MirroredTask>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_uri, title, kind, destination, created_at FROM daemon_tasks ORDER BY created_at",
            )?;

            let tasks = stmt
                .query_map([], |row| {
                    let kind: String = row.get(3)?;
                    let destination: String = row.get(4)?;
                    let created_at: String = row.get(5)?;
                    Ok(MirroredTask {
                        id: row.get(0)?,
                        source_uri: row.get(1)?,
                        title: row.get(2)?,
                        kind: TaskKind::from(kind.as_str()),
                        destination: PathBuf::from(destination),
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(tasks)
        })
    }

    pub fn delete(db: &Database, id: &str) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute("DELETE FROM daemon_tasks WHERE id = ?1", params![id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let task = MirroredTask {
            id: "2089b05ecca3d829".into(),
            source_uri: "https://example.org/a.mkv".into(),
            title: "A".into(),
            kind: TaskKind::TvEpisode,
            destination: PathBuf::from("/media/TV/A"),
            created_at: Utc::now(),
        };

        DaemonTasksDb::save(&db, &task).unwrap();
        DaemonTasksDb::save(&db, &task).unwrap();
        let listed = DaemonTasksDb::list(&db).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, TaskKind::TvEpisode);
        assert_eq!(listed[0].destination, PathBuf::from("/media/TV/A"));

        DaemonTasksDb::delete(&db, "2089b05ecca3d829").unwrap();
        assert!(DaemonTasksDb::list(&db).unwrap().is_empty());
    }
}
