//! Job repository — whole-set persistence for the `jobs` table.
//!
//! The queue owns the authoritative in-memory copy of all jobs and writes
//! through on every mutation, so the repository exposes `load_all` and
//! `replace_all` rather than per-row CRUD. `replace_all` runs in a single
//! transaction, making each save crash-atomic.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub input: String,
    pub input_preview: String,
    pub status: String,
    pub progress: i64,
    pub current_step: Option<String>,
    pub steps: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub attachments: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            input: row.get("input")?,
            input_preview: row.get("input_preview")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            current_step: row.get("current_step")?,
            steps: row.get("steps")?,
            result: row.get("result")?,
            error: row.get("error")?,
            attachments: row.get("attachments")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Loads all job rows, oldest first.
pub fn load_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?;
        let rows: Vec<JobRow> = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Replaces the full job set in one transaction.
pub fn replace_all(db: &Database, rows: &[JobRow]) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM jobs", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO jobs (id, kind, input, input_preview, status, progress,
                 current_step, steps, result, error, attachments, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.id,
                    row.kind,
                    row.input,
                    row.input_preview,
                    row.status,
                    row.progress,
                    row.current_step,
                    row.steps,
                    row.result,
                    row.error,
                    row.attachments,
                    row.created_at,
                    row.completed_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_row(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            kind: "note".to_string(),
            input: "Meeting notes".to_string(),
            input_preview: "Meeting notes".to_string(),
            status: "queued".to_string(),
            progress: 0,
            current_step: None,
            steps: "[]".to_string(),
            result: None,
            error: None,
            attachments: "[]".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            completed_at: None,
        }
    }

    #[test]
    fn test_replace_and_load() {
        let db = test_db();
        let rows = vec![sample_row("j1"), sample_row("j2")];
        replace_all(&db, &rows).unwrap();

        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "j1");
        assert_eq!(loaded[0].status, "queued");
    }

    #[test]
    fn test_replace_overwrites_previous_set() {
        let db = test_db();
        replace_all(&db, &[sample_row("a"), sample_row("b")]).unwrap();
        replace_all(&db, &[sample_row("c")]).unwrap();

        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c");
    }

    #[test]
    fn test_load_orders_by_created_at() {
        let db = test_db();
        let mut newer = sample_row("newer");
        newer.created_at = "2026-02-01T00:00:00+00:00".to_string();
        let older = sample_row("older");
        replace_all(&db, &[newer, older]).unwrap();

        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded[0].id, "older");
        assert_eq!(loaded[1].id, "newer");
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let db = test_db();
        let mut row = sample_row("rt");
        row.status = "complete".to_string();
        row.progress = 100;
        row.steps = r#"["Extracting","Summarizing"]"#.to_string();
        row.result = Some(r#"{"summary":"done"}"#.to_string());
        row.completed_at = Some("2026-01-01T00:05:00+00:00".to_string());

        replace_all(&db, std::slice::from_ref(&row)).unwrap();
        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded, vec![row.clone()]);

        // Writing back what was just loaded is a no-op.
        replace_all(&db, &loaded).unwrap();
        assert_eq!(load_all(&db).unwrap(), vec![row]);
    }

    #[test]
    fn test_empty_set() {
        let db = test_db();
        replace_all(&db, &[sample_row("x")]).unwrap();
        replace_all(&db, &[]).unwrap();
        assert!(load_all(&db).unwrap().is_empty());
    }
}
