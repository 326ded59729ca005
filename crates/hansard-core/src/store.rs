//! Hearing metadata store.
//!
//! A small SQLite table owned by the wider system; the pipeline reads one row
//! per job and, after persisting a transcript, updates exactly
//! `processing_stage`, `full_text_content` and `updated_at` inside a one-row
//! transaction. Connections are opened per operation and writes are
//! serialised per job by the pipeline, so no connection is shared across
//! tasks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// `processing_stage` value for a freshly captured hearing.
pub const STAGE_CAPTURED: &str = "captured";
/// `processing_stage` value once a transcript has been persisted.
pub const STAGE_TRANSCRIBED: &str = "transcribed";

/// One hearing row.
#[derive(Debug, Clone)]
pub struct HearingRecord {
    pub id: String,
    pub title: String,
    pub committee: String,
    pub date: String,
    pub processing_stage: String,
    pub full_text_content: Option<String>,
    pub updated_at: String,
}

impl HearingRecord {
    /// Whether the metadata a job needs is actually filled in.
    pub fn is_complete(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.committee.trim().is_empty()
            && !self.date.trim().is_empty()
    }
}

/// Handle to the hearings database.
pub struct HearingStore {
    db_path: PathBuf,
}

impl HearingStore {
    /// Open (and if needed create) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS hearings (
              id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              committee TEXT NOT NULL,
              date TEXT NOT NULL,
              processing_stage TEXT NOT NULL DEFAULT 'captured',
              full_text_content TEXT,
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))
    }

    /// Fetch one hearing, if present.
    pub fn hearing(&self, id: &str) -> Result<Option<HearingRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, title, committee, date, processing_stage, full_text_content, updated_at
                 FROM hearings WHERE id = ?",
                params![id],
                |row| {
                    Ok(HearingRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        committee: row.get(2)?,
                        date: row.get(3)?,
                        processing_stage: row.get(4)?,
                        full_text_content: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or replace a hearing row (used by the façade and by tests).
    pub fn upsert_hearing(&self, id: &str, title: &str, committee: &str, date: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO hearings (id, title, committee, date, processing_stage, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET title=excluded.title, committee=excluded.committee,
               date=excluded.date, updated_at=excluded.updated_at",
            params![id, title, committee, date, STAGE_CAPTURED, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record the persisted transcript text for a hearing, in one
    /// transaction touching one row.
    pub fn mark_transcribed(&self, id: &str, full_text: &str) -> Result<()> {
        let conn = self.connect()?;
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE hearings SET processing_stage=?, full_text_content=?, updated_at=? WHERE id=?",
            params![STAGE_TRANSCRIBED, full_text, Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;
        if changed == 0 {
            anyhow::bail!("hearing {id} not found in store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HearingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HearingStore::open(&dir.path().join("hearings.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_hearing_is_none() {
        let (_dir, store) = store();
        assert!(store.hearing("sh-0").unwrap().is_none());
    }

    #[test]
    fn upsert_then_fetch_round_trips() {
        let (_dir, store) = store();
        store
            .upsert_hearing("sh-117-42", "Oversight of the Markets", "Banking", "2025-06-12")
            .unwrap();
        let record = store.hearing("sh-117-42").unwrap().unwrap();
        assert_eq!(record.title, "Oversight of the Markets");
        assert_eq!(record.processing_stage, STAGE_CAPTURED);
        assert!(record.full_text_content.is_none());
        assert!(record.is_complete());
    }

    #[test]
    fn mark_transcribed_updates_only_the_expected_columns() {
        let (_dir, store) = store();
        store
            .upsert_hearing("sh-117-42", "Oversight of the Markets", "Banking", "2025-06-12")
            .unwrap();
        store
            .mark_transcribed("sh-117-42", "The committee will come to order.")
            .unwrap();
        let record = store.hearing("sh-117-42").unwrap().unwrap();
        assert_eq!(record.processing_stage, STAGE_TRANSCRIBED);
        assert_eq!(
            record.full_text_content.as_deref(),
            Some("The committee will come to order.")
        );
        assert_eq!(record.title, "Oversight of the Markets");
    }

    #[test]
    fn mark_transcribed_fails_for_unknown_hearing() {
        let (_dir, store) = store();
        assert!(store.mark_transcribed("sh-0", "text").is_err());
    }

    #[test]
    fn incomplete_metadata_is_detected() {
        let (_dir, store) = store();
        store.upsert_hearing("sh-1", " ", "Banking", "2025-06-12").unwrap();
        let record = store.hearing("sh-1").unwrap().unwrap();
        assert!(!record.is_complete());
    }
}
