use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// The system database that holds the document index and the backup history.
///
/// Document content lives in files under the data directory; the index keeps
/// a copy of each document's JSON for reference scans.
pub struct SystemDb {
    conn: Mutex<Connection>,
}

impl SystemDb {
    /// Open or create the system database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = SystemDb {
            conn: Mutex::new(conn),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open an in-memory system database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = SystemDb {
            conn: Mutex::new(conn),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning is ignored: every statement is atomic on its own.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                filename TEXT PRIMARY KEY,
                file_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                last_modified TEXT NOT NULL,
                version INTEGER NOT NULL,
                content_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backups (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_id TEXT NOT NULL UNIQUE,
                filename TEXT NOT NULL,
                created_at TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_backups_filename ON backups(filename);
            ",
        )?;
        Ok(())
    }

    // ── Document Index ───────────────────────────────────────────────

    /// Insert or replace a document in the index.
    pub fn upsert_document(&self, record: &DocumentRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO documents (filename, file_type, size, last_modified, version, content_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.filename,
                record.file_type,
                record.size as i64,
                format_timestamp(&record.last_modified),
                record.version as i64,
                record.content_json
            ],
        )?;
        Ok(())
    }

    /// Get a document from the index by filename.
    pub fn get_document(&self, filename: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                "SELECT filename, file_type, size, last_modified, version, content_json
                 FROM documents WHERE filename = ?1",
                params![filename],
                DocumentRecord::from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// List indexed documents, optionally restricted to a filename prefix.
    pub fn list_documents(&self, prefix: Option<&str>) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT filename, file_type, size, last_modified, version, content_json
             FROM documents
             WHERE ?1 IS NULL OR substr(filename, 1, length(?1)) = ?1
             ORDER BY filename",
        )?;
        let rows = stmt.query_map(params![prefix], DocumentRecord::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    /// Remove a document from the index. Returns whether a row was removed.
    pub fn delete_document(&self, filename: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM documents WHERE filename = ?1", params![filename])?;
        Ok(changed > 0)
    }

    /// Documents outside `exclude_prefix` whose JSON may mention `needle`.
    /// The match is a coarse substring scan; callers refine it. SQLite's
    /// `LIKE` only folds ASCII case and sees JSON-escaped text, so any other
    /// needle returns every document outside the prefix.
    pub fn find_references(&self, needle: &str, exclude_prefix: &str) -> Result<Vec<DocumentRecord>> {
        let prefilter = needle
            .chars()
            .all(|c| c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\'));
        let pattern = if prefilter {
            format!("%{}%", escape_like(needle))
        } else {
            "%".to_string()
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT filename, file_type, size, last_modified, version, content_json
             FROM documents
             WHERE substr(filename, 1, length(?1)) != ?1 AND content_json LIKE ?2 ESCAPE '\\'
             ORDER BY filename",
        )?;
        let rows = stmt.query_map(params![exclude_prefix, pattern], DocumentRecord::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    // ── Backups ──────────────────────────────────────────────────────

    /// Append a backup. Existing rows are never touched.
    pub fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO backups (backup_id, filename, created_at, size, content_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.backup_id,
                record.filename,
                format_timestamp(&record.created_at),
                record.size as i64,
                record.content_json
            ],
        )?;
        Ok(())
    }

    /// Backup metadata, newest first, optionally for one filename.
    pub fn list_backups(&self, filename: Option<&str>) -> Result<Vec<BackupRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT backup_id, filename, created_at, size, NULL
             FROM backups
             WHERE ?1 IS NULL OR filename = ?1
             ORDER BY seq DESC",
        )?;
        let rows = stmt.query_map(params![filename], BackupRecord::from_row)?;

        let mut backups = Vec::new();
        for row in rows {
            backups.push(row?);
        }
        Ok(backups)
    }

    /// A single backup including its frozen content.
    pub fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                "SELECT backup_id, filename, created_at, size, content_json
                 FROM backups WHERE backup_id = ?1",
                params![backup_id],
                BackupRecord::from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn count_backups(&self, filename: Option<&str>) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM backups WHERE ?1 IS NULL OR filename = ?1",
            params![filename],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop all but the newest `keep` backups of a filename. Only used when
    /// a retention cap is configured.
    pub fn prune_backups(&self, filename: &str, keep: usize) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM backups
             WHERE filename = ?1 AND seq NOT IN (
                SELECT seq FROM backups WHERE filename = ?1 ORDER BY seq DESC LIMIT ?2
             )",
            params![filename, keep as i64],
        )?;
        Ok(removed)
    }
}

/// A row of the documents table
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub filename: String,
    pub file_type: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub version: u64,
    pub content_json: String,
}

impl DocumentRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRecord {
            filename: row.get(0)?,
            file_type: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            last_modified: parse_timestamp(row, 3)?,
            version: row.get::<_, i64>(4)? as u64,
            content_json: row.get(5)?,
        })
    }

    /// Parse the stored JSON copy of the content
    pub fn parse_content(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.content_json)?)
    }
}

/// A row of the backups table. `content_json` is `None` for tombstones and
/// for metadata-only listings.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub backup_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub content_json: Option<String>,
}

impl BackupRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(BackupRecord {
            backup_id: row.get(0)?,
            filename: row.get(1)?,
            created_at: parse_timestamp(row, 2)?,
            size: row.get::<_, i64>(3)? as u64,
            content_json: row.get(4)?,
        })
    }

    /// Frozen content, or `None` if the backup is a tombstone
    pub fn parse_content(&self) -> Result<Option<serde_json::Value>> {
        match &self.content_json {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
