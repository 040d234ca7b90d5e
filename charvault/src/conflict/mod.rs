// Conflict detection - advisory, read-only checks run before destructive operations

use crate::backup::BackupInfo;
use crate::document::{character_of, normalize_filename};
use crate::error::Result;
use crate::schema::DocumentType;
use crate::store::Store;
use crate::system_db::DocumentRecord;
use crate::util::mentions;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Backups echoed in `FileInfo`
const RECENT_BACKUPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    CoreCharacterFile,
    LastCharacterDocument,
    ReferencedByOtherDocuments,
    RecentlyModified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub message: String,
    pub severity: Severity,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub recent_backups: Vec<BackupInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCheckResult {
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConflictCheckResult {
    /// True if any conflict is blocking by convention
    pub fn has_errors(&self) -> bool {
        self.conflicts.iter().any(|c| c.severity == Severity::Error)
    }
}

impl Store {
    /// Inspect what deleting or overwriting `filename` would affect.
    /// Never mutates anything; the caller decides whether to proceed.
    pub fn check_conflicts(&self, filename: &str) -> Result<ConflictCheckResult> {
        let filename = normalize_filename(filename)?;
        let Some(record) = self.db.get_document(&filename)? else {
            return Ok(ConflictCheckResult {
                has_conflicts: false,
                conflicts: Vec::new(),
                file_info: None,
                message: Some(format!("{filename} does not exist")),
            });
        };

        let character = character_of(&filename).to_string();
        let prefix = format!("{character}/");
        let siblings: Vec<String> = self
            .db
            .list_documents(Some(&prefix))?
            .into_iter()
            .map(|r| r.filename)
            .filter(|f| *f != filename)
            .collect();
        let is_character_file = DocumentType::classify(&filename) == DocumentType::Character;

        let mut conflicts = Vec::new();

        if is_character_file && !siblings.is_empty() {
            conflicts.push(ConflictInfo {
                conflict_type: ConflictType::CoreCharacterFile,
                message: format!(
                    "{filename} is the core record of '{character}', which still has {} other document(s)",
                    siblings.len()
                ),
                severity: Severity::Error,
                recommendation: format!(
                    "Delete or move the other documents of '{character}' first, or export the character as a backup"
                ),
                details: Some(json!({ "sibling_files": siblings })),
            });
        }

        if siblings.is_empty() {
            conflicts.push(ConflictInfo {
                conflict_type: ConflictType::LastCharacterDocument,
                message: format!("{filename} is the last document of '{character}'"),
                severity: Severity::Warning,
                recommendation: format!(
                    "Deleting it removes '{character}' from the character list; export it first if you may need it"
                ),
                details: None,
            });
        }

        let referencing = self.referencing_files(&record, &character, is_character_file || siblings.is_empty())?;
        if !referencing.is_empty() {
            conflicts.push(ConflictInfo {
                conflict_type: ConflictType::ReferencedByOtherDocuments,
                message: format!(
                    "{} document(s) of other characters refer to {}",
                    referencing.len(),
                    if is_character_file { character.as_str() } else { filename.as_str() }
                ),
                severity: Severity::Warning,
                recommendation: "Review and update the referencing documents after this change".into(),
                details: Some(json!({ "referencing_files": referencing })),
            });
        }

        let window = Duration::seconds(self.config.recent_edit_window_secs as i64);
        let age = Utc::now() - record.last_modified;
        if age < window {
            conflicts.push(ConflictInfo {
                conflict_type: ConflictType::RecentlyModified,
                message: format!("{filename} was modified {}s ago", age.num_seconds().max(0)),
                severity: Severity::Warning,
                recommendation: "Make sure nobody else is still editing this document".into(),
                details: Some(json!({
                    "last_modified": record.last_modified,
                    "window_secs": self.config.recent_edit_window_secs,
                })),
            });
        }

        let mut recent_backups = self.list_backups(Some(&filename))?;
        recent_backups.truncate(RECENT_BACKUPS);

        let message = if conflicts.is_empty() {
            None
        } else {
            Some(format!("{} potential conflict(s) found", conflicts.len()))
        };

        Ok(ConflictCheckResult {
            has_conflicts: !conflicts.is_empty(),
            conflicts,
            file_info: Some(FileInfo {
                filename: record.filename,
                size: record.size,
                last_modified: record.last_modified,
                recent_backups,
            }),
            message,
        })
    }

    /// Files under other characters that mention this document. The
    /// character's key and display name count as mentions only when the
    /// whole character is at stake.
    fn referencing_files(
        &self,
        record: &DocumentRecord,
        character: &str,
        include_character: bool,
    ) -> Result<Vec<String>> {
        let mut needles = vec![record.filename.clone()];
        if include_character {
            needles.push(character.to_string());
            if let Some(name) = self.display_name(character)? {
                needles.push(name);
            }
        }

        let prefix = format!("{character}/");
        let mut found = BTreeSet::new();
        for needle in &needles {
            for candidate in self.db.find_references(needle, &prefix)? {
                // The index scan also hits keys; only string values count
                if mentions(&candidate.parse_content()?, needle) {
                    found.insert(candidate.filename);
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    fn display_name(&self, character: &str) -> Result<Option<String>> {
        let key = format!("{character}/{}", DocumentType::Character.file_name());
        let Some(record) = self.db.get_document(&key)? else {
            return Ok(None);
        };
        let name = record
            .parse_content()?
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Ok(name)
    }
}
