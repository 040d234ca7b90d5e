// Backup history - append-only snapshots of prior document states

use crate::document::{self, normalize_filename, Document};
use crate::error::{KbError, Result};
use crate::store::Store;
use crate::system_db::{BackupRecord, SystemDb};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata of one backup. Content is only read back by `restore_backup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    /// True when no live document existed at snapshot time
    #[serde(default)]
    pub tombstone: bool,
}

impl From<BackupRecord> for BackupInfo {
    fn from(record: BackupRecord) -> Self {
        // Rendered content is never empty, so size 0 marks a tombstone
        let tombstone = record.size == 0;
        BackupInfo {
            backup_id: record.backup_id,
            filename: record.filename,
            created_at: record.created_at,
            size: record.size,
            tombstone,
        }
    }
}

/// What a restore did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The backup that was applied
    pub restored: BackupInfo,
    /// Snapshot of the live state the restore replaced
    pub snapshot: BackupInfo,
    /// The live document after the restore; `None` if a tombstone was
    /// restored and the document removed
    pub document: Option<Document>,
}

/// Writes and prunes backup rows
pub(crate) struct BackupManager<'a> {
    db: &'a SystemDb,
    retention: Option<usize>,
}

impl<'a> BackupManager<'a> {
    pub(crate) fn new(db: &'a SystemDb, retention: Option<usize>) -> Self {
        BackupManager { db, retention }
    }

    /// Append a snapshot of `content`, or a tombstone when `content` is
    /// `None`.
    pub(crate) fn snapshot(&self, filename: &str, content: Option<&Value>) -> Result<BackupInfo> {
        let (content_json, size) = match content {
            Some(value) => (
                Some(serde_json::to_string(value)?),
                document::render(value)?.len() as u64,
            ),
            None => (None, 0),
        };

        let record = BackupRecord {
            backup_id: ulid::Ulid::new().to_string(),
            filename: filename.to_string(),
            created_at: Utc::now(),
            size,
            content_json,
        };
        self.db.insert_backup(&record)?;

        if let Some(keep) = self.retention {
            let pruned = self.db.prune_backups(filename, keep)?;
            if pruned > 0 {
                log::debug!("Pruned {pruned} old backup(s) of {filename}");
            }
        }

        Ok(BackupInfo::from(record))
    }
}

impl Store {
    /// Backup metadata, newest first, optionally for one filename.
    pub fn list_backups(&self, filename: Option<&str>) -> Result<Vec<BackupInfo>> {
        let filename = filename.map(normalize_filename).transpose()?;
        let records = self.db.list_backups(filename.as_deref())?;
        Ok(records.into_iter().map(BackupInfo::from).collect())
    }

    /// Make a backup's content live again. The state being replaced is
    /// snapshotted first, so a restore never destroys anything.
    pub fn restore_backup(&self, backup_id: &str) -> Result<RestoreOutcome> {
        let record = self
            .db
            .get_backup(backup_id)?
            .ok_or_else(|| KbError::NotFound(format!("backup {backup_id}")))?;
        let frozen = record.parse_content()?;
        let filename = record.filename.clone();

        let _guard = self.lock_writes();
        let live = self.db.get_document(&filename)?;

        let pre_image = match &live {
            Some(live_record) => Some(self.read_live(live_record)?),
            None => None,
        };
        let snapshot = self.backups().snapshot(&filename, pre_image.as_ref())?;

        let document = match frozen {
            Some(content) => {
                let version = live.map(|r| r.version + 1).unwrap_or(1);
                Some(self.persist(&filename, &content, version)?)
            }
            None => {
                if live.is_some() {
                    self.remove_live(&filename)?;
                }
                None
            }
        };

        log::info!(
            "Restored {filename} from backup {backup_id} (snapshot {})",
            snapshot.backup_id
        );

        Ok(RestoreOutcome {
            restored: BackupInfo::from(record),
            snapshot,
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().to_str().unwrap()).unwrap();
        (tmp, store)
    }

    fn character(level: u64) -> Value {
        json!({ "name": "Aragorn", "race": "Human", "class": "Ranger", "total_level": level })
    }

    const FILE: &str = "aragorn/character.json";

    #[test]
    fn test_create_takes_no_backup() {
        let (_tmp, store) = setup_test_store();
        store.create_file(FILE, character(1)).unwrap();
        assert!(store.list_backups(Some(FILE)).unwrap().is_empty());
    }

    #[test]
    fn test_backup_count_only_grows() {
        let (_tmp, store) = setup_test_store();
        store.create_file(FILE, character(1)).unwrap();

        store.update_file(FILE, character(2)).unwrap();
        let after_update = store.list_backups(Some(FILE)).unwrap();
        assert_eq!(after_update.len(), 1);

        store.update_file(FILE, character(3)).unwrap();
        let backup = store.delete_file(FILE).unwrap();
        store.restore_backup(&backup.backup_id).unwrap();

        let all = store.list_backups(Some(FILE)).unwrap();
        assert_eq!(all.len(), 4);
        // The first backup is untouched and now the oldest
        assert_eq!(all.last().unwrap(), &after_update[0]);
        // Newest first
        assert_eq!(all[1].backup_id, backup.backup_id);
    }

    #[test]
    fn test_delete_then_restore_scenario() {
        let (_tmp, store) = setup_test_store();
        store.create_file(FILE, character(1)).unwrap();

        let backup = store.delete_file(FILE).unwrap();
        let outcome = store.restore_backup(&backup.backup_id).unwrap();

        assert!(outcome.snapshot.tombstone);
        assert_eq!(store.get_file(FILE).unwrap().content, character(1));
        assert_eq!(store.list_backups(Some(FILE)).unwrap().len(), 2);
    }

    #[test]
    fn test_restore_is_reversible() {
        let (_tmp, store) = setup_test_store();
        store.create_file(FILE, character(1)).unwrap();
        store.update_file(FILE, character(2)).unwrap();
        let first = store.list_backups(Some(FILE)).unwrap().remove(0);

        let outcome = store.restore_backup(&first.backup_id).unwrap();
        assert_eq!(store.get_file(FILE).unwrap().content, character(1));

        store.restore_backup(&outcome.snapshot.backup_id).unwrap();
        assert_eq!(store.get_file(FILE).unwrap().content, character(2));
    }

    #[test]
    fn test_restoring_tombstone_removes_live_document() {
        let (_tmp, store) = setup_test_store();
        store.create_file(FILE, character(1)).unwrap();
        let deleted = store.delete_file(FILE).unwrap();

        let outcome = store.restore_backup(&deleted.backup_id).unwrap();
        let undo = store.restore_backup(&outcome.snapshot.backup_id).unwrap();

        assert!(undo.document.is_none());
        assert!(undo.restored.tombstone);
        assert!(!store.exists(FILE).unwrap());
    }

    #[test]
    fn test_restore_unknown_backup() {
        let (_tmp, store) = setup_test_store();
        assert!(matches!(
            store.restore_backup("01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            Err(KbError::NotFound(_))
        ));
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            backup_retention: Some(2),
            ..StoreConfig::default()
        };
        let store = Store::open_with(tmp.path().to_str().unwrap(), config).unwrap();
        store.create_file(FILE, character(1)).unwrap();
        for level in 2..=5 {
            store.update_file(FILE, character(level)).unwrap();
        }

        let backups = store.list_backups(Some(FILE)).unwrap();
        assert_eq!(backups.len(), 2);
        let newest = store.db.get_backup(&backups[0].backup_id).unwrap().unwrap();
        assert_eq!(newest.parse_content().unwrap(), Some(character(4)));
    }
}
