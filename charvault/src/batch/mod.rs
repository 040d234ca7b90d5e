// Batch runner - multi-document writes and character creation

use crate::document::normalize_filename;
use crate::error::{KbError, Result};
use crate::schema::DocumentType;
use crate::store::Store;
use crate::util::{character_key, deep_merge};
use crate::validation::ValidationResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperationKind {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFileOperation {
    pub filename: String,
    pub content: Value,
    pub operation: BatchOperationKind,
}

/// Per-operation result, reported in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub filename: String,
    pub operation: BatchOperationKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl BatchOutcome {
    fn succeeded(op: &BatchFileOperation, version: u64) -> Self {
        BatchOutcome {
            filename: op.filename.clone(),
            operation: op.operation,
            success: true,
            version: Some(version),
            error: None,
            validation: None,
        }
    }

    fn failed(op: &BatchFileOperation, error: &KbError) -> Self {
        let validation = match error {
            KbError::ValidationFailed(result) => Some(result.clone()),
            _ => None,
        };
        BatchOutcome {
            filename: op.filename.clone(),
            operation: op.operation,
            success: false,
            version: None,
            error: Some(error.to_string()),
            validation,
        }
    }

    fn skipped(op: &BatchFileOperation, reason: &str) -> Self {
        BatchOutcome {
            filename: op.filename.clone(),
            operation: op.operation,
            success: false,
            version: None,
            error: Some(reason.to_string()),
            validation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<BatchOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    /// Set by `execute_batch_atomic` when applied writes were undone
    #[serde(default)]
    pub rolled_back: bool,
}

impl BatchReport {
    fn from_results(results: Vec<BatchOutcome>, rolled_back: bool) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        BatchReport {
            failed: results.len() - succeeded,
            succeeded,
            results,
            rolled_back,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Run `work` over `items` on scoped threads, at most `max_concurrency` at
/// a time, and return the results in input order.
pub(crate) fn fan_out<T, R, F>(items: Vec<T>, max_concurrency: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let mut results = Vec::with_capacity(items.len());
    let mut pending = items.into_iter().peekable();
    let work = &work;

    while pending.peek().is_some() {
        let wave: Vec<T> = pending.by_ref().take(max_concurrency.max(1)).collect();
        std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .into_iter()
                .map(|item| scope.spawn(move || work(item)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });
    }

    results
}

enum Undo {
    Remove(String),
    Restore(String),
}

impl Store {
    /// Apply each operation independently and concurrently. A failed
    /// operation never stops or undoes the others.
    pub fn execute_batch(&self, operations: Vec<BatchFileOperation>) -> BatchReport {
        let total = operations.len();
        let results = fan_out(operations, self.config.max_concurrency, |op| {
            let outcome = match op.operation {
                BatchOperationKind::Create => self.create_file(&op.filename, op.content.clone()),
                BatchOperationKind::Update => self.update_file(&op.filename, op.content.clone()),
            };
            match outcome {
                Ok(doc) => BatchOutcome::succeeded(&op, doc.version),
                Err(e) => {
                    log::debug!("Batch {:?} of {} failed: {e}", op.operation, op.filename);
                    BatchOutcome::failed(&op, &e)
                }
            }
        });

        let report = BatchReport::from_results(results, false);
        log::info!(
            "Batch of {total}: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        report
    }

    /// All-or-nothing batch. Every operation is checked before anything is
    /// written; if a write still fails, the writes already applied are
    /// undone. Undoing an update restores its backup, so history only grows.
    pub fn execute_batch_atomic(&self, operations: Vec<BatchFileOperation>) -> BatchReport {
        let mut problems: Vec<Option<KbError>> = Vec::with_capacity(operations.len());
        let mut normalized = Vec::with_capacity(operations.len());
        let mut seen = HashSet::new();

        for op in &operations {
            match self.precheck(op, &mut seen) {
                Ok(filename) => {
                    normalized.push(filename);
                    problems.push(None);
                }
                Err(e) => {
                    normalized.push(String::new());
                    problems.push(Some(e));
                }
            }
        }

        if problems.iter().any(Option::is_some) {
            let results = operations
                .iter()
                .zip(&problems)
                .map(|(op, problem)| match problem {
                    Some(e) => BatchOutcome::failed(op, e),
                    None => BatchOutcome::skipped(op, "not applied: another operation in the batch failed"),
                })
                .collect();
            log::info!("Atomic batch rejected before writing");
            return BatchReport::from_results(results, false);
        }

        let mut undo_log = Vec::new();
        let mut results = Vec::with_capacity(operations.len());
        let mut failure = None;

        for (index, (op, filename)) in operations.iter().zip(&normalized).enumerate() {
            let applied = match op.operation {
                BatchOperationKind::Create => self
                    .apply_create(filename, op.content.clone())
                    .map(|doc| (doc, Undo::Remove(filename.clone()))),
                BatchOperationKind::Update => self
                    .apply_update(filename, op.content.clone(), None)
                    .map(|(doc, backup)| (doc, Undo::Restore(backup.backup_id))),
            };
            match applied {
                Ok((doc, undo)) => {
                    undo_log.push(undo);
                    results.push(BatchOutcome::succeeded(op, doc.version));
                }
                Err(e) => {
                    failure = Some((index, e));
                    break;
                }
            }
        }

        let Some((failed_at, error)) = failure else {
            log::info!("Atomic batch of {} applied", operations.len());
            return BatchReport::from_results(results, false);
        };

        log::warn!("Atomic batch failed at {}: {error}; rolling back", operations[failed_at].filename);
        for undo in undo_log.into_iter().rev() {
            if let Err(e) = self.undo(&undo) {
                log::warn!("Rollback step failed: {e}");
            }
        }

        let results = operations
            .iter()
            .enumerate()
            .map(|(index, op)| {
                if index < failed_at {
                    BatchOutcome::skipped(op, "rolled back: a later operation in the batch failed")
                } else if index == failed_at {
                    BatchOutcome::failed(op, &error)
                } else {
                    BatchOutcome::skipped(op, "not applied: another operation in the batch failed")
                }
            })
            .collect();
        BatchReport::from_results(results, true)
    }

    /// Materialize the canonical documents of a new character from the
    /// catalog templates, overlaying `sections` (keyed by type name).
    pub fn create_character(&self, name: &str, sections: &BTreeMap<String, Value>) -> Result<BatchReport> {
        let key = character_key(name);
        if key.is_empty() {
            return Err(KbError::InvalidFilename {
                filename: name.to_string(),
                reason: "character name has no usable characters".into(),
            });
        }

        let mut overlays = BTreeMap::new();
        for (type_name, section) in sections {
            let doc_type: DocumentType = type_name.parse()?;
            overlays.insert(doc_type, section);
        }

        let mut operations = Vec::new();
        for doc_type in DocumentType::CANONICAL {
            let mut content = self.catalog.template(doc_type.as_str())?;
            if doc_type == DocumentType::Character {
                content["name"] = Value::String(name.trim().to_string());
            }
            if let Some(section) = overlays.get(&doc_type) {
                deep_merge(&mut content, section);
            }
            operations.push(BatchFileOperation {
                filename: format!("{key}/{}", doc_type.file_name()),
                content,
                operation: BatchOperationKind::Create,
            });
        }

        log::info!("Creating character '{}' as {key}/", name.trim());
        Ok(self.execute_batch(operations))
    }

    /// Everything an operation needs before it may be written: a valid key,
    /// the right existence state, no repeat of an earlier key in the batch,
    /// and valid content.
    fn precheck(&self, op: &BatchFileOperation, seen: &mut HashSet<String>) -> Result<String> {
        let filename = normalize_filename(&op.filename)?;
        if !seen.insert(filename.clone()) {
            return Err(KbError::Conflict(format!("{filename} appears more than once in the batch")));
        }
        let exists = self.db.get_document(&filename)?.is_some();
        match op.operation {
            BatchOperationKind::Create if self.occupied(&filename)? => {
                return Err(KbError::Conflict(format!("{filename} already exists")));
            }
            BatchOperationKind::Update if !exists => {
                return Err(KbError::NotFound(filename));
            }
            _ => {}
        }
        self.ensure_valid(&filename, &op.content)?;
        Ok(filename)
    }

    fn undo(&self, undo: &Undo) -> Result<()> {
        match undo {
            Undo::Remove(filename) => {
                let _guard = self.lock_writes();
                self.remove_live(filename)
            }
            Undo::Restore(backup_id) => self.restore_backup(backup_id).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().to_str().unwrap()).unwrap();
        (tmp, store)
    }

    fn create(filename: &str, content: Value) -> BatchFileOperation {
        BatchFileOperation {
            filename: filename.into(),
            content,
            operation: BatchOperationKind::Create,
        }
    }

    fn update(filename: &str, content: Value) -> BatchFileOperation {
        BatchFileOperation {
            filename: filename.into(),
            content,
            operation: BatchOperationKind::Update,
        }
    }

    fn character(level: i64) -> Value {
        json!({ "name": "Aragorn", "race": "Human", "class": "Ranger", "total_level": level })
    }

    #[test]
    fn test_fan_out_keeps_input_order() {
        let doubled = fan_out((0..20).collect(), 3, |n: i32| n * 2);
        assert_eq!(doubled, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_partial_failure_is_reported_not_rolled_back() {
        let (_tmp, store) = setup_test_store();
        let report = store.execute_batch(vec![
            create("aragorn/character.json", character(1)),
            create("aragorn/spell_list.json", json!({ "spells": [{ "name": "", "level": 1 }] })),
            update("aragorn/action_list.json", json!({ "actions": [] })),
            create("aragorn/inventory_list.json", json!({ "items": [] })),
        ]);

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 2);
        assert!(!report.rolled_back);
        let flags: Vec<bool> = report.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, false, true]);
        assert!(report.results[1].validation.is_some());

        let files: Vec<String> = store
            .list_files(Some("aragorn/"))
            .unwrap()
            .into_iter()
            .map(|d| d.filename)
            .collect();
        assert_eq!(files, vec!["aragorn/character.json", "aragorn/inventory_list.json"]);
    }

    #[test]
    fn test_atomic_batch_rejects_before_writing() {
        let (_tmp, store) = setup_test_store();
        let report = store.execute_batch_atomic(vec![
            create("aragorn/character.json", character(1)),
            create("aragorn/character.json", character(2)),
        ]);

        assert_eq!(report.succeeded, 0);
        assert!(!report.rolled_back);
        assert!(report.results[0].error.as_deref().unwrap().starts_with("not applied"));
        assert!(store.list_files(None).unwrap().is_empty());
    }

    #[test]
    fn test_atomic_batch_applies_everything() {
        let (_tmp, store) = setup_test_store();
        store.create_file("aragorn/character.json", character(1)).unwrap();

        let report = store.execute_batch_atomic(vec![
            update("aragorn/character.json", character(2)),
            create("aragorn/inventory_list.json", json!({ "items": [] })),
        ]);

        assert!(report.all_succeeded());
        assert_eq!(report.results[0].version, Some(2));
        assert_eq!(store.get_file("aragorn/character.json").unwrap().content, character(2));
    }

    #[test]
    fn test_atomic_batch_rolls_back_when_a_write_fails() {
        let (tmp, store) = setup_test_store();
        store.create_file("aragorn/character.json", character(1)).unwrap();
        // A plain file where the character directory should be: the key is
        // free and the content valid, but the write itself fails.
        std::fs::write(tmp.path().join("legolas"), "not a directory").unwrap();

        let report = store.execute_batch_atomic(vec![
            update("aragorn/character.json", character(2)),
            create("aragorn/inventory_list.json", json!({ "items": [] })),
            create("legolas/spell_list.json", json!({ "spells": [] })),
            create("aragorn/action_list.json", json!({ "actions": [] })),
        ]);

        assert!(report.rolled_back);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 4);
        let errors: Vec<&str> = report
            .results
            .iter()
            .map(|r| r.error.as_deref().unwrap())
            .collect();
        assert!(errors[0].starts_with("rolled back"));
        assert!(errors[1].starts_with("rolled back"));
        assert!(!errors[2].starts_with("rolled back") && !errors[2].starts_with("not applied"));
        assert!(errors[3].starts_with("not applied"));

        let sheet = store.get_file("aragorn/character.json").unwrap();
        assert_eq!(sheet.content, character(1));
        assert!(!store.exists("aragorn/inventory_list.json").unwrap());
        assert!(!tmp.path().join("aragorn/inventory_list.json").exists());
        assert!(!store.exists("aragorn/action_list.json").unwrap());
        assert!(!store.exists("legolas/spell_list.json").unwrap());
    }

    #[test]
    fn test_undo_restores_update_and_removes_create() {
        let (_tmp, store) = setup_test_store();
        store.create_file("aragorn/character.json", character(1)).unwrap();
        let (_, backup) = store
            .apply_update("aragorn/character.json", character(2), None)
            .unwrap();
        store
            .apply_create("aragorn/inventory_list.json", json!({ "items": [] }))
            .unwrap();

        store
            .undo(&Undo::Remove("aragorn/inventory_list.json".into()))
            .unwrap();
        store.undo(&Undo::Restore(backup.backup_id)).unwrap();

        assert!(!store.exists("aragorn/inventory_list.json").unwrap());
        assert_eq!(store.get_file("aragorn/character.json").unwrap().content, character(1));
    }

    #[test]
    fn test_create_character_from_templates() {
        let (_tmp, store) = setup_test_store();
        let mut sections = BTreeMap::new();
        sections.insert(
            "character".to_string(),
            json!({ "race": "Dwarf", "class": "Fighter", "ability_scores": { "strength": 17 } }),
        );

        let report = store.create_character("Gimli, son of Glóin", &sections).unwrap();
        assert!(report.all_succeeded());
        assert_eq!(report.results.len(), 7);

        let sheet = store.get_file("gimli-son-of-gloin/character.json").unwrap();
        assert_eq!(sheet.content["name"], json!("Gimli, son of Glóin"));
        assert_eq!(sheet.content["ability_scores"]["strength"], json!(17));
        assert_eq!(sheet.content["ability_scores"]["dexterity"], json!(10));
        assert_eq!(store.list_characters().unwrap().characters, vec!["gimli-son-of-gloin"]);
    }

    #[test]
    fn test_create_character_without_required_fields_is_partial() {
        let (_tmp, store) = setup_test_store();
        let report = store.create_character("Boromir", &BTreeMap::new()).unwrap();

        // race and class stay empty in the template
        assert_eq!(report.failed, 1);
        let failed = report.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.filename, "boromir/character.json");
        assert_eq!(failed.validation.as_ref().unwrap().errors.len(), 2);
    }

    #[test]
    fn test_create_character_rejects_unknown_section() {
        let (_tmp, store) = setup_test_store();
        let mut sections = BTreeMap::new();
        sections.insert("wizard_hat".to_string(), json!({}));
        assert!(matches!(
            store.create_character("Gandalf", &sections),
            Err(KbError::UnknownType(_))
        ));
    }
}
