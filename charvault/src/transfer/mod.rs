// Export/import - portable envelopes for one document or a whole character

use crate::backup::BackupInfo;
use crate::batch::fan_out;
use crate::document::{character_of, normalize_filename, relative_name, Document};
use crate::error::{KbError, Result};
use crate::schema::DocumentType;
use crate::store::Store;
use crate::util::character_key;
use crate::validation::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One exported document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub filename: String,
    pub content: Value,
}

/// Every document of one character. `character_data` is always `true`; it
/// is what tells a bundle apart from a single envelope on import. Only
/// `character_data` and `files` are needed to import a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterBundle {
    pub character_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
    pub files: Vec<Envelope>,
}

/// Result of importing a single envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub document: Document,
    /// Backup of the document that was overwritten, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced: Option<BackupInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub filename: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

/// Per-file outcome of a character import
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported_files: Vec<String>,
    pub failed_files: Vec<FailedFile>,
}

/// Whatever `import_payload` found in the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportResult {
    File(ImportOutcome),
    Character(ImportReport),
}

impl Store {
    pub fn export_file(&self, filename: &str) -> Result<Envelope> {
        let doc = self.get_file(filename)?;
        Ok(Envelope {
            filename: doc.filename,
            content: doc.content,
        })
    }

    /// Bundle every document of a character. `name` may be the directory
    /// key or the display name it was derived from.
    pub fn export_character(&self, name: &str) -> Result<CharacterBundle> {
        let mut key = name.trim().to_string();
        let mut docs = self.list_files(Some(&format!("{key}/")))?;
        if docs.is_empty() {
            key = character_key(name);
            docs = self.list_files(Some(&format!("{key}/")))?;
        }
        if docs.is_empty() {
            return Err(KbError::NotFound(format!("character {name}")));
        }

        let character_name = docs
            .iter()
            .find(|d| d.file_type == DocumentType::Character)
            .and_then(|d| d.content.get("name"))
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .unwrap_or(key);

        Ok(CharacterBundle {
            character_data: true,
            character_name: Some(character_name),
            exported_at: Some(Utc::now()),
            files: docs
                .into_iter()
                .map(|d| Envelope {
                    filename: d.filename,
                    content: d.content,
                })
                .collect(),
        })
    }

    /// Import one envelope under `filename`, or under its own filename.
    /// Content is re-validated; an existing document is only replaced when
    /// `overwrite` is set, and then it is backed up first.
    pub fn import_file(&self, envelope: &Envelope, filename: Option<&str>, overwrite: bool) -> Result<ImportOutcome> {
        let target = normalize_filename(filename.unwrap_or(&envelope.filename))?;
        let exists = self.db.get_document(&target)?.is_some();
        if !overwrite && self.occupied(&target)? {
            return Err(KbError::Conflict(format!("{target} already exists")));
        }

        self.ensure_valid(&target, &envelope.content)?;

        if exists {
            let (document, backup) = self.apply_update(&target, envelope.content.clone(), None)?;
            Ok(ImportOutcome {
                document,
                replaced: Some(backup),
            })
        } else {
            let document = self.apply_create(&target, envelope.content.clone())?;
            Ok(ImportOutcome {
                document,
                replaced: None,
            })
        }
    }

    /// Import every file of a bundle concurrently, optionally under a new
    /// character name. Failures are collected per file; the rest still land.
    pub fn import_character(
        &self,
        bundle: &CharacterBundle,
        name: Option<&str>,
        overwrite: bool,
    ) -> Result<ImportReport> {
        if !bundle.character_data {
            return Err(KbError::Malformed("not a character bundle".into()));
        }
        if bundle.files.is_empty() {
            return Err(KbError::Malformed("character bundle contains no files".into()));
        }
        let new_key = match name {
            Some(n) => {
                let key = character_key(n);
                if key.is_empty() {
                    return Err(KbError::InvalidFilename {
                        filename: n.to_string(),
                        reason: "character name has no usable characters".into(),
                    });
                }
                Some(key)
            }
            None => None,
        };

        let targets: Vec<(String, &Envelope)> = bundle
            .files
            .iter()
            .map(|envelope| {
                let target = match &new_key {
                    Some(key) => format!("{key}/{}", relative_name(&envelope.filename)),
                    None => envelope.filename.clone(),
                };
                (target, envelope)
            })
            .collect();

        let outcomes = fan_out(targets, self.config.max_concurrency, |(target, envelope)| {
            let result = self.import_file(envelope, Some(&target), overwrite);
            (target, result)
        });

        let mut report = ImportReport::default();
        for (target, result) in outcomes {
            match result {
                Ok(outcome) => report.imported_files.push(outcome.document.filename),
                Err(e) => {
                    log::debug!("Import of {target} failed: {e}");
                    let validation = match &e {
                        KbError::ValidationFailed(result) => Some(result.clone()),
                        _ => None,
                    };
                    report.failed_files.push(FailedFile {
                        filename: target,
                        error: e.to_string(),
                        validation,
                    });
                }
            }
        }

        let destination = new_key
            .as_deref()
            .unwrap_or_else(|| character_of(&bundle.files[0].filename));
        log::info!(
            "Imported '{}' into {destination}/: {} imported, {} failed",
            bundle.character_name.as_deref().unwrap_or(destination),
            report.imported_files.len(),
            report.failed_files.len()
        );
        Ok(report)
    }

    /// Parse raw JSON text and import it as a bundle or a single envelope,
    /// depending on the `character_data` marker. `name` is the new
    /// character name for a bundle, or the target filename for an envelope.
    pub fn import_payload(&self, text: &str, name: Option<&str>, overwrite: bool) -> Result<ImportResult> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| KbError::Malformed(format!("payload is not valid JSON: {e}")))?;
        if !value.is_object() {
            return Err(KbError::Malformed("payload must be a JSON object".into()));
        }

        if value.get("character_data").and_then(Value::as_bool) == Some(true) {
            let bundle: CharacterBundle = serde_json::from_value(value)
                .map_err(|e| KbError::Malformed(format!("invalid character bundle: {e}")))?;
            Ok(ImportResult::Character(self.import_character(&bundle, name, overwrite)?))
        } else {
            let envelope: Envelope = serde_json::from_value(value)
                .map_err(|e| KbError::Malformed(format!("invalid document envelope: {e}")))?;
            Ok(ImportResult::File(self.import_file(&envelope, name, overwrite)?))
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

    fn aragorn() -> Value {
        json!({ "name": "Aragorn", "race": "Human", "class": "Ranger", "total_level": 1 })
    }

    fn seed(store: &Store) {
        store.create_file("aragorn/character.json", aragorn()).unwrap();
        store
            .create_file(
                "aragorn/inventory_list.json",
                json!({ "items": [{ "name": "Andúril", "equipped": true }] }),
            )
            .unwrap();
    }

    #[test]
    fn test_export_import_round_trip() {
        let (_tmp, store) = setup_test_store();
        seed(&store);

        let envelope = store.export_file("aragorn/inventory_list.json").unwrap();
        store
            .update_file("aragorn/inventory_list.json", json!({ "items": [] }))
            .unwrap();

        let outcome = store
            .import_file(&envelope, Some("aragorn/inventory_list.json"), true)
            .unwrap();
        assert!(outcome.replaced.is_some());
        assert_eq!(
            store.get_file("aragorn/inventory_list.json").unwrap().content,
            envelope.content
        );
    }

    #[test]
    fn test_import_without_overwrite_conflicts() {
        let (_tmp, store) = setup_test_store();
        seed(&store);
        let envelope = store.export_file("aragorn/character.json").unwrap();
        assert!(matches!(
            store.import_file(&envelope, None, false),
            Err(KbError::Conflict(_))
        ));
    }

    #[test]
    fn test_import_revalidates() {
        let (_tmp, store) = setup_test_store();
        let envelope = Envelope {
            filename: "boromir/character.json".into(),
            content: json!({ "name": "Boromir", "race": "Human", "class": "Fighter", "total_level": 25 }),
        };
        assert!(matches!(
            store.import_file(&envelope, None, true),
            Err(KbError::ValidationFailed(_))
        ));
        assert!(!store.exists("boromir/character.json").unwrap());
    }

    #[test]
    fn test_export_character_bundle() {
        let (_tmp, store) = setup_test_store();
        seed(&store);

        let bundle = store.export_character("Aragorn").unwrap();
        assert!(bundle.character_data);
        assert_eq!(bundle.character_name.as_deref(), Some("Aragorn"));
        assert!(bundle.exported_at.is_some());
        assert_eq!(bundle.files.len(), 2);

        assert!(matches!(
            store.export_character("Legolas"),
            Err(KbError::NotFound(_))
        ));
    }

    #[test]
    fn test_import_character_under_new_name() {
        let (_tmp, store) = setup_test_store();
        seed(&store);
        let bundle = store.export_character("aragorn").unwrap();

        let report = store.import_character(&bundle, Some("Strider"), false).unwrap();
        assert_eq!(
            report.imported_files,
            vec!["strider/character.json", "strider/inventory_list.json"]
        );
        assert!(report.failed_files.is_empty());
        assert_eq!(store.list_characters().unwrap().characters, vec!["aragorn", "strider"]);
    }

    #[test]
    fn test_import_character_reports_partial_failure() {
        let (_tmp, store) = setup_test_store();
        seed(&store);
        let mut bundle = store.export_character("aragorn").unwrap();
        bundle.files.push(Envelope {
            filename: "aragorn/spell_list.json".into(),
            content: json!({ "spells": [{ "name": "Athelas", "level": 12 }] }),
        });

        // Existing files conflict, the new spell list fails validation
        let report = store.import_character(&bundle, None, false).unwrap();
        assert!(report.imported_files.is_empty());
        assert_eq!(report.failed_files.len(), 3);
        let spell = report
            .failed_files
            .iter()
            .find(|f| f.filename == "aragorn/spell_list.json")
            .unwrap();
        assert_eq!(spell.validation.as_ref().unwrap().errors[0].field_path, "spells.0.level");
    }

    #[test]
    fn test_import_payload_dispatch() {
        let (_tmp, store) = setup_test_store();
        seed(&store);
        let bundle = serde_json::to_string(&store.export_character("aragorn").unwrap()).unwrap();
        let single = serde_json::to_string(&store.export_file("aragorn/character.json").unwrap()).unwrap();

        match store.import_payload(&bundle, Some("Elessar"), false).unwrap() {
            ImportResult::Character(report) => assert_eq!(report.imported_files.len(), 2),
            other => panic!("expected character import, got {other:?}"),
        }
        match store.import_payload(&single, Some("telcontar/character.json"), false).unwrap() {
            ImportResult::File(outcome) => assert_eq!(outcome.document.filename, "telcontar/character.json"),
            other => panic!("expected file import, got {other:?}"),
        }
    }

    #[test]
    fn test_import_payload_minimal_bundle() {
        let (_tmp, store) = setup_test_store();
        let payload = r#"{
            "character_data": true,
            "files": [{ "filename": "aragorn/inventory_list.json", "content": { "items": [] } }]
        }"#;

        match store.import_payload(payload, None, false).unwrap() {
            ImportResult::Character(report) => {
                assert_eq!(report.imported_files, vec!["aragorn/inventory_list.json"]);
                assert!(report.failed_files.is_empty());
            }
            other => panic!("expected character import, got {other:?}"),
        }
        assert_eq!(
            store.get_file("aragorn/inventory_list.json").unwrap().content,
            json!({ "items": [] })
        );
    }

    #[test]
    fn test_import_payload_malformed() {
        let (_tmp, store) = setup_test_store();
        assert!(matches!(
            store.import_payload("not json at all", None, false),
            Err(KbError::Malformed(_))
        ));
        assert!(matches!(
            store.import_payload("[1, 2]", None, false),
            Err(KbError::Malformed(_))
        ));
        assert!(matches!(
            store.import_payload(r#"{ "character_data": true, "files": "nope" }"#, None, false),
            Err(KbError::Malformed(_))
        ));
        assert!(matches!(
            store.import_payload(r#"{ "content": {} }"#, None, false),
            Err(KbError::Malformed(_))
        ));
    }
}
