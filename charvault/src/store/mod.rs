use crate::backup::{BackupInfo, BackupManager};
use crate::config::StoreConfig;
use crate::document::{self, character_of, normalize_filename, Document};
use crate::error::{KbError, Result};
use crate::schema::{Catalog, DocumentType};
use crate::system_db::{DocumentRecord, SystemDb};
use crate::validation::{DocumentValidator, SchemaValidator, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Name of the system database inside the data directory
pub const SYSTEM_DB: &str = "_system.db";

/// The main entry point for the knowledge base.
/// Opens a data directory, loads the catalog and configuration, reconciles
/// the document index with the files on disk, and provides keyed CRUD.
pub struct Store {
    pub(crate) root: PathBuf,
    pub(crate) config: StoreConfig,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) validator: Box<dyn DocumentValidator>,
    pub(crate) db: SystemDb,
    write_lock: Mutex<()>,
}

/// Distinct character prefixes currently holding documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterList {
    pub characters: Vec<String>,
    pub count: usize,
}

impl Store {
    /// Open a store at an existing data directory, reading `charvault.yaml`
    /// and `schema.yaml` from it when present.
    pub fn open(path: &str) -> Result<Self> {
        let root = PathBuf::from(path);
        if !root.is_dir() {
            return Err(KbError::Other(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }
        let config = StoreConfig::load(&root)?;
        Self::open_with(path, config)
    }

    /// Create the data directory if needed, then open it.
    pub fn init(path: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        Self::open(path)
    }

    /// Open with an explicit configuration instead of `charvault.yaml`.
    pub fn open_with(path: &str, config: StoreConfig) -> Result<Self> {
        let root = PathBuf::from(path);
        if !root.is_dir() {
            return Err(KbError::Other(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }
        config.check()?;

        let catalog = Arc::new(Catalog::load(&root)?);
        let validator = Box::new(SchemaValidator::new(
            Arc::clone(&catalog),
            config.validation_mode,
        ));
        let db = SystemDb::open(&root.join(SYSTEM_DB))?;

        let store = Store {
            root,
            config,
            catalog,
            validator,
            db,
            write_lock: Mutex::new(()),
        };
        store.rescan()?;
        Ok(store)
    }

    /// Replace the authoritative validator, e.g. with a remote service client.
    pub fn with_validator(mut self, validator: Box<dyn DocumentValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn backups(&self) -> BackupManager<'_> {
        BackupManager::new(&self.db, self.config.backup_retention)
    }

    /// Serializes the check-snapshot-write section of single-document
    /// mutations. Validation happens before taking it.
    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Reconcile the index with the data directory: index JSON files that
    /// were written by other tools or edited externally, and drop entries
    /// whose files are gone.
    fn rescan(&self) -> Result<()> {
        let pattern = format!("{}/**/*.json", self.root.display());
        let files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| KbError::Other(format!("Glob error: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut seen = HashSet::new();
        for file_path in &files {
            let rel_path = file_path
                .strip_prefix(&self.root)
                .unwrap_or(file_path)
                .to_string_lossy()
                .replace('\\', "/");
            let filename = match normalize_filename(&rel_path) {
                Ok(f) => f,
                Err(_) => continue,
            };

            let last_modified = modified_time(file_path)?;
            let size = std::fs::metadata(file_path)?.len();
            let existing = self.db.get_document(&filename)?;
            seen.insert(filename.clone());

            if let Some(record) = &existing {
                if record.size == size && record.last_modified == last_modified {
                    continue;
                }
            }

            let content = match document::read_document(file_path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("Skipping unreadable document {filename}: {e}");
                    continue;
                }
            };
            let version = existing.map(|r| r.version + 1).unwrap_or(1);
            log::debug!("Indexing {filename} (version {version})");
            self.db.upsert_document(&DocumentRecord {
                filename: filename.clone(),
                file_type: DocumentType::classify(&filename).as_str().to_string(),
                size,
                last_modified,
                version,
                content_json: serde_json::to_string(&content)?,
            })?;
        }

        for record in self.db.list_documents(None)? {
            if !seen.contains(&record.filename) {
                log::warn!("Dropping index entry for missing file {}", record.filename);
                self.db.delete_document(&record.filename)?;
            }
        }

        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Distinct character names, sorted
    pub fn list_characters(&self) -> Result<CharacterList> {
        let names: BTreeSet<String> = self
            .db
            .list_documents(None)?
            .iter()
            .map(|r| character_of(&r.filename).to_string())
            .collect();
        let characters: Vec<String> = names.into_iter().collect();
        Ok(CharacterList {
            count: characters.len(),
            characters,
        })
    }

    /// All documents, optionally only those whose key starts with `prefix`.
    pub fn list_files(&self, prefix: Option<&str>) -> Result<Vec<Document>> {
        let records = self.db.list_documents(prefix)?;
        let mut docs = Vec::new();

        for record in records {
            let filename = record.filename.clone();
            match self.load(record) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    log::warn!("Failed to read document {filename}: {e}");
                }
            }
        }

        Ok(docs)
    }

    /// Get a document by filename
    pub fn get_file(&self, filename: &str) -> Result<Document> {
        let filename = normalize_filename(filename)?;
        let record = self.require(&filename)?;
        self.load(record)
    }

    pub fn exists(&self, filename: &str) -> Result<bool> {
        let filename = normalize_filename(filename)?;
        Ok(self.db.get_document(&filename)?.is_some())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create a new document. Nothing is persisted unless the content
    /// passes authoritative validation.
    pub fn create_file(&self, filename: &str, content: Value) -> Result<Document> {
        let filename = normalize_filename(filename)?;
        if self.occupied(&filename)? {
            return Err(KbError::Conflict(format!("{filename} already exists")));
        }
        self.ensure_valid(&filename, &content)?;
        self.apply_create(&filename, content)
    }

    /// Replace a document's content, backing up the previous content first.
    pub fn update_file(&self, filename: &str, content: Value) -> Result<Document> {
        self.update_inner(filename, content, None)
    }

    /// Like `update_file`, but rejects the write with `Conflict` when the
    /// live document is no longer at `expected_version`.
    pub fn update_file_versioned(
        &self,
        filename: &str,
        content: Value,
        expected_version: u64,
    ) -> Result<Document> {
        self.update_inner(filename, content, Some(expected_version))
    }

    fn update_inner(&self, filename: &str, content: Value, expected: Option<u64>) -> Result<Document> {
        let filename = normalize_filename(filename)?;
        self.require(&filename)?;
        self.ensure_valid(&filename, &content)?;
        let (doc, _) = self.apply_update(&filename, content, expected)?;
        Ok(doc)
    }

    /// Delete a document. Returns the backup holding its last content.
    pub fn delete_file(&self, filename: &str) -> Result<BackupInfo> {
        let filename = normalize_filename(filename)?;
        let _guard = self.lock_writes();

        let record = self.require(&filename)?;
        let pre_image = self.read_live(&record)?;
        let backup = self.backups().snapshot(&filename, Some(&pre_image))?;
        self.remove_live(&filename)?;

        log::info!("Deleted {filename} (backup {})", backup.backup_id);
        Ok(backup)
    }

    /// Copy a document's content verbatim to a new key.
    pub fn duplicate_file(&self, filename: &str, new_filename: &str) -> Result<Document> {
        let filename = normalize_filename(filename)?;
        let new_filename = normalize_filename(new_filename)?;
        let _guard = self.lock_writes();

        if self.occupied(&new_filename)? {
            return Err(KbError::Conflict(format!("{new_filename} already exists")));
        }
        let record = self.require(&filename)?;
        let content = self.read_live(&record)?;
        let doc = self.persist(&new_filename, &content, 1)?;

        log::debug!("Duplicated {filename} to {new_filename}");
        Ok(doc)
    }

    /// Run authoritative validation without writing. `target` is either a
    /// filename (classified by its basename) or a type name.
    pub fn validate_content(&self, target: &str, content: &Value) -> Result<ValidationResult> {
        let doc_type = if target.ends_with(".json") || target.contains('/') {
            DocumentType::classify(target)
        } else {
            target.parse()?
        };
        self.validator.validate(doc_type, content)
    }

    /// Document, character and backup counts plus the active configuration
    pub fn status(&self) -> Result<Value> {
        let documents = self.db.list_documents(None)?.len();
        let characters = self.list_characters()?.count;
        let backups = self.db.count_backups(None)?;

        Ok(serde_json::json!({
            "root": self.root.display().to_string(),
            "documents": documents,
            "characters": characters,
            "backups": backups,
            "config": self.config,
        }))
    }

    // ── Internals shared by backup, transfer and batch ─────────────

    pub(crate) fn require(&self, filename: &str) -> Result<DocumentRecord> {
        self.db
            .get_document(filename)?
            .ok_or_else(|| KbError::NotFound(filename.to_string()))
    }

    /// Fail with `ValidationFailed` unless the validator accepts the content.
    /// A validator error (e.g. `ServiceUnavailable`) propagates unchanged.
    pub(crate) fn ensure_valid(&self, filename: &str, content: &Value) -> Result<()> {
        let doc_type = DocumentType::classify(filename);
        let result = self.validator.validate(doc_type, content)?;
        for warning in &result.warnings {
            log::debug!("{filename}: {warning}");
        }
        if !result.is_valid {
            return Err(KbError::ValidationFailed(result));
        }
        Ok(())
    }

    /// A key is taken when it is indexed or when something already sits at
    /// its path, such as a file the rescan could not parse.
    pub(crate) fn occupied(&self, filename: &str) -> Result<bool> {
        Ok(self.db.get_document(filename)?.is_some() || self.path_for(filename).exists())
    }

    /// Persist already-validated content under a new key
    pub(crate) fn apply_create(&self, filename: &str, content: Value) -> Result<Document> {
        let _guard = self.lock_writes();
        if self.occupied(filename)? {
            return Err(KbError::Conflict(format!("{filename} already exists")));
        }
        let doc = self.persist(filename, &content, 1)?;
        log::debug!("Created {filename}");
        Ok(doc)
    }

    /// Persist already-validated content over a live document, snapshotting
    /// the pre-image first.
    pub(crate) fn apply_update(
        &self,
        filename: &str,
        content: Value,
        expected: Option<u64>,
    ) -> Result<(Document, BackupInfo)> {
        let _guard = self.lock_writes();
        let record = self.require(filename)?;
        if let Some(expected) = expected {
            if record.version != expected {
                return Err(KbError::Conflict(format!(
                    "{filename} is at version {}, expected {expected}",
                    record.version
                )));
            }
        }

        let pre_image = self.read_live(&record)?;
        let backup = self.backups().snapshot(filename, Some(&pre_image))?;
        let doc = self.persist(filename, &content, record.version + 1)?;

        log::debug!("Updated {filename} to version {}", doc.version);
        Ok((doc, backup))
    }

    /// Write a document file and its index entry. Callers hold the write lock.
    pub(crate) fn persist(&self, filename: &str, content: &Value, version: u64) -> Result<Document> {
        let path = self.path_for(filename);
        let size = document::write_document(&path, content)?;
        let last_modified = modified_time(&path)?;
        let file_type = DocumentType::classify(filename);

        self.db.upsert_document(&DocumentRecord {
            filename: filename.to_string(),
            file_type: file_type.as_str().to_string(),
            size,
            last_modified,
            version,
            content_json: serde_json::to_string(content)?,
        })?;

        Ok(Document {
            filename: filename.to_string(),
            file_type,
            content: content.clone(),
            size,
            last_modified,
            version,
        })
    }

    /// Remove a document file and its index entry without taking a backup.
    /// Callers hold the write lock.
    pub(crate) fn remove_live(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename);
        if path.exists() {
            document::delete_document(&path)?;
        }
        self.db.delete_document(filename)?;
        Ok(())
    }

    /// Live content from disk, falling back to the index copy if the file
    /// disappeared underneath us.
    pub(crate) fn read_live(&self, record: &DocumentRecord) -> Result<Value> {
        match document::read_document(&self.path_for(&record.filename)) {
            Ok(content) => Ok(content),
            Err(KbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "{} missing on disk; using indexed content",
                    record.filename
                );
                record.parse_content()
            }
            Err(e) => Err(e),
        }
    }

    fn load(&self, record: DocumentRecord) -> Result<Document> {
        let content = self.read_live(&record)?;
        Ok(Document {
            file_type: DocumentType::classify(&record.filename),
            filename: record.filename,
            content,
            size: record.size,
            last_modified: record.last_modified,
            version: record.version,
        })
    }
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}
