pub mod backup;
pub mod batch;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod schema;
pub mod store;
pub mod system_db;
pub mod transfer;
pub mod util;
pub mod validation;

pub use backup::{BackupInfo, RestoreOutcome};
pub use batch::{BatchFileOperation, BatchOperationKind, BatchOutcome, BatchReport};
pub use config::StoreConfig;
pub use conflict::{ConflictCheckResult, ConflictInfo, ConflictType, FileInfo, Severity};
pub use document::Document;
pub use error::{KbError, Result};
pub use schema::{Catalog, DocumentType};
pub use store::{CharacterList, Store};
pub use transfer::{CharacterBundle, Envelope, FailedFile, ImportOutcome, ImportReport, ImportResult};
pub use validation::{
    DocumentValidator, ErrorType, SchemaValidator, ValidationError, ValidationMode, ValidationResult,
};
