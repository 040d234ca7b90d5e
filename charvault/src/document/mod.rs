// Document I/O - read/write JSON documents and normalize their keys

use crate::error::{KbError, Result};
use crate::schema::DocumentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// A live document with its derived metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub file_type: DocumentType,
    pub content: serde_json::Value,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub version: u64,
}

/// Normalize a document key to `{character}/{...}.json` form.
pub fn normalize_filename(raw: &str) -> Result<String> {
    let invalid = |reason: &str| KbError::InvalidFilename {
        filename: raw.to_string(),
        reason: reason.to_string(),
    };

    let cleaned = raw.trim().replace('\\', "/");
    let cleaned = cleaned.trim_start_matches('/');

    if !cleaned.ends_with(".json") {
        return Err(invalid("must end in .json"));
    }

    let segments: Vec<&str> = cleaned.split('/').collect();
    if segments.len() < 2 {
        return Err(invalid("must be prefixed by a character name"));
    }
    for segment in &segments {
        if segment.is_empty() {
            return Err(invalid("contains an empty path segment"));
        }
        if *segment == "." || *segment == ".." {
            return Err(invalid("relative path segments are not allowed"));
        }
        if segment.starts_with('_') || segment.starts_with('.') {
            return Err(invalid("segments may not start with '_' or '.'"));
        }
    }
    Ok(segments.join("/"))
}

/// The character prefix of a normalized filename
pub fn character_of(filename: &str) -> &str {
    filename.split('/').next().unwrap_or(filename)
}

/// Everything after the character prefix, e.g. `spell_list.json`
pub fn relative_name(filename: &str) -> &str {
    filename
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(filename)
}

/// Serialized form of a document's content as stored on disk
pub fn render(content: &serde_json::Value) -> Result<String> {
    let mut text = serde_json::to_string_pretty(content)?;
    text.push('\n');
    Ok(text)
}

/// Read a document's content from disk
pub fn read_document(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)?;
    let content = serde_json::from_str(&text)?;
    Ok(content)
}

/// Write a document atomically (temp file in the same directory, then
/// rename). Returns the number of bytes written.
pub fn write_document(path: &Path, content: &serde_json::Value) -> Result<u64> {
    let parent = path
        .parent()
        .ok_or_else(|| KbError::Other(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let text = render(content)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| KbError::Io(e.error))?;

    Ok(text.len() as u64)
}

/// Delete a document file, removing its character directory if it is left
/// empty.
pub fn delete_document(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    if let Some(parent) = path.parent() {
        let is_empty = std::fs::read_dir(parent)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            let _ = std::fs::remove_dir(parent);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_filename() {
        assert_eq!(normalize_filename("aragorn/character.json").unwrap(), "aragorn/character.json");
        assert_eq!(normalize_filename("/aragorn\\spell_list.json").unwrap(), "aragorn/spell_list.json");
        assert!(normalize_filename("character.json").is_err());
        assert!(normalize_filename("aragorn/character.txt").is_err());
        assert!(normalize_filename("aragorn/../boromir/character.json").is_err());
        assert!(normalize_filename("aragorn//character.json").is_err());
        assert!(normalize_filename("_system/character.json").is_err());
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(character_of("aragorn/character.json"), "aragorn");
        assert_eq!(relative_name("aragorn/character.json"), "character.json");
    }

    #[test]
    fn test_write_read_delete() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("aragorn/character.json");
        let content = json!({ "name": "Aragorn" });

        let size = write_document(&path, &content).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        assert_eq!(read_document(&path).unwrap(), content);

        delete_document(&path).unwrap();
        assert!(!path.exists());
        assert!(!tmp.path().join("aragorn").exists());
    }
}
