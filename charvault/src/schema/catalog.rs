use super::parser::{parse_catalog, parse_catalog_str};
use super::types::{CatalogDefinition, DocumentType, SchemaNode, TypeDefinition};
use crate::error::{KbError, Result};
use std::collections::BTreeMap;
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("builtin.yaml");

/// Schemas and templates for every supported document type.
///
/// Constructed explicitly and shared by reference; there is no global
/// instance, so independent stores can carry independent catalogs.
#[derive(Debug, Clone)]
pub struct Catalog {
    types: BTreeMap<DocumentType, TypeDefinition>,
}

impl Catalog {
    /// The catalog compiled into the crate
    pub fn builtin() -> Result<Self> {
        let definition = parse_catalog_str(BUILTIN_CATALOG)?;
        Self::from_definition(definition)
    }

    /// Built-in catalog, with entries replaced by `schema.yaml` in the data
    /// directory when one exists.
    pub fn load(root: &Path) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        let override_path = root.join("schema.yaml");
        if override_path.exists() {
            let overrides = parse_catalog(&override_path)?;
            log::info!(
                "Applying {} schema override(s) from {}",
                overrides.types.len(),
                override_path.display()
            );
            catalog.apply(overrides)?;
        }
        Ok(catalog)
    }

    /// Build a catalog from a parsed definition
    pub fn from_definition(definition: CatalogDefinition) -> Result<Self> {
        let mut catalog = Catalog {
            types: BTreeMap::new(),
        };
        catalog.apply(definition)?;
        Ok(catalog)
    }

    /// Replace (or add) the entries named in `definition`
    pub fn apply(&mut self, definition: CatalogDefinition) -> Result<()> {
        for (name, type_def) in definition.types {
            let doc_type: DocumentType = name.parse()?;
            if doc_type == DocumentType::Other {
                return Err(KbError::Schema(
                    "documents of type 'other' cannot carry a schema".into(),
                ));
            }
            if type_def.schema.node_type != super::types::NodeType::Object {
                return Err(KbError::Schema(format!(
                    "root schema for '{name}' must be an object, got {}",
                    type_def.schema.node_type.as_str()
                )));
            }
            self.types.insert(doc_type, type_def);
        }
        Ok(())
    }

    /// Map of canonical basename (e.g. `spell_list.json`) to document type
    pub fn supported_types(&self) -> BTreeMap<String, DocumentType> {
        self.types
            .keys()
            .map(|t| (t.file_name(), *t))
            .collect()
    }

    /// Schema for a type given by name
    pub fn schema(&self, type_name: &str) -> Result<&SchemaNode> {
        let doc_type: DocumentType = type_name.parse()?;
        self.schema_for(doc_type)
            .ok_or_else(|| KbError::UnknownType(type_name.to_string()))
    }

    /// Template for a type given by name. Returns an owned copy so callers
    /// can fill it in.
    pub fn template(&self, type_name: &str) -> Result<serde_json::Value> {
        let doc_type: DocumentType = type_name.parse()?;
        self.template_for(doc_type)
            .cloned()
            .ok_or_else(|| KbError::UnknownType(type_name.to_string()))
    }

    pub fn schema_for(&self, doc_type: DocumentType) -> Option<&SchemaNode> {
        self.types.get(&doc_type).map(|t| &t.schema)
    }

    pub fn template_for(&self, doc_type: DocumentType) -> Option<&serde_json::Value> {
        self.types.get(&doc_type).map(|t| &t.template)
    }

    /// Document type of a filename
    pub fn classify(&self, filename: &str) -> DocumentType {
        DocumentType::classify(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate_document, ValidationMode};

    #[test]
    fn test_builtin_covers_canonical_types() {
        let catalog = Catalog::builtin().unwrap();
        let supported = catalog.supported_types();
        assert_eq!(supported.len(), 7);
        for t in DocumentType::CANONICAL {
            assert_eq!(supported.get(&t.file_name()), Some(&t));
            assert!(catalog.schema_for(t).is_some());
            assert!(catalog.template_for(t).is_some());
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let catalog = Catalog::builtin().unwrap();
        assert!(matches!(
            catalog.schema("wizard_hat"),
            Err(KbError::UnknownType(_))
        ));
        assert!(matches!(
            catalog.template("other"),
            Err(KbError::UnknownType(_))
        ));
    }

    #[test]
    fn test_templates_other_than_character_validate() {
        // The character template leaves name/race/class blank on purpose;
        // every other template is valid as-is.
        let catalog = Catalog::builtin().unwrap();
        for t in DocumentType::CANONICAL {
            let result = validate_document(
                &catalog,
                t,
                catalog.template_for(t).unwrap(),
                ValidationMode::Strict,
            );
            if t == DocumentType::Character {
                assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
            } else {
                assert!(result.is_valid, "{t}: {:?}", result.errors);
            }
        }
    }

    #[test]
    fn test_override_replaces_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("schema.yaml"),
            r#"
types:
  inventory_list:
    schema:
      type: object
      properties:
        slots: { type: number, required: true }
    template:
      slots: 10
"#,
        )
        .unwrap();

        let catalog = Catalog::load(tmp.path()).unwrap();
        let schema = catalog.schema("inventory_list").unwrap();
        assert!(schema.property("slots").unwrap().required);
        assert!(schema.property("items").is_none());
        // Untouched entries keep the built-in definition
        assert!(catalog.schema("spell_list").unwrap().property("spells").is_some());
    }

    #[test]
    fn test_override_rejects_non_object_root() {
        let definition = parse_catalog_str(
            "types:\n  spell_list:\n    schema: { type: array }\n",
        )
        .unwrap();
        assert!(matches!(
            Catalog::from_definition(definition),
            Err(KbError::Schema(_))
        ));
    }
}
