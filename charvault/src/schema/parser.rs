use super::types::CatalogDefinition;
use crate::error::Result;
use std::path::Path;

/// Parse a schema.yaml file into a CatalogDefinition
pub fn parse_catalog(path: &Path) -> Result<CatalogDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_catalog_str(&content)
}

/// Parse a catalog YAML string into a CatalogDefinition
pub fn parse_catalog_str(content: &str) -> Result<CatalogDefinition> {
    let catalog: CatalogDefinition = serde_yaml::from_str(content)?;
    Ok(catalog)
}
