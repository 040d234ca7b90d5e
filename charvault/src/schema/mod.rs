mod catalog;
mod parser;
mod types;

pub use catalog::Catalog;
pub use parser::{parse_catalog, parse_catalog_str};
pub use types::{CatalogDefinition, DocumentType, NodeType, SchemaNode, TypeDefinition};
