use crate::error::KbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Top-level catalog file: one entry per document type, each pairing a
/// validation schema with a default-content template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDefinition {
    #[serde(default)]
    pub types: BTreeMap<String, TypeDefinition>,
}

/// Schema and template for a single document type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub schema: SchemaNode,
    #[serde(default)]
    pub template: serde_json::Value,
}

/// One field or sub-object of a document schema.
///
/// `required` lives on the child node itself rather than in a list on the
/// parent; traversal code reads it from whichever node it resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl SchemaNode {
    /// A bare node of the given type with no constraints
    pub fn of(node_type: NodeType) -> Self {
        SchemaNode {
            node_type,
            properties: BTreeMap::new(),
            items: None,
            required: false,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            pattern: None,
            enum_values: None,
        }
    }

    /// Look up a direct child by name
    pub fn property(&self, name: &str) -> Option<&SchemaNode> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::String => "string",
            NodeType::Number => "number",
            NodeType::Boolean => "boolean",
            NodeType::Object => "object",
            NodeType::Array => "array",
        }
    }

    /// Structural match of a JSON value against this type
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            NodeType::String => value.is_string(),
            NodeType::Number => value.is_number(),
            NodeType::Boolean => value.is_boolean(),
            NodeType::Object => value.is_object(),
            NodeType::Array => value.is_array(),
        }
    }
}

/// Classification of a document, derived from its filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Character,
    CharacterBackground,
    FeatsAndTraits,
    ActionList,
    InventoryList,
    ObjectivesAndContracts,
    SpellList,
    Other,
}

impl DocumentType {
    /// The seven documents materialized for every new character, in
    /// creation order.
    pub const CANONICAL: [DocumentType; 7] = [
        DocumentType::Character,
        DocumentType::CharacterBackground,
        DocumentType::FeatsAndTraits,
        DocumentType::ActionList,
        DocumentType::InventoryList,
        DocumentType::ObjectivesAndContracts,
        DocumentType::SpellList,
    ];

    /// Substring tests used by classification. Order matters: a basename
    /// like `character_background` also contains `character`.
    pub const CLASSIFY_ORDER: [DocumentType; 7] = [
        DocumentType::CharacterBackground,
        DocumentType::FeatsAndTraits,
        DocumentType::ActionList,
        DocumentType::InventoryList,
        DocumentType::ObjectivesAndContracts,
        DocumentType::SpellList,
        DocumentType::Character,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Character => "character",
            DocumentType::CharacterBackground => "character_background",
            DocumentType::FeatsAndTraits => "feats_and_traits",
            DocumentType::ActionList => "action_list",
            DocumentType::InventoryList => "inventory_list",
            DocumentType::ObjectivesAndContracts => "objectives_and_contracts",
            DocumentType::SpellList => "spell_list",
            DocumentType::Other => "other",
        }
    }

    /// Canonical basename, e.g. `spell_list.json`
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    /// Classify a filename by ordered substring match on its basename.
    pub fn classify(filename: &str) -> DocumentType {
        let basename = filename
            .rsplit('/')
            .next()
            .unwrap_or(filename)
            .to_lowercase();
        Self::CLASSIFY_ORDER
            .iter()
            .copied()
            .find(|t| basename.contains(t.as_str()))
            .unwrap_or(DocumentType::Other)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "character" => Ok(DocumentType::Character),
            "character_background" => Ok(DocumentType::CharacterBackground),
            "feats_and_traits" => Ok(DocumentType::FeatsAndTraits),
            "action_list" => Ok(DocumentType::ActionList),
            "inventory_list" => Ok(DocumentType::InventoryList),
            "objectives_and_contracts" => Ok(DocumentType::ObjectivesAndContracts),
            "spell_list" => Ok(DocumentType::SpellList),
            "other" => Ok(DocumentType::Other),
            _ => Err(KbError::UnknownType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_prefers_specific_substrings() {
        assert_eq!(
            DocumentType::classify("aragorn/character_background.json"),
            DocumentType::CharacterBackground
        );
        assert_eq!(
            DocumentType::classify("aragorn/character.json"),
            DocumentType::Character
        );
        assert_eq!(
            DocumentType::classify("aragorn/my_spell_list_v2.json"),
            DocumentType::SpellList
        );
    }

    #[test]
    fn test_classify_uses_basename_only() {
        // The character prefix must not leak into classification
        assert_eq!(
            DocumentType::classify("spell_list_fan/notes.json"),
            DocumentType::Other
        );
    }

    #[test]
    fn test_parse_round_trips_names() {
        for t in DocumentType::CANONICAL {
            assert_eq!(t.as_str().parse::<DocumentType>().unwrap(), t);
        }
        assert!("wizard_hat".parse::<DocumentType>().is_err());
    }

    #[test]
    fn test_schema_node_yaml_keys() {
        let node: SchemaNode = serde_yaml::from_str(
            "type: string\nrequired: true\nminLength: 1\nmaxLength: 10\nenum: [a, b]",
        )
        .unwrap();
        assert_eq!(node.node_type, NodeType::String);
        assert!(node.required);
        assert_eq!(node.min_length, Some(1));
        assert_eq!(node.max_length, Some(10));
        assert_eq!(node.enum_values.as_ref().map(|v| v.len()), Some(2));
    }
}
