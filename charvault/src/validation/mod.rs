use crate::error::Result;
use crate::schema::{Catalog, DocumentType, NodeType, SchemaNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Required,
    Type,
    Format,
    Custom,
}

/// A single failed check on a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    pub error_type: ErrorType,
}

/// Result of validating a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new(errors: Vec<ValidationError>, warnings: Vec<String>) -> Self {
        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// How undeclared fields are treated by whole-document validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Fields absent from the schema are left unvalidated
    #[default]
    Permissive,
    /// Fields absent from the schema are errors
    Strict,
}

/// The authoritative document check the store consults before every write.
///
/// Implementations backed by a remote service must return
/// `KbError::ServiceUnavailable` when they cannot reach it; the store never
/// treats that as a pass.
pub trait DocumentValidator: Send + Sync {
    fn validate(&self, doc_type: DocumentType, content: &Value) -> Result<ValidationResult>;
}

/// Local validator backed by the schema catalog
pub struct SchemaValidator {
    catalog: Arc<Catalog>,
    mode: ValidationMode,
}

impl SchemaValidator {
    pub fn new(catalog: Arc<Catalog>, mode: ValidationMode) -> Self {
        SchemaValidator { catalog, mode }
    }
}

impl DocumentValidator for SchemaValidator {
    fn validate(&self, doc_type: DocumentType, content: &Value) -> Result<ValidationResult> {
        Ok(validate_document(&self.catalog, doc_type, content, self.mode))
    }
}

/// Validate a single field, addressed by a dotted path, against a type's
/// root schema.
///
/// Meant for interactive feedback: an unresolvable path yields no errors,
/// and nothing here is trusted for persistence.
pub fn validate_field(field_path: &str, value: &Value, schema: &SchemaNode) -> Vec<ValidationError> {
    match resolve_path(schema, field_path) {
        Some(node) => check_value(field_path, value, node),
        None => Vec::new(),
    }
}

/// Walk `properties` one segment at a time. Array nodes are entered either
/// by a numeric index (into `items`) or by naming a property of `items`.
pub fn resolve_path<'a>(schema: &'a SchemaNode, field_path: &str) -> Option<&'a SchemaNode> {
    let mut node = schema;
    for segment in field_path.split('.').filter(|s| !s.is_empty()) {
        node = match node.properties.get(segment) {
            Some(child) => child,
            None => {
                let items = node.items.as_deref()?;
                if segment.parse::<usize>().is_ok() {
                    items
                } else {
                    items.properties.get(segment)?
                }
            }
        };
    }
    Some(node)
}

/// Leaf checks for one value, in order: required, type, numeric range,
/// string length, pattern, enum. Every applicable check reports; only a
/// required-and-empty value stops early.
pub fn check_value(field_path: &str, value: &Value, node: &SchemaNode) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let label = label(field_path);

    if is_empty(value) && node.required {
        errors.push(ValidationError {
            field_path: field_path.to_string(),
            message: format!("{label} is required"),
            error_type: ErrorType::Required,
        });
        return errors;
    }

    // Optional and not provided
    if value.is_null() {
        return errors;
    }

    if !node.node_type.matches(value) {
        errors.push(type_error(field_path, value, node));
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = node.minimum {
            if n < min {
                errors.push(custom(field_path, format!("{label} must be at least {min}")));
            }
        }
        if let Some(max) = node.maximum {
            if n > max {
                errors.push(custom(field_path, format!("{label} must be at most {max}")));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count();
        if let Some(min) = node.min_length {
            if len < min {
                errors.push(custom(
                    field_path,
                    format!("{label} must be at least {min} characters"),
                ));
            }
        }
        if let Some(max) = node.max_length {
            if len > max {
                errors.push(custom(
                    field_path,
                    format!("{label} must be at most {max} characters"),
                ));
            }
        }

        if let Some(pattern) = &node.pattern {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        errors.push(ValidationError {
                            field_path: field_path.to_string(),
                            message: format!("{label} has an invalid format"),
                            error_type: ErrorType::Format,
                        });
                    }
                }
                Err(e) => {
                    log::warn!("Ignoring invalid pattern on '{field_path}': {e}");
                }
            }
        }
    }

    if let Some(allowed) = &node.enum_values {
        if !allowed.contains(value) {
            let listed: Vec<String> = allowed.iter().map(display_value).collect();
            errors.push(custom(
                field_path,
                format!("{label} must be one of: {}", listed.join(", ")),
            ));
        }
    }

    errors
}

/// Validate a whole document against the schema registered for its type.
pub fn validate_document(
    catalog: &Catalog,
    doc_type: DocumentType,
    content: &Value,
    mode: ValidationMode,
) -> ValidationResult {
    let schema = match catalog.schema_for(doc_type) {
        Some(s) => s,
        None => {
            return ValidationResult::new(
                Vec::new(),
                vec![format!(
                    "No schema is registered for '{doc_type}' documents; content was not validated"
                )],
            );
        }
    };

    let mut errors = Vec::new();
    walk("", content, schema, false, mode, &mut errors);
    ValidationResult::new(errors, Vec::new())
}

/// `may_be_absent` is true only for object properties; a null document
/// root or array element is a value of the wrong type, not a missing one.
fn walk(
    path: &str,
    value: &Value,
    node: &SchemaNode,
    may_be_absent: bool,
    mode: ValidationMode,
    errors: &mut Vec<ValidationError>,
) {
    if value.is_null() && !may_be_absent {
        errors.push(type_error(path, value, node));
        return;
    }
    errors.extend(check_value(path, value, node));

    match value {
        Value::Object(map) if node.node_type == NodeType::Object && !node.properties.is_empty() => {
            for (key, child) in &node.properties {
                let child_value = map.get(key).unwrap_or(&Value::Null);
                walk(&join(path, key), child_value, child, true, mode, errors);
            }

            if mode == ValidationMode::Strict {
                for key in map.keys() {
                    if !node.properties.contains_key(key) {
                        let child_path = join(path, key);
                        errors.push(custom(
                            &child_path,
                            format!("{child_path} is not a recognized field"),
                        ));
                    }
                }
            }
        }
        Value::Array(elements) if node.node_type == NodeType::Array => {
            if let Some(item_node) = node.items.as_deref() {
                for (i, element) in elements.iter().enumerate() {
                    walk(&join(path, &i.to_string()), element, item_node, false, mode, errors);
                }
            }
        }
        _ => {}
    }
}

fn type_error(field_path: &str, value: &Value, node: &SchemaNode) -> ValidationError {
    ValidationError {
        field_path: field_path.to_string(),
        message: format!(
            "{} must be of type {}, got {}",
            label(field_path),
            node.node_type.as_str(),
            json_type_name(value)
        ),
        error_type: ErrorType::Type,
    }
}

fn custom(field_path: &str, message: String) -> ValidationError {
    ValidationError {
        field_path: field_path.to_string(),
        message,
        error_type: ErrorType::Custom,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

fn label(field_path: &str) -> &str {
    if field_path.is_empty() {
        "document"
    } else {
        field_path
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
