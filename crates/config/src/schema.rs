//! Structural schema registry and validation.
//!
//! Responsibilities:
//! - Compile JSON-Schema-like documents into typed schema trees.
//! - Validate section data, reporting dotted-path errors and warnings.
//! - Extract default documents and synthesize sample documents.
//!
//! Does NOT handle:
//! - Loading schemas from disk (callers pass documents).
//! - Persisting or migrating section data (see `store`, `migrate`).
//!
//! Invariants:
//! - A registered schema is always well-formed: its kind is known, every
//!   `required` name references a declared property, and every `pattern`
//!   compiles.
//! - `validate` never panics and never fails the call itself; problems are
//!   reported through the returned [`ValidationReport`].
//! - Keys with the metadata prefix (`_`) are ignored during validation.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::METADATA_PREFIX;

/// Errors raised while registering a malformed schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema for '{section}' must be a JSON object")]
    NotAnObject { section: String },

    #[error("unknown schema type '{kind}' at {path}")]
    UnknownKind { path: String, kind: String },

    #[error("required property '{name}' at {path} is not declared")]
    UndeclaredRequired { path: String, name: String },

    #[error("invalid pattern at {path}: {source}")]
    InvalidPattern {
        path: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("invalid constraint at {path}: {message}")]
    InvalidConstraint { path: String, message: String },
}

/// A single validation failure with the dotted path to the failing node.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating one section document.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// A compiled schema node: a kind plus an optional declared default.
#[derive(Debug, Clone)]
pub struct Schema {
    kind: SchemaKind,
    default: Option<Value>,
}

#[derive(Debug, Clone)]
enum SchemaKind {
    Object {
        properties: BTreeMap<String, Schema>,
        required: Vec<String>,
        /// Whether undeclared properties are accepted.
        additional: bool,
        /// patternProperties-style rules for map-typed objects.
        key_rules: Vec<(Regex, Schema)>,
        deprecated: Vec<String>,
        recommended: Vec<String>,
    },
    Array {
        items: Option<Box<Schema>>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    String {
        enumeration: Vec<String>,
        pattern: Option<Regex>,
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Boolean,
}

impl Schema {
    /// Compiles a JSON-Schema-like document into a typed schema tree.
    pub fn compile(section: &str, raw: &Value) -> Result<Self, SchemaError> {
        let root = raw.as_object().ok_or_else(|| SchemaError::NotAnObject {
            section: section.to_string(),
        })?;
        Self::compile_node(root, section)
    }

    fn compile_node(raw: &Map<String, Value>, path: &str) -> Result<Self, SchemaError> {
        let kind_name = raw.get("type").and_then(Value::as_str).unwrap_or("object");

        let kind = match kind_name {
            "object" => Self::compile_object(raw, path)?,
            "array" => SchemaKind::Array {
                items: match raw.get("items").and_then(Value::as_object) {
                    Some(items) => Some(Box::new(Self::compile_node(
                        items,
                        &format!("{path}.items"),
                    )?)),
                    None => None,
                },
                min_items: usize_constraint(raw, "minItems", path)?,
                max_items: usize_constraint(raw, "maxItems", path)?,
            },
            "string" => SchemaKind::String {
                enumeration: raw
                    .get("enum")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                pattern: match raw.get("pattern").and_then(Value::as_str) {
                    Some(pattern) => Some(compile_pattern(pattern, path)?),
                    None => None,
                },
                min_length: usize_constraint(raw, "minLength", path)?,
                max_length: usize_constraint(raw, "maxLength", path)?,
            },
            "number" => SchemaKind::Number {
                minimum: raw.get("minimum").and_then(Value::as_f64),
                maximum: raw.get("maximum").and_then(Value::as_f64),
            },
            "integer" => SchemaKind::Integer {
                minimum: raw.get("minimum").and_then(Value::as_i64),
                maximum: raw.get("maximum").and_then(Value::as_i64),
            },
            "boolean" => SchemaKind::Boolean,
            other => {
                return Err(SchemaError::UnknownKind {
                    path: path.to_string(),
                    kind: other.to_string(),
                });
            }
        };

        Ok(Self {
            kind,
            default: raw.get("default").cloned(),
        })
    }

    fn compile_object(raw: &Map<String, Value>, path: &str) -> Result<SchemaKind, SchemaError> {
        let mut properties = BTreeMap::new();
        if let Some(props) = raw.get("properties").and_then(Value::as_object) {
            for (name, child) in props {
                let child_obj =
                    child
                        .as_object()
                        .ok_or_else(|| SchemaError::InvalidConstraint {
                            path: format!("{path}.{name}"),
                            message: "property schema must be an object".to_string(),
                        })?;
                properties.insert(
                    name.clone(),
                    Self::compile_node(child_obj, &format!("{path}.{name}"))?,
                );
            }
        }

        let required: Vec<String> = string_list(raw, "required");
        for name in &required {
            if !properties.contains_key(name) {
                return Err(SchemaError::UndeclaredRequired {
                    path: path.to_string(),
                    name: name.clone(),
                });
            }
        }

        let mut key_rules = Vec::new();
        if let Some(rules) = raw.get("patternProperties").and_then(Value::as_object) {
            for (pattern, child) in rules {
                let child_obj =
                    child
                        .as_object()
                        .ok_or_else(|| SchemaError::InvalidConstraint {
                            path: path.to_string(),
                            message: "patternProperties schema must be an object".to_string(),
                        })?;
                key_rules.push((
                    compile_pattern(pattern, path)?,
                    Self::compile_node(child_obj, &format!("{path}.<{pattern}>"))?,
                ));
            }
        }

        Ok(SchemaKind::Object {
            properties,
            required,
            additional: raw
                .get("additionalProperties")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            key_rules,
            deprecated: string_list(raw, "deprecated"),
            recommended: string_list(raw, "recommended"),
        })
    }

    /// Extracts the declared defaults, descending into object children.
    /// Returns `Value::Null` when the node declares nothing.
    fn extract_default(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }

        if let SchemaKind::Object { properties, .. } = &self.kind {
            let mut defaults = Map::new();
            for (name, child) in properties {
                let child_default = child.extract_default();
                if !child_default.is_null() {
                    defaults.insert(name.clone(), child_default);
                }
            }
            if !defaults.is_empty() {
                return Value::Object(defaults);
            }
        }

        Value::Null
    }

    /// Synthesizes a sample value: the default when declared, otherwise a
    /// placeholder satisfying the node's constraints.
    fn synthesize_sample(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }

        match &self.kind {
            SchemaKind::Object {
                properties,
                required,
                ..
            } => {
                let mut sample = Map::new();
                for (name, child) in properties {
                    if required.contains(name) || child.default.is_some() {
                        sample.insert(name.clone(), child.synthesize_sample());
                    }
                }
                Value::Object(sample)
            }
            SchemaKind::Array { items, min_items, .. } => {
                let count = min_items.unwrap_or(1);
                let element = items
                    .as_ref()
                    .map(|item| item.synthesize_sample())
                    .unwrap_or(Value::Null);
                Value::Array(vec![element; count])
            }
            SchemaKind::String { enumeration, .. } => enumeration
                .first()
                .map(|first| Value::String(first.clone()))
                .unwrap_or_else(|| Value::String("sample_string".to_string())),
            SchemaKind::Number { minimum, .. } => {
                serde_json::json!(minimum.unwrap_or(0.0))
            }
            SchemaKind::Integer { minimum, .. } => {
                serde_json::json!(minimum.unwrap_or(0))
            }
            SchemaKind::Boolean => Value::Bool(false),
        }
    }

    fn validate_node(&self, value: &Value, path: &str, errors: &mut Vec<ValidationIssue>) {
        match &self.kind {
            SchemaKind::Object {
                properties,
                required,
                additional,
                key_rules,
                ..
            } => {
                let Some(object) = value.as_object() else {
                    errors.push(ValidationIssue::new(path, "expected an object"));
                    return;
                };

                for name in required {
                    if !object.contains_key(name) {
                        errors.push(ValidationIssue::new(
                            &join_path(path, name),
                            "required property is missing",
                        ));
                    }
                }

                for (key, child_value) in object {
                    if key.starts_with(METADATA_PREFIX) {
                        continue;
                    }
                    let child_path = join_path(path, key);

                    if let Some(child_schema) = properties.get(key) {
                        child_schema.validate_node(child_value, &child_path, errors);
                        continue;
                    }

                    if let Some((_, rule_schema)) =
                        key_rules.iter().find(|(pattern, _)| pattern.is_match(key))
                    {
                        rule_schema.validate_node(child_value, &child_path, errors);
                        continue;
                    }

                    if !additional && !key_rules.is_empty() {
                        errors.push(ValidationIssue::new(
                            &child_path,
                            "key does not match any allowed key pattern",
                        ));
                    } else if !additional {
                        errors.push(ValidationIssue::new(&child_path, "unknown property"));
                    }
                }
            }
            SchemaKind::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(array) = value.as_array() else {
                    errors.push(ValidationIssue::new(path, "expected an array"));
                    return;
                };
                if let Some(min) = min_items
                    && array.len() < *min
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("expected at least {min} items, found {}", array.len()),
                    ));
                }
                if let Some(max) = max_items
                    && array.len() > *max
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("expected at most {max} items, found {}", array.len()),
                    ));
                }
                if let Some(item_schema) = items {
                    for (index, element) in array.iter().enumerate() {
                        item_schema.validate_node(
                            element,
                            &format!("{path}[{index}]"),
                            errors,
                        );
                    }
                }
            }
            SchemaKind::String {
                enumeration,
                pattern,
                min_length,
                max_length,
            } => {
                let Some(text) = value.as_str() else {
                    errors.push(ValidationIssue::new(path, "expected a string"));
                    return;
                };
                if !enumeration.is_empty() && !enumeration.iter().any(|e| e == text) {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("'{text}' is not one of [{}]", enumeration.join(", ")),
                    ));
                }
                if let Some(pattern) = pattern
                    && !pattern.is_match(text)
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("'{text}' does not match pattern '{pattern}'"),
                    ));
                }
                if let Some(min) = min_length
                    && text.chars().count() < *min
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("string shorter than minimum length {min}"),
                    ));
                }
                if let Some(max) = max_length
                    && text.chars().count() > *max
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("string longer than maximum length {max}"),
                    ));
                }
            }
            SchemaKind::Number { minimum, maximum } => {
                let Some(number) = value.as_f64() else {
                    errors.push(ValidationIssue::new(path, "expected a number"));
                    return;
                };
                if let Some(min) = minimum
                    && number < *min
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("{number} is below minimum {min}"),
                    ));
                }
                if let Some(max) = maximum
                    && number > *max
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("{number} is above maximum {max}"),
                    ));
                }
            }
            SchemaKind::Integer { minimum, maximum } => {
                let Some(number) = value.as_i64() else {
                    errors.push(ValidationIssue::new(path, "expected an integer"));
                    return;
                };
                if let Some(min) = minimum
                    && number < *min
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("{number} is below minimum {min}"),
                    ));
                }
                if let Some(max) = maximum
                    && number > *max
                {
                    errors.push(ValidationIssue::new(
                        path,
                        format!("{number} is above maximum {max}"),
                    ));
                }
            }
            SchemaKind::Boolean => {
                if !value.is_boolean() {
                    errors.push(ValidationIssue::new(path, "expected a boolean"));
                }
            }
        }
    }

    fn deprecated_and_recommended(&self) -> (&[String], &[String]) {
        match &self.kind {
            SchemaKind::Object {
                deprecated,
                recommended,
                ..
            } => (deprecated, recommended),
            _ => (&[], &[]),
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn compile_pattern(pattern: &str, path: &str) -> Result<Regex, SchemaError> {
    Regex::new(pattern).map_err(|e| SchemaError::InvalidPattern {
        path: path.to_string(),
        source: Box::new(e),
    })
}

fn usize_constraint(
    raw: &Map<String, Value>,
    name: &str,
    path: &str,
) -> Result<Option<usize>, SchemaError> {
    match raw.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| SchemaError::InvalidConstraint {
                path: path.to_string(),
                message: format!("'{name}' must be a non-negative integer"),
            }),
    }
}

fn string_list(raw: &Map<String, Value>, key: &str) -> Vec<String> {
    raw.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Registry of compiled schemas, keyed by section name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and registers a schema for a section, replacing any prior
    /// registration.
    pub fn register(&mut self, section: &str, raw: &Value) -> Result<(), SchemaError> {
        let compiled = Schema::compile(section, raw)?;
        self.schemas.insert(section.to_string(), compiled);
        tracing::debug!(section = %section, "Registered schema");
        Ok(())
    }

    pub fn contains(&self, section: &str) -> bool {
        self.schemas.contains_key(section)
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    /// Validates section data against its registered schema.
    ///
    /// A section without a schema validates successfully with a warning, so
    /// that unschema'd sections never block loading.
    pub fn validate(&self, section: &str, data: &Value) -> ValidationReport {
        let Some(schema) = self.schemas.get(section) else {
            let mut report = ValidationReport::valid();
            report
                .warnings
                .push(format!("no schema registered for section '{section}'"));
            return report;
        };

        let mut errors = Vec::new();
        schema.validate_node(data, "", &mut errors);

        let warnings = self.collect_warnings(section, schema, data);
        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Returns the default document for a section: every declared default,
    /// descending into object children. `{}` when nothing is declared.
    pub fn default_for(&self, section: &str) -> Value {
        let Some(schema) = self.schemas.get(section) else {
            return Value::Object(Map::new());
        };
        match schema.extract_default() {
            Value::Null => Value::Object(Map::new()),
            value => value,
        }
    }

    /// Returns a sample document: defaults plus placeholders for required
    /// fields without one.
    pub fn sample_for(&self, section: &str) -> Value {
        let Some(schema) = self.schemas.get(section) else {
            return Value::Object(Map::new());
        };
        schema.synthesize_sample()
    }

    fn collect_warnings(&self, section: &str, schema: &Schema, data: &Value) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(object) = data.as_object() else {
            return warnings;
        };

        let (deprecated, recommended) = schema.deprecated_and_recommended();
        for key in deprecated {
            if object.contains_key(key) {
                warnings.push(format!("deprecated key '{key}' is set"));
            }
        }
        for key in recommended {
            if !object.contains_key(key) {
                warnings.push(format!("recommended key '{key}' is not set"));
            }
        }

        // Domain checks carried over from the desktop app's config rules.
        if section == "security" {
            if !object
                .get("encryption_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                warnings.push("encryption at rest is disabled".to_string());
            }
            if object
                .get("session_timeout")
                .and_then(Value::as_i64)
                .is_some_and(|t| t > 86_400)
            {
                warnings.push("session timeout exceeds 24 hours".to_string());
            }
        }

        if section == "llm"
            && let Some(providers) = object.get("providers").and_then(Value::as_object)
        {
            for (provider, config) in providers {
                let has_key = config
                    .get("api_key")
                    .and_then(Value::as_str)
                    .is_some_and(|k| !k.is_empty());
                if !has_key {
                    warnings.push(format!("provider '{provider}' has no API key configured"));
                }
            }
        }

        warnings
    }
}
