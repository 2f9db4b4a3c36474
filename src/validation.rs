//! Schema validation helpers.
//!
//! This module validates configured attribute values against a
//! [`ResourceSchema`] before they reach the differ, and reports problems as
//! [`Diagnostic`]s with the attribute path that caused them.
//!
//! # Example
//!
//! ```
//! use hemmer_engine::schema::{Attribute, ResourceSchema};
//! use hemmer_engine::validation::validate_known;
//! use hemmer_engine::value::{AttributeMap, Value};
//!
//! let schema = ResourceSchema::new("storage_bucket")
//!     .with_attribute("name", Attribute::required_string())
//!     .with_attribute("size", Attribute::optional_int64());
//!
//! let mut attrs = AttributeMap::new();
//! attrs.insert("name".to_string(), Value::from("logs"));
//! attrs.insert("size".to_string(), Value::from("big"));
//!
//! let diagnostics = validate_known(&schema, &attrs);
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("size".to_string()));
//! ```

use crate::schema::{Attribute, AttributeType, Diagnostic, DiagnosticSeverity, ResourceSchema};
use crate::value::{AttributeMap, PlannedValue, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Validate planned attribute values against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the values are valid.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Optional attributes may be absent or null
/// - Computed-only attributes are skipped (the provider sets these)
/// - Unknown values count as present and are type-checked at apply time
/// - Known values must match the attribute type
pub fn validate(schema: &ResourceSchema, values: &BTreeMap<String, PlannedValue>) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (name, attr) in &schema.attributes {
        validate_attribute(attr, values.get(name), name, &mut diagnostics);
    }
    diagnostics
}

/// Validate fully known attribute values against a schema.
pub fn validate_known(schema: &ResourceSchema, values: &AttributeMap) -> Vec<Diagnostic> {
    let planned: BTreeMap<String, PlannedValue> = values
        .iter()
        .map(|(k, v)| (k.clone(), PlannedValue::Known(v.clone())))
        .collect();
    validate(schema, &planned)
}

/// Validate planned values, returning Ok if valid or Err with the error diagnostics.
///
/// Warnings alone do not fail validation.
pub fn validate_result(
    schema: &ResourceSchema,
    values: &BTreeMap<String, PlannedValue>,
) -> Result<(), Vec<Diagnostic>> {
    let errors: Vec<Diagnostic> = validate(schema, values)
        .into_iter()
        .filter(Diagnostic::is_error)
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check if fully known values are valid against a schema.
pub fn is_valid(schema: &ResourceSchema, values: &AttributeMap) -> bool {
    validate_known(schema, values).is_empty()
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&PlannedValue>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(PlannedValue::Known(Value::Null)) => {
            if attr.flags.required && attr.default.is_none() {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(PlannedValue::Unknown) => {},
        Some(PlannedValue::Known(v)) => {
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
        },
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !matches!(value, Value::String(_)) {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Float64 => {
            if !matches!(value, Value::Int(_) | Value::Float(_)) {
                diagnostics.push(type_error(path, "float64", value));
            }
        },
        AttributeType::Bool => {
            if !matches!(value, Value::Bool(_)) {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element_type) => match value {
            Value::List(items) => {
                for (i, elem) in items.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            },
            _ => diagnostics.push(type_error(path, "list", value)),
        },
        AttributeType::Set(element_type) => match value {
            Value::List(items) => {
                for (i, elem) in items.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
                if has_duplicates(items) {
                    diagnostics.push(
                        Diagnostic::error(format!("Duplicate elements in set '{}'", path))
                            .with_attribute(path),
                    );
                }
            },
            _ => diagnostics.push(type_error(path, "set", value)),
        },
        AttributeType::Map(value_type) => match value {
            Value::Map(map) => {
                for (key, val) in map {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            },
            _ => diagnostics.push(type_error(path, "map", value)),
        },
        AttributeType::Object(attrs) => match value {
            Value::Map(map) => validate_object_type(attrs, map, path, diagnostics),
            _ => diagnostics.push(type_error(path, "object", value)),
        },
        AttributeType::Dynamic => {},
    }
}

fn validate_object_type(
    attrs: &BTreeMap<String, AttributeType>,
    obj: &BTreeMap<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, attr_type) in attrs {
        if let Some(value) = obj.get(name) {
            let attr_path = format!("{}.{}", path, name);
            validate_attribute_type(attr_type, value, &attr_path, diagnostics);
        }
    }
    for key in obj.keys() {
        if !attrs.contains_key(key) {
            diagnostics.push(
                Diagnostic::error(format!("Unexpected attribute '{}.{}'", path, key))
                    .with_attribute(format!("{}.{}", path, key)),
            );
        }
    }
}

// Helper functions

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Int(_) => true,
        Value::Float(f) => f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64,
        _ => false,
    }
}

fn has_duplicates(items: &[Value]) -> bool {
    // Values are not Ord (floats); compare via their canonical JSON text
    let mut seen = BTreeSet::new();
    items
        .iter()
        .any(|item| !seen.insert(serde_json::to_string(item).unwrap_or_default()))
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic {
        severity: DiagnosticSeverity::Error,
        summary: format!("Invalid type for attribute '{}'", path),
        detail: Some(format!("Expected {}, got {}", expected, got.type_name())),
        attribute: Some(path.to_string()),
    }
}
