//! Schema types for describing resource structure.
//!
//! A [`ResourceSchema`] describes the attributes of one resource type, how each
//! of them may change, and the lifecycle rules the engine must follow when
//! applying changes. Schemas are collected in a [`SchemaRegistry`], which is
//! the only place per-resource semantics enter the engine.

use crate::error::{EngineError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// A list of values of a single type.
    List(Box<AttributeType>),
    /// A set of unique values of a single type.
    Set(Box<AttributeType>),
    /// A map from string keys to values of a single type.
    Map(Box<AttributeType>),
    /// An object with a fixed set of attributes.
    Object(BTreeMap<String, AttributeType>),
    /// Any value; type checks are skipped.
    Dynamic,
}

impl AttributeType {
    /// Create a list type.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a set type.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }

    /// Create an object type.
    pub fn object(attributes: BTreeMap<String, AttributeType>) -> Self {
        Self::Object(attributes)
    }
}

/// Presence and ownership of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// Must be configured.
    pub required: bool,
    /// May be left out of the configuration.
    pub optional: bool,
    /// The provider fills the value in.
    pub computed: bool,
    /// Values are redacted in rendered plans.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Flags for a provider-owned attribute.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Flags for an attribute the user may set and the provider otherwise fills in.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Mark the attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Returns `true` if the attribute can only be set by the provider.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }
}

/// How a change to an attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Changing the attribute requires destroying and recreating the instance.
    ForcesReplacement,
    /// The attribute can be changed in place.
    Updatable,
    /// The attribute is set by the provider and never configured.
    ComputedOnly,
}

/// One attribute of a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Changing the value recreates the remote object.
    #[serde(default)]
    pub force_new: bool,
    /// Default value used when the attribute is not configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
        }
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    /// Create a required int64 attribute.
    pub fn required_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::required())
    }

    /// Create an optional int64 attribute.
    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    /// Create a required bool attribute.
    pub fn required_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::required())
    }

    /// Create an optional bool attribute.
    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Make changes to this attribute recreate the object.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// The mutability class of this attribute.
    pub fn mutability(&self) -> Mutability {
        if self.flags.is_computed_only() {
            Mutability::ComputedOnly
        } else if self.force_new {
            Mutability::ForcesReplacement
        } else {
            Mutability::Updatable
        }
    }
}

/// Declares that changes to `before` must reach the provider ahead of changes
/// to `after` when both are updated together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingConstraint {
    /// The attribute applied first.
    pub before: String,
    /// The attribute applied afterwards.
    pub after: String,
}

/// How an instance is replaced when a forces-replacement attribute changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Delete the old object, then create the new one.
    #[default]
    DestroyBeforeCreate,
    /// Create the new object first, then delete the old one.
    CreateBeforeDestroy,
}

/// Per-operation timeouts for a resource type.
///
/// A timed-out provider call is treated like a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceTimeouts {
    /// Timeout for a single create call.
    pub create: Duration,
    /// Timeout for a single read call.
    pub read: Duration,
    /// Timeout for a single update call.
    pub update: Duration,
    /// Timeout for a single delete call.
    pub delete: Duration,
}

impl Default for ResourceTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(20 * 60),
            read: Duration::from_secs(20 * 60),
            update: Duration::from_secs(20 * 60),
            delete: Duration::from_secs(60 * 60),
        }
    }
}

impl ResourceTimeouts {
    /// Use the same timeout for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            read: timeout,
            update: timeout,
            delete: timeout,
        }
    }
}

/// Schema for a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// The resource type name, e.g. `storage_bucket`.
    pub type_name: String,
    /// Schema version, recorded with each instance in state.
    #[serde(default)]
    pub version: u64,
    /// Attributes by name.
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    /// Update ordering between attributes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ordering: Vec<OrderingConstraint>,
    /// How instances of this type are replaced.
    #[serde(default)]
    pub replace_policy: ReplacePolicy,
    /// Per-operation timeouts.
    #[serde(default)]
    pub timeouts: ResourceTimeouts,
    /// Read after create until the object is visible.
    #[serde(default)]
    pub confirm_create: bool,
    /// Read after delete until the object is gone.
    #[serde(default)]
    pub confirm_delete: bool,
    /// Human-readable description of the resource type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ResourceSchema {
    /// Create a new schema at version 0.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version: 0,
            attributes: BTreeMap::new(),
            ordering: Vec::new(),
            replace_policy: ReplacePolicy::default(),
            timeouts: ResourceTimeouts::default(),
            confirm_create: false,
            confirm_delete: false,
            description: None,
        }
    }

    /// Set the schema version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Require changes to `before` to be applied ahead of changes to `after`.
    pub fn with_ordering(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.ordering.push(OrderingConstraint {
            before: before.into(),
            after: after.into(),
        });
        self
    }

    /// Set the replacement policy.
    pub fn with_replace_policy(mut self, policy: ReplacePolicy) -> Self {
        self.replace_policy = policy;
        self
    }

    /// Set the per-operation timeouts.
    pub fn with_timeouts(mut self, timeouts: ResourceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Wait for newly created objects to become readable.
    pub fn with_confirm_create(mut self) -> Self {
        self.confirm_create = true;
        self
    }

    /// Wait for deleted objects to disappear.
    pub fn with_confirm_delete(mut self) -> Self {
        self.confirm_delete = true;
        self
    }

    /// Set the description for this schema.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Returns `true` if the attribute is marked sensitive.
    pub fn is_sensitive(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|a| a.flags.sensitive)
    }

    /// Check that ordering constraints reference known attributes and form no cycle.
    pub fn check(&self) -> Result<()> {
        for constraint in &self.ordering {
            for name in [&constraint.before, &constraint.after] {
                if !self.attributes.contains_key(name) {
                    return Err(EngineError::Schema(format!(
                        "{}: ordering constraint references unknown attribute '{}'",
                        self.type_name, name
                    )));
                }
            }
        }
        self.update_order().map(|_| ())
    }

    /// Sort attribute names so that ordering constraints are respected.
    ///
    /// Names without a constraint between them keep alphabetical order.
    /// Constraints apply transitively through attributes not in `names`.
    pub fn order_changes<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let wanted: BTreeSet<&String> = names.into_iter().collect();
        match self.update_order() {
            Ok(order) => order
                .into_iter()
                .filter(|name| wanted.contains(name))
                .collect(),
            // Checked at registration; unregistered schemas fall back to name order
            Err(_) => wanted.into_iter().cloned().collect(),
        }
    }

    fn update_order(&self) -> Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> =
            self.attributes.keys().map(|name| (name.as_str(), 0)).collect();
        let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for constraint in &self.ordering {
            let (before, after) = (constraint.before.as_str(), constraint.after.as_str());
            if indegree.contains_key(before) && indegree.contains_key(after) {
                edges.entry(before).or_default().push(after);
                *indegree.entry(after).or_default() += 1;
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for &next in edges.get(name).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < indegree.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, &count)| count > 0)
                .map(|(&name, _)| name)
                .collect();
            return Err(EngineError::Schema(format!(
                "{}: ordering constraints form a cycle through {}",
                self.type_name,
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

/// The set of resource schemas a provider supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchemaRegistry {
    /// The provider version these schemas belong to.
    #[serde(default)]
    pub provider_version: String,
    /// Schemas for each resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSchema>,
}

impl SchemaRegistry {
    /// Create a new empty registry for a provider version.
    pub fn new(provider_version: impl Into<String>) -> Self {
        Self {
            provider_version: provider_version.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Register a resource schema.
    ///
    /// Registering an identical schema twice is a no-op. A schema is
    /// immutable once registered, so a different definition for the same
    /// type is rejected.
    pub fn register(&mut self, schema: ResourceSchema) -> Result<()> {
        schema.check()?;
        if let Some(existing) = self.resources.get(&schema.type_name) {
            if *existing == schema {
                return Ok(());
            }
            return Err(EngineError::Schema(format!(
                "resource type '{}' is already registered for provider version '{}'",
                schema.type_name, self.provider_version
            )));
        }
        self.resources.insert(schema.type_name.clone(), schema);
        Ok(())
    }

    /// Register a resource schema, builder style.
    pub fn with_resource(mut self, schema: ResourceSchema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    /// Look up the schema for a resource type.
    pub fn get(&self, type_name: &str) -> Result<&ResourceSchema> {
        self.resources
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownResource(type_name.to_string()))
    }

    /// Names of all registered resource types.
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// Planning fails.
    Error,
    /// Reported, but planning continues.
    Warning,
}

/// A diagnostic message about configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Returns `true` for error diagnostics.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}
