//! Desired configuration.
//!
//! A [`Configuration`] is the already-parsed user intent: one
//! [`DesiredResource`] per instance, with attribute expressions that are
//! either literal values or references to another instance's attributes.
//! Parsing a configuration language into this form is the caller's job.
//!
//! References serialize as `{"$ref": "type.name.attribute"}`; the attribute
//! `id` refers to the remote identifier.

use crate::diff::DesiredInstance;
use crate::error::{EngineError, Result};
use crate::schema::ReplacePolicy;
use crate::state::{InstanceAddress, StateSnapshot};
use crate::value::{PlannedValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The attribute name that refers to an instance's remote identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// A reference to another instance's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawReference", into = "RawReference")]
pub struct Reference {
    /// The referenced instance.
    pub address: InstanceAddress,
    /// The referenced attribute, or [`ID_ATTRIBUTE`] for the remote id.
    pub attribute: String,
}

impl Reference {
    /// Create a reference to an attribute.
    pub fn new(address: InstanceAddress, attribute: impl Into<String>) -> Self {
        Self {
            address,
            attribute: attribute.into(),
        }
    }

    /// Create a reference to an instance's remote id.
    pub fn id(address: InstanceAddress) -> Self {
        Self::new(address, ID_ATTRIBUTE)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReference {
    #[serde(rename = "$ref")]
    target: String,
}

impl TryFrom<RawReference> for Reference {
    type Error = String;

    fn try_from(raw: RawReference) -> Result<Self, Self::Error> {
        let (address, attribute) = raw
            .target
            .rsplit_once('.')
            .ok_or_else(|| format!("invalid reference '{}'", raw.target))?;
        Ok(Reference::new(address.parse()?, attribute))
    }
}

impl From<Reference> for RawReference {
    fn from(reference: Reference) -> Self {
        RawReference {
            target: reference.to_string(),
        }
    }
}

/// A configured attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    /// A reference to another instance's output.
    Reference(Reference),
    /// A literal value.
    Literal(Value),
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Expression {
                fn from(value: $ty) -> Self {
                    Expression::Literal(Value::from(value))
                }
            }
        )*
    };
}

literal_from!(bool, i32, i64, f64, &str, String);

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Literal(value)
    }
}

impl From<Reference> for Expression {
    fn from(reference: Reference) -> Self {
        Expression::Reference(reference)
    }
}

/// The desired state of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    /// The instance's identity.
    pub address: InstanceAddress,
    /// Configured attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Expression>,
    /// Explicit dependencies beyond those implied by references.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<InstanceAddress>,
    /// Overrides the schema's replacement policy for this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_policy: Option<ReplacePolicy>,
}

impl DesiredResource {
    /// Create a desired resource with no attributes.
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: InstanceAddress::new(resource_type, name),
            attributes: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            replace_policy: None,
        }
    }

    /// Set an attribute.
    pub fn with(mut self, name: impl Into<String>, expr: impl Into<Expression>) -> Self {
        self.attributes.insert(name.into(), expr.into());
        self
    }

    /// Add an explicit dependency.
    pub fn depends_on(mut self, address: InstanceAddress) -> Self {
        self.depends_on.insert(address);
        self
    }

    /// Override the replacement policy.
    pub fn with_replace_policy(mut self, policy: ReplacePolicy) -> Self {
        self.replace_policy = Some(policy);
        self
    }

    /// Every instance this one depends on, through references or explicitly.
    pub fn dependencies(&self) -> BTreeSet<InstanceAddress> {
        let mut deps = self.depends_on.clone();
        deps.extend(self.attributes.values().filter_map(|expr| match expr {
            Expression::Reference(r) => Some(r.address.clone()),
            Expression::Literal(_) => None,
        }));
        deps
    }

    /// Resolve every reference through `lookup`.
    pub fn resolve<F>(&self, mut lookup: F) -> Result<DesiredInstance>
    where
        F: FnMut(&Reference) -> Result<PlannedValue>,
    {
        let mut desired = DesiredInstance::new(self.address.clone());
        for (name, expr) in &self.attributes {
            let value = match expr {
                Expression::Literal(value) => PlannedValue::Known(value.clone()),
                Expression::Reference(reference) => {
                    desired.references.insert(name.clone(), reference.clone());
                    lookup(reference)?
                },
            };
            desired.attributes.insert(name.clone(), value);
        }
        desired.dependencies = self.dependencies();
        desired.replace_policy = self.replace_policy;
        Ok(desired)
    }

    /// Resolve references against a state snapshot.
    ///
    /// Every referenced instance must already exist in the snapshot.
    pub fn resolve_from_state(&self, snapshot: &StateSnapshot) -> Result<DesiredInstance> {
        self.resolve(|reference| {
            lookup_in_state(snapshot, reference).ok_or_else(|| unresolved(&self.address, reference))
        })
    }
}

/// Look up a referenced value in a state snapshot.
///
/// Returns `None` if the instance is not in the snapshot or has no remote id
/// yet. A missing attribute resolves to null.
pub fn lookup_in_state(snapshot: &StateSnapshot, reference: &Reference) -> Option<PlannedValue> {
    let instance = snapshot.get(&reference.address)?;
    if reference.attribute == ID_ATTRIBUTE {
        return instance
            .id
            .clone()
            .map(|id| PlannedValue::Known(Value::String(id)));
    }
    Some(PlannedValue::Known(
        instance
            .attributes
            .get(&reference.attribute)
            .cloned()
            .unwrap_or_default(),
    ))
}

fn unresolved(from: &InstanceAddress, reference: &Reference) -> EngineError {
    EngineError::Config(format!("{}: cannot resolve reference to {}", from, reference))
}

/// The full desired configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Desired resources by address.
    #[serde(default)]
    pub resources: BTreeMap<InstanceAddress, DesiredResource>,
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a desired resource, builder style.
    pub fn with_resource(mut self, resource: DesiredResource) -> Self {
        self.insert(resource);
        self
    }

    /// Add or replace a desired resource.
    pub fn insert(&mut self, resource: DesiredResource) {
        self.resources.insert(resource.address.clone(), resource);
    }

    /// Look up a desired resource.
    pub fn get(&self, address: &InstanceAddress) -> Option<&DesiredResource> {
        self.resources.get(address)
    }

    /// Parse a configuration from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
