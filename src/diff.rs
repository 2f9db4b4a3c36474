//! Per-instance structured diff.
//!
//! [`diff`] compares one instance's last-known state against its desired
//! attributes and classifies every change by the attribute's mutability. It
//! never talks to the provider and always produces the same result for the
//! same input.

use crate::desired::{lookup_in_state, Reference};
use crate::error::{EngineError, Result};
use crate::provider::AttributeUpdate;
use crate::schema::{AttributeType, Mutability, ReplacePolicy, ResourceSchema};
use crate::state::{InstanceAddress, ResourceInstance, StateSnapshot};
use crate::validation::validate_result;
use crate::value::{AttributeMap, PlannedValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What has to happen to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    /// The instance does not exist yet.
    Create,
    /// Updatable attributes changed.
    Update,
    /// A forces-replacement attribute changed.
    Replace,
    /// The instance is no longer configured.
    Delete,
    /// Nothing changed.
    NoOp,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiffAction::Create => "create",
            DiffAction::Update => "update",
            DiffAction::Replace => "replace",
            DiffAction::Delete => "delete",
            DiffAction::NoOp => "no-op",
        };
        f.write_str(name)
    }
}

/// How a single attribute change can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// In place.
    Update,
    /// Only by recreating the instance.
    Replace,
}

/// A change to one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The last-known value, if there was one.
    pub before: Option<Value>,
    /// The desired value.
    pub after: PlannedValue,
    /// What the change implies for the instance.
    pub implied: ChangeKind,
}

/// Desired attributes for one instance, with references already resolved as
/// far as possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredInstance {
    /// The instance's identity.
    pub address: InstanceAddress,
    /// Configured attribute values.
    pub attributes: BTreeMap<String, PlannedValue>,
    /// Attributes whose value comes from another instance.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, Reference>,
    /// Instances this one depends on.
    pub dependencies: BTreeSet<InstanceAddress>,
    /// Per-instance replacement policy override.
    pub replace_policy: Option<ReplacePolicy>,
}

impl DesiredInstance {
    /// Create a desired instance with no attributes.
    pub fn new(address: InstanceAddress) -> Self {
        Self {
            address,
            attributes: BTreeMap::new(),
            references: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            replace_policy: None,
        }
    }

    /// Set an attribute to a known value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes
            .insert(name.into(), PlannedValue::Known(value.into()));
        self
    }

    /// Set an attribute whose value is not known until apply.
    pub fn with_unknown(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), PlannedValue::Unknown);
        self
    }

    /// Re-resolve referenced attributes from a state snapshot.
    ///
    /// Fails if a referenced instance is missing from the snapshot.
    pub fn refresh_references(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        for (name, reference) in &self.references {
            let value = lookup_in_state(snapshot, reference).ok_or_else(|| {
                EngineError::Config(format!(
                    "{}: cannot resolve reference to {}",
                    self.address, reference
                ))
            })?;
            self.attributes.insert(name.clone(), value);
        }
        Ok(())
    }
}

/// The structured difference for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDiff {
    /// The instance's identity.
    pub address: InstanceAddress,
    /// The overall action.
    pub action: DiffAction,
    /// Changed attributes by name.
    pub changes: BTreeMap<String, AttributeChange>,
    /// Every attribute value the instance will have after the action.
    pub planned: BTreeMap<String, PlannedValue>,
    /// The remote id of the existing object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_id: Option<String>,
    /// Instances this one depends on.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<InstanceAddress>,
    /// Per-instance replacement policy override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_policy: Option<ReplacePolicy>,
    /// Old remote objects still to be deleted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// The desired instance this diff was computed from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredInstance>,
    /// Freshly read remote attributes the diff was computed against, when
    /// they differed from the recorded ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<AttributeMap>,
}

impl InstanceDiff {
    /// Returns `true` if nothing needs to happen for this instance.
    pub fn is_noop(&self) -> bool {
        self.action == DiffAction::NoOp && self.deposed.is_empty()
    }

    /// Returns `true` if any planned value is still unknown.
    pub fn has_unknowns(&self) -> bool {
        self.planned.values().any(PlannedValue::is_unknown)
    }

    /// Attribute names in the order the provider must receive them.
    pub fn ordered_names(&self, schema: &ResourceSchema) -> Vec<String> {
        schema.order_changes(self.changes.keys())
    }

    /// The changes as provider update entries, in constraint order.
    ///
    /// Fails if a value is still unknown.
    pub fn ordered_updates(&self, schema: &ResourceSchema) -> Result<Vec<AttributeUpdate>> {
        self.ordered_names(schema)
            .into_iter()
            .filter_map(|name| self.changes.get(&name).map(|change| (name, change)))
            .map(|(name, change)| match &change.after {
                PlannedValue::Known(value) => Ok(AttributeUpdate {
                    name,
                    value: value.clone(),
                }),
                PlannedValue::Unknown => Err(EngineError::Config(format!(
                    "{}: attribute '{}' is still unknown at apply time",
                    self.address, name
                ))),
            })
            .collect()
    }

    /// The planned attributes as concrete values.
    ///
    /// Fails if a configured value is still unknown. Unknown computed values
    /// are left out; the provider fills them in.
    pub fn known_attributes(&self, schema: &ResourceSchema) -> Result<AttributeMap> {
        let mut attributes = AttributeMap::new();
        for (name, value) in &self.planned {
            match value {
                PlannedValue::Known(Value::Null) => {},
                PlannedValue::Known(v) => {
                    attributes.insert(name.clone(), v.clone());
                },
                PlannedValue::Unknown => {
                    let computed = schema.attribute(name).is_some_and(|a| a.flags.computed);
                    if !computed {
                        return Err(EngineError::Config(format!(
                            "{}: attribute '{}' is still unknown at apply time",
                            self.address, name
                        )));
                    }
                },
            }
        }
        Ok(attributes)
    }
}

/// Compute the diff for one instance.
///
/// At least one of `prior` and `desired` must be given.
pub fn diff(
    schema: &ResourceSchema,
    prior: Option<&ResourceInstance>,
    desired: Option<&DesiredInstance>,
) -> Result<InstanceDiff> {
    diff_with_observed(schema, prior, None, desired)
}

/// Compute the diff for one instance against freshly read remote attributes.
///
/// `observed` replaces the recorded attributes of `prior` for the comparison,
/// so drift shows up as an update or replacement. The state itself is not
/// touched.
pub fn diff_with_observed(
    schema: &ResourceSchema,
    prior: Option<&ResourceInstance>,
    observed: Option<&AttributeMap>,
    desired: Option<&DesiredInstance>,
) -> Result<InstanceDiff> {
    let refreshed = match (prior, observed) {
        (Some(p), Some(attributes)) if p.id.is_some() => Some(ResourceInstance {
            attributes: attributes.clone(),
            ..p.clone()
        }),
        _ => None,
    };
    let observed = refreshed.as_ref().map(|r| r.attributes.clone());
    let prior = refreshed.as_ref().or(prior);

    let address = match (prior, desired) {
        (_, Some(d)) => d.address.clone(),
        (Some(p), None) => p.address.clone(),
        (None, None) => {
            return Err(EngineError::Config(
                "diff needs a prior or a desired instance".to_string(),
            ))
        },
    };
    if address.resource_type != schema.type_name {
        return Err(EngineError::SchemaMismatch {
            address,
            reason: format!("schema is for type '{}'", schema.type_name),
        });
    }

    let deposed = prior.map(|p| p.deposed.clone()).unwrap_or_default();
    let prior = prior.filter(|p| p.id.is_some());

    let Some(desired) = desired else {
        let prior_id = prior.and_then(|p| p.id.clone());
        let action = if prior_id.is_some() {
            DiffAction::Delete
        } else {
            DiffAction::NoOp
        };
        return Ok(InstanceDiff {
            address,
            action,
            changes: BTreeMap::new(),
            planned: BTreeMap::new(),
            prior_id,
            dependencies: prior.map(|p| p.dependencies.clone()).unwrap_or_default(),
            replace_policy: None,
            deposed,
            desired: None,
            observed: None,
        });
    };

    check_configured(schema, desired)?;
    if let Err(diagnostics) = validate_result(schema, &desired.attributes) {
        return Err(EngineError::Validation {
            address,
            diagnostics,
        });
    }

    let mut result = InstanceDiff {
        address,
        action: DiffAction::NoOp,
        changes: BTreeMap::new(),
        planned: BTreeMap::new(),
        prior_id: prior.and_then(|p| p.id.clone()),
        dependencies: desired.dependencies.clone(),
        replace_policy: desired.replace_policy,
        deposed,
        desired: Some(desired.clone()),
        observed,
    };

    let Some(prior) = prior else {
        result.action = DiffAction::Create;
        result.planned = fresh_planned(schema, desired);
        result.changes = result
            .planned
            .iter()
            .filter(|(name, value)| !value.is_unknown() || configured(desired, name).is_some())
            .map(|(name, value)| {
                (
                    name.clone(),
                    AttributeChange {
                        before: None,
                        after: value.clone(),
                        implied: ChangeKind::Update,
                    },
                )
            })
            .collect();
        return Ok(result);
    };

    for (name, attr) in &schema.attributes {
        let before = prior.attributes.get(name).filter(|v| !v.is_null());

        if attr.mutability() == Mutability::ComputedOnly {
            if let Some(v) = before {
                result
                    .planned
                    .insert(name.clone(), PlannedValue::Known(v.clone()));
            }
            continue;
        }

        let target = match configured(desired, name) {
            Some(value) => Some(value.clone()),
            // Optional+computed and not configured: the provider owns it
            None if attr.flags.computed => {
                if let Some(v) = before {
                    result
                        .planned
                        .insert(name.clone(), PlannedValue::Known(v.clone()));
                }
                continue;
            },
            None => attr.default.clone().map(PlannedValue::Known),
        };

        let implied = match attr.mutability() {
            Mutability::ForcesReplacement => ChangeKind::Replace,
            _ => ChangeKind::Update,
        };

        match target {
            None => {
                if let Some(v) = before {
                    result.changes.insert(
                        name.clone(),
                        AttributeChange {
                            before: Some(v.clone()),
                            after: PlannedValue::Known(Value::Null),
                            implied,
                        },
                    );
                }
            },
            Some(PlannedValue::Unknown) => {
                result.changes.insert(
                    name.clone(),
                    AttributeChange {
                        before: before.cloned(),
                        after: PlannedValue::Unknown,
                        implied: ChangeKind::Update,
                    },
                );
                result.planned.insert(name.clone(), PlannedValue::Unknown);
            },
            Some(PlannedValue::Known(value)) => {
                let value = normalize(&attr.attr_type, value);
                let unchanged = before
                    .map(|b| normalize(&attr.attr_type, b.clone()) == value)
                    .unwrap_or(false);
                if !unchanged {
                    result.changes.insert(
                        name.clone(),
                        AttributeChange {
                            before: before.cloned(),
                            after: PlannedValue::Known(value.clone()),
                            implied,
                        },
                    );
                }
                result.planned.insert(name.clone(), PlannedValue::Known(value));
            },
        }
    }

    let replace = result
        .changes
        .values()
        .any(|c| c.implied == ChangeKind::Replace);
    if replace {
        // Other changes are recomputed against the new object
        result.action = DiffAction::Replace;
        result.changes.retain(|_, c| c.implied == ChangeKind::Replace);
        result.planned = fresh_planned(schema, desired);
    } else if !result.changes.is_empty() {
        result.action = DiffAction::Update;
    }
    Ok(result)
}

/// A configured value, treating explicit null as absent.
fn configured<'a>(desired: &'a DesiredInstance, name: &str) -> Option<&'a PlannedValue> {
    desired
        .attributes
        .get(name)
        .filter(|v| !matches!(v, PlannedValue::Known(Value::Null)))
}

/// Planned attributes for a brand-new object.
fn fresh_planned(
    schema: &ResourceSchema,
    desired: &DesiredInstance,
) -> BTreeMap<String, PlannedValue> {
    let mut planned = BTreeMap::new();
    for (name, attr) in &schema.attributes {
        let value = match configured(desired, name) {
            Some(PlannedValue::Known(v)) => {
                Some(PlannedValue::Known(normalize(&attr.attr_type, v.clone())))
            },
            Some(PlannedValue::Unknown) => Some(PlannedValue::Unknown),
            None => match &attr.default {
                Some(default) => Some(PlannedValue::Known(default.clone())),
                None if attr.flags.computed => Some(PlannedValue::Unknown),
                None => None,
            },
        };
        if let Some(value) = value {
            planned.insert(name.clone(), value);
        }
    }
    planned
}

fn check_configured(schema: &ResourceSchema, desired: &DesiredInstance) -> Result<()> {
    for name in desired.attributes.keys() {
        match schema.attribute(name) {
            None => {
                return Err(EngineError::SchemaMismatch {
                    address: desired.address.clone(),
                    reason: format!(
                        "attribute '{}' is not defined for type '{}'",
                        name, schema.type_name
                    ),
                })
            },
            Some(attr) if attr.mutability() == Mutability::ComputedOnly => {
                return Err(EngineError::SchemaMismatch {
                    address: desired.address.clone(),
                    reason: format!(
                        "attribute '{}' is computed by the provider and cannot be configured",
                        name
                    ),
                })
            },
            Some(_) => {},
        }
    }
    Ok(())
}

/// Bring a value into canonical form for comparison.
///
/// Integers configured for float attributes become floats and sets are
/// sorted, so equal values always compare equal.
pub(crate) fn normalize(attr_type: &AttributeType, value: Value) -> Value {
    match (attr_type, value) {
        (AttributeType::Float64, Value::Int(i)) => Value::Float(i as f64),
        (AttributeType::Set(element), Value::List(items)) => {
            let mut items: Vec<Value> = items
                .into_iter()
                .map(|item| normalize(element, item))
                .collect();
            items.sort_by_cached_key(|item| serde_json::Value::from(item.clone()).to_string());
            items.dedup();
            Value::List(items)
        },
        (AttributeType::List(element), Value::List(items)) => Value::List(
            items
                .into_iter()
                .map(|item| normalize(element, item))
                .collect(),
        ),
        (AttributeType::Map(element), Value::Map(map)) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, normalize(element, v)))
                .collect(),
        ),
        (AttributeType::Object(fields), Value::Map(map)) => Value::Map(
            map.into_iter()
                .map(|(k, v)| {
                    let v = match fields.get(&k) {
                        Some(field_type) => normalize(field_type, v),
                        None => v,
                    };
                    (k, v)
                })
                .collect(),
        ),
        (_, value) => value,
    }
}
