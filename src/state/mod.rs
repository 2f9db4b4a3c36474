//! Last-known state.
//!
//! The [`StateSnapshot`] records what the engine believes exists remotely. It
//! is owned by a [`StateStore`] and only ever replaced through
//! compare-and-swap on its version counter, so an apply and a concurrent
//! reconciliation loop cannot silently overwrite each other.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::error::{EngineError, Result};
use crate::value::AttributeMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a resource instance: its type plus a local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceAddress {
    /// The resource type, e.g. `storage_bucket`.
    pub resource_type: String,
    /// The local name given in configuration.
    pub name: String,
}

impl InstanceAddress {
    /// Create a new address.
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for InstanceAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((ty, name)) if !ty.is_empty() && !name.is_empty() => Ok(Self::new(ty, name)),
            _ => Err(format!("invalid instance address '{}', expected 'type.name'", s)),
        }
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InstanceAddress> for String {
    fn from(address: InstanceAddress) -> Self {
        address.to_string()
    }
}

/// A managed resource instance as last seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// The instance's identity.
    pub address: InstanceAddress,
    /// The remote identifier; `None` until the instance has been created.
    pub id: Option<String>,
    /// Attribute values, including computed ones.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// Instances this one depended on when it was last applied.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<InstanceAddress>,
    /// Schema version the attributes were written with.
    #[serde(default)]
    pub schema_version: u64,
    /// Remote ids of old objects still awaiting deletion after a
    /// create-before-destroy replacement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
}

impl ResourceInstance {
    /// Create a realized instance.
    pub fn new(address: InstanceAddress, id: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            address,
            id: Some(id.into()),
            attributes,
            dependencies: BTreeSet::new(),
            schema_version: 0,
            deposed: Vec::new(),
        }
    }

    /// Record the instances this one depends on.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = InstanceAddress>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }
}

/// Versioned snapshot of all managed instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Identifies the history this snapshot belongs to.
    pub lineage: Uuid,
    /// Incremented by every successful write.
    pub version: u64,
    /// When the snapshot was last written.
    pub updated_at: DateTime<Utc>,
    /// Instances by address.
    #[serde(default)]
    pub instances: BTreeMap<InstanceAddress, ResourceInstance>,
}

impl StateSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn empty() -> Self {
        Self {
            lineage: Uuid::new_v4(),
            version: 0,
            updated_at: Utc::now(),
            instances: BTreeMap::new(),
        }
    }

    /// Look up an instance.
    pub fn get(&self, address: &InstanceAddress) -> Option<&ResourceInstance> {
        self.instances.get(address)
    }

    /// Insert or replace an instance.
    pub fn put(&mut self, instance: ResourceInstance) {
        self.instances.insert(instance.address.clone(), instance);
    }

    /// Remove an instance.
    pub fn remove(&mut self, address: &InstanceAddress) -> Option<ResourceInstance> {
        self.instances.remove(address)
    }

    /// Forget the remote object of an instance.
    ///
    /// An instance that still has deposed objects is kept with no id and no
    /// attributes, so those objects are deleted by a later run. Otherwise the
    /// instance is removed.
    pub fn forget_remote_object(&mut self, address: &InstanceAddress) {
        let keep = self
            .get(address)
            .is_some_and(|instance| !instance.deposed.is_empty());
        if !keep {
            self.instances.remove(address);
        } else if let Some(instance) = self.instances.get_mut(address) {
            instance.id = None;
            instance.attributes.clear();
        }
    }

    /// Record that a deposed object of an instance has been deleted.
    ///
    /// Removes the instance once it has neither a remote object nor deposed
    /// objects left.
    pub fn retire_deposed(&mut self, address: &InstanceAddress, id: &str) {
        let Some(instance) = self.instances.get_mut(address) else {
            return;
        };
        instance.deposed.retain(|d| d != id);
        if instance.id.is_none() && instance.deposed.is_empty() {
            self.instances.remove(address);
        }
    }

    /// Number of managed instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` if nothing is managed.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Information about a held state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Create lock info for a new holder.
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Durable storage for the state snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current snapshot.
    async fn read(&self) -> Result<StateSnapshot>;

    /// Replace the snapshot if the stored version equals `expected_version`.
    ///
    /// Returns the new version. Fails with
    /// [`EngineError::StateConflict`] if another writer got there first.
    async fn compare_and_swap(&self, expected_version: u64, snapshot: StateSnapshot) -> Result<u64>;

    /// Acquire the exclusive state lock.
    async fn lock(&self, holder: &str) -> Result<LockInfo>;

    /// Release a lock previously returned by [`StateStore::lock`].
    async fn unlock(&self, lock: &LockInfo) -> Result<()>;
}

/// Read the snapshot, apply `f`, and write it back with compare-and-swap.
///
/// Returns the snapshot as written.
pub async fn modify<F>(store: &dyn StateStore, f: F) -> Result<StateSnapshot>
where
    F: FnOnce(&mut StateSnapshot),
{
    let mut snapshot = store.read().await?;
    let expected = snapshot.version;
    f(&mut snapshot);
    snapshot.version = store.compare_and_swap(expected, snapshot.clone()).await?;
    Ok(snapshot)
}

/// Check a compare-and-swap against the stored snapshot and stamp the new one.
pub(crate) fn prepare_swap(
    stored: &StateSnapshot,
    expected_version: u64,
    mut next: StateSnapshot,
) -> Result<StateSnapshot> {
    if stored.version != expected_version {
        return Err(EngineError::StateConflict {
            expected: expected_version,
            found: stored.version,
        });
    }
    if stored.version > 0 && stored.lineage != next.lineage {
        return Err(EngineError::Config(format!(
            "state lineage mismatch: stored {}, got {}",
            stored.lineage, next.lineage
        )));
    }
    next.lineage = stored.lineage;
    next.version = expected_version + 1;
    next.updated_at = Utc::now();
    Ok(next)
}
