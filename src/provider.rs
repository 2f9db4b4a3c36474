//! The provider capability interface.
//!
//! A provider wraps one remote API. It knows how to create, read, update and
//! delete objects of the resource types it declares in its
//! [`SchemaRegistry`], and it classifies its own failures as
//! [`ProviderError`]s. The engine handles everything else: diffing, ordering,
//! retries, timeouts and state.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_engine::provider::{Created, ResourceProvider};
//! use hemmer_engine::schema::{Attribute, ResourceSchema, SchemaRegistry};
//!
//! struct BucketProvider { client: StorageClient }
//!
//! #[async_trait::async_trait]
//! impl ResourceProvider for BucketProvider {
//!     fn schema(&self) -> SchemaRegistry {
//!         SchemaRegistry::new("1.0.0")
//!             .with_resource(ResourceSchema::new("storage_bucket")
//!                 .with_attribute("name", Attribute::required_string().with_force_new()))
//!             .unwrap()
//!     }
//!
//!     async fn create(&self, resource_type: &str, attributes: &AttributeMap)
//!         -> Result<Created, ProviderError> {
//!         // ...
//!     }
//!
//!     // ... read, update, delete
//! }
//! ```

use crate::error::ProviderError;
use crate::schema::SchemaRegistry;
use crate::value::{AttributeMap, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// The remote identifier assigned to the new object.
    pub id: String,
    /// The object's attributes as the remote system reports them.
    pub attributes: AttributeMap,
}

impl Created {
    /// Create a new result.
    pub fn new(id: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }
}

/// One attribute to change in an update call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    /// The attribute name.
    pub name: String,
    /// The new value; [`Value::Null`] removes the attribute.
    pub value: Value,
}

impl AttributeUpdate {
    /// Create a new update entry.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Trait that provider implementations must implement.
///
/// All calls may be retried: an implementation must tolerate seeing the same
/// call again after returning [`ProviderError::Retryable`] or timing out.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Return the schemas of every resource type this provider manages.
    fn schema(&self) -> SchemaRegistry;

    /// Create a new remote object.
    async fn create(
        &self,
        resource_type: &str,
        attributes: &AttributeMap,
    ) -> Result<Created, ProviderError>;

    /// Read the current attributes of a remote object.
    ///
    /// Returns [`ProviderError::NotFound`] if the object no longer exists.
    async fn read(&self, resource_type: &str, id: &str) -> Result<AttributeMap, ProviderError>;

    /// Apply attribute changes to an existing object.
    ///
    /// `changes` arrive in the order the resource's ordering constraints
    /// require and must be applied in that order. Returns the object's
    /// attributes afterwards.
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        prior: &AttributeMap,
        changes: &[AttributeUpdate],
    ) -> Result<AttributeMap, ProviderError>;

    /// Delete a remote object.
    ///
    /// [`ProviderError::NotFound`] is treated as success.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ProviderError>;

    /// Prepare an object for deletion, e.g. by emptying a non-empty container.
    ///
    /// Called before every delete. The default does nothing.
    async fn pre_delete(&self, resource_type: &str, id: &str) -> Result<(), ProviderError> {
        let _ = (resource_type, id);
        Ok(())
    }
}
