//! Testing utilities for the engine and for code built on top of it.
//!
//! [`MockProvider`] is an in-memory [`ResourceProvider`] that records every
//! call it receives and can be scripted to fail, throttle, or behave with
//! eventual consistency. The assertion helpers check execution graphs
//! without spelling out their internals in every test.
//!
//! # Example
//!
//! ```
//! use hemmer_engine::testing::{sample_registry, CallKind, MockProvider};
//! use hemmer_engine::provider::ResourceProvider;
//! use hemmer_engine::value::{AttributeMap, Value};
//!
//! # tokio_test::block_on(async {
//! let provider = MockProvider::new(sample_registry());
//! let mut attrs = AttributeMap::new();
//! attrs.insert("name".to_string(), Value::from("main"));
//!
//! let created = provider.create("network", &attrs).await.unwrap();
//! assert_eq!(provider.calls_of(CallKind::Create), 1);
//! assert!(provider.object(&created.id).is_some());
//! # });
//! ```

use crate::error::ProviderError;
use crate::plan::{ActionKind, ExecutionGraph};
use crate::provider::{AttributeUpdate, Created, ResourceProvider};
use crate::schema::{Attribute, Diagnostic, ResourceSchema, SchemaRegistry};
use crate::state::InstanceAddress;
use crate::value::{AttributeMap, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// The provider operation a [`Call`] was made to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `pre_delete`
    PreDelete,
    /// `delete`
    Delete,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// The operation.
    pub kind: CallKind,
    /// The resource type it was made for.
    pub resource_type: String,
    /// The remote id, for everything but create.
    pub id: Option<String>,
    /// Attributes sent with a create.
    pub attributes: AttributeMap,
    /// Names of updated attributes, in the order they were sent.
    pub updates: Vec<String>,
}

impl Call {
    fn new(kind: CallKind, resource_type: &str, id: Option<&str>) -> Self {
        Self {
            kind,
            resource_type: resource_type.to_string(),
            id: id.map(str::to_string),
            attributes: AttributeMap::new(),
            updates: Vec::new(),
        }
    }
}

struct Script {
    kind: CallKind,
    resource_type: Option<String>,
    id: Option<String>,
    remaining: u32,
    error: ProviderError,
}

struct RemoteObject {
    resource_type: String,
    attributes: AttributeMap,
    hidden_reads: u32,
}

#[derive(Default)]
struct Remote {
    objects: BTreeMap<String, RemoteObject>,
    lingering: BTreeMap<String, (AttributeMap, u32)>,
}

/// An in-memory provider for tests.
pub struct MockProvider {
    registry: SchemaRegistry,
    remote: Mutex<Remote>,
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<Vec<Script>>,
    next_id: AtomicU64,
    latency: Option<Duration>,
    hide_new_reads: u32,
    linger_reads: u32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    /// Create a provider serving the given schemas.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            remote: Mutex::new(Remote::default()),
            calls: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            latency: None,
            hide_new_reads: 0,
            linger_reads: 0,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every call take this long.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// New objects return not-found for their first `reads` reads.
    pub fn with_eventual_create(mut self, reads: u32) -> Self {
        self.hide_new_reads = reads;
        self
    }

    /// Deleted objects stay readable for `reads` more reads.
    pub fn with_eventual_delete(mut self, reads: u32) -> Self {
        self.linger_reads = reads;
        self
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Fail the next `times` calls of `kind` with `error`.
    ///
    /// With a resource type, only calls for that type are affected.
    pub fn fail(&self, kind: CallKind, resource_type: Option<&str>, times: u32, error: ProviderError) {
        lock(&self.scripts).push(Script {
            kind,
            resource_type: resource_type.map(str::to_string),
            id: None,
            remaining: times,
            error,
        });
    }

    /// Fail every call of `kind` for `resource_type` with a fatal error.
    pub fn fail_always(&self, kind: CallKind, resource_type: &str, message: &str) {
        self.fail(
            kind,
            Some(resource_type),
            u32::MAX,
            ProviderError::Fatal(message.to_string()),
        );
    }

    /// Fail every call of `kind` made for the object `id` with a fatal error.
    pub fn fail_object(&self, kind: CallKind, id: &str, message: &str) {
        lock(&self.scripts).push(Script {
            kind,
            resource_type: None,
            id: Some(id.to_string()),
            remaining: u32::MAX,
            error: ProviderError::Fatal(message.to_string()),
        });
    }

    /// Drop every scripted failure.
    pub fn clear_failures(&self) {
        lock(&self.scripts).clear();
    }

    /// Throttle the next `times` calls of `kind`.
    pub fn throttle(&self, kind: CallKind, times: u32) {
        self.fail(kind, None, times, ProviderError::Retryable("throttled".to_string()));
    }

    // =========================================================================
    // Remote state
    // =========================================================================

    /// Add an object to the remote system without going through `create`.
    pub fn insert_object(&self, resource_type: &str, id: &str, attributes: AttributeMap) {
        lock(&self.remote).objects.insert(
            id.to_string(),
            RemoteObject {
                resource_type: resource_type.to_string(),
                attributes,
                hidden_reads: 0,
            },
        );
    }

    /// Delete an object behind the engine's back.
    pub fn remove_object(&self, id: &str) -> Option<AttributeMap> {
        lock(&self.remote).objects.remove(id).map(|o| o.attributes)
    }

    /// Change one attribute of an object behind the engine's back.
    pub fn set_attribute(&self, id: &str, name: &str, value: impl Into<Value>) {
        if let Some(object) = lock(&self.remote).objects.get_mut(id) {
            object.attributes.insert(name.to_string(), value.into());
        }
    }

    /// Current attributes of a remote object.
    pub fn object(&self, id: &str) -> Option<AttributeMap> {
        lock(&self.remote).objects.get(id).map(|o| o.attributes.clone())
    }

    /// Ids of every remote object of a type.
    pub fn object_ids(&self, resource_type: &str) -> Vec<String> {
        lock(&self.remote)
            .objects
            .iter()
            .filter(|(_, o)| o.resource_type == resource_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // =========================================================================
    // Call log
    // =========================================================================

    /// Every call received so far.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Number of calls of one kind.
    pub fn calls_of(&self, kind: CallKind) -> usize {
        lock(&self.calls).iter().filter(|c| c.kind == kind).count()
    }

    /// Number of calls that change the remote system.
    pub fn mutating_calls(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind != CallKind::Read)
            .count()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// The highest number of calls that were running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: Call) -> Result<(), ProviderError> {
        let scripted = self.scripted_error(&call);
        lock(&self.calls).push(call);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn scripted_error(&self, call: &Call) -> Option<ProviderError> {
        let mut scripts = lock(&self.scripts);
        let position = scripts.iter().position(|s| {
            s.kind == call.kind
                && s.remaining > 0
                && s.resource_type.as_ref().map_or(true, |t| t == &call.resource_type)
                && s.id.as_ref().map_or(true, |id| call.id.as_ref() == Some(id))
        })?;
        let script = &mut scripts[position];
        if script.remaining != u32::MAX {
            script.remaining -= 1;
        }
        let err = script.error.clone();
        if script.remaining == 0 {
            scripts.remove(position);
        }
        Some(err)
    }

    fn computed_defaults(&self, resource_type: &str, id: &str, attributes: &mut AttributeMap) {
        let Ok(schema) = self.registry.get(resource_type) else {
            return;
        };
        for (name, attr) in &schema.attributes {
            if attr.flags.computed && !attributes.contains_key(name) {
                attributes.insert(name.clone(), Value::String(format!("{}-{}", name, id)));
            }
        }
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    fn schema(&self) -> SchemaRegistry {
        self.registry.clone()
    }

    async fn create(
        &self,
        resource_type: &str,
        attributes: &AttributeMap,
    ) -> Result<Created, ProviderError> {
        let mut call = Call::new(CallKind::Create, resource_type, None);
        call.attributes = attributes.clone();
        self.enter(call).await?;

        let id = format!("{}-{}", resource_type, self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = attributes.clone();
        self.computed_defaults(resource_type, &id, &mut stored);
        lock(&self.remote).objects.insert(
            id.clone(),
            RemoteObject {
                resource_type: resource_type.to_string(),
                attributes: stored.clone(),
                hidden_reads: self.hide_new_reads,
            },
        );
        Ok(Created::new(id, stored))
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<AttributeMap, ProviderError> {
        self.enter(Call::new(CallKind::Read, resource_type, Some(id)))
            .await?;

        let mut remote = lock(&self.remote);
        if let Some(object) = remote.objects.get_mut(id) {
            if object.hidden_reads > 0 {
                object.hidden_reads -= 1;
                return Err(ProviderError::NotFound(id.to_string()));
            }
            return Ok(object.attributes.clone());
        }
        if let Some((attributes, reads)) = remote.lingering.get_mut(id) {
            if *reads > 0 {
                *reads -= 1;
                return Ok(attributes.clone());
            }
        }
        Err(ProviderError::NotFound(id.to_string()))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        _prior: &AttributeMap,
        changes: &[AttributeUpdate],
    ) -> Result<AttributeMap, ProviderError> {
        let mut call = Call::new(CallKind::Update, resource_type, Some(id));
        call.updates = changes.iter().map(|c| c.name.clone()).collect();
        self.enter(call).await?;

        let mut remote = lock(&self.remote);
        let object = remote
            .objects
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        for change in changes {
            if change.value.is_null() {
                object.attributes.remove(&change.name);
            } else {
                object
                    .attributes
                    .insert(change.name.clone(), change.value.clone());
            }
        }
        Ok(object.attributes.clone())
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ProviderError> {
        self.enter(Call::new(CallKind::Delete, resource_type, Some(id)))
            .await?;

        let mut remote = lock(&self.remote);
        let object = remote
            .objects
            .remove(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if self.linger_reads > 0 {
            remote
                .lingering
                .insert(id.to_string(), (object.attributes, self.linger_reads));
        }
        Ok(())
    }

    async fn pre_delete(&self, resource_type: &str, id: &str) -> Result<(), ProviderError> {
        self.enter(Call::new(CallKind::PreDelete, resource_type, Some(id)))
            .await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Schemas for a small network/disk/server model used throughout the tests.
///
/// - `network`: `name` forces replacement, `cidr` defaults to `10.0.0.0/16`,
///   `arn` is computed.
/// - `disk`: `size` updates in place, `zone` forces replacement, `tier` is
///   applied before `size`.
/// - `server`: `disk_id` forces replacement, `address` is computed.
pub fn sample_registry() -> SchemaRegistry {
    let network = ResourceSchema::new("network")
        .with_attribute("name", Attribute::required_string().with_force_new())
        .with_attribute("cidr", Attribute::optional_string().with_default("10.0.0.0/16"))
        .with_attribute("arn", Attribute::computed_string());
    let disk = ResourceSchema::new("disk")
        .with_attribute("size", Attribute::required_int64())
        .with_attribute("zone", Attribute::optional_string().with_force_new())
        .with_attribute("tier", Attribute::optional_string())
        .with_attribute("network_id", Attribute::optional_string())
        .with_ordering("tier", "size");
    let server = ResourceSchema::new("server")
        .with_attribute("name", Attribute::required_string())
        .with_attribute("disk_id", Attribute::optional_string().with_force_new())
        .with_attribute("network_id", Attribute::optional_string())
        .with_attribute("password", Attribute::optional_string().sensitive())
        .with_attribute("address", Attribute::computed_string());

    let mut registry = SchemaRegistry::new("0.1.0");
    for schema in [network, disk, server] {
        if let Err(err) = registry.register(schema) {
            panic!("sample schema is invalid: {}", err);
        }
    }
    registry
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a graph contains no actions.
///
/// # Panics
///
/// Panics if any action is planned.
pub fn assert_no_changes(graph: &ExecutionGraph) {
    assert!(
        graph.is_empty(),
        "Expected no changes, but the plan contains:\n{}",
        graph.render()
    );
}

/// Assert the main action planned for an instance.
///
/// # Panics
///
/// Panics if the instance has no action or a different one.
pub fn assert_action(graph: &ExecutionGraph, address: &str, expected: &str) {
    let parsed: InstanceAddress = match address.parse() {
        Ok(parsed) => parsed,
        Err(err) => panic!("Invalid address '{}': {}", address, err),
    };
    let action = graph
        .find(&parsed)
        .unwrap_or_else(|| panic!("Expected an action for {}, plan:\n{}", address, graph.render()));
    let name = match &action.kind {
        ActionKind::Create => "create",
        ActionKind::Update => "update",
        ActionKind::Replace { .. } => "replace",
        ActionKind::Delete => "delete",
        ActionKind::DeleteDeposed { .. } => "delete-deposed",
    };
    assert_eq!(name, expected, "Unexpected action for {}", address);
}

/// Assert that `first` runs before `second` in the graph's order.
///
/// # Panics
///
/// Panics if either instance has no action or the order is reversed.
pub fn assert_runs_before(graph: &ExecutionGraph, first: &str, second: &str) {
    let position = |address: &str| {
        graph
            .topological_order()
            .iter()
            .position(|&i| graph.actions()[i].address.to_string() == address)
            .unwrap_or_else(|| panic!("No action for {}", address))
    };
    assert!(
        position(first) < position(second),
        "Expected {} to run before {}",
        first,
        second
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
    assert!(errors.is_empty(), "Expected no errors, got: {:?}", errors);
}
