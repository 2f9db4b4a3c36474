//! Drift detection.
//!
//! The [`DriftReconciler`] re-reads every managed instance from the provider
//! and compares what it finds with the last-known state. Objects that no
//! longer exist are reported as [`DriftKind::Deleted`] and can be pruned from
//! the state so the next plan recreates them. Attribute differences are only
//! reported; the next plan diffs against the observed values and the executor
//! corrects them.

use crate::config::EngineConfig;
use crate::diff::normalize;
use crate::error::{ProviderError, Result};
use crate::provider::ResourceProvider;
use crate::retry::{is_transient, retry_with_backoff, RetryPolicy};
use crate::schema::{ResourceSchema, SchemaRegistry};
use crate::state::{InstanceAddress, ResourceInstance, StateSnapshot, StateStore};
use crate::value::{AttributeMap, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single attribute that differs from the recorded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDelta {
    /// The attribute name.
    pub name: String,
    /// The value in state, if any.
    pub recorded: Option<Value>,
    /// The value the provider reported, if any.
    pub actual: Option<Value>,
}

/// What was found for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftKind {
    /// The remote object matches the state.
    InSync,
    /// The remote object has different attributes.
    Changed {
        /// Differing attributes, ordered by name.
        deltas: Vec<AttributeDelta>,
    },
    /// The remote object no longer exists.
    Deleted,
    /// The object could not be read.
    Error {
        /// Why the read failed.
        message: String,
    },
}

/// The drift result for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEntry {
    /// The instance.
    pub address: InstanceAddress,
    /// The remote id that was read.
    pub id: String,
    /// What was found.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// The result of one drift check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
    /// The state version that was checked.
    pub state_version: u64,
    /// One entry per managed instance, ordered by address.
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    /// Returns `true` if every instance is in sync.
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.kind == DriftKind::InSync)
    }

    /// Instances whose remote object is gone.
    pub fn deleted(&self) -> impl Iterator<Item = &InstanceAddress> {
        self.entries
            .iter()
            .filter(|e| e.kind == DriftKind::Deleted)
            .map(|e| &e.address)
    }

    /// Instances whose attributes drifted.
    pub fn changed(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, DriftKind::Changed { .. }))
    }

    /// Instances that could not be read.
    pub fn errors(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, DriftKind::Error { .. }))
    }

    /// The entry for an instance.
    pub fn entry(&self, address: &InstanceAddress) -> Option<&DriftEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    /// The remote attributes of every drifted instance, rebuilt from the
    /// recorded attributes in `snapshot` and the reported deltas.
    ///
    /// Instances whose id in `snapshot` differs from the one that was read
    /// are left out.
    pub fn observed_attributes(
        &self,
        snapshot: &StateSnapshot,
    ) -> BTreeMap<InstanceAddress, AttributeMap> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let DriftKind::Changed { deltas } = &entry.kind else {
                    return None;
                };
                let instance = snapshot
                    .get(&entry.address)
                    .filter(|i| i.id.as_deref() == Some(entry.id.as_str()))?;
                let mut attributes = instance.attributes.clone();
                for delta in deltas {
                    match &delta.actual {
                        Some(value) => attributes.insert(delta.name.clone(), value.clone()),
                        None => attributes.remove(&delta.name),
                    };
                }
                Some((entry.address.clone(), attributes))
            })
            .collect()
    }
}

/// Compares state with the remote system.
pub struct DriftReconciler {
    provider: Arc<dyn ResourceProvider>,
    registry: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    parallelism: usize,
    lock_holder: String,
}

impl DriftReconciler {
    /// Create a reconciler using the engine's retry and parallelism settings.
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        registry: Arc<SchemaRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            retry: config.retry.clone(),
            parallelism: config.parallelism.max(1),
            lock_holder: config.lock_holder.clone(),
        }
    }

    /// Read every managed instance and report how it differs from `snapshot`.
    ///
    /// A failed read produces an [`DriftKind::Error`] entry; the other
    /// instances are still checked.
    pub async fn reconcile(&self, snapshot: &StateSnapshot) -> DriftReport {
        report(snapshot, self.observe(snapshot).await)
    }

    /// Reconcile the stored snapshot and prune instances that were deleted
    /// outside the engine.
    ///
    /// Attribute drift is only reported. Pruning takes the state lock, so it
    /// fails with [`StateLocked`](crate::error::EngineError::StateLocked)
    /// while an apply is running. An instance is only pruned if it still has
    /// the id that was found missing.
    pub async fn reconcile_store(&self, store: &dyn StateStore) -> Result<DriftReport> {
        let snapshot = store.read().await?;
        let entries = self.observe(&snapshot).await;
        let gone: Vec<(&InstanceAddress, &str)> = entries
            .iter()
            .filter(|e| e.kind == DriftKind::Deleted)
            .map(|e| (&e.address, e.id.as_str()))
            .collect();

        if !gone.is_empty() {
            let lock = store.lock(&self.lock_holder).await?;
            let pruned = prune(store, &gone).await;
            if let Err(err) = store.unlock(&lock).await {
                warn!(error = %err, lock_id = %lock.id, "Failed to release state lock");
            }
            let count = pruned?;
            info!(count, "Pruned instances deleted outside the engine");
        }
        Ok(report(&snapshot, entries))
    }

    /// Reconcile the store every `interval` until `cancel` fires.
    ///
    /// Each report is sent on `reports`. The loop also stops when the
    /// receiver is dropped. A failed round is logged and retried on the next
    /// tick.
    pub async fn run_periodic(
        &self,
        store: Arc<dyn StateStore>,
        interval: Duration,
        cancel: CancellationToken,
        reports: mpsc::Sender<DriftReport>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Starting drift reconciliation loop");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            match self.reconcile_store(store.as_ref()).await {
                Ok(report) => {
                    if !report.is_clean() {
                        info!(
                            deleted = report.deleted().count(),
                            changed = report.changed().count(),
                            errors = report.errors().count(),
                            "Drift detected"
                        );
                    }
                    if reports.send(report).await.is_err() {
                        debug!("Drift report receiver dropped");
                        break;
                    }
                },
                Err(err) => warn!(error = %err, "Drift reconciliation failed"),
            }
        }
        info!("Drift reconciliation loop stopped");
    }

    async fn observe(&self, snapshot: &StateSnapshot) -> Vec<DriftEntry> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();

        for instance in snapshot.instances.values() {
            let Some(id) = instance.id.clone() else {
                continue;
            };
            let instance = instance.clone();
            let provider = Arc::clone(&self.provider);
            let schema = self.registry.get(&instance.address.resource_type).cloned();
            let retry = self.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                observe_instance(provider.as_ref(), schema, &retry, &instance, id).await
            });
        }

        let mut entries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(error = %err, "Drift check task aborted"),
            }
        }
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }
}

async fn observe_instance(
    provider: &dyn ResourceProvider,
    schema: Result<ResourceSchema>,
    retry: &RetryPolicy,
    instance: &ResourceInstance,
    id: String,
) -> DriftEntry {
    let address = instance.address.clone();
    let error = |message: String| DriftEntry {
        address: address.clone(),
        id: id.clone(),
        kind: DriftKind::Error { message },
    };

    let schema = match schema {
        Ok(schema) => schema,
        Err(err) => return error(err.to_string()),
    };
    let read = retry_with_backoff(retry, schema.timeouts.read, "read", is_transient, || {
        provider.read(&address.resource_type, &id)
    })
    .await;

    let kind = match read {
        Ok(actual) => {
            let deltas = compare(&schema, &instance.attributes, &actual);
            if deltas.is_empty() {
                DriftKind::InSync
            } else {
                DriftKind::Changed { deltas }
            }
        },
        Err(ProviderError::NotFound(_)) => {
            info!(address = %address, id = %id, "Remote object is gone");
            DriftKind::Deleted
        },
        Err(err) => {
            warn!(address = %address, id = %id, error = %err, "Drift read failed");
            return error(err.to_string());
        },
    };
    DriftEntry {
        address: address.clone(),
        id: id.clone(),
        kind,
    }
}

/// Attribute-level differences between recorded and actual values.
fn compare(schema: &ResourceSchema, recorded: &AttributeMap, actual: &AttributeMap) -> Vec<AttributeDelta> {
    let names: BTreeSet<&String> = recorded.keys().chain(actual.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let canonical = |value: Option<&Value>| {
                value.filter(|v| !v.is_null()).map(|v| match schema.attribute(name) {
                    Some(attr) => normalize(&attr.attr_type, v.clone()),
                    None => v.clone(),
                })
            };
            let before = canonical(recorded.get(name));
            let after = canonical(actual.get(name));
            (before != after).then(|| AttributeDelta {
                name: name.clone(),
                recorded: before,
                actual: after,
            })
        })
        .collect()
}

async fn prune(store: &dyn StateStore, gone: &[(&InstanceAddress, &str)]) -> Result<usize> {
    let current = store.read().await?;
    let mut next = current.clone();
    let mut count = 0;
    for &(address, id) in gone {
        if next.get(address).and_then(|i| i.id.as_deref()) == Some(id) {
            next.forget_remote_object(address);
            count += 1;
        }
    }
    if count > 0 {
        store.compare_and_swap(current.version, next).await?;
    }
    Ok(count)
}

fn report(snapshot: &StateSnapshot, entries: Vec<DriftEntry>) -> DriftReport {
    DriftReport {
        checked_at: Utc::now(),
        state_version: snapshot.version,
        entries,
    }
}
