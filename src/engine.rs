//! The engine facade.
//!
//! [`Engine`] ties a provider, a state store and the engine settings together
//! and exposes the four operations a caller needs: [`plan`](Engine::plan),
//! [`apply`](Engine::apply), [`refresh`](Engine::refresh) and
//! [`import`](Engine::import).
//!
//! # Example
//!
//! ```
//! use hemmer_engine::desired::{Configuration, DesiredResource};
//! use hemmer_engine::state::MemoryStateStore;
//! use hemmer_engine::testing::{sample_registry, MockProvider};
//! use hemmer_engine::{Engine, EngineConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let engine = Engine::from_provider(
//!     Arc::new(MockProvider::new(sample_registry())),
//!     Arc::new(MemoryStateStore::new()),
//!     EngineConfig::default(),
//! );
//!
//! let config = Configuration::new()
//!     .with_resource(DesiredResource::new("network", "main").with("name", "main"));
//! let plan = engine.plan(&config).await.unwrap();
//! println!("{}", plan.render());
//!
//! let result = engine.apply(&plan, CancellationToken::new()).await.unwrap();
//! assert!(result.is_success());
//! assert!(engine.plan(&config).await.unwrap().is_empty());
//! # });
//! ```

use crate::config::EngineConfig;
use crate::desired::Configuration;
use crate::drift::{DriftReconciler, DriftReport};
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionResult, Executor};
use crate::plan::{build_plan, diff_configuration_observed, Plan};
use crate::provider::ResourceProvider;
use crate::retry::{is_transient, retry_with_backoff};
use crate::schema::SchemaRegistry;
use crate::state::{InstanceAddress, LockInfo, ResourceInstance, StateSnapshot, StateStore};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Plans and applies configurations against one provider and state store.
pub struct Engine {
    registry: Arc<SchemaRegistry>,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine.
    pub fn new(
        registry: SchemaRegistry,
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            provider,
            store,
            config,
        }
    }

    /// Create an engine using the schemas the provider declares.
    pub fn from_provider(
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        let registry = provider.schema();
        Self::new(registry, provider, store, config)
    }

    /// The schemas this engine plans against.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read the current state snapshot.
    pub async fn state(&self) -> Result<StateSnapshot> {
        self.store.read().await
    }

    /// Compute the actions needed to reach `config`.
    ///
    /// Nothing is changed remotely. With `refresh_before_plan` set, the state
    /// is refreshed from the provider first and configured instances are
    /// diffed against the attributes the provider reported, so drift is
    /// corrected by the apply.
    pub async fn plan(&self, config: &Configuration) -> Result<Plan> {
        let report = if self.config.refresh_before_plan {
            Some(self.refresh().await?)
        } else {
            None
        };
        let snapshot = self.store.read().await?;
        let observed = report
            .map(|r| r.observed_attributes(&snapshot))
            .unwrap_or_default();
        let diffs = diff_configuration_observed(&self.registry, &snapshot, &observed, config)?;
        let graph = build_plan(diffs, &self.registry)?;

        let summary = graph.summary();
        info!(
            add = summary.add,
            change = summary.change,
            destroy = summary.destroy,
            state_version = snapshot.version,
            "Plan ready"
        );
        Ok(Plan {
            graph,
            lineage: snapshot.lineage,
            state_version: snapshot.version,
        })
    }

    /// Execute a plan.
    ///
    /// Holds the state lock for the whole run. Fails with
    /// [`EngineError::StateConflict`] if the state changed since the plan was
    /// made; the caller should plan again.
    pub async fn apply(&self, plan: &Plan, cancel: CancellationToken) -> Result<ExecutionResult> {
        self.with_lock(|| async {
            let snapshot = self.store.read().await?;
            let moved = snapshot.version != plan.state_version
                || (snapshot.version > 0 && snapshot.lineage != plan.lineage);
            if moved {
                return Err(EngineError::StateConflict {
                    expected: plan.state_version,
                    found: snapshot.version,
                });
            }

            let executor = Executor::new(
                Arc::clone(&self.provider),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.config.clone(),
            );
            executor.execute(&plan.graph, cancel).await
        })
        .await
    }

    /// Re-read every managed instance.
    ///
    /// Instances deleted outside the engine are dropped from the state, so
    /// the next plan recreates them. Changed attributes are reported but not
    /// written.
    pub async fn refresh(&self) -> Result<DriftReport> {
        let report = self.reconciler().reconcile_store(self.store.as_ref()).await?;
        info!(
            checked = report.entries.len(),
            deleted = report.deleted().count(),
            changed = report.changed().count(),
            errors = report.errors().count(),
            "Refresh complete"
        );
        Ok(report)
    }

    /// Report drift without changing the state.
    pub async fn detect_drift(&self) -> Result<DriftReport> {
        let snapshot = self.store.read().await?;
        Ok(self.reconciler().reconcile(&snapshot).await)
    }

    /// A reconciler for running drift checks, e.g. in a background task.
    pub fn reconciler(&self) -> DriftReconciler {
        DriftReconciler::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            &self.config,
        )
    }

    /// Adopt an existing remote object into the state.
    ///
    /// Fails with [`EngineError::AlreadyManaged`] if the address is already
    /// in state, or with a provider error if the object cannot be read.
    pub async fn import(&self, address: InstanceAddress, id: &str) -> Result<ResourceInstance> {
        let schema = self.registry.get(&address.resource_type)?;
        self.with_lock(|| async {
            let snapshot = self.store.read().await?;
            if snapshot.get(&address).is_some() {
                return Err(EngineError::AlreadyManaged(address.clone()));
            }

            let attributes = retry_with_backoff(
                &self.config.retry,
                schema.timeouts.read,
                "import",
                is_transient,
                || self.provider.read(&address.resource_type, id),
            )
            .await
            .map_err(|source| EngineError::Provider {
                address: address.clone(),
                source,
            })?;

            let mut instance = ResourceInstance::new(address.clone(), id, attributes);
            instance.schema_version = schema.version;
            let mut next = snapshot.clone();
            next.put(instance.clone());
            self.store.compare_and_swap(snapshot.version, next).await?;
            info!(address = %address, id, "Imported");
            Ok(instance)
        })
        .await
    }

    async fn with_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock: LockInfo = self.store.lock(&self.config.lock_holder).await?;
        let result = f().await;
        if let Err(err) = self.store.unlock(&lock).await {
            warn!(error = %err, lock_id = %lock.id, "Failed to release state lock");
        }
        result
    }
}
