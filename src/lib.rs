//! Hemmer Engine
//!
//! A declarative reconciliation engine. Given a desired configuration and the
//! last-known state, it computes the difference, orders the required changes
//! by dependency, and applies them through a [`ResourceProvider`] with retries,
//! timeouts and bounded parallelism. The state is written back after every
//! successful change.
//!
//! # Overview
//!
//! - **Schemas**: [`schema::SchemaRegistry`] describes every resource type
//!   (attribute types, mutability, defaults, ordering, replacement policy)
//! - **Desired configuration**: [`desired::Configuration`] with literal values
//!   and references between instances
//! - **State**: [`state::StateSnapshot`] in a [`state::StateStore`] with
//!   compare-and-swap writes ([`state::MemoryStateStore`],
//!   [`state::FileStateStore`])
//! - **Diff and plan**: [`diff::diff`] per instance, [`plan::build_plan`] for
//!   the execution graph
//! - **Executor**: [`executor::Executor`] walks the graph
//! - **Drift**: [`drift::DriftReconciler`] re-reads remote objects
//! - **Engine**: [`Engine`] bundles all of the above
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_engine::{
//!     async_trait, Engine, EngineConfig, ProviderError, ResourceProvider,
//!     desired::{Configuration, DesiredResource, Reference},
//!     provider::{AttributeUpdate, Created},
//!     schema::{Attribute, ResourceSchema, SchemaRegistry},
//!     state::FileStateStore,
//!     value::AttributeMap,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct CloudProvider { client: CloudClient }
//!
//! #[async_trait]
//! impl ResourceProvider for CloudProvider {
//!     fn schema(&self) -> SchemaRegistry {
//!         SchemaRegistry::new("1.0.0")
//!             .with_resource(ResourceSchema::new("network")
//!                 .with_attribute("name", Attribute::required_string().with_force_new()))
//!             .unwrap()
//!     }
//!
//!     async fn create(&self, resource_type: &str, attributes: &AttributeMap)
//!         -> Result<Created, ProviderError> { /* ... */ }
//!     async fn read(&self, resource_type: &str, id: &str)
//!         -> Result<AttributeMap, ProviderError> { /* ... */ }
//!     async fn update(&self, resource_type: &str, id: &str, prior: &AttributeMap,
//!         changes: &[AttributeUpdate]) -> Result<AttributeMap, ProviderError> { /* ... */ }
//!     async fn delete(&self, resource_type: &str, id: &str)
//!         -> Result<(), ProviderError> { /* ... */ }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     hemmer_engine::init_logging();
//!
//!     let engine = Engine::from_provider(
//!         Arc::new(CloudProvider::connect().await?),
//!         Arc::new(FileStateStore::new("hemmer.state.json")),
//!         EngineConfig::from_file("hemmer.json")?,
//!     );
//!
//!     let config = Configuration::from_json_str(&std::fs::read_to_string("desired.json")?)?;
//!     let plan = engine.plan(&config).await?;
//!     println!("{}", plan.render());
//!
//!     let result = engine.apply(&plan, CancellationToken::new()).await?;
//!     println!("{:?}", result.status);
//!     Ok(())
//! }
//! ```
//!
//! # Failure Model
//!
//! Providers classify their errors as [`ProviderError::NotFound`],
//! [`ProviderError::Retryable`] or [`ProviderError::Fatal`]. Retryable errors
//! and timeouts are retried with exponential backoff. A fatal error fails the
//! action and skips everything that depends on it, while independent actions
//! still run. Every failure is reported per action in the
//! [`executor::ExecutionResult`] together with the partial progress.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod desired;
pub mod diff;
pub mod drift;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod plan;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod state;
pub mod testing;
pub mod validation;
pub mod value;

// Re-export main types at crate root
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, ProviderError, Result};
pub use executor::{ActionStatus, ExecutionResult, RunStatus};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use plan::{ExecutionGraph, Plan};
pub use provider::ResourceProvider;
pub use retry::RetryPolicy;
pub use validation::{is_valid, validate, validate_result};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use tokio_util::sync::CancellationToken;
pub use tracing;
