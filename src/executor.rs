//! Plan execution.
//!
//! The [`Executor`] walks an [`ExecutionGraph`] with bounded parallelism. An
//! action starts once every action it depends on has succeeded. After each
//! successful remote change the state snapshot is written back with
//! compare-and-swap before any dependent action starts, so a crash or failure
//! never leaves state behind the remote system by more than one action.
//!
//! When an action fails, everything downstream of it is skipped while
//! independent parts of the graph keep going. Cancelling the run stops new
//! actions from starting; actions already talking to the provider finish.

use crate::config::EngineConfig;
use crate::diff::{diff_with_observed, DiffAction, InstanceDiff};
use crate::error::{EngineError, ProviderError, Result};
use crate::plan::{ActionKind, ExecutionGraph, PlannedAction};
use crate::provider::ResourceProvider;
use crate::retry::{is_transient, retry_with_backoff, RetryPolicy};
use crate::schema::{ReplacePolicy, ResourceSchema, SchemaRegistry};
use crate::state::{InstanceAddress, ResourceInstance, StateSnapshot, StateStore};
use crate::value::AttributeMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Where an action is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Not started.
    Pending,
    /// Waiting on the provider.
    Running,
    /// Finished and recorded in state.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Not run because something it depends on failed.
    Skipped,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every action succeeded.
    Succeeded,
    /// At least one action failed.
    Failed,
    /// The run was cancelled before every action could start.
    Cancelled,
    /// Another writer changed the state during the run. Completed actions
    /// are recorded; nothing new was started after the change was seen.
    Conflict,
}

/// The final state of one action.
#[derive(Debug)]
pub struct ActionOutcome {
    /// The target instance.
    pub address: InstanceAddress,
    /// What the action was.
    pub kind: ActionKind,
    /// Where it ended up.
    pub status: ActionStatus,
    /// Why it failed.
    pub error: Option<EngineError>,
}

/// The result of executing a graph, including partial progress.
#[derive(Debug)]
pub struct ExecutionResult {
    /// One outcome per action, in graph order.
    pub outcomes: Vec<ActionOutcome>,
    /// Overall status.
    pub status: RunStatus,
    /// State version after the last successful write.
    pub state_version: u64,
    /// The concurrent state change that halted the run, if any.
    pub conflict: Option<EngineError>,
}

impl ExecutionResult {
    /// Returns `true` if every action succeeded.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Outcomes with the given status.
    pub fn with_status(&self, status: ActionStatus) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(move |o| o.status == status)
    }

    /// Number of outcomes with the given status.
    pub fn count(&self, status: ActionStatus) -> usize {
        self.with_status(status).count()
    }

    /// The outcome of the main action for an instance.
    pub fn outcome(&self, address: &InstanceAddress) -> Option<&ActionOutcome> {
        self.outcomes
            .iter()
            .find(|o| &o.address == address && !matches!(o.kind, ActionKind::DeleteDeposed { .. }))
    }

    /// Convert a conflicted run into its [`EngineError::StateConflict`].
    pub fn into_result(mut self) -> Result<Self> {
        if self.status == RunStatus::Conflict {
            let err = self.conflict.take().or_else(|| {
                self.outcomes
                    .iter_mut()
                    .find_map(|o| o.error.take_if(|e| e.is_conflict()))
            });
            if let Some(err) = err {
                return Err(err);
            }
        }
        Ok(self)
    }
}

const REBASE_ATTEMPTS: u32 = 5;

/// Serializes state writes made by one run.
struct StateWriter {
    store: Arc<dyn StateStore>,
    working: Mutex<StateSnapshot>,
    conflict: Mutex<Option<(u64, u64)>>,
}

impl StateWriter {
    fn new(store: Arc<dyn StateStore>, snapshot: StateSnapshot) -> Self {
        Self {
            store,
            working: Mutex::new(snapshot),
            conflict: Mutex::new(None),
        }
    }

    async fn snapshot(&self) -> StateSnapshot {
        self.working.lock().await.clone()
    }

    /// The first concurrent change seen by this run, as `(expected, found)`.
    async fn conflict(&self) -> Option<(u64, u64)> {
        *self.conflict.lock().await
    }

    /// Apply a change for one instance and write it back.
    ///
    /// If another writer got there first, the change is applied again on top
    /// of the stored snapshot so the remote work is not lost.
    async fn commit<F>(&self, f: F) -> Result<u64>
    where
        F: Fn(&mut StateSnapshot),
    {
        let mut working = self.working.lock().await;
        let mut base = working.clone();
        let mut attempt = 1;
        loop {
            let mut next = base.clone();
            f(&mut next);
            match self.store.compare_and_swap(base.version, next.clone()).await {
                Ok(version) => {
                    next.version = version;
                    *working = next;
                    return Ok(version);
                },
                Err(EngineError::StateConflict { expected, found }) if attempt < REBASE_ATTEMPTS => {
                    warn!(expected, found, attempt, "State changed during apply, rebasing write");
                    let mut seen = self.conflict.lock().await;
                    if seen.is_none() {
                        *seen = Some((expected, found));
                    }
                    drop(seen);
                    base = self.store.read().await?;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

struct ActionContext {
    provider: Arc<dyn ResourceProvider>,
    registry: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    state: StateWriter,
}

enum TaskOutcome {
    Done(Result<()>),
    NotStarted,
}

/// Runs execution graphs against a provider and a state store.
pub struct Executor {
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn StateStore>,
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
}

impl Executor {
    /// Create a new executor.
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn StateStore>,
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
            config,
        }
    }

    /// Execute every action in the graph.
    ///
    /// Returns an error only if the run could not start; failures of
    /// individual actions are reported in the [`ExecutionResult`].
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let snapshot = self.store.read().await?;
        let start_version = snapshot.version;
        let ctx = Arc::new(ActionContext {
            provider: Arc::clone(&self.provider),
            registry: Arc::clone(&self.registry),
            retry: self.config.retry.clone(),
            state: StateWriter::new(Arc::clone(&self.store), snapshot),
        });

        let count = graph.len();
        let mut rank = vec![0; count];
        for (position, &index) in graph.topological_order().iter().enumerate() {
            rank[index] = position;
        }
        let mut waiting: Vec<usize> = (0..count)
            .map(|i| graph.dependencies_of(i).count())
            .collect();
        let mut status = vec![ActionStatus::Pending; count];
        let mut errors: Vec<Option<EngineError>> = (0..count).map(|_| None).collect();
        let mut ready: BTreeSet<(usize, usize)> = (0..count)
            .filter(|&i| waiting[i] == 0)
            .map(|i| (rank[i], i))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks: JoinSet<(usize, TaskOutcome)> = JoinSet::new();
        let mut task_index: HashMap<task::Id, usize> = HashMap::new();
        let mut halted = false;

        info!(actions = count, parallelism = self.config.parallelism, "Starting apply");

        loop {
            if !halted && !cancel.is_cancelled() {
                while let Some((_, index)) = ready.pop_first() {
                    let Some(action) = graph.action(index) else {
                        continue;
                    };
                    status[index] = ActionStatus::Running;
                    let action = action.clone();
                    let ctx = Arc::clone(&ctx);
                    let semaphore = Arc::clone(&semaphore);
                    let cancel = cancel.clone();
                    let span = info_span!("action", address = %action.address, action = %action.kind);
                    let handle = tasks.spawn(
                        async move {
                            let Ok(_permit) = semaphore.acquire_owned().await else {
                                return (index, TaskOutcome::NotStarted);
                            };
                            if cancel.is_cancelled() {
                                return (index, TaskOutcome::NotStarted);
                            }
                            (index, TaskOutcome::Done(run_action(&ctx, &action).await))
                        }
                        .instrument(span),
                    );
                    task_index.insert(handle.id(), index);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (index, outcome) = match joined {
                Ok((_, done)) => done,
                Err(err) => {
                    let Some(&index) = task_index.get(&err.id()) else {
                        error!(error = %err, "Unknown action task aborted");
                        continue;
                    };
                    let reason = if err.is_panic() {
                        "task panicked"
                    } else {
                        "task cancelled"
                    };
                    let aborted = EngineError::ActionAborted {
                        address: graph.actions()[index].address.clone(),
                        reason: reason.to_string(),
                    };
                    (index, TaskOutcome::Done(Err(aborted)))
                },
            };
            let address = &graph.actions()[index].address;

            match outcome {
                TaskOutcome::NotStarted => {
                    status[index] = ActionStatus::Pending;
                },
                TaskOutcome::Done(Ok(())) => {
                    status[index] = ActionStatus::Succeeded;
                    info!(address = %address, "Action succeeded");
                    for dependent in graph.dependents_of(index) {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 && status[dependent] == ActionStatus::Pending {
                            ready.insert((rank[dependent], dependent));
                        }
                    }
                },
                TaskOutcome::Done(Err(err)) => {
                    status[index] = ActionStatus::Failed;
                    if err.is_conflict() {
                        warn!(address = %address, error = %err, "State changed during apply, halting");
                        halted = true;
                    } else {
                        warn!(address = %address, error = %err, "Action failed");
                        skip_descendants(graph, index, &mut status, &mut ready, &rank);
                    }
                    errors[index] = Some(err);
                },
            }

            if !halted && ctx.state.conflict().await.is_some() {
                warn!("State changed during apply, no new actions will start");
                halted = true;
            }
        }

        let conflict = ctx
            .state
            .conflict()
            .await
            .map(|(expected, found)| EngineError::StateConflict { expected, found });
        let state_version = ctx.state.snapshot().await.version;
        let outcomes: Vec<ActionOutcome> = graph
            .actions()
            .iter()
            .zip(status.iter().zip(errors))
            .map(|(action, (&status, error))| ActionOutcome {
                address: action.address.clone(),
                kind: action.kind.clone(),
                status,
                error,
            })
            .collect();

        let run_status = if halted {
            RunStatus::Conflict
        } else if outcomes.iter().any(|o| o.status == ActionStatus::Failed) {
            RunStatus::Failed
        } else if outcomes.iter().any(|o| o.status == ActionStatus::Pending) {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };

        let result = ExecutionResult {
            outcomes,
            status: run_status,
            state_version,
            conflict,
        };
        info!(
            status = ?result.status,
            succeeded = result.count(ActionStatus::Succeeded),
            failed = result.count(ActionStatus::Failed),
            skipped = result.count(ActionStatus::Skipped),
            pending = result.count(ActionStatus::Pending),
            from_version = start_version,
            to_version = state_version,
            "Apply finished"
        );
        Ok(result)
    }
}

fn skip_descendants(
    graph: &ExecutionGraph,
    index: usize,
    status: &mut [ActionStatus],
    ready: &mut BTreeSet<(usize, usize)>,
    rank: &[usize],
) {
    let mut stack: Vec<usize> = graph.dependents_of(index).collect();
    while let Some(next) = stack.pop() {
        if status[next] != ActionStatus::Pending {
            continue;
        }
        status[next] = ActionStatus::Skipped;
        ready.remove(&(rank[next], next));
        debug!(address = %graph.actions()[next].address, "Skipping dependent of failed action");
        stack.extend(graph.dependents_of(next));
    }
}

async fn run_action(ctx: &ActionContext, action: &PlannedAction) -> Result<()> {
    let schema = ctx.registry.get(&action.address.resource_type)?;
    match &action.kind {
        ActionKind::Delete => {
            let Some(id) = action.diff.prior_id.as_deref() else {
                return Ok(());
            };
            delete_object(ctx, schema, &action.address, id).await?;
            let address = &action.address;
            ctx.state.commit(|s| s.forget_remote_object(address)).await?;
            Ok(())
        },
        ActionKind::DeleteDeposed { id } => {
            delete_object(ctx, schema, &action.address, id).await?;
            let address = &action.address;
            ctx.state.commit(|s| s.retire_deposed(address, id)).await?;
            Ok(())
        },
        ActionKind::Create | ActionKind::Update | ActionKind::Replace { .. } => {
            let fresh = rediff(ctx, schema, action).await?;
            let planned_policy = match action.kind {
                ActionKind::Replace { policy } => Some(policy),
                _ => None,
            };
            match fresh.action {
                DiffAction::Create => create_object(ctx, schema, &fresh).await,
                DiffAction::Update => update_object(ctx, schema, &fresh).await,
                DiffAction::Replace => {
                    let policy = fresh
                        .replace_policy
                        .or(planned_policy)
                        .unwrap_or(schema.replace_policy);
                    replace_object(ctx, schema, &fresh, policy).await
                },
                DiffAction::NoOp => {
                    debug!("Nothing left to change after resolving values");
                    Ok(())
                },
                DiffAction::Delete => Ok(()),
            }
        },
    }
}

/// Diff again with references resolved from the current state.
async fn rediff(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    action: &PlannedAction,
) -> Result<InstanceDiff> {
    let snapshot = ctx.state.snapshot().await;
    let Some(mut desired) = action.diff.desired.clone() else {
        return Ok(action.diff.clone());
    };
    desired.refresh_references(&snapshot)?;
    let fresh = diff_with_observed(
        schema,
        snapshot.get(&action.address),
        action.diff.observed.as_ref(),
        Some(&desired),
    )?;
    if fresh.action != action.diff.action {
        info!(
            planned = %action.diff.action,
            resolved = %fresh.action,
            "Action changed once values were known"
        );
    }
    Ok(fresh)
}

fn provider_error(address: &InstanceAddress, source: ProviderError) -> EngineError {
    EngineError::Provider {
        address: address.clone(),
        source,
    }
}

async fn create_object(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    fresh: &InstanceDiff,
) -> Result<()> {
    let (id, attributes) = provision(ctx, schema, fresh).await?;
    let instance = ResourceInstance {
        address: fresh.address.clone(),
        id: Some(id),
        attributes,
        dependencies: fresh.dependencies.clone(),
        schema_version: schema.version,
        deposed: fresh.deposed.clone(),
    };
    record_new_object(ctx, instance).await
}

/// Write a freshly created object to state.
async fn record_new_object(ctx: &ActionContext, instance: ResourceInstance) -> Result<()> {
    if let Err(err) = ctx.state.commit(|s| s.put(instance.clone())).await {
        error!(
            id = instance.id.as_deref().unwrap_or_default(),
            error = %err,
            "Created object could not be recorded in state"
        );
        return Err(err);
    }
    Ok(())
}

/// Create the remote object and wait for it to become visible.
async fn provision(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    fresh: &InstanceDiff,
) -> Result<(String, AttributeMap)> {
    let address = &fresh.address;
    let resource_type = address.resource_type.as_str();
    let attributes = fresh.known_attributes(schema)?;

    let created = retry_with_backoff(
        &ctx.retry,
        schema.timeouts.create,
        "create",
        is_transient,
        || ctx.provider.create(resource_type, &attributes),
    )
    .await
    .map_err(|e| provider_error(address, e))?;
    info!(id = %created.id, "Created");

    if !schema.confirm_create {
        return Ok((created.id, created.attributes));
    }

    // Newly created objects may not be readable yet
    let id = created.id.as_str();
    let confirmed = retry_with_backoff(
        &ctx.retry,
        schema.timeouts.read,
        "confirm create",
        |e| e.is_retryable() || e.is_not_found(),
        || ctx.provider.read(resource_type, id),
    )
    .await
    .map_err(|e| provider_error(address, e))?;
    debug!(id, "Create confirmed");
    Ok((created.id, confirmed))
}

async fn update_object(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    fresh: &InstanceDiff,
) -> Result<()> {
    let address = &fresh.address;
    let resource_type = address.resource_type.as_str();
    let snapshot = ctx.state.snapshot().await;
    let (Some(prior), Some(id)) = (snapshot.get(address), fresh.prior_id.as_deref()) else {
        return Err(EngineError::Config(format!(
            "{}: cannot update an instance that is not in state",
            address
        )));
    };
    let updates = fresh.ordered_updates(schema)?;
    debug!(
        changes = ?updates.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
        "Updating"
    );

    let attributes = retry_with_backoff(
        &ctx.retry,
        schema.timeouts.update,
        "update",
        is_transient,
        || ctx.provider.update(resource_type, id, &prior.attributes, &updates),
    )
    .await
    .map_err(|e| provider_error(address, e))?;
    info!(id, "Updated");

    ctx.state
        .commit(|s| {
            if let Some(instance) = s.instances.get_mut(address) {
                instance.attributes = attributes.clone();
                instance.dependencies = fresh.dependencies.clone();
                instance.schema_version = schema.version;
            }
        })
        .await?;
    Ok(())
}

async fn replace_object(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    fresh: &InstanceDiff,
    policy: ReplacePolicy,
) -> Result<()> {
    let address = &fresh.address;
    let Some(old_id) = fresh.prior_id.clone() else {
        return create_object(ctx, schema, fresh).await;
    };

    match policy {
        ReplacePolicy::DestroyBeforeCreate => {
            delete_object(ctx, schema, address, &old_id).await?;
            ctx.state.commit(|s| s.forget_remote_object(address)).await?;
            create_object(ctx, schema, fresh).await
        },
        ReplacePolicy::CreateBeforeDestroy => {
            let (id, attributes) = provision(ctx, schema, fresh).await?;
            let mut deposed = fresh.deposed.clone();
            deposed.push(old_id.clone());
            let instance = ResourceInstance {
                address: address.clone(),
                id: Some(id),
                attributes,
                dependencies: fresh.dependencies.clone(),
                schema_version: schema.version,
                deposed,
            };
            record_new_object(ctx, instance).await?;

            delete_object(ctx, schema, address, &old_id).await?;
            ctx.state.commit(|s| s.retire_deposed(address, &old_id)).await?;
            Ok(())
        },
    }
}

/// Drain, delete and optionally confirm the deletion of a remote object.
///
/// An object that is already gone counts as deleted.
async fn delete_object(
    ctx: &ActionContext,
    schema: &ResourceSchema,
    address: &InstanceAddress,
    id: &str,
) -> Result<()> {
    let resource_type = address.resource_type.as_str();
    let absent_ok = |result: std::result::Result<(), ProviderError>| match result {
        Err(ProviderError::NotFound(_)) => Ok(()),
        other => other,
    };

    let drained = retry_with_backoff(
        &ctx.retry,
        schema.timeouts.delete,
        "pre-delete",
        is_transient,
        || ctx.provider.pre_delete(resource_type, id),
    )
    .await;
    absent_ok(drained).map_err(|e| provider_error(address, e))?;

    let deleted = retry_with_backoff(
        &ctx.retry,
        schema.timeouts.delete,
        "delete",
        is_transient,
        || ctx.provider.delete(resource_type, id),
    )
    .await;
    if let Err(ProviderError::NotFound(_)) = &deleted {
        debug!(id, "Already deleted");
    }
    absent_ok(deleted).map_err(|e| provider_error(address, e))?;
    info!(id, "Deleted");

    if schema.confirm_delete {
        // Deleted objects may stay readable for a while
        retry_with_backoff(
            &ctx.retry,
            schema.timeouts.read,
            "confirm delete",
            is_transient,
            || async move {
                match ctx.provider.read(resource_type, id).await {
                    Ok(_) => Err(ProviderError::Retryable(format!("{} still exists", id))),
                    Err(ProviderError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .map_err(|e| provider_error(address, e))?;
        debug!(id, "Delete confirmed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::{Configuration, DesiredResource, Reference};
    use crate::plan::{build_plan, diff_configuration};
    use crate::provider::{AttributeUpdate, Created};
    use crate::schema::{Attribute, ReplacePolicy, ResourceSchema};
    use crate::state::{modify, MemoryStateStore};
    use crate::testing::{sample_registry, CallKind, MockProvider};
    use crate::value::Value;
    use std::time::Duration;

    struct Fixture {
        provider: Arc<MockProvider>,
        store: Arc<MemoryStateStore>,
        registry: Arc<SchemaRegistry>,
        executor: Executor,
    }

    fn fixture_with(provider: MockProvider, snapshot: StateSnapshot, parallelism: usize) -> Fixture {
        let registry = Arc::new(provider.schema());
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStateStore::with_snapshot(snapshot));
        let config = EngineConfig::default().with_parallelism(parallelism).with_retry(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100)),
        );
        let executor = Executor::new(
            provider.clone(),
            store.clone(),
            registry.clone(),
            config,
        );
        Fixture {
            provider,
            store,
            registry,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockProvider::new(sample_registry()), StateSnapshot::empty(), 10)
    }

    fn addr(s: &str) -> InstanceAddress {
        s.parse().unwrap()
    }

    fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn plan(f: &Fixture, config: &Configuration) -> ExecutionGraph {
        let snapshot = f.store.read().await.unwrap();
        let diffs = diff_configuration(&f.registry, &snapshot, config).unwrap();
        build_plan(diffs, &f.registry).unwrap()
    }

    fn network_and_disk() -> Configuration {
        Configuration::new()
            .with_resource(DesiredResource::new("network", "main").with("name", "main"))
            .with_resource(
                DesiredResource::new("disk", "data")
                    .with("size", 1)
                    .with("network_id", Reference::id(addr("network.main"))),
            )
    }

    /// State with one applied disk `d-1` in zone `a`, also present remotely.
    fn applied_disk(provider: &MockProvider) -> StateSnapshot {
        let attributes = attrs(&[("size", Value::from(1)), ("zone", Value::from("a"))]);
        provider.insert_object("disk", "d-1", attributes.clone());
        let mut snapshot = StateSnapshot::empty();
        snapshot.put(ResourceInstance::new(addr("disk.data"), "d-1", attributes));
        snapshot
    }

    #[tokio::test]
    async fn test_creates_in_dependency_order() {
        let f = fixture();
        let graph = plan(&f, &network_and_disk()).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.count(ActionStatus::Succeeded), 2);

        let calls = f.provider.calls();
        assert_eq!(calls[0].resource_type, "network");
        assert_eq!(calls[1].resource_type, "disk");
        assert_eq!(calls[1].attributes["network_id"], Value::from("network-1"));

        let state = f.store.read().await.unwrap();
        let disk = state.get(&addr("disk.data")).unwrap();
        assert_eq!(disk.id.as_deref(), Some("disk-2"));
        assert!(disk.dependencies.contains(&addr("network.main")));
        assert_eq!(result.state_version, state.version);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let f = fixture();
        f.provider.fail_always(CallKind::Create, "network", "quota exceeded");
        let config = network_and_disk()
            .with_resource(DesiredResource::new("disk", "scratch").with("size", 5));
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        let network = result.outcome(&addr("network.main")).unwrap();
        assert_eq!(network.status, ActionStatus::Failed);
        assert!(matches!(
            network.error,
            Some(EngineError::Provider {
                source: ProviderError::Fatal(_),
                ..
            })
        ));
        assert_eq!(
            result.outcome(&addr("disk.data")).unwrap().status,
            ActionStatus::Skipped
        );
        assert_eq!(
            result.outcome(&addr("disk.scratch")).unwrap().status,
            ActionStatus::Succeeded
        );

        let state = f.store.read().await.unwrap();
        assert_eq!(state.len(), 1);
        assert!(state.get(&addr("disk.scratch")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let f = fixture();
        f.provider.throttle(CallKind::Create, 2);
        let config = Configuration::new()
            .with_resource(DesiredResource::new("network", "main").with("name", "main"));
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(f.provider.calls_of(CallKind::Create), 3);
        assert_eq!(f.provider.object_ids("network").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let provider = MockProvider::new(sample_registry()).with_latency(Duration::from_millis(100));
        let f = fixture_with(provider, StateSnapshot::empty(), 2);
        let mut config = Configuration::new();
        for i in 0..5 {
            config.insert(DesiredResource::new("disk", format!("d{}", i)).with("size", i));
        }
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(f.provider.max_concurrency(), 2);
        assert_eq!(f.store.read().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let f = fixture();
        let graph = plan(&f, &network_and_disk()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f.executor.execute(&graph, cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.count(ActionStatus::Pending), 2);
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_sends_only_changed_attributes() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = applied_disk(&provider);
        let f = fixture_with(provider, snapshot, 10);
        let config = Configuration::new().with_resource(
            DesiredResource::new("disk", "data")
                .with("size", 2)
                .with("zone", "a")
                .with("tier", "fast"),
        );
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());

        let calls = f.provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::Update);
        assert_eq!(calls[0].updates, vec!["tier".to_string(), "size".to_string()]);
        let state = f.store.read().await.unwrap();
        assert_eq!(
            state.get(&addr("disk.data")).unwrap().attributes["size"],
            Value::from(2)
        );
    }

    #[tokio::test]
    async fn test_destroy_before_create_replacement() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = applied_disk(&provider);
        let f = fixture_with(provider, snapshot, 10);
        let config = Configuration::new()
            .with_resource(DesiredResource::new("disk", "data").with("size", 1).with("zone", "b"));
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());

        let kinds: Vec<CallKind> = f.provider.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::PreDelete, CallKind::Delete, CallKind::Create]);
        assert!(f.provider.object("d-1").is_none());

        let state = f.store.read().await.unwrap();
        let disk = state.get(&addr("disk.data")).unwrap();
        assert_eq!(disk.id.as_deref(), Some("disk-1"));
        assert_eq!(disk.attributes["zone"], Value::from("b"));
    }

    #[tokio::test]
    async fn test_create_before_destroy_replacement() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = applied_disk(&provider);
        let f = fixture_with(provider, snapshot, 10);
        let config = Configuration::new().with_resource(
            DesiredResource::new("disk", "data")
                .with("size", 1)
                .with("zone", "b")
                .with_replace_policy(ReplacePolicy::CreateBeforeDestroy),
        );
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());

        let kinds: Vec<CallKind> = f.provider.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::Create, CallKind::PreDelete, CallKind::Delete]);
        let state = f.store.read().await.unwrap();
        assert!(state.get(&addr("disk.data")).unwrap().deposed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_deposed_delete_is_kept_in_state() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = applied_disk(&provider);
        let f = fixture_with(provider, snapshot, 10);
        f.provider.fail_always(CallKind::Delete, "disk", "in use");
        let config = Configuration::new().with_resource(
            DesiredResource::new("disk", "data")
                .with("size", 1)
                .with("zone", "b")
                .with_replace_policy(ReplacePolicy::CreateBeforeDestroy),
        );
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        let state = f.store.read().await.unwrap();
        let disk = state.get(&addr("disk.data")).unwrap();
        assert_eq!(disk.id.as_deref(), Some("disk-1"));
        assert_eq!(disk.deposed, vec!["d-1".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = applied_disk(&provider);
        provider.remove_object("d-1");
        let f = fixture_with(provider, snapshot, 10);
        let graph = plan(&f, &Configuration::new()).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert!(f.store.read().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_create_and_delete() {
        let registry = SchemaRegistry::new("0.1.0")
            .with_resource(
                ResourceSchema::new("queue")
                    .with_attribute("name", Attribute::required_string().with_force_new())
                    .with_confirm_create()
                    .with_confirm_delete(),
            )
            .unwrap();
        let provider = MockProvider::new(registry)
            .with_eventual_create(2)
            .with_eventual_delete(2);
        let f = fixture_with(provider, StateSnapshot::empty(), 10);
        let config =
            Configuration::new().with_resource(DesiredResource::new("queue", "jobs").with("name", "a"));

        let graph = plan(&f, &config).await;
        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(f.provider.calls_of(CallKind::Read), 3);

        f.provider.clear_calls();
        let graph = plan(&f, &Configuration::new()).await;
        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(f.provider.calls_of(CallKind::Read), 3);
        assert!(f.store.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reference_is_resolved_at_apply() {
        let provider = MockProvider::new(sample_registry());
        provider.insert_object("network", "n-1", attrs(&[("name", Value::from("old"))]));
        provider.insert_object(
            "server",
            "s-1",
            attrs(&[("name", Value::from("web")), ("network_id", Value::from("n-1"))]),
        );
        let mut snapshot = StateSnapshot::empty();
        snapshot.put(ResourceInstance::new(
            addr("network.main"),
            "n-1",
            attrs(&[
                ("name", Value::from("old")),
                ("cidr", Value::from("10.0.0.0/16")),
                ("arn", Value::from("arn-1")),
            ]),
        ));
        snapshot.put(
            ResourceInstance::new(
                addr("server.web"),
                "s-1",
                attrs(&[
                    ("name", Value::from("web")),
                    ("network_id", Value::from("n-1")),
                    ("address", Value::from("10.0.0.5")),
                ]),
            )
            .with_dependencies([addr("network.main")]),
        );
        let f = fixture_with(provider, snapshot, 10);
        let config = Configuration::new()
            .with_resource(DesiredResource::new("network", "main").with("name", "new"))
            .with_resource(
                DesiredResource::new("server", "web")
                    .with("name", "web")
                    .with("network_id", Reference::id(addr("network.main"))),
            );
        let graph = plan(&f, &config).await;
        assert!(graph.find(&addr("server.web")).unwrap().diff.has_unknowns());

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());

        let state = f.store.read().await.unwrap();
        let network_id = state.get(&addr("network.main")).unwrap().id.clone().unwrap();
        assert_eq!(
            state.get(&addr("server.web")).unwrap().attributes["network_id"],
            Value::String(network_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_state_write_halts_run() {
        let provider = MockProvider::new(sample_registry()).with_latency(Duration::from_millis(100));
        let f = fixture_with(provider, StateSnapshot::empty(), 10);
        let graph = plan(&f, &network_and_disk()).await;

        let store = f.store.clone();
        let intruder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            modify(store.as_ref(), |_| {}).await.unwrap();
        });

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        intruder.await.unwrap();
        assert_eq!(result.status, RunStatus::Conflict);
        assert_eq!(
            result.outcome(&addr("network.main")).unwrap().status,
            ActionStatus::Succeeded
        );
        assert_eq!(
            result.outcome(&addr("disk.data")).unwrap().status,
            ActionStatus::Pending
        );
        assert!(matches!(
            result.into_result(),
            Err(EngineError::StateConflict {
                expected: 0,
                found: 1
            })
        ));

        // The created network was recorded on top of the other write
        let state = f.store.read().await.unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(
            state.get(&addr("network.main")).unwrap().id.as_deref(),
            Some("network-1")
        );

        let graph = plan(&f, &network_and_disk()).await;
        assert_eq!(graph.len(), 1);
        assert!(graph.find(&addr("network.main")).is_none());
        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(f.provider.object_ids("network"), vec!["network-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_lets_running_actions_finish() {
        let provider = MockProvider::new(sample_registry()).with_latency(Duration::from_millis(100));
        let f = fixture_with(provider, StateSnapshot::empty(), 10);
        let graph = plan(&f, &network_and_disk()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = f.executor.execute(&graph, cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(
            result.outcome(&addr("network.main")).unwrap().status,
            ActionStatus::Succeeded
        );
        assert_eq!(
            result.outcome(&addr("disk.data")).unwrap().status,
            ActionStatus::Pending
        );
        assert_eq!(f.provider.calls_of(CallKind::Create), 1);

        let state = f.store.read().await.unwrap();
        assert!(state.get(&addr("network.main")).is_some());
        assert!(state.get(&addr("disk.data")).is_none());
        assert_eq!(result.state_version, state.version);
    }

    /// State with disk `d-1` in zone `a` and a deposed `d-0`, both present
    /// remotely.
    fn disk_with_deposed(provider: &MockProvider) -> StateSnapshot {
        let mut snapshot = applied_disk(provider);
        provider.insert_object("disk", "d-0", attrs(&[("size", Value::from(1))]));
        if let Some(disk) = snapshot.instances.get_mut(&addr("disk.data")) {
            disk.deposed.push("d-0".to_string());
        }
        snapshot
    }

    fn deposed_ids(graph: &ExecutionGraph) -> Vec<String> {
        graph
            .actions()
            .iter()
            .filter_map(|a| match &a.kind {
                ActionKind::DeleteDeposed { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_delete_keeps_tracking_undeleted_deposed_object() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = disk_with_deposed(&provider);
        let f = fixture_with(provider, snapshot, 10);
        f.provider.fail_object(CallKind::Delete, "d-0", "in use");
        let graph = plan(&f, &Configuration::new()).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(
            result.outcome(&addr("disk.data")).unwrap().status,
            ActionStatus::Succeeded
        );
        assert!(f.provider.object("d-0").is_some());

        let state = f.store.read().await.unwrap();
        let disk = state.get(&addr("disk.data")).unwrap();
        assert_eq!(disk.id, None);
        assert_eq!(disk.deposed, vec!["d-0".to_string()]);

        f.provider.clear_failures();
        let graph = plan(&f, &Configuration::new()).await;
        assert_eq!(graph.len(), 1);
        assert_eq!(deposed_ids(&graph), vec!["d-0".to_string()]);

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert!(f.provider.object("d-0").is_none());
        assert!(f.store.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_recreate_keeps_deposed_objects() {
        let provider = MockProvider::new(sample_registry());
        let snapshot = disk_with_deposed(&provider);
        let f = fixture_with(provider, snapshot, 10);
        f.provider.fail_always(CallKind::Create, "disk", "quota exceeded");
        let config = Configuration::new()
            .with_resource(DesiredResource::new("disk", "data").with("size", 1).with("zone", "b"));
        let graph = plan(&f, &config).await;

        let result = f.executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(f.provider.object("d-1").is_none());
        assert!(f.provider.object("d-0").is_some());

        let state = f.store.read().await.unwrap();
        let disk = state.get(&addr("disk.data")).unwrap();
        assert_eq!(disk.id, None);
        assert_eq!(disk.deposed, vec!["d-0".to_string()]);

        let graph = plan(&f, &config).await;
        assert_eq!(graph.find(&addr("disk.data")).unwrap().kind, ActionKind::Create);
        assert_eq!(deposed_ids(&graph), vec!["d-0".to_string()]);
    }

    struct PanickingProvider {
        registry: SchemaRegistry,
    }

    #[async_trait::async_trait]
    impl ResourceProvider for PanickingProvider {
        fn schema(&self) -> SchemaRegistry {
            self.registry.clone()
        }

        async fn create(
            &self,
            resource_type: &str,
            attributes: &AttributeMap,
        ) -> std::result::Result<Created, ProviderError> {
            if resource_type == "network" {
                panic!("network client bug");
            }
            Ok(Created::new(format!("{}-1", resource_type), attributes.clone()))
        }

        async fn read(
            &self,
            _resource_type: &str,
            id: &str,
        ) -> std::result::Result<AttributeMap, ProviderError> {
            Err(ProviderError::NotFound(id.to_string()))
        }

        async fn update(
            &self,
            _resource_type: &str,
            _id: &str,
            prior: &AttributeMap,
            _changes: &[AttributeUpdate],
        ) -> std::result::Result<AttributeMap, ProviderError> {
            Ok(prior.clone())
        }

        async fn delete(&self, _resource_type: &str, _id: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_action_is_reported_as_aborted() {
        let registry = Arc::new(sample_registry());
        let store = Arc::new(MemoryStateStore::new());
        let executor = Executor::new(
            Arc::new(PanickingProvider {
                registry: sample_registry(),
            }),
            store.clone(),
            registry.clone(),
            EngineConfig::default(),
        );
        let config = network_and_disk()
            .with_resource(DesiredResource::new("disk", "scratch").with("size", 5));
        let snapshot = store.read().await.unwrap();
        let diffs = diff_configuration(&registry, &snapshot, &config).unwrap();
        let graph = build_plan(diffs, &registry).unwrap();

        let result = executor.execute(&graph, CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        let network = result.outcome(&addr("network.main")).unwrap();
        assert_eq!(network.status, ActionStatus::Failed);
        assert!(matches!(
            &network.error,
            Some(EngineError::ActionAborted { address, reason })
                if address == &addr("network.main") && reason == "task panicked"
        ));
        assert_eq!(
            result.outcome(&addr("disk.data")).unwrap().status,
            ActionStatus::Skipped
        );
        assert_eq!(
            result.outcome(&addr("disk.scratch")).unwrap().status,
            ActionStatus::Succeeded
        );
    }
}
