//! End-to-end reconciliation scenarios against the mock provider.

use hemmer_engine::desired::{Configuration, DesiredResource, Reference};
use hemmer_engine::drift::DriftKind;
use hemmer_engine::state::{FileStateStore, InstanceAddress, MemoryStateStore, StateStore};
use hemmer_engine::testing::{
    assert_action, assert_no_changes, assert_runs_before, sample_registry, CallKind, MockProvider,
};
use hemmer_engine::value::Value;
use hemmer_engine::{
    ActionStatus, CancellationToken, Engine, EngineConfig, EngineError, ProviderError, RunStatus,
};
use std::sync::Arc;

fn addr(s: &str) -> InstanceAddress {
    s.parse().unwrap()
}

fn setup() -> (Engine, Arc<MockProvider>, Arc<MemoryStateStore>) {
    let provider = Arc::new(MockProvider::new(sample_registry()));
    let store = Arc::new(MemoryStateStore::new());
    let engine = Engine::from_provider(provider.clone(), store.clone(), EngineConfig::default());
    (engine, provider, store)
}

fn disk(size: i64, zone: &str) -> Configuration {
    Configuration::new().with_resource(
        DesiredResource::new("disk", "data")
            .with("size", size)
            .with("zone", zone),
    )
}

async fn converge(engine: &Engine, config: &Configuration) {
    let plan = engine.plan(config).await.unwrap();
    let result = engine.apply(&plan, CancellationToken::new()).await.unwrap();
    assert!(result.is_success(), "apply failed: {:?}", result.outcomes);
}

#[tokio::test]
async fn test_size_change_is_a_single_update() {
    let (engine, provider, store) = setup();
    converge(&engine, &disk(1, "a")).await;
    let id = store.read().await.unwrap().get(&addr("disk.data")).unwrap().id.clone();
    provider.clear_calls();

    let plan = engine.plan(&disk(2, "a")).await.unwrap();
    assert_action(&plan.graph, "disk.data", "update");
    assert!(plan.render().contains("~ disk.data"));
    engine.apply(&plan, CancellationToken::new()).await.unwrap();

    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Update);
    assert_eq!(calls[0].updates, vec!["size".to_string()]);

    let state = store.read().await.unwrap();
    let instance = state.get(&addr("disk.data")).unwrap();
    assert_eq!(instance.id, id);
    assert_eq!(instance.attributes["size"], Value::from(2));
}

#[tokio::test]
async fn test_forces_replacement_deletes_then_creates() {
    let (engine, provider, store) = setup();
    converge(&engine, &disk(1, "a")).await;
    provider.clear_calls();

    let plan = engine.plan(&disk(1, "b")).await.unwrap();
    assert_action(&plan.graph, "disk.data", "replace");
    assert!(plan.render().contains("# forces replacement"));
    engine.apply(&plan, CancellationToken::new()).await.unwrap();

    let kinds: Vec<CallKind> = provider
        .calls()
        .iter()
        .map(|c| c.kind)
        .filter(|k| *k != CallKind::PreDelete)
        .collect();
    assert_eq!(kinds, vec![CallKind::Delete, CallKind::Create]);

    let state = store.read().await.unwrap();
    let instance = state.get(&addr("disk.data")).unwrap();
    assert_eq!(instance.attributes["zone"], Value::from("b"));
    assert_eq!(provider.object_ids("disk"), vec![instance.id.clone().unwrap()]);
}

#[tokio::test]
async fn test_external_delete_is_recreated() {
    let (engine, provider, store) = setup();
    let config = disk(1, "a");
    converge(&engine, &config).await;

    let id = store.read().await.unwrap().get(&addr("disk.data")).unwrap().id.clone().unwrap();
    provider.remove_object(&id);

    let report = engine.reconciler().reconcile_store(store.as_ref()).await.unwrap();
    assert_eq!(report.entry(&addr("disk.data")).unwrap().kind, DriftKind::Deleted);
    assert!(store.read().await.unwrap().is_empty());

    let plan = engine.plan(&config).await.unwrap();
    assert_action(&plan.graph, "disk.data", "create");
    engine.apply(&plan, CancellationToken::new()).await.unwrap();
    assert_eq!(provider.object_ids("disk").len(), 1);
}

#[tokio::test]
async fn test_fatal_error_skips_only_dependents() {
    let (engine, provider, _) = setup();
    provider.fail_always(CallKind::Create, "network", "invalid cidr");
    let config = Configuration::new()
        .with_resource(DesiredResource::new("network", "main").with("name", "main"))
        .with_resource(
            DesiredResource::new("server", "web")
                .with("name", "web")
                .with("network_id", Reference::id(addr("network.main"))),
        )
        .with_resource(DesiredResource::new("disk", "data").with("size", 1));

    let plan = engine.plan(&config).await.unwrap();
    assert_runs_before(&plan.graph, "network.main", "server.web");
    let result = engine.apply(&plan, CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let status = |a: &str| result.outcome(&addr(a)).unwrap().status;
    assert_eq!(status("network.main"), ActionStatus::Failed);
    assert_eq!(status("server.web"), ActionStatus::Skipped);
    assert_eq!(status("disk.data"), ActionStatus::Succeeded);
    assert_eq!(provider.calls_of(CallKind::Create), 2);

    let err = result.outcome(&addr("network.main")).unwrap().error.as_ref().unwrap();
    assert!(matches!(
        err,
        EngineError::Provider {
            source: ProviderError::Fatal(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_unchanged_configuration_makes_no_calls() {
    let (engine, provider, store) = setup();
    let config = disk(3, "a").with_resource(DesiredResource::new("network", "main").with("name", "n"));
    converge(&engine, &config).await;
    let version = store.read().await.unwrap().version;
    provider.clear_calls();

    let plan = engine.plan(&config).await.unwrap();
    assert_no_changes(&plan.graph);
    assert_eq!(plan.render(), "No changes. Infrastructure matches the configuration.\n");
    engine.apply(&plan, CancellationToken::new()).await.unwrap();

    assert!(provider.calls().is_empty());
    assert_eq!(store.read().await.unwrap().version, version);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_call() {
    let (engine, provider, _) = setup();
    let config = Configuration::new()
        .with_resource(
            DesiredResource::new("disk", "a")
                .with("size", 1)
                .with("network_id", Reference::id(addr("disk.b"))),
        )
        .with_resource(
            DesiredResource::new("disk", "b")
                .with("size", 1)
                .with("network_id", Reference::id(addr("disk.a"))),
        );

    match engine.plan(&config).await {
        Err(EngineError::CyclicDependency(members)) => {
            assert_eq!(members, vec![addr("disk.a"), addr("disk.b")])
        },
        other => panic!("expected a cycle, got {:?}", other.map(|p| p.render())),
    }
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_file_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let provider = Arc::new(MockProvider::new(sample_registry()));
    let config = disk(1, "a");

    let engine = Engine::from_provider(
        provider.clone(),
        Arc::new(FileStateStore::new(&path)),
        EngineConfig::default(),
    );
    converge(&engine, &config).await;
    drop(engine);

    let engine = Engine::from_provider(
        provider.clone(),
        Arc::new(FileStateStore::new(&path)),
        EngineConfig::default(),
    );
    let plan = engine.plan(&config).await.unwrap();
    assert!(plan.is_empty());
    assert_eq!(plan.state_version, 1);
}
