//! Plan building.
//!
//! [`diff_configuration`] diffs every configured and every previously managed
//! instance, resolving references in dependency order. [`build_plan`] turns
//! those diffs into an [`ExecutionGraph`]: a DAG of actions the executor can
//! walk in parallel. A plan can be rendered for review before anything is
//! applied.

use crate::desired::{Configuration, Reference, ID_ATTRIBUTE};
use crate::diff::{diff, diff_with_observed, ChangeKind, DiffAction, InstanceDiff};
use crate::error::{EngineError, Result};
use crate::schema::{ReplacePolicy, SchemaRegistry};
use crate::state::{InstanceAddress, StateSnapshot};
use crate::value::{AttributeMap, PlannedValue, Value};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use uuid::Uuid;

/// A step the executor performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new object.
    Create,
    /// Update an object in place.
    Update,
    /// Recreate an object.
    Replace {
        /// Which half of the replacement happens first.
        policy: ReplacePolicy,
    },
    /// Delete an object that is no longer configured.
    Delete,
    /// Delete an old object left over from a create-before-destroy.
    DeleteDeposed {
        /// The old object's remote id.
        id: String,
    },
}

impl ActionKind {
    fn symbol(&self) -> &'static str {
        match self {
            ActionKind::Create => "+",
            ActionKind::Update => "~",
            ActionKind::Replace {
                policy: ReplacePolicy::DestroyBeforeCreate,
            } => "-/+",
            ActionKind::Replace {
                policy: ReplacePolicy::CreateBeforeDestroy,
            } => "+/-",
            ActionKind::Delete | ActionKind::DeleteDeposed { .. } => "-",
        }
    }

    /// Returns `true` if this action removes a remote object.
    pub fn destroys(&self) -> bool {
        matches!(
            self,
            ActionKind::Replace { .. } | ActionKind::Delete | ActionKind::DeleteDeposed { .. }
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => f.write_str("create"),
            ActionKind::Update => f.write_str("update"),
            ActionKind::Replace {
                policy: ReplacePolicy::DestroyBeforeCreate,
            } => f.write_str("replace (destroy before create)"),
            ActionKind::Replace {
                policy: ReplacePolicy::CreateBeforeDestroy,
            } => f.write_str("replace (create before destroy)"),
            ActionKind::Delete => f.write_str("delete"),
            ActionKind::DeleteDeposed { id } => write!(f, "delete deposed {}", id),
        }
    }
}

/// One node of the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// The target instance.
    pub address: InstanceAddress,
    /// What to do.
    pub kind: ActionKind,
    /// The diff the action was derived from.
    pub diff: InstanceDiff,
    /// Changed attribute names in the order the provider receives them.
    pub change_order: Vec<String>,
    /// Attributes whose values are redacted when rendering.
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub sensitive: BTreeSet<String>,
}

/// Counts of planned changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Objects to be created, including the new half of replacements.
    pub add: usize,
    /// Objects updated in place.
    pub change: usize,
    /// Objects to be deleted, including the old half of replacements.
    pub destroy: usize,
}

/// A DAG of planned actions.
///
/// An edge `(a, b)` means action `b` may only start after action `a` has
/// succeeded. The graph is checked for cycles when it is built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionGraph {
    actions: Vec<PlannedAction>,
    edges: BTreeSet<(usize, usize)>,
    order: Vec<usize>,
}

impl ExecutionGraph {
    /// All actions, by index.
    pub fn actions(&self) -> &[PlannedAction] {
        &self.actions
    }

    /// The action at `index`.
    pub fn action(&self, index: usize) -> Option<&PlannedAction> {
        self.actions.get(index)
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Ordering edges as `(before, after)` index pairs.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges.iter().copied()
    }

    /// Indices of the actions that must finish before `index` starts.
    pub fn dependencies_of(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .iter()
            .filter(move |(_, to)| *to == index)
            .map(|(from, _)| *from)
    }

    /// Indices of the actions waiting on `index`.
    pub fn dependents_of(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .range((index, 0)..=(index, usize::MAX))
            .map(|(_, to)| *to)
    }

    /// Action indices in a valid execution order.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Find the action for an instance, ignoring deposed-object deletes.
    pub fn find(&self, address: &InstanceAddress) -> Option<&PlannedAction> {
        self.actions
            .iter()
            .find(|a| &a.address == address && !matches!(a.kind, ActionKind::DeleteDeposed { .. }))
    }

    /// Count the planned changes.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => summary.add += 1,
                ActionKind::Update => summary.change += 1,
                ActionKind::Replace { .. } => {
                    summary.add += 1;
                    summary.destroy += 1;
                },
                ActionKind::Delete | ActionKind::DeleteDeposed { .. } => summary.destroy += 1,
            }
        }
        summary
    }

    /// Render the plan as human-readable text.
    ///
    /// Sensitive values are shown as `(sensitive)`.
    pub fn render(&self) -> String {
        if self.actions.is_empty() {
            return "No changes. Infrastructure matches the configuration.\n".to_string();
        }

        let mut out = String::new();
        let summary = self.summary();
        let _ = writeln!(
            out,
            "Plan: {} to add, {} to change, {} to destroy.\n",
            summary.add, summary.change, summary.destroy
        );

        for &index in &self.order {
            let action = &self.actions[index];
            let _ = render_action(&mut out, action);
        }
        out
    }

    /// Serialize the plan as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_action(out: &mut String, action: &PlannedAction) -> fmt::Result {
    let diff = &action.diff;
    match (&action.kind, &diff.prior_id) {
        (ActionKind::DeleteDeposed { id }, _) => {
            return writeln!(out, "  - {} (deposed object {})", action.address, id);
        },
        (kind, Some(id)) => writeln!(out, "  {} {} ({})", kind.symbol(), action.address, id)?,
        (kind, None) => writeln!(out, "  {} {}", kind.symbol(), action.address)?,
    }

    let names: Vec<&String> = match action.kind {
        ActionKind::Create => diff.planned.keys().collect(),
        _ => action.change_order.iter().collect(),
    };
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    for name in names {
        let redact = action.sensitive.contains(name);
        let show = |value: &Value| {
            if redact {
                "(sensitive)".to_string()
            } else {
                value.to_string()
            }
        };
        let show_planned = |value: &PlannedValue| match value {
            PlannedValue::Known(v) => show(v),
            PlannedValue::Unknown => value.to_string(),
        };

        match (&action.kind, diff.changes.get(name)) {
            (ActionKind::Create, _) => {
                if let Some(value) = diff.planned.get(name) {
                    writeln!(out, "      {:width$} = {}", name, show_planned(value))?;
                }
            },
            (_, Some(change)) => {
                let before = change
                    .before
                    .as_ref()
                    .map(&show)
                    .unwrap_or_else(|| "null".to_string());
                let note = match change.implied {
                    ChangeKind::Replace => "  # forces replacement",
                    ChangeKind::Update => "",
                };
                writeln!(
                    out,
                    "      {:width$} = {} -> {}{}",
                    name,
                    before,
                    show_planned(&change.after),
                    note
                )?;
            },
            (_, None) => {},
        }
    }
    writeln!(out)
}

/// A plan ready to be applied.
///
/// Records the state version it was computed against; applying it after the
/// state has moved on fails with [`EngineError::StateConflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The actions to run.
    pub graph: ExecutionGraph,
    /// State lineage the plan was computed against.
    pub lineage: Uuid,
    /// State version the plan was computed against.
    pub state_version: u64,
}

impl Plan {
    /// Returns `true` if applying the plan would make no remote calls.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Render the plan as text.
    pub fn render(&self) -> String {
        self.graph.render()
    }
}

/// Diff every configured and every managed instance.
///
/// Instances are visited in dependency order so that references can be
/// resolved against the plans of the instances they point at. A value that
/// will only exist after an earlier action runs becomes
/// [`PlannedValue::Unknown`].
pub fn diff_configuration(
    registry: &SchemaRegistry,
    snapshot: &StateSnapshot,
    config: &Configuration,
) -> Result<Vec<InstanceDiff>> {
    diff_configuration_observed(registry, snapshot, &BTreeMap::new(), config)
}

/// Like [`diff_configuration`], but configured instances found in `observed`
/// are compared against those freshly read attributes instead of the
/// recorded ones.
pub fn diff_configuration_observed(
    registry: &SchemaRegistry,
    snapshot: &StateSnapshot,
    observed: &BTreeMap<InstanceAddress, AttributeMap>,
    config: &Configuration,
) -> Result<Vec<InstanceDiff>> {
    let mut graph: DiGraph<InstanceAddress, ()> = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for address in config.resources.keys() {
        nodes.insert(address.clone(), graph.add_node(address.clone()));
    }
    for (address, resource) in &config.resources {
        let to = nodes[address];
        for dep in resource.dependencies() {
            let from = nodes.get(&dep).ok_or_else(|| {
                EngineError::Config(format!("{} depends on undeclared instance {}", address, dep))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    let mut diffs: BTreeMap<InstanceAddress, InstanceDiff> = BTreeMap::new();
    for index in sorted_or_cycle(&graph)? {
        let address = &graph[index];
        let Some(resource) = config.get(address) else {
            continue;
        };
        let schema = registry.get(&address.resource_type)?;
        let desired = resource.resolve(|reference| plan_time_value(&diffs, reference))?;
        let result = diff_with_observed(
            schema,
            snapshot.get(address),
            observed.get(address),
            Some(&desired),
        )?;
        diffs.insert(address.clone(), result);
    }

    for (address, instance) in &snapshot.instances {
        if config.get(address).is_none() {
            let schema = registry.get(&address.resource_type)?;
            diffs.insert(address.clone(), diff(schema, Some(instance), None)?);
        }
    }

    Ok(diffs.into_values().collect())
}

fn plan_time_value(
    diffs: &BTreeMap<InstanceAddress, InstanceDiff>,
    reference: &Reference,
) -> Result<PlannedValue> {
    let target = diffs
        .get(&reference.address)
        .ok_or_else(|| EngineError::Config(format!("unresolved reference {}", reference)))?;
    let recreated = matches!(target.action, DiffAction::Create | DiffAction::Replace);

    if reference.attribute == ID_ATTRIBUTE {
        return Ok(match (&target.prior_id, recreated) {
            (Some(id), false) => PlannedValue::Known(Value::String(id.clone())),
            _ => PlannedValue::Unknown,
        });
    }
    Ok(target
        .planned
        .get(&reference.attribute)
        .cloned()
        .unwrap_or(PlannedValue::Known(Value::Null)))
}

/// Build the execution graph for a set of diffs.
///
/// No-op diffs are dropped. Creates, updates and replacements run after the
/// instances they depend on; deletes run before the instances they depended
/// on are destroyed.
pub fn build_plan(mut diffs: Vec<InstanceDiff>, registry: &SchemaRegistry) -> Result<ExecutionGraph> {
    diffs.sort_by(|a, b| a.address.cmp(&b.address));

    let mut actions = Vec::new();
    let mut main: BTreeMap<InstanceAddress, usize> = BTreeMap::new();
    for diff in diffs {
        let schema = registry.get(&diff.address.resource_type)?;
        let sensitive: BTreeSet<String> = schema
            .attributes
            .iter()
            .filter(|(_, attr)| attr.flags.sensitive)
            .map(|(name, _)| name.clone())
            .collect();
        let change_order = diff.ordered_names(schema);

        for id in &diff.deposed {
            actions.push(PlannedAction {
                address: diff.address.clone(),
                kind: ActionKind::DeleteDeposed { id: id.clone() },
                diff: diff.clone(),
                change_order: Vec::new(),
                sensitive: sensitive.clone(),
            });
        }

        let kind = match diff.action {
            DiffAction::Create => ActionKind::Create,
            DiffAction::Update => ActionKind::Update,
            DiffAction::Replace => ActionKind::Replace {
                policy: diff.replace_policy.unwrap_or(schema.replace_policy),
            },
            DiffAction::Delete => ActionKind::Delete,
            DiffAction::NoOp => continue,
        };
        main.insert(diff.address.clone(), actions.len());
        actions.push(PlannedAction {
            address: diff.address.clone(),
            kind,
            diff,
            change_order,
            sensitive,
        });
    }

    let mut edges = BTreeSet::new();
    for (index, action) in actions.iter().enumerate() {
        match &action.kind {
            ActionKind::Create | ActionKind::Update | ActionKind::Replace { .. } => {
                for dep in &action.diff.dependencies {
                    if let Some(&from) = main.get(dep) {
                        if actions[from].kind != ActionKind::Delete {
                            edges.insert((from, index));
                        }
                    }
                }
            },
            ActionKind::Delete => {
                for dep in &action.diff.dependencies {
                    if let Some(&to) = main.get(dep) {
                        if actions[to].kind.destroys() {
                            edges.insert((index, to));
                        }
                    }
                }
            },
            ActionKind::DeleteDeposed { .. } => {
                if let Some(&from) = main.get(&action.address) {
                    edges.insert((from, index));
                }
            },
        }
    }

    let mut graph: DiGraph<InstanceAddress, ()> = DiGraph::new();
    for action in &actions {
        graph.add_node(action.address.clone());
    }
    for &(from, to) in &edges {
        graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
    }
    let order = sorted_or_cycle(&graph)?
        .into_iter()
        .map(NodeIndex::index)
        .collect();

    Ok(ExecutionGraph {
        actions,
        edges,
        order,
    })
}

/// Topologically sort the graph, or report the instances on a cycle.
fn sorted_or_cycle(graph: &DiGraph<InstanceAddress, ()>) -> Result<Vec<NodeIndex>> {
    toposort(graph, None).map_err(|_| {
        let members: BTreeSet<InstanceAddress> = tarjan_scc(graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .flatten()
            .map(|index| graph[index].clone())
            .collect();
        EngineError::CyclicDependency(members.into_iter().collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredResource;
    use crate::schema::{Attribute, ResourceSchema};
    use crate::state::ResourceInstance;
    use crate::value::AttributeMap;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new("1.0.0")
            .with_resource(
                ResourceSchema::new("bucket")
                    .with_attribute("name", Attribute::required_string().with_force_new())
                    .with_attribute("size", Attribute::optional_int64())
                    .with_attribute("arn", Attribute::computed_string()),
            )
            .unwrap()
            .with_resource(
                ResourceSchema::new("policy")
                    .with_attribute("bucket", Attribute::required_string().with_force_new())
                    .with_attribute("document", Attribute::required_string().sensitive()),
            )
            .unwrap()
    }

    fn bucket_addr() -> InstanceAddress {
        InstanceAddress::new("bucket", "logs")
    }

    fn policy_addr() -> InstanceAddress {
        InstanceAddress::new("policy", "logs")
    }

    fn config() -> Configuration {
        Configuration::new()
            .with_resource(
                DesiredResource::new("bucket", "logs")
                    .with("name", "logs")
                    .with("size", 1),
            )
            .with_resource(
                DesiredResource::new("policy", "logs")
                    .with("bucket", Reference::id(bucket_addr()))
                    .with("document", "allow-all"),
            )
    }

    fn applied_state() -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty();
        let mut bucket = AttributeMap::new();
        bucket.insert("name".to_string(), Value::from("logs"));
        bucket.insert("size".to_string(), Value::from(1));
        bucket.insert("arn".to_string(), Value::from("arn:b-1"));
        snapshot.put(ResourceInstance::new(bucket_addr(), "b-1", bucket));

        let mut policy = AttributeMap::new();
        policy.insert("bucket".to_string(), Value::from("b-1"));
        policy.insert("document".to_string(), Value::from("allow-all"));
        snapshot.put(
            ResourceInstance::new(policy_addr(), "p-1", policy).with_dependencies([bucket_addr()]),
        );
        snapshot
    }

    fn plan(snapshot: &StateSnapshot, config: &Configuration) -> Result<ExecutionGraph> {
        let registry = registry();
        let diffs = diff_configuration(&registry, snapshot, config)?;
        build_plan(diffs, &registry)
    }

    #[test]
    fn test_unchanged_configuration_is_empty() {
        let graph = plan(&applied_state(), &config()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.render().starts_with("No changes"));
    }

    #[test]
    fn test_creates_follow_references() {
        let graph = plan(&StateSnapshot::empty(), &config()).unwrap();
        assert_eq!(graph.len(), 2);

        let bucket = graph.find(&bucket_addr()).unwrap();
        let policy = graph.find(&policy_addr()).unwrap();
        assert_eq!(bucket.kind, ActionKind::Create);
        assert_eq!(policy.diff.planned["bucket"], PlannedValue::Unknown);

        let order: Vec<&InstanceAddress> = graph
            .topological_order()
            .iter()
            .map(|&i| &graph.actions()[i].address)
            .collect();
        assert_eq!(order, vec![&bucket_addr(), &policy_addr()]);
        assert_eq!(graph.edges().count(), 1);
    }

    #[test]
    fn test_reference_to_unchanged_instance_is_known() {
        let mut state = applied_state();
        state.remove(&policy_addr());
        let graph = plan(&state, &config()).unwrap();
        assert_eq!(graph.len(), 1);
        let policy = graph.find(&policy_addr()).unwrap();
        assert_eq!(
            policy.diff.planned["bucket"],
            PlannedValue::Known(Value::from("b-1"))
        );
    }

    #[test]
    fn test_deletes_run_in_reverse_dependency_order() {
        let graph = plan(&applied_state(), &Configuration::new()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.summary().destroy, 2);

        let order: Vec<&InstanceAddress> = graph
            .topological_order()
            .iter()
            .map(|&i| &graph.actions()[i].address)
            .collect();
        assert_eq!(order, vec![&policy_addr(), &bucket_addr()]);
    }

    #[test]
    fn test_replacement_orders_dependents_after_it() {
        let config = config().with_resource(
            DesiredResource::new("bucket", "logs")
                .with("name", "logs-v2")
                .with("size", 1),
        );
        let graph = plan(&applied_state(), &config).unwrap();

        let bucket = graph.find(&bucket_addr()).unwrap();
        assert_eq!(
            bucket.kind,
            ActionKind::Replace {
                policy: ReplacePolicy::DestroyBeforeCreate
            }
        );
        // The bucket id becomes unknown, so the policy must follow
        let policy = graph.find(&policy_addr()).unwrap();
        assert_eq!(policy.diff.planned["bucket"], PlannedValue::Unknown);
        assert_eq!(graph.topological_order().len(), 2);
        assert_eq!(graph.edges().count(), 1);
    }

    #[test]
    fn test_instance_replace_policy_override() {
        let config = config().with_resource(
            DesiredResource::new("bucket", "logs")
                .with("name", "logs-v2")
                .with_replace_policy(ReplacePolicy::CreateBeforeDestroy),
        );
        let graph = plan(&applied_state(), &config).unwrap();
        let bucket = graph.find(&bucket_addr()).unwrap();
        assert_eq!(
            bucket.kind,
            ActionKind::Replace {
                policy: ReplacePolicy::CreateBeforeDestroy
            }
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let a = InstanceAddress::new("bucket", "a");
        let b = InstanceAddress::new("bucket", "b");
        let config = Configuration::new()
            .with_resource(
                DesiredResource::new("bucket", "a")
                    .with("name", "a")
                    .depends_on(b.clone()),
            )
            .with_resource(
                DesiredResource::new("bucket", "b")
                    .with("name", "b")
                    .depends_on(a.clone()),
            );
        match plan(&StateSnapshot::empty(), &config) {
            Err(EngineError::CyclicDependency(members)) => assert_eq!(members, vec![a, b]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_reference() {
        let config = Configuration::new().with_resource(
            DesiredResource::new("policy", "x")
                .with("bucket", Reference::id(InstanceAddress::new("bucket", "missing")))
                .with("document", "d"),
        );
        assert!(matches!(
            plan(&StateSnapshot::empty(), &config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_deposed_objects_are_scheduled() {
        let mut state = applied_state();
        if let Some(bucket) = state.instances.get_mut(&bucket_addr()) {
            bucket.deposed.push("b-0".to_string());
        }
        let graph = plan(&state, &config()).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph.actions()[0].kind,
            ActionKind::DeleteDeposed {
                id: "b-0".to_string()
            }
        );
        assert!(graph.render().contains("deposed object b-0"));
    }

    #[test]
    fn test_observed_drift_is_planned_as_update() {
        let state = applied_state();
        let mut drifted = state.get(&bucket_addr()).unwrap().attributes.clone();
        drifted.insert("size".to_string(), Value::from(7));
        let observed = BTreeMap::from([(bucket_addr(), drifted)]);

        let registry = registry();
        let diffs = diff_configuration_observed(&registry, &state, &observed, &config()).unwrap();
        let graph = build_plan(diffs, &registry).unwrap();
        assert_eq!(graph.len(), 1);
        let bucket = graph.find(&bucket_addr()).unwrap();
        assert_eq!(bucket.kind, ActionKind::Update);
        assert!(bucket.diff.observed.is_some());
    }

    #[test]
    fn test_render_redacts_sensitive_values() {
        let graph = plan(&StateSnapshot::empty(), &config()).unwrap();
        let text = graph.render();
        assert!(text.contains("Plan: 2 to add, 0 to change, 0 to destroy."));
        assert!(text.contains("+ bucket.logs"));
        assert!(text.contains("(sensitive)"));
        assert!(!text.contains("allow-all"));
        assert!(text.contains("(known after apply)"));
    }

    #[test]
    fn test_plan_serializes_to_json() {
        let config = config().with_resource(
            DesiredResource::new("bucket", "logs")
                .with("name", "logs")
                .with("size", 2),
        );
        let graph = plan(&applied_state(), &config).unwrap();
        let json: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(json["actions"][0]["kind"]["type"], "update");
        assert_eq!(json["actions"][0]["change_order"][0], "size");
    }
}
