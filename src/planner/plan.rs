//! Execution plan types and construction.
//!
//! A plan is an ordered list of operations with explicit dependencies
//! between them. Creates and updates are emitted in dependency order from
//! the declaration graph. Deletes run against resources that no longer
//! have a declaration, so their ordering comes from the dependency edges
//! remembered on the state records at the time they were applied.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::{AttrMap, Manifest, ResourceId};
use crate::graph::DependencyGraph;
use crate::state::EngineState;

use super::diff::{DiffResult, DiffType};

/// A complete execution plan.
#[derive(Debug)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Manifest hash this plan is based on.
    pub manifest_hash: String,
    /// Planned operations with dependency indices.
    pub ops: Vec<PlannedOp>,
    /// Resources that need no operation.
    pub unchanged: Vec<ResourceId>,
}

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct PlannedOp {
    /// Operation type.
    pub kind: OpKind,
    /// Resource identity.
    pub id: ResourceId,
    /// Declared attributes, still carrying `${…}` markers. Empty for deletes.
    pub attributes: AttrMap,
    /// Resource identities this resource depends on, recorded into state.
    pub depends_on: Vec<ResourceId>,
    /// Reason for this operation.
    pub reason: String,
    /// Declaration hash to store on success (creates and updates).
    pub new_hash: Option<String>,
    /// Indices of operations that must complete first.
    pub dependencies: Vec<usize>,
}

/// Types of operations in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

impl Plan {
    /// Creates a plan from a diff result.
    ///
    /// Creates and updates are ordered by the declaration graph; each op
    /// depends on the ops of its direct dependencies (dependencies without
    /// an op of their own are already converged and impose no ordering).
    /// Deletes depend on the deletes of their remembered dependents, and on
    /// the update of any surviving resource that still depended on them.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        manifest: &Manifest,
        graph: &DependencyGraph,
        state: Option<&EngineState>,
        manifest_hash: &str,
    ) -> Self {
        let mut ops: Vec<PlannedOp> = Vec::new();
        let mut op_index: HashMap<ResourceId, usize> = HashMap::new();

        let diff_by_id: HashMap<&ResourceId, DiffType> =
            diff.diffs.iter().map(|d| (&d.id, d.diff_type)).collect();
        let hash_by_id: HashMap<&ResourceId, Option<&String>> = diff
            .diffs
            .iter()
            .map(|d| (&d.id, d.new_hash.as_ref()))
            .collect();

        // Creates and updates, in dependency order
        for id in graph.apply_order() {
            let (kind, reason) = match diff_by_id.get(id) {
                Some(DiffType::Create) => (OpKind::Create, "not yet in state"),
                Some(DiffType::Update) => (OpKind::Update, "declaration changed"),
                _ => continue,
            };

            let Some(decl) = manifest.find(id) else {
                continue;
            };

            let depends_on = graph.dependencies_of(id);
            let dependencies = depends_on
                .iter()
                .filter_map(|dep| op_index.get(dep).copied())
                .collect();

            let idx = ops.len();
            ops.push(PlannedOp {
                kind,
                id: id.clone(),
                attributes: decl.attributes.clone(),
                depends_on,
                reason: String::from(reason),
                new_hash: hash_by_id.get(id).copied().flatten().cloned(),
                dependencies,
            });
            op_index.insert(id.clone(), idx);
        }

        // Deletes, in state order; dependency indices are filled afterwards
        // because a delete can wait on another delete emitted later
        let mut delete_index: HashMap<ResourceId, usize> = HashMap::new();
        for d in &diff.diffs {
            if d.diff_type != DiffType::Delete {
                continue;
            }

            let depends_on = state
                .and_then(|s| s.get_record(&d.id))
                .map(|r| r.depends_on.clone())
                .unwrap_or_default();

            let idx = ops.len();
            ops.push(PlannedOp {
                kind: OpKind::Delete,
                id: d.id.clone(),
                attributes: AttrMap::new(),
                depends_on,
                reason: String::from("removed from manifest"),
                new_hash: None,
                dependencies: vec![],
            });
            delete_index.insert(d.id.clone(), idx);
        }

        if let Some(state) = state {
            Self::link_deletes(&mut ops, state, &delete_index, &op_index);
        }

        let mut unchanged: Vec<ResourceId> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::NoChange)
            .map(|d| d.id.clone())
            .collect();
        unchanged.sort();

        Self {
            created_at: Utc::now(),
            manifest_hash: manifest_hash.to_string(),
            ops,
            unchanged,
        }
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(manifest_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            manifest_hash: manifest_hash.to_string(),
            ops: vec![],
            unchanged: vec![],
        }
    }

    /// Creates a plan that deletes every recorded resource.
    ///
    /// Ordering comes entirely from the remembered dependency edges:
    /// dependents are deleted before the resources they depended on.
    #[must_use]
    pub fn destroy_from_state(state: &EngineState, manifest_hash: &str) -> Self {
        let mut ops: Vec<PlannedOp> = Vec::new();
        let mut delete_index: HashMap<ResourceId, usize> = HashMap::new();

        for record in state.records.values() {
            let idx = ops.len();
            ops.push(PlannedOp {
                kind: OpKind::Delete,
                id: record.id.clone(),
                attributes: AttrMap::new(),
                depends_on: record.depends_on.clone(),
                reason: String::from("destroying topology"),
                new_hash: None,
                dependencies: vec![],
            });
            delete_index.insert(record.id.clone(), idx);
        }

        Self::link_deletes(&mut ops, state, &delete_index, &HashMap::new());

        Self {
            created_at: Utc::now(),
            manifest_hash: manifest_hash.to_string(),
            ops,
            unchanged: vec![],
        }
    }

    /// Fills dependency indices for delete operations.
    ///
    /// For every remembered edge `B depends on A` where A is being deleted,
    /// the delete of A waits for whatever happens to B first: B's own
    /// delete, or B's update if B survives with a changed declaration.
    fn link_deletes(
        ops: &mut [PlannedOp],
        state: &EngineState,
        delete_index: &HashMap<ResourceId, usize>,
        op_index: &HashMap<ResourceId, usize>,
    ) {
        for record in state.records.values() {
            for dep in &record.depends_on {
                let Some(&a_idx) = delete_index.get(dep) else {
                    continue;
                };

                let b_idx = delete_index
                    .get(&record.id)
                    .or_else(|| op_index.get(&record.id))
                    .copied();

                if let Some(b_idx) = b_idx
                    && b_idx != a_idx
                    && !ops[a_idx].dependencies.contains(&b_idx)
                {
                    ops[a_idx].dependencies.push(b_idx);
                }
            }
        }
    }

    /// Returns true if the plan has no operations.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub const fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Returns the number of create operations.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.ops.iter().filter(|o| o.kind == OpKind::Create).count()
    }

    /// Returns the number of update operations.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.ops.iter().filter(|o| o.kind == OpKind::Update).count()
    }

    /// Returns the number of delete operations.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.ops.iter().filter(|o| o.kind == OpKind::Delete).count()
    }

    /// Returns operations that can be dispatched immediately.
    #[must_use]
    pub fn ready_ops(&self) -> Vec<&PlannedOp> {
        self.ops.iter().filter(|o| o.dependencies.is_empty()).collect()
    }

    /// Gets operations that depend on a specific op index.
    #[must_use]
    pub fn dependent_ops(&self, op_idx: usize) -> Vec<(usize, &PlannedOp)> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, o)| o.dependencies.contains(&op_idx))
            .collect()
    }
}

impl PlannedOp {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OpKind::Create => format!("Create {}", self.id),
            OpKind::Update => format!("Update {}", self.id),
            OpKind::Delete => format!("Delete {}", self.id),
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ops.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution plan ({} operations):", self.ops.len())?;
        for (i, op) in self.ops.iter().enumerate() {
            writeln!(f, "  {i}. {op}")?;
        }

        if !self.unchanged.is_empty() {
            writeln!(f, "{} resources unchanged", self.unchanged.len())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeclHasher, ProjectConfig, ProviderConfig, ResourceDecl, RunConfig, StateConfig};
    use crate::planner::diff::DiffEngine;
    use crate::state::ResourceRecord;
    use serde_json::json;

    fn decl(kind: &str, name: &str, attrs: &[(&str, serde_json::Value)]) -> ResourceDecl {
        ResourceDecl {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            depends_on: vec![],
        }
    }

    fn manifest(resources: Vec<ResourceDecl>) -> Manifest {
        Manifest {
            project: ProjectConfig {
                name: String::from("demo"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            run: RunConfig::default(),
            resources,
        }
    }

    fn three_tier() -> Manifest {
        manifest(vec![
            decl("vm", "web-0", &[("segment", json!("${segment.app.id}"))]),
            decl("gateway", "edge", &[("cidr", json!("10.0.0.0/16"))]),
            decl(
                "segment",
                "app",
                &[("gateway", json!("${gateway.edge.id}")), ("vlan", json!(100))],
            ),
        ])
    }

    fn plan_for(manifest: &Manifest, state: Option<&EngineState>) -> Plan {
        let graph = DependencyGraph::build(&manifest.resources).expect("graph build failed");
        let diff = DiffEngine::new().compute_diff(manifest, state);
        Plan::from_diff(&diff, manifest, &graph, state, "hash")
    }

    fn op_position(plan: &Plan, kind: OpKind, id: &ResourceId) -> usize {
        plan.ops
            .iter()
            .position(|o| o.kind == kind && o.id == *id)
            .unwrap_or_else(|| panic!("no {kind} op for {id}"))
    }

    #[test]
    fn test_three_tier_creates_in_dependency_order() {
        let manifest = three_tier();
        let plan = plan_for(&manifest, None);

        assert_eq!(plan.op_count(), 3);
        assert_eq!(plan.create_count(), 3);

        let gateway = op_position(&plan, OpKind::Create, &ResourceId::new("gateway", "edge"));
        let segment = op_position(&plan, OpKind::Create, &ResourceId::new("segment", "app"));
        let vm = op_position(&plan, OpKind::Create, &ResourceId::new("vm", "web-0"));

        assert!(gateway < segment);
        assert!(segment < vm);

        assert!(plan.ops[gateway].dependencies.is_empty());
        assert_eq!(plan.ops[segment].dependencies, vec![gateway]);
        assert_eq!(plan.ops[vm].dependencies, vec![segment]);
    }

    #[test]
    fn test_converged_state_yields_empty_plan() {
        let manifest = three_tier();
        let hasher = DeclHasher::new();

        let mut state = EngineState::new("demo", "dev");
        for decl in &manifest.resources {
            state.set_record(ResourceRecord::new(
                decl.id(),
                decl.attributes.clone(),
                &hasher.hash_decl(decl),
            ));
        }

        let plan = plan_for(&manifest, Some(&state));

        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 3);
    }

    #[test]
    fn test_update_depends_on_updated_dependency() {
        let manifest = three_tier();
        let hasher = DeclHasher::new();

        // State remembers different declarations for gateway and segment
        let mut state = EngineState::new("demo", "dev");
        for decl in &manifest.resources {
            let mut stale = decl.clone();
            if decl.kind != "vm" {
                stale
                    .attributes
                    .insert(String::from("mtu"), json!(1500));
            }
            state.set_record(ResourceRecord::new(
                decl.id(),
                stale.attributes.clone(),
                &hasher.hash_decl(&stale),
            ));
        }

        let plan = plan_for(&manifest, Some(&state));

        assert_eq!(plan.update_count(), 2);
        assert_eq!(plan.op_count(), 2);

        let gateway = op_position(&plan, OpKind::Update, &ResourceId::new("gateway", "edge"));
        let segment = op_position(&plan, OpKind::Update, &ResourceId::new("segment", "app"));
        assert_eq!(plan.ops[segment].dependencies, vec![gateway]);
        assert_eq!(plan.unchanged, vec![ResourceId::new("vm", "web-0")]);
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let gateway_id = ResourceId::new("gateway", "edge");
        let segment_id = ResourceId::new("segment", "app");
        let vm_id = ResourceId::new("vm", "web-0");

        let mut state = EngineState::new("demo", "dev");
        state.set_record(ResourceRecord::new(gateway_id.clone(), AttrMap::new(), "h1"));
        state.set_record(
            ResourceRecord::new(segment_id.clone(), AttrMap::new(), "h2")
                .with_depends_on(vec![gateway_id.clone()]),
        );
        state.set_record(
            ResourceRecord::new(vm_id.clone(), AttrMap::new(), "h3")
                .with_depends_on(vec![segment_id.clone()]),
        );

        let plan = plan_for(&manifest(vec![]), Some(&state));

        assert_eq!(plan.delete_count(), 3);

        let gateway = op_position(&plan, OpKind::Delete, &gateway_id);
        let segment = op_position(&plan, OpKind::Delete, &segment_id);
        let vm = op_position(&plan, OpKind::Delete, &vm_id);

        assert_eq!(plan.ops[gateway].dependencies, vec![segment]);
        assert_eq!(plan.ops[segment].dependencies, vec![vm]);
        assert!(plan.ops[vm].dependencies.is_empty());
    }

    #[test]
    fn test_delete_waits_for_surviving_update() {
        let gateway_id = ResourceId::new("gateway", "edge");
        let vm_id = ResourceId::new("vm", "web-0");

        // vm used to reference the gateway; the new declaration does not
        let mut state = EngineState::new("demo", "dev");
        state.set_record(ResourceRecord::new(gateway_id.clone(), AttrMap::new(), "h1"));
        state.set_record(
            ResourceRecord::new(vm_id.clone(), AttrMap::new(), "h2")
                .with_depends_on(vec![gateway_id.clone()]),
        );

        let manifest = manifest(vec![decl("vm", "web-0", &[("flavor", json!("small"))])]);
        let plan = plan_for(&manifest, Some(&state));

        assert_eq!(plan.update_count(), 1);
        assert_eq!(plan.delete_count(), 1);

        let vm = op_position(&plan, OpKind::Update, &vm_id);
        let gateway = op_position(&plan, OpKind::Delete, &gateway_id);
        assert_eq!(plan.ops[gateway].dependencies, vec![vm]);
    }

    #[test]
    fn test_destroy_orders_by_remembered_edges() {
        let gateway_id = ResourceId::new("gateway", "edge");
        let segment_id = ResourceId::new("segment", "app");

        let mut state = EngineState::new("demo", "dev");
        state.set_record(ResourceRecord::new(gateway_id.clone(), AttrMap::new(), "h1"));
        state.set_record(
            ResourceRecord::new(segment_id.clone(), AttrMap::new(), "h2")
                .with_depends_on(vec![gateway_id.clone()]),
        );

        let plan = Plan::destroy_from_state(&state, "hash");

        assert_eq!(plan.delete_count(), 2);
        let gateway = op_position(&plan, OpKind::Delete, &gateway_id);
        let segment = op_position(&plan, OpKind::Delete, &segment_id);
        assert_eq!(plan.ops[gateway].dependencies, vec![segment]);

        let ready = plan.ready_ops();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, segment_id);
    }
}
