//! Dependency graph construction from resource declarations.
//!
//! References and explicit `depends_on` entries become edges in a directed
//! graph with one node per declared resource. Building validates the
//! declarations as a whole: every reference must land on a declared
//! resource, and the edges must form a DAG. The resulting orders drive the
//! planner: apply walks dependencies first, destroy walks dependents first.

use crate::config::{ResourceDecl, ResourceId};
use crate::error::{GraphError, Result, TrellisError};
use petgraph::Direction;
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use tracing::debug;

use super::reference::Reference;

/// Dependency graph over declared resources.
///
/// Edges run dependency → dependent: an edge A → B means B references A,
/// so A must be applied before B and deleted after it.
#[derive(Debug)]
pub struct DependencyGraph {
    /// The underlying arena-indexed graph, node weights are identities.
    graph: DiGraph<ResourceId, ()>,
    /// Identity → node index lookup.
    indices: HashMap<ResourceId, NodeIndex>,
    /// Topological order, dependencies first.
    order: Vec<ResourceId>,
}

impl DependencyGraph {
    /// Builds the dependency graph for a set of declarations.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnresolvedReference`] if a reference or
    /// `depends_on` entry names an undeclared resource,
    /// [`GraphError::InvalidReference`] if a marker is malformed, and
    /// [`GraphError::Cycle`] if the edges do not form a DAG.
    pub fn build(resources: &[ResourceDecl]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::with_capacity(resources.len());

        for resource in resources {
            let id = resource.id();
            let index = graph.add_node(id.clone());
            indices.insert(id, index);
        }

        for resource in resources {
            let from_id = resource.id();
            let Some(&from_index) = indices.get(&from_id) else {
                return Err(TrellisError::internal(format!(
                    "declaration {from_id} missing from its own graph"
                )));
            };

            // Implicit dependencies from reference markers
            for value in resource.attributes.values() {
                let refs = Reference::scan_value(value).map_err(|e| {
                    TrellisError::Graph(GraphError::InvalidReference {
                        from: from_id.to_string(),
                        marker: e.marker,
                        reason: e.reason,
                    })
                })?;

                for reference in refs {
                    Self::add_dependency(
                        &mut graph,
                        &indices,
                        &from_id,
                        from_index,
                        &reference.target,
                        &reference.to_string(),
                    )?;
                }
            }

            // Explicit dependencies
            for dep in &resource.depends_on {
                let target = ResourceId::parse(dep).map_err(|reason| {
                    TrellisError::Graph(GraphError::InvalidReference {
                        from: from_id.to_string(),
                        marker: dep.clone(),
                        reason,
                    })
                })?;
                Self::add_dependency(&mut graph, &indices, &from_id, from_index, &target, dep)?;
            }
        }

        // Any strongly connected component larger than one node is a cycle.
        for scc in kosaraju_scc(&graph) {
            if scc.len() > 1 {
                return Err(TrellisError::Graph(GraphError::Cycle {
                    cycle: render_cycle(&graph, &scc),
                }));
            }
        }

        let order = match toposort(&graph, None) {
            Ok(sorted) => sorted
                .into_iter()
                .map(|index| graph[index].clone())
                .collect(),
            Err(cycle) => {
                // Self-loops are rejected at edge insertion and larger
                // cycles by the SCC pass, so this is unreachable in
                // practice; report it properly rather than panic.
                return Err(TrellisError::Graph(GraphError::Cycle {
                    cycle: graph[cycle.node_id()].to_string(),
                }));
            }
        };

        debug!(
            "Built dependency graph: {} resources, {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self {
            graph,
            indices,
            order,
        })
    }

    /// Adds one dependency edge, validating the target exists and is not
    /// the declaring resource itself.
    fn add_dependency(
        graph: &mut DiGraph<ResourceId, ()>,
        indices: &HashMap<ResourceId, NodeIndex>,
        from_id: &ResourceId,
        from_index: NodeIndex,
        target: &ResourceId,
        rendered: &str,
    ) -> Result<()> {
        let Some(&target_index) = indices.get(target) else {
            return Err(TrellisError::Graph(GraphError::UnresolvedReference {
                from: from_id.to_string(),
                reference: rendered.to_string(),
            }));
        };

        if target_index == from_index {
            return Err(TrellisError::Graph(GraphError::Cycle {
                cycle: format!("{from_id} -> {from_id}"),
            }));
        }

        // update_edge keeps repeated references to the same target as one edge
        graph.update_edge(target_index, from_index, ());
        Ok(())
    }

    /// Number of resources in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns true if the identity is declared in this graph.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.indices.contains_key(id)
    }

    /// Topological order for creates and updates: dependencies first.
    #[must_use]
    pub fn apply_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Reverse topological order for deletes: dependents first.
    #[must_use]
    pub fn destroy_order(&self) -> Vec<ResourceId> {
        self.order.iter().rev().cloned().collect()
    }

    /// Direct dependencies of a resource (what it references).
    #[must_use]
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a resource (what references it).
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// All dependency edges as (dependency, dependent) pairs, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(ResourceId, ResourceId)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect();
        edges.sort();
        edges
    }

    fn neighbors(&self, id: &ResourceId, direction: Direction) -> Vec<ResourceId> {
        let Some(&index) = self.indices.get(id) else {
            return Vec::new();
        };

        let mut neighbors: Vec<_> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        neighbors.sort();
        neighbors
    }
}

/// Renders a cycle path by walking edges inside one strongly connected
/// component until the walk closes.
fn render_cycle(graph: &DiGraph<ResourceId, ()>, scc: &[NodeIndex]) -> String {
    let members: std::collections::HashSet<_> = scc.iter().copied().collect();
    let start = scc[0];
    let mut path = vec![start];
    let mut current = start;

    loop {
        let next = graph
            .neighbors_directed(current, Direction::Outgoing)
            .find(|n| members.contains(n));
        match next {
            Some(n) if n == start || path.contains(&n) => break,
            Some(n) => {
                path.push(n);
                current = n;
            }
            None => break,
        }
    }

    let mut rendered: Vec<String> = path.iter().map(|n| graph[*n].to_string()).collect();
    rendered.push(graph[start].to_string());
    rendered.join(" -> ")
}
