//! Workflow DAG construction and validation.
//!
//! The builder turns a (requirement, persona set) pair into a frozen DAG:
//! one node per persona, edges from declared dependencies, each node
//! assigned to its persona's phase, parallel-capable siblings grouped into
//! waves by topological layering. Validation guarantees acyclicity, dependency
//! presence and phase monotonicity before anything is scheduled.

use crate::catalog::PersonaCatalog;
use crate::dag::node::Node;
use crate::errors::BuildError;
use std::collections::{BTreeSet, HashMap};

/// Index into the DAG's node arena.
pub type NodeIndex = usize;

/// Phase ids in ordinal order. Nodes and phases are stored in flat vectors
/// and referenced by index; there are no cyclic references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseLayout {
    phases: Vec<String>,
}

impl PhaseLayout {
    pub fn new(phases: Vec<String>) -> Self {
        Self { phases }
    }

    pub fn ordinal(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p == phase_id)
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// A frozen workflow DAG. Topology is immutable for the lifetime of the
/// execution; only node runtime state mutates, via indexed access.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    nodes: Vec<Node>,
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> nodes that depend on it
    forward: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> nodes it depends on
    reverse: Vec<Vec<NodeIndex>>,
    layout: PhaseLayout,
}

impl WorkflowDag {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.index_map.get(node_id).copied()
    }

    pub fn layout(&self) -> &PhaseLayout {
        &self.layout
    }

    /// Nodes that depend on `index`.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward.get(index).map_or(&[], Vec::as_slice)
    }

    /// Nodes that `index` depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse.get(index).map_or(&[], Vec::as_slice)
    }

    /// Node indices assigned to a phase, in arena order.
    pub fn phase_nodes(&self, phase_id: &str) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.phase_id == phase_id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether every dependency of `index` is terminal-good.
    pub fn deps_terminal_good(&self, index: NodeIndex) -> bool {
        self.dependencies(index)
            .iter()
            .all(|&dep| self.nodes[dep].state.is_terminal_good())
    }

    /// Transitive dependents of `roots` restricted to the same phase.
    /// Used to scope rework plans.
    pub fn transitive_dependents_within_phase(&self, roots: &[NodeIndex]) -> Vec<NodeIndex> {
        let mut seen: BTreeSet<NodeIndex> = roots.iter().copied().collect();
        let mut stack: Vec<NodeIndex> = roots.to_vec();
        while let Some(idx) = stack.pop() {
            let phase = &self.nodes[idx].phase_id;
            for &dep in self.dependents(idx) {
                if self.nodes[dep].phase_id == *phase && seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Rebuild a DAG from persisted nodes (recovery path). Re-runs the full
    /// validation; a snapshot that no longer forms a valid DAG is rejected.
    pub fn from_nodes(nodes: Vec<Node>, layout: PhaseLayout) -> Result<Self, BuildError> {
        Self::assemble(nodes, layout)
    }

    fn assemble(nodes: Vec<Node>, layout: PhaseLayout) -> Result<Self, BuildError> {
        if nodes.is_empty() {
            return Err(BuildError::EmptyWorkflow);
        }

        let mut index_map = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index_map.insert(node.node_id.clone(), i).is_some() {
                return Err(BuildError::DuplicatePersona {
                    persona: node.node_id.clone(),
                });
            }
        }

        let mut forward: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut reverse: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];

        for (to, node) in nodes.iter().enumerate() {
            let to_ordinal = layout.ordinal(&node.phase_id).ok_or_else(|| {
                BuildError::UnknownPhase {
                    persona: node.persona_id.clone(),
                    phase: node.phase_id.clone(),
                }
            })?;

            for dep in &node.dependencies {
                let from = *index_map.get(dep).ok_or_else(|| BuildError::MissingDependency {
                    persona: node.persona_id.clone(),
                    dependency: dep.clone(),
                })?;
                let dep_phase = &nodes[from].phase_id;
                let dep_ordinal =
                    layout
                        .ordinal(dep_phase)
                        .ok_or_else(|| BuildError::UnknownPhase {
                            persona: nodes[from].persona_id.clone(),
                            phase: dep_phase.clone(),
                        })?;
                // Dependencies may point at the same or an earlier phase only.
                if dep_ordinal > to_ordinal {
                    return Err(BuildError::CrossPhaseDependency {
                        persona: node.persona_id.clone(),
                        phase: node.phase_id.clone(),
                        dependency: dep.clone(),
                        dependency_phase: dep_phase.clone(),
                    });
                }
                forward[from].push(to);
                reverse[to].push(from);
            }
        }

        let mut dag = Self {
            nodes,
            index_map,
            forward,
            reverse,
            layout,
        };
        dag.validate_acyclic()?;
        dag.assign_waves();
        Ok(dag)
    }

    /// Kahn's algorithm; leftovers with in-degree > 0 name the cycle.
    fn validate_acyclic(&self) -> Result<(), BuildError> {
        let mut in_degree: Vec<usize> = self.reverse.iter().map(Vec::len).collect();
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(idx) = queue.pop() {
            processed += 1;
            for &dep in self.dependents(idx) {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    queue.push(dep);
                }
            }
        }

        if processed != self.len() {
            let personas = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.nodes[i].persona_id.clone())
                .collect();
            return Err(BuildError::WorkflowCycle { personas });
        }
        Ok(())
    }

    /// Group nodes into waves per phase.
    ///
    /// Wave index is the node's topological depth among intra-phase
    /// dependencies. Parallel-capable nodes with an identical intra-phase
    /// dependency closure share a wave; every other node gets a wave of
    /// its own.
    fn assign_waves(&mut self) {
        for phase_id in self.layout.phases().to_vec() {
            let members = self.phase_nodes(&phase_id);
            if members.is_empty() {
                continue;
            }

            let mut closures: HashMap<NodeIndex, BTreeSet<NodeIndex>> = HashMap::new();
            let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
            for &idx in &members {
                self.intra_phase_closure(idx, &phase_id, &mut closures, &mut depths);
            }

            // Stable wave numbering: by depth, then by grouping key.
            let mut keyed: Vec<(usize, String, NodeIndex)> = members
                .iter()
                .map(|&idx| {
                    let depth = depths[&idx];
                    let node = &self.nodes[idx];
                    let key = if node.parallel_capable {
                        let ids: Vec<&str> = closures[&idx]
                            .iter()
                            .map(|&d| self.nodes[d].node_id.as_str())
                            .collect();
                        format!("closure:{}", ids.join(","))
                    } else {
                        format!("solo:{}", node.node_id)
                    };
                    (depth, key, idx)
                })
                .collect();
            keyed.sort();

            let mut wave = 0usize;
            let mut last_key: Option<(usize, String)> = None;
            for (depth, key, idx) in keyed {
                let group = (depth, key);
                match &last_key {
                    Some(prev) if *prev == group => {}
                    Some(_) => {
                        wave += 1;
                        last_key = Some(group);
                    }
                    None => last_key = Some(group),
                }
                self.nodes[idx].wave = wave;
            }
        }
    }

    fn intra_phase_closure(
        &self,
        idx: NodeIndex,
        phase_id: &str,
        closures: &mut HashMap<NodeIndex, BTreeSet<NodeIndex>>,
        depths: &mut HashMap<NodeIndex, usize>,
    ) {
        if closures.contains_key(&idx) {
            return;
        }
        let mut closure = BTreeSet::new();
        let mut depth = 0;
        let in_phase: Vec<NodeIndex> = self
            .dependencies(idx)
            .iter()
            .copied()
            .filter(|&d| self.nodes[d].phase_id == phase_id)
            .collect();
        for dep in in_phase {
            self.intra_phase_closure(dep, phase_id, closures, depths);
            closure.insert(dep);
            closure.extend(closures[&dep].iter().copied());
            depth = depth.max(depths[&dep] + 1);
        }
        closures.insert(idx, closure);
        depths.insert(idx, depth);
    }
}

/// Builds a validated, frozen `WorkflowDag` from a persona set.
pub struct WorkflowBuilder<'a> {
    catalog: &'a PersonaCatalog,
    layout: PhaseLayout,
}

impl<'a> WorkflowBuilder<'a> {
    pub fn new(catalog: &'a PersonaCatalog, layout: PhaseLayout) -> Self {
        Self { catalog, layout }
    }

    /// Seed one node per persona, stitch dependency edges, validate, freeze.
    pub fn build(&self, persona_ids: &[String]) -> Result<WorkflowDag, BuildError> {
        if persona_ids.is_empty() {
            return Err(BuildError::EmptyWorkflow);
        }

        let mut nodes = Vec::with_capacity(persona_ids.len());
        for id in persona_ids {
            let spec = self.catalog.get(id).ok_or_else(|| BuildError::UnknownPersona {
                persona: id.clone(),
            })?;
            let mut node = Node::from_spec(spec);
            // Edges only for personas also in the workflow; a declared
            // dependency outside the set is a validation failure.
            for dep in &spec.dependencies {
                if !persona_ids.contains(dep) {
                    return Err(BuildError::MissingDependency {
                        persona: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                node.dependencies.push(dep.clone());
            }
            nodes.push(node);
        }

        WorkflowDag::assemble(nodes, self.layout.clone())
    }
}
