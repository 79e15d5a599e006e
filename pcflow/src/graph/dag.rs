//! Stage graph arena.
//!
//! Nodes live in a `Vec` addressed by stable index with explicit successor
//! lists. Completing a node clears its `active` bit instead of removing it,
//! so indices stay valid while the dispatcher walks the graph.

use super::flow::{FlowEntry, FlowTable};
use super::paths;
use crate::core::{Protocol, Role, StageKind, StageStatus};
use crate::errors::{FlowCycleError, PcflowError};
use std::collections::{BTreeMap, VecDeque};

/// One stage of an id-matching graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNode {
    /// Identity of the node within its graph.
    pub stage_kind: StageKind,
    /// Paths this stage writes.
    pub declared_output_paths: Vec<String>,
    /// Paths this stage reads; only ever appended to.
    pub input_paths: Vec<String>,
    /// Whether the stage needs the other party's containers.
    pub is_joint_stage: bool,
}

/// A DAG of stages for one orchestration attempt.
#[derive(Debug, Clone)]
pub struct StageGraph {
    role: Role,
    protocol: Protocol,
    nodes: Vec<StageNode>,
    successors: Vec<Vec<usize>>,
    active: Vec<bool>,
}

impl StageGraph {
    /// Builds the graph for `(role, protocol)` and prunes stages already completed.
    ///
    /// Fails with [`UnsupportedFlowError`](crate::errors::UnsupportedFlowError)
    /// when the table has no such flow.
    pub fn build(
        flows: &FlowTable,
        role: Role,
        protocol: Protocol,
        base_input_path: &str,
        base_output_path: &str,
        persisted_stage_status: &BTreeMap<StageKind, StageStatus>,
    ) -> Result<Self, PcflowError> {
        let entry = flows.get(role, protocol)?;
        let mut graph = Self::from_entry(entry, role, protocol, base_input_path, base_output_path)?;

        let pruned = graph.prune_completed(|stage| {
            persisted_stage_status.get(&stage) == Some(&StageStatus::Completed)
        });
        if !pruned.is_empty() {
            tracing::debug!(?pruned, "Pruned stages completed by an earlier attempt");
        }
        Ok(graph)
    }

    /// Builds a graph from a single flow entry without pruning.
    pub fn from_entry(
        entry: &FlowEntry,
        role: Role,
        protocol: Protocol,
        base_input_path: &str,
        base_output_path: &str,
    ) -> Result<Self, FlowCycleError> {
        // Source stages read the raw input; everything else is fed by
        // propagation.
        let nodes: Vec<StageNode> = entry
            .stages
            .iter()
            .map(|&stage_kind| StageNode {
                stage_kind,
                declared_output_paths: vec![paths::stage_output_path(
                    base_output_path,
                    stage_kind,
                    role,
                )],
                input_paths: if entry.edges.iter().any(|(_, to)| *to == stage_kind) {
                    Vec::new()
                } else {
                    vec![base_input_path.to_string()]
                },
                is_joint_stage: stage_kind.is_joint_stage(),
            })
            .collect();

        let index_of = |kind: StageKind| nodes.iter().position(|n| n.stage_kind == kind);
        let mut successors = vec![Vec::new(); nodes.len()];
        for (from, to) in &entry.edges {
            if let (Some(u), Some(v)) = (index_of(*from), index_of(*to)) {
                if !successors[u].contains(&v) {
                    successors[u].push(v);
                }
            }
        }

        let graph = Self {
            role,
            protocol,
            active: vec![true; nodes.len()],
            nodes,
            successors,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// The role this graph was built for.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The protocol this graph was built for.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Number of active nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// Returns true once every node completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stage the graph was built with, including completed ones.
    #[must_use]
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.nodes.iter().map(|n| n.stage_kind).collect()
    }

    /// Returns true if the stage is still active.
    #[must_use]
    pub fn contains(&self, stage: StageKind) -> bool {
        self.index_of(stage).is_some()
    }

    /// An active node.
    #[must_use]
    pub fn node(&self, stage: StageKind) -> Option<&StageNode> {
        self.index_of(stage).map(|idx| &self.nodes[idx])
    }

    /// Active nodes in build order.
    pub fn active_nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes
            .iter()
            .zip(&self.active)
            .filter(|(_, active)| **active)
            .map(|(node, _)| node)
    }

    /// Number of active predecessors.
    #[must_use]
    pub fn in_degree(&self, stage: StageKind) -> usize {
        let Some(target) = self.index_of(stage) else {
            return 0;
        };
        self.successors
            .iter()
            .enumerate()
            .filter(|(u, succ)| self.active[*u] && succ.contains(&target))
            .count()
    }

    /// Active direct successors.
    #[must_use]
    pub fn successors(&self, stage: StageKind) -> Vec<StageKind> {
        self.index_of(stage)
            .map(|u| {
                self.successors[u]
                    .iter()
                    .filter(|v| self.active[**v])
                    .map(|v| self.nodes[*v].stage_kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Edges between active nodes.
    #[must_use]
    pub fn edges(&self) -> Vec<(StageKind, StageKind)> {
        self.successors
            .iter()
            .enumerate()
            .filter(|(u, _)| self.active[*u])
            .flat_map(|(u, succ)| {
                succ.iter()
                    .filter(|v| self.active[**v])
                    .map(move |v| (self.nodes[u].stage_kind, self.nodes[*v].stage_kind))
            })
            .collect()
    }

    /// Active nodes with no active predecessor.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<&StageNode> {
        self.active_nodes()
            .filter(|n| self.in_degree(n.stage_kind) == 0)
            .collect()
    }

    /// Marks a stage completed and appends its outputs to each active successor.
    ///
    /// Returns false if the stage was not active.
    pub fn complete(&mut self, stage: StageKind) -> bool {
        let Some(u) = self.index_of(stage) else {
            return false;
        };
        self.active[u] = false;

        let outputs = self.nodes[u].declared_output_paths.clone();
        for &v in &self.successors[u] {
            if self.active[v] {
                self.nodes[v].input_paths.extend(outputs.iter().cloned());
            }
        }
        true
    }

    /// Completes, in topological order, every active stage `is_completed` accepts.
    pub fn prune_completed(&mut self, is_completed: impl Fn(StageKind) -> bool) -> Vec<StageKind> {
        let mut pruned = Vec::new();
        for stage in self.topological_order() {
            if is_completed(stage) && self.complete(stage) {
                pruned.push(stage);
            }
        }
        pruned
    }

    /// Active stages in a dependency-respecting order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<StageKind> {
        kahn_order(&self.successors, &self.active)
            .into_iter()
            .map(|idx| self.nodes[idx].stage_kind)
            .collect()
    }

    fn index_of(&self, stage: StageKind) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.stage_kind == stage)
            .filter(|idx| self.active[*idx])
    }

    fn check_acyclic(&self) -> Result<(), FlowCycleError> {
        let order = kahn_order(&self.successors, &self.active);
        if order.len() == self.len() {
            return Ok(());
        }
        let stuck = (0..self.nodes.len())
            .filter(|idx| self.active[*idx] && !order.contains(idx))
            .map(|idx| self.nodes[idx].stage_kind)
            .collect();
        Err(FlowCycleError { stages: stuck })
    }
}

/// Kahn's algorithm over active nodes, ties broken by index.
fn kahn_order(successors: &[Vec<usize>], active: &[bool]) -> Vec<usize> {
    let mut in_degree = vec![0usize; successors.len()];
    for (u, succ) in successors.iter().enumerate() {
        if active[u] {
            for &v in succ {
                if active[v] {
                    in_degree[v] += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..successors.len())
        .filter(|idx| active[*idx] && in_degree[*idx] == 0)
        .collect();
    let mut order = Vec::with_capacity(successors.len());

    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &v in &successors[u] {
            if active[v] {
                in_degree[v] -= 1;
                if in_degree[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
    }
    order
}
