//! Declarative stage flows keyed by role and protocol.

use crate::core::{Protocol, Role, StageKind};
use crate::errors::UnsupportedFlowError;
use std::collections::HashMap;

/// The stages of one flow and who consumes whose outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    /// Stages in declaration order.
    pub stages: Vec<StageKind>,
    /// `(from, to)`: `to` consumes `from`'s outputs.
    pub edges: Vec<(StageKind, StageKind)>,
}

impl FlowEntry {
    /// Builds an entry from adjacency lists.
    ///
    /// Every stage mentioned as a key or successor is part of the flow; stages
    /// keep the order in which they first appear.
    #[must_use]
    pub fn from_adjacency(adjacency: &[(StageKind, &[StageKind])]) -> Self {
        let mut stages = Vec::new();
        let mut edges = Vec::new();

        for (from, successors) in adjacency {
            if !stages.contains(from) {
                stages.push(*from);
            }
            for to in *successors {
                if !stages.contains(to) {
                    stages.push(*to);
                }
                edges.push((*from, *to));
            }
        }

        Self { stages, edges }
    }

    /// Direct successors of a stage.
    #[must_use]
    pub fn successors(&self, stage: StageKind) -> Vec<StageKind> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == stage)
            .map(|(_, to)| *to)
            .collect()
    }
}

/// Flow entries keyed by `(role, protocol)`.
#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    entries: HashMap<(Role, Protocol), FlowEntry>,
}

impl FlowTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shard → prepare → run-PID flow for both roles and protocols.
    #[must_use]
    pub fn standard() -> Self {
        let linear = FlowEntry::from_adjacency(&[
            (StageKind::Shard, &[StageKind::Prepare]),
            (StageKind::Prepare, &[StageKind::RunPid]),
            (StageKind::RunPid, &[]),
        ]);

        let mut table = Self::new();
        for role in Role::ALL {
            for protocol in Protocol::ALL {
                table.insert(role, protocol, linear.clone());
            }
        }
        table
    }

    /// Adds or replaces a flow.
    pub fn insert(&mut self, role: Role, protocol: Protocol, entry: FlowEntry) {
        self.entries.insert((role, protocol), entry);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with_flow(mut self, role: Role, protocol: Protocol, entry: FlowEntry) -> Self {
        self.insert(role, protocol, entry);
        self
    }

    /// Looks up a flow.
    pub fn get(&self, role: Role, protocol: Protocol) -> Result<&FlowEntry, UnsupportedFlowError> {
        self.entries
            .get(&(role, protocol))
            .ok_or(UnsupportedFlowError { role, protocol })
    }
}
