//! Priority propagation over a scratch subtree
//!
//! `PriorityGraph` is a point-in-time copy of one subtree. Energy injected at
//! a node flows down to its children split by edge weight, and
//! `choose_action` repeatedly retires the most urgent leaf, folding its
//! value back into its parent.

use crate::error::{MemoryError, Result};
use crate::storage_backend::RecordStore;
use crate::types::RecordId;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Per-node scalar read and written by the graph operations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAttribute {
    Energy,
    /// Caller-defined score, 0 until set
    Custom(String),
}

#[derive(Debug, Clone)]
struct PriorityNode {
    id: RecordId,
    energy: f64,
    custom: HashMap<String, f64>,
}

impl PriorityNode {
    fn new(id: RecordId) -> Self {
        Self {
            id,
            energy: 0.0,
            custom: HashMap::new(),
        }
    }

    fn get(&self, attribute: &NodeAttribute) -> f64 {
        match attribute {
            NodeAttribute::Energy => self.energy,
            NodeAttribute::Custom(name) => self.custom.get(name).copied().unwrap_or(0.0),
        }
    }

    fn slot(&mut self, attribute: &NodeAttribute) -> &mut f64 {
        match attribute {
            NodeAttribute::Energy => &mut self.energy,
            NodeAttribute::Custom(name) => self.custom.entry(name.clone()).or_insert(0.0),
        }
    }
}

/// Leaf retired by `choose_action`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChosenAction {
    pub id: RecordId,
    /// Attribute value folded into the parent
    pub value: f64,
    pub parent: RecordId,
}

#[derive(Debug, Clone, Default)]
pub struct PriorityGraph {
    graph: StableDiGraph<PriorityNode, f64>,
    nodes: HashMap<RecordId, NodeIndex>,
    root: Option<RecordId>,
}

impl PriorityGraph {
    /// Empty, unbuilt graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the subtree under `root_id`, one edge of weight 1 per
    /// parent/child pair. Records saved afterwards are not seen.
    pub async fn build<S>(store: &S, root_id: RecordId) -> Result<Self>
    where
        S: RecordStore + ?Sized,
    {
        let ids = store.get_descendant_ids(root_id).await?;
        if ids.is_empty() {
            return Err(MemoryError::NotFound(format!(
                "record {root_id} in {} store",
                store.scope()
            )));
        }

        let members: HashSet<RecordId> = ids.iter().copied().collect();
        let records = store.load_many(&ids).await?;
        let edges: Vec<(RecordId, RecordId)> = records
            .iter()
            .filter(|r| r.id != root_id && members.contains(&r.parent_id))
            .map(|r| (r.parent_id, r.id))
            .collect();

        let graph = Self::from_edges(root_id, &edges);
        tracing::debug!(root_id, nodes = graph.node_count(), edges = edges.len(), "Built priority graph");
        Ok(graph)
    }

    /// Graph over explicit parent -> child pairs, all with weight 1
    pub fn from_edges(root_id: RecordId, edges: &[(RecordId, RecordId)]) -> Self {
        let mut graph = Self {
            root: Some(root_id),
            ..Self::default()
        };
        graph.ensure_node(root_id);
        for &(parent, child) in edges {
            let from = graph.ensure_node(parent);
            let to = graph.ensure_node(child);
            if graph.graph.find_edge(from, to).is_none() {
                graph.graph.add_edge(from, to, 1.0);
            }
        }
        graph
    }

    fn ensure_node(&mut self, id: RecordId) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(PriorityNode::new(id));
        self.nodes.insert(id, idx);
        idx
    }

    fn index_of(&self, id: RecordId) -> Result<NodeIndex> {
        if self.root.is_none() {
            return Err(MemoryError::GraphNotBuilt);
        }
        self.nodes
            .get(&id)
            .copied()
            .ok_or_else(|| MemoryError::NotFound(format!("node {id} in priority graph")))
    }

    pub fn is_built(&self) -> bool {
        self.root.is_some()
    }

    /// Root the graph was built from
    pub fn root(&self) -> Option<RecordId> {
        self.root
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Remaining children of `id`, ascending
    pub fn children(&self, id: RecordId) -> Result<Vec<RecordId>> {
        let idx = self.index_of(id)?;
        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    pub fn energy(&self, id: RecordId) -> Option<f64> {
        self.attribute(id, &NodeAttribute::Energy)
    }

    pub fn attribute(&self, id: RecordId, attribute: &NodeAttribute) -> Option<f64> {
        self.nodes.get(&id).map(|&idx| self.graph[idx].get(attribute))
    }

    pub fn set_attribute(&mut self, id: RecordId, attribute: &NodeAttribute, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(MemoryError::Validation(format!(
                "attribute value must be finite, got {value}"
            )));
        }
        let idx = self.index_of(id)?;
        *self.graph[idx].slot(attribute) = value;
        Ok(())
    }

    /// Override the weight of one parent -> child edge
    pub fn set_edge_weight(&mut self, parent: RecordId, child: RecordId, weight: f64) -> Result<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(MemoryError::Validation(format!(
                "edge weight must be finite and >= 0, got {weight}"
            )));
        }
        let from = self.index_of(parent)?;
        let to = self.index_of(child)?;
        let edge = self
            .graph
            .find_edge(from, to)
            .ok_or_else(|| MemoryError::NotFound(format!("edge {parent} -> {child}")))?;
        self.graph[edge] = weight;
        Ok(())
    }

    /// Zero every node's energy, then push `initial_energy` down from `source_id`
    pub fn distribute_energy(&mut self, source_id: RecordId, initial_energy: f64) -> Result<()> {
        let source = self.index_of(source_id)?;
        check_finite(initial_energy)?;

        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for idx in indices {
            self.graph[idx].energy = 0.0;
        }

        self.spread(source, initial_energy);
        tracing::debug!(source_id, initial_energy, "Distributed energy");
        Ok(())
    }

    /// Like `distribute_energy` without the reset: `amount` is added on top
    /// of whatever energy the nodes already hold.
    pub fn propagate_energy(&mut self, source_id: RecordId, amount: f64) -> Result<()> {
        let source = self.index_of(source_id)?;
        check_finite(amount)?;
        self.spread(source, amount);
        Ok(())
    }

    // Breadth-first from `source`. Each node passes on what it received this
    // pass, split by edge weight; nodes are visited once.
    fn spread(&mut self, source: NodeIndex, amount: f64) {
        let mut received: HashMap<NodeIndex, f64> = HashMap::from([(source, amount)]);
        let mut queue = VecDeque::from([source]);
        let mut visited = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }

            let share = received.remove(&current).unwrap_or(0.0);
            self.graph[current].energy += share;

            let children: Vec<(NodeIndex, f64)> = self
                .graph
                .edges_directed(current, Direction::Outgoing)
                .map(|e| (e.target(), *e.weight()))
                .collect();
            let total: f64 = children.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                continue;
            }

            for (child, weight) in children {
                if visited.contains(&child) {
                    continue;
                }
                *received.entry(child).or_insert(0.0) += share * weight / total;
                queue.push_back(child);
            }
        }
    }

    // Non-root nodes touching exactly one edge, and that edge leads in from
    // a parent.
    fn candidates(&self, attribute: &NodeAttribute, root_id: RecordId) -> Vec<(RecordId, f64, NodeIndex)> {
        let mut candidates: Vec<_> = self
            .graph
            .node_indices()
            .filter_map(|idx| {
                let node = &self.graph[idx];
                if node.id == root_id {
                    return None;
                }
                let incoming = self.graph.edges_directed(idx, Direction::Incoming).count();
                let outgoing = self.graph.edges_directed(idx, Direction::Outgoing).count();
                if incoming == 1 && outgoing == 0 {
                    let parent = self.graph.neighbors_directed(idx, Direction::Incoming).next()?;
                    Some((node.id, node.get(attribute), parent))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Leaves eligible for `choose_action`, highest `attribute` first
    pub fn ranked_leaves(&self, attribute: &NodeAttribute, root_id: RecordId) -> Result<Vec<(RecordId, f64)>> {
        self.index_of(root_id)?;
        Ok(self
            .candidates(attribute, root_id)
            .into_iter()
            .map(|(id, value, _)| (id, value))
            .collect())
    }

    /// Retire the leaf with the highest `attribute` (smallest id on ties):
    /// its value is added to its parent's and the leaf leaves the graph.
    pub fn choose_action(&mut self, attribute: &NodeAttribute, root_id: RecordId) -> Result<ChosenAction> {
        self.index_of(root_id)?;

        let (id, value, parent) = self
            .candidates(attribute, root_id)
            .into_iter()
            .next()
            .ok_or(MemoryError::NoCandidateLeaves)?;

        *self.graph[parent].slot(attribute) += value;
        let parent_id = self.graph[parent].id;

        if let Some(&idx) = self.nodes.get(&id) {
            self.graph.remove_node(idx);
        }
        self.nodes.remove(&id);

        tracing::debug!(id, parent_id, value, "Chose action");
        Ok(ChosenAction {
            id,
            value,
            parent: parent_id,
        })
    }
}

fn check_finite(energy: f64) -> Result<()> {
    if !energy.is_finite() {
        return Err(MemoryError::Validation(format!(
            "energy must be finite, got {energy}"
        )));
    }
    Ok(())
}
