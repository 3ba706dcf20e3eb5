//! Flow graph validation and adjacency using petgraph.
//!
//! A flow is published as a directed graph where:
//! - Nodes are the builder's steps, looked up by `NodeId` in O(1)
//! - Edges optionally carry a source handle selecting a branch
//!
//! The `(source, handle) -> target` table is built once at publish time, so
//! traversal never re-scans the edge list.

use crate::edge::Edge;
use crate::error::ValidationError;
use crate::node::{Node, NodeId, NodeKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// A validated flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    /// The underlying directed graph; edge weights are source handles.
    graph: DiGraph<Node, Option<usize>>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
    /// Branch resolution table.
    adjacency: HashMap<(NodeId, Option<usize>), NodeId>,
    /// The single TRIGGER node.
    trigger: NodeIndex,
}

impl FlowGraph {
    /// Builds and validates a graph from the builder's node and edge lists.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found. Checks run in this order:
    /// - Duplicate node IDs and message payload conflicts
    /// - Exactly one TRIGGER node
    /// - TRIGGER fan-out is keyword-partitioned
    /// - Edge endpoints exist, handles are allowed and in range
    /// - At most one edge per `(source, handle)`
    /// - Every node is reachable from TRIGGER
    /// - Non-CONDITION nodes form a DAG
    pub fn build(nodes: &[Node], edges: &[Edge]) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut node_index_map = HashMap::with_capacity(nodes.len());
        let mut triggers = Vec::new();

        for node in nodes {
            if node_index_map.contains_key(&node.id) {
                return Err(ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
            if let NodeKind::Message(message) = &node.kind
                && !message.buttons.is_empty()
                && message.capture.is_some()
            {
                return Err(ValidationError::ButtonsWithCapture {
                    node_id: node.id.clone(),
                });
            }
            if matches!(node.kind, NodeKind::Trigger(_)) {
                triggers.push(node.id.clone());
            }
            let index = graph.add_node(node.clone());
            node_index_map.insert(node.id.clone(), index);
        }

        let trigger = match triggers.as_slice() {
            [] => return Err(ValidationError::MissingTrigger),
            [single] => node_index_map[single],
            _ => return Err(ValidationError::MultipleTriggers { node_ids: triggers }),
        };

        let trigger_node = &graph[trigger];
        if trigger_node.kind.branch_count() == 0 {
            let edge_count = edges.iter().filter(|e| e.source == trigger_node.id).count();
            if edge_count > 1 {
                return Err(ValidationError::UnpartitionedTrigger { edge_count });
            }
        }

        let mut adjacency = HashMap::with_capacity(edges.len());
        for edge in edges {
            let source = *node_index_map.get(&edge.source).ok_or_else(|| {
                ValidationError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: edge.source.clone(),
                }
            })?;
            let target = *node_index_map.get(&edge.target).ok_or_else(|| {
                ValidationError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: edge.target.clone(),
                }
            })?;

            if let Some(handle) = edge.source_handle {
                check_handle(&graph[source], handle)?;
            }

            let branch = (edge.source.clone(), edge.source_handle);
            if adjacency.contains_key(&branch) {
                return Err(ValidationError::DuplicateBranch {
                    node_id: edge.source.clone(),
                    handle: edge.source_handle,
                });
            }
            adjacency.insert(branch, edge.target.clone());
            graph.add_edge(source, target, edge.source_handle);
        }

        let mut reachable = HashSet::with_capacity(nodes.len());
        let mut dfs = Dfs::new(&graph, trigger);
        while let Some(index) = dfs.next(&graph) {
            reachable.insert(index);
        }
        if let Some(unreachable) = graph.node_indices().find(|i| !reachable.contains(i)) {
            return Err(ValidationError::UnreachableNode {
                node_id: graph[unreachable].id.clone(),
            });
        }

        check_acyclic(&graph)?;

        Ok(Self {
            graph,
            node_index_map,
            adjacency,
            trigger,
        })
    }

    /// Returns the TRIGGER node.
    #[must_use]
    pub fn trigger(&self) -> &Node {
        &self.graph[self.trigger]
    }

    /// Returns a node by its ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Resolves the edge leaving `node_id` through `handle`.
    ///
    /// `None` selects the node's unconditioned edge.
    #[must_use]
    pub fn next(&self, node_id: &NodeId, handle: Option<usize>) -> Option<&NodeId> {
        self.adjacency.get(&(node_id.clone(), handle))
    }

    /// Returns all nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

fn check_handle(source: &Node, handle: usize) -> Result<(), ValidationError> {
    let branch_count = match &source.kind {
        NodeKind::Action(_) | NodeKind::Delay(_) => {
            return Err(ValidationError::UnexpectedHandle {
                node_id: source.id.clone(),
                kind: source.tag(),
            });
        }
        kind => kind.branch_count(),
    };
    if handle >= branch_count {
        return Err(ValidationError::HandleOutOfRange {
            node_id: source.id.clone(),
            handle,
            branch_count,
        });
    }
    Ok(())
}

/// Rejects cycles that do not pass through a CONDITION node.
///
/// CONDITION is the only revisitable kind; a loop through it is bounded at
/// runtime by the step ceiling.
fn check_acyclic(graph: &DiGraph<Node, Option<usize>>) -> Result<(), ValidationError> {
    let mut restricted: DiGraph<NodeIndex, ()> = DiGraph::new();
    let mut mapped = HashMap::new();
    for index in graph.node_indices() {
        if !matches!(graph[index].kind, NodeKind::Condition(_)) {
            mapped.insert(index, restricted.add_node(index));
        }
    }
    for edge in graph.raw_edges() {
        if let (Some(&source), Some(&target)) =
            (mapped.get(&edge.source()), mapped.get(&edge.target()))
        {
            restricted.add_edge(source, target, ());
        }
    }

    petgraph::algo::toposort(&restricted, None)
        .map(|_| ())
        .map_err(|cycle| ValidationError::CycleDetected {
            node_id: graph[restricted[cycle.node_id()]].id.clone(),
        })
}
