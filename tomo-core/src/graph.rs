//! The task graph: a DAG of nodes with typed ports and bounded edges.

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::task::Task;

/// Default FIFO capacity for an edge when none is given explicitly.
pub const DEFAULT_EDGE_CAPACITY: usize = 2;

/// Opaque handle to a node; stable for the lifetime of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(NodeIndex);

struct Node {
    task: Option<Box<dyn Task>>,
}

/// An edge's static metadata: which input port it feeds and its FIFO depth.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSpec {
    pub dst_port: usize,
    pub capacity: usize,
}

/// Directed, acyclic, connected graph of tasks. Cycle-forming edges are
/// rejected at `connect` time, matching the graph's DAG invariant.
pub struct TaskGraph {
    graph: DiGraph<Node, EdgeSpec>,
}

impl TaskGraph {
    pub fn new() -> Self {
        TaskGraph { graph: DiGraph::new() }
    }

    pub fn add_node(&mut self, task: Box<dyn Task>) -> NodeId {
        NodeId(self.graph.add_node(Node { task: Some(task) }))
    }

    pub fn task(&self, id: NodeId) -> &dyn Task {
        self.graph[id.0]
            .task
            .as_deref()
            .expect("task() called on a node whose task was already extracted for a run")
    }

    pub fn task_mut(&mut self, id: NodeId) -> &mut dyn Task {
        self.graph[id.0]
            .task
            .as_deref_mut()
            .expect("task_mut() called on a node whose task was already extracted for a run")
    }

    /// Takes ownership of a node's task so it can move onto its own executor
    /// thread. Leaves the node structurally intact but un-queryable via
    /// `task`/`task_mut` afterwards.
    pub fn extract_task(&mut self, id: NodeId) -> Box<dyn Task> {
        self.graph[id.0]
            .task
            .take()
            .expect("extract_task() called twice for the same node")
    }

    /// Connects `src -> dst` on `dst`'s input port `dst_port`, rejecting the
    /// edge if it would create a cycle.
    pub fn connect(&mut self, src: NodeId, dst: NodeId, dst_port: usize) -> Result<()> {
        self.connect_with_capacity(src, dst, dst_port, DEFAULT_EDGE_CAPACITY)
    }

    pub fn connect_with_capacity(
        &mut self,
        src: NodeId,
        dst: NodeId,
        dst_port: usize,
        capacity: usize,
    ) -> Result<()> {
        if petgraph::algo::has_path_connecting(&self.graph, dst.0, src.0, None) || src == dst {
            return Err(Error::GraphInvalid(format!(
                "connecting {:?} -> {:?} would create a cycle",
                src, dst
            )));
        }
        self.graph.add_edge(src.0, dst.0, EdgeSpec { dst_port, capacity });
        Ok(())
    }

    pub fn disconnect(&mut self, src: NodeId, dst: NodeId) -> Result<()> {
        let edge = self
            .graph
            .find_edge(src.0, dst.0)
            .ok_or_else(|| Error::GraphInvalid(format!("no edge {:?} -> {:?}", src, dst)))?;
        self.graph.remove_edge(edge);
        Ok(())
    }

    /// Removes a node and its incident edges.
    ///
    /// Backed by `petgraph`'s swap-remove, which reassigns the removed
    /// slot's index to whichever node previously held the last index — any
    /// `NodeId` obtained before this call other than `id` itself must be
    /// treated as stale afterwards. Safe to call as long as the caller
    /// re-derives node ids (via `roots`/`successors`/etc.) after each removal
    /// rather than reusing ones collected earlier.
    pub fn remove_node(&mut self, id: NodeId) {
        self.graph.remove_node(id.0);
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.edges_directed(n, Direction::Incoming).next().is_none())
            .map(NodeId)
            .collect()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.edges_directed(n, Direction::Outgoing).next().is_none())
            .map(NodeId)
            .collect()
    }

    /// Outgoing edges as `(dst, dst_port, capacity)`, in port order.
    pub fn successors(&self, node: NodeId) -> Vec<(NodeId, EdgeSpec)> {
        self.graph
            .edges_directed(node.0, Direction::Outgoing)
            .map(|e| (NodeId(e.target()), *e.weight()))
            .collect()
    }

    pub fn predecessors(&self, node: NodeId) -> Vec<NodeId> {
        self.graph
            .edges_directed(node.0, Direction::Incoming)
            .map(|e| NodeId(e.source()))
            .collect()
    }

    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(NodeId).collect())
            .map_err(|cycle| Error::GraphInvalid(format!("cycle at node {:?}", cycle.node_id())))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_indices(&self) -> Vec<EdgeIndex> {
        self.graph.edge_indices().collect()
    }

    pub fn edge_endpoints(&self, edge: EdgeIndex) -> Option<(NodeId, NodeId, EdgeSpec)> {
        let (src, dst) = self.graph.edge_endpoints(edge)?;
        let spec = *self.graph.edge_weight(edge)?;
        Some((NodeId(src), NodeId(dst), spec))
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::DummyTask;

    fn dummy(name: &str) -> Box<dyn Task> {
        Box::new(DummyTask::new(name))
    }

    #[test]
    fn rejects_cycles() {
        let mut g = TaskGraph::new();
        let a = g.add_node(dummy("a"));
        let b = g.add_node(dummy("b"));
        g.connect(a, b, 0).unwrap();
        assert!(g.connect(b, a, 0).is_err());
    }

    #[test]
    fn rejects_self_loop() {
        let mut g = TaskGraph::new();
        let a = g.add_node(dummy("a"));
        assert!(g.connect(a, a, 0).is_err());
    }

    #[test]
    fn roots_and_leaves() {
        let mut g = TaskGraph::new();
        let a = g.add_node(dummy("a"));
        let b = g.add_node(dummy("b"));
        let c = g.add_node(dummy("c"));
        g.connect(a, b, 0).unwrap();
        g.connect(b, c, 0).unwrap();
        assert_eq!(g.roots(), vec![a]);
        assert_eq!(g.leaves(), vec![c]);
    }

    #[test]
    fn topological_order_respects_edges() {
        let mut g = TaskGraph::new();
        let a = g.add_node(dummy("a"));
        let b = g.add_node(dummy("b"));
        let c = g.add_node(dummy("c"));
        g.connect(a, b, 0).unwrap();
        g.connect(b, c, 0).unwrap();
        let order = g.topological_order().unwrap();
        let pos = |n: NodeId| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }
}
