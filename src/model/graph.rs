//! Dependency graph over vertices for one reconciliation pass
//!
//! An edge `A -> B` means "B must be applied to the store before A". The
//! graph never holds a cycle: `add_edge` refuses edges that would close one,
//! and `topo_order` re-checks before handing out an execution order.
//!
//! Node indices are handed out sequentially and vertices are never removed,
//! so a node's index is also its insertion position. Both the traversal and
//! the tie-breaking in [`DependencyGraph::topo_order`] rely on that.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::model::{GraphOption, GraphOptions, ObjectKey, ObjectKind, Vertex};

/// Vertices plus ordering edges for one pass
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<Vertex, ()>,
    index: HashMap<ObjectKey, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Insert a vertex, or replace the one already at its identity.
    ///
    /// A replaced vertex keeps its insertion position and its edges.
    pub fn add_vertex(&mut self, vertex: Vertex) -> ObjectKey {
        let key = vertex.key().clone();
        match self.index.get(&key) {
            Some(&idx) => {
                if let Some(slot) = self.graph.node_weight_mut(idx) {
                    *slot = vertex;
                }
            }
            None => {
                let idx = self.graph.add_node(vertex);
                self.index.insert(key.clone(), idx);
            }
        }
        key
    }

    /// Record that `from` depends on `to`.
    ///
    /// # Errors
    ///
    /// `VertexNotFound` if either end is unknown, `CycleDetected` if `to`
    /// already (transitively) depends on `from`.
    pub fn add_edge(&mut self, from: &ObjectKey, to: &ObjectKey) -> Result<()> {
        let from_idx = self.node(from)?;
        let to_idx = self.node(to)?;
        if from_idx == to_idx || has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(Error::CycleDetected {
                from: from.clone(),
                to: to.clone(),
            });
        }
        self.graph.update_edge(from_idx, to_idx, ());
        Ok(())
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Vertex> {
        self.index
            .get(key)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn get_mut(&mut self, key: &ObjectKey) -> Option<&mut Vertex> {
        match self.index.get(key) {
            Some(&idx) => self.graph.node_weight_mut(idx),
            None => None,
        }
    }

    /// All vertices in insertion order
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_weights()
    }

    /// Vertices of `reference` kind, or with `HaveDifferentTypeWith` every
    /// vertex of any other kind. Results come back in insertion order.
    pub fn find_all(&self, reference: ObjectKind, options: &[GraphOption]) -> Vec<&Vertex> {
        let options = GraphOptions::from_options(options.iter().cloned());
        self.vertices()
            .filter(|v| (v.key().kind == reference) != options.have_different_type_with)
            .collect()
    }

    /// Direct dependencies of a vertex, in insertion order
    pub fn dependencies_of(&self, key: &ObjectKey) -> Result<Vec<ObjectKey>> {
        self.neighbors(key, Direction::Outgoing)
    }

    /// Execution order: for every edge `A -> B`, `B` comes before `A`.
    ///
    /// Kahn's algorithm over dependency counts. Among vertices that are ready
    /// at the same time the earliest inserted goes first, so the order is
    /// reproducible for a given sequence of insertions.
    ///
    /// # Errors
    ///
    /// `CycleDetected` naming one edge on the cycle.
    pub fn topo_order(&self) -> Result<Vec<ObjectKey>> {
        let count = self.graph.node_count();
        let mut pending: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .count()
            })
            .collect();

        let mut ready: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| pending[idx.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(idx) = ready.pop_first() {
            if let Some(vertex) = self.graph.node_weight(idx) {
                order.push(vertex.key().clone());
            }
            for dependent in self.graph.neighbors_directed(idx, Direction::Incoming) {
                let slot = &mut pending[dependent.index()];
                *slot = slot.saturating_sub(1);
                if *slot == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != count {
            return Err(self.cycle_error(&pending));
        }
        Ok(order)
    }

    fn cycle_error(&self, pending: &[usize]) -> Error {
        let stuck = |idx: &NodeIndex| pending[idx.index()] > 0;
        let edge = self.graph.node_indices().filter(stuck).find_map(|from| {
            self.graph
                .neighbors_directed(from, Direction::Outgoing)
                .find(stuck)
                .map(|to| (from, to))
        });
        match edge {
            Some((from, to)) => Error::CycleDetected {
                from: self.graph[from].key().clone(),
                to: self.graph[to].key().clone(),
            },
            None => Error::validation("dependency graph could not be ordered"),
        }
    }

    fn node(&self, key: &ObjectKey) -> Result<NodeIndex> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| Error::VertexNotFound(key.clone()))
    }

    fn neighbors(&self, key: &ObjectKey, direction: Direction) -> Result<Vec<ObjectKey>> {
        let idx = self.node(key)?;
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort();
        Ok(neighbors
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n))
            .map(|v| v.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KubeObject, VertexAction};

    fn cron(name: &str) -> Vertex {
        Vertex::create(
            KubeObject::new(ObjectKind::CronJob, "db", name),
            GraphOptions::default(),
        )
    }

    fn names(keys: &[ObjectKey]) -> Vec<&str> {
        keys.iter().map(|k| k.name.as_str()).collect()
    }

    #[test]
    fn test_empty_graph_orders_nothing() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.topo_order().unwrap().is_empty());
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_vertex(cron("a"));
        let b = graph.add_vertex(cron("b"));
        let c = graph.add_vertex(cron("c"));
        graph.add_edge(&a, &b).unwrap(); // a needs b
        graph.add_edge(&b, &c).unwrap(); // b needs c

        assert_eq!(names(&graph.topo_order().unwrap()), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let mut graph = DependencyGraph::new();
        let root = graph.add_vertex(cron("root"));
        let x = graph.add_vertex(cron("x"));
        let y = graph.add_vertex(cron("y"));
        let z = graph.add_vertex(cron("z"));
        graph.add_edge(&root, &z).unwrap();
        graph.add_edge(&root, &x).unwrap();
        graph.add_edge(&y, &z).unwrap();

        // x and z are ready first; x was inserted first. Once z is done,
        // y becomes ready, and root waits for both x and z.
        let order = graph.topo_order().unwrap();
        assert_eq!(names(&order), vec!["x", "z", "root", "y"]);
        assert_eq!(graph.topo_order().unwrap(), order);
    }

    #[test]
    fn test_edge_closing_cycle_is_rejected() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_vertex(cron("a"));
        let b = graph.add_vertex(cron("b"));
        let c = graph.add_vertex(cron("c"));
        graph.add_edge(&a, &b).unwrap();
        graph.add_edge(&b, &c).unwrap();

        let result = graph.add_edge(&c, &a);
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
        assert!(graph.dependencies_of(&c).unwrap().is_empty());

        let result = graph.add_edge(&a, &a);
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn test_edge_to_unknown_vertex_is_rejected() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_vertex(cron("a"));
        let missing = ObjectKey::new(ObjectKind::CronJob, "db", "missing");
        assert!(matches!(
            graph.add_edge(&a, &missing),
            Err(Error::VertexNotFound(_))
        ));
    }

    #[test]
    fn test_replacing_vertex_keeps_position_and_edges() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_vertex(cron("a"));
        let b = graph.add_vertex(cron("b"));
        graph.add_edge(&b, &a).unwrap();

        let mut replacement = cron("a");
        replacement.action = VertexAction::Noop;
        graph.add_vertex(replacement);

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(&a).unwrap().action, VertexAction::Noop);
        assert_eq!(graph.dependencies_of(&b).unwrap(), vec![a]);
    }

    #[test]
    fn test_find_all_by_kind() {
        let mut graph = DependencyGraph::new();
        graph.add_vertex(Vertex::noop(KubeObject::new(
            ObjectKind::BackupSchedule,
            "db",
            "nightly",
        )));
        graph.add_vertex(cron("a"));
        graph.add_vertex(Vertex::create(
            KubeObject::new(ObjectKind::Backup, "db", "continuous"),
            GraphOptions::default(),
        ));
        graph.add_vertex(cron("b"));

        let crons = graph.find_all(ObjectKind::CronJob, &[]);
        assert_eq!(crons.len(), 2);

        let others = graph.find_all(ObjectKind::CronJob, &[GraphOption::HaveDifferentTypeWith]);
        let kinds: Vec<ObjectKind> = others.iter().map(|v| v.key().kind).collect();
        assert_eq!(kinds, vec![ObjectKind::BackupSchedule, ObjectKind::Backup]);
    }
}
