// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The driving workload: a concurrent graph traversal that sums the values
//! of every node reachable from a root.
//!
//! [`Traversal`] implements [`Worker`] with a node index as its task type.
//! Visiting a node marks it, adds its value to a shared accumulator, and
//! returns one follow-up task per not-yet-visited neighbour. The pool fans
//! those out across its threads; visit order is non-deterministic, but the
//! final sum is not.
//!
//! Graphs can be built in code with [`Graph::new`] or loaded from a text
//! description with [`Graph::from_reader`]:
//!
//! ```
//! use std::io::Cursor;
//!
//! use quiesce::graph::Graph;
//!
//! let text = "3 3\n1 2 3\n0 1\n0 2\n1 2\n";
//! let graph = Graph::from_reader(Cursor::new(text)).unwrap();
//! assert_eq!(graph.node_count(), 3);
//! ```

use std::error::Error;
use std::fmt;
use std::io::{self, BufRead};

use parking_lot::Mutex;

use crate::Worker;

/// Per-node visit state. Each slot moves from `NotVisited` to `Done` at
/// most once, under the visited lock.
#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    NotVisited,
    Done,
}

/// A node holds an integer value and the indices of its successors.
#[derive(Debug)]
pub struct Node {
    value: i64,
    neighbours: Vec<usize>,
}

impl Node {
    /// The node's value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Indices of the nodes this node points at.
    pub fn neighbours(&self) -> &[usize] {
        &self.neighbours
    }
}

/// A directed graph with integer-valued nodes, indexed `0..node_count()`.
/// The topology is fixed at construction.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Build a graph from node values and directed edges.
    ///
    /// # Panics
    ///
    /// Panics if an edge references a node index out of range.
    pub fn new(values: Vec<i64>, edges: &[(usize, usize)]) -> Graph {
        let node_count = values.len();
        let mut nodes: Vec<Node> = values
            .into_iter()
            .map(|value| Node {
                value,
                neighbours: Vec::new(),
            })
            .collect();
        for &(from, to) in edges {
            assert!(
                from < node_count && to < node_count,
                "edge ({}, {}) out of range for {} nodes",
                from,
                to,
                node_count
            );
            nodes[from].neighbours.push(to);
        }
        Graph { nodes }
    }

    /// Load a graph from a text description.
    ///
    /// The format, line by line (blank lines are skipped):
    ///
    /// 1. `node_count edge_count`
    /// 2. `node_count` whitespace-separated node values
    /// 3. `edge_count` lines of `from to`, one directed edge each
    ///
    /// A zero-node graph consists of only the `0 0` header. Undirected
    /// graphs list both arcs of every edge.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Graph, GraphError> {
        let mut lines = NumberedLines::new(reader);

        let (line, header) = lines.next_non_empty()?;
        let mut fields = header.split_whitespace();
        let node_count = parse_field(fields.next(), line)?;
        let edge_count = parse_field(fields.next(), line)?;
        if fields.next().is_some() {
            return Err(GraphError::Parse { line });
        }

        // An empty graph has no values line to read.
        let mut values = Vec::with_capacity(node_count);
        if node_count > 0 {
            let (line, text) = lines.next_non_empty()?;
            for field in text.split_whitespace() {
                values.push(field.parse().map_err(|_| GraphError::Parse { line })?);
            }
            if values.len() != node_count {
                return Err(GraphError::Parse { line });
            }
        }

        let mut edges = Vec::with_capacity(edge_count);
        for _ in 0..edge_count {
            let (line, text) = lines.next_non_empty()?;
            let mut fields = text.split_whitespace();
            let from: usize = parse_field(fields.next(), line)?;
            let to: usize = parse_field(fields.next(), line)?;
            if fields.next().is_some() {
                return Err(GraphError::Parse { line });
            }
            if from >= node_count || to >= node_count {
                return Err(GraphError::NodeOutOfRange { line });
            }
            edges.push((from, to));
        }

        Ok(Graph::new(values, &edges))
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }
}

/// Tracks line numbers and skips blank lines while reading.
struct NumberedLines<R> {
    lines: io::Lines<R>,
    line: usize,
}

impl<R: BufRead> NumberedLines<R> {
    fn new(reader: R) -> NumberedLines<R> {
        NumberedLines {
            lines: reader.lines(),
            line: 0,
        }
    }

    fn next_non_empty(&mut self) -> Result<(usize, String), GraphError> {
        loop {
            self.line += 1;
            match self.lines.next() {
                Some(Ok(text)) => {
                    if !text.trim().is_empty() {
                        return Ok((self.line, text));
                    }
                }
                Some(Err(err)) => return Err(GraphError::Io(err)),
                None => return Err(GraphError::UnexpectedEof),
            }
        }
    }
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>, line: usize) -> Result<T, GraphError> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or(GraphError::Parse { line })
}

/// An error produced while loading a graph description.
#[derive(Debug)]
pub enum GraphError {
    /// The underlying reader failed.
    Io(io::Error),
    /// A line did not match the expected grammar.
    Parse { line: usize },
    /// An edge referenced a node index outside `0..node_count`.
    NodeOutOfRange { line: usize },
    /// The input ended before the declared nodes and edges were read.
    UnexpectedEof,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Io(err) => write!(f, "failed to read graph: {}", err),
            GraphError::Parse { line } => write!(f, "malformed graph description at line {}", line),
            GraphError::NodeOutOfRange { line } => {
                write!(f, "edge references unknown node at line {}", line)
            }
            GraphError::UnexpectedEof => write!(f, "graph description ended unexpectedly"),
        }
    }
}

impl Error for GraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraphError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GraphError {
    fn from(err: io::Error) -> GraphError {
        GraphError::Io(err)
    }
}

/// A graph-sum traversal, usable as the [`Worker`] of a pool.
///
/// Each task visits one node: mark it done, add its value to the shared
/// sum, and spawn a task per unvisited neighbour. The visited marks and the
/// accumulator sit behind separate locks so that marking does not contend
/// with summing; the locks are only ever held one at a time.
///
/// A node reachable over several paths is raced for by several tasks; the
/// check-and-mark under the visited lock picks exactly one winner, so every
/// reachable node contributes to the sum exactly once.
pub struct Traversal {
    graph: Graph,
    visited: Mutex<Vec<VisitState>>,
    sum: Mutex<i64>,
}

impl Traversal {
    /// Wrap a graph with fresh traversal state: nothing visited, sum zero.
    pub fn new(graph: Graph) -> Traversal {
        let visited = vec![VisitState::NotVisited; graph.node_count()];
        Traversal {
            graph,
            visited: Mutex::new(visited),
            sum: Mutex::new(0),
        }
    }

    /// The running sum. Stable once the pool has quiesced.
    pub fn sum(&self) -> i64 {
        *self.sum.lock()
    }

    /// Whether the node at `index` has been visited.
    pub fn is_visited(&self, index: usize) -> bool {
        self.visited.lock()[index] == VisitState::Done
    }

    /// The graph being traversed.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Worker for Traversal {
    type Task = usize;

    fn execute(&self, index: usize) -> Vec<usize> {
        {
            // Check-and-mark must be atomic: of all tasks racing for this
            // node, exactly one may proceed past here.
            let mut visited = self.visited.lock();
            if visited[index] == VisitState::Done {
                return Vec::new();
            }
            visited[index] = VisitState::Done;
        }

        let node = &self.graph.nodes[index];
        *self.sum.lock() += node.value;

        // Already-visited neighbours need no task. The filter is only an
        // optimisation: a neighbour marked by another thread after this
        // snapshot still gets a task, which the check above turns into a
        // no-op.
        let visited = self.visited.lock();
        node.neighbours
            .iter()
            .copied()
            .filter(|&neighbour| visited[neighbour] == VisitState::NotVisited)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::{Graph, GraphError, Traversal};
    use crate::Pool;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;
    use std::sync::Arc;

    /// Traverse `graph` from `root` on a fresh pool and return the workload.
    fn run(graph: Graph, workers: usize, root: usize) -> Arc<Traversal> {
        let traversal = Arc::new(Traversal::new(graph));
        let pool = Pool::new(workers, Arc::clone(&traversal));
        pool.spawn(root);
        pool.join();
        traversal
    }

    /// Reachable-node sum and visit marks by a sequential traversal.
    fn reference_traversal(graph: &Graph, root: usize) -> (i64, Vec<bool>) {
        let mut seen = vec![false; graph.node_count()];
        let mut stack = vec![root];
        let mut sum = 0;
        seen[root] = true;
        while let Some(index) = stack.pop() {
            sum += graph.nodes[index].value;
            for &neighbour in &graph.nodes[index].neighbours {
                if !seen[neighbour] {
                    seen[neighbour] = true;
                    stack.push(neighbour);
                }
            }
        }
        (sum, seen)
    }

    #[test]
    fn two_paths_count_the_node_once() {
        // 0 -> 1 -> 2 and 0 -> 2: node 2 is raced for over two paths.
        for workers in [1, 2, 4, 16] {
            let graph = Graph::new(vec![1, 2, 3], &[(0, 1), (0, 2), (1, 2)]);
            let traversal = run(graph, workers, 0);
            assert_eq!(traversal.sum(), 6, "workers: {}", workers);
            for index in 0..3 {
                assert!(traversal.is_visited(index));
            }
        }
    }

    #[test]
    fn isolated_node() {
        for workers in [1, 4] {
            let traversal = run(Graph::new(vec![5], &[]), workers, 0);
            assert_eq!(traversal.sum(), 5);
            assert!(traversal.is_visited(0));
        }
    }

    #[test]
    fn cycle_is_not_double_counted() {
        for workers in [1, 2, 4, 16] {
            let graph = Graph::new(vec![4, 4], &[(0, 1), (1, 0)]);
            let traversal = run(graph, workers, 0);
            assert_eq!(traversal.sum(), 8, "workers: {}", workers);
        }
    }

    #[test]
    fn unreachable_nodes_are_not_visited() {
        let graph = Graph::new(vec![1, 10, 100, 1_000], &[(0, 1), (2, 3)]);
        let traversal = run(graph, 4, 0);
        assert_eq!(traversal.sum(), 11);
        assert!(traversal.is_visited(0));
        assert!(traversal.is_visited(1));
        assert!(!traversal.is_visited(2));
        assert!(!traversal.is_visited(3));
    }

    #[test]
    fn repeated_runs_agree() {
        // Many in-edges converge on node 4; fresh state each run.
        let build = || {
            Graph::new(
                vec![1, 2, 4, 8, 16],
                &[(0, 1), (0, 2), (0, 3), (1, 4), (2, 4), (3, 4)],
            )
        };
        let first = run(build(), 4, 0);
        let second = run(build(), 4, 0);
        assert_eq!(first.sum(), 31);
        assert_eq!(second.sum(), 31);
    }

    #[test]
    fn neighbour_order_does_not_matter() {
        let forward = Graph::new(vec![7, 11, 13], &[(0, 1), (0, 2)]);
        let reversed = Graph::new(vec![7, 11, 13], &[(0, 2), (0, 1)]);
        assert_eq!(run(forward, 4, 0).sum(), run(reversed, 4, 0).sum());
    }

    #[test]
    fn random_graph_matches_sequential_reference() {
        let mut rng = StdRng::seed_from_u64(0x9a3f);
        let node_count = 10_000;
        let values: Vec<i64> = (0..node_count).map(|_| rng.gen_range(-100..100)).collect();
        let mut edges = Vec::new();
        for from in 0..node_count {
            for _ in 0..rng.gen_range(0..4) {
                edges.push((from, rng.gen_range(0..node_count)));
            }
        }

        let (expected_sum, expected_seen) =
            reference_traversal(&Graph::new(values.clone(), &edges), 0);

        let traversal = run(Graph::new(values, &edges), 4, 0);
        assert_eq!(traversal.sum(), expected_sum);
        for (index, &seen) in expected_seen.iter().enumerate() {
            assert_eq!(traversal.is_visited(index), seen, "node {}", index);
        }
    }

    #[test]
    fn loads_graph_from_text() {
        let text = "3 3\n1 2 3\n0 1\n0 2\n1 2\n";
        let graph = Graph::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node(0).value(), 1);
        assert_eq!(graph.node(0).neighbours(), &[1, 2]);
        assert_eq!(run(graph, 4, 0).sum(), 6);
    }

    #[test]
    fn loader_skips_blank_lines() {
        let text = "2 1\n\n4 4\n\n0 1\n";
        let graph = Graph::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.node(0).neighbours(), &[1]);
    }

    #[test]
    fn loader_accepts_empty_graph() {
        let graph = Graph::from_reader(Cursor::new("0 0\n")).unwrap();
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn loader_rejects_malformed_header() {
        let err = Graph::from_reader(Cursor::new("x 1\n")).unwrap_err();
        assert!(matches!(err, GraphError::Parse { line: 1 }));
    }

    #[test]
    fn loader_rejects_wrong_value_count() {
        let err = Graph::from_reader(Cursor::new("3 0\n1 2\n")).unwrap_err();
        assert!(matches!(err, GraphError::Parse { line: 2 }));
    }

    #[test]
    fn loader_rejects_edge_out_of_range() {
        let err = Graph::from_reader(Cursor::new("2 1\n1 2\n0 5\n")).unwrap_err();
        assert!(matches!(err, GraphError::NodeOutOfRange { line: 3 }));
    }

    #[test]
    fn loader_rejects_truncated_input() {
        let err = Graph::from_reader(Cursor::new("3 2\n1 2 3\n0 1\n")).unwrap_err();
        assert!(matches!(err, GraphError::UnexpectedEof));
    }
}
