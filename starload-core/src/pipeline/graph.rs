//! Immutable task graph with `begin`/`end` boundary tasks.
//!
//! Uses petgraph's DiGraph with tasks as nodes and upstream -> downstream
//! edges. The graph performs no execution; it answers structural queries for
//! the executor.

use crate::error::GraphError;
use crate::pipeline::types::{PipelineDefinition, RetryPolicy, Task, TaskStatus};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Name of the single entry pseudo-task.
pub const BEGIN: &str = "begin";
/// Name of the single success pseudo-task.
pub const END: &str = "end";

/// A directed dependency: `to` waits for `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// The task graph for one pipeline.
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from tasks and edges.
    ///
    /// `begin` is wired to every task without upstream edges (and to tasks
    /// marked as entry); every task without downstream edges is wired to `end`.
    pub fn build(tasks: Vec<Task>, edges: &[Edge]) -> Result<Self, GraphError> {
        if tasks.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        let begin = graph.add_node(Task::no_op(BEGIN));
        for task in tasks {
            if task.name == BEGIN || task.name == END {
                return Err(GraphError::ReservedName { name: task.name });
            }
            if index.contains_key(&task.name) {
                return Err(GraphError::DuplicateTask { name: task.name });
            }
            let name = task.name.clone();
            let idx = graph.add_node(task);
            index.insert(name, idx);
        }

        for edge in edges {
            let lookup = |name: &str| {
                index
                    .get(name)
                    .copied()
                    .ok_or_else(|| GraphError::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: name.to_string(),
                    })
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;
            graph.update_edge(from, to, ());
        }

        if let Some(path) = find_cycle(&graph) {
            return Err(GraphError::Cycle { path });
        }

        let user_nodes: Vec<NodeIndex> = graph.node_indices().filter(|&n| n != begin).collect();
        let end = graph.add_node(Task::no_op(END));
        for node in user_nodes {
            let is_root = graph
                .neighbors_directed(node, Direction::Incoming)
                .next()
                .is_none();
            if is_root || graph[node].entry {
                graph.add_edge(begin, node, ());
            }
            let is_sink = graph
                .neighbors_directed(node, Direction::Outgoing)
                .next()
                .is_none();
            if is_sink {
                graph.add_edge(node, end, ());
            }
        }

        index.insert(BEGIN.to_string(), begin);
        index.insert(END.to_string(), end);

        Ok(Self { graph, index })
    }

    /// Build the graph declared by a pipeline definition.
    ///
    /// Retry precedence: task, then pipeline defaults, then `default_retry`.
    pub fn from_definition(
        def: &PipelineDefinition,
        default_retry: &RetryPolicy,
    ) -> Result<Self, GraphError> {
        let pipeline_retry = def.defaults.retry.as_ref().unwrap_or(default_retry);
        let mut tasks = Vec::with_capacity(def.tasks.len());
        let mut edges = Vec::new();
        for spec in &def.tasks {
            let mut task = Task::new(spec.name.clone(), spec.operation.clone())
                .with_retry(spec.retry.clone().unwrap_or_else(|| pipeline_retry.clone()));
            task.entry = spec.entry;
            tasks.push(task);
            edges.extend(spec.upstream.iter().map(|up| Edge::new(up, &spec.name)));
        }
        Self::build(tasks, &edges)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    /// All tasks including `begin` and `end`, in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| Edge::new(&self.graph[a].name, &self.graph[b].name))
            .collect()
    }

    pub fn upstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Every task reachable from `name`, excluding itself.
    pub fn descendants(&self, name: &str) -> HashSet<&str> {
        let mut out = HashSet::new();
        if let Some(&start) = self.index.get(name) {
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                if node != start {
                    out.insert(self.graph[node].name.as_str());
                }
            }
        }
        out
    }

    /// Pending tasks whose upstream tasks all succeeded.
    pub fn ready_set(&self, status_of: impl Fn(&str) -> TaskStatus) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter(|&idx| status_of(&self.graph[idx].name) == TaskStatus::Pending)
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|up| status_of(&self.graph[up].name) == TaskStatus::Success)
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Pending tasks with at least one upstream task that ended without success.
    /// None of them can ever become ready.
    pub fn blocked_set(&self, status_of: impl Fn(&str) -> TaskStatus) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter(|&idx| status_of(&self.graph[idx].name) == TaskStatus::Pending)
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .any(|up| status_of(&self.graph[up].name).is_failure())
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Group tasks by depth from `begin`. Tasks in one level have no edges
    /// between them and may run concurrently.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let order = petgraph::algo::toposort(&self.graph, None).unwrap_or_default();
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|up| depth.get(&up))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }

        let max = depth.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<&str>> = vec![Vec::new(); max + 1];
        for idx in self.graph.node_indices() {
            if let Some(&d) = depth.get(&idx) {
                levels[d].push(self.graph[idx].name.as_str());
            }
        }
        levels
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].name.as_str())
            .collect();
        out.sort_unstable();
        out
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search for a back edge. Returns the cycle path, first node
/// repeated at the end.
fn find_cycle(graph: &DiGraph<Task, ()>) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();
    for start in graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(path) = visit(graph, start, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

fn visit(
    graph: &DiGraph<Task, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    marks[node.index()] = Mark::OnStack;
    stack.push(node);
    for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match marks[next.index()] {
            Mark::OnStack => {
                let pos = stack.iter().position(|n| *n == next).unwrap_or(0);
                let mut path: Vec<String> =
                    stack[pos..].iter().map(|n| graph[*n].name.clone()).collect();
                path.push(graph[next].name.clone());
                return Some(path);
            }
            Mark::Unvisited => {
                if let Some(path) = visit(graph, next, marks, stack) {
                    return Some(path);
                }
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[node.index()] = Mark::Done;
    None
}
