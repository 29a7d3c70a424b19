use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::Registry;
use crate::error::GraphError;
use crate::phase::TaskPhase;
use crate::task::TaskDescriptor;

/// Why one task has to run before another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The source runs in a phase with a lower index.
    Phase,
    /// The target is a declared dependent of the source.
    Dependent,
}

/// Tasks sharing a phase index.
///
/// Phases with different names but the same index are one barrier, so
/// declared dependents between them are honoured.
#[derive(Debug, Clone)]
pub struct PhaseBucket {
    /// Never empty, ordered by name.
    pub phases: Vec<TaskPhase>,
    pub tasks: Vec<NodeIndex>,
}

impl PhaseBucket {
    pub fn index(&self) -> i32 {
        self.phases.first().map_or(0, TaskPhase::index)
    }
}

impl Display for PhaseBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.phases.iter().map(TaskPhase::name).collect();
        write!(f, "{}({})", names.join("|"), self.index())
    }
}

/// The validated, acyclic order of a set of tasks.
///
/// An edge `u -> v` means `u` has to complete before `v` may start. Edges
/// come from two sources: every task of a lower-index phase precedes every
/// task of a higher-index phase, and every task precedes its declared
/// dependents.
#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) graph: Graph<Arc<TaskDescriptor>, Edge>,
    buckets: Vec<PhaseBucket>,
    lookup: HashMap<String, NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl TaskGraph {
    /// Builds the graph of every task in the registry.
    pub fn build(registry: &Registry) -> Result<Self, GraphError> {
        Self::assemble(registry.iter().cloned().collect(), true)
    }

    /// Builds a graph from descriptors sorted by phase and name.
    ///
    /// With `strict` unset, dependents outside of the given set are ignored.
    fn assemble(descriptors: Vec<Arc<TaskDescriptor>>, strict: bool) -> Result<Self, GraphError> {
        let mut graph = Graph::new();
        let mut lookup = HashMap::new();

        for descriptor in descriptors {
            let name = descriptor.name().to_string();
            let index = graph.add_node(descriptor);
            lookup.insert(name, index);
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();

        for &source in &nodes {
            let task = graph[source].clone();
            for dependent in task.dependents() {
                match lookup.get(dependent) {
                    Some(&target) => {
                        graph.add_edge(source, target, Edge::Dependent);
                    }
                    None if strict => {
                        return Err(GraphError::UnknownDependent {
                            task: task.name().to_string(),
                            dependent: dependent.clone(),
                        });
                    }
                    None => {}
                }
            }
        }

        for &source in &nodes {
            for &target in &nodes {
                if graph[source].phase().index() < graph[target].phase().index() {
                    graph.add_edge(source, target, Edge::Phase);
                }
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(GraphError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|index| graph[index].name().to_string())
                    .collect(),
            });
        }

        let mut buckets: Vec<PhaseBucket> = Vec::new();
        for index in nodes {
            let phase = graph[index].phase();
            match buckets.last_mut() {
                Some(bucket) if bucket.index() == phase.index() => {
                    if !bucket.phases.contains(phase) {
                        bucket.phases.push(phase.clone());
                    }
                    bucket.tasks.push(index);
                }
                _ => buckets.push(PhaseBucket {
                    phases: vec![phase.clone()],
                    tasks: vec![index],
                }),
            }
        }

        Ok(Self {
            graph,
            buckets,
            lookup,
        })
    }

    /// Restricts the graph to `targets` and everything they transitively
    /// depend on through declared dependents.
    pub fn select<I, S>(&self, targets: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut queue = VecDeque::new();
        for target in targets {
            let target = target.as_ref();
            match self.lookup.get(target) {
                Some(&index) => queue.push_back(index),
                None => return Err(GraphError::UnknownTask(target.to_string())),
            }
        }

        let mut selected = BTreeSet::new();
        while let Some(index) = queue.pop_front() {
            if selected.insert(index) {
                queue.extend(self.prerequisites(index));
            }
        }

        // Node indices follow phase and name order already.
        let descriptors = selected
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect();

        Self::assemble(descriptors, false)
    }

    /// Phase buckets, ordered by phase index.
    pub fn phases(&self) -> &[PhaseBucket] {
        &self.buckets
    }

    pub fn task(&self, index: NodeIndex) -> &Arc<TaskDescriptor> {
        &self.graph[index]
    }

    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.lookup.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks that declared `index` as one of their dependents, in any phase.
    pub fn prerequisites(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.explicit(index, Direction::Incoming)
    }

    /// Declared dependents of `index`.
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.explicit(index, Direction::Outgoing)
    }

    fn explicit(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .edges_directed(index, direction)
            .filter(|edge| *edge.weight() == Edge::Dependent)
            .map(|edge| match direction {
                Direction::Incoming => edge.source(),
                Direction::Outgoing => edge.target(),
            })
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

/// Depth-first search with three marks, returns the first cycle found.
///
/// Nodes and their successors are visited in index order, so the reported
/// cycle is the same for the same set of tasks.
fn find_cycle<N>(graph: &Graph<N, Edge>) -> Option<Vec<NodeIndex>> {
    fn visit<N>(
        graph: &Graph<N, Edge>,
        node: NodeIndex,
        marks: &mut [Mark],
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks[node.index()] = Mark::Grey;
        path.push(node);

        let mut next: Vec<NodeIndex> = graph.neighbors(node).collect();
        next.sort();
        next.dedup();

        for succ in next {
            match marks[succ.index()] {
                Mark::Grey => {
                    let start = path.iter().position(|&n| n == succ).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Mark::White => {
                    if let Some(cycle) = visit(graph, succ, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }

        path.pop();
        marks[node.index()] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; graph.node_count()];
    let mut path = Vec::new();

    for node in graph.node_indices() {
        if marks[node.index()] == Mark::White
            && let Some(cycle) = visit(graph, node, &mut marks, &mut path)
        {
            return Some(cycle);
        }
    }

    None
}

/// Mermaid entity code for quotes inside labels.
fn escape(label: &str) -> String {
    label.replace('"', "#quot;")
}

/// Renders the graph as a Mermaid diagram, one subgraph per phase.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        // Bucket positions as ids, indices may be negative.
        for (position, bucket) in self.buckets.iter().enumerate() {
            writeln!(
                f,
                "    subgraph phase_{}[\"{}\"]",
                position,
                escape(&bucket.to_string())
            )?;
            for &index in &bucket.tasks {
                let name = escape(self.graph[index].name());
                writeln!(f, "        {}[\"{}\"]", index.index(), name)?;
            }
            writeln!(f, "    end")?;
        }

        for position in 1..self.buckets.len() {
            writeln!(f, "    phase_{} ==> phase_{}", position - 1, position)?;
        }

        for edge in self.graph.edge_references() {
            if *edge.weight() == Edge::Dependent {
                writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
            }
        }

        Ok(())
    }
}
