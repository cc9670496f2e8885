mod report;
mod runner;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::cell::{AnyCell, CellId, Settled};
use crate::core::{ArcStr, Environment};
use crate::error::{Cause, Failure, KumoError, LookupError};
use crate::node::{BoxFuture, ResourceNode};

pub use report::{BranchFailure, Execution, LookupReport, NodeReport, Outcome, Report};

/// Kind of dependency between two resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Declared ordering: the target starts only after the source completed.
    After,
    /// The target consumes a cell derived from the source's output.
    Value,
}

/// A lookup ready to run, waiting for the orchestrator to pick it up.
pub(crate) struct LookupJob {
    cell: AnyCell,
    future: BoxFuture<(u32, Settled)>,
}

impl LookupJob {
    pub(crate) fn new<F>(cell: AnyCell, future: F) -> Self
    where
        F: Future<Output = (u32, Settled)> + Send + 'static,
    {
        Self {
            cell,
            future: Box::pin(future),
        }
    }

    pub(crate) fn into_parts(self) -> (AnyCell, BoxFuture<(u32, Settled)>) {
        (self.cell, self.future)
    }
}

/// Messages delivered to the orchestrator's inbox.
pub(crate) enum Event {
    /// A lookup has all its inputs and should be started.
    Lookup(LookupJob),
    /// One of the node's input cells settled.
    Input {
        node: NodeIndex,
        failure: Option<Failure>,
    },
}

/// Handle through which cells hand work to the orchestrator.
///
/// Every cell may submit at most one lookup; a second submission for the same
/// cell is refused.
#[derive(Clone)]
pub struct Dispatcher {
    tx: UnboundedSender<Event>,
    launched: Arc<Mutex<HashSet<CellId>>>,
}

impl Dispatcher {
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            launched: Arc::default(),
        };
        (dispatcher, rx)
    }

    pub(crate) fn submit(&self, job: LookupJob) -> Result<(), LookupError> {
        let cell = job.cell.clone();

        let fresh = self
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cell.id());
        if !fresh {
            return Err(LookupError::Duplicate(cell.label_arc()));
        }

        if self.tx.send(Event::Lookup(job)).is_err() {
            let cause = Cause::Cancelled("the orchestrator is not running".into());
            if let Err(err) = cell.settle(Err(Failure::new(cell.label_arc(), cause))) {
                tracing::error!("{err}");
            }
        }

        Ok(())
    }

    pub(crate) fn notify(&self, node: NodeIndex, failure: Option<Failure>) {
        // Nobody is listening once the run is over.
        let _ = self.tx.send(Event::Input { node, failure });
    }
}

/// A validated resource graph, ready to be applied with [`Orchestrator::run`].
pub struct Orchestrator<G: Send + Sync = ()> {
    pub(crate) graph: Graph<ResourceNode<G>, Edge>,
    pub(crate) order: Vec<NodeIndex>,
    pub(crate) env: Arc<Environment<G>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) inbox: UnboundedReceiver<Event>,
    pub(crate) timeout: Option<Duration>,
}

impl<G: Send + Sync + 'static> Orchestrator<G> {
    pub(crate) fn build(
        env: Environment<G>,
        nodes: Vec<ResourceNode<G>>,
        dispatcher: Dispatcher,
        inbox: UnboundedReceiver<Event>,
        timeout: Option<Duration>,
    ) -> Result<Self, KumoError> {
        let mut graph = Graph::<ResourceNode<G>, Edge>::new();
        let mut names: HashMap<ArcStr, NodeIndex> = HashMap::new();

        for node in nodes {
            let name = node.name_arc();
            if names.contains_key(&name) {
                return Err(KumoError::DuplicateNode(name));
            }
            names.insert(name, graph.add_node(node));
        }

        let mut edges = Vec::new();
        for target in graph.node_indices() {
            let node = &graph[target];

            for pred in node.predecessors() {
                let source = *names
                    .get(pred)
                    .ok_or_else(|| KumoError::UnknownDependency {
                        node: node.name_arc(),
                        missing: pred.clone(),
                    })?;
                edges.push((source, target, Edge::After));
            }

            for origin in node.inputs().iter().flat_map(AnyCell::origins) {
                if let Some(&source) = names.get(origin) {
                    edges.push((source, target, Edge::Value));
                }
            }
        }

        let mut seen = HashSet::new();
        for (source, target, kind) in edges {
            if seen.insert((source, target, kind)) {
                graph.add_edge(source, target, kind);
            }
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| KumoError::CyclicDependency(cycle_path(&graph, cycle.node_id())))?;

        Ok(Self {
            graph,
            order,
            env: Arc::new(env),
            dispatcher,
            inbox,
            timeout,
        })
    }

    pub fn env(&self) -> &Environment<G> {
        &self.env
    }

    pub fn node(&self, name: &str) -> Option<&ResourceNode<G>> {
        self.graph.node_weights().find(|node| node.name() == name)
    }

    /// Resources in the order they would be provisioned by a sequential run.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode<G>> {
        self.order.iter().map(|&index| &self.graph[index])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Renders the planned graph as a Mermaid diagram. Dashed arrows are
    /// declared orderings, solid arrows carry values.
    pub fn render_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for &index in &self.order {
            let node = &self.graph[index];
            let name = node.name().replace('"', "\\\"");
            let _ = writeln!(f, "    {}[\"{}\"]", index.index(), name);
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            match self.graph[edge] {
                Edge::After => {
                    let _ = writeln!(f, "    {} -.-> {}", source.index(), target.index());
                }
                Edge::Value => {
                    let type_name = self.graph[source]
                        .output_type_name()
                        .replace('<', "&lt;")
                        .replace('>', "&gt;");
                    let _ = writeln!(
                        f,
                        "    {} -- \"{}\" --> {}",
                        source.index(),
                        type_name,
                        target.index()
                    );
                }
            }
        }

        f
    }
}

/// Names along one cycle through `start`, closed by repeating the first name.
fn cycle_path<G: Send + Sync>(graph: &Graph<ResourceNode<G>, Edge>, start: NodeIndex) -> Vec<ArcStr> {
    let component: HashSet<NodeIndex> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .map(|scc| scc.into_iter().collect())
        .unwrap_or_default();

    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    'search: while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if !component.contains(&next) {
                continue;
            }
            if next == start {
                parent.insert(start, current);
                break 'search;
            }
            if !parent.contains_key(&next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    let mut path = vec![graph[start].name_arc()];
    let mut current = start;
    while let Some(&prev) = parent.get(&current) {
        path.push(graph[prev].name_arc());
        if prev == start {
            break;
        }
        current = prev;
    }
    if path.len() == 1 {
        path.push(graph[start].name_arc());
    }

    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ValueCell;
    use crate::{Blueprint, Environment};

    fn plan() -> Blueprint<()> {
        Blueprint::new(Environment::new("test", ()))
    }

    #[test]
    fn test_duplicate_lookup_is_refused() {
        let (dispatcher, mut inbox) = Dispatcher::channel();
        let cell = ValueCell::<u8>::new("lb-arn").erase();

        let job = || LookupJob::new(cell.clone(), async { (1, Ok(Arc::new(1u8) as crate::core::Dynamic)) });

        assert!(dispatcher.submit(job()).is_ok());
        assert_eq!(
            dispatcher.submit(job()).unwrap_err(),
            LookupError::Duplicate("lb-arn".into())
        );
        assert!(matches!(inbox.try_recv(), Ok(Event::Lookup(_))));
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_submit_without_orchestrator_cancels() {
        let (dispatcher, inbox) = Dispatcher::channel();
        drop(inbox);
        let cell = ValueCell::<u8>::new("lb-arn");

        dispatcher
            .submit(LookupJob::new(cell.erase(), async { (1, Ok(Arc::new(1u8) as crate::core::Dynamic)) }))
            .unwrap();

        assert!(matches!(cell.failure().unwrap().cause(), Cause::Cancelled(_)));
    }

    #[test]
    fn test_duplicate_node_is_rejected() {
        let mut plan = plan();
        plan.resource("sg").run(|_| async { Ok(()) });
        plan.resource("sg").run(|_| async { Ok(()) });

        assert!(matches!(plan.finish(), Err(KumoError::DuplicateNode(name)) if &*name == "sg"));
    }

    #[test]
    fn test_unknown_predecessor_is_rejected() {
        let mut plan = plan();
        plan.resource("integration").after(["sg"]).run(|_| async { Ok(()) });

        match plan.finish() {
            Err(KumoError::UnknownDependency { node, missing }) => {
                assert_eq!(&*node, "integration");
                assert_eq!(&*missing, "sg");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let mut plan = plan();
        plan.resource("a").after(["c"]).run(|_| async { Ok(()) });
        plan.resource("b").after(["a"]).run(|_| async { Ok(()) });
        plan.resource("c").after(["b"]).run(|_| async { Ok(()) });
        plan.resource("d").after(["a"]).run(|_| async { Ok(()) });

        match plan.finish() {
            Err(KumoError::CyclicDependency(path)) => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                let members: HashSet<&str> = path.iter().map(|name| name.as_ref()).collect();
                assert_eq!(members, HashSet::from(["a", "b", "c"]));
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_self_cycle_is_rejected() {
        let mut plan = plan();
        plan.resource("a").after(["a"]).run(|_| async { Ok(()) });

        match plan.finish() {
            Err(KumoError::CyclicDependency(path)) => {
                assert_eq!(path, vec![ArcStr::from("a"), ArcStr::from("a")]);
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_value_edge_cycle_is_rejected() {
        let mut plan = plan();
        let a = plan.resource("a").after(["b"]).run(|_| async { Ok(1u8) });
        let derived = a.map("a-derived", |a| *a + 1);
        plan.resource("b").using(derived).run(|_, _| async { Ok(()) });

        match plan.finish() {
            Err(KumoError::CyclicDependency(path)) => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
                let members: HashSet<&str> = path.iter().map(|name| name.as_ref()).collect();
                assert_eq!(members, HashSet::from(["a", "b"]));
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_value_edges_follow_origins() {
        let mut plan = plan();
        let vpc = plan.resource("vpc").run(|_| async { Ok(String::from("vpc-1")) });
        let vpc_id = vpc.map("vpc-id", |vpc| vpc.to_uppercase());
        plan.resource("sg").using(vpc_id).run(|_, _| async { Ok(()) });

        let orchestrator = plan.finish().unwrap();
        let names: Vec<&str> = orchestrator.nodes().map(ResourceNode::name).collect();
        assert_eq!(names, vec!["vpc", "sg"]);

        let diagram = orchestrator.render_mermaid();
        assert!(diagram.contains("\"vpc\""));
        assert!(diagram.contains("0 -- \"alloc::string::String\" --> 1"));
    }
}
