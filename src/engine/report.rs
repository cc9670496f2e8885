use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use console::style;
use tokio::time::Instant;

use super::Edge;
use crate::core::ArcStr;
use crate::error::Failure;
use crate::node::NodeState;

#[derive(Debug, Clone)]
pub struct Execution {
    pub start: Instant,
    pub duration: Duration,
}

/// Final state of one resource.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub name: ArcStr,
    pub state: NodeState,
    /// Why the resource failed; the origin may be an upstream resource.
    pub failure: Option<Failure>,
    /// Set only for resources whose action actually ran.
    pub execution: Option<Execution>,
}

#[derive(Debug, Clone)]
pub struct LookupReport {
    pub label: ArcStr,
    pub attempts: u32,
    pub duration: Duration,
    pub failure: Option<Failure>,
}

/// Resources that failed because of the same root failure.
#[derive(Debug, Clone)]
pub struct BranchFailure {
    pub origin: ArcStr,
    pub failure: Failure,
    pub nodes: Vec<ArcStr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// Result of [`Orchestrator::run`](crate::Orchestrator::run).
///
/// Nodes are listed in topological order.
#[derive(Debug)]
pub struct Report {
    pub nodes: Vec<NodeReport>,
    pub edges: Vec<(ArcStr, ArcStr, Edge)>,
    pub lookups: Vec<LookupReport>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl Report {
    /// `Completed` only if every resource completed.
    pub fn outcome(&self) -> Outcome {
        match self.nodes.iter().all(|node| node.state == NodeState::Completed) {
            true => Outcome::Completed,
            false => Outcome::Failed,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| &*node.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        self.node(name).map(|node| node.state)
    }

    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|node| node.state == NodeState::Completed)
            .map(|node| node.name.as_ref())
    }

    /// Failed resources grouped by the root failure they share, in the order
    /// the roots appear in the graph.
    pub fn failed_branches(&self) -> Vec<BranchFailure> {
        let mut branches: Vec<BranchFailure> = Vec::new();

        for node in &self.nodes {
            let Some(failure) = &node.failure else {
                continue;
            };
            match branches.iter_mut().find(|branch| branch.failure.same_as(failure)) {
                Some(branch) => branch.nodes.push(node.name.clone()),
                None => branches.push(BranchFailure {
                    origin: failure.origin().into(),
                    failure: failure.clone(),
                    nodes: vec![node.name.clone()],
                }),
            }
        }

        branches
    }

    /// Renders the applied graph as a Mermaid diagram, color-coded by state.
    ///
    /// * **Green**: Completed
    /// * **Red**: Failed at this resource
    /// * **Orange**: Failed because of an upstream resource
    /// * **Grey**: Never finished
    pub fn render_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.name.replace('"', "\\\"");
            let label_extra = match (&node.execution, &node.failure) {
                (_, Some(failure)) if failure.origin() != &*node.name => {
                    format!("skipped: {}", failure.origin())
                }
                (Some(exec), _) => format!("{:.2?}", exec.duration),
                (None, _) => String::from("-"),
            };
            let color = match (node.state, &node.failure) {
                (NodeState::Completed, _) => "#90EE90",
                (NodeState::Failed, Some(failure)) if failure.origin() == &*node.name => "#FF6B6B",
                (NodeState::Failed, _) => "#FFB347",
                _ => "#D3D3D3",
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{label_extra}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        let position = |name: &ArcStr| self.nodes.iter().position(|node| &node.name == name);
        for (source, target, edge) in &self.edges {
            let (Some(s), Some(t)) = (position(source), position(target)) else {
                continue;
            };
            let arrow = match edge {
                Edge::After => "-.->",
                Edge::Value => "-->",
            };
            let _ = writeln!(f, "    {s} {arrow} {t}");
        }

        f
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            match (node.state, &node.failure) {
                (NodeState::Completed, _) => {
                    let took = node
                        .execution
                        .as_ref()
                        .map(|exec| format!(" ({:.2?})", exec.duration))
                        .unwrap_or_default();
                    writeln!(f, "{} {}{}", style("✓").green(), node.name, style(took).dim())?;
                }
                (_, Some(failure)) if failure.origin() == &*node.name => {
                    writeln!(f, "{} {}: {}", style("✗").red(), node.name, failure.cause())?;
                }
                (_, Some(failure)) => {
                    writeln!(
                        f,
                        "{} {} {}",
                        style("-").yellow(),
                        node.name,
                        style(format!("(skipped, {} failed)", failure.origin())).dim()
                    )?;
                }
                (state, None) => writeln!(f, "{} {} ({state:?})", style("?").dim(), node.name)?,
            }
        }

        for lookup in &self.lookups {
            if lookup.attempts > 1 {
                writeln!(
                    f,
                    "{}",
                    style(format!(
                        "  lookup {} took {} attempts ({:.2?})",
                        lookup.label, lookup.attempts, lookup.duration
                    ))
                    .dim()
                )?;
            }
        }

        let completed = self.completed().count();
        let summary = format!(
            "{completed}/{} resources provisioned in {:.2?}{}",
            self.nodes.len(),
            self.elapsed,
            if self.timed_out { ", deadline exceeded" } else { "" }
        );
        match self.outcome() {
            Outcome::Completed => write!(f, "{}", style(summary).green().bold()),
            Outcome::Failed => write!(f, "{}", style(summary).red().bold()),
        }
    }
}
