use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::report::{Execution, LookupReport, NodeReport, Report};
use super::{Edge, Event, LookupJob, Orchestrator};
use crate::cell::{AnyCell, Settled};
use crate::core::{ActionContext, ArcStr, Dynamic};
use crate::error::{Cause, Failure};
use crate::node::NodeState;

/// What a finished task hands back to the scheduler loop.
enum Landed {
    Resource(anyhow::Result<Dynamic>),
    Lookup(u32, Settled),
}

enum Target {
    Resource(NodeIndex),
    Lookup(AnyCell),
}

struct Flight {
    target: Target,
    label: ArcStr,
    start: Instant,
}

/// Mutable bookkeeping of a single run.
struct Run {
    tasks: JoinSet<Landed>,
    flights: HashMap<Id, Flight>,
    executions: HashMap<NodeIndex, Execution>,
    lookups: Vec<LookupReport>,
    timed_out: bool,
    span: tracing::Span,
    style: ProgressStyle,
}

impl<G: Send + Sync + 'static> Orchestrator<G> {
    /// Applies the graph and returns a report of what happened.
    ///
    /// The algorithm works as follows:
    /// 1. Every node starts waiting, and a continuation on each of its input
    ///    cells notifies the orchestrator's inbox when the cell settles.
    /// 2. Whenever a node is notified, or one of its predecessors reaches a
    ///    terminal state, it is evaluated: a failed predecessor or input fails
    ///    it with the same failure, otherwise it is scheduled once all its
    ///    predecessors completed and all its inputs resolved.
    /// 3. Resource actions and lookups run as tasks in a `JoinSet`; the loop
    ///    waits for either a task to finish, a new inbox event or the
    ///    deadline.
    /// 4. On the deadline every in-flight task is aborted and fails with
    ///    `Timeout`, as does everything that becomes ready afterwards.
    /// 5. The loop ends once every node is terminal. If nothing is in flight
    ///    and nothing can make progress anymore, the remaining nodes fail as
    ///    stalled.
    ///
    /// The run itself never fails; failures are reported per node.
    pub async fn run(mut self) -> Report {
        let started = Instant::now();

        let span = tracing::span!(Level::INFO, "apply", stack = %self.env.stack);
        span.pb_set_length(self.graph.node_count() as u64);
        span.pb_set_style(&crate::utils::get_style_run());
        span.pb_set_message("Provisioning resources...");

        let mut run = Run {
            tasks: JoinSet::new(),
            flights: HashMap::new(),
            executions: HashMap::new(),
            lookups: Vec::new(),
            timed_out: false,
            span: span.clone(),
            style: crate::utils::get_style_task(),
        };

        self.drive(&mut run).instrument(span).await;

        let report = self.report(run, started.elapsed());
        match report.failed_branches().len() {
            0 => tracing::info!("Applied {} resources in {:.2?}", report.nodes.len(), report.elapsed),
            n => tracing::error!("{n} failed branches, see the report for details"),
        }
        report
    }

    async fn drive(&mut self, run: &mut Run) {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        for index in self.graph.node_indices() {
            self.graph[index].wait();
            for cell in self.graph[index].inputs() {
                let dispatcher = self.dispatcher.clone();
                cell.on_settled(move |outcome| dispatcher.notify(index, outcome.as_ref().err().cloned()));
            }
        }

        let order = self.order.clone();
        self.advance(order, None, run);

        loop {
            while let Ok(event) = self.inbox.try_recv() {
                self.handle(event, run);
            }

            if run.flights.is_empty() {
                if self.graph.node_weights().all(|node| node.state().is_terminal()) {
                    break;
                }
                if run.timed_out || deadline.is_none() {
                    self.stall(run);
                    continue;
                }
            }

            tokio::select! {
                Some(event) = self.inbox.recv() => self.handle(event, run),
                Some(joined) = run.tasks.join_next_with_id(), if !run.tasks.is_empty() => {
                    self.land(joined, run)
                }
                _ = until(deadline), if deadline.is_some() && !run.timed_out => self.time_out(run),
                else => break,
            }
        }
    }

    fn handle(&mut self, event: Event, run: &mut Run) {
        match event {
            Event::Input { node, failure } => self.advance(vec![node], failure, run),
            Event::Lookup(job) => self.launch_lookup(job, run),
        }
    }

    /// Evaluates `queue` and, transitively, the successors of every node that
    /// failed along the way.
    fn advance(&mut self, queue: Vec<NodeIndex>, mut hint: Option<Failure>, run: &mut Run) {
        let mut queue = VecDeque::from(queue);
        while let Some(index) = queue.pop_front() {
            if self.evaluate(index, hint.take(), run) {
                queue.extend(self.successors(index));
            }
        }
    }

    /// Returns `true` if the node failed.
    fn evaluate(&mut self, index: NodeIndex, hint: Option<Failure>, run: &mut Run) -> bool {
        if self.graph[index].state() != NodeState::Waiting {
            return false;
        }

        let mut ready = true;
        let mut upstream = hint;
        for edge in self.graph.edges_directed(index, Direction::Incoming) {
            if *edge.weight() != Edge::After {
                continue;
            }
            let pred = &self.graph[edge.source()];
            match pred.state() {
                NodeState::Completed => {}
                NodeState::Failed => upstream = upstream.or_else(|| pred.output().failure()),
                _ => ready = false,
            }
        }

        if let Some(failure) = upstream.or_else(|| self.graph[index].failed_input()) {
            self.fail(index, failure, run);
            return true;
        }

        if !ready || !self.graph[index].inputs_resolved() {
            return false;
        }

        if run.timed_out {
            let name = self.graph[index].name_arc();
            self.fail(index, Failure::new(name, Cause::Timeout), run);
            return true;
        }

        self.launch(index, run);
        false
    }

    fn launch(&mut self, index: NodeIndex, run: &mut Run) {
        let predecessors = self.predecessor_states(index);
        let node = &mut self.graph[index];
        let name = node.name_arc();

        let span = tracing::span!(parent: &run.span, Level::INFO, "resource", name = %name);
        span.pb_set_style(&run.style);
        span.pb_set_message(&format!("Provisioning {name}"));

        let context = ActionContext {
            env: self.env.clone(),
            node: name.clone(),
            span: span.clone(),
        };

        match node.schedule(&predecessors, context) {
            Ok(future) => {
                tracing::info!(resource = %name, "provisioning");
                let handle = run
                    .tasks
                    .spawn(async move { Landed::Resource(future.await) }.instrument(span));
                run.flights.insert(
                    handle.id(),
                    Flight {
                        target: Target::Resource(index),
                        label: name,
                        start: Instant::now(),
                    },
                );
            }
            Err(err) => tracing::error!("{err}"),
        }
    }

    fn launch_lookup(&mut self, job: LookupJob, run: &mut Run) {
        let (cell, future) = job.into_parts();
        let label = cell.label_arc();

        if run.timed_out {
            settle(&cell, Err(Failure::new(label, Cause::Timeout)));
            return;
        }

        let span = tracing::span!(parent: &run.span, Level::INFO, "lookup", name = %label);
        span.pb_set_style(&run.style);
        span.pb_set_message(&format!("Looking up {label}"));

        let handle = run.tasks.spawn(
            async move {
                let (attempts, settled) = future.await;
                Landed::Lookup(attempts, settled)
            }
            .instrument(span),
        );
        run.flights.insert(
            handle.id(),
            Flight {
                target: Target::Lookup(cell),
                label,
                start: Instant::now(),
            },
        );
    }

    fn land(&mut self, joined: Result<(Id, Landed), JoinError>, run: &mut Run) {
        let (id, landed) = match joined {
            Ok(done) => done,
            Err(err) => {
                // Aborted tasks were already failed when the deadline passed.
                let Some(flight) = run.flights.remove(&err.id()) else {
                    return;
                };
                let message = if err.is_panic() {
                    panic_message(err.into_panic())
                } else {
                    String::from("task was cancelled")
                };
                return self.crash(flight, message, run);
            }
        };

        let Some(flight) = run.flights.remove(&id) else {
            return;
        };
        let duration = flight.start.elapsed();

        match (flight.target, landed) {
            (Target::Resource(index), Landed::Resource(result)) => {
                run.executions.insert(
                    index,
                    Execution {
                        start: flight.start,
                        duration,
                    },
                );
                match result {
                    Ok(value) => {
                        tracing::info!(resource = %flight.label, elapsed = ?duration, "provisioned");
                        self.graph[index].complete(value);
                        run.span.pb_inc(1);
                    }
                    Err(err) => {
                        let failure = Failure::new(flight.label, Cause::ResourceActionFailed(err));
                        self.fail(index, failure, run);
                    }
                }
                self.advance(self.successors(index), None, run);
            }
            (Target::Lookup(cell), Landed::Lookup(attempts, settled)) => {
                run.lookups.push(LookupReport {
                    label: flight.label,
                    attempts,
                    duration,
                    failure: settled.as_ref().err().cloned(),
                });
                settle(&cell, settled);
            }
            _ => tracing::error!(task = %flight.label, "task landed with a mismatched outcome"),
        }
    }

    fn crash(&mut self, flight: Flight, message: String, run: &mut Run) {
        match flight.target {
            Target::Resource(index) => {
                let cause = Cause::ResourceActionFailed(anyhow::anyhow!(message));
                self.fail(index, Failure::new(flight.label, cause), run);
                self.advance(self.successors(index), None, run);
            }
            Target::Lookup(cell) => {
                settle(&cell, Err(Failure::new(flight.label, Cause::Cancelled(message))));
            }
        }
    }

    fn time_out(&mut self, run: &mut Run) {
        run.timed_out = true;
        tracing::error!(in_flight = run.flights.len(), "deadline passed, cancelling");

        run.tasks.abort_all();
        let flights: Vec<Flight> = run.flights.drain().map(|(_, flight)| flight).collect();

        for flight in flights {
            let failure = Failure::new(flight.label.clone(), Cause::Timeout);
            match flight.target {
                Target::Resource(index) => {
                    run.executions.insert(
                        index,
                        Execution {
                            start: flight.start,
                            duration: flight.start.elapsed(),
                        },
                    );
                    self.fail(index, failure, run);
                    self.advance(self.successors(index), None, run);
                }
                Target::Lookup(cell) => settle(&cell, Err(failure)),
            }
        }
    }

    /// Nothing is in flight and nothing can arrive anymore: whatever is still
    /// waiting will wait forever.
    fn stall(&mut self, run: &mut Run) {
        let order = self.order.clone();
        for index in order {
            self.advance(vec![index], None, run);
            if self.graph[index].state() != NodeState::Waiting {
                continue;
            }

            let name = self.graph[index].name_arc();
            let cause = match run.timed_out {
                true => Cause::Timeout,
                false => Cause::Stalled,
            };
            self.fail(index, Failure::new(name, cause), run);
            self.advance(self.successors(index), None, run);
        }
    }

    fn fail(&mut self, index: NodeIndex, failure: Failure, run: &mut Run) {
        let node = &mut self.graph[index];
        if node.state().is_terminal() {
            return;
        }

        if failure.origin() == node.name() {
            tracing::error!(resource = %node.name(), "{}", failure.cause());
        } else {
            tracing::warn!(resource = %node.name(), origin = %failure.origin(), "skipped, upstream failed");
        }

        node.fail(failure);
        run.span.pb_inc(1);
    }

    /// States of the nodes `index` was declared to come after.
    fn predecessor_states(&self, index: NodeIndex) -> Vec<NodeState> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| *edge.weight() == Edge::After)
            .map(|edge| self.graph[edge.source()].state())
            .collect()
    }

    fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect()
    }

    fn report(&self, run: Run, elapsed: Duration) -> Report {
        let nodes = self
            .order
            .iter()
            .map(|&index| {
                let node = &self.graph[index];
                NodeReport {
                    name: node.name_arc(),
                    state: node.state(),
                    failure: node.output().failure(),
                    execution: run.executions.get(&index).cloned(),
                }
            })
            .collect();

        let edges = self
            .graph
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].name_arc(),
                    self.graph[edge.target()].name_arc(),
                    *edge.weight(),
                )
            })
            .collect();

        Report {
            nodes,
            edges,
            lookups: run.lookups,
            elapsed,
            timed_out: run.timed_out,
        }
    }
}

fn settle(cell: &AnyCell, outcome: Settled) {
    if let Err(err) = cell.settle(outcome) {
        tracing::error!("{err}");
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("action panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("action panicked: {s}")
    } else {
        String::from("action panicked with unknown payload")
    }
}
