use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cell::AnyCell;
use crate::core::{ActionContext, ArcStr, Dynamic};
use crate::error::{Failure, NodeError};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) trait TypedAction<G: Send + Sync>: Send + Sync {
    /// The concrete output type of this action.
    type Output: Send + Sync + 'static;

    fn run(
        &self,
        context: ActionContext<G>,
        inputs: &[Dynamic],
    ) -> BoxFuture<anyhow::Result<Self::Output>>;
}

/// The type-erased foundation that allows the graph to hold resources with
/// different output types.
pub(crate) trait Action<G: Send + Sync>: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    fn run(&self, context: ActionContext<G>, inputs: &[Dynamic]) -> BoxFuture<anyhow::Result<Dynamic>>;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<G, T> Action<G> for T
where
    G: Send + Sync,
    T: TypedAction<G> + 'static,
{
    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<T::Output>()
    }

    fn run(&self, context: ActionContext<G>, inputs: &[Dynamic]) -> BoxFuture<anyhow::Result<Dynamic>> {
        let future = T::run(self, context, inputs);
        Box::pin(async move { Ok(Arc::new(future.await?) as Dynamic) })
    }
}

/// Lifecycle of a [`ResourceNode`] within one run.
///
/// `Created → Waiting → Scheduled → {Completed | Failed}`. A waiting node
/// whose predecessor or input failed goes straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Created,
    Waiting,
    Scheduled,
    Completed,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }
}

/// A provisioning action with declared predecessors and input cells.
///
/// Nodes are created through [`Blueprint::resource`](crate::Blueprint::resource)
/// and driven exclusively by the [`Orchestrator`](crate::Orchestrator).
pub struct ResourceNode<G: Send + Sync = ()> {
    name: ArcStr,
    after: Vec<ArcStr>,
    inputs: Vec<AnyCell>,
    output: AnyCell,
    action: Arc<dyn Action<G>>,
    state: NodeState,
}

impl<G: Send + Sync> ResourceNode<G> {
    pub(crate) fn new(
        name: ArcStr,
        after: Vec<ArcStr>,
        inputs: Vec<AnyCell>,
        output: AnyCell,
        action: Arc<dyn Action<G>>,
    ) -> Self {
        Self {
            name,
            after,
            inputs,
            output,
            action,
            state: NodeState::Created,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> ArcStr {
        self.name.clone()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Names of the resources that must complete before this one starts.
    pub fn predecessors(&self) -> &[ArcStr] {
        &self.after
    }

    pub fn inputs(&self) -> &[AnyCell] {
        &self.inputs
    }

    pub fn output(&self) -> &AnyCell {
        &self.output
    }

    pub fn output_type_name(&self) -> &'static str {
        self.action.output_type_name()
    }

    pub(crate) fn wait(&mut self) {
        if self.state == NodeState::Created {
            self.state = NodeState::Waiting;
        }
    }

    /// First input, in declaration order, that settled with a failure.
    pub(crate) fn failed_input(&self) -> Option<Failure> {
        self.inputs.iter().find_map(AnyCell::failure)
    }

    pub(crate) fn inputs_resolved(&self) -> bool {
        self.inputs.iter().all(AnyCell::is_resolved)
    }

    /// Start the action. Legal only while `Waiting`, once every predecessor
    /// has completed and every input has resolved; the returned future is the
    /// one and only invocation of the action for this run.
    ///
    /// `predecessors` are the current states of the nodes this one was
    /// declared to come after.
    pub(crate) fn schedule(
        &mut self,
        predecessors: &[NodeState],
        context: ActionContext<G>,
    ) -> Result<BoxFuture<anyhow::Result<Dynamic>>, NodeError> {
        let not_ready = |reason| NodeError::NotReady {
            node: self.name.clone(),
            reason,
        };

        if self.state != NodeState::Waiting {
            return Err(not_ready("not waiting"));
        }
        if predecessors.iter().any(|state| *state != NodeState::Completed) {
            return Err(not_ready("predecessors have not completed"));
        }

        let mut values = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            match input.peek() {
                Some(Ok(value)) => values.push(value),
                _ => return Err(not_ready("inputs are not resolved")),
            }
        }

        self.state = NodeState::Scheduled;
        Ok(self.action.run(context, &values))
    }

    pub(crate) fn complete(&mut self, value: Dynamic) {
        if self.state != NodeState::Scheduled {
            tracing::error!(resource = %self.name, state = ?self.state, "completion for a node that was not scheduled");
            return;
        }
        self.state = NodeState::Completed;
        if let Err(err) = self.output.settle(Ok(value)) {
            tracing::error!("{err}");
        }
    }

    pub(crate) fn fail(&mut self, failure: Failure) {
        if self.state.is_terminal() {
            return;
        }
        self.state = NodeState::Failed;
        if let Err(err) = self.output.settle(Err(failure)) {
            tracing::error!("{err}");
        }
    }
}

impl<G: Send + Sync> std::fmt::Debug for ResourceNode<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("inputs", &self.inputs)
            .field("state", &self.state)
            .finish()
    }
}
