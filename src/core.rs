use std::any::Any;
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = Arc<str>;

/// Global data available to every resource action during a run.
///
/// # Type Parameters
///
/// * `D`: The type of the user-defined global data, usually the resolved
///   [`Settings`](crate::config::Settings). Must be `Send + Sync`.
#[derive(Clone)]
pub struct Environment<D: Send + Sync = ()> {
    /// Logical name of the stack being applied.
    pub stack: String,
    /// User-defined global data.
    pub data: D,
}

impl<D: Send + Sync> Environment<D> {
    pub fn new(stack: impl Into<String>, data: D) -> Self {
        Self {
            stack: stack.into(),
            data,
        }
    }
}

impl<G: Send + Sync> std::fmt::Debug for Environment<G>
where
    G: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("stack", &self.stack)
            .field("data", &self.data)
            .finish()
    }
}

/// Handed to a resource action when the orchestrator schedules it.
///
/// The context is owned so that the action's future can be `'static` and run
/// as an independent task.
pub struct ActionContext<G: Send + Sync = ()> {
    /// The run environment.
    pub env: Arc<Environment<G>>,
    /// Name of the resource being provisioned.
    pub node: ArcStr,
    /// The tracing span of this action, with an attached spinner.
    pub span: tracing::Span,
}

impl<G: Send + Sync> ActionContext<G> {
    /// Shortcut for `ctx.env.data`.
    pub fn data(&self) -> &G {
        &self.env.data
    }

    /// Prefix `name` with the stack name, e.g. `veridid-api`.
    pub fn scoped(&self, name: &str) -> String {
        format!("{}-{}", self.env.stack, name)
    }
}
