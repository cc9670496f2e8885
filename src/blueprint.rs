use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::cell::{Inputs, ValueCell};
use crate::core::{ActionContext, ArcStr, Dynamic, Environment};
use crate::engine::{Dispatcher, Event, Orchestrator};
use crate::error::KumoError;
use crate::lookup::lift_async;
use crate::node::{BoxFuture, ResourceNode, TypedAction};
use crate::retry::RetryPolicy;

/// The blueprint for your stack.
///
/// `Blueprint` is used to declare the resources of a stack and wire them
/// together through their output cells. Lookups and transforms derive new
/// cells from existing ones.
///
/// Once configured, you convert this into an [`Orchestrator`] to apply it.
///
/// # Example
///
/// ```rust
/// use kumo::{Blueprint, Environment};
///
/// let mut plan = Blueprint::new(Environment::new("demo", ()));
/// let vpc = plan.resource("vpc").run(|_| async { Ok(String::from("vpc-0a1b")) });
/// plan.resource("sg")
///     .using(vpc)
///     .run(|ctx, vpc| async move { Ok(format!("{} in {vpc}", ctx.scoped("sg"))) });
///
/// let orchestrator = plan.finish().unwrap();
/// assert_eq!(orchestrator.len(), 2);
/// ```
pub struct Blueprint<G: Send + Sync = ()> {
    env: Environment<G>,
    nodes: Vec<ResourceNode<G>>,
    dispatcher: Dispatcher,
    inbox: UnboundedReceiver<Event>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl<G: Send + Sync + 'static> Blueprint<G> {
    pub fn new(env: Environment<G>) -> Self {
        let (dispatcher, inbox) = Dispatcher::channel();
        Self {
            env,
            nodes: Vec::new(),
            dispatcher,
            inbox,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Default policy for lookups that do not set their own.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Overall deadline of the run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(&self) -> &Environment<G> {
        &self.env
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// An already resolved cell, e.g. a configuration value.
    pub fn constant<T>(&self, label: impl Into<ArcStr>, value: T) -> ValueCell<T>
    where
        T: Send + Sync + 'static,
    {
        ValueCell::resolved(label, value)
    }

    /// Like [`Blueprint::constant`], but a missing value is a configuration
    /// error reported before anything is provisioned.
    pub fn require<T>(&self, label: &str, value: Option<T>) -> Result<ValueCell<T>, KumoError>
    where
        T: Send + Sync + 'static,
    {
        match value {
            Some(value) => Ok(ValueCell::resolved(label, value)),
            None => Err(KumoError::Configuration(label.to_owned())),
        }
    }

    /// The entry point for declaring a resource.
    pub fn resource(&mut self, name: impl Into<ArcStr>) -> ResourceDef<'_, G> {
        ResourceDef {
            blueprint: self,
            name: name.into(),
            after: Vec::new(),
        }
    }

    /// The entry point for declaring a lookup.
    pub fn lookup(&self, label: impl Into<ArcStr>) -> LookupDef<'_, G> {
        LookupDef {
            blueprint: self,
            label: label.into(),
            policy: None,
        }
    }

    /// Validates the graph: names are unique, every predecessor exists and
    /// there are no cycles.
    pub fn finish(self) -> Result<Orchestrator<G>, KumoError> {
        Orchestrator::build(self.env, self.nodes, self.dispatcher, self.inbox, self.timeout)
    }

    fn add_resource<I, R, F, Fut>(&mut self, name: ArcStr, after: Vec<ArcStr>, inputs: I, callback: F) -> ValueCell<R>
    where
        I: Inputs,
        R: Send + Sync + 'static,
        F: Fn(ActionContext<G>, I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let output = ValueCell::<R>::with_origins(name.clone(), Arc::from(vec![name.clone()]));
        let node = ResourceNode::new(
            name,
            after,
            inputs.cells(),
            output.erase(),
            Arc::new(ActionNode {
                callback,
                _phantom: PhantomData::<fn(I) -> R>,
            }),
        );
        self.nodes.push(node);
        output
    }
}

pub struct ResourceDef<'a, G: Send + Sync> {
    blueprint: &'a mut Blueprint<G>,
    name: ArcStr,
    after: Vec<ArcStr>,
}

impl<'a, G: Send + Sync + 'static> ResourceDef<'a, G> {
    /// Resources that must complete before this one starts, whether or not
    /// their outputs are used.
    pub fn after<S: Into<ArcStr>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.after.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn using<I: Inputs>(self, inputs: I) -> ResourceBinder<'a, G, I> {
        ResourceBinder {
            blueprint: self.blueprint,
            name: self.name,
            after: self.after,
            inputs,
        }
    }

    pub fn run<F, Fut, R>(self, callback: F) -> ValueCell<R>
    where
        F: Fn(ActionContext<G>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.using(()).run(move |ctx, ()| callback(ctx))
    }
}

pub struct ResourceBinder<'a, G: Send + Sync, I: Inputs> {
    blueprint: &'a mut Blueprint<G>,
    name: ArcStr,
    after: Vec<ArcStr>,
    inputs: I,
}

impl<'a, G: Send + Sync + 'static, I: Inputs> ResourceBinder<'a, G, I> {
    pub fn after<S: Into<ArcStr>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.after.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declares the action and returns the resource's output cell.
    pub fn run<F, Fut, R>(self, callback: F) -> ValueCell<R>
    where
        F: Fn(ActionContext<G>, I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.blueprint
            .add_resource(self.name, self.after, self.inputs, callback)
    }
}

pub struct LookupDef<'a, G: Send + Sync> {
    blueprint: &'a Blueprint<G>,
    label: ArcStr,
    policy: Option<RetryPolicy>,
}

impl<'a, G: Send + Sync + 'static> LookupDef<'a, G> {
    /// Overrides the blueprint's default retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn using<I: Inputs>(self, inputs: I) -> LookupBinder<'a, G, I> {
        LookupBinder {
            blueprint: self.blueprint,
            label: self.label,
            policy: self.policy,
            inputs,
        }
    }
}

pub struct LookupBinder<'a, G: Send + Sync, I: Inputs> {
    blueprint: &'a Blueprint<G>,
    label: ArcStr,
    policy: Option<RetryPolicy>,
    inputs: I,
}

impl<'a, G: Send + Sync + 'static, I: Inputs> LookupBinder<'a, G, I>
where
    I::Values: Clone + Sync,
{
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn run<F, Fut, R>(self, query: F) -> ValueCell<R>
    where
        F: Fn(I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, crate::error::LookupError>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        let policy = self.policy.unwrap_or_else(|| self.blueprint.retry.clone());
        lift_async(self.label, self.inputs, policy, &self.blueprint.dispatcher, query)
    }
}

/// The concrete action behind a resource declared with a closure.
struct ActionNode<F, I, R> {
    callback: F,
    _phantom: PhantomData<fn(I) -> R>,
}

impl<G, F, Fut, I, R> TypedAction<G> for ActionNode<F, I, R>
where
    G: Send + Sync + 'static,
    I: Inputs,
    R: Send + Sync + 'static,
    F: Fn(ActionContext<G>, I::Values) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    type Output = R;

    fn run(&self, context: ActionContext<G>, inputs: &[Dynamic]) -> BoxFuture<anyhow::Result<R>> {
        Box::pin((self.callback)(context, I::extract(inputs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_missing_value() {
        let plan = Blueprint::new(Environment::new("test", ()));

        let present = plan.require("region", Some(String::from("ca-central-1"))).unwrap();
        assert_eq!(*present.get().unwrap(), "ca-central-1");

        match plan.require::<String>("cognito-client-id", None) {
            Err(KumoError::Configuration(key)) => assert_eq!(key, "cognito-client-id"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_resource_output_originates_at_resource() {
        let mut plan = Blueprint::new(Environment::new("test", ()));
        let vpc = plan.resource("vpc").run(|_| async { Ok(1u8) });

        let cell = vpc.erase();
        let origins: Vec<&str> = cell.origins().iter().map(|o| o.as_ref()).collect();
        assert_eq!(origins, vec!["vpc"]);
        assert_eq!(vpc.label(), "vpc");
        assert!(vpc.is_pending());
    }

    #[test]
    fn test_lookup_uses_default_policy() {
        let plan = Blueprint::new(Environment::new("test", ())).with_retry_policy(RetryPolicy::once());
        let name = plan.constant("lb-name", String::from("abc123"));

        let arn = plan
            .lookup("lb-arn")
            .using(name)
            .run(|name| async move { Ok(format!("arn/{name}")) });

        assert_eq!(arn.label(), "lb-arn");
        assert!(arn.is_pending());
    }
}
