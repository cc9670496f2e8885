use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::ArcStr;

/// Errors raised while building a [`Blueprint`](crate::Blueprint) into an
/// [`Orchestrator`](crate::Orchestrator). Any of these aborts the run before a
/// single resource is touched.
#[derive(Debug, Error)]
pub enum KumoError {
    #[error("Missing required configuration value '{0}'")]
    Configuration(String),

    #[error("Invalid configuration value '{key}': {reason}")]
    InvalidConfiguration { key: String, reason: String },

    #[error("Couldn't read configuration file.\n{0}")]
    ConfigRead(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Resource '{0}' is declared more than once")]
    DuplicateNode(ArcStr),

    #[error("Resource '{node}' depends on unknown resource '{missing}'")]
    UnknownDependency { node: ArcStr, missing: ArcStr },

    #[error("Cyclic dependency between resources: {}", .0.join(" -> "))]
    CyclicDependency(Vec<ArcStr>),
}

/// Misuse of a [`ValueCell`](crate::ValueCell).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("Cell '{0}' was settled twice")]
    DoubleResolution(ArcStr),
}

/// Misuse of a [`ResourceNode`](crate::ResourceNode) lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Resource '{node}' is not ready: {reason}")]
    NotReady { node: ArcStr, reason: &'static str },
}

/// Typed error returned by platform queries.
///
/// `NotFound`, `Throttled` and `Transient` are retried by a lookup until its
/// attempt budget runs out, everything else fails the lookup immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("lookup for cell '{0}' is already in flight")]
    Duplicate(ArcStr),
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LookupError::NotFound(_) | LookupError::Throttled(_) | LookupError::Transient(_)
        )
    }
}

/// Root cause carried by a failed cell or node.
#[derive(Debug, Error)]
pub enum Cause {
    #[error("lookup failed permanently: {0}")]
    LookupPermanent(LookupError),

    #[error("lookup gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: LookupError },

    #[error("resource action failed: {0:#}")]
    ResourceActionFailed(anyhow::Error),

    #[error("derivation rejected its input: {0:#}")]
    Derivation(anyhow::Error),

    #[error("run timed out")]
    Timeout,

    #[error("nothing left that could resolve this value")]
    Stalled,

    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// A failure as observed by a cell or node: the root [`Cause`] and the label
/// of the node or cell where it originated.
///
/// Propagation clones the `Failure` verbatim, so every descendant of a failed
/// branch reports the same origin.
#[derive(Debug, Clone)]
pub struct Failure {
    origin: ArcStr,
    cause: Arc<Cause>,
}

impl Failure {
    pub fn new(origin: impl Into<ArcStr>, cause: Cause) -> Self {
        Self {
            origin: origin.into(),
            cause: Arc::new(cause),
        }
    }

    /// Label of the cell or node where the failure started.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    pub fn is_timeout(&self) -> bool {
        matches!(*self.cause, Cause::Timeout)
    }

    /// Whether two failures are the very same propagated value.
    pub fn same_as(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.cause)
    }
}

impl std::error::Error for Failure {}
