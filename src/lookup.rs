//! Asynchronous lookups of platform state.
//!
//! A lookup is a derived cell whose value has to be queried from the outside
//! world, e.g. finding a load balancer by name. Unlike a transform it runs as
//! a task on the orchestrator, is retried with backoff while the platform is
//! still catching up, and is started at most once per cell.

use std::future::Future;
use std::sync::Arc;

use crate::cell::{Inputs, ValueCell, merge_origins, when_all};
use crate::core::{ArcStr, Dynamic};
use crate::engine::{Dispatcher, LookupJob};
use crate::error::{Failure, LookupError};
use crate::retry::{RetryPolicy, retry_lookup};

/// Lift an asynchronous, fallible query over `inputs`.
///
/// Once every input resolves, a job is handed to the orchestrator through
/// `dispatcher`; the job calls `f` under `policy` and settles the returned
/// cell with the outcome. If any input fails, the returned cell fails with the
/// same [`Failure`] and `f` is never called.
pub fn lift_async<I, R, F, Fut>(
    label: impl Into<ArcStr>,
    inputs: I,
    policy: RetryPolicy,
    dispatcher: &Dispatcher,
    f: F,
) -> ValueCell<R>
where
    I: Inputs,
    I::Values: Clone + Sync,
    R: Send + Sync + 'static,
    F: Fn(I::Values) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, LookupError>> + Send + 'static,
{
    let cells = inputs.cells();
    let output = ValueCell::with_origins(label.into(), merge_origins(&cells));
    let cell = output.erase();
    let dispatcher = dispatcher.clone();

    when_all(cells, move |outcome| match outcome {
        Ok(values) => {
            let values = I::extract(&values);
            let label = cell.label_arc();
            let job = LookupJob::new(cell, async move {
                let (attempts, result) = retry_lookup(&policy, &label, || f(values.clone())).await;
                let settled = result
                    .map(|value| Arc::new(value) as Dynamic)
                    .map_err(|cause| Failure::new(label, cause));
                (attempts, settled)
            });

            if let Err(err) = dispatcher.submit(job) {
                tracing::error!("{err}");
            }
        }
        Err(failure) => {
            if let Err(err) = cell.settle(Err(failure)) {
                tracing::error!("lookup written by someone else: {err}");
            }
        }
    });

    output
}
