//! Pure derivations between cells.
//!
//! A transform waits until every input cell resolves and then runs its
//! function synchronously, on whichever thread settled the last input. It has
//! no side effects, so it is never retried: the only way for its output to
//! fail is for one of its ancestors to fail first, or for a [`try_lift`]
//! function to reject a malformed input.

use std::sync::Arc;

use crate::cell::{Inputs, ValueCell, merge_origins, when_all};
use crate::core::{ArcStr, Dynamic};
use crate::error::{Cause, Failure};

/// Lift a pure function over `inputs`.
///
/// The returned cell resolves with `f(values)` once all inputs are resolved,
/// or fails with the first observed ancestor failure as soon as any input
/// fails.
///
/// ```rust
/// use kumo::{ValueCell, transform::lift};
///
/// let host = ValueCell::resolved("host", String::from("lb-1.example.com"));
/// let port = ValueCell::resolved("port", 443u16);
///
/// let url = lift("url", (host, port), |(host, port)| format!("https://{host}:{port}"));
/// assert_eq!(*url.get().unwrap(), "https://lb-1.example.com:443");
/// ```
pub fn lift<I, R, F>(label: impl Into<ArcStr>, inputs: I, f: F) -> ValueCell<R>
where
    I: Inputs,
    R: Send + Sync + 'static,
    F: FnOnce(I::Values) -> R + Send + 'static,
{
    try_lift(label, inputs, move |values| Ok(f(values)))
}

/// Like [`lift`], but the function may reject its input. A rejection fails
/// the output cell with [`Cause::Derivation`], originating at this cell.
pub fn try_lift<I, R, F>(label: impl Into<ArcStr>, inputs: I, f: F) -> ValueCell<R>
where
    I: Inputs,
    R: Send + Sync + 'static,
    F: FnOnce(I::Values) -> anyhow::Result<R> + Send + 'static,
{
    let cells = inputs.cells();
    let output = ValueCell::with_origins(label.into(), merge_origins(&cells));
    let cell = output.erase();

    when_all(cells, move |outcome| {
        let settled = match outcome {
            Ok(values) => match f(I::extract(&values)) {
                Ok(value) => Ok(Arc::new(value) as Dynamic),
                Err(err) => Err(Failure::new(cell.label_arc(), Cause::Derivation(err))),
            },
            Err(failure) => Err(failure),
        };

        if let Err(err) = cell.settle(settled) {
            tracing::error!("derived cell written by someone else: {err}");
        }
    });

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_lift_waits_for_all_inputs() {
        let a = ValueCell::<u32>::new("a");
        let b = ValueCell::<u32>::new("b");

        let sum = lift("sum", (a.clone(), b.clone()), |(a, b)| *a + *b);
        assert!(sum.is_pending());

        a.resolve(2).unwrap();
        assert!(sum.is_pending());

        b.resolve(3).unwrap();
        assert_eq!(*sum.get().unwrap(), 5);
    }

    #[test]
    fn test_lift_runs_function_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let a = ValueCell::<u32>::new("a");

        let c = calls.clone();
        let out = lift("double", a.clone(), move |a| {
            c.fetch_add(1, Ordering::SeqCst);
            *a * 2
        });

        a.resolve(21).unwrap();
        let _ = a.resolve(22);

        assert_eq!(*out.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_propagates_through_chain() {
        let root = ValueCell::<String>::new("hostname");
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let first = root.map("first", move |h| {
            c.fetch_add(1, Ordering::SeqCst);
            h.len()
        });
        let second = first.map("second", |n| *n + 1);
        let third = lift("third", (second.clone(), first.clone()), |(a, b)| *a + *b);

        let failure = Failure::new("ingress", Cause::Timeout);
        root.fail(failure.clone()).unwrap();

        for cell in [first.failure(), second.failure(), third.failure()] {
            let cell = cell.unwrap();
            assert_eq!(cell.origin(), "ingress");
            assert!(cell.same_as(&failure));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_does_not_wait_for_siblings() {
        let slow = ValueCell::<u32>::new("slow");
        let broken = ValueCell::<u32>::new("broken");

        let out = lift("out", (slow.clone(), broken.clone()), |(a, b)| *a + *b);
        broken
            .fail(Failure::new("broken", Cause::Stalled))
            .unwrap();

        assert_eq!(out.failure().unwrap().origin(), "broken");
        assert!(slow.is_pending());
    }

    #[test]
    fn test_try_lift_rejection_originates_here() {
        let raw = ValueCell::resolved("raw", String::from("not-a-number"));
        let parsed = try_lift("parsed", raw, |raw| Ok(raw.parse::<u16>()?));

        let failure = parsed.failure().unwrap();
        assert_eq!(failure.origin(), "parsed");
        assert!(matches!(failure.cause(), Cause::Derivation(_)));
    }

    #[test]
    fn test_origins_are_inherited() {
        let a = ValueCell::<u8>::with_origins("a".into(), Arc::from(vec![ArcStr::from("vpc")]));
        let b = ValueCell::<u8>::with_origins("b".into(), Arc::from(vec![ArcStr::from("sg")]));

        let out = lift("out", (a, b), |(a, b)| *a + *b);
        let cell = out.erase();
        let origins: Vec<&str> = cell.origins().iter().map(|o| o.as_ref()).collect();
        assert_eq!(origins, vec!["vpc", "sg"]);
    }
}
