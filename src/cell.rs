//! Single-assignment value cells.
//!
//! A [`ValueCell<T>`] holds a value that may not be known yet, typically an
//! attribute the cloud platform assigns only after a resource has been
//! provisioned. Every cell moves from `Pending` to either `Resolved` or
//! `Failed` exactly once, and consumers observe the transition through
//! continuations registered with [`ValueCell::on_ready`].
//!
//! ## Phantom cells
//!
//! Under the hood every cell is an [`AnyCell`] storing its value as
//! `Arc<dyn Any + Send + Sync>`, which lets the orchestrator keep cells of
//! different types side by side. `ValueCell<T>` carries the type in
//! `PhantomData`, so the compiler enforces that a consumer receives exactly
//! the type its producer resolves with; the downcasts at runtime can only fail
//! if that typed layer was bypassed.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{ArcStr, Dynamic};
use crate::error::{CellError, Failure};

/// Outcome delivered to continuations of a type-erased cell.
pub(crate) type Settled = Result<Dynamic, Failure>;

type Waiter = Box<dyn FnOnce(&Settled) + Send>;

/// Process-unique identity of a cell, used as memoization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        CellId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

enum Slot {
    Pending(Vec<Waiter>),
    Resolved(Dynamic),
    Failed(Failure),
}

struct Inner {
    id: CellId,
    label: ArcStr,
    /// Resources this cell transitively derives from.
    origins: Arc<[ArcStr]>,
    slot: Mutex<Slot>,
}

/// Type-erased handle to a cell.
///
/// Cloning is cheap and every clone refers to the same cell.
#[derive(Clone)]
pub struct AnyCell(Arc<Inner>);

impl AnyCell {
    pub(crate) fn new(label: ArcStr, origins: Arc<[ArcStr]>) -> Self {
        Self(Arc::new(Inner {
            id: CellId::next(),
            label,
            origins,
            slot: Mutex::new(Slot::Pending(Vec::new())),
        }))
    }

    pub fn id(&self) -> CellId {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub(crate) fn label_arc(&self) -> ArcStr {
        self.0.label.clone()
    }

    /// Names of the resource nodes this cell's value flows from.
    pub fn origins(&self) -> &[ArcStr] {
        &self.0.origins
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.lock(), Slot::Pending(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.lock(), Slot::Resolved(_))
    }

    /// The failure this cell settled with, if any.
    pub fn failure(&self) -> Option<Failure> {
        match &*self.lock() {
            Slot::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    pub(crate) fn peek(&self) -> Option<Settled> {
        match &*self.lock() {
            Slot::Pending(_) => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Failed(failure) => Some(Err(failure.clone())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.0.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition out of `Pending`, then run the queued continuations in
    /// registration order. The lock is released before any of them runs, so
    /// continuations are free to touch other cells, or this one.
    pub(crate) fn settle(&self, outcome: Settled) -> Result<(), CellError> {
        let waiters = {
            let mut slot = self.lock();
            let Slot::Pending(waiters) = &mut *slot else {
                return Err(CellError::DoubleResolution(self.label_arc()));
            };
            let waiters = std::mem::take(waiters);
            *slot = match &outcome {
                Ok(value) => Slot::Resolved(value.clone()),
                Err(failure) => Slot::Failed(failure.clone()),
            };
            waiters
        };

        match &outcome {
            Ok(_) => tracing::trace!(cell = %self.label(), "resolved"),
            Err(failure) => tracing::debug!(cell = %self.label(), %failure, "failed"),
        }

        for waiter in waiters {
            waiter(&outcome);
        }

        Ok(())
    }

    /// Run `waiter` once this cell settles, immediately if it already has.
    pub(crate) fn on_settled(&self, waiter: impl FnOnce(&Settled) + Send + 'static) {
        let outcome = {
            let mut slot = self.lock();
            match &mut *slot {
                Slot::Pending(waiters) => {
                    waiters.push(Box::new(waiter));
                    return;
                }
                Slot::Resolved(value) => Ok(value.clone()),
                Slot::Failed(failure) => Err(failure.clone()),
            }
        };

        waiter(&outcome);
    }
}

impl std::fmt::Debug for AnyCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            Slot::Pending(_) => "Pending",
            Slot::Resolved(_) => "Resolved",
            Slot::Failed(_) => "Failed",
        };
        write!(f, "AnyCell({:?}, {}, {})", self.0.id, self.0.label, state)
    }
}

/// Snapshot of a cell's state.
#[derive(Debug)]
pub enum CellState<T> {
    Pending,
    Resolved(Arc<T>),
    Failed(Failure),
}

/// A single-assignment container for a value of type `T` that becomes known
/// at some later point.
///
/// The creator of a cell is its only writer; everyone else reads through
/// [`on_ready`](ValueCell::on_ready), [`get`](ValueCell::get) or
/// [`state`](ValueCell::state).
pub struct ValueCell<T> {
    cell: AnyCell,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.cell.fmt(f)
    }
}

impl<T> ValueCell<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a pending cell with no upstream resources.
    pub fn new(label: impl Into<ArcStr>) -> Self {
        Self::with_origins(label.into(), Arc::from([]))
    }

    /// Creates a cell that is already resolved, e.g. a configuration scalar.
    pub fn resolved(label: impl Into<ArcStr>, value: T) -> Self {
        let cell = Self::new(label);
        // A fresh cell cannot have been settled yet.
        let _ = cell.resolve(value);
        cell
    }

    pub(crate) fn with_origins(label: ArcStr, origins: Arc<[ArcStr]>) -> Self {
        Self {
            cell: AnyCell::new(label, origins),
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    pub fn label(&self) -> &str {
        self.cell.label()
    }

    /// Drops the static type, e.g. to hand the cell to code that only needs
    /// to observe whether it settled.
    pub fn erase(&self) -> AnyCell {
        self.cell.clone()
    }

    /// Transitions `Pending → Resolved`.
    ///
    /// # Errors
    ///
    /// [`CellError::DoubleResolution`] if the cell has already settled; the
    /// stored state is left untouched.
    pub fn resolve(&self, value: T) -> Result<(), CellError> {
        self.cell.settle(Ok(Arc::new(value)))
    }

    /// Transitions `Pending → Failed`.
    pub fn fail(&self, failure: Failure) -> Result<(), CellError> {
        self.cell.settle(Err(failure))
    }

    /// Registers a continuation that runs exactly once, when the cell
    /// settles. If it already has, the continuation runs right away on the
    /// calling thread.
    pub fn on_ready<F>(&self, continuation: F)
    where
        F: FnOnce(Result<&T, &Failure>) + Send + 'static,
    {
        self.cell.on_settled(move |outcome| match outcome {
            Ok(value) => continuation(Ok(downcast::<T>(value))),
            Err(failure) => continuation(Err(failure)),
        });
    }

    pub fn state(&self) -> CellState<T> {
        match self.cell.peek() {
            None => CellState::Pending,
            Some(Ok(value)) => CellState::Resolved(downcast_arc::<T>(value)),
            Some(Err(failure)) => CellState::Failed(failure),
        }
    }

    /// The resolved value, if there is one.
    pub fn get(&self) -> Option<Arc<T>> {
        match self.state() {
            CellState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<Failure> {
        self.cell.failure()
    }

    pub fn is_pending(&self) -> bool {
        self.cell.is_pending()
    }

    /// Derive a new cell from this one with a pure function.
    pub fn map<R, F>(&self, label: impl Into<ArcStr>, f: F) -> ValueCell<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce(Arc<T>) -> R + Send + 'static,
    {
        crate::transform::lift(label, self.clone(), f)
    }
}

fn downcast<T: 'static>(value: &Dynamic) -> &T {
    value
        .downcast_ref::<T>()
        .expect("Type mismatch in cell resolution")
}

fn downcast_arc<T: Send + Sync + 'static>(value: Dynamic) -> Arc<T> {
    value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("Expected {} in cell", std::any::type_name::<T>()))
}

/// Calls `done` exactly once: with every value once all `cells` resolved, or
/// with the first failure observed, whichever comes first.
pub(crate) fn when_all<F>(cells: Vec<AnyCell>, done: F)
where
    F: FnOnce(Result<Vec<Dynamic>, Failure>) + Send + 'static,
{
    if cells.is_empty() {
        done(Ok(Vec::new()));
        return;
    }

    struct Join<F> {
        remaining: usize,
        values: Vec<Option<Dynamic>>,
        done: Option<F>,
    }

    let join = Arc::new(Mutex::new(Join {
        remaining: cells.len(),
        values: vec![None; cells.len()],
        done: Some(done),
    }));

    for (i, cell) in cells.iter().enumerate() {
        let join = join.clone();
        cell.on_settled(move |outcome| {
            let fire = {
                let mut join = join.lock().unwrap_or_else(PoisonError::into_inner);
                if join.done.is_none() {
                    return;
                }
                match outcome {
                    Ok(value) => {
                        join.values[i] = Some(value.clone());
                        join.remaining -= 1;
                        if join.remaining == 0 {
                            let values = join.values.drain(..).flatten().collect();
                            join.done.take().map(|done| (done, Ok(values)))
                        } else {
                            None
                        }
                    }
                    Err(failure) => join.done.take().map(|done| (done, Err(failure.clone()))),
                }
            };

            if let Some((done, outcome)) = fire {
                done(outcome);
            }
        });
    }
}

/// Union of the origins of `cells`, deduplicated, in first-seen order.
pub(crate) fn merge_origins(cells: &[AnyCell]) -> Arc<[ArcStr]> {
    let mut origins: Vec<ArcStr> = Vec::new();
    for cell in cells {
        for origin in cell.origins() {
            if !origins.contains(origin) {
                origins.push(origin.clone());
            }
        }
    }
    origins.into()
}

/// A trait that enables a collection of [`ValueCell<T>`]s to be used as the
/// inputs of a transform, lookup or resource.
///
/// It is implemented for a single cell, for tuples of cells and for a `Vec`
/// of same-typed cells. Resolved values are handed over as `Arc`s so that
/// async work can own them.
pub trait Inputs: Send + 'static {
    /// The resolved values: `Arc<T>` for one cell, a tuple of them for a tuple.
    type Values: Send + 'static;

    /// The type-erased cells, in the order `extract` expects their values.
    fn cells(&self) -> Vec<AnyCell>;

    /// Turns type-erased values back into `Values`.
    ///
    /// # Panics
    /// This method will panic if the type-erased values cannot be downcast to
    /// their expected concrete types, indicating a severe logic error.
    fn extract(values: &[Dynamic]) -> Self::Values;
}

impl Inputs for () {
    type Values = ();

    fn cells(&self) -> Vec<AnyCell> {
        vec![]
    }

    fn extract(_: &[Dynamic]) -> Self::Values {}
}

impl<T> Inputs for ValueCell<T>
where
    T: Send + Sync + 'static,
{
    type Values = Arc<T>;

    fn cells(&self) -> Vec<AnyCell> {
        vec![self.erase()]
    }

    fn extract(values: &[Dynamic]) -> Self::Values {
        downcast_arc::<T>(values[0].clone())
    }
}

impl<T> Inputs for Vec<ValueCell<T>>
where
    T: Send + Sync + 'static,
{
    type Values = Vec<Arc<T>>;

    fn cells(&self) -> Vec<AnyCell> {
        self.iter().map(ValueCell::erase).collect()
    }

    fn extract(values: &[Dynamic]) -> Self::Values {
        values
            .iter()
            .map(|value| downcast_arc::<T>(value.clone()))
            .collect()
    }
}

macro_rules! impl_inputs {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($T),*> Inputs for ($(ValueCell<$T>,)*)
        where
            $($T: Send + Sync + 'static),* {
            type Values = ($(Arc<$T>,)*);

            fn cells(&self) -> Vec<AnyCell> {
                let ($($T,)*) = self;
                vec![$($T.erase(),)*]
            }

            fn extract(values: &[Dynamic]) -> Self::Values {
                let mut iter = values.iter();
                ($({
                    let value = iter.next().expect("Missing value in cell resolution");
                    downcast_arc::<$T>(value.clone())
                },)*)
            }
        }
    };
}

impl_inputs!(A);
impl_inputs!(A, B);
impl_inputs!(A, B, C);
impl_inputs!(A, B, C, D);
impl_inputs!(A, B, C, D, E);
impl_inputs!(A, B, C, D, E, F);
impl_inputs!(A, B, C, D, E, F, G);
impl_inputs!(A, B, C, D, E, F, G, H);
