use crate::durability::Durability;
use crate::revision::Revision;
use crate::runtime::{Runtime, RuntimeInner};
use crate::store::{eq_fn, CellId, CellMeta, EqFn, Slot};
use crate::CycleError;
use log::debug;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// Cell data for an input whose value is set from outside.
pub(crate) struct SignalCell {
    /// Committed value, visible to all reads.
    pub(crate) value: Slot,

    /// Staged value while enclosed in an open batch. Cleared on
    /// commit or discard; always absent outside a batch.
    pub(crate) pending: Option<Slot>,

    /// Revision at which `value` most recently changed.
    pub(crate) changed_at: Revision,

    /// Declared durability.
    pub(crate) durability: Durability,

    pub(crate) eq: EqFn,
}

/// Handle to an input cell. Reading it from inside a memo computation
/// records a dependency; setting it advances the revision clock (or
/// stages the value, inside a [`Runtime::batch`]).
///
/// The handle is freely clonable and holds only a weak reference to
/// its runtime; the runtime owns the cell. Using a handle after the
/// runtime was dropped panics.
pub struct Signal<T> {
    runtime: Weak<RuntimeInner>,
    cell: CellId,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            runtime: self.runtime.clone(),
            cell: self.cell,
            _value: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_tuple("Signal").field(&self.cell).finish()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Allocates a new input cell holding `value`, with durability
    /// `Durability::LOW`.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self::new_with_durability(runtime, value, Durability::LOW)
    }

    /// Allocates a new input cell holding `value` with the given
    /// durability. Higher durabilities let dependent memos skip
    /// dependency walks in revisions where only lower-durability
    /// inputs changed.
    pub fn new_with_durability(runtime: &Runtime, value: T, durability: Durability) -> Self {
        let inner = runtime.inner();
        let cell = inner
            .store
            .borrow_mut()
            .alloc(CellMeta::Signal(SignalCell {
                value: Slot::new(value),
                pending: None,
                changed_at: inner.current_revision(),
                durability,
                eq: eq_fn::<T>(),
            }));
        debug!("new signal {:?} (durability {:?})", cell, durability);
        Signal {
            runtime: Rc::downgrade(inner),
            cell,
            _value: PhantomData,
        }
    }

    /// Reads the current value. If a memo computation is active, the
    /// read is recorded as a dependency of that memo.
    ///
    /// Inside an open batch, a value staged by `set` is visible only
    /// to reads made directly from the batch closure; reads performed
    /// by memo computations see the committed value.
    pub fn get(&self) -> T {
        let runtime = self.runtime();
        let (value, durability) = {
            let store = runtime.store.borrow();
            let signal = store.signal(self.cell);
            let slot = match &signal.pending {
                Some(pending) if !runtime.local_state.query_in_progress() => pending,
                _ => &signal.value,
            };
            let value = slot
                .downcast_ref::<T>()
                .expect("signal value type mismatch")
                .clone();
            (value, signal.durability)
        };
        runtime.report_query_read(self.cell, durability);
        value
    }

    /// Like [`get`](Self::get), wrapped in `Ok`. Signals cannot
    /// participate in cycles; this exists for interface symmetry with
    /// [`Memo::get_result`](crate::Memo::get_result).
    pub fn get_result(&self) -> Result<T, CycleError> {
        Ok(self.get())
    }

    /// Writes a new value. If `value` equals the currently visible
    /// value under `T`'s equality, this is a no-op; otherwise the
    /// revision clock advances (immediately, or once at batch commit).
    ///
    /// Panics when invoked during a query computation.
    pub fn set(&self, value: T) {
        self.set_impl(value, false);
    }

    /// Like [`set`](Self::set), but without the equality gate: the
    /// write always produces a new revision, even if the value is
    /// unchanged. Dependent memos will re-verify (though backdating
    /// may still spare them from recomputing transitively).
    pub fn set_unconditional(&self, value: T) {
        self.set_impl(value, true);
    }

    fn set_impl(&self, value: T, unconditional: bool) {
        let runtime = self.runtime();
        let new = Slot::new(value);

        if runtime.batch_is_open() {
            let staged = {
                let mut store = runtime.store.borrow_mut();
                let signal = store.signal_mut(self.cell);
                let visible = signal.pending.as_ref().unwrap_or(&signal.value);
                if !unconditional && (signal.eq)(visible.as_any(), new.as_any()) {
                    false
                } else {
                    signal.pending = Some(new);
                    true
                }
            };
            if staged {
                debug!("set({:?}): staged in open batch", self.cell);
                runtime.stage_signal(self.cell, unconditional);
            }
            return;
        }

        {
            let store = runtime.store.borrow();
            let signal = store.signal(self.cell);
            if !unconditional && (signal.eq)(signal.value.as_any(), new.as_any()) {
                debug!("set({:?}): value unchanged, skipping", self.cell);
                return;
            }
        }

        runtime.with_incremented_revision(|new_revision| {
            let mut store = runtime.store.borrow_mut();
            let signal = store.signal_mut(self.cell);
            signal.value = new;
            signal.changed_at = new_revision;
            Some(signal.durability)
        });
    }

    /// The id of this cell within its runtime.
    pub fn id(&self) -> CellId {
        self.cell
    }

    fn runtime(&self) -> Rc<RuntimeInner> {
        self.runtime
            .upgrade()
            .unwrap_or_else(|| panic!("{:?} used after its runtime was dropped", self.cell))
    }
}
