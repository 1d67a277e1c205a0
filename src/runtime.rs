use crate::durability::Durability;
use crate::revision::Revision;
use crate::store::{CellId, CellStore};
use crate::{Event, EventKind};
use log::debug;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::hash::BuildHasherDefault;
use std::rc::Rc;

pub(crate) type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<FxHasher>>;
pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

mod local_state;
pub(crate) use local_state::{CompletedQuery, LocalState};

/// The polka runtime stores the cells for all signals and memos as
/// well as tracking the query stack and the revision clock.
///
/// Each new runtime you create (e.g., via `Runtime::new` or
/// `Runtime::default`) has an independent set of cells associated
/// with it. Normally, therefore, you only do this once, at the start
/// of your application.
///
/// The runtime is strictly single-threaded; handles hold `Rc`
/// references into it and are `!Send` by construction.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            inner: Rc::new(RuntimeInner::new()),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Runtime")
            .field("revision", &self.inner.current_revision())
            .field("batch_depth", &self.inner.batch.borrow().depth)
            .finish()
    }
}

impl Runtime {
    /// Create a new runtime; equivalent to `Self::default`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current value of the revision clock.
    pub fn revision(&self) -> Revision {
        self.inner.current_revision()
    }

    /// Runs `f` with input updates batched: `Signal::set` calls made
    /// inside `f` are staged rather than committed, and are applied
    /// atomically when the outermost batch exits, bumping the revision
    /// clock at most once. A signal whose final staged value equals
    /// its pre-batch value is discarded without effect.
    ///
    /// Reads performed by memo computations inside the batch see the
    /// committed values, not the staged ones; only direct reads from
    /// `f` itself observe the staged values.
    ///
    /// Batches nest; only the outermost commits. If `f` panics, all
    /// staged values are discarded and the clock is not bumped.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = BatchGuard::enter(&self.inner);
        let result = f();
        guard.commit();
        result
    }

    /// A "synthetic write" causes the system to act *as though* some
    /// input of durability `durability` has changed. No cell is
    /// touched, but memos of durability `durability` and below will
    /// re-verify their dependencies on next read. This is mostly
    /// useful for profiling scenarios.
    pub fn synthetic_write(&self, durability: Durability) {
        assert!(
            !self.inner.batch_is_open(),
            "synthetic_write inside a batch"
        );
        self.inner
            .with_incremented_revision(|_next_revision| Some(durability));
    }

    /// Installs a callback invoked at notable points of execution:
    /// before a memo's thunk runs, and when a memoized value is
    /// revalidated without running the thunk. Replaces any previously
    /// installed handler.
    pub fn set_event_handler(&self, handler: impl Fn(Event) + 'static) {
        *self.inner.event_handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub(crate) fn inner(&self) -> &Rc<RuntimeInner> {
        &self.inner
    }
}

/// State shared by every handle of a runtime. Handles hold weak
/// references; the `Runtime` value is the unique owner.
pub(crate) struct RuntimeInner {
    /// Cell storage, indexed by `CellId`.
    pub(crate) store: RefCell<CellStore>,

    /// Stores the "last change" revision for values of each
    /// durability. The element at index 0 is special as it represents
    /// the current revision. We have the invariant that revisions in
    /// here are *declining* -- that is, `revisions[i] >=
    /// revisions[i + 1]`, for all `i`. This is because when you modify
    /// a value with durability D, that implies that values with
    /// durability less than D may have changed too.
    revisions: [Cell<Revision>; Durability::LEN],

    /// The query stack.
    pub(crate) local_state: LocalState,

    /// Batch nesting depth and the set of staged signals.
    batch: RefCell<BatchState>,

    /// Observation hook, if installed.
    event_handler: RefCell<Option<Rc<dyn Fn(Event)>>>,
}

#[derive(Default)]
struct BatchState {
    /// Nesting depth; zero when no batch is open.
    depth: usize,

    /// Signals with a staged value, in staging order. The flag records
    /// whether any staged write was a `set_unconditional`, which
    /// forces the commit even if the value reverted.
    staged: FxIndexMap<CellId, bool>,
}

impl RuntimeInner {
    fn new() -> Self {
        let revisions: [Cell<Revision>; Durability::LEN] = [
            Cell::new(Revision::start()),
            Cell::new(Revision::start()),
            Cell::new(Revision::start()),
        ];
        RuntimeInner {
            store: RefCell::new(CellStore::new()),
            revisions,
            local_state: LocalState::default(),
            batch: RefCell::new(BatchState::default()),
            event_handler: RefCell::new(None),
        }
    }

    /// Read the current value of the revision clock.
    pub(crate) fn current_revision(&self) -> Revision {
        self.revisions[0].get()
    }

    /// The revision in which values with durability `d` may have last
    /// changed. For `Durability::LOW`, this is just the current
    /// revision. But for higher levels of durability, this value may
    /// lag behind the current revision. If we encounter a value of
    /// durability `d`, then, we can check this function to get a
    /// "bound" on when the value may have changed, which allows us to
    /// skip walking its dependencies.
    pub(crate) fn last_changed_revision(&self, d: Durability) -> Revision {
        self.revisions[d.index()].get()
    }

    pub(crate) fn permits_increment(&self) -> bool {
        !self.local_state.query_in_progress()
    }

    /// Increments the revision clock and invokes `op` with the new
    /// revision. `op` performs the writes belonging to the new
    /// revision; its return value indicates whether a pre-existing
    /// value was modified:
    ///
    /// - `None` means that no pre-existing value was modified;
    /// - `Some(d)` indicates a modified value of durability `d`, which
    ///   updates the records for when values with each durability were
    ///   last modified.
    pub(crate) fn with_incremented_revision(
        &self,
        op: impl FnOnce(Revision) -> Option<Durability>,
    ) {
        if !self.permits_increment() {
            panic!("cannot change an input during a query computation");
        }

        let new_revision = self.current_revision().next();
        self.revisions[0].set(new_revision);
        debug!(
            "with_incremented_revision: incremented to {:?}",
            new_revision
        );

        if let Some(d) = op(new_revision) {
            for rev in &self.revisions[1..=d.index()] {
                rev.set(new_revision);
            }
        }
    }

    pub(crate) fn batch_is_open(&self) -> bool {
        self.batch.borrow().depth > 0
    }

    /// Records `cell` as staged in the open batch.
    pub(crate) fn stage_signal(&self, cell: CellId, forced: bool) {
        let mut batch = self.batch.borrow_mut();
        debug_assert!(batch.depth > 0);
        let entry = batch.staged.entry(cell).or_insert(false);
        *entry = *entry || forced;
    }

    /// Reports that the currently active query (if any) read `input`.
    pub(crate) fn report_query_read(&self, input: CellId, durability: Durability) {
        self.local_state.report_query_read(input, durability);
    }

    pub(crate) fn emit_event(&self, cell: CellId, kind: EventKind) {
        let handler = self.event_handler.borrow().clone();
        if let Some(handler) = handler {
            handler(Event { cell, kind });
        }
    }

    /// Applies the staged values of the outermost batch. Signals whose
    /// final staged value equals the committed (pre-batch) value are
    /// reverted without effect; if anything actually changed, the
    /// clock is bumped exactly once.
    fn commit_staged(&self, staged: FxIndexMap<CellId, bool>) {
        let mut committed: SmallVec<[CellId; 8]> = SmallVec::new();
        let mut durability = Durability::LOW;
        {
            let mut store = self.store.borrow_mut();
            for (&cell, &forced) in &staged {
                let signal = store.signal_mut(cell);
                let pending = signal
                    .pending
                    .take()
                    .expect("staged signal has no pending value");
                let changed = forced || !(signal.eq)(signal.value.as_any(), pending.as_any());
                if changed {
                    durability = durability.max(signal.durability);
                    signal.value = pending;
                    committed.push(cell);
                }
            }
        }

        if committed.is_empty() {
            debug!("commit_staged: all staged values reverted, clock untouched");
            return;
        }

        self.with_incremented_revision(|new_revision| {
            let mut store = self.store.borrow_mut();
            for &cell in &committed {
                store.signal_mut(cell).changed_at = new_revision;
            }
            Some(durability)
        });
    }

    /// Discards every staged value without committing. Used when a
    /// batch closure panics.
    fn discard_staged(&self, staged: FxIndexMap<CellId, bool>) {
        let mut store = self.store.borrow_mut();
        for (&cell, _) in &staged {
            store.signal_mut(cell).pending = None;
        }
    }
}

/// Scoped batch entry. Commits on `commit`, discards staged values if
/// dropped by an unwind.
struct BatchGuard<'me> {
    runtime: &'me RuntimeInner,
}

impl<'me> BatchGuard<'me> {
    fn enter(runtime: &'me RuntimeInner) -> Self {
        if runtime.local_state.query_in_progress() {
            panic!("cannot open a batch during a query computation");
        }
        runtime.batch.borrow_mut().depth += 1;
        BatchGuard { runtime }
    }

    fn commit(self) {
        let runtime = self.runtime;
        std::mem::forget(self);

        let staged = {
            let mut batch = runtime.batch.borrow_mut();
            batch.depth -= 1;
            if batch.depth > 0 {
                return;
            }
            std::mem::take(&mut batch.staged)
        };
        if !staged.is_empty() {
            runtime.commit_staged(staged);
        }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let staged = {
            let mut batch = self.runtime.batch.borrow_mut();
            batch.depth -= 1;
            if batch.depth > 0 {
                return;
            }
            std::mem::take(&mut batch.staged)
        };
        if !staged.is_empty() {
            self.runtime.discard_staged(staged);
        }
    }
}
