use crate::durability::Durability;
use crate::revision::Revision;
use crate::runtime::{CompletedQuery, Runtime, RuntimeInner};
use crate::store::{eq_fn, CellId, CellMeta, EqFn, Slot};
use crate::{CycleError, EventKind};
use log::{debug, info};
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Cell data for a derived value produced by a user thunk.
pub(crate) struct MemoCell {
    /// The user's compute thunk, type-erased. Cloned out of the store
    /// before invocation so the store is not borrowed while user code
    /// runs.
    compute: Rc<dyn Fn() -> Slot>,

    eq: EqFn,

    state: MemoState,
}

/// Defines the "current state" of a memo's cached result.
pub(crate) enum MemoState {
    /// Never computed.
    NotComputed,

    /// The thunk is currently executing; seeing this state on entry
    /// indicates a cycle.
    InProgress,

    /// We have computed the value already, and here is the result.
    Memoized(MemoRecord),
}

pub(crate) struct MemoRecord {
    /// The result of the most recent evaluation.
    value: Slot,

    /// Last revision when this memo was confirmed consistent.
    verified_at: Revision,

    /// Last revision when the memoized value was observed to change.
    /// May lag `verified_at` arbitrarily far behind, thanks to
    /// backdating.
    changed_at: Revision,

    /// Minimum durability of the dependencies of this memo; `MAX`
    /// when it has none.
    durability: Durability,

    /// The cells read during the evaluation that produced `value`,
    /// in first-read order.
    deps: Box<[CellId]>,
}

impl MemoCell {
    fn record(&self) -> Option<&MemoRecord> {
        match &self.state {
            MemoState::Memoized(record) => Some(record),
            _ => None,
        }
    }

    fn record_mut(&mut self) -> Option<&mut MemoRecord> {
        match &mut self.state {
            MemoState::Memoized(record) => Some(record),
            _ => None,
        }
    }
}

/// Handle to a derived cell. Reading it returns the cached value when
/// the verifier can prove it current, and re-executes the thunk
/// otherwise. Reading it from inside another memo's computation
/// records a dependency.
///
/// Like [`Signal`](crate::Signal) handles, memo handles are freely
/// clonable, hold a weak runtime reference, and panic when used after
/// the runtime was dropped.
pub struct Memo<T> {
    runtime: Weak<RuntimeInner>,
    cell: CellId,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Memo {
            runtime: self.runtime.clone(),
            cell: self.cell,
            _value: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Memo<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_tuple("Memo").field(&self.cell).finish()
    }
}

impl<T> Memo<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Allocates a new derived cell evaluating `compute`. The thunk is
    /// not run until the first read.
    ///
    /// `compute` must be deterministic given the cells it reads, and
    /// free of side effects; the engine only re-runs it when a
    /// recorded dependency may have changed.
    pub fn new(runtime: &Runtime, compute: impl Fn() -> T + 'static) -> Self {
        let inner = runtime.inner();
        let compute: Rc<dyn Fn() -> Slot> = Rc::new(move || Slot::new(compute()));
        let cell = inner.store.borrow_mut().alloc(CellMeta::Memo(MemoCell {
            compute,
            eq: eq_fn::<T>(),
            state: MemoState::NotComputed,
        }));
        debug!("new memo {:?}", cell);
        Memo {
            runtime: Rc::downgrade(inner),
            cell,
            _value: PhantomData,
        }
    }

    /// Reads the memo's value, recomputing if needed. Aborts with a
    /// panic naming the offending cell if the computation turns out to
    /// be cyclic; use [`get_result`](Self::get_result) to observe the
    /// cycle as an error instead.
    pub fn get(&self) -> T {
        let runtime = self.runtime();
        self.get_result().unwrap_or_else(|err| {
            if runtime.local_state.query_in_progress() {
                // Unwind with the typed payload so the outermost
                // `get_result` can surface the error.
                err.throw()
            } else {
                panic!("{}", err)
            }
        })
    }

    /// Reads the memo's value, recomputing if needed. Returns
    /// `Err(CycleError)` if this memo is already being computed --
    /// that is, its thunk (transitively) attempted to read its own
    /// result. The failed read records no dependency on the caller's
    /// frame, so the caller is free to recover.
    pub fn get_result(&self) -> Result<T, CycleError> {
        let runtime = self.runtime();
        fetch(&runtime, self.cell)?;

        let (value, durability) = {
            let store = runtime.store.borrow();
            let record = store
                .memo(self.cell)
                .record()
                .expect("fetch did not produce a memoized value");
            let value = record
                .value
                .downcast_ref::<T>()
                .expect("memo value type mismatch")
                .clone();
            (value, record.durability)
        };
        runtime.report_query_read(self.cell, durability);
        Ok(value)
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

/// Ensures `cell` holds a memoized value verified at the current
/// revision, executing or revalidating as needed.
fn fetch(runtime: &RuntimeInner, cell: CellId) -> Result<(), CycleError> {
    let revision_now = runtime.current_revision();
    info!("{:?}: invoked at {:?}", cell, revision_now);

    enum Probe {
        UpToDate,
        Absent,
        Stale,
    }

    let probe = {
        let store = runtime.store.borrow();
        match &store.memo(cell).state {
            MemoState::InProgress => return Err(CycleError::new(cell)),
            MemoState::NotComputed => Probe::Absent,
            MemoState::Memoized(record) => {
                if record.verified_at == revision_now {
                    Probe::UpToDate
                } else {
                    Probe::Stale
                }
            }
        }
    };

    match probe {
        Probe::UpToDate => Ok(()),
        Probe::Absent => execute(runtime, cell),
        Probe::Stale => validate(runtime, cell, revision_now),
    }
}

/// One in-flight validation: `cell`'s dependencies up to (but not
/// including) `cursor` are known unchanged since `cell` was last
/// verified.
struct VerifyFrame {
    cell: CellId,
    cursor: usize,
}

/// Outcome of probing the next pending dependency of a frame.
enum Step {
    /// Every dependency is unchanged (or the durability shortcut
    /// applies): the cached value may be reused.
    Promote,

    /// The current dependency is unchanged; advance the cursor.
    Unchanged,

    /// The current dependency changed after the frame's memo was last
    /// verified: the memo must recompute.
    Changed,

    /// The current dependency is itself a stale memo; validate it
    /// first.
    Descend(CellId),
}

/// Decides whether the memoized value of `root` can be reused at
/// `revision_now`, re-executing `root` (and any stale dependencies
/// found to have really changed) as required. On success the root is
/// `Memoized` and verified at `revision_now`.
///
/// A recursive formulation would recurse once per edge of the memo
/// graph and overflow the native stack on deep chains, so the walk
/// keeps an explicit stack of dependency cursors instead. Note that
/// re-executing a thunk still nests arbitrarily through user code;
/// only the verification bookkeeping is iterative.
fn validate(runtime: &RuntimeInner, root: CellId, revision_now: Revision) -> Result<(), CycleError> {
    debug!("validate({:?}) at {:?}", root, revision_now);

    let mut stack: SmallVec<[VerifyFrame; 16]> = SmallVec::new();
    stack.push(VerifyFrame {
        cell: root,
        cursor: 0,
    });

    while let Some(top) = stack.last_mut() {
        match next_step(runtime, top, revision_now) {
            Step::Unchanged => top.cursor += 1,
            Step::Descend(dep) => stack.push(VerifyFrame {
                cell: dep,
                cursor: 0,
            }),
            Step::Promote => {
                let cell = top.cell;
                stack.pop();
                mark_verified(runtime, cell, revision_now);
                reconcile(runtime, &mut stack, changed_at(runtime, cell))?;
            }
            Step::Changed => {
                let cell = top.cell;
                stack.pop();
                execute(runtime, cell)?;
                reconcile(runtime, &mut stack, changed_at(runtime, cell))?;
            }
        }
    }
    Ok(())
}

/// Feeds a finished dependency's `changed_at` back into its parent
/// frame. A parent whose verification horizon is exceeded must itself
/// recompute, which in turn feeds *its* (possibly backdated)
/// `changed_at` to the grandparent, and so on up the stack.
fn reconcile(
    runtime: &RuntimeInner,
    stack: &mut SmallVec<[VerifyFrame; 16]>,
    mut dep_changed_at: Revision,
) -> Result<(), CycleError> {
    while let Some(top) = stack.last_mut() {
        let verified_at = {
            let store = runtime.store.borrow();
            store
                .memo(top.cell)
                .record()
                .expect("frame cell lost its memoized value")
                .verified_at
        };
        if dep_changed_at <= verified_at {
            top.cursor += 1;
            return Ok(());
        }

        debug!(
            "reconcile: dependency changed at {:?}, {:?} must recompute",
            dep_changed_at, top.cell
        );
        let cell = top.cell;
        stack.pop();
        execute(runtime, cell)?;
        dep_changed_at = changed_at(runtime, cell);
    }
    Ok(())
}

fn next_step(runtime: &RuntimeInner, frame: &VerifyFrame, revision_now: Revision) -> Step {
    let store = runtime.store.borrow();
    let record = store
        .memo(frame.cell)
        .record()
        .expect("frame cell lost its memoized value");

    // If no input with durability at least as high as ours has changed
    // since we were last verified, none of our dependencies can have
    // changed; skip the walk entirely.
    if runtime.last_changed_revision(record.durability) <= record.verified_at {
        debug!(
            "{:?}: durability {:?} unchanged since {:?}",
            frame.cell, record.durability, record.verified_at
        );
        return Step::Promote;
    }

    let dep = match record.deps.get(frame.cursor) {
        None => return Step::Promote,
        Some(&dep) => dep,
    };

    // We compare against the revision at which the frame's memo was
    // **last verified**, not when it last changed. An input may have
    // changed in between while our own value was backdated; we are
    // only interested in whether it changed *again*.
    match store.get(dep) {
        CellMeta::Signal(signal) => {
            if signal.changed_at > record.verified_at {
                debug!("{:?}: input {:?} changed", frame.cell, dep);
                Step::Changed
            } else {
                Step::Unchanged
            }
        }
        CellMeta::Memo(dep_memo) => match &dep_memo.state {
            // A dependency that is mid-execution or has lost its value
            // cannot vouch for us; recompute.
            MemoState::InProgress | MemoState::NotComputed => Step::Changed,
            MemoState::Memoized(dep_record) => {
                if dep_record.verified_at == revision_now {
                    if dep_record.changed_at > record.verified_at {
                        Step::Changed
                    } else {
                        Step::Unchanged
                    }
                } else {
                    Step::Descend(dep)
                }
            }
        },
    }
}

fn mark_verified(runtime: &RuntimeInner, cell: CellId, revision_now: Revision) {
    {
        let mut store = runtime.store.borrow_mut();
        let record = store
            .memo_mut(cell)
            .record_mut()
            .expect("verified cell lost its memoized value");
        record.verified_at = revision_now;
    }
    info!("{:?}: validated memoized value at {:?}", cell, revision_now);
    runtime.emit_event(cell, EventKind::DidValidateMemoizedValue);
}

fn changed_at(runtime: &RuntimeInner, cell: CellId) -> Revision {
    runtime
        .store
        .borrow()
        .memo(cell)
        .record()
        .expect("cell has no memoized value")
        .changed_at
}

/// Runs the memo's thunk and installs the result. The query frame is
/// pushed for the duration of the thunk so nested reads record
/// dependencies here, and popped on every exit path. If the thunk
/// panics, the cell's previous state is restored; a `CycleError`
/// payload (thrown by a nested aborting `get`) is converted back into
/// an `Err` so it can cross the engine frames below.
fn execute(runtime: &RuntimeInner, cell: CellId) -> Result<(), CycleError> {
    let revision_now = runtime.current_revision();
    runtime.emit_event(cell, EventKind::WillExecute);
    info!("{:?}: executing at {:?}", cell, revision_now);

    let (compute, old) = {
        let mut store = runtime.store.borrow_mut();
        let memo = store.memo_mut(cell);
        let old = match std::mem::replace(&mut memo.state, MemoState::InProgress) {
            MemoState::Memoized(record) => Some(record),
            MemoState::NotComputed => None,
            MemoState::InProgress => panic!("{:?} is already executing", cell),
        };
        (memo.compute.clone(), old)
    };

    runtime.local_state.push_query(cell);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| compute()));
    let completed = runtime.local_state.pop_query(cell);

    let value = match outcome {
        Ok(value) => value,
        Err(payload) => {
            {
                let mut store = runtime.store.borrow_mut();
                store.memo_mut(cell).state = match old {
                    Some(record) => MemoState::Memoized(record),
                    None => MemoState::NotComputed,
                };
            }
            match payload.downcast::<CycleError>() {
                Ok(err) => return Err(*err),
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    };

    // The thunk is required not to mutate inputs; sanity-check that
    // assumption here, at least to the best of our ability.
    assert_eq!(
        runtime.current_revision(),
        revision_now,
        "revision altered during memo execution"
    );

    let CompletedQuery {
        durability,
        dependencies,
    } = completed;
    let deps: Box<[CellId]> = dependencies.into_iter().collect();
    debug!(
        "execute({:?}): durability={:?}, deps={:?}",
        cell, durability, deps
    );

    let mut store = runtime.store.borrow_mut();
    let memo = store.memo_mut(cell);

    // If the new value is equal to the old one, then it didn't really
    // change, even if some of its dependencies have. So we can
    // "backdate" its `changed_at` revision to be the same as the old
    // value, shielding downstream memos from invalidation. Careful: if
    // the value became less durable than it used to be, that is a
    // change our consumers must be aware of (their durability
    // shortcut would otherwise skip over us). Becoming *more* durable
    // is not.
    let (value, changed_at) = match old {
        Some(record)
            if durability >= record.durability
                && (memo.eq)(record.value.as_any(), value.as_any()) =>
        {
            debug!(
                "execute({:?}): value is equal, back-dating to {:?}",
                cell, record.changed_at
            );
            (record.value, record.changed_at)
        }
        _ => (value, revision_now),
    };

    memo.state = MemoState::Memoized(MemoRecord {
        value,
        verified_at: revision_now,
        changed_at,
        durability,
        deps,
    });
    Ok(())
}
