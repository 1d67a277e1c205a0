#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! The polka crate is a crate for incremental recomputation. It
//! permits you to define a graph of *signals* (input cells) and
//! *memos* (derived cells computed by thunks); as you set the
//! signals, re-reading the memos will re-use results from previous
//! computations whenever the engine can prove they are still current.
//!
//! The engine is pull-based: nothing recomputes until a memo is read.
//! On a read, the verifier walks the memo's recorded dependencies and
//! re-executes only those thunks whose inputs actually changed -- and
//! a recomputation that produces an equal value is "backdated" so that
//! consumers further downstream stay valid without running at all.
//!
//! ```
//! use polka::{Memo, Runtime, Signal};
//!
//! let runtime = Runtime::new();
//! let width = Signal::new(&runtime, 4);
//! let height = Signal::new(&runtime, 3);
//! let area = {
//!     let (width, height) = (width.clone(), height.clone());
//!     Memo::new(&runtime, move || width.get() * height.get())
//! };
//!
//! assert_eq!(area.get(), 12);
//! width.set(10);
//! assert_eq!(area.get(), 30);
//! ```
//!
//! The runtime is single-threaded by construction: handles are `!Send`
//! and all operations complete synchronously.

mod durability;
mod memo;
mod revision;
mod runtime;
mod signal;
mod store;

pub use crate::durability::Durability;
pub use crate::memo::Memo;
pub use crate::revision::Revision;
pub use crate::runtime::Runtime;
pub use crate::signal::Signal;
pub use crate::store::CellId;

use std::fmt;

/// The error returned when a memo could not be computed because its
/// thunk (transitively) attempted to read the memo's own result.
///
/// A detected cycle leaves the dependency graph intact: no edge is
/// recorded for the failed read, and subsequent reads succeed if the
/// cycle condition has been resolved in the meantime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleError {
    cell: CellId,
}

impl CycleError {
    pub(crate) fn new(cell: CellId) -> Self {
        CycleError { cell }
    }

    /// The memo whose computation re-entered itself.
    pub fn cell(&self) -> CellId {
        self.cell
    }

    /// Unwinds with `self` as the panic payload, so the error can
    /// cross the user thunks between the point of detection and the
    /// outermost `get_result`.
    pub(crate) fn throw(self) -> ! {
        std::panic::panic_any(self)
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycle detected: {:?} attempted to read its own result",
            self.cell
        )
    }
}

impl std::error::Error for CycleError {}

/// The `Event` struct identifies various notable things that can
/// occur during execution. Instances of this struct are given to the
/// callback installed with [`Runtime::set_event_handler`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The cell the event concerns.
    pub cell: CellId,

    /// What sort of event it was.
    pub kind: EventKind,
}

/// An enum identifying the various kinds of events that can occur.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Indicates that the thunk for this memo will be executed. This
    /// is either because it has never executed before or because its
    /// inputs may be out of date.
    WillExecute,

    /// Occurs when we found that all dependencies of a memoized value
    /// are up-to-date and hence the value can be re-used without
    /// executing the thunk.
    ///
    /// Executes before the "re-used" value is returned.
    DidValidateMemoizedValue,
}
