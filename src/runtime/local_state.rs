use crate::durability::Durability;
use crate::runtime::FxIndexSet;
use crate::store::CellId;
use log::debug;
use std::cell::RefCell;

/// State tracking the in-progress memo computations of the runtime:
/// the query stack. Frames are pushed when a memo's thunk starts
/// executing and popped when it finishes (on every exit path, panics
/// included).
#[derive(Default)]
pub(crate) struct LocalState {
    query_stack: RefCell<Vec<ActiveQuery>>,
}

struct ActiveQuery {
    /// What memo is executing.
    cell: CellId,

    /// Minimum durability of the dependencies observed so far.
    durability: Durability,

    /// Cells read thus far, in first-read order.
    dependencies: FxIndexSet<CellId>,
}

/// Dependency collector handed back when a frame is popped.
pub(crate) struct CompletedQuery {
    pub(crate) durability: Durability,
    pub(crate) dependencies: FxIndexSet<CellId>,
}

impl ActiveQuery {
    fn new(cell: CellId) -> Self {
        ActiveQuery {
            cell,
            durability: Durability::MAX,
            dependencies: FxIndexSet::default(),
        }
    }

    fn add_read(&mut self, input: CellId, durability: Durability) {
        self.dependencies.insert(input);
        self.durability = self.durability.min(durability);
    }
}

impl LocalState {
    pub(crate) fn query_in_progress(&self) -> bool {
        !self.query_stack.borrow().is_empty()
    }

    pub(crate) fn push_query(&self, cell: CellId) {
        debug!("push_query({:?})", cell);
        self.query_stack.borrow_mut().push(ActiveQuery::new(cell));
    }

    /// Pops the frame for `cell`, returning everything it recorded.
    /// The frame must be on top; pushes and pops are strictly nested.
    pub(crate) fn pop_query(&self, cell: CellId) -> CompletedQuery {
        let query = self
            .query_stack
            .borrow_mut()
            .pop()
            .expect("pop_query on an empty query stack");
        assert_eq!(query.cell, cell, "unbalanced query stack");
        CompletedQuery {
            durability: query.durability,
            dependencies: query.dependencies,
        }
    }

    /// Reports that the currently active query read `input`. A no-op
    /// when no query is executing (a read from outside any memo).
    pub(crate) fn report_query_read(&self, input: CellId, durability: Durability) {
        if let Some(top) = self.query_stack.borrow_mut().last_mut() {
            top.add_read(input, durability);
        }
    }
}
