use std::num::NonZeroU64;

/// Value of the initial revision, as a u64. We don't use 0
/// because we want to use a `NonZeroU64`.
const START_U64: u64 = 1;

/// A unique identifier for the current version of the runtime; each
/// time an input is changed, the revision number is incremented.
/// `Revision` is used internally to track which values may need to be
/// recomputed, but not something you should have to interact with
/// directly as a user.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision {
    generation: NonZeroU64,
}

impl Revision {
    pub(crate) fn start() -> Self {
        Self::from(START_U64)
    }

    pub(crate) fn from(g: u64) -> Self {
        Self {
            generation: NonZeroU64::new(g).unwrap(),
        }
    }

    /// The revision immediately following this one. Useful for
    /// asserting how far the clock moved across an operation.
    pub fn next(self) -> Revision {
        assert!(
            self.generation.get() != u64::max_value(),
            "revision overflow"
        );
        Self::from(self.generation.get() + 1)
    }
}

impl std::fmt::Debug for Revision {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "R{}", self.generation)
    }
}
