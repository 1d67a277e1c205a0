/// Describes how likely a value is to change -- how "durable" it is.
/// By default, signals have `Durability::LOW`.
///
/// We use durabilities to optimize the work of "revalidating" a memo
/// after some input has changed. Ordinarily, in a new revision, memos
/// have to trace all their dependencies back to the base signals to
/// determine if any of those signals have changed. But if we know that
/// the only changes were to signals of low durability (the common
/// case), and we know that the memo only used signals of medium
/// durability or higher, then we can skip that walk.
///
/// Typically, one assigns low durabilities to signals that are
/// frequently edited. Medium or high durabilities are used for
/// configuration, workspace metadata, or other things that are
/// unlikely to be changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Durability(u8);

impl Durability {
    /// Low durability: things that change frequently.
    ///
    /// Example: the contents of the file being edited.
    pub const LOW: Durability = Durability(0);

    /// Medium durability: things that change sometimes, but rarely.
    ///
    /// Example: a configuration file.
    pub const MEDIUM: Durability = Durability(1);

    /// High durability: things that are not expected to change under
    /// common usage.
    ///
    /// Example: the standard library of the language being compiled.
    pub const HIGH: Durability = Durability(2);

    /// The maximum possible durability; equivalent to HIGH but
    /// "conceptually" distinct (i.e., if we add more durability
    /// levels, this could change).
    pub(crate) const MAX: Durability = Self::HIGH;

    /// Number of durability levels.
    pub(crate) const LEN: usize = 3;

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for Durability {
    fn default() -> Self {
        Durability::LOW
    }
}
