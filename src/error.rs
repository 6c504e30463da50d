/// Errors reported by the concurrency primitives.
///
/// All errors are local to the failing call; no structure is ever left in an
/// inconsistent state by a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Map keys are non-empty byte strings.
    #[error("key must not be empty")]
    EmptyKey,

    /// The item is not currently linked into the queue.
    #[error("item is not in the queue")]
    NotQueued,

    /// The item is already linked into the queue.
    #[error("item is already in the queue")]
    AlreadyQueued,
}
