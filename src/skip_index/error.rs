#![allow(clippy::module_name_repetitions)]

use std::error;
use std::fmt::{self, Display};

/// [`Error`] types returned by [`SkipIndex`](crate::SkipIndex) operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// AllocationFailure: the leaf budget of the index is exhausted.
    AllocationFailure,
    /// DuplicateRange: the range overlaps an indexed range, or no free range was found.
    DuplicateRange,
    /// RaceLost: the position was claimed by a concurrent writer.
    ///
    /// The tagged key is the lost position which can be used as an updated hint.
    RaceLost(u64),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailure => f.write_str("leaf allocation budget exhausted"),
            Error::DuplicateRange => f.write_str("range overlaps an indexed range"),
            Error::RaceLost(key) => write!(f, "position {key:#x} was claimed concurrently"),
        }
    }
}

impl error::Error for Error {}

/// The outcome of a single optimistic insertion attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum InsertResult {
    /// The slot was inserted.
    Inserted,
    /// The range overlaps an indexed range.
    Duplicate,
    /// Validation failed; retry with locks taken from the tagged level downward.
    Retry(usize),
}

/// The outcome of a lock-free probe into a leaf.
pub(super) enum Probe<'g, S> {
    /// An intersecting slot was found.
    Found(&'g S),
    /// Nothing intersects the range.
    Absent,
    /// The leaf was being modified.
    Retry,
}
