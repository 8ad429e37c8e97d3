//! [`Slot`] is the caller-owned range descriptor indexed by [`SkipIndex`](crate::SkipIndex).

use std::fmt::{self, Debug};

/// [`Slot`] describes a half-open range `[key, key + size)`.
///
/// The index only keeps reference-counted handles to [`Slot`] instances, and it never mutates
/// them; `key` and `size` must stay unchanged while the [`Slot`] is indexed.
pub trait Slot: 'static + Send + Sync {
    /// Returns the first key covered by the range.
    fn key(&self) -> u64;

    /// Returns the number of keys covered by the range.
    fn size(&self) -> u64;

    /// Returns the first key past the range.
    ///
    /// Saturates at [`u64::MAX`].
    #[inline]
    fn end(&self) -> u64 {
        self.key().saturating_add(self.size())
    }
}

/// [`Extent`] is a plain [`Slot`] implementation.
///
/// # Examples
///
/// ```
/// use rangeskip::{Extent, Slot};
///
/// let extent = Extent::new(4096, 512);
/// assert_eq!(extent.end(), 4608);
/// assert!(extent.contains(4096));
/// assert!(!extent.contains(4608));
/// ```
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Extent {
    key: u64,
    size: u64,
}

impl Extent {
    /// Creates a new [`Extent`].
    #[inline]
    #[must_use]
    pub const fn new(key: u64, size: u64) -> Self {
        Self { key, size }
    }

    /// Returns `true` if the [`Extent`] covers `key`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, key: u64) -> bool {
        self.key <= key && key - self.key < self.size
    }
}

impl Slot for Extent {
    #[inline]
    fn key(&self) -> u64 {
        self.key
    }

    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

impl Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.key, self.end())
    }
}

/// Returns `true` if `[key, key + size)` and the [`Slot`] intersect.
#[inline]
pub(crate) fn overlaps<S: Slot>(slot: &S, key: u64, end: u64) -> bool {
    slot.key() < end && slot.end() > key
}
