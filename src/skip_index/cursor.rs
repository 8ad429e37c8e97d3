use std::ptr;

use super::MAX_LEVEL;
use super::node::{Locked, Node};
use crate::slot::Slot;

/// [`Cursor`] records the locked predecessor at each level during an insertion.
///
/// A [`Node`] may be recorded at several consecutive levels while being locked only once; the
/// lock is released when the last level referring to it is cleared.
pub(super) struct Cursor<'g, S: Slot> {
    entries: [Option<&'g Node<S>>; MAX_LEVEL + 1],
}

impl<'g, S: Slot> Cursor<'g, S> {
    /// Creates an empty [`Cursor`].
    #[inline]
    pub(super) fn new() -> Self {
        Self {
            entries: [None; MAX_LEVEL + 1],
        }
    }

    /// Returns the [`Node`] recorded at the level.
    #[inline]
    pub(super) fn get(&self, level: usize) -> Option<&'g Node<S>> {
        self.entries[level]
    }

    /// Returns `true` if the [`Node`] is recorded at any level.
    #[inline]
    pub(super) fn holds(&self, node: &Node<S>) -> bool {
        self.entries.iter().flatten().any(|n| ptr::eq(*n, node))
    }

    /// Records the [`Node`] at the level, locking it unless it is already held.
    ///
    /// Returns `false` if the [`Node`] is dead, in which case the [`Cursor`] is left unchanged.
    pub(super) fn add(&mut self, level: usize, node: &'g Node<S>) -> bool {
        if self.entries[level].is_some_and(|n| ptr::eq(n, node)) {
            return true;
        }
        if !self.holds(node) {
            let Some(locked) = Locked::lock(node) else {
                return false;
            };
            locked.into_node();
        }
        self.replace(level, node);
        true
    }

    /// Records a [`Node`] the caller has locked, taking over the lock.
    pub(super) fn add_locked(&mut self, level: usize, locked: Locked<'g, S>) {
        let node = locked.into_node();
        debug_assert!(!self.holds(node));
        self.replace(level, node);
    }

    /// Unlocks every recorded [`Node`].
    pub(super) fn release(&mut self) {
        for level in 0..self.entries.len() {
            if let Some(node) = self.entries[level].take() {
                if !self.holds(node) {
                    node.unlock();
                }
            }
        }
    }

    fn replace(&mut self, level: usize, node: &'g Node<S>) {
        if let Some(old) = self.entries[level].replace(node) {
            if !self.holds(old) {
                old.unlock();
            }
        }
    }
}

impl<S: Slot> Drop for Cursor<'_, S> {
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::Extent;

    #[test]
    fn lock_once() {
        let head: Node<Extent> = Node::head();
        let leaf: Node<Extent> = Node::new(2);
        let mut cursor = Cursor::new();
        assert!(cursor.add(3, &head));
        assert!(cursor.add(2, &head));
        assert!(cursor.add(1, &head));
        assert!(cursor.holds(&head));
        assert!(Locked::lock(&leaf).is_some());

        let locked = Locked::lock(&leaf).unwrap();
        cursor.add_locked(1, locked);
        assert!(cursor.add(0, &leaf));
        assert!(ptr::eq(cursor.get(2).unwrap(), &head));
        assert!(ptr::eq(cursor.get(0).unwrap(), &leaf));

        cursor.release();
        assert!(!cursor.holds(&head));
        assert!(Locked::lock(&head).is_some());
        assert!(Locked::lock(&leaf).is_some());
    }

    #[test]
    fn dead_node() {
        let leaf: Node<Extent> = Node::new(0);
        Locked::lock(&leaf).unwrap().kill();
        let mut cursor = Cursor::new();
        assert!(!cursor.add(0, &leaf));
        assert!(cursor.get(0).is_none());
    }
}
