use std::mem::forget;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, fence};

use saa::Lock;
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use super::error::Probe;
use super::{LEAF_LEN, MAX_LEVEL};
use crate::slot::{Slot, overlaps};

/// The number of entries that stay in a [`Node`] when it is split.
const SPLIT_LEN: usize = LEAF_LEN - LEAF_LEN / 2;

/// The level assigned to the sentinel [`Node`].
const HEAD_LEVEL: usize = MAX_LEVEL;

/// [`Node`] is a skip list node carrying a small sorted array of slots.
///
/// The sentinel head of the list is also a [`Node`], which never stores slots and is never
/// killed.
pub(crate) struct Node<S: Slot> {
    /// The highest level the [`Node`] is linked at.
    level: usize,
    /// Exclusive lock; a poisoned lock marks the [`Node`] dead.
    lock: Lock,
    /// Odd while the slot array is being rearranged.
    version: AtomicUsize,
    /// The number of occupied slots.
    nr: AtomicUsize,
    /// The end of the range of the last slot.
    max: AtomicU64,
    /// Sorted keys of the occupied slots.
    keys: [AtomicU64; LEAF_LEN],
    /// Slot handles.
    slots: [AtomicShared<S>; LEAF_LEN],
    /// Per-level predecessor and successor links.
    links: Box<[Link<S>]>,
}

/// [`Link`] connects a [`Node`] to its neighbors at one level.
///
/// The successor link owns a reference to the successor, whereas the predecessor link is a raw
/// pointer that must only be dereferenced under a [`Guard`].
struct Link<S: Slot> {
    prev: AtomicPtr<Node<S>>,
    next: AtomicShared<Node<S>>,
}

/// [`Locked`] holds the exclusive lock on a [`Node`].
pub(super) struct Locked<'g, S: Slot> {
    node: &'g Node<S>,
}

impl<S: Slot> Node<S> {
    /// Creates a new unlinked [`Node`] of the given level.
    pub(super) fn new(level: usize) -> Self {
        debug_assert!(level < MAX_LEVEL);
        Self::with_level(level)
    }

    /// Creates the sentinel [`Node`].
    pub(super) fn head() -> Self {
        Self::with_level(HEAD_LEVEL)
    }

    fn with_level(level: usize) -> Self {
        let links = (0..=level.min(MAX_LEVEL - 1))
            .map(|_| Link {
                prev: AtomicPtr::default(),
                next: AtomicShared::null(),
            })
            .collect();
        Self {
            level,
            lock: Lock::default(),
            version: AtomicUsize::new(0),
            nr: AtomicUsize::new(0),
            max: AtomicU64::new(0),
            keys: std::array::from_fn(|_| AtomicU64::new(0)),
            slots: std::array::from_fn(|_| AtomicShared::null()),
            links,
        }
    }

    /// Returns the level of the [`Node`].
    #[inline]
    pub(super) fn level(&self) -> usize {
        self.level
    }

    /// Returns `true` if the [`Node`] is the sentinel.
    #[inline]
    pub(super) fn is_head(&self) -> bool {
        self.level == HEAD_LEVEL
    }

    /// Returns `true` if the [`Node`] has been killed.
    #[inline]
    pub(super) fn is_dead(&self) -> bool {
        self.lock.is_poisoned(Acquire)
    }

    /// Returns the number of occupied slots.
    #[inline]
    pub(super) fn nr(&self) -> usize {
        self.nr.load(Acquire)
    }

    /// Returns the smallest key in the [`Node`].
    #[inline]
    pub(super) fn min(&self) -> u64 {
        self.keys[0].load(Acquire)
    }

    /// Returns the end of the last range in the [`Node`].
    #[inline]
    pub(super) fn max(&self) -> u64 {
        self.max.load(Acquire)
    }

    /// Returns `true` if `[key, end)` still falls into the live [`Node`].
    #[inline]
    pub(super) fn covers(&self, key: u64, end: u64) -> bool {
        !self.is_dead() && end > self.min() && key < self.max()
    }

    /// Returns a reference to the slot at `index`.
    #[inline]
    pub(super) fn slot_ref<'g>(&self, index: usize, guard: &'g Guard) -> Option<&'g S> {
        self.slots[index].load(Acquire, guard).as_ref()
    }

    /// Returns a new handle to the slot at `index`.
    #[inline]
    pub(super) fn slot(&self, index: usize, guard: &Guard) -> Option<Shared<S>> {
        self.slots[index].get_shared(Acquire, guard)
    }

    /// Searches the sorted key array for the first slot intersecting `[key, end)`.
    ///
    /// Returns `Ok(index)` if one was found, or `Err(index)` pointing at the insert position.
    /// The [`Node`] must be locked.
    pub(super) fn search(&self, key: u64, end: u64, guard: &Guard) -> Result<usize, usize> {
        let nr = self.nr.load(Relaxed);
        let mut low = 0;
        let mut high = nr;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.keys[mid].load(Relaxed) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        // The previous slot starts before `key`; check whether it reaches into the range.
        if low > 0 && self.slot_ref(low - 1, guard).is_some_and(|prev| prev.end() > key) {
            return Ok(low - 1);
        }
        if low < nr && self.keys[low].load(Relaxed) < end {
            return Ok(low);
        }
        Err(low)
    }

    /// Probes the [`Node`] without locking it.
    ///
    /// Slots are shifted in place by writers, therefore a result is only trusted if the key
    /// recorded next to the slot still matches it, and an empty result is only trusted if no
    /// writer touched the array while it was scanned.
    pub(super) fn probe<'g>(&self, key: u64, end: u64, guard: &'g Guard) -> Probe<'g, S> {
        let version = self.version.load(Acquire);
        let nr = self.nr.load(Acquire).min(LEAF_LEN);

        let first = self
            .keys
            .iter()
            .take(nr)
            .position(|k| k.load(Acquire) >= key)
            .unwrap_or(nr);
        for index in first.saturating_sub(1)..(first + 1).min(nr) {
            let Some(found) = self.slot_ref(index, guard) else {
                return Probe::Retry;
            };
            if found.key() != self.keys[index].load(Acquire) {
                return Probe::Retry;
            }
            if overlaps(found, key, end) {
                return Probe::Found(found);
            }
        }

        fence(Acquire);
        if version % 2 == 1 || self.version.load(Relaxed) != version {
            return Probe::Retry;
        }
        Probe::Absent
    }

    /// Fills an unpublished [`Node`] with a single slot.
    pub(super) fn fill(&self, key: u64, slot: Shared<S>) {
        debug_assert_eq!(self.nr.load(Relaxed), 0);
        self.max.store(slot.end(), Relaxed);
        self.keys[0].store(key, Relaxed);
        self.slots[0].swap((Some(slot), Tag::None), Relaxed);
        self.nr.store(1, Release);
    }

    /// Inserts a slot at `index`, shifting the following slots forward.
    ///
    /// The [`Node`] must be locked and must not be full.
    pub(super) fn insert_at(&self, index: usize, key: u64, slot: Shared<S>) {
        let nr = self.nr.load(Relaxed);
        debug_assert!(nr < LEAF_LEN && index <= nr);

        let version = self.begin_write();
        if index == nr {
            self.max.store(slot.end(), Release);
        } else {
            for i in (index..nr).rev() {
                self.move_slot(i, i + 1);
            }
        }
        self.keys[index].store(key, Release);
        self.slots[index].swap((Some(slot), Tag::None), Release);
        self.nr.store(nr + 1, Release);
        self.end_write(version);
    }

    /// Removes the slot at `index`, shifting the following slots backward.
    ///
    /// The smallest key is left untouched when the last slot is removed. The [`Node`] must be
    /// locked.
    pub(super) fn remove_at(&self, index: usize, guard: &Guard) -> Option<Shared<S>> {
        let nr = self.nr.load(Relaxed);
        debug_assert!(index < nr);

        let version = self.begin_write();
        let (removed, _) = self.slots[index].swap((None, Tag::None), Relaxed);
        for i in index + 1..nr {
            self.move_slot(i, i - 1);
        }
        if index == nr - 1 && nr > 1 {
            let last = self.slot_ref(nr - 2, guard).map_or(0, Slot::end);
            self.max.store(last, Release);
        }
        self.nr.store(nr - 1, Release);
        self.end_write(version);
        removed
    }

    /// Copies the upper half of the full [`Node`] into `split`.
    ///
    /// If `index` falls into the upper half, or past the last slot, the new slot is placed into
    /// `split` and `true` is returned. The [`Node`] stays intact until [`Node::truncate`] is
    /// called.
    pub(super) fn split_into(
        &self,
        split: &Node<S>,
        index: usize,
        key: u64,
        slot: Shared<S>,
        guard: &Guard,
    ) -> bool {
        debug_assert_eq!(self.nr.load(Relaxed), LEAF_LEN);
        if index == LEAF_LEN {
            split.fill(key, slot);
            return true;
        }

        let mut new_slot = (index >= SPLIT_LEN).then_some(slot);
        let mut dst = 0;
        for src in SPLIT_LEN..LEAF_LEN {
            if src == index {
                if let Some(slot) = new_slot.take() {
                    split.keys[dst].store(key, Relaxed);
                    split.slots[dst].swap((Some(slot), Tag::None), Relaxed);
                    dst += 1;
                }
            }
            split.keys[dst].store(self.keys[src].load(Relaxed), Relaxed);
            split.slots[dst].swap((self.slot(src, guard), Tag::None), Relaxed);
            dst += 1;
        }
        split.max.store(self.max.load(Relaxed), Relaxed);
        split.nr.store(dst, Release);
        index >= SPLIT_LEN
    }

    /// Drops the upper half of the [`Node`] after it was copied by [`Node::split_into`].
    pub(super) fn truncate(&self, guard: &Guard) {
        let version = self.begin_write();
        let last = self.slot_ref(SPLIT_LEN - 1, guard).map_or(0, Slot::end);
        self.max.store(last, Release);
        self.nr.store(SPLIT_LEN, Release);
        for slot in &self.slots[SPLIT_LEN..] {
            slot.swap((None, Tag::None), Release);
        }
        self.end_write(version);
    }

    /// Releases every slot handle; only used when the list is torn down.
    pub(super) fn clear(&self) {
        for slot in &self.slots {
            slot.swap((None, Tag::None), Relaxed);
        }
        self.nr.store(0, Relaxed);
    }

    /// Returns the successor at the level.
    #[inline]
    pub(super) fn next_ptr<'g>(&self, level: usize, guard: &'g Guard) -> Ptr<'g, Node<S>> {
        self.links[level].next.load(Acquire, guard)
    }

    /// Returns the first successor at the level that is not dead.
    #[inline]
    pub(super) fn live_next_ptr<'g>(&self, level: usize, guard: &'g Guard) -> Ptr<'g, Node<S>> {
        let mut next_ptr = self.next_ptr(level, guard);
        while let Some(next) = next_ptr.as_ref() {
            if !next.is_dead() {
                break;
            }
            next_ptr = next.next_ptr(level, guard);
        }
        next_ptr
    }

    /// Returns a reference to the first live successor at the level.
    #[inline]
    pub(super) fn live_next<'g>(&self, level: usize, guard: &'g Guard) -> Option<&'g Node<S>> {
        self.live_next_ptr(level, guard).as_ref()
    }

    /// Returns the predecessor at the level.
    ///
    /// For the sentinel, this is the last [`Node`] at the level.
    #[inline]
    pub(super) fn prev<'g>(&self, level: usize, _guard: &'g Guard) -> Option<&'g Node<S>> {
        // SAFETY: a node is only retired after every live node stopped pointing to it, and
        // dead nodes are only walked by threads that entered the critical section before the
        // node they point to was retired.
        unsafe { self.links[level].prev.load(Acquire).as_ref() }
    }

    /// Returns the first predecessor at the level that is not dead.
    #[inline]
    pub(super) fn live_prev<'g>(&self, level: usize, guard: &'g Guard) -> Option<&'g Node<S>> {
        if self.is_head() {
            return None;
        }
        let mut prev = self.prev(level, guard)?;
        while prev.is_dead() {
            prev = prev.prev(level, guard)?;
        }
        Some(prev)
    }

    /// Replaces the successor at the level, returning the old one.
    #[inline]
    pub(super) fn set_next(
        &self,
        level: usize,
        next: Option<Shared<Node<S>>>,
    ) -> Option<Shared<Node<S>>> {
        self.links[level].next.swap((next, Tag::None), Release).0
    }

    /// Replaces the predecessor at the level.
    #[inline]
    pub(super) fn set_prev(&self, level: usize, prev: Option<&Node<S>>) {
        let prev = prev.map_or(ptr::null_mut(), |p| ptr::from_ref(p).cast_mut());
        self.links[level].prev.store(prev, Release);
    }

    /// Returns `true` if the [`Node`] links to `target` at the level in either direction.
    #[cfg(test)]
    pub(super) fn links_to(&self, level: usize, target: &Node<S>, guard: &Guard) -> bool {
        let next = self.next_ptr(level, guard).as_ref();
        let prev = self.prev(level, guard);
        next.is_some_and(|n| ptr::eq(n, target)) || prev.is_some_and(|p| ptr::eq(p, target))
    }

    /// Detaches the successor at the level; only used when the list is torn down.
    pub(super) fn take_next(&self, level: usize) -> Option<Shared<Node<S>>> {
        self.links[level].next.swap((None, Tag::None), Relaxed).0
    }

    fn move_slot(&self, from: usize, to: usize) {
        let (moved, _) = self.slots[from].swap((None, Tag::None), Relaxed);
        self.keys[to].store(self.keys[from].load(Relaxed), Release);
        self.slots[to].swap((moved, Tag::None), Release);
    }

    fn begin_write(&self) -> usize {
        let version = self.version.load(Relaxed);
        self.version.store(version + 1, Relaxed);
        fence(Release);
        version + 2
    }

    fn end_write(&self, version: usize) {
        self.version.store(version, Release);
    }
}

impl<'g, S: Slot> Locked<'g, S> {
    /// Locks the [`Node`].
    ///
    /// Returns `None` if the [`Node`] is dead.
    #[inline]
    pub(super) fn lock(node: &'g Node<S>) -> Option<Self> {
        if node.lock.lock_sync() {
            Some(Self { node })
        } else {
            None
        }
    }

    /// Returns the locked [`Node`].
    #[inline]
    pub(super) fn node(&self) -> &'g Node<S> {
        self.node
    }

    /// Transfers the lock to the caller who must release it with [`Node::unlock`].
    #[inline]
    pub(super) fn into_node(self) -> &'g Node<S> {
        let node = self.node;
        forget(self);
        node
    }

    /// Marks the empty [`Node`] dead by poisoning the lock.
    ///
    /// The lock is never released afterwards.
    #[inline]
    pub(super) fn kill(self) {
        debug_assert_eq!(self.node.nr.load(Relaxed), 0);
        debug_assert!(!self.node.is_head());

        let poisoned = self.node.lock.poison_lock();
        debug_assert!(poisoned);
        forget(self);
    }
}

impl<S: Slot> Node<S> {
    /// Releases a lock that was taken through [`Locked::into_node`].
    #[inline]
    pub(super) fn unlock(&self) {
        self.lock.release_lock();
    }
}

impl<S: Slot> Deref for Locked<'_, S> {
    type Target = Node<S>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.node
    }
}

impl<S: Slot> Drop for Locked<'_, S> {
    #[inline]
    fn drop(&mut self) {
        self.node.lock.release_lock();
    }
}
