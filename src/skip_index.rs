//! [`SkipIndex`] is a concurrent skip list indexing disjoint `[key, key + size)` ranges.

mod cursor;
mod error;
mod node;
mod preload;

pub use error::Error;
pub use preload::Preload;

use std::fmt::{self, Debug};
use std::iter::FusedIterator;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use sdd::{Guard, Shared};

use crate::logging::{debug_log, error_log, trace_log, warn_log};
use crate::slot::Slot;
use cursor::Cursor;
use error::{InsertResult, Probe};
use node::{Locked, Node};
use preload::Pool;

/// The number of levels of a [`SkipIndex`], including the level every leaf is linked at.
pub const MAX_LEVEL: usize = 32;

/// The number of slots a single leaf can hold.
pub const LEAF_LEN: usize = 32;

/// Scalable concurrent range index.
///
/// [`SkipIndex`] maps disjoint `[key, key + size)` ranges to slots. Each skip list node is a
/// leaf holding a sorted array of up to [`LEAF_LEN`] slots, and is linked at a random number of
/// levels.
///
/// ## The key features of [`SkipIndex`]
///
/// * Lock-free read: [`SkipIndex::peek`] neither acquires locks nor writes shared memory.
/// * Fine-grained locking: writers lock only the leaves they modify or relink, so writers on
///   disjoint ranges proceed in parallel.
/// * Preload: leaves are allocated by [`SkipIndex::preload`] before any lock is taken.
/// * Deferred reclamation: leaves and slots are freed only after every reader that could observe
///   them has left its critical section.
///
/// ## Locking order
///
/// Locks are acquired from left to right along a level and from top to bottom across levels.
/// A leaf that becomes empty is marked dead by poisoning its lock; the thread that killed it
/// keeps the lock until the leaf is unlinked from every level.
pub struct SkipIndex<S: Slot> {
    /// The sentinel; its predecessor links point to the last leaf of each level.
    head: Box<Node<S>>,
    /// The highest level any leaf has been linked at.
    level: AtomicUsize,
    /// Pre-allocated leaves.
    pool: Pool<S>,
    /// The number of leaves linked or pooled.
    allocated: AtomicUsize,
    /// The maximum number of leaves.
    leaf_limit: usize,
}

/// An iterator over the slots of a [`SkipIndex`] in ascending key order.
///
/// The iterator does not lock leaves. Slots inserted or removed during the scan may or may not
/// be observed, but every yielded key is greater than the previous one.
pub struct Iter<'i, 'g, S: Slot> {
    index: &'i SkipIndex<S>,
    leaf: Option<&'g Node<S>>,
    started: bool,
    pos: usize,
    last_key: Option<u64>,
    guard: &'g Guard,
}

/// A free range found by scanning the leaves.
enum Hole<'g, S: Slot> {
    /// The range fits into the locked leaf before the slot at the index.
    Inside(Locked<'g, S>, usize, u64),
    /// The range lies between two leaves or after the last one.
    Outside(u64),
    /// No range below the limit is free.
    Exhausted,
}

impl<S: Slot> SkipIndex<S> {
    /// Creates an empty [`SkipIndex`].
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// assert!(index.is_empty());
    /// assert_eq!(index.level(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_leaf_limit(usize::MAX)
    }

    /// Creates an empty [`SkipIndex`] that allocates at most `leaf_limit` leaves.
    ///
    /// Leaves sitting in the preload pool count towards the limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Error, Extent, SkipIndex};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::with_leaf_limit(0);
    /// assert_eq!(index.preload().err(), Some(Error::AllocationFailure));
    /// ```
    #[inline]
    #[must_use]
    pub fn with_leaf_limit(leaf_limit: usize) -> Self {
        Self {
            head: Box::new(Node::head()),
            level: AtomicUsize::new(0),
            pool: Pool::new(),
            allocated: AtomicUsize::new(0),
            leaf_limit,
        }
    }

    /// Reserves the leaves a single insertion may need.
    ///
    /// The returned [`Preload`] carries a leaf whose level does not exceed the current level of
    /// the list by more than one, and possibly a level-zero leaf for splits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the leaf limit is reached.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// let preload = index.preload().unwrap();
    /// assert_eq!(preload.token(), 1);
    /// assert!(preload.level() <= 1);
    /// ```
    pub fn preload(&self) -> Result<Preload<'_, S>, Error> {
        let token = (self.level() + 1).min(MAX_LEVEL - 1);
        let mut preload = Preload::new(self, token);
        self.pool.check_out(&mut preload);
        if preload.is_empty() {
            preload.set_leaf(self.alloc(self.random_level(token))?);
        }
        if preload.needs_spare() {
            preload.set_spare(self.alloc(0).ok());
        }
        Ok(preload)
    }

    /// Draws a random leaf level not exceeding `max_level`.
    ///
    /// Each additional level is reached with probability 1/2.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// assert_eq!(index.random_level(0), 0);
    /// assert!(index.random_level(3) <= 3);
    /// ```
    #[must_use]
    pub fn random_level(&self, max_level: usize) -> usize {
        let cap = max_level.min(MAX_LEVEL - 1);
        let mut seed = rand::random::<u64>();
        let mut level = 0;
        while level < cap && seed & 1 == 1 {
            level += 1;
            seed >>= 1;
        }
        level
    }

    /// Inserts a slot.
    ///
    /// The range of the slot is `[slot.key(), slot.key() + slot.size())`. The [`Preload`] is
    /// consumed; leaves that were not used go back to the pool.
    ///
    /// # Errors
    ///
    /// Returns the slot back if its range is empty, overlaps an indexed range, or the
    /// [`Preload`] was taken from another index.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    /// use sdd::Shared;
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    ///
    /// let preload = index.preload().unwrap();
    /// assert!(index.insert(Shared::new(Extent::new(0, 4096)), preload).is_ok());
    ///
    /// let preload = index.preload().unwrap();
    /// let rejected = index.insert(Shared::new(Extent::new(2048, 4096)), preload);
    /// assert_eq!(rejected.err().map(|slot| slot.key()), Some(2048));
    /// ```
    pub fn insert(&self, slot: Shared<S>, mut preload: Preload<'_, S>) -> Result<(), Shared<S>> {
        if !ptr::eq(preload.index, self) {
            warn_log!(key = slot.key(), "preload of another index rejected");
            return Err(slot);
        }
        if self.insert_leased(&slot, &mut preload) {
            Ok(())
        } else {
            Err(slot)
        }
    }

    /// Finds a free range of `size` at or after `hint`, and inserts the slot `constructor`
    /// builds for the key of the range.
    ///
    /// The key is a multiple of `align`, and the range does not reach beyond `limit`.
    ///
    /// # Errors
    ///
    /// * [`Error::AllocationFailure`] if no leaf could be reserved.
    /// * [`Error::DuplicateRange`] if no free range fits below `limit`, or the slot `constructor`
    ///   builds does not cover exactly `[key, key + size)`.
    /// * [`Error::RaceLost`] if a concurrent writer claimed the range first; the tagged key can
    ///   be used as the next hint.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    ///
    /// let first = index.insert_hole(0, 1 << 20, 4096, 4096, |key| Extent::new(key, 4096));
    /// assert_eq!(first.unwrap().key(), 0);
    ///
    /// let second = index.insert_hole(0, 1 << 20, 4096, 4096, |key| Extent::new(key, 4096));
    /// assert_eq!(second.unwrap().key(), 4096);
    /// ```
    pub fn insert_hole<F: FnOnce(u64) -> S>(
        &self,
        hint: u64,
        limit: u64,
        size: u64,
        align: u64,
        constructor: F,
    ) -> Result<Shared<S>, Error> {
        if size == 0 {
            return Err(Error::DuplicateRange);
        }
        let mut preload = self.preload()?;
        let guard = Guard::new();
        let hole = self.find_hole(hint, limit, size, align.max(1), &guard);
        self.claim_hole(hole, size, constructor, &mut preload, &guard)
    }

    /// Returns the slot with the lowest key intersecting `[key, key + size)`.
    ///
    /// The leaf is locked while being searched. A `size` of zero is treated as one.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    /// use sdd::Shared;
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// let preload = index.preload().unwrap();
    /// assert!(index.insert(Shared::new(Extent::new(100, 10)), preload).is_ok());
    ///
    /// assert_eq!(index.lookup(105, 1).map(|slot| slot.key()), Some(100));
    /// assert_eq!(index.lookup(90, 20).map(|slot| slot.key()), Some(100));
    /// assert!(index.lookup(110, 1).is_none());
    /// ```
    #[must_use]
    pub fn lookup(&self, key: u64, size: u64) -> Option<Shared<S>> {
        let end = key.saturating_add(size.max(1));
        let guard = Guard::new();
        loop {
            let leaf = self.lookup_leaf(key, end, &guard)?;
            let Some(leaf) = Locked::lock(leaf) else {
                continue;
            };
            if !leaf.covers(key, end) {
                continue;
            }
            return leaf
                .search(key, end, &guard)
                .ok()
                .and_then(|index| leaf.slot(index, &guard));
        }
    }

    /// Returns a reference to the slot with the lowest key intersecting `[key, key + size)`
    /// without acquiring locks.
    ///
    /// The reference is valid as long as the supplied [`Guard`] is alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    /// use sdd::{Guard, Shared};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// let preload = index.preload().unwrap();
    /// assert!(index.insert(Shared::new(Extent::new(100, 10)), preload).is_ok());
    ///
    /// let guard = Guard::new();
    /// assert_eq!(index.peek(109, 1, &guard).map(|slot| slot.size()), Some(10));
    /// assert!(index.peek(0, 100, &guard).is_none());
    /// ```
    #[must_use]
    pub fn peek<'g>(&self, key: u64, size: u64, guard: &'g Guard) -> Option<&'g S> {
        let end = key.saturating_add(size.max(1));
        loop {
            let leaf = self.lookup_leaf(key, end, guard)?;
            match leaf.probe(key, end, guard) {
                Probe::Found(slot) => return Some(slot),
                Probe::Absent if leaf.covers(key, end) => return None,
                Probe::Absent | Probe::Retry => (),
            }
        }
    }

    /// Removes the slot with the lowest key intersecting `[key, key + size)`, and returns it.
    ///
    /// A leaf left empty is unlinked from every level and retired.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    /// use sdd::Shared;
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// let preload = index.preload().unwrap();
    /// assert!(index.insert(Shared::new(Extent::new(100, 10)), preload).is_ok());
    ///
    /// assert_eq!(index.remove(100, 10).map(|slot| slot.key()), Some(100));
    /// assert!(index.remove(100, 10).is_none());
    /// assert!(index.is_empty());
    /// ```
    pub fn remove(&self, key: u64, size: u64) -> Option<Shared<S>> {
        let end = key.saturating_add(size.max(1));
        let guard = Guard::new();
        loop {
            let leaf = self.lookup_leaf(key, end, &guard)?;
            let Some(leaf) = Locked::lock(leaf) else {
                continue;
            };
            if !leaf.covers(key, end) {
                continue;
            }
            let index = leaf.search(key, end, &guard).ok()?;
            let removed = leaf.remove_at(index, &guard);
            if leaf.nr() == 0 {
                let node = leaf.node();
                leaf.kill();
                let detached = self.erase(node, &guard);
                self.retire(node, detached, &guard);
            }
            return removed;
        }
    }

    /// Returns an [`Iter`] over the slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex, Slot};
    /// use sdd::{Guard, Shared};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// for key in [3, 1, 2] {
    ///     let preload = index.preload().unwrap();
    ///     assert!(index.insert(Shared::new(Extent::new(key, 1)), preload).is_ok());
    /// }
    ///
    /// let guard = Guard::new();
    /// let keys: Vec<u64> = index.iter(&guard).map(|slot| slot.key()).collect();
    /// assert_eq!(keys, [1, 2, 3]);
    /// ```
    #[inline]
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'_, 'g, S> {
        Iter {
            index: self,
            leaf: None,
            started: false,
            pos: 0,
            last_key: None,
            guard,
        }
    }

    /// Returns the number of slots.
    ///
    /// The slots are counted by scanning the list.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter(&Guard::new()).count()
    }

    /// Returns `true` if the [`SkipIndex`] holds no slots.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter(&Guard::new()).next().is_none()
    }

    /// Returns the highest level any leaf is linked at.
    #[inline]
    #[must_use]
    pub fn level(&self) -> usize {
        self.level.load(Acquire)
    }

    /// Returns the end of the highest indexed range.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex};
    /// use sdd::Shared;
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::new();
    /// assert!(index.highest_key().is_none());
    ///
    /// let preload = index.preload().unwrap();
    /// assert!(index.insert(Shared::new(Extent::new(100, 10)), preload).is_ok());
    /// assert_eq!(index.highest_key(), Some(110));
    /// ```
    #[must_use]
    pub fn highest_key(&self) -> Option<u64> {
        let guard = Guard::new();
        loop {
            let tail = self.head.prev(0, &guard)?;
            let Some(tail) = Locked::lock(tail) else {
                continue;
            };
            if self
                .head
                .prev(0, &guard)
                .is_some_and(|t| ptr::eq(t, tail.node()))
            {
                return Some(tail.max());
            }
        }
    }

    /// Returns the maximum number of leaves.
    #[inline]
    #[must_use]
    pub fn leaf_limit(&self) -> usize {
        self.leaf_limit
    }

    /// Returns the number of leaves that are linked or pooled.
    #[inline]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Relaxed)
    }

    /// Allocates a leaf within the leaf limit.
    fn alloc(&self, level: usize) -> Result<Shared<Node<S>>, Error> {
        let reserved = self.allocated.fetch_update(AcqRel, Acquire, |allocated| {
            (allocated < self.leaf_limit).then_some(allocated + 1)
        });
        if reserved.is_err() {
            warn_log!(limit = self.leaf_limit, "leaf limit reached");
            return Err(Error::AllocationFailure);
        }
        Ok(Shared::new(Node::new(level)))
    }

    /// Allocates a leaf regardless of the leaf limit.
    fn alloc_unchecked(&self, level: usize) -> Shared<Node<S>> {
        self.allocated.fetch_add(1, Relaxed);
        Shared::new(Node::new(level))
    }

    /// Drops an unused leaf.
    fn discard(&self, leaf: Shared<Node<S>>) {
        drop(leaf);
        self.allocated.fetch_sub(1, Relaxed);
    }

    fn raise_level(&self, level: usize) {
        let prev = self.level.fetch_max(level, AcqRel);
        if level > prev {
            debug_log!(level, "list level raised");
        }
    }

    /// Inserts the slot, consuming leaves from the [`Preload`] as needed.
    ///
    /// Returns `false` if the range is empty or overlaps an indexed range.
    fn insert_leased(&self, slot: &Shared<S>, preload: &mut Preload<'_, S>) -> bool {
        let key = slot.key();
        let Some(end) = key.checked_add(slot.size()).filter(|end| *end > key) else {
            return false;
        };
        let guard = Guard::new();
        let mut pending = preload.level();
        if let Some(result) = self.append_to_tail(key, end, slot, preload, pending, &guard) {
            return result == InsertResult::Inserted;
        }
        loop {
            match self.try_insert(key, end, slot, preload, pending, &guard) {
                InsertResult::Inserted => return true,
                InsertResult::Duplicate => return false,
                InsertResult::Retry(level) => {
                    trace_log!(key, level, "insert retried with a higher pending level");
                    pending = level.min(MAX_LEVEL);
                }
            }
        }
    }

    /// Appends the slot to the last leaf if nothing needs to be linked above it.
    fn append_to_tail(
        &self,
        key: u64,
        end: u64,
        slot: &Shared<S>,
        preload: &mut Preload<'_, S>,
        pending: usize,
        guard: &Guard,
    ) -> Option<InsertResult> {
        let fits = |tail: &Node<S>| tail.min() <= key && (pending == 0 || tail.nr() < LEAF_LEN);
        let tail = self.head.prev(0, guard)?;
        if !fits(tail) {
            return None;
        }
        let tail = Locked::lock(tail)?;
        let is_tail = self
            .head
            .prev(0, guard)
            .is_some_and(|t| ptr::eq(t, tail.node()));
        if !is_tail || !fits(&tail) || !tail.next_ptr(0, guard).is_null() {
            return None;
        }
        Some(self.find_or_add(&tail, None, key, end, slot, preload, guard))
    }

    /// Descends the list locking the predecessors at and below `pending`, and inserts the slot.
    fn try_insert<'g>(
        &'g self,
        key: u64,
        end: u64,
        slot: &Shared<S>,
        preload: &mut Preload<'_, S>,
        pending: usize,
        guard: &'g Guard,
    ) -> InsertResult {
        let mut cursor = Cursor::new();
        let mut succ = None;
        let mut p: &'g Node<S> = &self.head;
        for level in (0..=self.level().max(preload.level())).rev() {
            if level > pending {
                p = Self::walk(p, level, key, guard);
                continue;
            }
            if !cursor.add(level, p) || (!p.is_head() && p.min() > key) {
                return InsertResult::Retry(pending + 1);
            }
            while let Some(next) = p.live_next(level, guard) {
                let Some(next) = Locked::lock(next) else {
                    continue;
                };
                let adjacent = p
                    .live_next(level, guard)
                    .is_some_and(|n| ptr::eq(n, next.node()))
                    && next
                        .live_prev(level, guard)
                        .is_some_and(|n| ptr::eq(n, p));
                if !adjacent {
                    return InsertResult::Retry(pending + 1);
                }
                if next.min() > key {
                    if level == 0 {
                        succ = Some(next);
                    }
                    break;
                }
                p = next.node();
                cursor.add_locked(level, next);
            }
        }

        if p.is_head() {
            let Some(first) = succ else {
                return self.link_first_leaf(key, slot, preload, &cursor, guard);
            };
            if end > first.min() {
                return InsertResult::Duplicate;
            }
            return self.find_or_add(first.node(), Some(&cursor), key, end, slot, preload, guard);
        }
        if succ.as_ref().is_some_and(|next| end > next.min()) {
            return InsertResult::Duplicate;
        }
        drop(succ);
        self.find_or_add(p, Some(&cursor), key, end, slot, preload, guard)
    }

    /// Inserts the slot into the locked leaf unless it overlaps a slot in it.
    #[allow(clippy::too_many_arguments)]
    fn find_or_add<'g>(
        &self,
        leaf: &Node<S>,
        cursor: Option<&Cursor<'g, S>>,
        key: u64,
        end: u64,
        slot: &Shared<S>,
        preload: &mut Preload<'_, S>,
        guard: &Guard,
    ) -> InsertResult {
        let index = if key < leaf.max() {
            match leaf.search(key, end, guard) {
                Ok(_) => return InsertResult::Duplicate,
                Err(index) => index,
            }
        } else {
            leaf.nr()
        };
        self.add_key_to_leaf(leaf, index, key, slot, cursor, preload, guard);
        InsertResult::Inserted
    }

    /// Inserts the slot at `index` of the locked leaf, splitting the leaf if it is full.
    ///
    /// Without a [`Cursor`], the leaf split off must be a level-zero one.
    #[allow(clippy::too_many_arguments)]
    fn add_key_to_leaf<'g>(
        &self,
        leaf: &Node<S>,
        index: usize,
        key: u64,
        slot: &Shared<S>,
        cursor: Option<&Cursor<'g, S>>,
        preload: &mut Preload<'_, S>,
        guard: &Guard,
    ) {
        if leaf.nr() < LEAF_LEN {
            leaf.insert_at(index, key, slot.clone());
            return;
        }

        let split = preload.take_split(leaf.level(), cursor.is_none());
        let level = split.level();
        self.raise_level(level);
        let locked = Locked::lock(&split);
        let moved = leaf.split_into(&split, index, key, slot.clone(), guard);
        self.link_after(&split, leaf, cursor, guard);
        if index < LEAF_LEN {
            leaf.truncate(guard);
        }
        drop(locked);
        if !moved {
            leaf.insert_at(index, key, slot.clone());
        }
        trace_log!(key, level, "leaf split");
    }

    /// Links the first leaf of the empty list.
    fn link_first_leaf(
        &self,
        key: u64,
        slot: &Shared<S>,
        preload: &mut Preload<'_, S>,
        cursor: &Cursor<'_, S>,
        guard: &Guard,
    ) -> InsertResult {
        let leaf = preload.take_leaf();
        let locked = Locked::lock(&leaf);
        leaf.fill(key, slot.clone());
        self.raise_level(leaf.level());
        self.link_after(&leaf, &self.head, Some(cursor), guard);
        drop(locked);
        InsertResult::Inserted
    }

    /// Links the locked, unpublished `node` bottom-up.
    ///
    /// `after` is its predecessor at every level `after` is linked at; the [`Cursor`] supplies
    /// the predecessors above that.
    fn link_after(
        &self,
        node: &Shared<Node<S>>,
        after: &Node<S>,
        cursor: Option<&Cursor<'_, S>>,
        guard: &Guard,
    ) {
        for level in 0..=node.level() {
            let pred = if level <= after.level() {
                Some(after)
            } else {
                cursor.and_then(|cursor| cursor.get(level))
            };
            let Some(pred) = pred else {
                debug_assert!(false, "no predecessor locked at level {level}");
                error_log!(level, "leaf left unlinked above the level");
                break;
            };
            self.link_one_level(pred, node, level, guard);
        }
    }

    /// Links `node` after the locked `pred` at the level.
    fn link_one_level(&self, pred: &Node<S>, node: &Shared<Node<S>>, level: usize, guard: &Guard) {
        let node_ref: &Node<S> = node;
        loop {
            let next_ptr = pred.live_next_ptr(level, guard);
            let next = match next_ptr.as_ref() {
                Some(next) => match Locked::lock(next) {
                    Some(next) => Some(next),
                    None => continue,
                },
                None => None,
            };
            if let Some(next) = next.as_ref() {
                let adjacent = pred
                    .live_next(level, guard)
                    .is_some_and(|n| ptr::eq(n, next.node()))
                    && next
                        .live_prev(level, guard)
                        .is_some_and(|p| ptr::eq(p, pred));
                if !adjacent {
                    continue;
                }
            }

            node_ref.set_next(level, next_ptr.get_shared());
            node_ref.set_prev(level, Some(pred));
            drop(pred.set_next(level, Some(node.clone())));
            match next.as_ref() {
                Some(next) => next.set_prev(level, Some(node_ref)),
                None => self.head.set_prev(level, Some(node_ref)),
            }
            return;
        }
    }

    /// Unlinks the dead `node` from every level, top-down.
    ///
    /// Returns the handles the predecessors held to `node`.
    fn erase(&self, node: &Node<S>, guard: &Guard) -> Vec<Shared<Node<S>>> {
        let mut detached = Vec::new();
        for level in (0..=node.level()).rev() {
            if let Some(old) = self.erase_one_level(node, level, guard) {
                if ptr::eq(&*old, node) {
                    detached.push(old);
                }
            }
        }
        detached
    }

    /// Makes the live predecessor of `node` point past it at the level.
    fn erase_one_level(
        &self,
        node: &Node<S>,
        level: usize,
        guard: &Guard,
    ) -> Option<Shared<Node<S>>> {
        loop {
            let prev = node.live_prev(level, guard)?;
            let Some(prev) = Locked::lock(prev) else {
                continue;
            };
            if !node
                .live_prev(level, guard)
                .is_some_and(|p| ptr::eq(p, prev.node()))
            {
                trace_log!(level, "erase retried on a moved predecessor");
                continue;
            }

            let next_ptr = prev.live_next_ptr(level, guard);
            let next = match next_ptr.as_ref() {
                Some(next) => match Locked::lock(next) {
                    Some(next) => Some(next),
                    None => continue,
                },
                None => None,
            };
            if let Some(next) = next.as_ref() {
                let adjacent = prev
                    .live_next(level, guard)
                    .is_some_and(|n| ptr::eq(n, next.node()))
                    && next
                        .live_prev(level, guard)
                        .is_some_and(|p| ptr::eq(p, prev.node()));
                if !adjacent {
                    trace_log!(level, "erase retried on a moved successor");
                    continue;
                }
            }

            let old = prev.set_next(level, next_ptr.get_shared());
            match next.as_ref() {
                Some(next) => next.set_prev(level, Some(prev.node())),
                None if prev.is_head() => self.head.set_prev(level, None),
                None => self.head.set_prev(level, Some(prev.node())),
            }
            return old;
        }
    }

    /// Hands the unlinked leaf over to deferred reclamation.
    #[cfg_attr(not(test), allow(unused_variables))]
    fn retire(&self, node: &Node<S>, detached: Vec<Shared<Node<S>>>, guard: &Guard) {
        #[cfg(test)]
        assert!(
            !self.is_referenced(node, guard),
            "a retired leaf is still linked"
        );
        drop(detached);
        self.allocated.fetch_sub(1, Relaxed);
        trace_log!(level = node.level(), "leaf retired");
    }

    /// Returns `true` if any live node or the sentinel links to `node`.
    #[cfg(test)]
    fn is_referenced(&self, node: &Node<S>, guard: &Guard) -> bool {
        (0..MAX_LEVEL).any(|level| {
            if self.head.links_to(level, node, guard) {
                return true;
            }
            let mut current = self.head.next_ptr(level, guard).as_ref();
            while let Some(n) = current {
                if !n.is_dead() && n.links_to(level, node, guard) {
                    return true;
                }
                current = n.next_ptr(level, guard).as_ref();
            }
            false
        })
    }

    /// Returns the last live node at the level whose smallest key is not greater than `key`.
    fn walk<'g>(mut p: &'g Node<S>, level: usize, key: u64, guard: &'g Guard) -> &'g Node<S> {
        while let Some(next) = p.live_next(level, guard) {
            if next.min() > key {
                break;
            }
            p = next;
        }
        p
    }

    /// Finds the leaf that may hold a slot intersecting `[key, end)` without acquiring locks.
    fn lookup_leaf<'g>(&'g self, key: u64, end: u64, guard: &'g Guard) -> Option<&'g Node<S>> {
        'restart: loop {
            let mut p: &'g Node<S> = &self.head;
            for level in (0..=self.level()).rev() {
                while let Some(leaf) = p.live_next(level, guard) {
                    let min = leaf.min();
                    if key >= leaf.max() {
                        p = leaf;
                        continue;
                    }
                    if key >= min {
                        return Some(leaf);
                    }
                    let stable = leaf
                        .live_prev(level, guard)
                        .is_some_and(|prev| ptr::eq(prev, p))
                        && leaf.min() == min
                        && !p.is_dead()
                        && !leaf.is_dead();
                    if !stable {
                        continue 'restart;
                    }
                    if level == 0 && end > min {
                        return Some(leaf);
                    }
                    break;
                }
            }
            return None;
        }
    }

    /// Inserts the slot built for a hole [`find_hole`](Self::find_hole) returned.
    ///
    /// A leaf locked by the scan is used directly when the slot fits without linking a new
    /// leaf above level zero; otherwise the lock is released and the slot goes through the
    /// general insertion path with the same lease.
    fn claim_hole<'g, F: FnOnce(u64) -> S>(
        &'g self,
        hole: Hole<'g, S>,
        size: u64,
        constructor: F,
        preload: &mut Preload<'_, S>,
        guard: &'g Guard,
    ) -> Result<Shared<S>, Error> {
        let (direct, key) = match hole {
            Hole::Exhausted => return Err(Error::DuplicateRange),
            Hole::Inside(leaf, index, key) if leaf.nr() < LEAF_LEN || preload.has_shallow() => {
                (Some((leaf, index)), key)
            }
            Hole::Inside(leaf, _, key) => {
                drop(leaf);
                (None, key)
            }
            Hole::Outside(key) => (None, key),
        };

        let slot = Shared::new(constructor(key));
        if (slot.key(), slot.size()) != (key, size) {
            warn_log!(key, size, "constructed slot does not match the free range");
            return Err(Error::DuplicateRange);
        }
        if let Some((leaf, index)) = direct {
            self.add_key_to_leaf(&leaf, index, key, &slot, None, preload, guard);
            return Ok(slot);
        }
        if self.insert_leased(&slot, preload) {
            Ok(slot)
        } else {
            debug_log!(key, "free range claimed concurrently");
            Err(Error::RaceLost(key))
        }
    }

    /// Scans the leaves for a free range of `size` at or after `hint`.
    fn find_hole<'g>(
        &'g self,
        hint: u64,
        limit: u64,
        size: u64,
        align: u64,
        guard: &'g Guard,
    ) -> Hole<'g, S> {
        let fits = |start: u64| start.checked_add(size).is_some_and(|end| end <= limit);
        let Some(start) = hint.checked_next_multiple_of(align) else {
            return Hole::Exhausted;
        };
        if !fits(start) {
            return Hole::Exhausted;
        }
        'restart: loop {
            let p = (0..=self.level())
                .rev()
                .fold(&*self.head, |p, level| Self::walk(p, level, start, guard));
            let Some(mut current) = Locked::lock(p) else {
                continue;
            };
            if !current.is_head() && current.min() > start {
                continue;
            }

            let mut candidate = start;
            loop {
                for index in 0..current.nr() {
                    let Some(slot) = current.slot_ref(index, guard) else {
                        continue;
                    };
                    if slot.end() <= candidate {
                        continue;
                    }
                    if candidate
                        .checked_add(size)
                        .is_some_and(|end| end <= slot.key())
                    {
                        return if index > 0 {
                            Hole::Inside(current, index, candidate)
                        } else {
                            Hole::Outside(candidate)
                        };
                    }
                    candidate = match slot.end().checked_next_multiple_of(align) {
                        Some(next) if fits(next) => next,
                        _ => return Hole::Exhausted,
                    };
                }

                let next = loop {
                    let Some(next) = current.live_next(0, guard) else {
                        break None;
                    };
                    if let Some(next) = Locked::lock(next) {
                        break Some(next);
                    }
                };
                let Some(next) = next else {
                    break;
                };
                if next
                    .live_prev(0, guard)
                    .is_none_or(|prev| !ptr::eq(prev, current.node()))
                {
                    continue 'restart;
                }
                current = next;
            }
            return Hole::Outside(candidate);
        }
    }
}

impl<S: Slot> Default for SkipIndex<S> {
    /// Creates an empty [`SkipIndex`] without a leaf limit.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeskip::{Extent, SkipIndex};
    ///
    /// let index: SkipIndex<Extent> = SkipIndex::default();
    /// assert_eq!(index.leaf_limit(), usize::MAX);
    /// ```
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Slot + Debug> Debug for SkipIndex<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_list().entries(self.iter(&guard)).finish()
    }
}

impl<S: Slot> Drop for SkipIndex<S> {
    fn drop(&mut self) {
        for level in 1..MAX_LEVEL {
            drop(self.head.take_next(level));
        }
        let mut next = self.head.take_next(0);
        while let Some(leaf) = next {
            for level in 1..=leaf.level() {
                drop(leaf.take_next(level));
            }
            leaf.clear();
            next = leaf.take_next(0);
        }
    }
}

impl<'g, S: Slot> Iterator for Iter<'_, 'g, S> {
    type Item = &'g S;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.leaf = self.index.head.live_next(0, self.guard);
        }
        while let Some(leaf) = self.leaf {
            while self.pos < leaf.nr().min(LEAF_LEN) {
                let index = self.pos;
                self.pos += 1;
                let Some(slot) = leaf.slot_ref(index, self.guard) else {
                    continue;
                };
                if self.last_key.is_some_and(|last| slot.key() <= last) {
                    continue;
                }
                self.last_key.replace(slot.key());
                return Some(slot);
            }
            self.leaf = leaf.live_next(0, self.guard);
            self.pos = 0;
        }
        None
    }
}

impl<S: Slot> FusedIterator for Iter<'_, '_, S> {}

#[cfg(test)]
mod test {
    use super::*;

    use crate::Extent;

    fn insert(index: &SkipIndex<Extent>, key: u64, size: u64) -> bool {
        let preload = index.preload().unwrap();
        index
            .insert(Shared::new(Extent::new(key, size)), preload)
            .is_ok()
    }

    #[test]
    fn split_and_merge_levels() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        for key in (0..LEAF_LEN as u64 * 8).rev() {
            assert!(insert(&index, key * 16, 16));
        }
        assert_eq!(index.len(), LEAF_LEN * 8);
        assert!(index.allocated() >= 8);

        let guard = Guard::new();
        for level in 0..MAX_LEVEL {
            let mut current = index.head.live_next(level, &guard);
            let mut last = None;
            while let Some(node) = current {
                assert!(node.level() >= level);
                assert!(last.is_none_or(|last| last < node.min()));
                last.replace(node.min());
                current = node.live_next(level, &guard);
            }
        }
        drop(guard);

        for key in 0..LEAF_LEN as u64 * 8 {
            assert_eq!(index.remove(key * 16, 1).map(|e| e.key()), Some(key * 16));
        }
        assert!(index.is_empty());
        assert!(index.highest_key().is_none());
        let guard = Guard::new();
        assert!((0..MAX_LEVEL).all(|level| index.head.next_ptr(level, &guard).is_null()));
        assert!((0..MAX_LEVEL).all(|level| index.head.prev(level, &guard).is_none()));
    }

    #[test]
    fn tail_cache() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        for key in 0..LEAF_LEN as u64 * 3 {
            assert!(insert(&index, key * 8, 8));
        }
        let guard = Guard::new();
        let tail = index.head.prev(0, &guard).unwrap();
        assert!(tail.next_ptr(0, &guard).is_null());
        assert_eq!(tail.max(), LEAF_LEN as u64 * 3 * 8);
        assert_eq!(index.highest_key(), Some(LEAF_LEN as u64 * 3 * 8));
    }

    #[test]
    fn hole_inside_full_leaf() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        assert!(insert(&index, 0, 16));
        for key in 2..=LEAF_LEN as u64 {
            assert!(insert(&index, key * 16, 16));
        }
        assert_eq!(index.len(), LEAF_LEN);

        let slot = index
            .insert_hole(0, u64::MAX, 16, 16, |key| Extent::new(key, 16))
            .unwrap();
        assert_eq!(slot.key(), 16);
        assert_eq!(index.len(), LEAF_LEN + 1);

        let guard = Guard::new();
        let keys: Vec<u64> = index.iter(&guard).map(Slot::key).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn hole_claimed_concurrently() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        assert!(insert(&index, 8192, 4096));

        let mut preload = index.preload().unwrap();
        let token = preload.token();
        let guard = Guard::new();
        let hole = index.find_hole(0, 1 << 20, 4096, 4096, &guard);
        assert!(matches!(hole, Hole::Outside(0)));

        assert!(insert(&index, 0, 2048));
        let result =
            index.claim_hole(hole, 4096, |key| Extent::new(key, 4096), &mut preload, &guard);
        assert_eq!(result.err(), Some(Error::RaceLost(0)));
        let keys: Vec<(u64, u64)> = index.iter(&guard).map(|s| (s.key(), s.size())).collect();
        assert_eq!(keys, vec![(0, 2048), (8192, 4096)]);

        assert_eq!(preload.token(), token);
        assert!(!preload.is_empty());
        assert!(index.insert(Shared::new(Extent::new(4096, 4096)), preload).is_ok());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn hole_fallback_with_deep_lease() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        let shallow_insert = |key: u64| {
            let mut preload = Preload::new(&index, 0);
            preload.set_leaf(index.alloc_unchecked(0));
            index.insert(Shared::new(Extent::new(key, 16)), preload).is_ok()
        };
        assert!(shallow_insert(0));
        for key in 2..=LEAF_LEN as u64 {
            assert!(shallow_insert(key * 16));
        }
        let guard = Guard::new();
        let leaf = index.head.live_next(0, &guard).unwrap();
        assert_eq!(leaf.nr(), LEAF_LEN);

        let mut preload = Preload::new(&index, 1);
        preload.set_leaf(index.alloc_unchecked(1));
        assert!(!preload.has_shallow());
        let hole = index.find_hole(0, u64::MAX, 16, 16, &guard);
        assert!(matches!(hole, Hole::Inside(_, 1, 16)));
        let slot = index
            .claim_hole(hole, 16, |key| Extent::new(key, 16), &mut preload, &guard)
            .unwrap();
        assert_eq!(slot.key(), 16);
        assert_eq!(index.len(), LEAF_LEN + 1);
        assert!(preload.is_empty());
        assert_eq!(index.lookup(16, 1).map(|s| s.key()), Some(16));
        let keys: Vec<u64> = index.iter(&guard).map(Slot::key).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn hole_slot_mismatch() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        assert!(insert(&index, 0, 16));
        assert!(insert(&index, 32, 16));

        let grown = index.insert_hole(0, 1 << 20, 16, 16, |key| Extent::new(key, 40));
        assert_eq!(grown.err(), Some(Error::DuplicateRange));
        let moved = index.insert_hole(0, 1 << 20, 16, 16, |key| Extent::new(key + 1, 16));
        assert_eq!(moved.err(), Some(Error::DuplicateRange));
        let tail = index.insert_hole(64, 1 << 20, 16, 16, |key| Extent::new(key, 8));
        assert_eq!(tail.err(), Some(Error::DuplicateRange));

        let guard = Guard::new();
        let keys: Vec<(u64, u64)> = index.iter(&guard).map(|s| (s.key(), s.size())).collect();
        assert_eq!(keys, vec![(0, 16), (32, 16)]);
        assert_eq!(index.peek(16, 16, &guard).map(Slot::key), None);
    }

    #[test]
    fn foreign_preload() {
        let index: SkipIndex<Extent> = SkipIndex::default();
        let other: SkipIndex<Extent> = SkipIndex::default();
        let preload = other.preload().unwrap();
        let allocated = index.allocated();
        let rejected = index.insert(Shared::new(Extent::new(0, 16)), preload);
        assert_eq!(rejected.err().map(|slot| slot.key()), Some(0));
        assert!(index.is_empty());
        assert!(other.is_empty());
        assert_eq!(index.allocated(), allocated);
        assert!(insert(&index, 0, 16));
    }
}
