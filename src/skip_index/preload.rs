use std::cell::UnsafeCell;
use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::thread::available_parallelism;

use saa::Lock;
use sdd::Shared;

use super::node::Node;
use super::{MAX_LEVEL, SkipIndex};
use crate::logging::error_log;
use crate::slot::Slot;

/// [`Preload`] is an exclusive lease on pre-allocated leaves for a single insertion.
///
/// A [`Preload`] is obtained through [`SkipIndex::preload`] before locks are taken, and consumed
/// by [`SkipIndex::insert`]. Leaves that were not used are handed back to the pool of the index
/// when the [`Preload`] is dropped.
pub struct Preload<'i, S: Slot> {
    /// The index the leaves belong to.
    pub(super) index: &'i SkipIndex<S>,
    /// The pool entry the leaf was taken from.
    token: usize,
    /// The leaf for the insertion, of a level not exceeding `token`.
    leaf: Option<Shared<Node<S>>>,
    /// An optional level-zero leaf for splits.
    spare: Option<Shared<Node<S>>>,
}

/// [`Pool`] keeps pre-allocated leaves in per-thread shards.
///
/// Each shard retains at most one leaf per token.
pub(super) struct Pool<S: Slot> {
    shards: Box<[Shard<S>]>,
}

struct Shard<S: Slot> {
    lock: Lock,
    spares: UnsafeCell<[Option<Shared<Node<S>>>; MAX_LEVEL]>,
}

/// The upper bound of the number of shards.
const MAX_SHARDS: usize = 64;

/// Assigns shard indexes to threads.
static SHARD_SEQ: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = SHARD_SEQ.fetch_add(1, Relaxed);
}

impl<'i, S: Slot> Preload<'i, S> {
    pub(super) fn new(index: &'i SkipIndex<S>, token: usize) -> Self {
        Self {
            index,
            token,
            leaf: None,
            spare: None,
        }
    }

    /// Returns the preload token.
    ///
    /// The token is the highest level a leaf of this lease may have.
    #[inline]
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    /// Returns the level of the leaf reserved for the insertion.
    #[inline]
    #[must_use]
    pub fn level(&self) -> usize {
        self.leaf.as_ref().map_or(0, |leaf| leaf.level())
    }

    /// Returns `true` if a leaf can be taken without linking it above level zero.
    #[inline]
    pub(super) fn has_shallow(&self) -> bool {
        self.spare.is_some() || self.leaf.as_ref().is_some_and(|leaf| leaf.level() == 0)
    }

    /// Takes the reserved leaf.
    pub(super) fn take_leaf(&mut self) -> Shared<Node<S>> {
        if let Some(leaf) = self.leaf.take() {
            return leaf;
        }
        debug_assert!(false, "the preloaded leaf was already consumed");
        error_log!(token = self.token, "preloaded leaf missing");
        self.index.alloc_unchecked(0)
    }

    /// Takes a leaf to split a full leaf of the given level into.
    ///
    /// A level-zero spare is preferred when the reserved leaf would not be higher than the
    /// leaf being split, or when `shallow` is set.
    pub(super) fn take_split(&mut self, split_level: usize, shallow: bool) -> Shared<Node<S>> {
        let prefer_spare = shallow || (split_level > 0 && self.level() <= split_level);
        if prefer_spare {
            if let Some(spare) = self.spare.take() {
                return spare;
            }
        }
        debug_assert!(!shallow || self.level() == 0);
        self.take_leaf()
    }

    pub(super) fn set_leaf(&mut self, leaf: Shared<Node<S>>) {
        self.leaf.replace(leaf);
    }

    pub(super) fn set_spare(&mut self, spare: Option<Shared<Node<S>>>) {
        self.spare = spare;
    }

    pub(super) fn is_empty(&self) -> bool {
        self.leaf.is_none()
    }

    pub(super) fn needs_spare(&self) -> bool {
        self.token > 0 && self.spare.is_none()
    }
}

impl<S: Slot> Debug for Preload<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preload")
            .field("token", &self.token)
            .field("level", &self.level())
            .field("spare", &self.spare.is_some())
            .finish()
    }
}

impl<S: Slot> Drop for Preload<'_, S> {
    #[inline]
    fn drop(&mut self) {
        let leaf = self.leaf.take();
        let spare = self.spare.take();
        if leaf.is_some() || spare.is_some() {
            self.index.pool.check_in(self.token, leaf, spare, |leaf| self.index.discard(leaf));
        }
    }
}

impl<S: Slot> Pool<S> {
    /// Creates a new [`Pool`] with a shard per available core.
    pub(super) fn new() -> Self {
        let shards = available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .next_power_of_two()
            .min(MAX_SHARDS);
        Self {
            shards: (0..shards)
                .map(|_| Shard {
                    lock: Lock::default(),
                    spares: UnsafeCell::new(std::array::from_fn(|_| None)),
                })
                .collect(),
        }
    }

    /// Fills the [`Preload`] with pooled leaves.
    pub(super) fn check_out(&self, preload: &mut Preload<'_, S>) {
        let token = preload.token;
        self.with_shard(|spares| {
            if let Some(leaf) = spares[token].take() {
                preload.set_leaf(leaf);
            }
            if preload.needs_spare() {
                preload.set_spare(spares[0].take());
            }
        });
    }

    /// Returns unused leaves to the [`Pool`], passing those that do not fit to `discard`.
    fn check_in<F: FnMut(Shared<Node<S>>)>(
        &self,
        token: usize,
        leaf: Option<Shared<Node<S>>>,
        spare: Option<Shared<Node<S>>>,
        mut discard: F,
    ) {
        let mut returned = [(token, leaf), (0, spare)];
        self.with_shard(|spares| {
            for (token, leaf) in &mut returned {
                if spares[*token].is_none() {
                    spares[*token] = leaf.take();
                }
            }
        });
        returned
            .into_iter()
            .filter_map(|(_, leaf)| leaf)
            .for_each(&mut discard);
    }

    /// Runs `f` on the shard of the current thread unless another thread holds it.
    fn with_shard<F: FnOnce(&mut [Option<Shared<Node<S>>>; MAX_LEVEL])>(&self, f: F) {
        let hint = SHARD_HINT.try_with(|hint| *hint).unwrap_or(0);
        let shard = &self.shards[hint % self.shards.len()];
        if shard.lock.try_lock().is_err() {
            return;
        }
        // SAFETY: the shard lock is held.
        f(unsafe { &mut *shard.spares.get() });
        shard.lock.release_lock();
    }
}

// SAFETY: the spare array is only accessed with the shard lock held.
unsafe impl<S: Slot> Send for Shard<S> {}

// SAFETY: the spare array is only accessed with the shard lock held.
unsafe impl<S: Slot> Sync for Shard<S> {}
