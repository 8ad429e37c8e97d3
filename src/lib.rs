#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Scalable concurrent range index.
//!
//! # rangeskip::SkipIndex
//! A concurrent skip list mapping disjoint `[key, key + size)` ranges to slots, with lock-free
//! readers, per-leaf locks for writers, and leaves reserved in advance through [`Preload`].
//!
//! # rangeskip::Slot
//! The range descriptor stored in a [`SkipIndex`]; [`Extent`] is a plain implementation.
//!
//! Memory reclamation is deferred through [`sdd`]: a removed slot or an unlinked leaf is
//! destroyed only after every [`sdd::Guard`] that may observe it is dropped.

mod logging;

pub mod skip_index;
pub use skip_index::{Error, Iter, LEAF_LEN, MAX_LEVEL, Preload, SkipIndex};

mod slot;
pub use slot::{Extent, Slot};

pub use sdd::{self, Guard, Shared};
