#![deny(warnings, clippy::all, clippy::pedantic)]

#[cfg(test)]
mod extent_allocator;

#[cfg(test)]
mod skip_index;
