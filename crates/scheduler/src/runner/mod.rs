//! Traversal scheduling loop.
//!
//! Split into focused submodules:
//! - `core`: TraversalScheduler struct, constructor and accessors
//! - `scheduling`: one scheduling pass over every known connector
//! - `execution`: the long-lived loop, its thread and shutdown

mod core;
mod execution;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::core::TraversalScheduler;
