// model = "claude-opus-4-5"
// created = "2026-01-30"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! CRDT primitives for collaborative data structures.
//!
//! - `atom` and `weave`: the causal tree that holds bots and tags
//! - `tree`: a site's replica of a weave, buffering out-of-order atoms
//! - `reducer`: weave to bot state
//! - `rga`, `op`, `text`: collaborative string values

pub mod atom;
pub mod op;
pub mod primitives;
pub mod reducer;
pub mod rga;
pub mod text;
pub mod tree;
pub mod weave;

/// A CRDT is a data type with a merge operator that is commutative,
/// associative, and idempotent.
pub trait Crdt {
    /// Merge another instance into this one.
    fn merge(&mut self, other: &Self);
}
