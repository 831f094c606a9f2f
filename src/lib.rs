// model = "claude-opus-4-5"
// created = "2026-01-30"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Weft - replicated bot state over causal trees.
//!
//! Sites write bots into partitions. Each write becomes atoms in a weave,
//! the weave reduces to bot state, and the difference goes out on the
//! partition's streams. Replicas that exchange atoms converge.
//!
//! # Quick Start
//!
//! ```
//! use weft::bot::Bot;
//! use weft::bot::BotEvent;
//! use weft::crdt::primitives::SiteId;
//! use weft::partition::Partition;
//! use weft::partition::causal_tree::CausalTreePartition;
//!
//! let mut alice = CausalTreePartition::new(SiteId::from("alice"), None);
//! let mut bob = CausalTreePartition::new(SiteId::from("bob"), None);
//!
//! alice.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
//! bob.add_atoms(alice.atoms());
//!
//! bob.apply_events(&[BotEvent::set_tag("b1", "color", "blue")]).unwrap();
//! alice.add_atoms(bob.atoms());
//!
//! assert_eq!(alice.state(), bob.state());
//! ```

pub mod bot;
pub mod config;
pub mod crdt;
pub mod error;
pub mod key;
pub mod partition;

pub use error::Error;
pub use error::Result;
