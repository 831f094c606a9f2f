// model = "claude-opus-4-5"
// created = 2026-02-01
// modified = 2026-10-14
// driver = "Isaac Clayton"

//! Shared primitives for the weave and the text document.
//!
//! # Primitives
//!
//! ## Clocks
//! - `SiteClock`: per-site Lamport counter
//! - `VersionVector`: highest sequence seen per site
//! - `Watermark`: contiguous knowledge of one site's sequences
//!
//! ## IDs
//! - `SiteId`: replica identifier
//! - `AtomId`: atom identifier (site, seq, priority)
//! - `CharId`: character identifier (site, seq)

pub mod clock;
pub mod id;

// Re-exports for convenience
pub use clock::MAX_SEQUENCE;
pub use clock::SiteClock;
pub use clock::VersionVector;
pub use clock::Watermark;
pub use clock::sequence_run_fits;
pub use id::AtomId;
pub use id::CharId;
pub use id::SiteId;
