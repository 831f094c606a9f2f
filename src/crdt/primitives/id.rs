// model = "claude-opus-4-5"
// created = 2026-02-01
// modified = 2026-10-14
// driver = "Isaac Clayton"

//! Identifier types for atoms and characters.
//!
//! # Identifier Hierarchy
//!
//! - `SiteId`: a replica identity
//! - `AtomId`: identifies an atom in a weave (site, seq, priority)
//! - `CharId`: identifies one character of a text document (site, seq)
//!
//! # Ordering
//!
//! `AtomId` has two orderings. Its `Ord` is the id order: site
//! lexicographically, then sequence, then priority. Siblings in a weave use
//! `sibling_cmp`, which puts priority first so that deletes sort after the
//! content inserted at the same causal step. Last-writer-wins decisions use
//! `recency_cmp`: sequence (a Lamport time), then site, then priority.

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::key::KeyPub;

/// A replica identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> SiteId {
        return SiteId(id.into());
    }

    /// Derive a site id from a public key fingerprint.
    pub fn from_key(key: &KeyPub) -> SiteId {
        return SiteId(key.fingerprint());
    }

    /// The secondary site used to stamp edits applied on behalf of remote
    /// collaborators.
    pub fn remote(&self) -> SiteId {
        return SiteId(format!("{}~remote", self.0));
    }

    pub fn as_str(&self) -> &str {
        return &self.0;
    }
}

impl From<&str> for SiteId {
    fn from(id: &str) -> SiteId {
        return SiteId(id.to_string());
    }
}

impl fmt::Debug for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{:?}", self.0);
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.write_str(&self.0);
    }
}

/// An atom identifier.
///
/// The (site, seq) pair is globally unique assuming sites are unique and
/// never reuse a sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomId {
    /// The site that created the atom.
    pub site: SiteId,
    /// The site's sequence number at creation time.
    #[serde(rename = "sequence")]
    pub seq: u64,
    /// Tie-break priority among siblings. Deletes use a higher priority.
    #[serde(default)]
    pub priority: u32,
}

impl AtomId {
    pub fn new(site: SiteId, seq: u64, priority: u32) -> AtomId {
        return AtomId { site, seq, priority };
    }

    /// Order of two atoms that share a cause.
    ///
    /// Priority is compared before site and sequence, unlike the id order.
    /// Among siblings of equal priority the order is the id order (site,
    /// then sequence). A delete (priority 1) therefore sorts after every
    /// content sibling of its target, whichever site wrote either one.
    pub fn sibling_cmp(&self, other: &AtomId) -> Ordering {
        return self.priority.cmp(&other.priority)
            .then_with(|| self.site.cmp(&other.site))
            .then_with(|| self.seq.cmp(&other.seq));
    }

    /// Order used to pick a winner among competing writes. Greater is newer.
    pub fn recency_cmp(&self, other: &AtomId) -> Ordering {
        return self.seq.cmp(&other.seq)
            .then_with(|| self.site.cmp(&other.site))
            .then_with(|| self.priority.cmp(&other.priority));
    }
}

impl PartialOrd for AtomId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for AtomId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare by site first, then by seq, then priority
        match self.site.cmp(&other.site) {
            Ordering::Equal => match self.seq.cmp(&other.seq) {
                Ordering::Equal => self.priority.cmp(&other.priority),
                other => other,
            },
            other => other,
        }
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}@{}", self.site, self.seq);
    }
}

/// A character identifier.
///
/// Each character inserted into a text document consumes one sequence
/// number of its site; each delete operation consumes one more.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharId {
    pub site: SiteId,
    #[serde(rename = "sequence")]
    pub seq: u64,
}

impl CharId {
    pub fn new(site: SiteId, seq: u64) -> CharId {
        return CharId { site, seq };
    }

    /// The id `offset` positions after this one within the same run.
    /// Saturates at `u64::MAX`.
    pub fn offset(&self, offset: u64) -> CharId {
        return CharId {
            site: self.site.clone(),
            seq: self.seq.saturating_add(offset),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(site: &str, seq: u64, priority: u32) -> AtomId {
        return AtomId::new(SiteId::from(site), seq, priority);
    }

    #[test]
    fn atom_id_ordering() {
        let a = id("alice", 1, 0);
        let b = id("alice", 2, 0);
        let c = id("bob", 1, 0);

        assert!(a < b);
        assert!(a < c); // "alice" < "bob"
        assert!(b < c);
        assert!(id("alice", 1, 0) < id("alice", 1, 1));
    }

    #[test]
    fn sibling_order_puts_deletes_last() {
        let content = id("zed", 9, 0);
        let delete = id("alice", 1, 1);

        assert_eq!(content.sibling_cmp(&delete), Ordering::Less);
        assert_eq!(id("alice", 5, 0).sibling_cmp(&id("bob", 2, 0)), Ordering::Less);
    }

    #[test]
    fn recency_prefers_sequence_then_site() {
        assert_eq!(id("bob", 2, 0).recency_cmp(&id("alice", 3, 0)), Ordering::Less);
        assert_eq!(id("bob", 3, 0).recency_cmp(&id("alice", 3, 0)), Ordering::Greater);
    }

    #[test]
    fn char_id_offset() {
        let c = CharId::new(SiteId::from("alice"), 4);
        assert_eq!(c.offset(3), CharId::new(SiteId::from("alice"), 7));
        assert_eq!(c.offset(u64::MAX).seq, u64::MAX);
    }

    #[test]
    fn remote_site_is_distinct() {
        let site = SiteId::from("alice");
        assert_ne!(site.remote(), site);
        assert_eq!(site.remote(), site.remote());
    }

    #[test]
    fn atom_id_wire_shape() {
        let json = serde_json::to_value(id("alice", 3, 1)).unwrap();
        assert_eq!(json, serde_json::json!({ "site": "alice", "sequence": 3, "priority": 1 }));
    }
}
