// model = "claude-opus-4-5"
// created = 2026-02-01
// modified = 2026-10-14
// driver = "Isaac Clayton"

//! Clock primitives for stamping atoms and tracking causal knowledge.
//!
//! # Site Clock
//!
//! A per-replica Lamport counter bound to a stable site id. Local events
//! tick it; observing a remote sequence raises it so that later local
//! events always sort after everything already seen.
//!
//! Complexity:
//! - tick: O(1)
//! - observe: O(1)
//!
//! # Version Vector
//!
//! Map of site to the highest sequence observed from that site. Missing
//! entries read as zero.
//!
//! Complexity:
//! - observe: O(log n) where n is number of sites
//! - merge: O(n)
//! - compare: O(n)

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use super::id::SiteId;

/// Largest sequence number accepted from any site: the largest integer a
/// JSON number carries exactly. Run arithmetic on sequences and stamps at
/// or below it cannot overflow.
pub const MAX_SEQUENCE: u64 = (1 << 53) - 1;

/// Whether a run of `width` sequences starting at `seq` stays in range.
pub fn sequence_run_fits(seq: u64, width: u64) -> bool {
    if seq == 0 || width == 0 {
        return false;
    }
    return seq.checked_add(width - 1).is_some_and(|last| last <= MAX_SEQUENCE);
}

/// A Lamport clock owned by one site.
///
/// The clock:
/// - Increments on local events (tick)
/// - Raises to max(local, remote) on observing remote sequences
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteClock {
    site: SiteId,
    time: u64,
}

impl SiteClock {
    /// Create a new clock starting at 0.
    pub fn new(site: SiteId) -> SiteClock {
        return SiteClock { site, time: 0 };
    }

    /// Create a clock with a specific starting time.
    pub fn with_time(site: SiteId, time: u64) -> SiteClock {
        return SiteClock { site, time };
    }

    pub fn site(&self) -> &SiteId {
        return &self.site;
    }

    /// Get the current time.
    #[inline]
    pub fn time(&self) -> u64 {
        return self.time;
    }

    /// Increment the clock for a local event.
    /// Returns the new time. Saturates at `u64::MAX`.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.time = self.time.saturating_add(1);
        return self.time;
    }

    /// Account for a sequence number seen on another site.
    /// The next tick is guaranteed to exceed it.
    #[inline]
    pub fn observe(&mut self, seq: u64) {
        self.time = self.time.max(seq);
    }
}

/// A version vector: the highest sequence observed per site.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: BTreeMap<SiteId, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> VersionVector {
        return VersionVector {
            entries: BTreeMap::new(),
        };
    }

    /// Builder used mostly by tests and collaborators issuing edits.
    pub fn with(mut self, site: impl Into<SiteId>, seq: u64) -> VersionVector {
        self.observe(&site.into(), seq);
        return self;
    }

    /// Get the highest sequence seen for a site.
    pub fn get(&self, site: &SiteId) -> u64 {
        return *self.entries.get(site).unwrap_or(&0);
    }

    /// Record that `seq` from `site` has been seen. Never moves backwards.
    pub fn observe(&mut self, site: &SiteId, seq: u64) {
        if seq == 0 {
            return;
        }
        let entry = self.entries.entry(site.clone()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Whether the given sequence of a site is covered.
    pub fn includes(&self, site: &SiteId, seq: u64) -> bool {
        return seq <= self.get(site);
    }

    /// Merge with another vector, taking the pointwise maximum.
    pub fn merge(&mut self, other: &VersionVector) {
        for (site, seq) in &other.entries {
            self.observe(site, *seq);
        }
    }

    /// Whether every entry of `other` is covered by this vector.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        return other.entries.iter().all(|(site, seq)| *seq <= self.get(site));
    }

    /// Entries of this vector that are ahead of `known`.
    pub fn missing_from(&self, known: &VersionVector) -> Vec<(SiteId, u64)> {
        return self.entries
            .iter()
            .filter(|(site, seq)| **seq > known.get(site))
            .map(|(site, seq)| (site.clone(), *seq))
            .collect();
    }

    /// Check if this vector causally precedes another.
    pub fn happens_before(&self, other: &VersionVector) -> bool {
        return other.dominates(self) && self != other;
    }

    /// Neither vector precedes the other.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        return !self.dominates(other) && !other.dominates(self);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, u64)> {
        return self.entries.iter().map(|(site, seq)| (site, *seq));
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }
}

impl PartialEq for VersionVector {
    fn eq(&self, other: &Self) -> bool {
        return self.dominates(other) && other.dominates(self);
    }
}

impl Eq for VersionVector {}

/// Tracks which sequence numbers of one site have been integrated.
///
/// Updates may arrive out of order, so the highest integrated sequence is
/// not the same as "everything up to here". The watermark is the largest
/// `n` such that every sequence in `1..=n` is present.
#[derive(Clone, Debug, Default)]
pub struct Watermark {
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl Watermark {
    pub fn new() -> Watermark {
        return Watermark::default();
    }

    pub fn contiguous(&self) -> u64 {
        return self.contiguous;
    }

    pub fn contains(&self, seq: u64) -> bool {
        return seq <= self.contiguous || self.ahead.contains(&seq);
    }

    /// Mark `seq` as present.
    pub fn insert(&mut self, seq: u64) {
        if seq <= self.contiguous {
            return;
        }
        self.ahead.insert(seq);
        while let Some(next) = self.contiguous.checked_add(1) {
            if !self.ahead.remove(&next) {
                break;
            }
            self.contiguous = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(name: &str) -> SiteId {
        return SiteId::from(name);
    }

    #[test]
    fn clock_tick() {
        let mut clock = SiteClock::new(site("alice"));
        assert_eq!(clock.time(), 0);

        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn clock_observe_never_moves_back() {
        let mut clock = SiteClock::with_time(site("alice"), 4);

        clock.observe(10);
        assert_eq!(clock.tick(), 11);

        clock.observe(3);
        assert_eq!(clock.tick(), 12);
    }

    #[test]
    fn version_vector_basic() {
        let mut v = VersionVector::new();
        assert_eq!(v.get(&site("alice")), 0);

        v.observe(&site("alice"), 3);
        v.observe(&site("alice"), 2);
        assert_eq!(v.get(&site("alice")), 3);
        assert!(v.includes(&site("alice"), 3));
        assert!(!v.includes(&site("alice"), 4));
    }

    #[test]
    fn version_vector_merge() {
        let mut a = VersionVector::new().with("alice", 2);
        let b = VersionVector::new().with("bob", 3).with("alice", 1);

        a.merge(&b);

        assert_eq!(a.get(&site("alice")), 2);
        assert_eq!(a.get(&site("bob")), 3);
    }

    #[test]
    fn version_vector_happens_before() {
        let a = VersionVector::new().with("alice", 1);
        let b = VersionVector::new().with("alice", 1).with("bob", 1);

        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
        assert!(!a.happens_before(&a));
    }

    #[test]
    fn version_vector_concurrent() {
        let a = VersionVector::new().with("alice", 1);
        let b = VersionVector::new().with("bob", 1);

        assert!(a.concurrent_with(&b));
        assert!(b.concurrent_with(&a));
    }

    #[test]
    fn version_vector_zero_entries_are_absent() {
        let a = VersionVector::new().with("alice", 0);
        assert!(a.is_empty());
        assert_eq!(a, VersionVector::new());
    }

    #[test]
    fn missing_from_lists_unseen_entries() {
        let edit = VersionVector::new().with("alice", 3).with("bob", 1);
        let known = VersionVector::new().with("alice", 2).with("bob", 5);

        assert_eq!(edit.missing_from(&known), vec![(site("alice"), 3)]);
    }

    #[test]
    fn watermark_waits_for_gaps() {
        let mut mark = Watermark::new();
        mark.insert(1);
        mark.insert(3);
        assert_eq!(mark.contiguous(), 1);
        assert!(mark.contains(3));
        assert!(!mark.contains(2));

        mark.insert(2);
        assert_eq!(mark.contiguous(), 3);
    }

    #[test]
    fn clock_saturates_instead_of_wrapping() {
        let mut clock = SiteClock::with_time(site("alice"), u64::MAX - 1);
        assert_eq!(clock.tick(), u64::MAX);
        assert_eq!(clock.tick(), u64::MAX);
    }

    #[test]
    fn watermark_handles_the_top_of_the_range() {
        let mut mark = Watermark::new();
        mark.insert(u64::MAX);
        assert_eq!(mark.contiguous(), 0);
        assert!(mark.contains(u64::MAX));
    }

    #[test]
    fn sequence_runs_stay_in_range() {
        assert!(sequence_run_fits(1, 1));
        assert!(sequence_run_fits(MAX_SEQUENCE, 1));
        assert!(!sequence_run_fits(MAX_SEQUENCE, 2));
        assert!(!sequence_run_fits(u64::MAX, 1));
        assert!(!sequence_run_fits(u64::MAX - 1, u64::MAX));
        assert!(!sequence_run_fits(0, 1));
    }
}
