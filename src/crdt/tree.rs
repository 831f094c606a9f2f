// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A weave owned by one site, with an orphan buffer and a clock.
//!
//! Remote atoms can arrive before their causes. Those are parked in the
//! orphan buffer under the id they are waiting for and inserted as soon as
//! that atom lands, which may in turn release further orphans.

use rustc_hash::FxHashMap;

use crate::bot::TagValue;
use crate::key::KeyPair;
use crate::key::KeyPub;
use super::atom::Atom;
use super::atom::AtomOp;
use super::atom::create_atom;
use super::primitives::AtomId;
use super::primitives::SiteClock;
use super::primitives::SiteId;
use super::weave::InsertResult;
use super::weave::Weave;
use super::weave::WeaveError;

/// How many further batches an orphan may wait through before it is
/// dropped and reported.
pub const DEFAULT_MAX_ORPHAN_BATCHES: u32 = 16;

#[derive(Clone, Debug)]
struct Parked {
    atom: Atom,
    batches: u32,
}

/// Atoms waiting for their cause.
#[derive(Clone, Debug, Default)]
pub struct OrphanBuffer {
    waiting: FxHashMap<AtomId, Vec<Parked>>,
    len: usize,
}

impl OrphanBuffer {
    pub fn new() -> OrphanBuffer {
        return OrphanBuffer::default();
    }

    pub fn len(&self) -> usize {
        return self.len;
    }

    pub fn is_empty(&self) -> bool {
        return self.len == 0;
    }

    /// Park an atom until `missing` arrives. Parking the same atom twice
    /// keeps one copy.
    pub fn park(&mut self, atom: Atom, missing: AtomId) {
        let queue = self.waiting.entry(missing).or_default();
        if queue.iter().any(|parked| parked.atom.id == atom.id) {
            return;
        }
        queue.push(Parked { atom, batches: 0 });
        self.len += 1;
    }

    /// Take every atom that was waiting for `cause`.
    pub fn take(&mut self, cause: &AtomId) -> Vec<Atom> {
        let released = self.waiting.remove(cause).unwrap_or_default();
        self.len -= released.len();
        return released.into_iter().map(|parked| parked.atom).collect();
    }

    /// Ids the buffer is still waiting for.
    pub fn missing(&self) -> impl Iterator<Item = &AtomId> {
        return self.waiting.keys();
    }

    /// Count one more batch against every parked atom, dropping the ones
    /// that already waited through `max_batches`. Returns the dropped atoms
    /// with the cause each was waiting for.
    pub fn expire(&mut self, max_batches: u32) -> Vec<(Atom, AtomId)> {
        let mut expired = Vec::new();
        self.waiting.retain(|cause, queue| {
            queue.retain_mut(|parked| {
                if parked.batches >= max_batches {
                    expired.push((parked.atom.clone(), cause.clone()));
                    return false;
                }
                parked.batches += 1;
                return true;
            });
            return !queue.is_empty();
        });
        self.len -= expired.len();
        expired.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
        return expired;
    }
}

/// Outcome of adding a batch of atoms.
#[derive(Clone, Debug, Default)]
pub struct AddReport {
    /// Insert results in the order atoms landed, including released orphans.
    pub results: Vec<InsertResult>,
    /// Atoms that were refused for good.
    pub rejected: Vec<WeaveError>,
    /// Atoms newly parked in the orphan buffer.
    pub buffered: usize,
    /// Orphans dropped because their cause never arrived.
    pub expired: Vec<WeaveError>,
}

impl AddReport {
    /// Every atom refused in this batch, expired orphans last.
    pub fn errors(&self) -> impl Iterator<Item = &WeaveError> {
        return self.rejected.iter().chain(self.expired.iter());
    }

    /// Atoms that were inserted for the first time.
    pub fn added(&self) -> impl Iterator<Item = &InsertResult> {
        return self.results.iter().filter(|result| !matches!(result, InsertResult::Duplicate { .. }));
    }
}

/// A site's replica of a causal tree.
#[derive(Clone, Debug)]
pub struct CausalTree {
    weave: Weave,
    orphans: OrphanBuffer,
    clock: SiteClock,
    keys: Option<KeyPair>,
    max_orphan_batches: u32,
}

impl CausalTree {
    pub fn new(site: SiteId) -> CausalTree {
        return CausalTree {
            weave: Weave::new(),
            orphans: OrphanBuffer::new(),
            clock: SiteClock::new(site),
            keys: None,
            max_orphan_batches: DEFAULT_MAX_ORPHAN_BATCHES,
        };
    }

    /// Drop orphans still waiting after `batches` further batches. Zero
    /// drops them at the end of the batch that parked them.
    pub fn with_max_orphan_batches(mut self, batches: u32) -> CausalTree {
        self.max_orphan_batches = batches;
        return self;
    }

    /// A tree that signs every local atom with `keys`.
    pub fn with_keys(site: SiteId, keys: KeyPair) -> CausalTree {
        let mut tree = CausalTree::new(site);
        tree.keys = Some(keys);
        return tree;
    }

    pub fn site(&self) -> &SiteId {
        return self.clock.site();
    }

    pub fn weave(&self) -> &Weave {
        return &self.weave;
    }

    pub fn clock(&self) -> &SiteClock {
        return &self.clock;
    }

    pub fn orphans(&self) -> &OrphanBuffer {
        return &self.orphans;
    }

    /// Require atoms from `site` to be signed.
    pub fn trust(&mut self, site: SiteId, key: KeyPub) {
        self.weave.trust(site, key);
    }

    /// Add a batch of atoms from any site, in any order.
    pub fn add_atoms(&mut self, atoms: impl IntoIterator<Item = Atom>) -> AddReport {
        let mut report = AddReport::default();
        let mut any = false;
        for atom in atoms {
            any = true;
            self.add_one(atom, &mut report);
        }
        if !any || self.orphans.is_empty() {
            return report;
        }
        for (atom, cause) in self.orphans.expire(self.max_orphan_batches) {
            let err = WeaveError::OrphanAtom { id: atom.id, cause };
            tracing::warn!(%err, "dropping orphan whose cause never arrived");
            report.expired.push(err);
        }
        if !self.orphans.is_empty() {
            tracing::debug!(orphans = self.orphans.len(), "atoms still waiting for their causes");
        }
        return report;
    }

    fn add_one(&mut self, atom: Atom, report: &mut AddReport) {
        let mut pending = vec![atom];
        while let Some(atom) = pending.pop() {
            let seq = atom.id.seq;
            match self.weave.insert(atom.clone()) {
                Ok(result) => {
                    self.clock.observe(seq);
                    let landed = !matches!(result, InsertResult::Duplicate { .. });
                    let id = result.id().clone();
                    report.results.push(result);
                    if landed {
                        let mut released = self.orphans.take(&id);
                        released.reverse();
                        pending.extend(released);
                    }
                }
                Err(WeaveError::OrphanAtom { id, cause }) => {
                    tracing::debug!(%id, %cause, "buffering orphan atom");
                    self.orphans.park(atom, cause);
                    report.buffered += 1;
                }
                Err(err) => {
                    tracing::warn!(%err, "rejected atom");
                    report.rejected.push(err);
                }
            }
        }
    }

    /// Create and insert a local atom.
    pub fn create(&mut self, cause: Option<&AtomId>, value: AtomOp) -> Result<(Atom, InsertResult), WeaveError> {
        let cause = match cause {
            Some(id) => match self.weave.get(id) {
                Some(atom) => Some(atom.clone()),
                None => {
                    let site = self.clock.site().clone();
                    let next = AtomId::new(site, self.clock.time().saturating_add(1), value.default_priority());
                    return Err(WeaveError::OrphanAtom { id: next, cause: id.clone() });
                }
            },
            None => None,
        };
        let mut atom = create_atom(&mut self.clock, cause.as_ref(), value, None);
        if let Some(keys) = &self.keys {
            atom = atom.sign(keys);
        }
        let result = self.weave.insert(atom.clone())?;
        return Ok((atom, result));
    }

    pub fn create_record(&mut self, bot_id: impl Into<String>) -> Result<Atom, WeaveError> {
        let (atom, _) = self.create(None, AtomOp::CreateRecord { id: bot_id.into() })?;
        return Ok(atom);
    }

    pub fn create_field(&mut self, record: &AtomId, name: impl Into<String>, space: Option<String>) -> Result<Atom, WeaveError> {
        let (atom, _) = self.create(Some(record), AtomOp::CreateField { name: name.into(), space })?;
        return Ok(atom);
    }

    pub fn set_value(&mut self, field: &AtomId, value: TagValue) -> Result<Atom, WeaveError> {
        let (atom, _) = self.create(Some(field), AtomOp::SetValue { value })?;
        return Ok(atom);
    }

    pub fn delete(&mut self, target: &AtomId) -> Result<(Atom, InsertResult), WeaveError> {
        return self.create(Some(target), AtomOp::Delete);
    }
}
