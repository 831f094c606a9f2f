// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! The weave: an ordered causal tree of atoms.
//!
//! Atoms live in an arena keyed by id. Each atom has at most one cause and
//! any number of children; children are kept in an adjacency list keyed by
//! the cause id, sorted with `AtomId::sibling_cmp`. Weave order is the
//! preorder walk of that tree with roots sorted the same way, so it depends
//! only on which atoms are present and never on arrival order.
//!
//! Deleting an atom hides its causal group: the atom and everything below
//! it. Nothing is ever physically removed.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use thiserror::Error;

use crate::key::KeyPub;
use super::Crdt;
use super::atom::Atom;
use super::atom::AtomOp;
use super::primitives::AtomId;
use super::primitives::MAX_SEQUENCE;
use super::primitives::SiteId;
use super::primitives::VersionVector;

/// Reasons an atom cannot be inserted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WeaveError {
    /// The cause has not arrived yet. Buffer the atom and retry.
    #[error("atom {id} is an orphan: cause {cause} is not in the weave")]
    OrphanAtom { id: AtomId, cause: AtomId },
    #[error("atom {id} has a hash that does not match its content")]
    InvalidHash { id: AtomId },
    #[error("atom {id} collides with an existing atom with different content")]
    IdCollision { id: AtomId },
    #[error("atom {id} does not come after its cause {cause}")]
    CausalityViolation { id: AtomId, cause: AtomId },
    #[error("atom {id} is malformed: {reason}")]
    Malformed { id: AtomId, reason: &'static str },
    #[error("atom {id} lacks a valid signature from its site")]
    InvalidSignature { id: AtomId },
    #[error("atom {id} has a sequence beyond {MAX_SEQUENCE}")]
    SequenceOutOfRange { id: AtomId },
}

impl WeaveError {
    pub fn atom_id(&self) -> &AtomId {
        match self {
            WeaveError::OrphanAtom { id, .. } => return id,
            WeaveError::InvalidHash { id } => return id,
            WeaveError::IdCollision { id } => return id,
            WeaveError::CausalityViolation { id, .. } => return id,
            WeaveError::Malformed { id, .. } => return id,
            WeaveError::InvalidSignature { id } => return id,
            WeaveError::SequenceOutOfRange { id } => return id,
        }
    }
}

/// What an insert changed.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertResult {
    /// A content atom was linked in. It is visible unless it landed inside
    /// an already deleted causal group.
    Added { id: AtomId, visible: bool },
    /// A delete atom was linked in, hiding the listed atoms of the
    /// target's causal group that were visible before.
    Removed { id: AtomId, target: AtomId, removed: Vec<AtomId> },
    /// The atom was already present.
    Duplicate { id: AtomId },
}

impl InsertResult {
    pub fn id(&self) -> &AtomId {
        match self {
            InsertResult::Added { id, .. } => return id,
            InsertResult::Removed { id, .. } => return id,
            InsertResult::Duplicate { id } => return id,
        }
    }

    /// Whether the insert changed what is visible.
    pub fn is_visible_change(&self) -> bool {
        match self {
            InsertResult::Added { visible, .. } => return *visible,
            InsertResult::Removed { removed, .. } => return !removed.is_empty(),
            InsertResult::Duplicate { .. } => return false,
        }
    }
}

/// An ordered causal tree of atoms.
#[derive(Clone, Debug, Default)]
pub struct Weave {
    /// Every atom, by id.
    atoms: FxHashMap<AtomId, Atom>,
    /// Atoms without a cause, in sibling order.
    roots: Vec<AtomId>,
    /// Children of each atom, in sibling order.
    children: FxHashMap<AtomId, SmallVec<[AtomId; 4]>>,
    /// Atoms targeted by a delete.
    deleted: FxHashSet<AtomId>,
    /// Create-record atoms per bot id, in sibling order.
    records: FxHashMap<String, SmallVec<[AtomId; 2]>>,
    /// Highest sequence seen per site.
    version: VersionVector,
    /// Sites whose atoms must carry a valid signature.
    trusted: FxHashMap<SiteId, KeyPub>,
}

impl Weave {
    /// Create an empty weave.
    pub fn new() -> Weave {
        return Weave::default();
    }

    /// Require atoms from `site` to be signed by `key`.
    pub fn trust(&mut self, site: SiteId, key: KeyPub) {
        self.trusted.insert(site, key);
    }

    pub fn len(&self) -> usize {
        return self.atoms.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.atoms.is_empty();
    }

    pub fn get(&self, id: &AtomId) -> Option<&Atom> {
        return self.atoms.get(id);
    }

    pub fn contains(&self, id: &AtomId) -> bool {
        return self.atoms.contains_key(id);
    }

    pub fn version(&self) -> &VersionVector {
        return &self.version;
    }

    /// Children of an atom in sibling order.
    pub fn children(&self, id: &AtomId) -> &[AtomId] {
        return self.children.get(id).map(|c| c.as_slice()).unwrap_or(&[]);
    }

    /// Create-record atoms for a bot id, in sibling order.
    pub fn record_atoms(&self, bot_id: &str) -> &[AtomId] {
        return self.records.get(bot_id).map(|r| r.as_slice()).unwrap_or(&[]);
    }

    /// Every bot id that has at least one create-record atom.
    pub fn record_ids(&self) -> impl Iterator<Item = &String> {
        return self.records.keys();
    }

    /// Whether a delete targets this exact atom.
    pub fn is_deleted(&self, id: &AtomId) -> bool {
        return self.deleted.contains(id);
    }

    /// An atom is visible when it is not a delete and neither it nor any of
    /// its causes has been deleted.
    pub fn is_visible(&self, id: &AtomId) -> bool {
        let mut current = match self.atoms.get(id) {
            Some(atom) if !atom.is_delete() => atom,
            _ => return false,
        };
        loop {
            if self.deleted.contains(&current.id) {
                return false;
            }
            match current.cause.as_ref().and_then(|c| self.atoms.get(c)) {
                Some(parent) => current = parent,
                None => return true,
            }
        }
    }

    /// The root atom of the causal tree containing `id`.
    pub fn root_of(&self, id: &AtomId) -> Option<&Atom> {
        let mut current = self.atoms.get(id)?;
        while let Some(cause) = &current.cause {
            current = self.atoms.get(cause)?;
        }
        return Some(current);
    }

    /// Bot id of the record an atom belongs to.
    pub fn bot_of(&self, id: &AtomId) -> Option<&str> {
        match &self.root_of(id)?.value {
            AtomOp::CreateRecord { id } => return Some(id),
            _ => return None,
        }
    }

    /// Walk the whole weave in order.
    pub fn iter(&self) -> WeaveIter<'_> {
        return WeaveIter {
            weave: self,
            stack: self.roots.iter().rev().collect(),
        };
    }

    /// Walk an atom and all of its descendants in weave order.
    pub fn iterate_causal_group(&self, id: &AtomId) -> WeaveIter<'_> {
        let stack = match self.atoms.get_key_value(id) {
            Some((key, _)) => vec![key],
            None => Vec::new(),
        };
        return WeaveIter { weave: self, stack };
    }

    /// Every atom, each after its cause.
    pub fn atoms(&self) -> Vec<Atom> {
        return self.iter().cloned().collect();
    }

    /// Insert an atom.
    ///
    /// Re-inserting an identical atom is a no-op that reports `Duplicate`.
    pub fn insert(&mut self, atom: Atom) -> Result<InsertResult, WeaveError> {
        if let Some(existing) = self.atoms.get(&atom.id) {
            if existing.hash == atom.hash {
                return Ok(InsertResult::Duplicate { id: atom.id });
            }
            return Err(WeaveError::IdCollision { id: atom.id });
        }
        if atom.id.seq > MAX_SEQUENCE {
            return Err(WeaveError::SequenceOutOfRange { id: atom.id });
        }
        if !atom.verify_hash() {
            return Err(WeaveError::InvalidHash { id: atom.id });
        }
        if let Some(key) = self.trusted.get(&atom.id.site) {
            if !atom.verify_signature(key) {
                return Err(WeaveError::InvalidSignature { id: atom.id });
            }
        }
        self.check_cause(&atom)?;

        let id = atom.id.clone();
        match &atom.cause {
            Some(cause) => {
                let list = self.children.entry(cause.clone()).or_default();
                let pos = sibling_position(list, &id);
                list.insert(pos, id.clone());
            }
            None => {
                let pos = sibling_position(&self.roots, &id);
                self.roots.insert(pos, id.clone());
            }
        }
        if let AtomOp::CreateRecord { id: bot_id } = &atom.value {
            let list = self.records.entry(bot_id.clone()).or_default();
            let pos = sibling_position(list, &id);
            list.insert(pos, id.clone());
        }
        self.version.observe(&id.site, id.seq);

        let target = match (&atom.value, &atom.cause) {
            (AtomOp::Delete, Some(target)) => Some(target.clone()),
            _ => None,
        };
        self.atoms.insert(id.clone(), atom);

        match target {
            Some(target) => {
                let removed = self.visible_group(&target);
                self.deleted.insert(target.clone());
                return Ok(InsertResult::Removed { id, target, removed });
            }
            None => {
                let visible = self.is_visible(&id);
                return Ok(InsertResult::Added { id, visible });
            }
        }
    }

    /// Validate the atom against its cause.
    fn check_cause(&self, atom: &Atom) -> Result<(), WeaveError> {
        let cause_id = match (&atom.value, &atom.cause) {
            (AtomOp::CreateRecord { .. }, None) => return Ok(()),
            (AtomOp::CreateRecord { .. }, Some(_)) => {
                return Err(WeaveError::Malformed { id: atom.id.clone(), reason: "records cannot have a cause" });
            }
            (_, None) => {
                return Err(WeaveError::Malformed { id: atom.id.clone(), reason: "only records may be roots" });
            }
            (_, Some(cause)) => cause,
        };
        let cause = match self.atoms.get(cause_id) {
            Some(cause) => cause,
            None => {
                return Err(WeaveError::OrphanAtom { id: atom.id.clone(), cause: cause_id.clone() });
            }
        };
        let fits = match (&atom.value, &cause.value) {
            (AtomOp::CreateField { .. }, AtomOp::CreateRecord { .. }) => true,
            (AtomOp::SetValue { .. }, AtomOp::CreateField { .. }) => true,
            (AtomOp::Delete, AtomOp::Delete) => false,
            (AtomOp::Delete, _) => true,
            _ => false,
        };
        if !fits {
            return Err(WeaveError::Malformed { id: atom.id.clone(), reason: "payload does not fit its cause" });
        }
        if atom.id.seq <= cause.id.seq {
            return Err(WeaveError::CausalityViolation { id: atom.id.clone(), cause: cause.id.clone() });
        }
        return Ok(());
    }

    /// Content atoms of a causal group that are currently visible.
    fn visible_group(&self, target: &AtomId) -> Vec<AtomId> {
        if !self.is_visible(target) {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if id != target && self.deleted.contains(id) {
                continue;
            }
            match self.atoms.get(id) {
                Some(atom) if !atom.is_delete() => removed.push(id.clone()),
                _ => continue,
            }
            if let Some(children) = self.children.get(id) {
                stack.extend(children.iter().rev());
            }
        }
        return removed;
    }
}

/// Where `id` belongs in a sibling-sorted list.
fn sibling_position(list: &[AtomId], id: &AtomId) -> usize {
    return list.binary_search_by(|other| other.sibling_cmp(id)).unwrap_or_else(|p| p);
}

/// Preorder iterator over a weave or one causal group.
pub struct WeaveIter<'a> {
    weave: &'a Weave,
    stack: Vec<&'a AtomId>,
}

impl<'a> Iterator for WeaveIter<'a> {
    type Item = &'a Atom;

    fn next(&mut self) -> Option<&'a Atom> {
        let id = self.stack.pop()?;
        if let Some(children) = self.weave.children.get(id) {
            self.stack.extend(children.iter().rev());
        }
        return self.weave.atoms.get(id);
    }
}

impl Crdt for Weave {
    fn merge(&mut self, other: &Self) {
        for atom in other.iter() {
            if let Err(err) = self.insert(atom.clone()) {
                tracing::warn!(%err, "skipping atom while merging weaves");
            }
        }
    }
}
