// model = "claude-opus-4-5"
// created = "2026-01-30"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Replicated Growable Array (RGA) over characters.
//!
//! Every character has a stable id `(site, seq)`, a Lamport stamp, and the
//! id of the character it was typed after (its origin). Deleting a character
//! only marks it: the deleter's id is recorded so that an edit issued
//! against an older version can still tell which characters its author saw.
//!
//! Integration rule: a new character goes right after its origin, skipping
//! over any characters whose `(stamp, site)` is greater than its own. Lamport
//! stamps make that skip land in the same place on every replica.
//!
//! Replicated updates:
//!
//! - `Insert { id, stamp, origin, text }`: a run of characters. Character
//!   `i` has id `id.seq + i`, stamp `stamp + i`, and originates at
//!   character `i - 1` of the run.
//! - `Delete { id, targets }`: marks the targets as deleted by `id`.
//!
//! Updates whose origin or targets are unknown wait in a pending queue
//! until the owner expires them with `expire_pending`. Updates whose ids or
//! stamps would run past `MAX_SEQUENCE` are ignored.
//!
//! Complexity:
//! - locate by id: O(n)
//! - integrate: O(n) per character

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use super::Crdt;
use super::op::EditOp;
use super::primitives::CharId;
use super::primitives::SiteId;
use super::primitives::VersionVector;
use super::primitives::Watermark;
use super::primitives::sequence_run_fits;

/// A replicated change to a text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextUpdate {
    Insert {
        id: CharId,
        stamp: u64,
        origin: Option<CharId>,
        text: String,
    },
    Delete {
        id: CharId,
        targets: Vec<CharId>,
    },
}

impl TextUpdate {
    /// Id of the first sequence number this update consumes.
    pub fn id(&self) -> &CharId {
        match self {
            TextUpdate::Insert { id, .. } => return id,
            TextUpdate::Delete { id, .. } => return id,
        }
    }

    /// Number of sequence numbers this update consumes on its site.
    pub fn width(&self) -> u64 {
        match self {
            TextUpdate::Insert { text, .. } => return text.chars().count() as u64,
            TextUpdate::Delete { .. } => return 1,
        }
    }

    /// Whether every id and stamp of the update stays at or below
    /// `MAX_SEQUENCE`.
    pub fn in_range(&self) -> bool {
        let width = self.width();
        match self {
            TextUpdate::Insert { id, stamp, .. } => {
                return sequence_run_fits(id.seq, width) && sequence_run_fits(*stamp, width);
            }
            TextUpdate::Delete { id, .. } => return sequence_run_fits(id.seq, width),
        }
    }
}

/// One character of the sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: CharId,
    pub stamp: u64,
    pub origin: Option<CharId>,
    pub ch: char,
    /// Deletes that hit this character.
    pub deleted_by: SmallVec<[CharId; 1]>,
}

impl Item {
    pub fn is_deleted(&self) -> bool {
        return !self.deleted_by.is_empty();
    }
}

/// Decides which characters an edit's author could see.
struct Visibility<'a> {
    version: &'a VersionVector,
    created: FxHashSet<CharId>,
    deletes: FxHashSet<CharId>,
}

impl Visibility<'_> {
    fn sees(&self, item: &Item) -> bool {
        let inserted = self.version.includes(&item.id.site, item.id.seq) || self.created.contains(&item.id);
        if !inserted {
            return false;
        }
        return !item.deleted_by
            .iter()
            .any(|d| self.version.includes(&d.site, d.seq) || self.deletes.contains(d));
    }
}

/// A character sequence CRDT.
#[derive(Clone, Debug, Default)]
pub struct Rga {
    items: Vec<Item>,
    /// Ids of every integrated character.
    known: FxHashSet<CharId>,
    /// Integrated sequence numbers per site.
    seen: FxHashMap<SiteId, Watermark>,
    /// Updates waiting for an origin or target, with how many batches
    /// each has waited through.
    pending: Vec<(TextUpdate, u32)>,
    /// Every integrated update, in integration order.
    log: Vec<TextUpdate>,
    /// Highest stamp integrated.
    lamport: u64,
}

impl Rga {
    pub fn new() -> Rga {
        return Rga::default();
    }

    /// Number of visible characters.
    pub fn len(&self) -> u64 {
        return self.items.iter().filter(|item| !item.is_deleted()).count() as u64;
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    pub fn items(&self) -> &[Item] {
        return &self.items;
    }

    pub fn lamport(&self) -> u64 {
        return self.lamport;
    }

    /// Integrated updates, causes before effects.
    pub fn updates(&self) -> &[TextUpdate] {
        return &self.log;
    }

    pub fn pending_len(&self) -> usize {
        return self.pending.len();
    }

    /// Contiguous knowledge per site.
    pub fn version(&self) -> VersionVector {
        let mut version = VersionVector::new();
        for (site, mark) in &self.seen {
            version.observe(site, mark.contiguous());
        }
        return version;
    }

    /// Next free sequence number for a site that only this replica writes.
    pub fn next_seq(&self, site: &SiteId) -> u64 {
        return self.seen.get(site).map(|mark| mark.contiguous()).unwrap_or(0).saturating_add(1);
    }

    fn has_seen(&self, id: &CharId) -> bool {
        return self.seen.get(&id.site).is_some_and(|mark| mark.contains(id.seq));
    }

    fn mark_seen(&mut self, id: &CharId, width: u64) {
        let mark = self.seen.entry(id.site.clone()).or_default();
        for n in 0..width {
            mark.insert(id.seq.saturating_add(n));
        }
    }

    fn position(&self, id: &CharId) -> Option<usize> {
        return self.items.iter().position(|item| &item.id == id);
    }

    fn is_ready(&self, update: &TextUpdate) -> bool {
        match update {
            TextUpdate::Insert { origin, .. } => {
                return origin.as_ref().is_none_or(|origin| self.known.contains(origin));
            }
            TextUpdate::Delete { targets, .. } => {
                return targets.iter().all(|target| self.known.contains(target));
            }
        }
    }

    /// Integrate a replicated update.
    ///
    /// Returns how many updates were applied, counting any pending updates
    /// it released. Replays are ignored.
    pub fn integrate(&mut self, update: TextUpdate) -> usize {
        if !update.in_range() {
            tracing::warn!(id = ?update.id(), "ignoring text update outside the sequence range");
            return 0;
        }
        if self.has_seen(update.id()) || self.pending.iter().any(|(waiting, _)| waiting == &update) {
            return 0;
        }
        if !self.is_ready(&update) {
            tracing::debug!(id = ?update.id(), "queueing text update until its dependencies arrive");
            self.pending.push((update, 0));
            return 0;
        }
        self.apply_ready(update);
        let mut applied = 1;
        loop {
            let Some(index) = self.pending.iter().position(|(update, _)| self.is_ready(update)) else { break };
            let (update, _) = self.pending.remove(index);
            if !self.has_seen(update.id()) {
                self.apply_ready(update);
                applied += 1;
            }
        }
        return applied;
    }

    /// Count one more batch against every pending update, dropping the
    /// ones that already waited through `max_batches`.
    pub fn expire_pending(&mut self, max_batches: u32) -> Vec<TextUpdate> {
        let mut expired = Vec::new();
        self.pending.retain_mut(|(update, batches)| {
            if *batches >= max_batches {
                expired.push(update.clone());
                return false;
            }
            *batches += 1;
            return true;
        });
        return expired;
    }

    fn apply_ready(&mut self, update: TextUpdate) {
        match &update {
            TextUpdate::Insert { id, stamp, origin, text } => {
                let mut origin = origin.clone();
                for (n, ch) in text.chars().enumerate() {
                    let item = Item {
                        id: id.offset(n as u64),
                        stamp: stamp.saturating_add(n as u64),
                        origin: origin.clone(),
                        ch,
                        deleted_by: SmallVec::new(),
                    };
                    origin = Some(item.id.clone());
                    self.integrate_item(item);
                }
            }
            TextUpdate::Delete { id, targets } => {
                for target in targets {
                    if let Some(index) = self.position(target) {
                        let item = &mut self.items[index];
                        if !item.deleted_by.contains(id) {
                            item.deleted_by.push(id.clone());
                        }
                    }
                }
            }
        }
        self.mark_seen(update.id(), update.width());
        self.log.push(update);
    }

    fn integrate_item(&mut self, item: Item) {
        let mut index = match &item.origin {
            Some(origin) => self.position(origin).map(|i| i + 1).unwrap_or(self.items.len()),
            None => 0,
        };
        while let Some(next) = self.items.get(index) {
            if (next.stamp, &next.id.site) > (item.stamp, &item.id.site) {
                index += 1;
            } else {
                break;
            }
        }
        self.lamport = self.lamport.max(item.stamp);
        self.known.insert(item.id.clone());
        self.items.insert(index, item);
    }

    /// Translate an edit into updates stamped by `site` and integrate them.
    ///
    /// Offsets count only the characters visible under `version`, plus the
    /// ones this edit inserts itself.
    pub fn apply_ops(&mut self, site: &SiteId, version: &VersionVector, ops: &[EditOp]) -> Vec<TextUpdate> {
        let mut visibility = Visibility {
            version,
            created: FxHashSet::default(),
            deletes: FxHashSet::default(),
        };
        let mut updates = Vec::new();
        let mut index = 0;
        let mut left: Option<CharId> = None;

        for op in ops {
            match op {
                EditOp::Preserve(n) => {
                    let mut count = 0;
                    while count < *n && index < self.items.len() {
                        let item = &self.items[index];
                        if visibility.sees(item) {
                            count += 1;
                            left = Some(item.id.clone());
                        }
                        index += 1;
                    }
                }
                EditOp::Insert(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let id = CharId::new(site.clone(), self.next_seq(site));
                    let width = text.chars().count() as u64;
                    let update = TextUpdate::Insert {
                        id: id.clone(),
                        stamp: self.lamport.saturating_add(1),
                        origin: left.clone(),
                        text: text.clone(),
                    };
                    self.apply_ready(update.clone());
                    for n in 0..width {
                        visibility.created.insert(id.offset(n));
                    }
                    let last = id.offset(width - 1);
                    index = self.position(&last).map(|i| i + 1).unwrap_or(self.items.len());
                    left = Some(last);
                    updates.push(update);
                }
                EditOp::Delete(n) => {
                    let mut targets = Vec::new();
                    while (targets.len() as u64) < *n && index < self.items.len() {
                        let item = &self.items[index];
                        if visibility.sees(item) {
                            targets.push(item.id.clone());
                        }
                        index += 1;
                    }
                    if targets.is_empty() {
                        continue;
                    }
                    let id = CharId::new(site.clone(), self.next_seq(site));
                    let update = TextUpdate::Delete { id: id.clone(), targets };
                    self.apply_ready(update.clone());
                    visibility.deletes.insert(id);
                    updates.push(update);
                }
            }
        }
        return updates;
    }

    /// Insert at a visible position, as `site`. Returns the update.
    pub fn insert(&mut self, site: &SiteId, pos: u64, text: &str) -> Option<TextUpdate> {
        let version = self.version();
        let mut ops = Vec::new();
        if pos > 0 {
            ops.push(EditOp::Preserve(pos));
        }
        ops.push(EditOp::Insert(text.to_string()));
        return self.apply_ops(site, &version, &ops).pop();
    }

    /// Delete visible characters, as `site`. Returns the update.
    pub fn delete(&mut self, site: &SiteId, start: u64, len: u64) -> Option<TextUpdate> {
        let version = self.version();
        let mut ops = Vec::new();
        if start > 0 {
            ops.push(EditOp::Preserve(start));
        }
        ops.push(EditOp::Delete(len));
        return self.apply_ops(site, &version, &ops).pop();
    }
}

impl std::fmt::Display for Rga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for item in &self.items {
            if !item.is_deleted() {
                write!(f, "{}", item.ch)?;
            }
        }
        return Ok(());
    }
}

impl Crdt for Rga {
    fn merge(&mut self, other: &Self) {
        for update in other.log.iter().chain(other.pending.iter().map(|(update, _)| update)) {
            self.integrate(update.clone());
        }
    }
}
