// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A partition backed by a local weave.
//!
//! `WeaveStore` turns bot events into atoms and is shared with the remote
//! and other-players partitions. Translation rules:
//!
//! - add: a create-record atom, then a field and a value per tag
//! - set: a value under the field currently winning for that tag, or under
//!   a new field when the tag has none
//! - clear: delete every live field of that tag
//! - edit: the edit applied to the current string, stored as a set
//! - remove: delete every live record of the bot

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bot::Bot;
use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::TagUpdate;
use crate::bot::TagValue;
use crate::bot::expand_bulk_state;
use crate::crdt::atom::Atom;
use crate::crdt::atom::AtomOp;
use crate::crdt::primitives::AtomId;
use crate::crdt::primitives::SiteId;
use crate::crdt::reducer;
use crate::crdt::tree::AddReport;
use crate::crdt::tree::CausalTree;
use crate::crdt::weave::InsertResult;
use crate::crdt::weave::Weave;
use crate::key::KeyPair;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::stream::Observer;
use super::stream::SubscriptionId;

/// Atoms produced by local writes.
#[derive(Clone, Debug, Default)]
pub struct LocalWrite {
    pub atoms: Vec<Atom>,
    pub results: Vec<InsertResult>,
}

impl LocalWrite {
    fn push(&mut self, (atom, result): (Atom, InsertResult)) {
        self.atoms.push(atom);
        self.results.push(result);
    }
}

/// A causal tree that speaks bot events.
#[derive(Clone, Debug)]
pub struct WeaveStore {
    tree: CausalTree,
}

impl WeaveStore {
    pub fn new(site: SiteId) -> WeaveStore {
        return WeaveStore { tree: CausalTree::new(site) };
    }

    pub fn with_keys(site: SiteId, keys: KeyPair) -> WeaveStore {
        return WeaveStore { tree: CausalTree::with_keys(site, keys) };
    }

    pub fn with_max_orphan_batches(mut self, batches: u32) -> WeaveStore {
        self.tree = self.tree.with_max_orphan_batches(batches);
        return self;
    }

    pub fn tree(&self) -> &CausalTree {
        return &self.tree;
    }

    pub fn weave(&self) -> &Weave {
        return self.tree.weave();
    }

    /// Fold in atoms from elsewhere.
    pub fn add_atoms(&mut self, atoms: impl IntoIterator<Item = Atom>) -> AddReport {
        return self.tree.add_atoms(atoms);
    }

    /// Reduce a batch of results into `prior`.
    pub fn reduce(&self, prior: &PartitionState, results: &[InsertResult], space: Option<&str>) -> (PartitionState, crate::bot::StateDiff) {
        return reducer::reduce_in_space(self.tree.weave(), prior, results, space);
    }

    pub fn bot(&self, id: &str) -> Option<Bot> {
        return reducer::reduce_bot(self.tree.weave(), id, None);
    }

    /// Translate one event into local atoms. Passthrough events produce
    /// nothing.
    pub fn apply_event(&mut self, event: &BotEvent, write: &mut LocalWrite) -> Result<(), PartitionError> {
        match event {
            BotEvent::Add { bot } => {
                if self.bot(&bot.id).is_some() {
                    let tags = bot.tags.iter().map(|(name, value)| (name.clone(), TagUpdate::Set(value.clone()))).collect();
                    let masks = bot.masks
                        .iter()
                        .map(|(space, tags)| {
                            let updates = tags.iter().map(|(name, value)| (name.clone(), TagUpdate::Set(value.clone()))).collect();
                            (space.clone(), updates)
                        })
                        .collect();
                    return self.update(&bot.id, &tags, &masks, write);
                }
                let (record, result) = self.tree.create(None, AtomOp::CreateRecord { id: bot.id.clone() })?;
                let record_id = record.id.clone();
                write.push((record, result));
                for (name, value) in &bot.tags {
                    self.new_field(&record_id, name, None, value.clone(), write)?;
                }
                for (space, tags) in &bot.masks {
                    for (name, value) in tags {
                        self.new_field(&record_id, name, Some(space.clone()), value.clone(), write)?;
                    }
                }
                return Ok(());
            }
            BotEvent::Update { id, tags, masks } => {
                return self.update(id, tags, masks, write);
            }
            BotEvent::Remove { id } => {
                let records: Vec<AtomId> = self.weave()
                    .record_atoms(id)
                    .iter()
                    .filter(|record| self.weave().is_visible(record))
                    .cloned()
                    .collect();
                if records.is_empty() {
                    return Err(PartitionError::UnknownBot(id.clone()));
                }
                for record in &records {
                    write.push(self.tree.delete(record)?);
                }
                return Ok(());
            }
            BotEvent::ApplyState { state } => {
                let current = PartitionState::from_bots(state.keys().filter_map(|id| self.bot(id)));
                for expanded in expand_bulk_state(&current, state) {
                    self.apply_event(&expanded, write)?;
                }
                return Ok(());
            }
            BotEvent::Passthrough { .. } => return Ok(()),
        }
    }

    fn update(
        &mut self,
        id: &str,
        tags: &BTreeMap<String, TagUpdate>,
        masks: &BTreeMap<String, BTreeMap<String, TagUpdate>>,
        write: &mut LocalWrite,
    ) -> Result<(), PartitionError> {
        let Some(current) = self.bot(id) else {
            return Err(PartitionError::UnknownBot(id.to_string()));
        };
        for (name, update) in tags {
            self.update_tag(id, None, name, update, current.tag(name), write)?;
        }
        for (space, updates) in masks {
            for (name, update) in updates {
                let value = current.masks.get(space).and_then(|mask| mask.get(name));
                self.update_tag(id, Some(space.as_str()), name, update, value, write)?;
            }
        }
        return Ok(());
    }

    fn update_tag(
        &mut self,
        id: &str,
        space: Option<&str>,
        name: &str,
        update: &TagUpdate,
        current: Option<&TagValue>,
        write: &mut LocalWrite,
    ) -> Result<(), PartitionError> {
        let fields = reducer::live_fields(self.tree.weave(), id);
        let live: Vec<(AtomId, Option<AtomId>)> = fields
            .get(&(space, name))
            .map(|fields| {
                fields
                    .iter()
                    .map(|field| (field.field.clone(), field.value.map(|(value_id, _)| value_id.clone())))
                    .collect()
            })
            .unwrap_or_default();

        match update.apply_to(current) {
            None => {
                for (field, _) in &live {
                    write.push(self.tree.delete(field)?);
                }
            }
            Some(value) => {
                let winner = live
                    .iter()
                    .max_by(|(_, a), (_, b)| match (a, b) {
                        (Some(a), Some(b)) => a.recency_cmp(b),
                        (Some(_), None) => Ordering::Greater,
                        (None, Some(_)) => Ordering::Less,
                        (None, None) => Ordering::Equal,
                    })
                    .map(|(field, _)| field.clone());
                match winner {
                    Some(field) => {
                        write.push(self.tree.create(Some(&field), AtomOp::SetValue { value })?);
                    }
                    None => {
                        let record = self.weave()
                            .record_atoms(id)
                            .iter()
                            .find(|record| self.weave().is_visible(record))
                            .cloned();
                        let Some(record) = record else {
                            return Err(PartitionError::UnknownBot(id.to_string()));
                        };
                        self.new_field(&record, name, space.map(str::to_string), value, write)?;
                    }
                }
            }
        }
        return Ok(());
    }

    fn new_field(
        &mut self,
        record: &AtomId,
        name: &str,
        space: Option<String>,
        value: TagValue,
        write: &mut LocalWrite,
    ) -> Result<(), PartitionError> {
        if value.is_null() {
            return Ok(());
        }
        let (field, result) = self.tree.create(Some(record), AtomOp::CreateField { name: name.to_string(), space })?;
        let field_id = field.id.clone();
        write.push((field, result));
        write.push(self.tree.create(Some(&field_id), AtomOp::SetValue { value })?);
        return Ok(());
    }
}

/// A partition over a weave owned by this process.
#[derive(Debug)]
pub struct CausalTreePartition {
    core: PartitionCore,
    store: WeaveStore,
}

impl CausalTreePartition {
    pub fn new(site: SiteId, space: Option<String>) -> CausalTreePartition {
        return CausalTreePartition {
            core: PartitionCore::new(space),
            store: WeaveStore::new(site),
        };
    }

    pub fn with_keys(site: SiteId, space: Option<String>, keys: KeyPair) -> CausalTreePartition {
        return CausalTreePartition {
            core: PartitionCore::new(space),
            store: WeaveStore::with_keys(site, keys),
        };
    }

    pub fn with_max_orphan_batches(mut self, batches: u32) -> CausalTreePartition {
        self.store = self.store.with_max_orphan_batches(batches);
        return self;
    }

    pub fn store(&self) -> &WeaveStore {
        return &self.store;
    }

    pub fn weave(&self) -> &Weave {
        return self.store.weave();
    }

    /// Every atom, for replicating into another partition.
    pub fn atoms(&self) -> Vec<Atom> {
        return self.store.weave().atoms();
    }

    /// Fold in atoms from another replica and publish what changed.
    pub fn add_atoms(&mut self, atoms: impl IntoIterator<Item = Atom>) -> AddReport {
        let report = self.store.add_atoms(atoms);
        for err in report.errors() {
            self.core.error(&PartitionError::Weave(err.clone()));
        }
        self.commit(&report.results);
        return report;
    }

    fn commit(&mut self, results: &[InsertResult]) {
        if results.is_empty() {
            return;
        }
        let (state, diff) = self.store.reduce(&self.core.state(), results, self.core.space());
        self.core.commit(state, diff);
    }
}

impl Partition for CausalTreePartition {
    fn kind(&self) -> &'static str {
        return "causal_tree";
    }

    fn space(&self) -> Option<&str> {
        return self.core.space();
    }

    fn state(&self) -> Arc<PartitionState> {
        return self.core.state();
    }

    fn status(&self) -> ConnectionStatus {
        return self.core.status();
    }

    fn subscribe(&mut self, observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId {
        return self.core.subscribe(observer, catch_up);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return self.core.unsubscribe(id);
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        let mut write = LocalWrite::default();
        let mut echo = Vec::new();
        for event in events {
            if let BotEvent::Passthrough { .. } = event {
                echo.push(event.clone());
                continue;
            }
            if let Err(err) = self.store.apply_event(event, &mut write) {
                self.core.error(&err);
            }
        }
        self.commit(&write.results);
        return Ok(echo);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        self.core.ready();
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::weave::WeaveError;
    use crate::partition::stream::EventRecorder;

    fn partition(site: &str) -> (CausalTreePartition, EventRecorder) {
        let mut partition = CausalTreePartition::new(SiteId::from(site), None);
        let recorder = EventRecorder::new();
        partition.subscribe(recorder.observer(), false);
        partition.connect().unwrap();
        return (partition, recorder);
    }

    #[test]
    fn add_creates_atoms_and_bot() {
        let (mut p, recorder) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red").with_tag("n", 3))]).unwrap();

        assert_eq!(p.weave().len(), 5);
        assert_eq!(recorder.added(), vec!["b1".to_string()]);
        assert_eq!(p.state().get("b1").and_then(|bot| bot.tag("color")), Some(&TagValue::from("red")));
    }

    #[test]
    fn set_reuses_the_winning_field() {
        let (mut p, recorder) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        p.apply_events(&[BotEvent::set_tag("b1", "color", "blue")]).unwrap();

        assert_eq!(p.weave().len(), 4);
        assert_eq!(recorder.updated()[0].tags, vec!["color".to_string()]);
        assert_eq!(p.state().get("b1").and_then(|bot| bot.tag("color")), Some(&TagValue::from("blue")));
    }

    #[test]
    fn clear_deletes_the_field() {
        let (mut p, _) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        p.apply_events(&[BotEvent::clear_tag("b1", "color")]).unwrap();
        assert_eq!(p.state().get("b1"), Some(&Bot::new("b1")));

        p.apply_events(&[BotEvent::set_tag("b1", "color", "green")]).unwrap();
        assert_eq!(p.state().get("b1").and_then(|bot| bot.tag("color")), Some(&TagValue::from("green")));
    }

    #[test]
    fn remove_cascades_to_one_removed_entry() {
        let (mut p, recorder) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        p.apply_events(&[BotEvent::remove("b1")]).unwrap();

        assert!(p.state().is_empty());
        assert_eq!(recorder.removed(), vec![vec!["b1".to_string()]]);
        for atom in p.weave().iter() {
            assert!(!p.weave().is_visible(&atom.id));
        }
    }

    #[test]
    fn add_then_remove_in_one_batch_publishes_nothing() {
        let (mut p, recorder) = partition("a");
        recorder.take();
        p.apply_events(&[BotEvent::add(Bot::new("b1")), BotEvent::remove("b1")]).unwrap();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn edits_apply_to_the_current_string() {
        let (mut p, _) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("label", "abc"))]).unwrap();
        let edit = crate::crdt::op::TagEdit::insert(Default::default(), 1, "X");
        p.apply_events(&[BotEvent::edit_tag("b1", "label", edit)]).unwrap();
        assert_eq!(p.state().get("b1").and_then(|bot| bot.tag("label")), Some(&TagValue::from("aXbc")));
    }

    #[test]
    fn masks_land_in_their_space() {
        let (mut p, _) = partition("a");
        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        p.apply_events(&[BotEvent::set_mask("b1", "tempLocal", "color", "blue")]).unwrap();

        let state = p.state();
        let bot = state.get("b1").unwrap();
        assert_eq!(bot.tag("color"), Some(&TagValue::from("red")));
        assert_eq!(bot.tag_in_space("tempLocal", "color"), Some(&TagValue::from("blue")));
    }

    #[test]
    fn replicas_converge_on_concurrent_sets() {
        let (mut a, _) = partition("a");
        let (mut b, _) = partition("b");
        a.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        b.add_atoms(a.atoms());

        a.apply_events(&[BotEvent::set_tag("b1", "color", "blue")]).unwrap();
        b.apply_events(&[BotEvent::set_tag("b1", "color", "green")]).unwrap();
        let from_a = a.atoms();
        let from_b = b.atoms();
        a.add_atoms(from_b);
        b.add_atoms(from_a);

        assert_eq!(a.state(), b.state());
        assert_eq!(a.state().get("b1").and_then(|bot| bot.tag("color")), Some(&TagValue::from("green")));
    }

    #[test]
    fn unknown_bot_updates_emit_errors() {
        let (mut p, recorder) = partition("a");
        p.apply_events(&[BotEvent::set_tag("ghost", "x", 1), BotEvent::remove("ghost")]).unwrap();
        assert_eq!(recorder.errors().len(), 2);
        assert!(p.weave().is_empty());
    }

    #[test]
    fn malformed_remote_atoms_emit_errors() {
        let (mut p, recorder) = partition("a");
        let mut bogus = Atom::new(AtomId::new(SiteId::from("z"), 1, 0), None, AtomOp::CreateRecord { id: "b".to_string() });
        bogus.hash = crate::key::hash(b"nope");
        let report = p.add_atoms([bogus]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(recorder.errors().len(), 1);
        assert!(p.weave().is_empty());
    }

    #[test]
    fn orphaned_deletes_reach_the_error_stream() {
        let (mut a, _) = partition("a");
        a.apply_events(&[BotEvent::add(Bot::new("b1"))]).unwrap();
        a.apply_events(&[BotEvent::remove("b1")]).unwrap();
        let deletes: Vec<Atom> = a.atoms().into_iter().filter(Atom::is_delete).collect();
        assert_eq!(deletes.len(), 1);

        let mut b = CausalTreePartition::new(SiteId::from("b"), None).with_max_orphan_batches(1);
        let recorder = EventRecorder::new();
        b.subscribe(recorder.observer(), false);
        b.connect().unwrap();

        b.add_atoms(deletes);
        assert!(recorder.errors().is_empty());

        let report = b.add_atoms([Atom::new(AtomId::new(SiteId::from("c"), 1, 0), None, AtomOp::CreateRecord { id: "b2".to_string() })]);
        assert_eq!(report.expired.len(), 1);
        assert_eq!(recorder.errors().len(), 1);
        assert!(b.store().tree().orphans().is_empty());
    }

    #[test]
    fn oversized_sequences_are_refused_without_stalling_local_writes() {
        let (mut p, recorder) = partition("a");
        let huge = Atom::new(AtomId::new(SiteId::from("z"), u64::MAX, 0), None, AtomOp::CreateRecord { id: "big".to_string() });
        let report = p.add_atoms([huge]);
        assert!(matches!(report.rejected.as_slice(), [WeaveError::SequenceOutOfRange { .. }]));
        assert_eq!(recorder.errors().len(), 1);

        p.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("n", 1))]).unwrap();
        assert!(p.state().contains("b1"));
        assert!(!p.state().contains("big"));
    }
}
