// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A partition whose string tags are collaborative texts.
//!
//! Each tag is a register stamped with a Lamport `Stamp`. Writing a tag
//! replaces the register when the new stamp is greater. String values get a
//! `TextDoc` register instead of a plain one, and `TagUpdate::Edit` then
//! merges character by character rather than overwriting.
//!
//! Replication is by `DocUpdate`:
//!
//! - `CreateBot` / `RemoveBot`: a bot is visible while its latest create
//!   stamp is greater than its latest remove stamp
//! - `SetTag`: a plain register, `Null` clears
//! - `SetText`: an empty text register
//! - `TextEdit`: a text update for the register with the given stamp
//!
//! Text edits for a register this replica has not heard of yet wait until
//! the register arrives. Edits for a register that has already been
//! replaced are dropped. Anything still waiting after
//! `max_deferred_retries` merged batches is dropped and reported on the
//! error stream. Updates stamped past `MAX_SEQUENCE` are refused.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::bot::Bot;
use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::StateDiff;
use crate::bot::TagUpdate;
use crate::bot::TagValue;
use crate::bot::expand_bulk_state;
use crate::crdt::op::TagEdit;
use crate::crdt::primitives::MAX_SEQUENCE;
use crate::crdt::primitives::SiteId;
use crate::crdt::primitives::VersionVector;
use crate::crdt::rga::TextUpdate;
use crate::crdt::text::DEFAULT_MAX_DEFERRED_RETRIES;
use crate::crdt::text::EditOutcome;
use crate::crdt::text::TextDoc;
use crate::crdt::text::TextError;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::stream::Observer;
use super::stream::SubscriptionId;

/// A Lamport timestamp. Ties break on site.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub site: SiteId,
}

/// A replicated change to a text partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocUpdate {
    CreateBot {
        id: String,
        stamp: Stamp,
    },
    RemoveBot {
        id: String,
        stamp: Stamp,
    },
    SetTag {
        id: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        stamp: Stamp,
        value: TagValue,
    },
    SetText {
        id: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        stamp: Stamp,
    },
    TextEdit {
        id: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        register: Stamp,
        update: TextUpdate,
    },
}

impl DocUpdate {
    pub fn bot_id(&self) -> &str {
        match self {
            DocUpdate::CreateBot { id, .. } => return id,
            DocUpdate::RemoveBot { id, .. } => return id,
            DocUpdate::SetTag { id, .. } => return id,
            DocUpdate::SetText { id, .. } => return id,
            DocUpdate::TextEdit { id, .. } => return id,
        }
    }

    fn lamport(&self) -> u64 {
        match self {
            DocUpdate::CreateBot { stamp, .. } => return stamp.lamport,
            DocUpdate::RemoveBot { stamp, .. } => return stamp.lamport,
            DocUpdate::SetTag { stamp, .. } => return stamp.lamport,
            DocUpdate::SetText { stamp, .. } => return stamp.lamport,
            DocUpdate::TextEdit { register, .. } => return register.lamport,
        }
    }
}

/// Space and name of a tag. Base tags have no space.
type TagKey = (Option<String>, String);

#[derive(Clone, Debug)]
enum RegisterValue {
    Plain(TagValue),
    Text(TextDoc),
}

#[derive(Clone, Debug)]
struct Register {
    stamp: Stamp,
    value: RegisterValue,
}

#[derive(Clone, Debug, Default)]
struct TextBot {
    created: Option<Stamp>,
    removed: Option<Stamp>,
    registers: BTreeMap<TagKey, Register>,
}

impl TextBot {
    fn is_visible(&self) -> bool {
        return self.created > self.removed;
    }

    fn to_bot(&self, id: &str, space: Option<&str>) -> Option<Bot> {
        if !self.is_visible() {
            return None;
        }
        let mut bot = Bot::new(id);
        bot.space = space.map(str::to_string);
        for ((mask, name), register) in &self.registers {
            if Some(&register.stamp) < self.removed.as_ref() {
                continue;
            }
            let value = match &register.value {
                RegisterValue::Plain(TagValue::Null) => continue,
                RegisterValue::Plain(value) => value.clone(),
                RegisterValue::Text(doc) => TagValue::String(doc.text()),
            };
            match mask {
                None => {
                    bot.tags.insert(name.clone(), value);
                }
                Some(mask) => {
                    bot.masks.entry(mask.clone()).or_default().insert(name.clone(), value);
                }
            }
        }
        return Some(bot);
    }
}

/// Errors and new updates gathered while integrating.
#[derive(Default)]
struct Batch {
    touched: Vec<String>,
    errors: Vec<PartitionError>,
    outgoing: Vec<DocUpdate>,
}

impl Batch {
    fn touch(&mut self, id: &str) {
        if !self.touched.iter().any(|other| other == id) {
            self.touched.push(id.to_string());
        }
    }
}

#[derive(Debug)]
pub struct TextPartition {
    core: PartitionCore,
    site: SiteId,
    lamport: u64,
    max_deferred_retries: u32,
    bots: BTreeMap<String, TextBot>,
    /// Text edits waiting for their register, with how many merged
    /// batches each has waited through.
    pending: Vec<(DocUpdate, u32)>,
    /// Updates produced locally since the last `take_local_updates`.
    outbox: Vec<DocUpdate>,
}

impl TextPartition {
    pub fn new(site: SiteId, space: Option<String>) -> TextPartition {
        return TextPartition {
            core: PartitionCore::new(space),
            site,
            lamport: 0,
            max_deferred_retries: DEFAULT_MAX_DEFERRED_RETRIES,
            bots: BTreeMap::new(),
            pending: Vec::new(),
            outbox: Vec::new(),
        };
    }

    pub fn with_max_deferred_retries(mut self, retries: u32) -> TextPartition {
        self.max_deferred_retries = retries;
        return self;
    }

    pub fn site(&self) -> &SiteId {
        return &self.site;
    }

    /// Updates waiting for a register or for characters they refer to.
    pub fn pending_len(&self) -> usize {
        let in_docs: usize = self.bots
            .values()
            .flat_map(|bot| bot.registers.values())
            .map(|register| match &register.value {
                RegisterValue::Text(doc) => doc.pending_len(),
                RegisterValue::Plain(_) => 0,
            })
            .sum();
        return self.pending.len() + in_docs;
    }

    /// What this replica has seen of a text tag, for issuing edits.
    pub fn text_version(&self, id: &str, tag: &str) -> Option<VersionVector> {
        let register = self.bots.get(id)?.registers.get(&(None, tag.to_string()))?;
        match &register.value {
            RegisterValue::Text(doc) => return Some(doc.version()),
            RegisterValue::Plain(_) => return None,
        }
    }

    /// Drain the updates produced by local writes.
    pub fn take_local_updates(&mut self) -> Vec<DocUpdate> {
        return std::mem::take(&mut self.outbox);
    }

    /// Every update needed to rebuild this replica's state elsewhere.
    pub fn updates(&self) -> Vec<DocUpdate> {
        let mut updates = Vec::new();
        for (id, bot) in &self.bots {
            if let Some(stamp) = &bot.created {
                updates.push(DocUpdate::CreateBot { id: id.clone(), stamp: stamp.clone() });
            }
            if let Some(stamp) = &bot.removed {
                updates.push(DocUpdate::RemoveBot { id: id.clone(), stamp: stamp.clone() });
            }
            for ((space, tag), register) in &bot.registers {
                match &register.value {
                    RegisterValue::Plain(value) => updates.push(DocUpdate::SetTag {
                        id: id.clone(),
                        tag: tag.clone(),
                        space: space.clone(),
                        stamp: register.stamp.clone(),
                        value: value.clone(),
                    }),
                    RegisterValue::Text(doc) => {
                        updates.push(DocUpdate::SetText {
                            id: id.clone(),
                            tag: tag.clone(),
                            space: space.clone(),
                            stamp: register.stamp.clone(),
                        });
                        for update in doc.updates() {
                            updates.push(DocUpdate::TextEdit {
                                id: id.clone(),
                                tag: tag.clone(),
                                space: space.clone(),
                                register: register.stamp.clone(),
                                update: update.clone(),
                            });
                        }
                    }
                }
            }
        }
        return updates;
    }

    /// Fold in updates from another replica and publish what changed.
    pub fn merge_updates(&mut self, updates: impl IntoIterator<Item = DocUpdate>) {
        let prior = self.core.state();
        let mut batch = Batch::default();
        let mut any = false;
        for update in updates {
            any = true;
            if update.lamport() > MAX_SEQUENCE {
                batch.errors.push(PartitionError::Text(TextError::StampOutOfRange { lamport: update.lamport() }));
                continue;
            }
            self.integrate(update, &mut batch);
        }
        if any {
            self.expire_pending(&mut batch);
        }
        self.finish(&prior, batch);
    }

    fn expire_pending(&mut self, batch: &mut Batch) {
        let max = self.max_deferred_retries;
        self.pending.retain_mut(|(update, batches)| {
            if *batches >= max {
                if let DocUpdate::TextEdit { update: text, .. } = update {
                    batch.errors.push(PartitionError::Text(TextError::Stranded { update: text.clone() }));
                }
                return false;
            }
            *batches += 1;
            return true;
        });
        for bot in self.bots.values_mut() {
            for register in bot.registers.values_mut() {
                if let RegisterValue::Text(doc) = &mut register.value {
                    batch.errors.extend(doc.expire_pending().into_iter().map(PartitionError::Text));
                }
            }
        }
    }

    fn tick(&mut self) -> Stamp {
        self.lamport = self.lamport.saturating_add(1);
        return Stamp { lamport: self.lamport, site: self.site.clone() };
    }

    fn new_doc(&self) -> TextDoc {
        return TextDoc::new(self.site.clone()).with_max_deferred_retries(self.max_deferred_retries);
    }

    fn current(&self, id: &str) -> Option<Bot> {
        return self.bots.get(id).and_then(|bot| bot.to_bot(id, self.core.space()));
    }

    /// Apply one update. Returns whether it was new.
    fn integrate(&mut self, update: DocUpdate, batch: &mut Batch) -> bool {
        self.lamport = self.lamport.max(update.lamport());
        let id = update.bot_id().to_string();
        let changed = match update {
            DocUpdate::CreateBot { id, stamp } => {
                let bot = self.bots.entry(id).or_default();
                let newer = bot.created.as_ref().is_none_or(|created| stamp > *created);
                if newer {
                    bot.created = Some(stamp);
                }
                newer
            }
            DocUpdate::RemoveBot { id, stamp } => {
                let bot = self.bots.entry(id).or_default();
                let newer = bot.removed.as_ref().is_none_or(|removed| stamp > *removed);
                if newer {
                    bot.removed = Some(stamp);
                }
                newer
            }
            DocUpdate::SetTag { id, tag, space, stamp, value } => {
                self.set_register(id, (space, tag), stamp, RegisterValue::Plain(value))
            }
            DocUpdate::SetText { id, tag, space, stamp } => {
                let doc = RegisterValue::Text(self.new_doc());
                let newer = self.set_register(id.clone(), (space.clone(), tag.clone()), stamp.clone(), doc);
                if newer {
                    self.release_pending(&id, &(space, tag), &stamp, batch);
                }
                newer
            }
            update @ DocUpdate::TextEdit { .. } => self.integrate_text(update, batch),
        };
        if changed {
            batch.touch(&id);
        }
        return changed;
    }

    fn set_register(&mut self, id: String, key: TagKey, stamp: Stamp, value: RegisterValue) -> bool {
        let bot = self.bots.entry(id).or_default();
        if let Some(register) = bot.registers.get(&key) {
            if stamp <= register.stamp {
                return false;
            }
        }
        bot.registers.insert(key, Register { stamp, value });
        return true;
    }

    fn integrate_text(&mut self, update: DocUpdate, batch: &mut Batch) -> bool {
        let DocUpdate::TextEdit { id, tag, space, register, update: text } = update else {
            return false;
        };
        let key = (space.clone(), tag.clone());
        let Some(current) = self.bots.get_mut(&id).and_then(|bot| bot.registers.get_mut(&key)) else {
            self.park(DocUpdate::TextEdit { id, tag, space, register, update: text });
            return false;
        };
        if current.stamp < register {
            self.park(DocUpdate::TextEdit { id, tag, space, register, update: text });
            return false;
        }
        let RegisterValue::Text(doc) = &mut current.value else {
            return false;
        };
        if current.stamp > register {
            tracing::debug!(%id, %tag, "dropping text update for a replaced register");
            return false;
        }
        match doc.integrate(text) {
            Ok(outcome) => {
                let applied = outcome.applied;
                Self::absorb(&id, &key, &register, outcome, batch);
                return applied;
            }
            Err(err) => {
                batch.errors.push(PartitionError::Text(err));
                return false;
            }
        }
    }

    fn park(&mut self, update: DocUpdate) {
        if !self.pending.iter().any(|(waiting, _)| waiting == &update) {
            tracing::debug!(id = %update.bot_id(), "queueing text update until its register arrives");
            self.pending.push((update, 0));
        }
    }

    fn release_pending(&mut self, id: &str, key: &TagKey, stamp: &Stamp, batch: &mut Batch) {
        let (ready, waiting): (Vec<(DocUpdate, u32)>, Vec<(DocUpdate, u32)>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(update, _)| match update {
                DocUpdate::TextEdit { id: other, tag, space, register, .. } => {
                    other == id && tag == &key.1 && space == &key.0 && register <= stamp
                }
                _ => false,
            });
        self.pending = waiting;
        for (update, _) in ready {
            self.integrate(update, batch);
        }
    }

    /// Collect what a text outcome produced: new updates to replicate and
    /// expired edits to report.
    fn absorb(id: &str, key: &TagKey, register: &Stamp, outcome: EditOutcome, batch: &mut Batch) {
        for update in outcome.updates {
            batch.outgoing.push(DocUpdate::TextEdit {
                id: id.to_string(),
                tag: key.1.clone(),
                space: key.0.clone(),
                register: register.clone(),
                update,
            });
        }
        for err in outcome.expired {
            batch.errors.push(PartitionError::Text(err));
        }
    }

    /// Produce and apply the updates for a local write.
    fn local(&mut self, update: DocUpdate, batch: &mut Batch) {
        self.integrate(update.clone(), batch);
        batch.outgoing.push(update);
    }

    fn set_local(&mut self, id: &str, key: TagKey, value: TagValue, batch: &mut Batch) {
        let stamp = self.tick();
        let TagValue::String(text) = value else {
            self.local(DocUpdate::SetTag { id: id.to_string(), tag: key.1, space: key.0, stamp, value }, batch);
            return;
        };
        self.local(DocUpdate::SetText { id: id.to_string(), tag: key.1.clone(), space: key.0.clone(), stamp: stamp.clone() }, batch);
        if !text.is_empty() {
            let edit = TagEdit::insert(VersionVector::new(), 0, text);
            self.edit_register(id, &key, &stamp, &edit, batch);
        }
    }

    fn edit_register(&mut self, id: &str, key: &TagKey, stamp: &Stamp, edit: &TagEdit, batch: &mut Batch) {
        let Some(register) = self.bots.get_mut(id).and_then(|bot| bot.registers.get_mut(key)) else {
            return;
        };
        let RegisterValue::Text(doc) = &mut register.value else {
            return;
        };
        match doc.apply_edit(edit, edit.is_remote) {
            Ok(outcome) => {
                Self::absorb(id, key, stamp, outcome, batch);
                batch.touch(id);
            }
            Err(err) => batch.errors.push(PartitionError::Text(err)),
        }
    }

    fn update_local(&mut self, id: &str, key: TagKey, update: &TagUpdate, batch: &mut Batch) {
        match update {
            TagUpdate::Set(value) => self.set_local(id, key, value.clone(), batch),
            TagUpdate::Clear => self.set_local(id, key, TagValue::Null, batch),
            TagUpdate::Edit(edit) => {
                let text_stamp = match self.bots.get(id).and_then(|bot| bot.registers.get(&key)) {
                    Some(Register { stamp, value: RegisterValue::Text(_) }) => Some(Ok(stamp.clone())),
                    Some(Register { value: RegisterValue::Plain(value), .. }) if !value.is_null() => Some(Err(())),
                    _ => None,
                };
                match text_stamp {
                    Some(Ok(stamp)) => self.edit_register(id, &key, &stamp, edit, batch),
                    Some(Err(())) => {
                        batch.errors.push(PartitionError::NotText { bot_id: id.to_string(), tag: key.1 });
                    }
                    None => {
                        self.set_local(id, key.clone(), TagValue::String(String::new()), batch);
                        let stamp = self.bots.get(id).and_then(|bot| bot.registers.get(&key)).map(|register| register.stamp.clone());
                        if let Some(stamp) = stamp {
                            self.edit_register(id, &key, &stamp, edit, batch);
                        }
                    }
                }
            }
        }
    }

    fn apply_local(&mut self, event: &BotEvent, echo: &mut Vec<BotEvent>, batch: &mut Batch) {
        match event {
            BotEvent::Add { bot } => {
                if self.current(&bot.id).is_none() {
                    let stamp = self.tick();
                    self.local(DocUpdate::CreateBot { id: bot.id.clone(), stamp }, batch);
                }
                for (name, value) in &bot.tags {
                    self.set_local(&bot.id, (None, name.clone()), value.clone(), batch);
                }
                for (space, tags) in &bot.masks {
                    for (name, value) in tags {
                        self.set_local(&bot.id, (Some(space.clone()), name.clone()), value.clone(), batch);
                    }
                }
            }
            BotEvent::Update { id, tags, masks } => {
                if self.current(id).is_none() {
                    batch.errors.push(PartitionError::UnknownBot(id.clone()));
                    return;
                }
                for (name, update) in tags {
                    self.update_local(id, (None, name.clone()), update, batch);
                }
                for (space, updates) in masks {
                    for (name, update) in updates {
                        self.update_local(id, (Some(space.clone()), name.clone()), update, batch);
                    }
                }
            }
            BotEvent::Remove { id } => {
                if self.current(id).is_none() {
                    batch.errors.push(PartitionError::UnknownBot(id.clone()));
                    return;
                }
                let stamp = self.tick();
                self.local(DocUpdate::RemoveBot { id: id.clone(), stamp }, batch);
            }
            BotEvent::ApplyState { state } => {
                let current = PartitionState::from_bots(state.keys().filter_map(|id| self.current(id)));
                for expanded in expand_bulk_state(&current, state) {
                    self.apply_local(&expanded, echo, batch);
                }
            }
            BotEvent::Passthrough { .. } => echo.push(event.clone()),
        }
    }

    /// Publish the visible changes of a batch.
    fn finish(&mut self, prior: &PartitionState, batch: Batch) {
        for err in &batch.errors {
            self.core.error(err);
        }
        self.outbox.extend(batch.outgoing);
        if batch.touched.is_empty() {
            return;
        }
        let mut next = prior.clone();
        let mut diff = StateDiff::default();
        for id in &batch.touched {
            let after = self.current(id);
            diff.push(id, prior.get(id), after.as_ref());
            match after {
                Some(bot) => next.insert(bot),
                None => {
                    next.remove(id);
                }
            }
        }
        self.core.commit(next, diff);
    }
}

impl Partition for TextPartition {
    fn kind(&self) -> &'static str {
        return "text";
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
        let prior = self.core.state();
        let mut batch = Batch::default();
        let mut echo = Vec::new();
        for event in events {
            self.apply_local(event, &mut echo, &mut batch);
        }
        self.finish(&prior, batch);
        return Ok(echo);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        self.core.ready();
        return Ok(());
    }
}
