// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Bots, tag values, partition snapshots, and the inbound event vocabulary.
//!
//! The engine never interprets a bot. It knows the bot id, the tag names,
//! and opaque tag values. Everything here is plain data that serializes to
//! the JSON shapes collaborators exchange.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::crdt::op::TagEdit;

/// A tag value.
///
/// Serialized untagged, so `{"color": "red", "size": 2}` is a valid tag map.
///
/// Equality treats every NaN as equal to every other NaN, so replicas
/// holding the same NaN tag compare equal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<TagValue>),
    Object(BTreeMap<String, TagValue>),
}

impl PartialEq for TagValue {
    fn eq(&self, other: &TagValue) -> bool {
        match (self, other) {
            (TagValue::Null, TagValue::Null) => return true,
            (TagValue::Bool(a), TagValue::Bool(b)) => return a == b,
            (TagValue::Number(a), TagValue::Number(b)) => return a == b || (a.is_nan() && b.is_nan()),
            (TagValue::String(a), TagValue::String(b)) => return a == b,
            (TagValue::Array(a), TagValue::Array(b)) => return a == b,
            (TagValue::Object(a), TagValue::Object(b)) => return a == b,
            _ => return false,
        }
    }
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => return Some(s),
            _ => return None,
        }
    }

    pub fn is_null(&self) -> bool {
        return matches!(self, TagValue::Null);
    }

    /// Render the value as the text a string edit would operate on.
    pub fn to_text(&self) -> String {
        match self {
            TagValue::Null => return String::new(),
            TagValue::String(s) => return s.clone(),
            TagValue::Bool(b) => return b.to_string(),
            TagValue::Number(n) => return n.to_string(),
            other => return serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> TagValue {
        return TagValue::String(value.to_string());
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> TagValue {
        return TagValue::String(value);
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> TagValue {
        return TagValue::Number(value);
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> TagValue {
        return TagValue::Number(value as f64);
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> TagValue {
        return TagValue::Bool(value);
    }
}

/// Tag map of a bot.
pub type Tags = BTreeMap<String, TagValue>;

/// Space-scoped tag overrides: space name to tag map.
pub type Masks = BTreeMap<String, Tags>;

/// A record in a partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub masks: Masks,
    /// The partition space the bot lives in, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
}

impl Bot {
    pub fn new(id: impl Into<String>) -> Bot {
        return Bot {
            id: id.into(),
            ..Bot::default()
        };
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<TagValue>) -> Bot {
        self.tags.insert(name.into(), value.into());
        return self;
    }

    pub fn with_mask(mut self, space: impl Into<String>, name: impl Into<String>, value: impl Into<TagValue>) -> Bot {
        self.masks.entry(space.into()).or_default().insert(name.into(), value.into());
        return self;
    }

    pub fn in_space(mut self, space: impl Into<String>) -> Bot {
        self.space = Some(space.into());
        return self;
    }

    pub fn tag(&self, name: &str) -> Option<&TagValue> {
        return self.tags.get(name);
    }

    /// The value of a tag as seen from `space`: the mask if present,
    /// otherwise the base tag.
    pub fn tag_in_space(&self, space: &str, name: &str) -> Option<&TagValue> {
        if let Some(value) = self.masks.get(space).and_then(|tags| tags.get(name)) {
            return Some(value);
        }
        return self.tags.get(name);
    }

    /// Apply tag and mask updates against the current plain values.
    pub fn apply_updates(&mut self, tags: &BTreeMap<String, TagUpdate>, masks: &BTreeMap<String, BTreeMap<String, TagUpdate>>) {
        for (name, update) in tags {
            match update.apply_to(self.tags.get(name)) {
                Some(value) => self.tags.insert(name.clone(), value),
                None => self.tags.remove(name),
            };
        }
        for (space, updates) in masks {
            let mask = self.masks.entry(space.clone()).or_default();
            for (name, update) in updates {
                match update.apply_to(mask.get(name)) {
                    Some(value) => mask.insert(name.clone(), value),
                    None => mask.remove(name),
                };
            }
            if mask.is_empty() {
                self.masks.remove(space);
            }
        }
    }

    /// Names of tags whose value differs between two versions of a bot.
    /// Mask changes are reported by tag name too.
    pub fn changed_tags(&self, other: &Bot) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in &self.tags {
            if other.tags.get(name) != Some(value) {
                changed.push(name.clone());
            }
        }
        for name in other.tags.keys() {
            if !self.tags.contains_key(name) {
                changed.push(name.clone());
            }
        }
        let empty = Tags::new();
        let spaces: std::collections::BTreeSet<&String> = self.masks.keys().chain(other.masks.keys()).collect();
        for space in spaces {
            let mine = self.masks.get(space).unwrap_or(&empty);
            let theirs = other.masks.get(space).unwrap_or(&empty);
            for (name, value) in mine {
                if theirs.get(name) != Some(value) {
                    changed.push(name.clone());
                }
            }
            for name in theirs.keys() {
                if !mine.contains_key(name) {
                    changed.push(name.clone());
                }
            }
        }
        changed.sort();
        changed.dedup();
        return changed;
    }
}

/// A read-only snapshot of the bots in a partition.
///
/// Snapshots are replaced, never mutated, once published.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionState {
    bots: BTreeMap<String, Bot>,
}

impl PartitionState {
    pub fn new() -> PartitionState {
        return PartitionState::default();
    }

    pub fn from_bots(bots: impl IntoIterator<Item = Bot>) -> PartitionState {
        return PartitionState {
            bots: bots.into_iter().map(|bot| (bot.id.clone(), bot)).collect(),
        };
    }

    pub fn get(&self, id: &str) -> Option<&Bot> {
        return self.bots.get(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        return self.bots.contains_key(id);
    }

    pub fn len(&self) -> usize {
        return self.bots.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.bots.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bot> {
        return self.bots.values();
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        return self.bots.keys();
    }

    pub(crate) fn insert(&mut self, bot: Bot) {
        self.bots.insert(bot.id.clone(), bot);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Bot> {
        return self.bots.remove(id);
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Bot> {
        return self.bots.get_mut(id);
    }
}

/// A bot whose tags changed, with the names of the changed tags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatedBot {
    pub bot: Bot,
    pub tags: Vec<String>,
}

/// The visible difference between two snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDiff {
    pub added: Vec<Bot>,
    pub removed: Vec<String>,
    pub updated: Vec<UpdatedBot>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        return self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty();
    }

    /// Record how one bot moved between `before` and `after`.
    pub fn push(&mut self, id: &str, before: Option<&Bot>, after: Option<&Bot>) {
        match (before, after) {
            (None, Some(bot)) => self.added.push(bot.clone()),
            (Some(_), None) => self.removed.push(id.to_string()),
            (Some(old), Some(new)) => {
                let tags = old.changed_tags(new);
                if !tags.is_empty() {
                    self.updated.push(UpdatedBot { bot: new.clone(), tags });
                }
            }
            (None, None) => {}
        }
    }
}

/// Compare two snapshots bot by bot.
pub fn diff_states(prior: &PartitionState, next: &PartitionState) -> StateDiff {
    let mut diff = StateDiff::default();
    for id in prior.ids() {
        if !next.contains(id) {
            diff.push(id, prior.get(id), None);
        }
    }
    for bot in next.iter() {
        diff.push(&bot.id, prior.get(&bot.id), Some(bot));
    }
    return diff;
}

/// How a single tag should change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagUpdate {
    Set(TagValue),
    Clear,
    Edit(TagEdit),
}

impl TagUpdate {
    /// Resolve against a plain (non-CRDT) current value.
    /// `None` means the tag ends up cleared.
    pub fn apply_to(&self, current: Option<&TagValue>) -> Option<TagValue> {
        match self {
            TagUpdate::Set(value) if value.is_null() => return None,
            TagUpdate::Set(value) => return Some(value.clone()),
            TagUpdate::Clear => return None,
            TagUpdate::Edit(edit) => {
                let text = current.map(|v| v.to_text()).unwrap_or_default();
                return Some(TagValue::String(edit.apply_to_str(&text)));
            }
        }
    }
}

/// A bot entry in a bulk state: `None` removes the bot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialBot {
    #[serde(default)]
    pub tags: BTreeMap<String, TagValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub masks: BTreeMap<String, BTreeMap<String, TagValue>>,
}

/// An intent sent to a partition by an external collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    Add {
        bot: Bot,
    },
    Update {
        id: String,
        #[serde(default)]
        tags: BTreeMap<String, TagUpdate>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        masks: BTreeMap<String, BTreeMap<String, TagUpdate>>,
    },
    Remove {
        id: String,
    },
    ApplyState {
        state: BTreeMap<String, Option<PartialBot>>,
    },
    /// An event the partition does not store; it is echoed back so other
    /// local listeners see it.
    Passthrough {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl BotEvent {
    pub fn add(bot: Bot) -> BotEvent {
        return BotEvent::Add { bot };
    }

    pub fn remove(id: impl Into<String>) -> BotEvent {
        return BotEvent::Remove { id: id.into() };
    }

    pub fn set_tag(id: impl Into<String>, name: impl Into<String>, value: impl Into<TagValue>) -> BotEvent {
        let mut tags = BTreeMap::new();
        tags.insert(name.into(), TagUpdate::Set(value.into()));
        return BotEvent::Update {
            id: id.into(),
            tags,
            masks: BTreeMap::new(),
        };
    }

    pub fn clear_tag(id: impl Into<String>, name: impl Into<String>) -> BotEvent {
        let mut tags = BTreeMap::new();
        tags.insert(name.into(), TagUpdate::Clear);
        return BotEvent::Update {
            id: id.into(),
            tags,
            masks: BTreeMap::new(),
        };
    }

    pub fn edit_tag(id: impl Into<String>, name: impl Into<String>, edit: TagEdit) -> BotEvent {
        let mut tags = BTreeMap::new();
        tags.insert(name.into(), TagUpdate::Edit(edit));
        return BotEvent::Update {
            id: id.into(),
            tags,
            masks: BTreeMap::new(),
        };
    }

    pub fn set_mask(id: impl Into<String>, space: impl Into<String>, name: impl Into<String>, value: impl Into<TagValue>) -> BotEvent {
        let mut tags = BTreeMap::new();
        tags.insert(name.into(), TagUpdate::Set(value.into()));
        let mut masks = BTreeMap::new();
        masks.insert(space.into(), tags);
        return BotEvent::Update {
            id: id.into(),
            tags: BTreeMap::new(),
            masks,
        };
    }

    /// The bot this event targets, if it targets exactly one.
    pub fn bot_id(&self) -> Option<&str> {
        match self {
            BotEvent::Add { bot } => return Some(&bot.id),
            BotEvent::Update { id, .. } => return Some(id),
            BotEvent::Remove { id } => return Some(id),
            BotEvent::ApplyState { .. } | BotEvent::Passthrough { .. } => return None,
        }
    }
}

/// Expand a bulk state into individual add, update, and remove events
/// relative to what `current` already holds.
///
/// - `None` entries remove the bot if it exists
/// - unknown bots are added with their non-null tags
/// - known bots are updated, and null tags clear the tag
pub fn expand_bulk_state(current: &PartitionState, state: &BTreeMap<String, Option<PartialBot>>) -> Vec<BotEvent> {
    let mut events = Vec::new();
    for (id, entry) in state {
        match entry {
            None => {
                if current.contains(id) {
                    events.push(BotEvent::remove(id.clone()));
                }
            }
            Some(partial) if !current.contains(id) => {
                let mut bot = Bot::new(id.clone());
                for (name, value) in &partial.tags {
                    if !value.is_null() {
                        bot.tags.insert(name.clone(), value.clone());
                    }
                }
                for (space, tags) in &partial.masks {
                    for (name, value) in tags {
                        if !value.is_null() {
                            bot.masks.entry(space.clone()).or_default().insert(name.clone(), value.clone());
                        }
                    }
                }
                events.push(BotEvent::add(bot));
            }
            Some(partial) => {
                let tags = partial.tags
                    .iter()
                    .map(|(name, value)| (name.clone(), as_update(value)))
                    .collect();
                let masks = partial.masks
                    .iter()
                    .map(|(space, tags)| {
                        let updates = tags.iter().map(|(name, value)| (name.clone(), as_update(value))).collect();
                        (space.clone(), updates)
                    })
                    .collect();
                events.push(BotEvent::Update { id: id.clone(), tags, masks });
            }
        }
    }
    return events;
}

fn as_update(value: &TagValue) -> TagUpdate {
    if value.is_null() {
        return TagUpdate::Clear;
    }
    return TagUpdate::Set(value.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_tags_compare_equal() {
        assert_eq!(TagValue::from(f64::NAN), TagValue::from(f64::NAN));
        assert_ne!(TagValue::from(f64::NAN), TagValue::from(1.0));
        assert_eq!(TagValue::from(0.0), TagValue::from(-0.0));

        let a = Bot::new("b1").with_tag("n", f64::NAN);
        let b = Bot::new("b1").with_tag("n", f64::NAN);
        assert_eq!(a, b);
        assert!(a.changed_tags(&b).is_empty());
    }

    #[test]
    fn tag_values_deserialize_untagged() {
        let tags: Tags = serde_json::from_str(r#"{"a": "red", "b": 2, "c": true, "d": null, "e": [1], "f": {"x": 1}}"#).unwrap();
        assert_eq!(tags["a"], TagValue::from("red"));
        assert_eq!(tags["b"], TagValue::Number(2.0));
        assert_eq!(tags["c"], TagValue::Bool(true));
        assert!(tags["d"].is_null());
        assert_eq!(tags["e"], TagValue::Array(vec![TagValue::Number(1.0)]));
        assert!(matches!(tags["f"], TagValue::Object(_)));
    }

    #[test]
    fn mask_overrides_only_in_its_space() {
        let bot = Bot::new("b1").with_tag("color", "red").with_mask("tempLocal", "color", "blue");
        assert_eq!(bot.tag_in_space("tempLocal", "color"), Some(&TagValue::from("blue")));
        assert_eq!(bot.tag_in_space("shared", "color"), Some(&TagValue::from("red")));
        assert_eq!(bot.tag("color"), Some(&TagValue::from("red")));
    }

    #[test]
    fn changed_tags_covers_additions_removals_and_masks() {
        let before = Bot::new("b1").with_tag("a", 1).with_tag("b", 2);
        let after = Bot::new("b1").with_tag("a", 1).with_tag("c", 3).with_mask("s", "m", true);
        assert_eq!(after.changed_tags(&before), vec!["b", "c", "m"]);
    }

    #[test]
    fn bulk_state_adds_updates_and_removes() {
        let current = PartitionState::from_bots(vec![Bot::new("old").with_tag("x", 1), Bot::new("gone")]);
        let state: BTreeMap<String, Option<PartialBot>> = serde_json::from_str(
            r#"{"new": {"tags": {"y": 2, "z": null}}, "old": {"tags": {"x": null, "w": "hi"}}, "gone": null, "never": null}"#,
        ).unwrap();

        let events = expand_bulk_state(&current, &state);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], BotEvent::remove("gone"));
        assert_eq!(events[1], BotEvent::add(Bot::new("new").with_tag("y", 2)));
        match &events[2] {
            BotEvent::Update { id, tags, .. } => {
                assert_eq!(id, "old");
                assert_eq!(tags["x"], TagUpdate::Clear);
                assert_eq!(tags["w"], TagUpdate::Set(TagValue::from("hi")));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn events_use_tagged_wire_shape() {
        let json = serde_json::to_value(BotEvent::remove("b1")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "remove", "id": "b1" }));
    }

    #[test]
    fn diff_states_reports_each_kind_of_change() {
        let prior = PartitionState::from_bots([
            Bot::new("kept").with_tag("color", "red"),
            Bot::new("gone"),
            Bot::new("same").with_tag("x", 1),
        ]);
        let next = PartitionState::from_bots([
            Bot::new("kept").with_tag("color", "blue"),
            Bot::new("fresh"),
            Bot::new("same").with_tag("x", 1),
        ]);

        let diff = diff_states(&prior, &next);
        assert_eq!(diff.added, vec![Bot::new("fresh")]);
        assert_eq!(diff.removed, vec!["gone".to_string()]);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].bot.id, "kept");
        assert_eq!(diff.updated[0].tags, vec!["color".to_string()]);
    }
}
