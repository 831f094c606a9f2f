// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A partition backed by a plain map. No history, no replication.

use std::sync::Arc;

use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::diff_states;
use crate::bot::expand_bulk_state;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::stream::Observer;
use super::stream::SubscriptionId;

#[derive(Debug)]
pub struct MemoryPartition {
    core: PartitionCore,
}

impl MemoryPartition {
    pub fn new(space: Option<String>) -> MemoryPartition {
        return MemoryPartition { core: PartitionCore::new(space) };
    }

    /// Start from an initial snapshot. Bots are stamped with the space.
    pub fn with_state(space: Option<String>, initial: PartitionState) -> MemoryPartition {
        let mut partition = MemoryPartition::new(space.clone());
        let bots = initial.iter().cloned().map(|mut bot| {
            bot.space = space.clone();
            bot
        });
        partition.core.set_state(PartitionState::from_bots(bots));
        return partition;
    }

    fn apply_one(&self, next: &mut PartitionState, event: &BotEvent, echo: &mut Vec<BotEvent>) {
        match event {
            BotEvent::Add { bot } => {
                let mut bot = bot.clone();
                bot.space = self.core.space().map(str::to_string);
                bot.tags.retain(|_, value| !value.is_null());
                for tags in bot.masks.values_mut() {
                    tags.retain(|_, value| !value.is_null());
                }
                bot.masks.retain(|_, tags| !tags.is_empty());
                next.insert(bot);
            }
            BotEvent::Update { id, tags, masks } => match next.get_mut(id) {
                Some(bot) => bot.apply_updates(tags, masks),
                None => self.core.error(&PartitionError::UnknownBot(id.clone())),
            },
            BotEvent::Remove { id } => {
                if next.remove(id).is_none() {
                    self.core.error(&PartitionError::UnknownBot(id.clone()));
                }
            }
            BotEvent::ApplyState { state } => {
                for expanded in expand_bulk_state(next, state) {
                    self.apply_one(next, &expanded, echo);
                }
            }
            BotEvent::Passthrough { .. } => echo.push(event.clone()),
        }
    }
}

impl Partition for MemoryPartition {
    fn kind(&self) -> &'static str {
        return "memory";
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
        let mut next = (*prior).clone();
        let mut echo = Vec::new();
        for event in events {
            self.apply_one(&mut next, event, &mut echo);
        }
        let diff = diff_states(&prior, &next);
        self.core.commit(next, diff);
        return Ok(echo);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        self.core.ready();
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::bot::Bot;
    use crate::bot::PartialBot;
    use crate::bot::TagValue;
    use crate::partition::StatusUpdate;
    use crate::partition::stream::EventRecorder;

    fn connected() -> (MemoryPartition, EventRecorder) {
        let mut partition = MemoryPartition::new(Some("shared".to_string()));
        let recorder = EventRecorder::new();
        partition.subscribe(recorder.observer(), false);
        partition.connect().unwrap();
        return (partition, recorder);
    }

    #[test]
    fn connect_reports_four_stages() {
        let (partition, recorder) = connected();
        assert_eq!(recorder.statuses(), StatusUpdate::ready().to_vec());
        assert!(partition.is_synced());
    }

    #[test]
    fn add_update_remove() {
        let (mut partition, recorder) = connected();
        partition.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red"))]).unwrap();
        partition.apply_events(&[BotEvent::set_tag("b1", "color", "blue")]).unwrap();
        partition.apply_events(&[BotEvent::remove("b1")]).unwrap();

        assert_eq!(recorder.added(), vec!["b1".to_string()]);
        assert_eq!(recorder.updated()[0].tags, vec!["color".to_string()]);
        assert_eq!(recorder.removed(), vec![vec!["b1".to_string()]]);
        assert!(partition.state().is_empty());
    }

    #[test]
    fn bots_carry_the_space() {
        let (mut partition, _) = connected();
        partition.apply_events(&[BotEvent::add(Bot::new("b1"))]).unwrap();
        assert_eq!(partition.state().get("b1").and_then(|bot| bot.space.as_deref()), Some("shared"));
    }

    #[test]
    fn bulk_state_on_empty_partition() {
        let (mut partition, recorder) = connected();
        let mut state = BTreeMap::new();
        state.insert("a".to_string(), Some(PartialBot { tags: [("x".to_string(), TagValue::from(1))].into(), ..PartialBot::default() }));
        state.insert("b".to_string(), Some(PartialBot { tags: [("y".to_string(), TagValue::from(2))].into(), ..PartialBot::default() }));
        partition.apply_events(&[BotEvent::ApplyState { state }]).unwrap();

        assert_eq!(recorder.added(), vec!["a".to_string(), "b".to_string()]);
        let snapshot = partition.state();
        assert_eq!(snapshot.get("a").and_then(|bot| bot.tag("x")), Some(&TagValue::from(1)));
        assert_eq!(snapshot.get("b").and_then(|bot| bot.tag("y")), Some(&TagValue::from(2)));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn update_of_unknown_bot_is_an_error_event() {
        let (mut partition, recorder) = connected();
        partition.apply_events(&[BotEvent::set_tag("ghost", "x", 1)]).unwrap();
        assert_eq!(recorder.errors()[0].bot_id.as_deref(), Some("ghost"));
        assert!(partition.state().is_empty());
    }

    #[test]
    fn remove_of_unknown_bot_is_an_error_event() {
        let (mut partition, recorder) = connected();
        partition.apply_events(&[BotEvent::remove("ghost")]).unwrap();
        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].bot_id.as_deref(), Some("ghost"));
    }

    #[test]
    fn null_tags_and_masks_are_dropped_on_add() {
        let (mut partition, _) = connected();
        let bot = Bot::new("b1")
            .with_tag("gone", TagValue::Null)
            .with_mask("tempLocal", "hidden", TagValue::Null)
            .with_mask("tempLocal", "shown", 1);
        partition.apply_events(&[BotEvent::add(bot)]).unwrap();

        let snapshot = partition.state();
        let stored = snapshot.get("b1").unwrap();
        assert!(stored.tags.is_empty());
        assert_eq!(stored.tag_in_space("tempLocal", "shown"), Some(&TagValue::from(1)));
        assert_eq!(stored.tag_in_space("tempLocal", "hidden"), None);

        let bare = Bot::new("b2").with_mask("tempLocal", "hidden", TagValue::Null);
        partition.apply_events(&[BotEvent::add(bare)]).unwrap();
        assert!(partition.state().get("b2").unwrap().masks.is_empty());
    }

    #[test]
    fn passthrough_is_echoed() {
        let (mut partition, _) = connected();
        let event = BotEvent::Passthrough { name: "ping".to_string(), payload: serde_json::json!({ "n": 1 }) };
        let echo = partition.apply_events(&[event.clone(), BotEvent::add(Bot::new("b1"))]).unwrap();
        assert_eq!(echo, vec![event]);
    }

    #[test]
    fn snapshots_are_replaced_not_mutated() {
        let (mut partition, _) = connected();
        let before = partition.state();
        partition.apply_events(&[BotEvent::add(Bot::new("b1"))]).unwrap();
        assert!(before.is_empty());
        assert_eq!(partition.state().len(), 1);
    }

    #[test]
    fn initial_state_is_visible_on_catch_up() {
        let mut partition = MemoryPartition::with_state(None, PartitionState::from_bots([Bot::new("seed")]));
        let recorder = EventRecorder::new();
        partition.subscribe(recorder.observer(), true);
        assert_eq!(recorder.added(), vec!["seed".to_string()]);
    }
}
