// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Several partitions addressed by space.
//!
//! Events are routed to a member by the bot's space. Updates and removes go
//! to whichever member holds the bot. Anything that cannot be placed goes to
//! the default space. Member streams are merged into the set's stream, and
//! the set reports each stage once every member has reached it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::expand_bulk_state;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::StatusUpdate;
use super::remote::ClientEvent;
use super::stream::Observer;
use super::stream::Subject;
use super::stream::SubscriptionId;

#[derive(Debug, Default)]
struct SetStatus {
    members: BTreeMap<String, ConnectionStatus>,
    combined: ConnectionStatus,
}

impl SetStatus {
    /// Fold in a member update. Returns the stages whose combined value
    /// changed.
    fn apply(&mut self, space: &str, update: &StatusUpdate) -> Vec<StatusUpdate> {
        self.members.entry(space.to_string()).or_default().apply(update);
        let every = |stage: fn(&ConnectionStatus) -> bool| !self.members.is_empty() && self.members.values().all(stage);
        let next = [
            StatusUpdate::Connection { connected: every(|s| s.connected) },
            StatusUpdate::Authentication { authenticated: every(|s| s.authenticated) },
            StatusUpdate::Authorization { authorized: every(|s| s.authorized) },
            StatusUpdate::Sync { synced: every(|s| s.synced) },
        ];
        let mut changed = Vec::new();
        for stage in next {
            if changed_flag(&self.combined, &stage) {
                self.combined.apply(&stage);
                changed.push(stage);
            }
        }
        return changed;
    }
}

fn changed_flag(status: &ConnectionStatus, update: &StatusUpdate) -> bool {
    match update {
        StatusUpdate::Connection { connected } => return status.connected != *connected,
        StatusUpdate::Authentication { authenticated } => return status.authenticated != *authenticated,
        StatusUpdate::Authorization { authorized } => return status.authorized != *authorized,
        StatusUpdate::Sync { synced } => return status.synced != *synced,
    }
}

pub struct PartitionSet {
    core: PartitionCore,
    default_space: String,
    members: BTreeMap<String, Box<dyn Partition>>,
    status: Arc<Mutex<SetStatus>>,
}

impl std::fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("PartitionSet")
            .field("default_space", &self.default_space)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .finish();
    }
}

impl PartitionSet {
    pub fn new(default_space: impl Into<String>) -> PartitionSet {
        return PartitionSet {
            core: PartitionCore::new(None),
            default_space: default_space.into(),
            members: BTreeMap::new(),
            status: Arc::new(Mutex::new(SetStatus::default())),
        };
    }

    pub fn default_space(&self) -> &str {
        return &self.default_space;
    }

    /// Add a member and merge its stream into the set's.
    pub fn insert(&mut self, space: impl Into<String>, mut partition: Box<dyn Partition>) {
        let space = space.into();
        self.status.lock().members.insert(space.clone(), partition.status());
        partition.subscribe(forward(space.clone(), self.core.subject().clone(), Arc::clone(&self.status)), false);
        tracing::debug!(%space, kind = partition.kind(), "partition joined set");
        self.members.insert(space, partition);
    }

    pub fn with(mut self, space: impl Into<String>, partition: Box<dyn Partition>) -> PartitionSet {
        self.insert(space, partition);
        return self;
    }

    pub fn spaces(&self) -> impl Iterator<Item = &String> {
        return self.members.keys();
    }

    pub fn member(&self, space: &str) -> Option<&dyn Partition> {
        return self.members.get(space).map(|partition| &**partition);
    }

    pub fn member_mut(&mut self, space: &str) -> Option<&mut Box<dyn Partition>> {
        return self.members.get_mut(space);
    }

    /// The space an event belongs in.
    fn route(&self, event: &BotEvent) -> String {
        match event {
            BotEvent::Add { bot } => {
                if let Some(space) = bot.space.as_deref().filter(|space| self.members.contains_key(*space)) {
                    return space.to_string();
                }
            }
            BotEvent::Update { id, .. } | BotEvent::Remove { id } => {
                let holder = self.members
                    .iter()
                    .find(|(_, partition)| partition.state().contains(id))
                    .map(|(space, _)| space.clone());
                if let Some(space) = holder {
                    return space;
                }
            }
            BotEvent::ApplyState { .. } | BotEvent::Passthrough { .. } => {}
        }
        return self.default_space.clone();
    }

    fn group(&self, event: &BotEvent, groups: &mut BTreeMap<String, Vec<BotEvent>>, echo: &mut Vec<BotEvent>) {
        match event {
            BotEvent::Passthrough { .. } => echo.push(event.clone()),
            BotEvent::ApplyState { state } => {
                let merged = self.state();
                for expanded in expand_bulk_state(&merged, state) {
                    self.group(&expanded, groups, echo);
                }
            }
            _ => groups.entry(self.route(event)).or_default().push(event.clone()),
        }
    }
}

/// An observer that relays member events into the set's subject.
fn forward(space: String, subject: Subject<PartitionEvent>, status: Arc<Mutex<SetStatus>>) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| match event {
        PartitionEvent::Status(update) => {
            let changed = status.lock().apply(&space, update);
            for stage in changed {
                subject.publish(&PartitionEvent::Status(stage));
            }
        }
        other => subject.publish(other),
    });
}

impl Partition for PartitionSet {
    fn kind(&self) -> &'static str {
        return "composite";
    }

    fn space(&self) -> Option<&str> {
        return None;
    }

    /// The union of every member's bots.
    fn state(&self) -> Arc<PartitionState> {
        let bots = self.members.values().flat_map(|partition| {
            let state = partition.state();
            state.iter().cloned().collect::<Vec<_>>()
        });
        return Arc::new(PartitionState::from_bots(bots));
    }

    fn status(&self) -> ConnectionStatus {
        return self.status.lock().combined;
    }

    fn subscribe(&mut self, mut observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId {
        if catch_up {
            let bots = self.state().iter().cloned().collect();
            observer(&PartitionEvent::BotsAdded(bots));
        }
        return self.core.subscribe(observer, false);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return self.core.unsubscribe(id);
    }

    fn is_read_only(&self) -> bool {
        return self.members.values().all(|partition| partition.is_read_only());
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        let mut groups = BTreeMap::new();
        let mut echo = Vec::new();
        for event in events {
            self.group(event, &mut groups, &mut echo);
        }
        for (space, events) in groups {
            let Some(partition) = self.members.get_mut(&space) else {
                self.core.error(&PartitionError::UnknownSpace(space));
                continue;
            };
            match partition.apply_events(&events) {
                Ok(more) => echo.extend(more),
                Err(err) => self.core.error(&err),
            }
        }
        return Ok(echo);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        tracing::info!(members = self.members.len(), "connecting partition set");
        for partition in self.members.values_mut() {
            partition.connect()?;
        }
        return Ok(());
    }

    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        for partition in self.members.values_mut() {
            partition.handle_client_event(event)?;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Bot;
    use crate::bot::TagValue;
    use crate::crdt::primitives::SiteId;
    use crate::crdt::tree::CausalTree;
    use crate::partition::causal_tree::CausalTreePartition;
    use crate::partition::memory::MemoryPartition;
    use crate::partition::remote::RecordingClient;
    use crate::partition::remote::RemoteCausalTreePartition;
    use crate::partition::stream::EventRecorder;

    fn local_set() -> (PartitionSet, EventRecorder) {
        let mut set = PartitionSet::new("shared")
            .with("shared", Box::new(CausalTreePartition::new(SiteId::from("a"), Some("shared".to_string()))))
            .with("tempLocal", Box::new(MemoryPartition::new(Some("tempLocal".to_string()))));
        let recorder = EventRecorder::new();
        set.subscribe(recorder.observer(), false);
        set.connect().unwrap();
        return (set, recorder);
    }

    fn space_of(set: &PartitionSet, id: &str) -> Option<String> {
        return set.state().get(id).and_then(|bot| bot.space.clone());
    }

    #[test]
    fn routes_by_space_and_defaults() {
        let (mut set, recorder) = local_set();
        set.apply_events(&[
            BotEvent::add(Bot::new("a").in_space("tempLocal")),
            BotEvent::add(Bot::new("b")),
            BotEvent::add(Bot::new("c").in_space("nowhere")),
        ])
        .unwrap();

        assert_eq!(space_of(&set, "a").as_deref(), Some("tempLocal"));
        assert_eq!(space_of(&set, "b").as_deref(), Some("shared"));
        assert_eq!(space_of(&set, "c").as_deref(), Some("shared"));
        assert_eq!(recorder.added().len(), 3);
    }

    #[test]
    fn updates_follow_the_bot() {
        let (mut set, recorder) = local_set();
        set.apply_events(&[BotEvent::add(Bot::new("a").in_space("tempLocal"))]).unwrap();
        set.apply_events(&[BotEvent::set_tag("a", "color", "red")]).unwrap();
        set.apply_events(&[BotEvent::remove("a")]).unwrap();

        assert_eq!(recorder.updated().len(), 1);
        assert_eq!(recorder.removed(), vec![vec!["a".to_string()]]);
        assert!(recorder.errors().is_empty());
        assert!(set.state().is_empty());
    }

    #[test]
    fn ready_once_every_member_is() {
        let (set, recorder) = local_set();
        assert!(set.is_synced());
        assert_eq!(recorder.statuses(), StatusUpdate::ready().to_vec());
    }

    #[test]
    fn sync_waits_for_the_slowest_member() {
        let client = RecordingClient::new();
        let remote = RemoteCausalTreePartition::new(SiteId::from("a"), "main", Box::new(client)).in_space("shared");
        let mut set = PartitionSet::new("shared")
            .with("shared", Box::new(remote))
            .with("tempLocal", Box::new(MemoryPartition::new(Some("tempLocal".to_string()))));
        let recorder = EventRecorder::new();
        set.subscribe(recorder.observer(), false);
        set.connect().unwrap();
        for status in StatusUpdate::ready().into_iter().take(3) {
            set.handle_client_event(&ClientEvent::Status { status }).unwrap();
        }
        assert!(!set.is_synced());
        assert_eq!(recorder.statuses().len(), 3);

        let mut tree = CausalTree::new(SiteId::from("server"));
        tree.create_record("x").unwrap();
        set.handle_client_event(&ClientEvent::Atoms { branch: "main".to_string(), atoms: tree.weave().atoms() }).unwrap();
        assert!(set.is_synced());
        assert_eq!(recorder.statuses().last(), Some(&StatusUpdate::Sync { synced: true }));
        assert_eq!(space_of(&set, "x").as_deref(), Some("shared"));
    }

    #[test]
    fn bulk_state_is_expanded_against_the_union() {
        let (mut set, _) = local_set();
        set.apply_events(&[BotEvent::add(Bot::new("a").in_space("tempLocal").with_tag("n", 1))]).unwrap();

        let mut state = BTreeMap::new();
        state.insert("a".to_string(), Some(crate::bot::PartialBot {
            tags: [("n".to_string(), TagValue::from(2))].into(),
            ..Default::default()
        }));
        state.insert("b".to_string(), Some(crate::bot::PartialBot::default()));
        set.apply_events(&[BotEvent::ApplyState { state }]).unwrap();

        let merged = set.state();
        assert_eq!(merged.get("a").and_then(|bot| bot.tag("n")), Some(&TagValue::from(2)));
        assert_eq!(merged.get("a").and_then(|bot| bot.space.as_deref()), Some("tempLocal"));
        assert_eq!(merged.get("b").and_then(|bot| bot.space.as_deref()), Some("shared"));
    }

    #[test]
    fn missing_default_member_is_an_error() {
        let mut set = PartitionSet::new("shared").with("tempLocal", Box::new(MemoryPartition::new(None)));
        let recorder = EventRecorder::new();
        set.subscribe(recorder.observer(), false);
        set.apply_events(&[BotEvent::add(Bot::new("a"))]).unwrap();
        assert_eq!(recorder.errors().len(), 1);
    }

    #[test]
    fn catch_up_covers_every_member() {
        let (mut set, _) = local_set();
        set.apply_events(&[BotEvent::add(Bot::new("a").in_space("tempLocal")), BotEvent::add(Bot::new("b"))]).unwrap();
        let late = EventRecorder::new();
        set.subscribe(late.observer(), true);
        assert_eq!(late.added(), vec!["a".to_string(), "b".to_string()]);
    }
}
