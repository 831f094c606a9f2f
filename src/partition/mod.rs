// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! The partition contract and its backends.
//!
//! A partition holds a set of bots behind a uniform surface:
//!
//! - `state()`: the current snapshot, replaced whenever it changes
//! - `subscribe()`: change streams, with optional catch-up for late joiners
//! - `apply_events()`: turn add, update, and remove intents into writes
//! - `connect()`: the four-stage status sequence
//!   `connection -> authentication -> authorization -> sync`
//!
//! Backends:
//!
//! - `memory`: a plain map, no history
//! - `causal_tree`: a local weave
//! - `remote`: a weave mirrored from a branch on a causal repo
//! - `other_players`: read-only shadow of other devices' branches
//! - `text`: registers with collaborative string values
//! - `query`: immutable, loaded once
//! - `composite`: several partitions addressed by space

pub mod causal_tree;
pub mod composite;
pub mod memory;
pub mod other_players;
pub mod query;
pub mod remote;
pub mod stream;
pub mod text;

use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::bot::Bot;
use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::StateDiff;
use crate::bot::UpdatedBot;
use crate::crdt::text::TextError;
use crate::crdt::weave::WeaveError;
use remote::ClientEvent;
use stream::Observer;
use stream::Subject;
use stream::SubscriptionId;

/// One stage of the connection lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    Connection { connected: bool },
    Authentication { authenticated: bool },
    Authorization { authorized: bool },
    Sync { synced: bool },
}

impl StatusUpdate {
    /// The full sequence for a partition that is immediately usable.
    pub fn ready() -> [StatusUpdate; 4] {
        return [
            StatusUpdate::Connection { connected: true },
            StatusUpdate::Authentication { authenticated: true },
            StatusUpdate::Authorization { authorized: true },
            StatusUpdate::Sync { synced: true },
        ];
    }
}

/// Accumulated connection status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub authorized: bool,
    pub synced: bool,
    /// Whether `synced` has ever been true.
    pub has_synced: bool,
}

impl ConnectionStatus {
    pub fn apply(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Connection { connected } => self.connected = *connected,
            StatusUpdate::Authentication { authenticated } => self.authenticated = *authenticated,
            StatusUpdate::Authorization { authorized } => self.authorized = *authorized,
            StatusUpdate::Sync { synced } => {
                self.synced = *synced;
                self.has_synced |= *synced;
            }
        }
    }
}

/// Payload of the error stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

impl PartitionErrorEvent {
    pub fn new(message: impl Into<String>) -> PartitionErrorEvent {
        return PartitionErrorEvent {
            message: message.into(),
            bot_id: None,
        };
    }

    pub fn for_bot(message: impl Into<String>, bot_id: impl Into<String>) -> PartitionErrorEvent {
        return PartitionErrorEvent {
            message: message.into(),
            bot_id: Some(bot_id.into()),
        };
    }
}

/// What a partition publishes.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionEvent {
    BotsAdded(Vec<Bot>),
    BotsRemoved(Vec<String>),
    BotsUpdated(Vec<UpdatedBot>),
    Status(StatusUpdate),
    Error(PartitionErrorEvent),
}

impl PartitionEvent {
    /// Split a diff into stream events, skipping empty kinds.
    ///
    /// Events are grouped by kind rather than interleaved: at most one
    /// bots-added event, then one bots-updated, then one bots-removed. Each
    /// group keeps the order in which the diff recorded its bots. A bot
    /// appears in at most one group per diff.
    pub fn from_diff(diff: StateDiff) -> Vec<PartitionEvent> {
        let mut events = Vec::new();
        if !diff.added.is_empty() {
            events.push(PartitionEvent::BotsAdded(diff.added));
        }
        if !diff.updated.is_empty() {
            events.push(PartitionEvent::BotsUpdated(diff.updated));
        }
        if !diff.removed.is_empty() {
            events.push(PartitionEvent::BotsRemoved(diff.removed));
        }
        return events;
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition is read-only")]
    ReadOnly,
    #[error("bot {0} does not exist")]
    UnknownBot(String),
    #[error("tag {tag} on bot {bot_id} is not a text value")]
    NotText { bot_id: String, tag: String },
    #[error("no partition for space {0}")]
    UnknownSpace(String),
    #[error(transparent)]
    Weave(#[from] WeaveError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Client(#[from] remote::ClientError),
}

impl PartitionError {
    /// The bot an error is about, when there is one.
    pub fn bot_id(&self) -> Option<&str> {
        match self {
            PartitionError::UnknownBot(id) => return Some(id),
            PartitionError::NotText { bot_id, .. } => return Some(bot_id),
            _ => return None,
        }
    }

    pub fn to_event(&self) -> PartitionErrorEvent {
        return PartitionErrorEvent {
            message: self.to_string(),
            bot_id: self.bot_id().map(str::to_string),
        };
    }
}

/// The uniform surface every backend exposes.
pub trait Partition: Send {
    /// Short name of the backend, matching its config `type`.
    fn kind(&self) -> &'static str;

    fn space(&self) -> Option<&str>;

    fn state(&self) -> Arc<PartitionState>;

    fn status(&self) -> ConnectionStatus;

    /// Register an observer. With `catch_up`, it first receives one
    /// bots-added event holding every visible bot.
    fn subscribe(&mut self, observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId;

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;

    /// Apply bot events. Returns the events to echo to other local listeners.
    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError>;

    fn connect(&mut self) -> Result<(), PartitionError>;

    fn is_synced(&self) -> bool {
        return self.status().synced;
    }

    fn is_read_only(&self) -> bool {
        return false;
    }

    /// Feed an event from a causal repo client. Backends without a client
    /// ignore it.
    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        let _ = event;
        return Ok(());
    }
}

/// State and streams shared by every backend.
#[derive(Debug)]
pub struct PartitionCore {
    state: Arc<PartitionState>,
    status: ConnectionStatus,
    subject: Subject<PartitionEvent>,
    space: Option<String>,
}

impl PartitionCore {
    pub fn new(space: Option<String>) -> PartitionCore {
        return PartitionCore {
            state: Arc::new(PartitionState::new()),
            status: ConnectionStatus::default(),
            subject: Subject::new(),
            space,
        };
    }

    pub fn space(&self) -> Option<&str> {
        return self.space.as_deref();
    }

    pub fn state(&self) -> Arc<PartitionState> {
        return Arc::clone(&self.state);
    }

    pub fn status(&self) -> ConnectionStatus {
        return self.status;
    }

    pub fn subject(&self) -> &Subject<PartitionEvent> {
        return &self.subject;
    }

    /// Replace the snapshot.
    pub fn set_state(&mut self, state: PartitionState) {
        self.state = Arc::new(state);
    }

    pub fn publish(&self, event: PartitionEvent) {
        self.subject.publish(&event);
    }

    pub fn publish_diff(&self, diff: StateDiff) {
        for event in PartitionEvent::from_diff(diff) {
            self.publish(event);
        }
    }

    /// Replace the snapshot and publish what changed.
    pub fn commit(&mut self, state: PartitionState, diff: StateDiff) {
        self.set_state(state);
        self.publish_diff(diff);
    }

    pub fn update_status(&mut self, update: StatusUpdate) {
        self.status.apply(&update);
        self.publish(PartitionEvent::Status(update));
    }

    /// Run through all four stages at once.
    pub fn ready(&mut self) {
        for update in StatusUpdate::ready() {
            self.update_status(update);
        }
    }

    pub fn error(&self, error: &PartitionError) {
        tracing::warn!(%error, space = ?self.space, "partition error");
        self.publish(PartitionEvent::Error(error.to_event()));
    }

    pub fn subscribe(&mut self, mut observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId {
        if catch_up {
            let bots = self.state.iter().cloned().collect();
            observer(&PartitionEvent::BotsAdded(bots));
        }
        return self.subject.subscribe(observer);
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return self.subject.unsubscribe(id);
    }
}

impl<P: Partition + ?Sized> Partition for Box<P> {
    fn kind(&self) -> &'static str {
        return (**self).kind();
    }

    fn space(&self) -> Option<&str> {
        return (**self).space();
    }

    fn state(&self) -> Arc<PartitionState> {
        return (**self).state();
    }

    fn status(&self) -> ConnectionStatus {
        return (**self).status();
    }

    fn subscribe(&mut self, observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId {
        return (**self).subscribe(observer, catch_up);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return (**self).unsubscribe(id);
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        return (**self).apply_events(events);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        return (**self).connect();
    }

    fn is_synced(&self) -> bool {
        return (**self).is_synced();
    }

    fn is_read_only(&self) -> bool {
        return (**self).is_read_only();
    }

    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        return (**self).handle_client_event(event);
    }
}

/// A partition shared between threads. Every call takes the lock, which
/// serializes writes to the underlying partition.
pub struct SharedPartition<P> {
    inner: Arc<Mutex<P>>,
    space: Option<String>,
}

impl<P> Clone for SharedPartition<P> {
    fn clone(&self) -> Self {
        return SharedPartition {
            inner: Arc::clone(&self.inner),
            space: self.space.clone(),
        };
    }
}

impl<P: Partition> SharedPartition<P> {
    pub fn new(partition: P) -> SharedPartition<P> {
        let space = partition.space().map(str::to_string);
        return SharedPartition {
            inner: Arc::new(Mutex::new(partition)),
            space,
        };
    }

    pub fn lock(&self) -> MutexGuard<'_, P> {
        return self.inner.lock();
    }
}

impl<P: Partition> Partition for SharedPartition<P> {
    fn kind(&self) -> &'static str {
        return self.inner.lock().kind();
    }

    fn space(&self) -> Option<&str> {
        return self.space.as_deref();
    }

    fn state(&self) -> Arc<PartitionState> {
        return self.inner.lock().state();
    }

    fn status(&self) -> ConnectionStatus {
        return self.inner.lock().status();
    }

    fn subscribe(&mut self, observer: Observer<PartitionEvent>, catch_up: bool) -> SubscriptionId {
        return self.inner.lock().subscribe(observer, catch_up);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        return self.inner.lock().unsubscribe(id);
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        return self.inner.lock().apply_events(events);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        return self.inner.lock().connect();
    }

    fn is_synced(&self) -> bool {
        return self.inner.lock().is_synced();
    }

    fn is_read_only(&self) -> bool {
        return self.inner.lock().is_read_only();
    }

    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        return self.inner.lock().handle_client_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::memory::MemoryPartition;
    use crate::partition::stream::EventRecorder;

    #[test]
    fn status_accumulates() {
        let mut status = ConnectionStatus::default();
        for update in StatusUpdate::ready() {
            status.apply(&update);
        }
        assert!(status.synced && status.has_synced);

        status.apply(&StatusUpdate::Sync { synced: false });
        assert!(!status.synced);
        assert!(status.has_synced);
    }

    #[test]
    fn diff_events_skip_empty_kinds() {
        let diff = StateDiff {
            added: vec![Bot::new("a")],
            removed: Vec::new(),
            updated: Vec::new(),
        };
        assert_eq!(PartitionEvent::from_diff(diff), vec![PartitionEvent::BotsAdded(vec![Bot::new("a")])]);
    }

    #[test]
    fn diff_events_are_grouped_added_updated_removed() {
        let diff = StateDiff {
            added: vec![Bot::new("z"), Bot::new("a")],
            removed: vec!["gone".to_string()],
            updated: vec![UpdatedBot { bot: Bot::new("m").with_tag("n", 1), tags: vec!["n".to_string()] }],
        };
        let events = PartitionEvent::from_diff(diff);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], PartitionEvent::BotsAdded(vec![Bot::new("z"), Bot::new("a")]));
        assert!(matches!(&events[1], PartitionEvent::BotsUpdated(updated) if updated[0].bot.id == "m"));
        assert_eq!(events[2], PartitionEvent::BotsRemoved(vec!["gone".to_string()]));
    }

    #[test]
    fn catch_up_sends_current_bots() {
        let mut core = PartitionCore::new(None);
        core.set_state(PartitionState::from_bots([Bot::new("a"), Bot::new("b")]));

        let recorder = EventRecorder::new();
        core.subscribe(recorder.observer(), true);
        assert_eq!(recorder.added(), vec!["a".to_string(), "b".to_string()]);

        let late = EventRecorder::new();
        core.subscribe(late.observer(), false);
        assert!(late.events().is_empty());
    }

    #[test]
    fn shared_partition_serializes_access() {
        let shared = SharedPartition::new(MemoryPartition::new(None));
        let mut writer = shared.clone();
        writer.connect().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let mut writer = shared.clone();
                std::thread::spawn(move || {
                    writer.apply_events(&[BotEvent::add(Bot::new(format!("bot{}", n)))]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.state().len(), 4);
        assert!(shared.is_synced());
    }
}
