// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! An immutable partition loaded once from a query.

use std::sync::Arc;

use crate::bot::Bot;
use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::StateDiff;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::StatusUpdate;
use super::remote::ClientError;
use super::stream::Observer;
use super::stream::SubscriptionId;

/// Where the bots of a query partition come from.
pub trait BotQueryClient: Send {
    fn query(&mut self) -> Result<Vec<Bot>, ClientError>;
}

/// A query answered from a fixed list.
#[derive(Clone, Debug, Default)]
pub struct StaticQuery {
    bots: Vec<Bot>,
}

impl StaticQuery {
    pub fn new(bots: Vec<Bot>) -> StaticQuery {
        return StaticQuery { bots };
    }
}

impl BotQueryClient for StaticQuery {
    fn query(&mut self) -> Result<Vec<Bot>, ClientError> {
        return Ok(self.bots.clone());
    }
}

pub struct QueryPartition {
    core: PartitionCore,
    client: Box<dyn BotQueryClient>,
    loaded: bool,
}

impl std::fmt::Debug for QueryPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("QueryPartition")
            .field("loaded", &self.loaded)
            .field("bots", &self.core.state().len())
            .finish();
    }
}

impl QueryPartition {
    pub fn new(space: Option<String>, client: Box<dyn BotQueryClient>) -> QueryPartition {
        return QueryPartition {
            core: PartitionCore::new(space),
            client,
            loaded: false,
        };
    }
}

impl Partition for QueryPartition {
    fn kind(&self) -> &'static str {
        return "query";
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

    fn is_read_only(&self) -> bool {
        return true;
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        if events.iter().any(|event| !matches!(event, BotEvent::Passthrough { .. })) {
            self.core.error(&PartitionError::ReadOnly);
        }
        return Ok(Vec::new());
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        if self.loaded {
            return Ok(());
        }
        let bots = match self.client.query() {
            Ok(bots) => bots,
            Err(err) => {
                tracing::warn!(%err, "query failed");
                self.core.update_status(StatusUpdate::Connection { connected: false });
                return Ok(());
            }
        };
        self.loaded = true;
        let space = self.core.space().map(str::to_string);
        let bots: Vec<Bot> = bots
            .into_iter()
            .map(|mut bot| {
                bot.space = space.clone();
                bot
            })
            .collect();
        tracing::info!(bots = bots.len(), "query loaded");
        let state = PartitionState::from_bots(bots);
        let diff = StateDiff {
            added: state.iter().cloned().collect(),
            ..StateDiff::default()
        };
        self.core.commit(state, diff);
        self.core.ready();
        return Ok(());
    }
}
