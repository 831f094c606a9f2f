// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A weave mirrored from a branch on a causal repo.
//!
//! The transport lives behind `CausalRepoClient`. Calls go out through the
//! client and whatever the repo sends back is fed in with
//! `handle_client_event`. The partition reports `sync: true` once the
//! first batch of atoms for its branch has arrived.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::crdt::atom::Atom;
use crate::crdt::primitives::SiteId;
use crate::crdt::weave::Weave;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::StatusUpdate;
use super::causal_tree::LocalWrite;
use super::causal_tree::WeaveStore;
use super::stream::Observer;
use super::stream::SubscriptionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("causal repo at {host} is unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("causal repo rejected the request: {0}")]
    Rejected(String),
}

/// A device connected to a branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The connection, unique per device session.
    pub id: String,
    /// The user the device belongs to.
    pub user: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, user: impl Into<String>) -> DeviceInfo {
        return DeviceInfo {
            id: id.into(),
            user: user.into(),
        };
    }
}

/// What a causal repo connection delivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Status { status: StatusUpdate },
    Atoms { branch: String, atoms: Vec<Atom> },
    DeviceConnected { branch: String, device: DeviceInfo },
    DeviceDisconnected { branch: String, device: DeviceInfo },
}

/// The minimal verbs a causal repo transport supports.
pub trait CausalRepoClient: Send {
    fn watch_branch(&mut self, branch: &str) -> Result<(), ClientError>;

    fn unwatch_branch(&mut self, branch: &str) -> Result<(), ClientError>;

    fn add_atoms(&mut self, branch: &str, atoms: &[Atom]) -> Result<(), ClientError>;

    fn watch_devices(&mut self, branch: &str) -> Result<(), ClientError>;

    fn unwatch_devices(&mut self, branch: &str) -> Result<(), ClientError>;
}

/// A call made on a `RecordingClient`.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCall {
    WatchBranch(String),
    UnwatchBranch(String),
    AddAtoms { branch: String, atoms: Vec<Atom> },
    WatchDevices(String),
    UnwatchDevices(String),
}

/// A client that records calls instead of talking to a repo. Clones share
/// the same record.
#[derive(Clone, Debug, Default)]
pub struct RecordingClient {
    calls: Arc<Mutex<Vec<ClientCall>>>,
    fail_with: Arc<Mutex<Option<ClientError>>>,
}

impl RecordingClient {
    pub fn new() -> RecordingClient {
        return RecordingClient::default();
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        return self.calls.lock().clone();
    }

    /// Every atom sent with `add_atoms`, in order.
    pub fn sent_atoms(&self) -> Vec<Atom> {
        return self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ClientCall::AddAtoms { atoms, .. } => Some(atoms.clone()),
                _ => None,
            })
            .flatten()
            .collect();
    }

    /// Make every following call fail.
    pub fn fail_with(&self, error: Option<ClientError>) {
        *self.fail_with.lock() = error;
    }

    fn record(&mut self, call: ClientCall) -> Result<(), ClientError> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        self.calls.lock().push(call);
        return Ok(());
    }
}

impl CausalRepoClient for RecordingClient {
    fn watch_branch(&mut self, branch: &str) -> Result<(), ClientError> {
        return self.record(ClientCall::WatchBranch(branch.to_string()));
    }

    fn unwatch_branch(&mut self, branch: &str) -> Result<(), ClientError> {
        return self.record(ClientCall::UnwatchBranch(branch.to_string()));
    }

    fn add_atoms(&mut self, branch: &str, atoms: &[Atom]) -> Result<(), ClientError> {
        return self.record(ClientCall::AddAtoms {
            branch: branch.to_string(),
            atoms: atoms.to_vec(),
        });
    }

    fn watch_devices(&mut self, branch: &str) -> Result<(), ClientError> {
        return self.record(ClientCall::WatchDevices(branch.to_string()));
    }

    fn unwatch_devices(&mut self, branch: &str) -> Result<(), ClientError> {
        return self.record(ClientCall::UnwatchDevices(branch.to_string()));
    }
}

pub struct RemoteCausalTreePartition {
    core: PartitionCore,
    store: WeaveStore,
    client: Box<dyn CausalRepoClient>,
    branch: String,
    read_only: bool,
}

impl std::fmt::Debug for RemoteCausalTreePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("RemoteCausalTreePartition")
            .field("branch", &self.branch)
            .field("read_only", &self.read_only)
            .field("atoms", &self.store.weave().len())
            .finish();
    }
}

impl RemoteCausalTreePartition {
    pub fn new(site: SiteId, branch: impl Into<String>, client: Box<dyn CausalRepoClient>) -> RemoteCausalTreePartition {
        return RemoteCausalTreePartition {
            core: PartitionCore::new(None),
            store: WeaveStore::new(site),
            client,
            branch: branch.into(),
            read_only: false,
        };
    }

    pub fn in_space(mut self, space: impl Into<String>) -> RemoteCausalTreePartition {
        self.core = PartitionCore::new(Some(space.into()));
        return self;
    }

    pub fn with_max_orphan_batches(mut self, batches: u32) -> RemoteCausalTreePartition {
        self.store = self.store.with_max_orphan_batches(batches);
        return self;
    }

    pub fn read_only(mut self, read_only: bool) -> RemoteCausalTreePartition {
        self.read_only = read_only;
        return self;
    }

    pub fn branch(&self) -> &str {
        return &self.branch;
    }

    pub fn weave(&self) -> &Weave {
        return self.store.weave();
    }

    /// Treat a failed call as a dropped connection.
    fn client_failed(&mut self, err: ClientError) {
        tracing::warn!(%err, branch = %self.branch, "causal repo call failed");
        self.core.update_status(StatusUpdate::Connection { connected: false });
        if self.core.status().synced {
            self.core.update_status(StatusUpdate::Sync { synced: false });
        }
    }

    fn receive_atoms(&mut self, atoms: &[Atom]) {
        let report = self.store.add_atoms(atoms.iter().cloned());
        for err in report.errors() {
            self.core.error(&PartitionError::Weave(err.clone()));
        }
        let (state, diff) = self.store.reduce(&self.core.state(), &report.results, self.core.space());
        self.core.commit(state, diff);
        if !self.core.status().synced {
            tracing::info!(branch = %self.branch, atoms = self.store.weave().len(), "branch synced");
            self.core.update_status(StatusUpdate::Sync { synced: true });
        }
    }
}

impl Partition for RemoteCausalTreePartition {
    fn kind(&self) -> &'static str {
        return "remote_causal_tree";
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
        return self.read_only;
    }

    fn apply_events(&mut self, events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        let mut echo = Vec::new();
        if self.read_only {
            if events.iter().any(|event| !matches!(event, BotEvent::Passthrough { .. })) {
                self.core.error(&PartitionError::ReadOnly);
            }
            return Ok(echo);
        }
        let mut write = LocalWrite::default();
        for event in events {
            if let BotEvent::Passthrough { .. } = event {
                echo.push(event.clone());
                continue;
            }
            if let Err(err) = self.store.apply_event(event, &mut write) {
                self.core.error(&err);
            }
        }
        if write.atoms.is_empty() {
            return Ok(echo);
        }
        let (state, diff) = self.store.reduce(&self.core.state(), &write.results, self.core.space());
        self.core.commit(state, diff);
        if let Err(err) = self.client.add_atoms(&self.branch, &write.atoms) {
            self.client_failed(err);
        }
        return Ok(echo);
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        tracing::info!(branch = %self.branch, "watching branch");
        if let Err(err) = self.client.watch_branch(&self.branch) {
            self.client_failed(err);
        }
        return Ok(());
    }

    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        match event {
            ClientEvent::Status { status } => match status {
                StatusUpdate::Sync { .. } => {}
                StatusUpdate::Connection { connected: false } => {
                    self.core.update_status(status.clone());
                    if self.core.status().synced {
                        self.core.update_status(StatusUpdate::Sync { synced: false });
                    }
                }
                StatusUpdate::Connection { connected: true } => {
                    let resync = self.core.status().has_synced && !self.core.status().connected;
                    self.core.update_status(status.clone());
                    if resync {
                        if let Err(err) = self.client.watch_branch(&self.branch) {
                            self.client_failed(err);
                        }
                    }
                }
                _ => self.core.update_status(status.clone()),
            },
            ClientEvent::Atoms { branch, atoms } if branch == &self.branch => {
                self.receive_atoms(atoms);
            }
            _ => {}
        }
        return Ok(());
    }
}
