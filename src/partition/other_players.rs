// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Read-only shadow of what other devices have on their player branches.
//!
//! ```text
//! Disconnected -> WatchingDevices -> per device: WatchingBranch -> Merged
//!                                                -> Unwatching -> (removed)
//! ```
//!
//! Each device gets its own weave. The partition state is the union of
//! every device's bots. When a device goes away its bots go with it. After
//! a dropped connection comes back, the device list and every shadowed
//! player branch are watched again.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bot::BotEvent;
use crate::bot::PartitionState;
use crate::bot::diff_states;
use crate::crdt::atom::Atom;
use crate::crdt::primitives::SiteId;
use super::ConnectionStatus;
use super::Partition;
use super::PartitionCore;
use super::PartitionError;
use super::PartitionEvent;
use super::StatusUpdate;
use super::causal_tree::WeaveStore;
use super::remote::CausalRepoClient;
use super::remote::ClientError;
use super::remote::ClientEvent;
use super::remote::DeviceInfo;
use super::stream::Observer;
use super::stream::SubscriptionId;

/// The identity the server connects under.
pub const SERVER_USER: &str = "server";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowStage {
    Disconnected,
    WatchingDevices,
    Unwatching,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStage {
    /// Watching the player branch, nothing received yet.
    WatchingBranch,
    /// At least one batch folded in.
    Merged,
}

#[derive(Debug)]
struct DeviceShadow {
    info: DeviceInfo,
    branch: String,
    stage: DeviceStage,
    store: WeaveStore,
    bots: PartitionState,
}

/// The branch a device's player state lives on.
pub fn player_branch(branch: &str, device: &str) -> String {
    return format!("{}-player-{}", branch, device);
}

pub struct OtherPlayersPartition {
    core: PartitionCore,
    client: Box<dyn CausalRepoClient>,
    site: SiteId,
    branch: String,
    excluded: Vec<String>,
    stage: ShadowStage,
    devices: BTreeMap<String, DeviceShadow>,
}

impl std::fmt::Debug for OtherPlayersPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("OtherPlayersPartition")
            .field("branch", &self.branch)
            .field("stage", &self.stage)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish();
    }
}

impl OtherPlayersPartition {
    /// `user` is this partition's own identity. Devices owned by it, or by
    /// the server, are never shadowed.
    pub fn new(site: SiteId, branch: impl Into<String>, user: impl Into<String>, client: Box<dyn CausalRepoClient>) -> OtherPlayersPartition {
        return OtherPlayersPartition {
            core: PartitionCore::new(None),
            client,
            site,
            branch: branch.into(),
            excluded: vec![SERVER_USER.to_string(), user.into()],
            stage: ShadowStage::Disconnected,
            devices: BTreeMap::new(),
        };
    }

    pub fn in_space(mut self, space: impl Into<String>) -> OtherPlayersPartition {
        self.core = PartitionCore::new(Some(space.into()));
        return self;
    }

    /// Replace the server identity in the exclusion list. The partition's
    /// own user stays excluded.
    pub fn excluding(mut self, users: impl IntoIterator<Item = String>) -> OtherPlayersPartition {
        let own = self.excluded.pop();
        self.excluded = users.into_iter().collect();
        self.excluded.extend(own);
        return self;
    }

    pub fn stage(&self) -> ShadowStage {
        return self.stage;
    }

    pub fn device_stage(&self, device: &str) -> Option<DeviceStage> {
        return self.devices.get(device).map(|shadow| shadow.stage);
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        return self.devices.values().map(|shadow| &shadow.info);
    }

    fn is_excluded(&self, device: &DeviceInfo) -> bool {
        return self.excluded.iter().any(|id| *id == device.user || *id == device.id);
    }

    fn client_failed(&mut self, err: ClientError) {
        tracing::warn!(%err, branch = %self.branch, "causal repo call failed");
        self.core.update_status(StatusUpdate::Connection { connected: false });
        if self.core.status().synced {
            self.core.update_status(StatusUpdate::Sync { synced: false });
        }
    }

    /// Watch the device list and every shadowed branch again after the
    /// connection comes back.
    fn rewatch(&mut self) {
        tracing::info!(branch = %self.branch, devices = self.devices.len(), "reconnected, watching again");
        if let Err(err) = self.client.watch_devices(&self.branch) {
            self.client_failed(err);
            return;
        }
        let branches: Vec<String> = self.devices.values().map(|shadow| shadow.branch.clone()).collect();
        for branch in branches {
            if let Err(err) = self.client.watch_branch(&branch) {
                self.client_failed(err);
                return;
            }
        }
        for shadow in self.devices.values_mut() {
            shadow.stage = DeviceStage::WatchingBranch;
        }
        self.core.ready();
    }

    /// Rebuild the union of device states and publish the difference.
    fn republish(&mut self) {
        let prior = self.core.state();
        let next = PartitionState::from_bots(
            self.devices.values().flat_map(|shadow| shadow.bots.iter().cloned()),
        );
        let diff = diff_states(&prior, &next);
        self.core.commit(next, diff);
    }

    fn device_connected(&mut self, device: &DeviceInfo) {
        if self.is_excluded(device) {
            tracing::debug!(device = %device.id, user = %device.user, "not shadowing device");
            return;
        }
        if self.devices.contains_key(&device.id) {
            return;
        }
        let branch = player_branch(&self.branch, &device.id);
        tracing::info!(device = %device.id, %branch, "shadowing device");
        if let Err(err) = self.client.watch_branch(&branch) {
            self.client_failed(err);
            return;
        }
        let site = SiteId::new(format!("{}-{}", self.site, device.id));
        self.devices.insert(device.id.clone(), DeviceShadow {
            info: device.clone(),
            branch,
            stage: DeviceStage::WatchingBranch,
            store: WeaveStore::new(site),
            bots: PartitionState::new(),
        });
    }

    fn device_disconnected(&mut self, device: &DeviceInfo) {
        let Some(shadow) = self.devices.remove(&device.id) else {
            return;
        };
        tracing::info!(device = %device.id, bots = shadow.bots.len(), "device left");
        if let Err(err) = self.client.unwatch_branch(&shadow.branch) {
            self.client_failed(err);
        }
        self.republish();
    }

    fn device_atoms(&mut self, branch: &str, atoms: &[Atom]) {
        let space = self.core.space().map(str::to_string);
        let Some(shadow) = self.devices.values_mut().find(|shadow| shadow.branch == branch) else {
            return;
        };
        let report = shadow.store.add_atoms(atoms.iter().cloned());
        let (bots, _) = shadow.store.reduce(&shadow.bots, &report.results, space.as_deref());
        shadow.bots = bots;
        shadow.stage = DeviceStage::Merged;
        let errors: Vec<_> = report.errors().cloned().collect();
        for err in errors {
            self.core.error(&PartitionError::Weave(err));
        }
        self.republish();
    }
}

impl Partition for OtherPlayersPartition {
    fn kind(&self) -> &'static str {
        return "other_players";
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

    fn apply_events(&mut self, _events: &[BotEvent]) -> Result<Vec<BotEvent>, PartitionError> {
        return Ok(Vec::new());
    }

    fn connect(&mut self) -> Result<(), PartitionError> {
        self.core.ready();
        match self.client.watch_devices(&self.branch) {
            Ok(()) => self.stage = ShadowStage::WatchingDevices,
            Err(err) => self.client_failed(err),
        }
        return Ok(());
    }

    fn handle_client_event(&mut self, event: &ClientEvent) -> Result<(), PartitionError> {
        if self.stage == ShadowStage::Disconnected {
            return Ok(());
        }
        match event {
            ClientEvent::Status { status: StatusUpdate::Connection { connected: false } } => {
                self.client_failed(ClientError::Rejected("connection lost".to_string()));
            }
            ClientEvent::Status { status: StatusUpdate::Connection { connected: true } } => {
                if !self.core.status().connected {
                    self.rewatch();
                }
            }
            ClientEvent::Status { .. } => {}
            ClientEvent::DeviceConnected { branch, device } if branch == &self.branch => {
                self.device_connected(device);
            }
            ClientEvent::DeviceDisconnected { branch, device } if branch == &self.branch => {
                self.device_disconnected(device);
            }
            ClientEvent::Atoms { branch, atoms } => {
                self.device_atoms(branch, atoms);
            }
            _ => {}
        }
        return Ok(());
    }
}

impl Drop for OtherPlayersPartition {
    fn drop(&mut self) {
        if self.stage != ShadowStage::WatchingDevices {
            return;
        }
        self.stage = ShadowStage::Unwatching;
        let branches: Vec<String> = self.devices.values().map(|shadow| shadow.branch.clone()).collect();
        for branch in branches {
            if let Err(err) = self.client.unwatch_branch(&branch) {
                tracing::warn!(%err, %branch, "could not unwatch player branch");
            }
        }
        if let Err(err) = self.client.unwatch_devices(&self.branch) {
            tracing::warn!(%err, branch = %self.branch, "could not unwatch devices");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Bot;
    use crate::partition::remote::ClientCall;
    use crate::partition::remote::RecordingClient;
    use crate::partition::causal_tree::LocalWrite;
    use crate::partition::stream::EventRecorder;

    fn shadow() -> (OtherPlayersPartition, RecordingClient, EventRecorder) {
        let client = RecordingClient::new();
        let mut partition = OtherPlayersPartition::new(SiteId::from("me"), "main", "alice", Box::new(client.clone()));
        let recorder = EventRecorder::new();
        partition.subscribe(recorder.observer(), false);
        partition.connect().unwrap();
        return (partition, client, recorder);
    }

    fn player_atoms(site: &str, bot: &str) -> Vec<Atom> {
        let mut store = WeaveStore::new(SiteId::from(site));
        let mut write = LocalWrite::default();
        store.apply_event(&BotEvent::add(Bot::new(bot).with_tag("color", "red")), &mut write).unwrap();
        return write.atoms;
    }

    fn connected(device: &DeviceInfo) -> ClientEvent {
        return ClientEvent::DeviceConnected { branch: "main".to_string(), device: device.clone() };
    }

    fn disconnected(device: &DeviceInfo) -> ClientEvent {
        return ClientEvent::DeviceDisconnected { branch: "main".to_string(), device: device.clone() };
    }

    #[test]
    fn connect_reports_ready_then_watches_devices() {
        let (partition, client, recorder) = shadow();
        assert_eq!(recorder.statuses(), StatusUpdate::ready().to_vec());
        assert_eq!(client.calls(), vec![ClientCall::WatchDevices("main".to_string())]);
        assert_eq!(partition.stage(), ShadowStage::WatchingDevices);
    }

    #[test]
    fn device_lifecycle_adds_then_removes_its_bots() {
        let (mut partition, client, recorder) = shadow();
        let d1 = DeviceInfo::new("d1", "bob");

        partition.handle_client_event(&connected(&d1)).unwrap();
        assert!(client.calls().contains(&ClientCall::WatchBranch("main-player-d1".to_string())));
        assert_eq!(partition.device_stage("d1"), Some(DeviceStage::WatchingBranch));

        let atoms = player_atoms("bob", "p1");
        partition.handle_client_event(&ClientEvent::Atoms { branch: "main-player-d1".to_string(), atoms }).unwrap();
        assert_eq!(partition.device_stage("d1"), Some(DeviceStage::Merged));
        assert_eq!(recorder.added(), vec!["p1".to_string()]);

        partition.handle_client_event(&disconnected(&d1)).unwrap();
        assert!(partition.state().is_empty());
        assert_eq!(recorder.removed(), vec![vec!["p1".to_string()]]);
        assert!(client.calls().contains(&ClientCall::UnwatchBranch("main-player-d1".to_string())));
        assert_eq!(partition.device_stage("d1"), None);
    }

    #[test]
    fn own_and_server_devices_are_not_shadowed() {
        let (mut partition, client, _) = shadow();
        partition.handle_client_event(&connected(&DeviceInfo::new("d1", "alice"))).unwrap();
        partition.handle_client_event(&connected(&DeviceInfo::new("d2", SERVER_USER))).unwrap();
        assert_eq!(partition.devices().count(), 0);
        assert_eq!(client.calls().len(), 1);
    }

    #[test]
    fn exclusion_list_is_configurable() {
        let client = RecordingClient::new();
        let mut partition = OtherPlayersPartition::new(SiteId::from("me"), "main", "alice", Box::new(client.clone()))
            .excluding(vec!["robot".to_string()]);
        partition.connect().unwrap();

        partition.handle_client_event(&connected(&DeviceInfo::new("d1", "robot"))).unwrap();
        partition.handle_client_event(&connected(&DeviceInfo::new("d2", SERVER_USER))).unwrap();
        partition.handle_client_event(&connected(&DeviceInfo::new("d3", "alice"))).unwrap();
        let shadowed: Vec<_> = partition.devices().map(|device| device.id.clone()).collect();
        assert_eq!(shadowed, vec!["d2".to_string()]);
    }

    #[test]
    fn writes_are_ignored() {
        let (mut partition, client, recorder) = shadow();
        recorder.take();
        let echo = partition.apply_events(&[BotEvent::add(Bot::new("x"))]).unwrap();
        assert!(echo.is_empty());
        assert!(partition.state().is_empty());
        assert!(recorder.events().is_empty());
        assert!(client.sent_atoms().is_empty());
        assert!(partition.is_read_only());
    }

    #[test]
    fn two_devices_keep_their_own_bots() {
        let (mut partition, _, recorder) = shadow();
        let d1 = DeviceInfo::new("d1", "bob");
        let d2 = DeviceInfo::new("d2", "carol");
        partition.handle_client_event(&connected(&d1)).unwrap();
        partition.handle_client_event(&connected(&d2)).unwrap();
        partition.handle_client_event(&ClientEvent::Atoms { branch: "main-player-d1".to_string(), atoms: player_atoms("bob", "p1") }).unwrap();
        partition.handle_client_event(&ClientEvent::Atoms { branch: "main-player-d2".to_string(), atoms: player_atoms("carol", "p2") }).unwrap();
        assert_eq!(partition.state().len(), 2);

        partition.handle_client_event(&disconnected(&d2)).unwrap();
        assert_eq!(recorder.removed(), vec![vec!["p2".to_string()]]);
        assert!(partition.state().contains("p1"));
    }

    #[test]
    fn drop_unwatches_everything() {
        let (mut partition, client, _) = shadow();
        partition.handle_client_event(&connected(&DeviceInfo::new("d1", "bob"))).unwrap();
        drop(partition);
        let calls = client.calls();
        assert!(calls.contains(&ClientCall::UnwatchBranch("main-player-d1".to_string())));
        assert_eq!(calls.last(), Some(&ClientCall::UnwatchDevices("main".to_string())));
    }

    #[test]
    fn reconnect_watches_devices_and_branches_again() {
        let (mut partition, client, _) = shadow();
        let d1 = DeviceInfo::new("d1", "bob");
        partition.handle_client_event(&connected(&d1)).unwrap();
        partition.handle_client_event(&ClientEvent::Atoms { branch: "main-player-d1".to_string(), atoms: player_atoms("bob", "p1") }).unwrap();

        let lost = ClientEvent::Status { status: StatusUpdate::Connection { connected: false } };
        partition.handle_client_event(&lost).unwrap();
        assert!(!partition.status().connected);
        let before = client.calls().len();

        let back = ClientEvent::Status { status: StatusUpdate::Connection { connected: true } };
        partition.handle_client_event(&back).unwrap();
        let calls = client.calls()[before..].to_vec();
        assert_eq!(calls, vec![
            ClientCall::WatchDevices("main".to_string()),
            ClientCall::WatchBranch("main-player-d1".to_string()),
        ]);
        assert!(partition.status().connected);
        assert_eq!(partition.device_stage("d1"), Some(DeviceStage::WatchingBranch));
        assert!(partition.state().contains("p1"));
    }

    #[test]
    fn drop_survives_a_failing_client() {
        let (mut partition, client, _) = shadow();
        partition.handle_client_event(&connected(&DeviceInfo::new("d1", "bob"))).unwrap();
        let before = client.calls().len();
        client.fail_with(Some(ClientError::Rejected("gone".to_string())));
        drop(partition);
        assert_eq!(client.calls().len(), before);
    }
}
