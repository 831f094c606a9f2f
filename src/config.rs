// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Partition configuration.
//!
//! A partition is described by a JSON object whose `type` picks the
//! backend:
//!
//! ```json
//! { "type": "remote_causal_tree", "branch": "main", "host": "repo.local", "read_only": true }
//! ```
//!
//! `create_partition` turns a config into a boxed partition. Collaborators
//! the engine does not own, such as repo connections, come from
//! `PartitionServices`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::bot::Bot;
use crate::bot::PartialBot;
use crate::bot::PartitionState;
use crate::crdt::primitives::SiteId;
use crate::partition::Partition;
use crate::partition::causal_tree::CausalTreePartition;
use crate::partition::composite::PartitionSet;
use crate::partition::memory::MemoryPartition;
use crate::partition::other_players::OtherPlayersPartition;
use crate::partition::other_players::SERVER_USER;
use crate::partition::query::BotQueryClient;
use crate::partition::query::QueryPartition;
use crate::partition::remote::CausalRepoClient;
use crate::partition::remote::RemoteCausalTreePartition;
use crate::partition::text::TextPartition;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid partition config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{kind} partition: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("{kind} partition needs a {service}, and none was provided")]
    MissingService { kind: &'static str, service: &'static str },
    #[error("default space {0} has no partition")]
    UnknownDefaultSpace(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionConfig {
    Memory {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        initial_state: BTreeMap<String, PartialBot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
    },
    CausalTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_orphan_batches: Option<u32>,
    },
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_deferred_retries: Option<u32>,
    },
    RemoteCausalTree {
        branch: String,
        host: String,
        #[serde(default)]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_orphan_batches: Option<u32>,
    },
    OtherPlayers {
        branch: String,
        host: String,
        /// Users whose devices are never shadowed. Defaults to the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        excluded_devices: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
    },
    Query {
        branch: String,
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
    },
}

impl PartitionConfig {
    pub fn from_json(json: &str) -> Result<PartitionConfig, ConfigError> {
        let config: PartitionConfig = serde_json::from_str(json)?;
        config.validate()?;
        return Ok(config);
    }

    /// The backend name, matching `Partition::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            PartitionConfig::Memory { .. } => return "memory",
            PartitionConfig::CausalTree { .. } => return "causal_tree",
            PartitionConfig::Text { .. } => return "text",
            PartitionConfig::RemoteCausalTree { .. } => return "remote_causal_tree",
            PartitionConfig::OtherPlayers { .. } => return "other_players",
            PartitionConfig::Query { .. } => return "query",
        }
    }

    pub fn space(&self) -> Option<&str> {
        match self {
            PartitionConfig::Memory { space, .. }
            | PartitionConfig::CausalTree { space, .. }
            | PartitionConfig::Text { space, .. }
            | PartitionConfig::RemoteCausalTree { space, .. }
            | PartitionConfig::OtherPlayers { space, .. }
            | PartitionConfig::Query { space, .. } => return space.as_deref(),
        }
    }

    fn set_default_space(&mut self, default: &str) {
        match self {
            PartitionConfig::Memory { space, .. }
            | PartitionConfig::CausalTree { space, .. }
            | PartitionConfig::Text { space, .. }
            | PartitionConfig::RemoteCausalTree { space, .. }
            | PartitionConfig::OtherPlayers { space, .. }
            | PartitionConfig::Query { space, .. } => {
                if space.is_none() {
                    *space = Some(default.to_string());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.kind();
        let invalid = |reason: &str| ConfigError::Invalid { kind, reason: reason.to_string() };
        match self {
            PartitionConfig::RemoteCausalTree { branch, host, .. }
            | PartitionConfig::OtherPlayers { branch, host, .. }
            | PartitionConfig::Query { branch, host, .. } => {
                if branch.is_empty() {
                    return Err(invalid("branch must not be empty"));
                }
                if host.is_empty() {
                    return Err(invalid("host must not be empty"));
                }
            }
            PartitionConfig::Memory { .. } | PartitionConfig::CausalTree { .. } | PartitionConfig::Text { .. } => {}
        }
        if let PartitionConfig::CausalTree { site: Some(site), .. } | PartitionConfig::Text { site: Some(site), .. } = self {
            if site.is_empty() {
                return Err(invalid("site must not be empty"));
            }
        }
        return Ok(());
    }
}

/// Several partitions addressed by space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionSetConfig {
    #[serde(default = "default_space")]
    pub default_space: String,
    pub partitions: BTreeMap<String, PartitionConfig>,
}

fn default_space() -> String {
    return "shared".to_string();
}

impl PartitionSetConfig {
    pub fn from_json(json: &str) -> Result<PartitionSetConfig, ConfigError> {
        let config: PartitionSetConfig = serde_json::from_str(json)?;
        for partition in config.partitions.values() {
            partition.validate()?;
        }
        if !config.partitions.contains_key(&config.default_space) {
            return Err(ConfigError::UnknownDefaultSpace(config.default_space));
        }
        return Ok(config);
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<PartitionSetConfig, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        return PartitionSetConfig::from_json(&json);
    }

    /// Build every partition. A member without its own space is placed in
    /// the space it is keyed under.
    pub fn create(&self, services: &mut PartitionServices) -> Result<PartitionSet, ConfigError> {
        let mut set = PartitionSet::new(self.default_space.clone());
        for (space, config) in &self.partitions {
            let mut config = config.clone();
            config.set_default_space(space);
            set.insert(space.clone(), create_partition(&config, services)?);
        }
        return Ok(set);
    }
}

/// Opens a connection to a causal repo at a host.
pub type RepoClientFactory = Box<dyn FnMut(&str) -> Box<dyn CausalRepoClient> + Send>;

/// Opens a query for a branch at a host.
pub type QueryClientFactory = Box<dyn FnMut(&str, &str) -> Box<dyn BotQueryClient> + Send>;

/// What partitions need from outside the engine.
pub struct PartitionServices {
    /// Default site for partitions that do not name one.
    pub site: SiteId,
    /// The user this process acts for.
    pub user: String,
    pub repo_client: Option<RepoClientFactory>,
    pub query_client: Option<QueryClientFactory>,
}

impl std::fmt::Debug for PartitionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("PartitionServices")
            .field("site", &self.site)
            .field("user", &self.user)
            .field("repo_client", &self.repo_client.is_some())
            .field("query_client", &self.query_client.is_some())
            .finish();
    }
}

impl PartitionServices {
    pub fn new(site: SiteId, user: impl Into<String>) -> PartitionServices {
        return PartitionServices {
            site,
            user: user.into(),
            repo_client: None,
            query_client: None,
        };
    }

    pub fn with_repo_client(mut self, factory: RepoClientFactory) -> PartitionServices {
        self.repo_client = Some(factory);
        return self;
    }

    pub fn with_query_client(mut self, factory: QueryClientFactory) -> PartitionServices {
        self.query_client = Some(factory);
        return self;
    }

    fn site_or_default(&self, site: &Option<String>) -> SiteId {
        return site.as_deref().map(SiteId::from).unwrap_or_else(|| self.site.clone());
    }

    fn repo(&mut self, kind: &'static str, host: &str) -> Result<Box<dyn CausalRepoClient>, ConfigError> {
        let Some(factory) = self.repo_client.as_mut() else {
            return Err(ConfigError::MissingService { kind, service: "causal repo client" });
        };
        return Ok(factory(host));
    }
}

/// Build a partition from its config.
pub fn create_partition(config: &PartitionConfig, services: &mut PartitionServices) -> Result<Box<dyn Partition>, ConfigError> {
    config.validate()?;
    tracing::debug!(kind = config.kind(), space = ?config.space(), "creating partition");
    let kind = config.kind();
    match config {
        PartitionConfig::Memory { initial_state, space } => {
            let bots = initial_state.iter().map(|(id, partial)| Bot {
                id: id.clone(),
                tags: partial.tags.clone(),
                masks: partial.masks.clone(),
                space: None,
            });
            let partition = MemoryPartition::with_state(space.clone(), PartitionState::from_bots(bots));
            return Ok(Box::new(partition));
        }
        PartitionConfig::CausalTree { site, space, max_orphan_batches } => {
            let mut partition = CausalTreePartition::new(services.site_or_default(site), space.clone());
            if let Some(batches) = max_orphan_batches {
                partition = partition.with_max_orphan_batches(*batches);
            }
            return Ok(Box::new(partition));
        }
        PartitionConfig::Text { site, space, max_deferred_retries } => {
            let mut partition = TextPartition::new(services.site_or_default(site), space.clone());
            if let Some(retries) = max_deferred_retries {
                partition = partition.with_max_deferred_retries(*retries);
            }
            return Ok(Box::new(partition));
        }
        PartitionConfig::RemoteCausalTree { branch, host, read_only, site, space, max_orphan_batches } => {
            let client = services.repo(kind, host)?;
            let mut partition = RemoteCausalTreePartition::new(services.site_or_default(site), branch.clone(), client)
                .read_only(*read_only);
            if let Some(batches) = max_orphan_batches {
                partition = partition.with_max_orphan_batches(*batches);
            }
            if let Some(space) = space {
                partition = partition.in_space(space.clone());
            }
            return Ok(Box::new(partition));
        }
        PartitionConfig::OtherPlayers { branch, host, excluded_devices, site, space } => {
            let client = services.repo(kind, host)?;
            let site = services.site_or_default(site);
            let excluded = excluded_devices.clone().unwrap_or_else(|| vec![SERVER_USER.to_string()]);
            let mut partition = OtherPlayersPartition::new(site, branch.clone(), services.user.clone(), client)
                .excluding(excluded);
            if let Some(space) = space {
                partition = partition.in_space(space.clone());
            }
            return Ok(Box::new(partition));
        }
        PartitionConfig::Query { branch, host, space } => {
            let Some(factory) = services.query_client.as_mut() else {
                return Err(ConfigError::MissingService { kind, service: "query client" });
            };
            let client = factory(host.as_str(), branch.as_str());
            return Ok(Box::new(QueryPartition::new(space.clone(), client)));
        }
    }
}
