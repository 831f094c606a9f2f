// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

use thiserror::Error;

use crate::config::ConfigError;
use crate::crdt::text::TextError;
use crate::crdt::weave::WeaveError;
use crate::partition::PartitionError;

/// Crate-level error. Each layer keeps its own enum; this only wraps them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Weave(#[from] WeaveError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// The bot the error is about, when there is one.
    pub fn bot_id(&self) -> Option<&str> {
        match self {
            Error::Partition(err) => return err.bot_id(),
            _ => return None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
