use thiserror::Error;

use crate::core::agent::Paw;
use crate::core::link::{LinkId, LinkStatus, OperationId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// A result arrived for a paw or link that no operation knows about.
    #[error("Unknown agent {paw} for link {link_id}")]
    UnknownAgent { paw: Paw, link_id: LinkId },

    /// A result arrived for a link that is not waiting on one.
    #[error("Stale link {link_id} (status {status})")]
    StaleLink { link_id: LinkId, status: LinkStatus },

    #[error("Link {link_id} on {paw} timed out after {window:?}")]
    DeadAgentTimeout {
        link_id: LinkId,
        paw: Paw,
        window: std::time::Duration,
    },

    #[error("Channel {channel} rejected heartbeat: {reason}")]
    ChannelDecode { channel: String, reason: String },

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Unknown contact channel: {0}")]
    UnknownChannel(String),

    #[error("Unknown adversary: {0}")]
    UnknownAdversary(String),

    #[error("Unknown planner: {0}")]
    UnknownPlanner(String),

    #[error("Unknown fact source: {0}")]
    UnknownSource(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("Operation {0} is finished")]
    OperationFinished(OperationId),

    #[error("Payload not found: {0}")]
    PayloadNotFound(String),

    #[error("Path escapes its base directory: {0}")]
    PathTraversal(String),
}

impl Error {
    /// Whether the failure is confined to a single link or heartbeat.
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            Error::UnknownAgent { .. }
                | Error::StaleLink { .. }
                | Error::DeadAgentTimeout { .. }
                | Error::ChannelDecode { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
