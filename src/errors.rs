//! Error hierarchy for the peer controller.
//!
//! Split in two levels: [`CmdError`] is the command-level taxonomy that rides
//! in response headers back to clients (and therefore stays cloneable and
//! serializable), while [`Error`] is the crate-wide error that additionally
//! covers configuration, IO, codec and consensus failures.

use serde::Deserialize;
use serde::Serialize;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to command callbacks, mirrored into response headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CmdError {
    /// The proposal was silently dropped by the consensus layer, usually due
    /// to leader absence or an ongoing leader transfer.
    #[error("peer is not leader for region {region_id}")]
    NotLeader { region_id: u64 },

    /// The request was issued under an older term; the current term is bound
    /// to the response header.
    #[error("stale command")]
    StaleCommand,

    /// The region epoch changed between the request being built and handled.
    #[error("epoch not match: {message}")]
    EpochNotMatch { message: String },

    /// The peer has been destroyed or never existed on this store.
    #[error("region {region_id} not found")]
    RegionNotFound { region_id: u64 },

    /// The marshalled payload exceeds the configured entry size limit.
    #[error("raft entry of {entry_size} bytes for region {region_id} exceeds the size limit")]
    RaftEntryTooLarge { region_id: u64, entry_size: u64 },

    /// The membership change request is malformed or would leave the group
    /// without a healthy quorum.
    #[error("invalid conf change request: {0}")]
    InvalidConfChange(String),

    /// The proposal was refused before reaching the consensus layer
    /// (merging, splitting, pending conf change, log gap too large, ...).
    #[error("proposal refused: {0}")]
    ProposalRefused(String),

    /// Catch-all carrying only a message, for failures without a dedicated
    /// variant (corrupted commands, closed routers, ...).
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Command-level failures answered through callbacks.
    #[error(transparent)]
    Cmd(#[from] CmdError),

    /// Configuration validation failures.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Disk IO failures from the storage collaborators.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization failures for log payloads and persisted region state.
    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    /// Failures reported by the consensus library.
    #[error("consensus failure: {0}")]
    Raft(String),

    /// Failures reported by the peer storage.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Collapses into the command-level error carried in a response header.
    pub fn into_cmd_error(self) -> CmdError {
        match self {
            Error::Cmd(e) => e,
            other => CmdError::Other(other.to_string()),
        }
    }
}
