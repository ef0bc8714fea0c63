//! Region and peer metadata.
//!
//! These are plain value types: the controller never mutates them in place
//! but builds a new value and republishes it wholesale (see
//! [`crate::read::LeaderChecker`]), which keeps foreign readers free of any
//! shared mutability beyond an atomic pointer swap.

use serde::Deserialize;
use serde::Serialize;

/// An id that has never been allocated.
pub const INVALID_ID: u64 = 0;

/// The index reserved by the consensus library, never carried by a real log
/// entry.
pub const RAFT_INVALID_INDEX: u64 = 0;

/// Region epoch, bumped on membership (`conf_ver`) or split/merge
/// (`version`) changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    Voter,
    Learner,
}

/// Identity of one replica of one region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub id: u64,
    pub store_id: u64,
    pub role: PeerRole,
}

impl PeerMeta {
    pub fn new(id: u64, store_id: u64) -> PeerMeta {
        PeerMeta {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }
}

/// A contiguous key range managed by one Raft group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<PeerMeta>,
}

impl Region {
    pub fn get_peer(&self, peer_id: u64) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.id == peer_id)
    }
}

/// Durable lifecycle state of a peer, persisted under the region state key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    Normal,
    Applying,
    Tombstone,
    Merging,
}

/// State recorded when a `PrepareMerge` has been applied and the region is
/// waiting for the merge to commit or roll back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub min_index: u64,
    pub target: Region,
    pub commit: u64,
}

/// The full durable region record: lifecycle state plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocalState {
    pub state: PeerState,
    pub region: Region,
    pub merge_state: Option<MergeState>,
}

/// The last log position guaranteed present on every replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Apply progress of the key-value engine for one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyState {
    pub applied_index: u64,
    pub truncated_state: TruncatedState,
}
