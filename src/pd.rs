//! Placement-driver boundary: the heartbeat payload a peer emits.

use crate::metadata::PeerMeta;
use crate::metadata::Region;

/// A peer that stopped answering heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub peer: PeerMeta,
    pub down_seconds: u64,
}

/// Everything the placement driver wants to know about one region per
/// heartbeat interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeartbeat {
    pub region: Region,
    pub peer: PeerMeta,
    pub down_peers: Vec<PeerStats>,
    pub pending_peers: Vec<PeerMeta>,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub approximate_size: Option<u64>,
    pub approximate_keys: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdTask {
    Heartbeat(Box<RegionHeartbeat>),
}
