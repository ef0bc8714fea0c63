//! Message delivery boundary.

#[cfg(test)]
use mockall::automock;

use crate::errors::Result;
use crate::metadata::PeerMeta;
use crate::metadata::RegionEpoch;
use crate::metadata::RAFT_INVALID_INDEX;
use crate::raft::Message;
use crate::raft::MessageType;

/// A consensus message wrapped with enough region metadata for the receiving
/// store to route it, or to create the target peer if it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMessage {
    pub region_id: u64,
    pub region_epoch: RegionEpoch,
    pub from_peer: PeerMeta,
    pub to_peer: PeerMeta,
    /// Only attached to initial messages of an initialized peer, so the
    /// receiving store can decide whether to create the peer or wait for a
    /// pending split.
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub message: Message,
}

#[cfg_attr(test, automock)]
pub trait Transport: Send {
    fn send(&mut self, msg: RaftMessage) -> Result<()>;
}

/// Whether `msg` may be the first message the target peer ever receives:
/// request-vote, or a heartbeat probing a peer that has no log yet.
pub fn is_initial_msg(msg: &Message) -> bool {
    matches!(
        msg.msg_type,
        MessageType::RequestVote | MessageType::RequestPreVote
    ) || (msg.msg_type == MessageType::Heartbeat && msg.commit == RAFT_INVALID_INDEX)
}
