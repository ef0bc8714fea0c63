//! The consensus-library boundary.
//!
//! The controller never reaches into a concrete Raft implementation. It
//! drives the group exclusively through the [`RaftNode`] capability trait and
//! the plain data carriers below, so tests can substitute a deterministic
//! fake that scripts ready cycles.

use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateRole {
    #[default]
    Follower,
    Candidate,
    PreCandidate,
    Leader,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryType {
    #[default]
    Normal,
    ConfChange,
}

/// One replicated log entry. `context` is the side-band
/// [`crate::peer::ProposalContext`] byte attached at propose time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Append,
    AppendResponse,
    RequestVote,
    RequestPreVote,
    RequestVoteResponse,
    Heartbeat,
    HeartbeatResponse,
    Snapshot,
    TimeoutNow,
    ReadIndex,
}

/// A consensus protocol message between two peers of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub from: u64,
    pub to: u64,
    pub term: u64,
    pub commit: u64,
}

impl Message {
    pub fn new(msg_type: MessageType, from: u64, to: u64) -> Message {
        Message {
            msg_type,
            from,
            to,
            term: 0,
            commit: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
    AddLearnerNode,
}

/// A membership change handed to the consensus library. `context` carries the
/// marshalled admin command so apply can reconstruct the full request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: u64,
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftState {
    pub leader_id: u64,
    pub raft_state: StateRole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// A quorum-confirmed read: the echoed request context identifies the
/// [`crate::peer::ReadIndexRequest`] it answers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadState {
    pub index: u64,
    pub request_ctx: Vec<u8>,
}

/// Everything the consensus library wants the controller to act on in one
/// cycle: persist, send, apply, answer reads.
#[derive(Debug, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub messages: Vec<Message>,
    pub committed_entries: Vec<Entry>,
    pub read_states: Vec<ReadState>,
    pub snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressState {
    #[default]
    Probe,
    Replicate,
    Snapshot,
}

/// Replication progress of one member as seen by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub matched: u64,
    pub state: ProgressState,
    pub is_learner: bool,
}

/// Leader-side view of the whole group, learners included.
#[derive(Debug, Clone, Default)]
pub struct RaftStatus {
    pub progress: HashMap<u64, Progress>,
}

/// Capability set the controller consumes from the consensus library.
#[cfg_attr(test, automock)]
pub trait RaftNode: Send {
    fn step(&mut self, msg: Message) -> Result<()>;

    /// Appends a proposal with its side-band context. A silent drop is
    /// detected by the caller through [`RaftNode::last_index`] not advancing.
    fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()>;

    fn propose_conf_change(&mut self, context: Vec<u8>, change: ConfChange) -> Result<()>;

    /// Starts a quorum read round; `request_ctx` is echoed back in a
    /// [`ReadState`] once confirmed.
    fn read_index(&mut self, request_ctx: Vec<u8>);

    fn transfer_leader(&mut self, transferee: u64);

    fn campaign(&mut self) -> Result<()>;

    fn has_ready_since(&self, applied_idx: u64) -> bool;

    fn ready_since(&mut self, applied_idx: u64) -> Ready;

    fn advance(&mut self, ready: Ready);

    fn advance_apply(&mut self, applied_idx: u64);

    /// Toggles lazy broadcast of the commit index to followers.
    fn skip_bcast_commit(&mut self, skip: bool);

    fn status(&self) -> RaftStatus;

    /// The snapshot the group has replicated but not yet applied, if any.
    fn snap(&self) -> Option<Snapshot>;

    fn term(&self) -> u64;

    fn leader_id(&self) -> u64;

    fn state(&self) -> StateRole;

    /// Whether the leader believes itself within a check-quorum lease.
    fn in_lease(&self) -> bool;

    fn pending_read_count(&self) -> usize;

    fn ready_read_count(&self) -> usize;

    fn pending_conf_index(&self) -> u64;

    fn last_index(&self) -> u64;

    fn is_learner(&self) -> bool;

    /// Log entries from `low` (inclusive) up to the last index.
    fn log_entries_after(&self, low: u64) -> Result<Vec<Entry>>;
}
