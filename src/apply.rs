//! The apply-worker boundary.
//!
//! The controller talks to the committed-entry executor purely by message:
//! it registers itself, ships batches of committed entries, and receives
//! apply results back through [`Peer::post_apply`](crate::peer::Peer::post_apply).

use crate::cmd::Callback;
use crate::metadata::ApplyState;
use crate::metadata::Region;
use crate::raft::Entry;
use crate::storage::GenSnapTask;

/// A proposal waiting for its entry to be applied, carried over to the apply
/// worker so the callback fires with the real apply outcome.
#[derive(Debug)]
pub struct Proposal {
    pub is_conf_change: bool,
    pub index: u64,
    pub term: u64,
    pub cb: Callback,
}

/// All proposals a peer accumulated during one ready cycle.
#[derive(Debug)]
pub struct RegionProposal {
    pub id: u64,
    pub region_id: u64,
    pub props: Vec<Proposal>,
}

impl RegionProposal {
    pub fn new(id: u64, region_id: u64, props: Vec<Proposal>) -> RegionProposal {
        RegionProposal {
            id,
            region_id,
            props,
        }
    }
}

/// One batch of committed entries to execute.
#[derive(Debug)]
pub struct Apply {
    pub region_id: u64,
    pub term: u64,
    pub entries: Vec<Entry>,
}

/// Registers (or re-registers, after a snapshot) a peer with the apply
/// worker.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: u64,
    pub term: u64,
    pub applied_index: u64,
    pub applied_index_term: u64,
    pub region: Region,
}

#[derive(Debug)]
pub enum ApplyMsg {
    Registration(Registration),
    Proposal(RegionProposal),
    Apply(Apply),
    Snapshot(GenSnapTask),
}

/// Buffer of apply messages produced during a tick; the store drains it to
/// the apply worker afterwards.
#[derive(Debug, Default)]
pub struct ApplyMsgs {
    pub msgs: Vec<ApplyMsg>,
}

impl ApplyMsgs {
    pub fn append(&mut self, msg: ApplyMsg) {
        self.msgs.push(msg);
    }
}

/// Statistics one apply batch produced, fed back into the peer's accounting
/// hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyMetrics {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub delete_keys_hint: u64,
    pub size_diff_hint: i64,
}

/// The outcome of one executed apply batch, routed back to the peer through
/// `post_apply` (or buffered while a merge target waits for its source).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyTaskRes {
    pub region_id: u64,
    pub apply_state: ApplyState,
    pub applied_index_term: u64,
    pub merged: bool,
    pub metrics: ApplyMetrics,
}
