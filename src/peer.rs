//! The per-region peer controller.
//!
//! One `Peer` sits between the consensus library and the durable state
//! machine for a single replica of a single region. It runs strictly
//! single-threaded on the store executor: every tick steps messages, drains
//! a ready, hands write batches back to the store, ships committed entries
//! to the apply worker and resolves the read queues. The only state it
//! shares across threads is the [`LeaderChecker`] snapshot.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::apply::Apply;
use crate::apply::ApplyMetrics;
use crate::apply::ApplyMsg;
use crate::apply::ApplyMsgs;
use crate::apply::ApplyTaskRes;
use crate::apply::Proposal;
use crate::apply::RegionProposal;
use crate::apply::Registration;
use crate::cmd::err_resp;
use crate::cmd::get_change_peer_cmd;
use crate::cmd::get_sync_log_from_request;
use crate::cmd::get_transfer_leader_cmd;
use crate::cmd::is_urgent_request;
use crate::cmd::make_transfer_leader_response;
use crate::cmd::AdminCmdType;
use crate::cmd::AdminRequest;
use crate::cmd::Callback;
use crate::cmd::RaftCmdRequest;
use crate::cmd::RaftCmdResponse;
use crate::cmd::Request;
use crate::config::RaftStoreConfig;
use crate::errors::CmdError;
use crate::errors::Error;
use crate::errors::Result;
use crate::lease::Lease;
use crate::lease::LeaseState;
use crate::metadata::ApplyState;
use crate::metadata::MergeState;
use crate::metadata::PeerMeta;
use crate::metadata::PeerRole;
use crate::metadata::PeerState;
use crate::metadata::Region;
use crate::metadata::INVALID_ID;
use crate::metadata::RAFT_INVALID_INDEX;
use crate::metrics::PEER_ADMIN_CMD_COUNTER;
use crate::metrics::PEER_PROPOSAL_COUNTER;
use crate::metrics::RAFT_READY_COUNTER;
use crate::pd::PdTask;
use crate::pd::PeerStats;
use crate::pd::RegionHeartbeat;
use crate::raft::ConfChange;
use crate::raft::ConfChangeType;
use crate::raft::EntryType;
use crate::raft::Message;
use crate::raft::MessageType;
use crate::raft::Progress;
use crate::raft::ProgressState;
use crate::raft::RaftNode;
use crate::raft::RaftStatus;
use crate::raft::Ready;
use crate::raft::StateRole;
use crate::read::execute_read;
use crate::read::LeaderChecker;
use crate::storage::write_peer_state;
use crate::storage::ApplySnapResult;
use crate::storage::Engines;
use crate::storage::InvokeContext;
use crate::storage::KvEngine;
use crate::storage::PeerStorage;
use crate::storage::WriteBatch;
use crate::transport::is_initial_msg;
use crate::transport::RaftMessage;
use crate::transport::Transport;

/// Health of a follower as judged by `check_stale_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleState {
    Valid,
    /// No leader for so long that membership should be re-validated against
    /// the placement driver.
    ToValidate,
    LeaderMissing,
}

/// A batch of read commands waiting for one quorum confirmation.
#[derive(Debug)]
pub struct ReadIndexRequest {
    pub id: u64,
    pub cmds: Vec<(RaftCmdRequest, Callback)>,
    pub renew_lease_time: Option<Instant>,
}

impl ReadIndexRequest {
    pub fn new(
        id: u64,
        cmds: Vec<(RaftCmdRequest, Callback)>,
        renew_lease_time: Option<Instant>,
    ) -> ReadIndexRequest {
        ReadIndexRequest {
            id,
            cmds,
            renew_lease_time,
        }
    }

    /// The request id as the context handed to the consensus library's
    /// read-index API, echoed back on quorum confirmation.
    pub fn binary_id(&self) -> Vec<u8> {
        self.id.to_be_bytes().to_vec()
    }
}

/// FIFO of outstanding quorum-read batches. `reads[..ready_cnt]` have been
/// confirmed by the consensus layer but not yet answered; the rest are still
/// waiting for quorum.
#[derive(Debug, Default)]
pub struct ReadIndexQueue {
    id_allocator: u64,
    pub reads: VecDeque<ReadIndexRequest>,
    pub ready_cnt: usize,
}

impl ReadIndexQueue {
    pub fn next_id(&mut self) -> u64 {
        self.id_allocator += 1;
        self.id_allocator
    }

    pub fn pop_front(&mut self) -> Option<ReadIndexRequest> {
        self.reads.pop_front()
    }

    /// Drops every request still waiting for quorum, answering each with a
    /// stale-command error. Confirmed requests stay queued.
    pub fn clear_uncommitted(&mut self, term: u64) {
        for mut read in self.reads.split_off(self.ready_cnt) {
            for (_, cb) in read.cmds.drain(..) {
                notify_stale_req(term, cb);
            }
        }
    }
}

/// Responds with a stale-command error bound to `term`.
pub fn notify_stale_req(term: u64, cb: Callback) {
    cb.done(err_resp(CmdError::StaleCommand, term));
}

/// Responds with a region-not-found error.
pub fn notify_req_region_removed(region_id: u64, cb: Callback) {
    cb.done(err_resp(CmdError::RegionNotFound { region_id }, 0));
}

/// Record of one in-flight proposal, consumed when the matching entry
/// commits (used for lease renewal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalMeta {
    pub index: u64,
    pub term: u64,
    pub renew_lease_time: Option<Instant>,
}

/// Ordered record of in-flight proposals keyed by `(term, index)`.
#[derive(Debug, Default)]
pub struct ProposalQueue {
    queue: VecDeque<ProposalMeta>,
}

impl ProposalQueue {
    /// Pops the head only when its term is not beyond `term`; heads of a
    /// future term cannot match any entry committed at `term`.
    pub fn pop_front(&mut self, term: u64) -> Option<ProposalMeta> {
        match self.queue.front() {
            Some(meta) if meta.term <= term => self.queue.pop_front(),
            _ => None,
        }
    }

    pub fn push(&mut self, meta: ProposalMeta) {
        self.queue.push_back(meta);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A one-byte bitset piggy-backed on every log entry, reconciled at apply
/// time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProposalContext(u8);

impl ProposalContext {
    pub const SYNC_LOG: ProposalContext = ProposalContext(0x01);
    pub const SPLIT: ProposalContext = ProposalContext(0x02);
    pub const PREPARE_MERGE: ProposalContext = ProposalContext(0x04);

    pub fn contains(self, flag: ProposalContext) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: ProposalContext) {
        self.0 |= flag.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Zero bytes for an empty context, one byte otherwise.
    pub fn to_vec(self) -> Vec<u8> {
        if self.0 == 0 {
            vec![]
        } else {
            vec![self.0]
        }
    }

    /// An entry context longer than one byte can only be corruption.
    pub fn from_bytes(ctx: &[u8]) -> Option<ProposalContext> {
        match ctx.len() {
            0 => None,
            1 => Some(ProposalContext(ctx[0])),
            _ => panic!("invalid proposal context {ctx:?}"),
        }
    }
}

/// Time-windowed veto against transferring leadership to a member that was
/// added too recently to have caught up.
#[derive(Debug)]
pub struct RecentAddedPeer {
    pub reject_duration: Duration,
    pub id: u64,
    pub added_time: Instant,
}

impl RecentAddedPeer {
    pub fn new(reject_duration: Duration) -> RecentAddedPeer {
        RecentAddedPeer {
            reject_duration,
            id: INVALID_ID,
            added_time: Instant::now(),
        }
    }

    pub fn update(&mut self, id: u64, now: Instant) {
        self.id = id;
        self.added_time = now;
    }

    pub fn contains(&self, id: u64) -> bool {
        id == self.id && self.added_time.elapsed() < self.reject_duration
    }
}

/// Progress of the background consistency check.
#[derive(Debug)]
pub struct ConsistencyState {
    pub last_check_time: Instant,
    pub index: u64,
    pub hash: Vec<u8>,
}

/// Written bytes and keys since the last heartbeat reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStat {
    pub written_bytes: u64,
    pub written_keys: u64,
}

/// Buffered apply results of a merge target that must wait for the source
/// peer's `PrepareMerge` result before they can be handled.
#[derive(Debug, Default)]
pub struct WaitApplyResultState {
    pub results: Vec<ApplyTaskRes>,
    pub ready_to_merge: Arc<AtomicBool>,
}

/// Plan produced by `maybe_destroy`: what the store still has to clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyPeerJob {
    pub initialized: bool,
    pub async_remove: bool,
    pub region_id: u64,
    pub peer: PeerMeta,
}

/// Handle the store registers with foreign reader paths.
#[derive(Clone)]
pub struct PeerEventContext {
    pub leader_checker: Arc<LeaderChecker>,
    pub region_id: u64,
}

/// Notified whenever a ready cycle observes a role change.
pub trait PeerEventObserver: Send {
    fn on_role_change(&self, region_id: u64, role: StateRole);
}

/// Majority size of a group of `total` voters.
pub fn quorum(total: usize) -> usize {
    total / 2 + 1
}

/// How an incoming command must be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPolicy {
    /// Serve the read directly from the local engine.
    ReadLocal,
    /// Serve the read through the consensus read-index mechanism.
    ReadIndex,
    ProposeNormal,
    ProposeTransferLeader,
    ProposeConfChange,
    Invalid,
}

/// The two questions request classification needs answered by its caller.
pub trait RequestInspector {
    /// Has an entry of the current term already been applied?
    fn has_applied_to_current_term(&self) -> bool;

    fn inspect_lease(&mut self) -> LeaseState;
}

/// Maps a command onto its [`RequestPolicy`].
pub fn inspect<I: RequestInspector + ?Sized>(
    inspector: &mut I,
    req: &RaftCmdRequest,
) -> std::result::Result<RequestPolicy, CmdError> {
    if let Some(admin) = &req.admin_request {
        return Ok(match admin.cmd_type() {
            AdminCmdType::ChangePeer => RequestPolicy::ProposeConfChange,
            AdminCmdType::TransferLeader => RequestPolicy::ProposeTransferLeader,
            _ => RequestPolicy::ProposeNormal,
        });
    }

    let mut has_read = false;
    let mut has_write = false;
    for request in &req.requests {
        match request {
            Request::Get { .. } | Request::Snap => has_read = true,
            Request::Put { .. }
            | Request::Delete { .. }
            | Request::DeleteRange { .. }
            | Request::IngestSst { .. } => has_write = true,
            Request::Prewrite | Request::Invalid => {
                return Err(CmdError::Other(
                    "invalid cmd type, message maybe corrupted".to_owned(),
                ));
            }
        }
        if has_read && has_write {
            return Err(CmdError::Other(
                "read and write can't be mixed in one batch".to_owned(),
            ));
        }
    }

    if has_write {
        return Ok(RequestPolicy::ProposeNormal);
    }

    if req.header.read_quorum {
        return Ok(RequestPolicy::ReadIndex);
    }

    // If the applied index's term differs from the current term, a leader
    // transfer must have happened and a local read could return old values.
    if !inspector.has_applied_to_current_term() {
        return Ok(RequestPolicy::ReadIndex);
    }

    match inspector.inspect_lease() {
        LeaseState::Valid => Ok(RequestPolicy::ReadLocal),
        LeaseState::Expired | LeaseState::Suspect => Ok(RequestPolicy::ReadIndex),
    }
}

/// The controller for one replica of one region.
pub struct Peer {
    pub meta: PeerMeta,
    pub(crate) region_id: u64,
    raft_group: Box<dyn RaftNode>,
    peer_storage: Box<dyn PeerStorage>,
    pub(crate) proposals: ProposalQueue,
    pub(crate) apply_proposals: Vec<Proposal>,
    pub(crate) pending_reads: ReadIndexQueue,

    pub(crate) peer_cache: HashMap<u64, PeerMeta>,

    /// Last heartbeat-response instant of each member.
    pub peer_heartbeats: HashMap<u64, Instant>,

    /// When each still-pending member entered the pending state; entries are
    /// removed once the member catches up.
    pub peers_start_pending_time: HashMap<u64, Instant>,
    pub recent_added_peer: RecentAddedPeer,

    /// Inaccurate size delta of the region since the last reset.
    pub size_diff_hint: u64,
    pub(crate) delete_keys_hint: u64,
    pub approximate_size: Option<u64>,
    pub approximate_keys: Option<u64>,
    pub compaction_declined_bytes: u64,

    pub consistency_state: ConsistencyState,

    pub tag: String,

    /// Index of the last committed entry scheduled for apply.
    pub last_applying_idx: u64,
    pub last_compacted_idx: u64,
    pub(crate) last_urgent_proposal_idx: u64,
    pub(crate) last_committed_split_idx: u64,
    /// Approximate size of applied-but-not-compacted log.
    pub raft_log_size_hint: u64,

    pub pending_remove: bool,

    pub(crate) last_committed_prepare_merge_idx: u64,
    pub pending_merge_state: Option<MergeState>,
    pub(crate) leader_missing_time: Option<Instant>,
    pub(crate) leader_lease: Lease,
    leader_checker: Arc<LeaderChecker>,

    /// Messages buffered while a snapshot is applied asynchronously.
    pub(crate) pending_messages: Vec<Message>,
    pub pending_merge_apply_result: Option<WaitApplyResultState>,
    pub peer_stat: PeerStat,
}

impl Peer {
    pub fn new(
        store_id: u64,
        cfg: &RaftStoreConfig,
        peer_storage: Box<dyn PeerStorage>,
        raft_group: Box<dyn RaftNode>,
        peer: PeerMeta,
    ) -> Result<Peer> {
        if peer.id == INVALID_ID {
            return Err(Error::Other("invalid peer id".to_owned()));
        }
        let region = peer_storage.region().clone();
        let tag = format!("[region {}] {}", region.id, peer.id);
        let applied_index = peer_storage.applied_index();
        let applied_index_term = peer_storage.applied_index_term();

        let leader_checker = Arc::new(LeaderChecker::new(
            peer.id,
            raft_group.term(),
            applied_index_term,
            region.clone(),
        ));

        let mut peer = Peer {
            region_id: region.id,
            raft_group,
            peer_storage,
            proposals: ProposalQueue::default(),
            apply_proposals: vec![],
            pending_reads: ReadIndexQueue::default(),
            peer_cache: HashMap::new(),
            peer_heartbeats: HashMap::new(),
            peers_start_pending_time: HashMap::new(),
            recent_added_peer: RecentAddedPeer::new(cfg.raft_reject_transfer_leader_duration()),
            size_diff_hint: 0,
            delete_keys_hint: 0,
            approximate_size: None,
            approximate_keys: None,
            compaction_declined_bytes: 0,
            consistency_state: ConsistencyState {
                last_check_time: Instant::now(),
                index: RAFT_INVALID_INDEX,
                hash: vec![],
            },
            tag,
            last_applying_idx: applied_index,
            last_compacted_idx: 0,
            last_urgent_proposal_idx: u64::MAX,
            last_committed_split_idx: 0,
            raft_log_size_hint: 0,
            pending_remove: false,
            last_committed_prepare_merge_idx: 0,
            pending_merge_state: None,
            leader_missing_time: Some(Instant::now()),
            leader_lease: Lease::new(cfg.raft_store_max_leader_lease()),
            leader_checker,
            pending_messages: vec![],
            pending_merge_apply_result: None,
            peer_stat: PeerStat::default(),
            meta: peer,
        };

        // A region whose only peer lives on this store can elect itself
        // without waiting for an election timeout.
        if region.peers.len() == 1 && region.peers[0].store_id == store_id {
            peer.raft_group.campaign().map_err(|e| {
                Error::Raft(format!("{} campaign at creation failed: {}", peer.tag, e))
            })?;
        }

        Ok(peer)
    }

    pub fn get_event_context(&self) -> PeerEventContext {
        PeerEventContext {
            leader_checker: self.leader_checker.clone(),
            region_id: self.region_id,
        }
    }

    /// Shared handle reader threads use to authorize local reads.
    pub fn leader_checker(&self) -> Arc<LeaderChecker> {
        self.leader_checker.clone()
    }

    /// Memoizes a peer for transport lookups; the store calls this when a
    /// membership change is applied.
    pub fn insert_peer_cache(&mut self, peer: PeerMeta) {
        self.peer_cache.insert(peer.id, peer);
    }

    pub fn remove_peer_cache(&mut self, peer_id: u64) {
        self.peer_cache.remove(&peer_id);
    }

    pub(crate) fn get_peer_from_cache(&mut self, peer_id: u64) -> Option<PeerMeta> {
        if let Some(peer) = self.peer_cache.get(&peer_id) {
            return Some(peer.clone());
        }
        let found = self
            .peer_storage
            .region()
            .get_peer(peer_id)
            .cloned();
        if let Some(peer) = &found {
            self.peer_cache.insert(peer_id, peer.clone());
        }
        found
    }

    /// Registers the peer with the apply pipeline, making it usable.
    pub fn activate(&self, apply_msgs: &mut ApplyMsgs) {
        apply_msgs.append(ApplyMsg::Registration(Registration {
            id: self.meta.id,
            term: self.term(),
            applied_index: self.peer_storage.applied_index(),
            applied_index_term: self.peer_storage.applied_index_term(),
            region: self.peer_storage.region().clone(),
        }));
    }

    fn next_proposal_index(&self) -> u64 {
        self.raft_group.last_index() + 1
    }

    /// Plans destruction. Returns `None` while a snapshot application cannot
    /// be cancelled; the caller retries later.
    pub fn maybe_destroy(&mut self) -> Option<DestroyPeerJob> {
        if self.pending_remove {
            info!("{} is being destroyed, skip", self.tag);
            return None;
        }
        let initialized = self.peer_storage.is_initialized();
        let async_remove = if self.is_applying_snapshot() {
            if !self.peer_storage.cancel_applying_snap() {
                info!("{} stale peer {} is applying snapshot", self.tag, self.meta.id);
                return None;
            }
            // No task is left in the apply worker for this peer.
            false
        } else {
            initialized
        };
        self.pending_remove = true;
        self.leader_checker.set_invalid();

        Some(DestroyPeerJob {
            initialized,
            async_remove,
            region_id: self.region_id,
            peer: self.meta.clone(),
        })
    }

    /// Destroys the peer: writes the tombstone, clears data, fails every
    /// pending request with region-not-found.
    pub fn destroy(&mut self, engines: &Engines, keep_data: bool) -> Result<()> {
        let start = Instant::now();
        let region = self.region().clone();
        info!("{} begin to destroy", self.tag);

        let mut kv_wb = WriteBatch::new();
        let mut raft_wb = WriteBatch::new();
        self.peer_storage.clear_meta(&mut kv_wb, &mut raft_wb)?;
        write_peer_state(
            &mut kv_wb,
            &region,
            PeerState::Tombstone,
            self.pending_merge_state.clone(),
        )?;
        // Commit to the KV engine first: should a restart hit between the
        // two writes, the tombstone already forbids resurrecting the region.
        engines.kv.write(&kv_wb)?;
        engines.raft.write(&raft_wb)?;

        if self.peer_storage.is_initialized() && !keep_data {
            // Residue left by a failed clear is swept by a newer snapshot
            // application or a restart.
            if let Err(e) = self.peer_storage.clear_data() {
                error!("{} failed to schedule clear data task: {}", self.tag, e);
            }
        }

        for mut read in self.pending_reads.reads.drain(..) {
            for (_, cb) in read.cmds.drain(..) {
                notify_req_region_removed(region.id, cb);
            }
        }
        self.pending_reads.ready_cnt = 0;

        for proposal in self.apply_proposals.drain(..) {
            notify_req_region_removed(region.id, proposal.cb);
        }

        info!("{} destroy itself, takes {:?}", self.tag, start.elapsed());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.peer_storage.is_initialized()
    }

    pub fn region(&self) -> &Region {
        self.peer_storage.region()
    }

    /// Installs a new region value. The caller must have persisted it
    /// already.
    pub fn set_region(&mut self, region: Region) {
        if self.region().epoch.version < region.epoch.version {
            // The range changed; remote readers must stop serving the old
            // one immediately.
            self.leader_lease.expire_remote_lease();
        }
        self.peer_storage.set_region(region.clone());

        // Keep the checker's region fresh even on followers, otherwise a
        // promotion to leader would expose stale metadata.
        if !self.pending_remove {
            self.leader_checker.store_region(region);
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.meta.id
    }

    pub fn leader_id(&self) -> u64 {
        self.raft_group.leader_id()
    }

    pub fn is_leader(&self) -> bool {
        self.raft_group.state() == StateRole::Leader
    }

    pub fn get_role(&self) -> StateRole {
        self.raft_group.state()
    }

    pub fn raft_status(&self) -> RaftStatus {
        self.raft_group.status()
    }

    pub fn term(&self) -> u64 {
        self.raft_group.term()
    }

    pub fn storage(&self) -> &dyn PeerStorage {
        self.peer_storage.as_ref()
    }

    pub fn is_applying_snapshot(&self) -> bool {
        self.peer_storage.is_applying_snapshot()
    }

    /// Whether the group has replicated a snapshot that is not applied yet.
    pub fn has_pending_snapshot(&self) -> bool {
        self.raft_group.snap().is_some()
    }

    /// Cancels an in-flight snapshot application, best effort.
    pub fn stop(&mut self) {
        self.peer_storage.cancel_applying_snap();
    }

    pub(crate) fn send(
        &mut self,
        trans: &mut dyn Transport,
        msgs: Vec<Message>,
    ) -> Result<()> {
        for msg in msgs {
            let msg_type = msg.msg_type;
            self.send_raft_message(msg, trans)?;
            if msg_type == MessageType::TimeoutNow {
                // A leader transfer is in flight; a new leader may be
                // elected while this one still thinks it holds the lease, so
                // park it in suspect until the new term is acknowledged.
                self.leader_lease.suspect(Instant::now());
            }
        }
        Ok(())
    }

    fn send_raft_message(&mut self, msg: Message, trans: &mut dyn Transport) -> Result<()> {
        let to_peer = self.get_peer_from_cache(msg.to).ok_or_else(|| {
            Error::Other(format!(
                "failed to lookup recipient peer {} in region {}",
                msg.to, self.region_id
            ))
        })?;
        let from_peer = self.meta.clone();
        debug!(
            "{} send raft msg {:?} from {} to {}",
            self.tag, msg.msg_type, from_peer.id, to_peer.id
        );

        let region = self.peer_storage.region();
        let mut send_msg = RaftMessage {
            region_id: self.region_id,
            region_epoch: region.epoch,
            from_peer,
            to_peer,
            start_key: vec![],
            end_key: vec![],
            message: msg,
        };
        // The target peer may not exist yet (fresh membership change or
        // pending split); initial messages carry the range so the receiving
        // store can decide whether to create it.
        if self.peer_storage.is_initialized() && is_initial_msg(&send_msg.message) {
            send_msg.start_key = region.start_key.clone();
            send_msg.end_key = region.end_key.clone();
        }
        trans.send(send_msg)
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        if self.is_leader() && msg.from != INVALID_ID {
            self.peer_heartbeats.insert(msg.from, Instant::now());
            // As the leader we know we are not missing.
            self.leader_missing_time = None;
        } else if msg.from == self.leader_id() {
            self.leader_missing_time = None;
        }
        self.raft_group.step(msg)
    }

    /// Seeds heartbeat records for members that never responded yet.
    pub fn check_peers(&mut self) {
        if !self.is_leader() {
            if !self.peer_heartbeats.is_empty() {
                self.peer_heartbeats.clear();
            }
            return;
        }
        if self.peer_heartbeats.len() == self.region().peers.len() {
            return;
        }
        let now = Instant::now();
        let peer_ids: Vec<u64> = self.region().peers.iter().map(|p| p.id).collect();
        for id in peer_ids {
            self.peer_heartbeats.entry(id).or_insert(now);
        }
    }

    pub fn collect_down_peers(&self, max_duration: Duration) -> Vec<PeerStats> {
        let mut down_peers = vec![];
        for peer in &self.peer_storage.region().peers {
            if peer.id == self.meta.id {
                continue;
            }
            if let Some(hb) = self.peer_heartbeats.get(&peer.id) {
                let elapsed = hb.elapsed();
                if elapsed > max_duration {
                    down_peers.push(PeerStats {
                        peer: peer.clone(),
                        down_seconds: elapsed.as_secs(),
                    });
                }
            }
        }
        down_peers
    }

    /// Members whose match index fell below the truncation point: they need
    /// a snapshot, not just log replication.
    pub fn collect_pending_peers(&mut self) -> Vec<PeerMeta> {
        let status = self.raft_group.status();
        let truncated_idx = self.peer_storage.truncated_index();
        let mut pending_peers = Vec::with_capacity(status.progress.len());
        for (&id, progress) in &status.progress {
            if id == self.meta.id {
                continue;
            }
            if progress.matched < truncated_idx {
                if let Some(peer) = self.get_peer_from_cache(id) {
                    pending_peers.push(peer);
                    if !self.peers_start_pending_time.contains_key(&id) {
                        let now = Instant::now();
                        self.peers_start_pending_time.insert(id, now);
                        debug!("{} peer {} start pending at {:?}", self.tag, id, now);
                    }
                }
            }
        }
        pending_peers
    }

    fn clear_peers_start_pending_time(&mut self) {
        self.peers_start_pending_time.clear();
    }

    /// Returns `true` and clears the pending mark once `peer_id` replicated
    /// past the truncation point.
    pub fn any_new_peer_catch_up(&mut self, peer_id: u64) -> bool {
        if self.peers_start_pending_time.is_empty() {
            return false;
        }
        if !self.is_leader() {
            self.clear_peers_start_pending_time();
            return false;
        }
        if let Some(&start) = self.peers_start_pending_time.get(&peer_id) {
            let truncated_idx = self.peer_storage.truncated_index();
            let status = self.raft_group.status();
            if let Some(progress) = status.progress.get(&peer_id) {
                if progress.matched >= truncated_idx {
                    self.peers_start_pending_time.remove(&peer_id);
                    debug!(
                        "{} peer {} has caught up logs, elapsed: {:?}",
                        self.tag,
                        peer_id,
                        start.elapsed()
                    );
                    return true;
                }
            }
        }
        false
    }

    pub fn check_stale_state(&mut self, cfg: &RaftStoreConfig) -> StaleState {
        if self.is_leader() {
            // Leaders always have a valid state. A single-peer region never
            // steps messages, so the timer must also be reset here.
            self.leader_missing_time = None;
            return StaleState::Valid;
        }
        let naive_peer = !self.is_initialized() || self.raft_group.is_learner();
        let leader_missing = match self.leader_missing_time {
            Some(t) => t,
            None => {
                self.leader_missing_time = Some(Instant::now());
                return StaleState::Valid;
            }
        };
        let elapsed = leader_missing.elapsed();
        if elapsed >= cfg.max_leader_missing_duration() {
            // Reset the timer so the same report is not repeated every tick.
            self.leader_missing_time = Some(Instant::now());
            StaleState::ToValidate
        } else if elapsed >= cfg.abnormal_leader_missing_duration() && !naive_peer {
            StaleState::LeaderMissing
        } else {
            StaleState::Valid
        }
    }

    pub fn on_role_changed(&mut self, observer: &dyn PeerEventObserver, ready: &Ready) {
        if let Some(ss) = &ready.soft_state {
            match ss.raft_state {
                StateRole::Leader => {
                    // Local reads only become legal once the first entry of
                    // this term is applied; renewing here is still correct
                    // and saves a round later.
                    self.maybe_renew_leader_lease(Instant::now());
                    if !self.pending_remove {
                        self.leader_checker.store_term(self.term());
                    }
                    observer.on_role_change(self.region_id, ss.raft_state);
                }
                StateRole::Follower => {
                    self.leader_lease.expire();
                    observer.on_role_change(self.region_id, ss.raft_state);
                }
                _ => {}
            }
        }
    }

    /// Whether the apply pipeline has drained enough for a pending snapshot
    /// to be installed. The committed index is useless here: a stale
    /// heartbeat can advance it while the snapshot is still in flight.
    pub fn ready_to_handle_pending_snap(&self) -> bool {
        self.last_applying_idx == self.peer_storage.applied_index()
    }

    /// Reads must not be served while an old leader's tail is unapplied or a
    /// split/merge is between commit and apply, or stale values could leak.
    fn ready_to_handle_read(&self) -> bool {
        self.peer_storage.applied_index_term() == self.term()
            && !self.is_splitting()
            && !self.is_merging()
    }

    pub(crate) fn is_splitting(&self) -> bool {
        self.last_committed_split_idx > self.peer_storage.applied_index()
    }

    pub(crate) fn is_merging(&self) -> bool {
        self.last_committed_prepare_merge_idx > self.peer_storage.applied_index()
            || self.pending_merge_state.is_some()
    }

    /// Hands the buffered proposals over for the apply worker.
    pub fn take_apply_proposals(&mut self) -> Option<RegionProposal> {
        if self.apply_proposals.is_empty() {
            return None;
        }
        let props = std::mem::take(&mut self.apply_proposals);
        Some(RegionProposal::new(self.peer_id(), self.region_id, props))
    }

    /// Drives one ready cycle up to the point where the store must flush the
    /// write batches. Returns the ready and the storage invoke context, or
    /// `None` when there is nothing to do this tick.
    pub fn handle_raft_ready_append(
        &mut self,
        trans: &mut dyn Transport,
        apply_msgs: &mut ApplyMsgs,
        kv_wb: &mut WriteBatch,
        raft_wb: &mut WriteBatch,
        observer: &dyn PeerEventObserver,
    ) -> Option<(Ready, InvokeContext)> {
        if self.pending_remove {
            return None;
        }
        if self.peer_storage.check_applying_snap() {
            // Handling more messages now would make the leader flood this
            // peer with the remaining log, overflowing the message queue.
            debug!("{} still applying snapshot, skip further handling", self.tag);
            return None;
        }

        if !self.pending_messages.is_empty() {
            let messages = std::mem::take(&mut self.pending_messages);
            if let Err(e) = self.send(trans, messages) {
                warn!("{} clear snapshot pending messages err: {}", self.tag, e);
            }
        }

        if self.has_pending_snapshot() && !self.ready_to_handle_pending_snap() {
            debug!(
                "{} [apply_idx: {}, last_applying_idx: {}] is not ready to apply snapshot",
                self.tag,
                self.peer_storage.applied_index(),
                self.last_applying_idx
            );
            return None;
        }

        if let Some(task) = self.peer_storage.take_gen_snap_task() {
            apply_msgs.append(ApplyMsg::Snapshot(task));
        }

        if !self.raft_group.has_ready_since(self.last_applying_idx) {
            return None;
        }

        debug!("{} handle raft ready", self.tag);
        RAFT_READY_COUNTER.with_label_values(&["append"]).inc();

        let mut ready = self.raft_group.ready_since(self.last_applying_idx);
        self.on_role_changed(observer, &ready);

        // The leader may write to disk and replicate to the followers
        // concurrently (Raft thesis 10.2.1).
        if self.is_leader() {
            let messages = std::mem::take(&mut ready.messages);
            if let Err(e) = self.send(trans, messages) {
                warn!("{} leader send message err: {}", self.tag, e);
            }
        }

        let invoke_ctx = match self.peer_storage.save_ready_state(kv_wb, raft_wb, &ready) {
            Ok(ctx) => ctx,
            // In-memory state must always reflect the disk; there is no way
            // to continue from a failed persist.
            Err(e) => panic!("{} failed to handle raft ready: {:?}", self.tag, e),
        };
        Some((ready, invoke_ctx))
    }

    /// Updates in-memory state after the store flushed the write batches.
    pub fn post_raft_ready_persistent(
        &mut self,
        trans: &mut dyn Transport,
        apply_msgs: &mut ApplyMsgs,
        ready: &mut Ready,
        invoke_ctx: InvokeContext,
    ) -> Option<ApplySnapResult> {
        if invoke_ctx.has_snapshot() {
            // The snapshot replaced the log; nothing is applied but
            // uncompacted any more.
            self.raft_log_size_hint = 0;
        }

        let apply_snap_result = self.peer_storage.post_ready_persistent(invoke_ctx);
        if apply_snap_result.is_some() && self.meta.role == PeerRole::Learner {
            // The snapshot may have promoted this learner to voter.
            let new_meta = self
                .peer_storage
                .region()
                .get_peer(self.meta.id)
                .cloned();
            if let Some(new_meta) = new_meta {
                if new_meta != self.meta {
                    info!(
                        "{} meta changed in applying snapshot, before {:?}, after {:?}",
                        self.tag, self.meta, new_meta
                    );
                    self.meta = new_meta;
                }
            }
        }

        if !self.is_leader() {
            let messages = std::mem::take(&mut ready.messages);
            if self.is_applying_snapshot() {
                self.pending_messages = messages;
            } else if let Err(e) = self.send(trans, messages) {
                warn!("{} follower send messages err: {}", self.tag, e);
            }
        }

        if apply_snap_result.is_some() {
            self.activate(apply_msgs);
        }

        apply_snap_result
    }

    /// Renews the lease and publishes a remote handle for foreign readers.
    /// A non-leader, splitting or merging peer never holds a live lease.
    pub fn maybe_renew_leader_lease(&mut self, ts: Instant) {
        if !self.is_leader() || self.is_splitting() || self.is_merging() {
            return;
        }
        self.leader_lease.renew(ts);
        if let Some(remote) = self.leader_lease.maybe_new_remote_lease(self.term()) {
            if !self.pending_remove {
                self.leader_checker.store_remote_lease(Some(Arc::new(remote)));
            }
        }
    }

    /// A split-born peer whose parent was leader campaigns immediately; it
    /// is the natural leader of the new region.
    pub fn maybe_campaign(&mut self, parent_is_leader: bool) -> bool {
        if self.region().peers.len() <= 1 || !parent_is_leader {
            // The peer already campaigned at creation when alone.
            return false;
        }
        if let Err(e) = self.raft_group.campaign() {
            error!("{} campaign failed: {}", self.tag, e);
        }
        true
    }

    /// Finds the propose time recorded for `(index, term)`, discarding
    /// proposals of earlier terms that never committed.
    fn find_propose_time(&mut self, index: u64, term: u64) -> Option<Instant> {
        loop {
            let meta = self.proposals.pop_front(term)?;
            if meta.index == index && meta.term == term {
                return meta.renew_lease_time;
            }
        }
    }

    /// Emits the region heartbeat to the placement-driver scheduler.
    pub fn heartbeat_pd(&mut self, pd_scheduler: &mpsc::UnboundedSender<PdTask>) {
        let down_peers = self.collect_down_peers(Duration::from_secs(5 * 60));
        let pending_peers = self.collect_pending_peers();
        let task = PdTask::Heartbeat(Box::new(RegionHeartbeat {
            region: self.peer_storage.region().clone(),
            peer: self.meta.clone(),
            down_peers,
            pending_peers,
            written_bytes: self.peer_stat.written_bytes,
            written_keys: self.peer_stat.written_keys,
            approximate_size: self.approximate_size,
            approximate_keys: self.approximate_keys,
        }));
        if pd_scheduler.send(task).is_err() {
            warn!("{} failed to schedule pd heartbeat", self.tag);
        }
    }

    /// Dispatches the ready's committed entries to the apply worker and
    /// resolves confirmed reads.
    pub fn handle_raft_ready_apply(
        &mut self,
        kv: &dyn KvEngine,
        apply_msgs: &mut ApplyMsgs,
        mut ready: Ready,
    ) {
        if self.is_applying_snapshot() {
            // The snapshot carries its own apply state; committed entries
            // handed out now would be wiped by the asynchronous application
            // while raft's soft state already advanced, so none are taken.
            self.last_applying_idx = self.peer_storage.truncated_index();
            RAFT_READY_COUNTER.with_label_values(&["snapshot"]).inc();
        } else {
            let committed_entries = std::mem::take(&mut ready.committed_entries);
            // The leader needs to renew its lease and track committed
            // split/merge commands.
            let mut lease_to_be_updated = self.is_leader();
            let mut split_to_be_updated = self.is_leader();
            let mut merge_to_be_updated = self.is_leader();
            if !lease_to_be_updated {
                // Not leader any more: old proposals are meaningless. Should
                // this peer win a later election, the lease is renewed from
                // fresh proposals.
                self.proposals.clear();
            }
            for entry in &committed_entries {
                // The raft meta of an entry is tiny compared to its data.
                self.raft_log_size_hint += entry.data.len() as u64;
                if lease_to_be_updated {
                    if let Some(propose_time) = self.find_propose_time(entry.index, entry.term) {
                        self.maybe_renew_leader_lease(propose_time);
                        lease_to_be_updated = false;
                    }
                }

                // Only split/merge commands committed in the current term
                // matter.
                if entry.term == self.term() && (split_to_be_updated || merge_to_be_updated) {
                    if let Some(proposal_ctx) = ProposalContext::from_bytes(&entry.context) {
                        if split_to_be_updated && proposal_ctx.contains(ProposalContext::SPLIT) {
                            // Peers of the new region on other stores will
                            // not start an election before their timeout,
                            // which outlasts the lease: reading within the
                            // current lease stays safe, renewing it does not.
                            self.last_committed_split_idx = entry.index;
                            split_to_be_updated = false;
                        }
                        if merge_to_be_updated
                            && proposal_ctx.contains(ProposalContext::PREPARE_MERGE)
                        {
                            // Once prepare-merge commits, this leader cannot
                            // know when the target region takes over writes.
                            self.last_committed_prepare_merge_idx = entry.index;
                            self.leader_lease.suspect(Instant::now());
                            merge_to_be_updated = false;
                        }
                    }
                }
            }

            if let Some(last) = committed_entries.last() {
                self.last_applying_idx = last.index;
                if self.last_applying_idx >= self.last_urgent_proposal_idx {
                    // Urgent requests are flushed; commits may be broadcast
                    // lazily again.
                    self.raft_group.skip_bcast_commit(true);
                    self.last_urgent_proposal_idx = u64::MAX;
                }
                RAFT_READY_COUNTER.with_label_values(&["apply"]).inc();
                apply_msgs.append(ApplyMsg::Apply(Apply {
                    region_id: self.region_id,
                    term: self.term(),
                    entries: committed_entries,
                }));
            }
        }

        self.apply_reads(kv, &ready);

        self.raft_group.advance(ready);
        if self.is_applying_snapshot() {
            // Readies are not handled while applying a snapshot, so this is
            // never reached twice for the same one.
            self.raft_group.advance_apply(self.last_applying_idx);
        }
    }

    /// Pairs each quorum-confirmed read state with the queue head. When the
    /// peer cannot serve reads yet, only the ready prefix is advanced and
    /// the requests drain later in [`Peer::post_apply`].
    fn apply_reads(&mut self, kv: &dyn KvEngine, ready: &Ready) {
        let mut propose_time = None;
        if self.ready_to_handle_read() {
            for state in &ready.read_states {
                let mut read = self.pending_reads.pop_front().expect("read should exist");
                assert_eq!(
                    state.request_ctx,
                    read.binary_id(),
                    "{} request ctx does not match read id",
                    self.tag
                );
                for (req, cb) in read.cmds.drain(..) {
                    let resp = self.handle_read(kv, &req, true);
                    cb.done(resp);
                }
                propose_time = read.renew_lease_time;
            }
        } else {
            for state in &ready.read_states {
                let ready_cnt = self.pending_reads.ready_cnt;
                let read = &self.pending_reads.reads[ready_cnt];
                assert_eq!(
                    state.request_ctx,
                    read.binary_id(),
                    "{} request ctx does not match read id",
                    self.tag
                );
                propose_time = read.renew_lease_time;
                self.pending_reads.ready_cnt += 1;
            }
        }

        // Only after pairing the read states is it known which requests are
        // actually stale.
        if ready.soft_state.is_some() {
            // Uncommitted reads were dropped silently inside raft.
            let term = self.term();
            self.pending_reads.clear_uncommitted(term);
        }

        if let Some(propose_time) = propose_time {
            // While suspect the propose time is a placeholder; renewing from
            // it would resurrect a lease the suspicion just disabled.
            if self.leader_lease.inspect(Some(propose_time)) == LeaseState::Suspect {
                return;
            }
            self.maybe_renew_leader_lease(propose_time);
        }
    }

    /// Folds one apply result back into the controller. Returns whether a
    /// new ready cycle should run immediately (a pending snapshot became
    /// installable).
    pub fn post_apply(
        &mut self,
        kv: &dyn KvEngine,
        apply_state: ApplyState,
        applied_index_term: u64,
        merged: bool,
        metrics: &ApplyMetrics,
    ) -> bool {
        let mut has_ready = false;
        if self.is_applying_snapshot() {
            panic!("{} should not applying snapshot", self.tag);
        }

        if !merged {
            self.raft_group.advance_apply(apply_state.applied_index);
        }

        let progress_to_be_updated =
            self.peer_storage.applied_index_term() != applied_index_term;
        self.peer_storage.set_apply_state(apply_state, applied_index_term);

        self.peer_stat.written_bytes += metrics.written_bytes;
        self.peer_stat.written_keys += metrics.written_keys;
        self.delete_keys_hint += metrics.delete_keys_hint;
        let diff = self.size_diff_hint as i64 + metrics.size_diff_hint;
        self.size_diff_hint = diff.max(0) as u64;

        if self.has_pending_snapshot() && self.ready_to_handle_pending_snap() {
            has_ready = true;
        }

        if self.pending_reads.ready_cnt > 0 && self.ready_to_handle_read() {
            for _ in 0..self.pending_reads.ready_cnt {
                let mut read = self.pending_reads.pop_front().expect("read should exist");
                for (req, cb) in read.cmds.drain(..) {
                    let resp = self.handle_read(kv, &req, true);
                    cb.done(resp);
                }
            }
            self.pending_reads.ready_cnt = 0;
        }

        // Only leaders publish apply progress to foreign readers.
        if progress_to_be_updated && self.is_leader() && !self.pending_remove {
            self.leader_checker
                .store_applied_index_term(applied_index_term);
        }

        has_ready
    }

    /// Resets the accounting hints after a split was applied.
    pub fn post_split(&mut self) {
        self.delete_keys_hint = 0;
        self.size_diff_hint = 0;
    }

    /// Proposes a command. Returns `true` when the request entered the
    /// proposal pipeline; everything else was already answered through the
    /// callback.
    pub fn propose(
        &mut self,
        kv: &dyn KvEngine,
        cfg: &RaftStoreConfig,
        req: RaftCmdRequest,
        cb: Callback,
    ) -> bool {
        if self.pending_remove {
            return false;
        }
        PEER_PROPOSAL_COUNTER.with_label_values(&["all"]).inc();

        let mut is_conf_change = false;
        let is_urgent = is_urgent_request(&req);

        let policy = match self.inspect(&req) {
            Ok(policy) => policy,
            Err(e) => {
                cb.done(err_resp(e, self.term()));
                return false;
            }
        };
        let res = match policy {
            RequestPolicy::ReadLocal => {
                PEER_PROPOSAL_COUNTER.with_label_values(&["local_read"]).inc();
                self.read_local(kv, &req, cb);
                return false;
            }
            RequestPolicy::ReadIndex => {
                PEER_PROPOSAL_COUNTER.with_label_values(&["read_index"]).inc();
                return self.read_index(cfg, req, cb);
            }
            RequestPolicy::ProposeTransferLeader => {
                PEER_PROPOSAL_COUNTER
                    .with_label_values(&["transfer_leader"])
                    .inc();
                return self.propose_transfer_leader(cfg, &req, cb);
            }
            RequestPolicy::ProposeNormal => {
                PEER_PROPOSAL_COUNTER.with_label_values(&["normal"]).inc();
                self.propose_normal(cfg, req)
            }
            RequestPolicy::ProposeConfChange => {
                PEER_PROPOSAL_COUNTER.with_label_values(&["conf_change"]).inc();
                is_conf_change = true;
                self.propose_conf_change(cfg, &req)
            }
            RequestPolicy::Invalid => unreachable!("invalid policy is surfaced as an error"),
        };

        let idx = match res {
            Ok(idx) => idx,
            Err(e) => {
                cb.done(err_resp(e.into_cmd_error(), self.term()));
                return false;
            }
        };

        if is_urgent {
            self.last_urgent_proposal_idx = idx;
            // Eagerly broadcast the commit index so the urgent proposal is
            // applied on all nodes as soon as possible.
            self.raft_group.skip_bcast_commit(false);
        }
        let meta = ProposalMeta {
            index: idx,
            term: self.term(),
            renew_lease_time: None,
        };
        self.post_propose(meta, is_conf_change, cb);
        true
    }

    /// Records the proposal so the lease can be renewed when it commits.
    fn post_propose(&mut self, mut meta: ProposalMeta, is_conf_change: bool, cb: Callback) {
        meta.renew_lease_time = Some(Instant::now());
        self.apply_proposals.push(Proposal {
            is_conf_change,
            index: meta.index,
            term: meta.term,
            cb,
        });
        self.proposals.push(meta);
    }

    fn count_healthy_node<'a>(&self, progress: impl Iterator<Item = &'a Progress>) -> usize {
        // A node lagging below the truncation point needs a snapshot first;
        // it cannot vouch for new log entries in a quorum.
        let truncated_idx = self.peer_storage.truncated_index();
        progress.filter(|pr| pr.matched >= truncated_idx).count()
    }

    /// A membership change is safe iff the group keeps a healthy quorum
    /// right after the change is applied.
    fn check_conf_change(&self, cfg: &RaftStoreConfig, req: &RaftCmdRequest) -> Result<()> {
        let (change_type, peer) = get_change_peer_cmd(req).expect("conf change cmd");

        if (change_type == ConfChangeType::AddNode && peer.role == PeerRole::Learner)
            || (change_type == ConfChangeType::AddLearnerNode && peer.role != PeerRole::Learner)
        {
            warn!(
                "{} conf change type: {:?}, but got peer {:?}",
                self.tag, change_type, peer
            );
            return Err(CmdError::InvalidConfChange("invalid conf change request".to_owned()).into());
        }

        if change_type == ConfChangeType::RemoveNode
            && !cfg.allow_remove_leader
            && peer.id == self.peer_id()
        {
            warn!("{} rejects remove leader request {:?}", self.tag, peer);
            return Err(CmdError::InvalidConfChange("ignore remove leader".to_owned()).into());
        }

        let mut status = self.raft_group.status();
        let total = status.progress.len();
        if total == 1 {
            // A single-node group stays available through any change.
            return Ok(());
        }

        match change_type {
            ConfChangeType::AddNode => {
                if let Some(progress) = status.progress.get_mut(&peer.id) {
                    // Promoting a learner to voter.
                    progress.is_learner = false;
                } else {
                    status.progress.insert(peer.id, Progress::default());
                }
            }
            ConfChangeType::RemoveNode => {
                if peer.role == PeerRole::Learner {
                    return Ok(());
                }
                if status.progress.remove(&peer.id).is_none() {
                    // Removing a node that does not exist is always safe.
                    return Ok(());
                }
            }
            ConfChangeType::AddLearnerNode => return Ok(()),
        }

        let healthy = self.count_healthy_node(status.progress.values());
        let quorum_after_change = quorum(status.progress.len());
        if healthy >= quorum_after_change {
            return Ok(());
        }

        info!(
            "{} rejects unsafe conf change request {:?}, total {}, healthy {}, quorum after change {}",
            self.tag, peer, total, healthy, quorum_after_change
        );
        Err(CmdError::InvalidConfChange(format!(
            "unsafe to perform conf change {:?}, total {}, healthy {}, quorum after change {}",
            peer, total, healthy, quorum_after_change
        ))
        .into())
    }

    fn transfer_leader(&mut self, peer: &PeerMeta) {
        info!("{} transfer leader to {:?}", self.tag, peer);
        self.raft_group.transfer_leader(peer.id);
    }

    fn ready_to_transfer_leader(&self, cfg: &RaftStoreConfig, peer: &PeerMeta) -> bool {
        let peer_id = peer.id;
        let status = self.raft_group.status();

        if !status.progress.contains_key(&peer_id) {
            return false;
        }
        for progress in status.progress.values() {
            if progress.state == ProgressState::Snapshot {
                return false;
            }
        }
        if self.recent_added_peer.contains(peer_id) {
            debug!(
                "{} reject transfer leader to {:?} due to the peer was added recently",
                self.tag, peer
            );
            return false;
        }

        let last_index = self.peer_storage.last_index();
        last_index <= status.progress[&peer_id].matched + cfg.leader_transfer_max_log_lag
    }

    fn read_local(&mut self, kv: &dyn KvEngine, req: &RaftCmdRequest, cb: Callback) {
        let resp = self.handle_read(kv, req, false);
        cb.done(resp);
    }

    fn pre_read_index(&self) -> std::result::Result<(), CmdError> {
        // See ready_to_handle_read for why these states poison reads.
        if self.is_splitting() {
            return Err(CmdError::ProposalRefused(
                "can not read index due to split".to_owned(),
            ));
        }
        if self.is_merging() {
            return Err(CmdError::ProposalRefused(
                "can not read index due to merge".to_owned(),
            ));
        }
        Ok(())
    }

    /// Enqueues a quorum read. Not proposed when the region is splitting or
    /// merging, when raft silently dropped the message, or when the request
    /// can piggy-back on a read proposed within the current lease window.
    fn read_index(&mut self, cfg: &RaftStoreConfig, req: RaftCmdRequest, cb: Callback) -> bool {
        if let Err(e) = self.pre_read_index() {
            debug!("{} prevents unsafe read index, err: {}", self.tag, e);
            cb.done(err_resp(e, self.term()));
            return false;
        }

        let now = Instant::now();
        if let Some(read) = self.pending_reads.reads.back_mut() {
            if let Some(last_time) = read.renew_lease_time {
                if last_time + cfg.raft_store_max_leader_lease() > now {
                    read.cmds.push((req, cb));
                    return false;
                }
            }
        }

        let last_pending_read_count = self.raft_group.pending_read_count();
        let last_ready_read_count = self.raft_group.ready_read_count();

        let id = self.pending_reads.next_id();
        self.raft_group.read_index(id.to_be_bytes().to_vec());

        let pending_read_count = self.raft_group.pending_read_count();
        let ready_read_count = self.raft_group.ready_read_count();

        if pending_read_count == last_pending_read_count
            && ready_read_count == last_ready_read_count
        {
            // The message got dropped silently and can't be handled anymore.
            notify_stale_req(self.term(), cb);
            return false;
        }

        self.pending_reads
            .reads
            .push_back(ReadIndexRequest::new(id, vec![(req, cb)], Some(now)));

        // TimeoutNow may have been sent out; propose explicitly so the new
        // term gets acknowledged and the lease can leave suspect.
        if self.leader_lease.inspect(Some(now)) == LeaseState::Suspect {
            if let Ok(index) = self.propose_normal(cfg, RaftCmdRequest::default()) {
                let meta = ProposalMeta {
                    index,
                    term: self.term(),
                    renew_lease_time: Some(now),
                };
                self.post_propose(meta, false, Callback::none());
            }
        }

        true
    }

    fn get_min_progress(&self) -> u64 {
        let status = self.raft_group.status();
        status
            .progress
            .values()
            .map(|pr| pr.matched)
            .min()
            .unwrap_or(0)
    }

    /// Merge must not outrun the slowest member nor cover entries that could
    /// change the epoch; stamps the checked floor into the request.
    fn pre_propose_prepare_merge(
        &self,
        cfg: &RaftStoreConfig,
        req: &mut AdminRequest,
    ) -> Result<()> {
        let last_index = self.raft_group.last_index();
        let min_progress = self.get_min_progress();
        let min_index = min_progress + 1;
        if min_progress == 0 || last_index - min_progress > cfg.merge_max_log_gap {
            return Err(CmdError::ProposalRefused(format!(
                "log gap ({}, {}] is too large, skip merge",
                min_progress, last_index
            ))
            .into());
        }

        let mut entry_size = 0usize;
        for entry in self.raft_group.log_entries_after(min_index)? {
            entry_size += entry.data.len();
            if entry.entry_type == EntryType::ConfChange {
                return Err(CmdError::ProposalRefused(
                    "log gap contains conf change, skip merging".to_owned(),
                )
                .into());
            }
            if entry.data.is_empty() {
                continue;
            }
            let cmd: RaftCmdRequest = bincode::deserialize(&entry.data).unwrap_or_else(|e| {
                panic!("{} data is corrupted at {}, error: {}", self.tag, entry.index, e)
            });
            let admin = match &cmd.admin_request {
                Some(admin) => admin,
                None => continue,
            };
            match admin.cmd_type() {
                AdminCmdType::TransferLeader
                | AdminCmdType::ComputeHash
                | AdminCmdType::VerifyHash => continue,
                // Anything that can change the epoch or the log gap poisons
                // the merge.
                cmd_type => {
                    return Err(CmdError::ProposalRefused(format!(
                        "log gap contains admin request {:?}, skip merging",
                        cmd_type
                    ))
                    .into());
                }
            }
        }

        if entry_size as f64 > cfg.raft_entry_max_size as f64 * 0.9 {
            return Err(CmdError::ProposalRefused(
                "log gap size exceed entry size limit, skip merging".to_owned(),
            )
            .into());
        }

        if let AdminRequest::PrepareMerge { min_index: idx, .. } = req {
            *idx = min_index;
        }
        PEER_ADMIN_CMD_COUNTER.with_label_values(&["prepare_merge"]).inc();
        Ok(())
    }

    /// Computes the proposal context and runs command-specific pre-checks.
    fn pre_propose(
        &self,
        cfg: &RaftStoreConfig,
        req: &mut RaftCmdRequest,
    ) -> Result<ProposalContext> {
        let mut ctx = ProposalContext::default();
        if get_sync_log_from_request(req) {
            ctx.insert(ProposalContext::SYNC_LOG);
        }

        let is_prepare_merge = matches!(
            req.admin_request,
            Some(AdminRequest::PrepareMerge { .. })
        );
        match req.admin_request.as_ref().map(AdminRequest::cmd_type) {
            Some(AdminCmdType::Split) | Some(AdminCmdType::BatchSplit) => {
                ctx.insert(ProposalContext::SPLIT);
            }
            _ => {}
        }

        if is_prepare_merge {
            let admin = req.admin_request.as_mut().expect("prepare merge cmd");
            self.pre_propose_prepare_merge(cfg, admin)?;
            ctx.insert(ProposalContext::PREPARE_MERGE);
        }

        Ok(ctx)
    }

    fn propose_normal(&mut self, cfg: &RaftStoreConfig, mut req: RaftCmdRequest) -> Result<u64> {
        if self.pending_merge_state.is_some()
            && req.admin_request.as_ref().map(AdminRequest::cmd_type)
                != Some(AdminCmdType::RollbackMerge)
        {
            return Err(CmdError::ProposalRefused(
                "peer in merging mode, can't do proposal".to_owned(),
            )
            .into());
        }

        let ctx = match self.pre_propose(cfg, &mut req) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("{} skip proposal: {}", self.tag, e);
                return Err(e);
            }
        };
        let data = bincode::serialize(&req)?;

        if data.len() as u64 > cfg.raft_entry_max_size {
            error!("{} entry is too large, entry size {}", self.tag, data.len());
            return Err(CmdError::RaftEntryTooLarge {
                region_id: self.region_id,
                entry_size: data.len() as u64,
            }
            .into());
        }

        let propose_index = self.next_proposal_index();
        self.raft_group.propose(ctx.to_vec(), data)?;
        if self.next_proposal_index() == propose_index {
            // The message was dropped silently: leader absence or an ongoing
            // leader transfer, both equivalent to not being leader.
            return Err(CmdError::NotLeader {
                region_id: self.region_id,
            }
            .into());
        }

        Ok(propose_index)
    }

    /// Transfer leader is advisory: the callback is answered immediately no
    /// matter whether the transfer was actually started.
    fn propose_transfer_leader(
        &mut self,
        cfg: &RaftStoreConfig,
        req: &RaftCmdRequest,
        cb: Callback,
    ) -> bool {
        let peer = get_transfer_leader_cmd(req).expect("transfer leader cmd").clone();

        let transferred = if self.ready_to_transfer_leader(cfg, &peer) {
            PEER_ADMIN_CMD_COUNTER
                .with_label_values(&["transfer_leader"])
                .inc();
            self.transfer_leader(&peer);
            true
        } else {
            info!("{} transfer leader message ignored directly", self.tag);
            false
        };

        // Transferring leadership neither replicates log nor applies.
        cb.done(make_transfer_leader_response());

        transferred
    }

    /// Fails when a previous conf change is still unapplied, the change is
    /// unsafe, or raft dropped it silently.
    fn propose_conf_change(&mut self, cfg: &RaftStoreConfig, req: &RaftCmdRequest) -> Result<u64> {
        if self.pending_merge_state.is_some() {
            return Err(CmdError::ProposalRefused(
                "peer in merging mode, can't do proposal".to_owned(),
            )
            .into());
        }

        if self.raft_group.pending_conf_index() > self.peer_storage.applied_index() {
            info!("{} there is a pending conf change, try later", self.tag);
            return Err(CmdError::ProposalRefused(format!(
                "{} there is a pending conf change, try later",
                self.tag
            ))
            .into());
        }

        self.check_conf_change(cfg, req)?;

        let data = bincode::serialize(req)?;
        let (change_type, peer) = get_change_peer_cmd(req).expect("conf change cmd");
        let cc = ConfChange {
            change_type,
            node_id: peer.id,
            context: data,
        };

        info!(
            "{} propose conf change {:?} peer {}",
            self.tag, cc.change_type, cc.node_id
        );
        PEER_ADMIN_CMD_COUNTER.with_label_values(&["conf_change"]).inc();

        let propose_index = self.next_proposal_index();
        self.raft_group
            .propose_conf_change(ProposalContext::SYNC_LOG.to_vec(), cc)?;
        if self.next_proposal_index() == propose_index {
            return Err(CmdError::NotLeader {
                region_id: self.region_id,
            }
            .into());
        }

        Ok(propose_index)
    }

    fn handle_read(
        &self,
        kv: &dyn KvEngine,
        req: &RaftCmdRequest,
        check_epoch: bool,
    ) -> RaftCmdResponse {
        execute_read(kv, req, self.peer_storage.region(), self.term(), check_epoch)
    }

    fn inspect(&mut self, req: &RaftCmdRequest) -> std::result::Result<RequestPolicy, CmdError> {
        inspect(self, req)
    }
}

impl RequestInspector for Peer {
    fn has_applied_to_current_term(&self) -> bool {
        self.peer_storage.applied_index_term() == self.term()
    }

    fn inspect_lease(&mut self) -> LeaseState {
        if !self.raft_group.in_lease() {
            return LeaseState::Suspect;
        }
        // A splitting or merging peer must not serve local reads, whatever
        // the lease says.
        if self.is_splitting() || self.is_merging() {
            return LeaseState::Suspect;
        }
        let state = self.leader_lease.inspect(None);
        if state == LeaseState::Expired {
            debug!("{} leader lease is expired", self.tag);
            // The expired remote lease must be withdrawn before anything
            // else happens.
            self.leader_lease.expire();
        }
        state
    }
}
