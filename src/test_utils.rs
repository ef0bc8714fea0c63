//! Deterministic fakes for the external collaborators, used by the crate's
//! own tests and exported behind the `test-utils` feature for downstream
//! integration tests.
//!
//! [`FakeRaftNode`] and [`MemPeerStorage`] are handle-based: the test keeps a
//! clone of the shared core while the peer owns the boxed fake, so scripted
//! ready cycles and assertions both see the same state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::cmd::AdminRequest;
use crate::cmd::RaftCmdRequest;
use crate::cmd::RaftRequestHeader;
use crate::cmd::Request;
use crate::errors::Error;
use crate::errors::Result;
use crate::metadata::ApplyState;
use crate::metadata::PeerMeta;
use crate::metadata::PeerRole;
use crate::metadata::Region;
use crate::metadata::RegionEpoch;
use crate::peer::PeerEventObserver;
use crate::raft::ConfChange;
use crate::raft::Entry;
use crate::raft::EntryType;
use crate::raft::Message;
use crate::raft::Progress;
use crate::raft::RaftNode;
use crate::raft::RaftStatus;
use crate::raft::Ready;
use crate::raft::Snapshot;
use crate::raft::StateRole;
use crate::storage::apply_state_key;
use crate::storage::raft_state_key;
use crate::storage::region_state_key;
use crate::storage::ApplySnapResult;
use crate::storage::Engines;
use crate::storage::GenSnapTask;
use crate::storage::InvokeContext;
use crate::storage::KvEngine;
use crate::storage::PeerStorage;
use crate::storage::RaftEngine;
use crate::storage::WriteBatch;
use crate::storage::WriteOp;
use crate::transport::RaftMessage;
use crate::transport::Transport;

/// Scriptable state behind a [`FakeRaftNode`].
#[derive(Debug, Default)]
pub struct FakeRaftCore {
    pub id: u64,
    pub term: u64,
    pub state: StateRole,
    pub leader_id: u64,
    pub last_index: u64,
    pub pending_conf_index: u64,
    pub in_lease: bool,
    pub learner: bool,
    pub progress: HashMap<u64, Progress>,
    /// Entries served by `log_entries_after`.
    pub log: Vec<Entry>,
    /// Readies handed out in order by `ready_since`.
    pub ready_queue: VecDeque<Ready>,
    pub pending_snapshot: Option<Snapshot>,
    pub pending_read_count: usize,
    pub ready_read_count: usize,
    /// Simulate raft silently dropping proposals / read-index requests.
    pub drop_proposals: bool,
    pub drop_read_index: bool,

    pub stepped: Vec<Message>,
    pub proposals: Vec<(Vec<u8>, Vec<u8>)>,
    pub conf_changes: Vec<(Vec<u8>, ConfChange)>,
    pub read_index_requests: Vec<Vec<u8>>,
    pub transfer_leader_calls: Vec<u64>,
    pub campaign_calls: usize,
    pub skip_bcast_commit_calls: Vec<bool>,
    pub advance_calls: usize,
    pub advance_apply_calls: Vec<u64>,
}

/// A [`RaftNode`] whose ready cycles are scripted by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeRaftNode {
    core: Arc<Mutex<FakeRaftCore>>,
}

impl FakeRaftNode {
    /// A node already elected leader of `term`, with a healthy check-quorum
    /// lease.
    pub fn leader(id: u64, term: u64) -> FakeRaftNode {
        let node = FakeRaftNode::default();
        {
            let mut core = node.core.lock();
            core.id = id;
            core.term = term;
            core.state = StateRole::Leader;
            core.leader_id = id;
            core.in_lease = true;
        }
        node
    }

    pub fn follower(id: u64, leader_id: u64, term: u64) -> FakeRaftNode {
        let node = FakeRaftNode::default();
        {
            let mut core = node.core.lock();
            core.id = id;
            core.term = term;
            core.state = StateRole::Follower;
            core.leader_id = leader_id;
        }
        node
    }

    pub fn core(&self) -> MutexGuard<'_, FakeRaftCore> {
        self.core.lock()
    }

    pub fn push_ready(&self, ready: Ready) {
        self.core.lock().ready_queue.push_back(ready);
    }
}

impl RaftNode for FakeRaftNode {
    fn step(&mut self, msg: Message) -> Result<()> {
        self.core.lock().stepped.push(msg);
        Ok(())
    }

    fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        let mut core = self.core.lock();
        core.proposals.push((context.clone(), data.clone()));
        if !core.drop_proposals {
            core.last_index += 1;
            let entry = Entry {
                entry_type: EntryType::Normal,
                term: core.term,
                index: core.last_index,
                data,
                context,
            };
            core.log.push(entry);
        }
        Ok(())
    }

    fn propose_conf_change(&mut self, context: Vec<u8>, change: ConfChange) -> Result<()> {
        let mut core = self.core.lock();
        core.conf_changes.push((context.clone(), change.clone()));
        if !core.drop_proposals {
            core.last_index += 1;
            let entry = Entry {
                entry_type: EntryType::ConfChange,
                term: core.term,
                index: core.last_index,
                data: change.context,
                context,
            };
            core.log.push(entry);
        }
        Ok(())
    }

    fn read_index(&mut self, request_ctx: Vec<u8>) {
        let mut core = self.core.lock();
        core.read_index_requests.push(request_ctx);
        if !core.drop_read_index {
            core.pending_read_count += 1;
        }
    }

    fn transfer_leader(&mut self, transferee: u64) {
        self.core.lock().transfer_leader_calls.push(transferee);
    }

    fn campaign(&mut self) -> Result<()> {
        let mut core = self.core.lock();
        core.campaign_calls += 1;
        core.term += 1;
        core.state = StateRole::Leader;
        core.leader_id = core.id;
        core.in_lease = true;
        Ok(())
    }

    fn has_ready_since(&self, _applied_idx: u64) -> bool {
        !self.core.lock().ready_queue.is_empty()
    }

    fn ready_since(&mut self, _applied_idx: u64) -> Ready {
        self.core.lock().ready_queue.pop_front().unwrap_or_default()
    }

    fn advance(&mut self, _ready: Ready) {
        self.core.lock().advance_calls += 1;
    }

    fn advance_apply(&mut self, applied_idx: u64) {
        self.core.lock().advance_apply_calls.push(applied_idx);
    }

    fn skip_bcast_commit(&mut self, skip: bool) {
        self.core.lock().skip_bcast_commit_calls.push(skip);
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            progress: self.core.lock().progress.clone(),
        }
    }

    fn snap(&self) -> Option<Snapshot> {
        self.core.lock().pending_snapshot.clone()
    }

    fn term(&self) -> u64 {
        self.core.lock().term
    }

    fn leader_id(&self) -> u64 {
        self.core.lock().leader_id
    }

    fn state(&self) -> StateRole {
        self.core.lock().state
    }

    fn in_lease(&self) -> bool {
        self.core.lock().in_lease
    }

    fn pending_read_count(&self) -> usize {
        self.core.lock().pending_read_count
    }

    fn ready_read_count(&self) -> usize {
        self.core.lock().ready_read_count
    }

    fn pending_conf_index(&self) -> u64 {
        self.core.lock().pending_conf_index
    }

    fn last_index(&self) -> u64 {
        self.core.lock().last_index
    }

    fn is_learner(&self) -> bool {
        self.core.lock().learner
    }

    fn log_entries_after(&self, low: u64) -> Result<Vec<Entry>> {
        Ok(self
            .core
            .lock()
            .log
            .iter()
            .filter(|e| e.index >= low)
            .cloned()
            .collect())
    }
}

/// Shared knobs and observations of a [`MemPeerStorage`].
#[derive(Debug, Default)]
pub struct MemStorageCore {
    pub applied_index: AtomicU64,
    pub applied_index_term: AtomicU64,
    pub truncated_index: AtomicU64,
    pub last_index: AtomicU64,
    pub initialized: AtomicBool,
    pub applying_snapshot: AtomicBool,
    pub cancel_succeeds: AtomicBool,
    pub meta_cleared: AtomicBool,
    pub data_cleared: AtomicBool,
}

/// In-memory [`PeerStorage`] whose indices and flags live behind a shared
/// core the test can mutate mid-scenario.
#[derive(Debug)]
pub struct MemPeerStorage {
    region: Region,
    pub core: Arc<MemStorageCore>,
    pub gen_snap_task: Option<GenSnapTask>,
    pub snap_result: Option<ApplySnapResult>,
}

impl MemPeerStorage {
    pub fn new(region: Region) -> MemPeerStorage {
        let core = MemStorageCore::default();
        core.initialized.store(true, Ordering::SeqCst);
        core.cancel_succeeds.store(true, Ordering::SeqCst);
        MemPeerStorage {
            region,
            core: Arc::new(core),
            gen_snap_task: None,
            snap_result: None,
        }
    }

    pub fn handle(&self) -> Arc<MemStorageCore> {
        self.core.clone()
    }
}

impl PeerStorage for MemPeerStorage {
    fn region(&self) -> &Region {
        &self.region
    }

    fn set_region(&mut self, region: Region) {
        self.region = region;
    }

    fn applied_index(&self) -> u64 {
        self.core.applied_index.load(Ordering::SeqCst)
    }

    fn applied_index_term(&self) -> u64 {
        self.core.applied_index_term.load(Ordering::SeqCst)
    }

    fn set_apply_state(&mut self, apply_state: ApplyState, applied_index_term: u64) {
        self.core
            .applied_index
            .store(apply_state.applied_index, Ordering::SeqCst);
        self.core
            .truncated_index
            .store(apply_state.truncated_state.index, Ordering::SeqCst);
        self.core
            .applied_index_term
            .store(applied_index_term, Ordering::SeqCst);
    }

    fn truncated_index(&self) -> u64 {
        self.core.truncated_index.load(Ordering::SeqCst)
    }

    fn last_index(&self) -> u64 {
        self.core.last_index.load(Ordering::SeqCst)
    }

    fn is_initialized(&self) -> bool {
        self.core.initialized.load(Ordering::SeqCst)
    }

    fn is_applying_snapshot(&self) -> bool {
        self.core.applying_snapshot.load(Ordering::SeqCst)
    }

    fn check_applying_snap(&mut self) -> bool {
        self.is_applying_snapshot()
    }

    fn cancel_applying_snap(&mut self) -> bool {
        if self.core.cancel_succeeds.load(Ordering::SeqCst) {
            self.core.applying_snapshot.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn take_gen_snap_task(&mut self) -> Option<GenSnapTask> {
        self.gen_snap_task.take()
    }

    fn save_ready_state(
        &mut self,
        _kv_wb: &mut WriteBatch,
        _raft_wb: &mut WriteBatch,
        ready: &Ready,
    ) -> Result<InvokeContext> {
        if let Some(last) = ready.committed_entries.last() {
            let last_index = self.core.last_index.load(Ordering::SeqCst);
            self.core
                .last_index
                .store(last_index.max(last.index), Ordering::SeqCst);
        }
        Ok(InvokeContext::new(self.region.id, ready.snapshot.is_some()))
    }

    fn post_ready_persistent(&mut self, _invoke_ctx: InvokeContext) -> Option<ApplySnapResult> {
        let res = self.snap_result.take();
        if let Some(r) = &res {
            self.region = r.region.clone();
        }
        res
    }

    fn clear_meta(&mut self, kv_wb: &mut WriteBatch, raft_wb: &mut WriteBatch) -> Result<()> {
        kv_wb.delete(region_state_key(self.region.id));
        kv_wb.delete(apply_state_key(self.region.id));
        raft_wb.delete(raft_state_key(self.region.id));
        self.core.meta_cleared.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn clear_data(&self) -> Result<()> {
        self.core.data_cleared.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory KV engine.
#[derive(Debug, Default)]
pub struct MemKvEngine {
    pub data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvEngine {
    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.data.lock().insert(key.to_vec(), value.to_vec());
    }
}

impl KvEngine for MemKvEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.lock().get(key).map(|v| Bytes::from(v.clone())))
    }

    fn write(&self, batch: &WriteBatch) -> Result<()> {
        let mut data = self.data.lock();
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    data.remove(key);
                }
                WriteOp::DeleteRange { start_key, end_key } => {
                    data.retain(|k, _| k < start_key || k >= end_key);
                }
            }
        }
        Ok(())
    }
}

/// In-memory raft engine recording committed batches.
#[derive(Debug, Default)]
pub struct MemRaftEngine {
    pub writes: Mutex<Vec<WriteOp>>,
}

impl RaftEngine for MemRaftEngine {
    fn write(&self, batch: &WriteBatch) -> Result<()> {
        self.writes.lock().extend(batch.ops().iter().cloned());
        Ok(())
    }
}

pub fn new_test_engines() -> (Engines, Arc<MemKvEngine>, Arc<MemRaftEngine>) {
    let kv = Arc::new(MemKvEngine::default());
    let raft = Arc::new(MemRaftEngine::default());
    (
        Engines {
            kv: kv.clone(),
            raft: raft.clone(),
        },
        kv,
        raft,
    )
}

/// Transport that keeps everything it was asked to send.
#[derive(Debug, Default)]
pub struct VecTransport {
    pub sent: Vec<RaftMessage>,
    pub fail: bool,
}

impl Transport for VecTransport {
    fn send(&mut self, msg: RaftMessage) -> Result<()> {
        if self.fail {
            return Err(Error::Other("transport closed".to_owned()));
        }
        self.sent.push(msg);
        Ok(())
    }
}

/// Observer recording every role change it was notified of.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<(u64, StateRole)>>,
}

impl PeerEventObserver for RecordingObserver {
    fn on_role_change(&self, region_id: u64, role: StateRole) {
        self.events.lock().push((region_id, role));
    }
}

pub fn new_learner_peer(id: u64, store_id: u64) -> PeerMeta {
    PeerMeta {
        id,
        store_id,
        role: PeerRole::Learner,
    }
}

pub fn new_region(id: u64, peers: Vec<PeerMeta>) -> Region {
    Region {
        id,
        start_key: vec![],
        end_key: vec![],
        epoch: RegionEpoch {
            conf_ver: 1,
            version: 1,
        },
        peers,
    }
}

fn new_header(region: &Region, peer: &PeerMeta) -> RaftRequestHeader {
    RaftRequestHeader {
        region_id: region.id,
        peer: peer.clone(),
        region_epoch: region.epoch,
        term: 0,
        read_quorum: false,
        sync_log: false,
    }
}

pub fn new_get_cmd(region: &Region, peer: &PeerMeta, key: &[u8]) -> RaftCmdRequest {
    RaftCmdRequest {
        header: new_header(region, peer),
        requests: vec![Request::Get { key: key.to_vec() }],
        admin_request: None,
    }
}

pub fn new_put_cmd(region: &Region, peer: &PeerMeta, key: &[u8], value: &[u8]) -> RaftCmdRequest {
    RaftCmdRequest {
        header: new_header(region, peer),
        requests: vec![Request::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }],
        admin_request: None,
    }
}

pub fn new_snap_cmd(region: &Region, peer: &PeerMeta) -> RaftCmdRequest {
    RaftCmdRequest {
        header: new_header(region, peer),
        requests: vec![Request::Snap],
        admin_request: None,
    }
}

pub fn new_admin_cmd(region: &Region, peer: &PeerMeta, admin: AdminRequest) -> RaftCmdRequest {
    RaftCmdRequest {
        header: new_header(region, peer),
        requests: vec![],
        admin_request: Some(admin),
    }
}
