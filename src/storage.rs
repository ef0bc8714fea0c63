//! The durable-side boundary: write batches, engines and the peer storage
//! contract.
//!
//! The controller itself never touches disk. It fills [`WriteBatch`]es and
//! hands them back to the store, which performs the durable write; the
//! invariant is that in-memory state always reflects what is on disk, so a
//! failed durable write is fatal to the caller.

use std::sync::Arc;

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::errors::Result;
use crate::metadata::ApplyState;
use crate::metadata::MergeState;
use crate::metadata::PeerState;
use crate::metadata::Region;
use crate::metadata::RegionLocalState;
use crate::raft::Ready;

const LOCAL_PREFIX: u8 = 0x01;
const REGION_META_PREFIX: u8 = 0x03;
const REGION_STATE_SUFFIX: u8 = 0x01;
const RAFT_STATE_SUFFIX: u8 = 0x02;
const APPLY_STATE_SUFFIX: u8 = 0x03;

fn region_meta_key(region_id: u64, suffix: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.push(LOCAL_PREFIX);
    key.push(REGION_META_PREFIX);
    key.extend_from_slice(&region_id.to_be_bytes());
    key.push(suffix);
    key
}

/// Key of the durable [`RegionLocalState`] record.
pub fn region_state_key(region_id: u64) -> Vec<u8> {
    region_meta_key(region_id, REGION_STATE_SUFFIX)
}

pub fn raft_state_key(region_id: u64) -> Vec<u8> {
    region_meta_key(region_id, RAFT_STATE_SUFFIX)
}

pub fn apply_state_key(region_id: u64) -> Vec<u8> {
    region_meta_key(region_id, APPLY_STATE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { start_key: Vec<u8>, end_key: Vec<u8> },
}

/// An ordered batch of writes committed atomically by an engine.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    pub fn delete_range(&mut self, start_key: Vec<u8>, end_key: Vec<u8>) {
        self.ops.push(WriteOp::DeleteRange { start_key, end_key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// The key-value engine holding applied data and region metadata.
pub trait KvEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn write(&self, batch: &WriteBatch) -> Result<()>;
}

/// The engine holding raft log and raft-side metadata.
pub trait RaftEngine: Send + Sync {
    fn write(&self, batch: &WriteBatch) -> Result<()>;
}

#[derive(Clone)]
pub struct Engines {
    pub kv: Arc<dyn KvEngine>,
    pub raft: Arc<dyn RaftEngine>,
}

/// Opaque handle produced by [`PeerStorage::save_ready_state`], returned to
/// the storage once the write batches are durable.
#[derive(Debug)]
pub struct InvokeContext {
    pub region_id: u64,
    has_snapshot: bool,
}

impl InvokeContext {
    pub fn new(region_id: u64, has_snapshot: bool) -> InvokeContext {
        InvokeContext {
            region_id,
            has_snapshot,
        }
    }

    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }
}

/// Result of an applied snapshot: the region transitioned from `prev_region`
/// to `region`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySnapResult {
    pub prev_region: Region,
    pub region: Region,
}

/// A snapshot-generation task the storage has prepared for the apply worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenSnapTask {
    pub region_id: u64,
}

/// Writes the durable peer state for `region` into the KV batch.
pub fn write_peer_state(
    kv_wb: &mut WriteBatch,
    region: &Region,
    state: PeerState,
    merge_state: Option<MergeState>,
) -> Result<()> {
    let local_state = RegionLocalState {
        state,
        region: region.clone(),
        merge_state,
    };
    kv_wb.put(region_state_key(region.id), bincode::serialize(&local_state)?);
    Ok(())
}

/// Durable state of one peer, owned by the region worker side.
#[cfg_attr(test, automock)]
pub trait PeerStorage: Send {
    fn region(&self) -> &Region;

    /// Caller must have already persisted the new region.
    fn set_region(&mut self, region: Region);

    fn applied_index(&self) -> u64;

    fn applied_index_term(&self) -> u64;

    fn set_apply_state(&mut self, apply_state: ApplyState, applied_index_term: u64);

    fn truncated_index(&self) -> u64;

    fn last_index(&self) -> u64;

    fn is_initialized(&self) -> bool;

    fn is_applying_snapshot(&self) -> bool;

    /// Whether a snapshot is still being applied; also gives the storage a
    /// chance to observe a finished application.
    fn check_applying_snap(&mut self) -> bool;

    /// Best-effort cancel; `false` means the application is past the point
    /// of no return and the caller has to retry later.
    fn cancel_applying_snap(&mut self) -> bool;

    fn take_gen_snap_task(&mut self) -> Option<GenSnapTask>;

    /// Persists the ready's hard state, entries and snapshot into the
    /// provided batches.
    fn save_ready_state(
        &mut self,
        kv_wb: &mut WriteBatch,
        raft_wb: &mut WriteBatch,
        ready: &Ready,
    ) -> Result<InvokeContext>;

    /// Updates durable bookkeeping after the batches were flushed. Returns
    /// the snapshot transition, if this ready carried one.
    fn post_ready_persistent(&mut self, invoke_ctx: InvokeContext) -> Option<ApplySnapResult>;

    /// Queues deletion of every region-metadata key into the batches.
    fn clear_meta(&mut self, kv_wb: &mut WriteBatch, raft_wb: &mut WriteBatch) -> Result<()>;

    /// Schedules an asynchronous clear of the data range.
    fn clear_data(&self) -> Result<()>;
}
