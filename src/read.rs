//! The read fast path shared with foreign reader threads.
//!
//! [`LeaderChecker`] is a snapshot of peer identity, term, epoch and lease
//! that reader threads consult to authorize a lease-based local read without
//! ever touching the peer. The peer executor is the sole writer; every field
//! is an atomic or an atomically republished `Arc`, so readers take a
//! consistent-enough view by loading each slot independently. The one
//! tolerated race (a fresh `applied_index_term` paired with a stale `term`)
//! only ever forces the conservative path: a quorum read-index round.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cmd::bind_term;
use crate::cmd::check_region_epoch;
use crate::cmd::err_resp;
use crate::cmd::Callback;
use crate::cmd::RaftCmdRequest;
use crate::cmd::RaftCmdResponse;
use crate::cmd::RaftRequestHeader;
use crate::cmd::Request;
use crate::cmd::Response;
use crate::errors::CmdError;
use crate::lease::LeaseState;
use crate::lease::RemoteLease;
use crate::metadata::PeerMeta;
use crate::metadata::Region;
use crate::metadata::RegionEpoch;
use crate::storage::KvEngine;

/// The part of a client request a reader thread needs to validate it against
/// the checker snapshot.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    pub region_id: u64,
    pub peer: PeerMeta,
    pub region_epoch: RegionEpoch,
    /// Term the client observed; 0 means unknown.
    pub term: u64,
    pub sync_log: bool,
}

/// A command routed back to the peer executor, carrying its answer channel.
#[derive(Debug)]
pub struct MsgRaftCmd {
    pub send_time: Instant,
    pub request: RaftCmdRequest,
    pub callback: Callback,
}

/// Thin handle for injecting commands into a peer's executor queue.
#[derive(Debug, Clone)]
pub struct RaftRouter {
    tx: mpsc::UnboundedSender<MsgRaftCmd>,
}

impl RaftRouter {
    pub fn new(tx: mpsc::UnboundedSender<MsgRaftCmd>) -> RaftRouter {
        RaftRouter { tx }
    }

    pub fn send_raft_command(&self, msg: MsgRaftCmd) -> std::result::Result<(), CmdError> {
        self.tx
            .send(msg)
            .map_err(|_| CmdError::Other("raft router is closed".to_owned()))
    }
}

/// Published by the peer executor, read concurrently by reader threads to
/// authorize local reads.
#[derive(Debug)]
pub struct LeaderChecker {
    peer_id: u64,
    invalid: AtomicBool,
    term: AtomicU64,
    applied_index_term: AtomicU64,
    remote_lease: ArcSwapOption<RemoteLease>,
    region: ArcSwap<Region>,
}

impl LeaderChecker {
    pub(crate) fn new(
        peer_id: u64,
        term: u64,
        applied_index_term: u64,
        region: Region,
    ) -> LeaderChecker {
        LeaderChecker {
            peer_id,
            invalid: AtomicBool::new(false),
            term: AtomicU64::new(term),
            applied_index_term: AtomicU64::new(applied_index_term),
            remote_lease: ArcSwapOption::empty(),
            region: ArcSwap::from_pointee(region),
        }
    }

    pub(crate) fn set_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    pub(crate) fn store_term(&self, term: u64) {
        self.term.store(term, Ordering::Release);
    }

    pub(crate) fn store_applied_index_term(&self, applied_index_term: u64) {
        self.applied_index_term
            .store(applied_index_term, Ordering::Release);
    }

    pub(crate) fn store_region(&self, region: Region) {
        self.region.store(Arc::new(region));
    }

    pub(crate) fn store_remote_lease(&self, remote: Option<Arc<RemoteLease>>) {
        self.remote_lease.store(remote);
    }

    pub fn region(&self) -> Arc<Region> {
        self.region.load_full()
    }

    /// Confirms this peer may serve `ctx` locally. When the lease cannot
    /// vouch for leadership, a `Snap` command is pushed through the router to
    /// force a quorum read-index round and the caller waits on its answer.
    pub async fn is_leader(
        &self,
        ctx: &ReadContext,
        router: &RaftRouter,
    ) -> std::result::Result<(), CmdError> {
        let snap_time = Instant::now();
        if !self.is_expired(ctx, snap_time)? {
            return Ok(());
        }

        let (cb, rx) = Callback::pair();
        let header = RaftRequestHeader {
            region_id: ctx.region_id,
            peer: ctx.peer.clone(),
            region_epoch: ctx.region_epoch,
            term: ctx.term,
            read_quorum: false,
            sync_log: ctx.sync_log,
        };
        let cmd = RaftCmdRequest {
            header,
            requests: vec![Request::Snap],
            admin_request: None,
        };
        router.send_raft_command(MsgRaftCmd {
            send_time: Instant::now(),
            request: cmd,
            callback: cb,
        })?;

        let resp = rx.await.map_err(|_| CmdError::RegionNotFound {
            region_id: ctx.region_id,
        })?;
        match resp.header.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// `Ok(true)` means the lease cannot authorize the read and a quorum
    /// round is required; errors reject the request outright.
    fn is_expired(
        &self,
        ctx: &ReadContext,
        snap_time: Instant,
    ) -> std::result::Result<bool, CmdError> {
        if self.invalid.load(Ordering::Acquire) {
            return Err(CmdError::RegionNotFound {
                region_id: ctx.region_id,
            });
        }

        let term = self.term.load(Ordering::Acquire);
        let region = self.region.load();
        let lease = self.remote_lease.load();
        let applied_index_term = self.applied_index_term.load(Ordering::Acquire);

        if ctx.peer.id != self.peer_id {
            return Err(CmdError::Other(format!(
                "mismatch peer id {} != {}",
                ctx.peer.id, self.peer_id
            )));
        }

        if !(ctx.term == 0 || term <= ctx.term + 1) {
            return Err(CmdError::StaleCommand);
        }

        // Get requests only care about the range, not the membership.
        if ctx.region_epoch.version != region.epoch.version {
            return Err(CmdError::EpochNotMatch {
                message: format!(
                    "current epoch of region {} is {:?}, but you sent {:?}",
                    region.id, region.epoch, ctx.region_epoch
                ),
            });
        }

        if applied_index_term != term {
            return Ok(true);
        }
        match lease.as_ref() {
            Some(lease) => Ok(lease.inspect(Some(snap_time)) == LeaseState::Expired),
            None => Ok(true),
        }
    }
}

/// Evaluates read commands against the key-value engine.
pub struct ReadExecutor {
    check_epoch: bool,
}

impl ReadExecutor {
    pub fn new(check_epoch: bool) -> ReadExecutor {
        ReadExecutor { check_epoch }
    }

    pub fn execute(
        &self,
        kv: &dyn KvEngine,
        msg: &RaftCmdRequest,
        region: &Region,
    ) -> RaftCmdResponse {
        if self.check_epoch {
            if let Err(e) = check_region_epoch(msg, region) {
                debug!("[region {}] epoch not match, err: {}", region.id, e);
                let mut resp = RaftCmdResponse::default();
                resp.header.error = Some(e);
                return resp;
            }
        }
        let mut responses = Vec::with_capacity(msg.requests.len());
        for req in &msg.requests {
            let resp = match req {
                Request::Get { key } => match kv.get(key) {
                    Ok(value) => Response::Get { value },
                    Err(e) => {
                        return err_resp(CmdError::Other(e.to_string()), 0);
                    }
                },
                Request::Snap => Response::Snap {
                    region: region.clone(),
                },
                other => panic!("unexpected command in read executor: {other:?}"),
            };
            responses.push(resp);
        }
        RaftCmdResponse {
            responses,
            ..Default::default()
        }
    }
}

/// Evaluates `req` against `kv` and binds `term` to the response header.
pub(crate) fn execute_read(
    kv: &dyn KvEngine,
    req: &RaftCmdRequest,
    region: &Region,
    term: u64,
    check_epoch: bool,
) -> RaftCmdResponse {
    let mut resp = ReadExecutor::new(check_epoch).execute(kv, req, region);
    bind_term(&mut resp, term);
    resp
}
