//! The command model: what clients and the store ask a peer to do, and how
//! answers travel back.
//!
//! Requests are marshalled with `bincode` into opaque log-entry payloads;
//! responses are returned through a oneshot [`Callback`] with the peer's
//! current term bound to the header.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::errors::CmdError;
use crate::metadata::PeerMeta;
use crate::metadata::Region;
use crate::metadata::RegionEpoch;
use crate::raft::ConfChangeType;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftRequestHeader {
    pub region_id: u64,
    pub peer: PeerMeta,
    pub region_epoch: RegionEpoch,
    /// Term the sender observed; 0 means unknown.
    pub term: u64,
    /// Forces a quorum read even when a local read would be legal.
    pub read_quorum: bool,
    pub sync_log: bool,
}

/// A single data sub-command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get { key: Vec<u8> },
    Snap,
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { start_key: Vec<u8>, end_key: Vec<u8> },
    IngestSst { sst_id: u64 },
    /// Legacy command no longer served; always rejected.
    Prewrite,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCmdType {
    ChangePeer,
    Split,
    BatchSplit,
    PrepareMerge,
    CommitMerge,
    RollbackMerge,
    TransferLeader,
    ComputeHash,
    VerifyHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    ChangePeer {
        change_type: ConfChangeType,
        peer: PeerMeta,
    },
    Split {
        split_key: Vec<u8>,
        new_region_id: u64,
    },
    BatchSplit {
        split_keys: Vec<Vec<u8>>,
    },
    PrepareMerge {
        /// Stamped by the leader right before proposing; see
        /// `Peer::pre_propose_prepare_merge`.
        min_index: u64,
        target: Region,
    },
    CommitMerge {
        source: Region,
        commit: u64,
    },
    RollbackMerge {
        commit: u64,
    },
    TransferLeader {
        peer: PeerMeta,
    },
    ComputeHash,
    VerifyHash {
        index: u64,
        hash: Vec<u8>,
    },
}

impl AdminRequest {
    pub fn cmd_type(&self) -> AdminCmdType {
        match self {
            AdminRequest::ChangePeer { .. } => AdminCmdType::ChangePeer,
            AdminRequest::Split { .. } => AdminCmdType::Split,
            AdminRequest::BatchSplit { .. } => AdminCmdType::BatchSplit,
            AdminRequest::PrepareMerge { .. } => AdminCmdType::PrepareMerge,
            AdminRequest::CommitMerge { .. } => AdminCmdType::CommitMerge,
            AdminRequest::RollbackMerge { .. } => AdminCmdType::RollbackMerge,
            AdminRequest::TransferLeader { .. } => AdminCmdType::TransferLeader,
            AdminRequest::ComputeHash => AdminCmdType::ComputeHash,
            AdminRequest::VerifyHash { .. } => AdminCmdType::VerifyHash,
        }
    }
}

/// A batch of data sub-commands or one admin command for a single region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftCmdRequest {
    pub header: RaftRequestHeader,
    pub requests: Vec<Request>,
    pub admin_request: Option<AdminRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Get { value: Option<bytes::Bytes> },
    Snap { region: Region },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminResponse {
    pub cmd_type: AdminCmdType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftResponseHeader {
    pub error: Option<CmdError>,
    pub current_term: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftCmdResponse {
    pub header: RaftResponseHeader,
    pub responses: Vec<Response>,
    pub admin_response: Option<AdminResponse>,
}

/// One-shot answer channel for a command.
///
/// Dropping an unfired callback closes the channel, which the waiting side
/// observes as a canceled request.
#[derive(Debug)]
pub struct Callback {
    tx: Option<oneshot::Sender<RaftCmdResponse>>,
}

impl Callback {
    /// A connected callback plus the receiver the caller awaits.
    pub fn pair() -> (Callback, oneshot::Receiver<RaftCmdResponse>) {
        let (tx, rx) = oneshot::channel();
        (Callback { tx: Some(tx) }, rx)
    }

    /// A callback nobody listens to (internal proposals).
    pub fn none() -> Callback {
        Callback { tx: None }
    }

    pub fn done(mut self, resp: RaftCmdResponse) {
        if let Some(tx) = self.tx.take() {
            // The caller may have given up waiting; that is not our problem.
            let _ = tx.send(resp);
        }
    }
}

pub fn bind_error(resp: &mut RaftCmdResponse, err: CmdError) {
    resp.header.error = Some(err);
}

pub fn bind_term(resp: &mut RaftCmdResponse, term: u64) {
    if term != 0 {
        resp.header.current_term = term;
    }
}

/// A response carrying only an error, bound to the given term.
pub fn err_resp(err: CmdError, term: u64) -> RaftCmdResponse {
    let mut resp = RaftCmdResponse::default();
    bind_error(&mut resp, err);
    bind_term(&mut resp, term);
    resp
}

pub fn make_transfer_leader_response() -> RaftCmdResponse {
    RaftCmdResponse {
        admin_response: Some(AdminResponse {
            cmd_type: AdminCmdType::TransferLeader,
        }),
        ..Default::default()
    }
}

pub fn get_change_peer_cmd(req: &RaftCmdRequest) -> Option<(ConfChangeType, &PeerMeta)> {
    match &req.admin_request {
        Some(AdminRequest::ChangePeer { change_type, peer }) => Some((*change_type, peer)),
        _ => None,
    }
}

pub fn get_transfer_leader_cmd(req: &RaftCmdRequest) -> Option<&PeerMeta> {
    match &req.admin_request {
        Some(AdminRequest::TransferLeader { peer }) => Some(peer),
        _ => None,
    }
}

/// Epoch-affecting admin commands must always be synced to disk before the
/// response is sent; plain data commands follow the header flag.
pub fn get_sync_log_from_request(req: &RaftCmdRequest) -> bool {
    if let Some(admin) = &req.admin_request {
        return matches!(
            admin.cmd_type(),
            AdminCmdType::ChangePeer
                | AdminCmdType::Split
                | AdminCmdType::BatchSplit
                | AdminCmdType::PrepareMerge
                | AdminCmdType::CommitMerge
                | AdminCmdType::RollbackMerge
        );
    }
    req.header.sync_log
}

/// Whether the request should be committed on all followers as soon as
/// possible instead of riding the lazy broadcast-commit optimization.
pub fn is_urgent_request(req: &RaftCmdRequest) -> bool {
    match &req.admin_request {
        None => false,
        Some(admin) => matches!(
            admin.cmd_type(),
            AdminCmdType::Split
                | AdminCmdType::BatchSplit
                | AdminCmdType::ChangePeer
                | AdminCmdType::ComputeHash
                | AdminCmdType::VerifyHash
                | AdminCmdType::PrepareMerge
                | AdminCmdType::CommitMerge
                | AdminCmdType::RollbackMerge
        ),
    }
}

/// Checks the request epoch against the current region epoch. Which halves
/// are compared depends on the command: membership changes care about
/// `conf_ver`, range changes about `version`, data reads only about
/// `version`.
pub fn check_region_epoch(
    req: &RaftCmdRequest,
    region: &Region,
) -> std::result::Result<(), CmdError> {
    let (check_ver, check_conf_ver) = match &req.admin_request {
        None => (true, false),
        Some(admin) => match admin.cmd_type() {
            AdminCmdType::ChangePeer => (false, true),
            AdminCmdType::Split
            | AdminCmdType::BatchSplit
            | AdminCmdType::PrepareMerge
            | AdminCmdType::CommitMerge
            | AdminCmdType::RollbackMerge => (true, true),
            AdminCmdType::TransferLeader | AdminCmdType::ComputeHash | AdminCmdType::VerifyHash => {
                (false, false)
            }
        },
    };
    if !check_ver && !check_conf_ver {
        return Ok(());
    }

    let from = &req.header.region_epoch;
    let current = &region.epoch;
    if (check_ver && from.version != current.version)
        || (check_conf_ver && from.conf_ver != current.conf_ver)
    {
        return Err(CmdError::EpochNotMatch {
            message: format!(
                "current epoch of region {} is {:?}, but you sent {:?}",
                region.id, current, from
            ),
        });
    }
    Ok(())
}
