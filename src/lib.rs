//! # multiraft
//!
//! Per-region Raft peer controller for multi-raft key-value stores.
//!
//! One [`Peer`] coordinates everything that happens to a single replica of a
//! single data range: consensus messages, the proposal pipeline, the
//! linearizable read fast path behind a leader lease, membership-change
//! safety checks, snapshot application and the peer lifecycle up to its
//! tombstone.
//!
//! ## What this crate provides
//!
//! - **Lease-guarded local reads** - a [`Lease`] owned by the peer executor
//!   plus a lock-free [`RemoteLease`]/[`LeaderChecker`] pair foreign reader
//!   threads consult without touching the peer
//! - **Read-index pipeline** - coalescing quorum reads, answered strictly in
//!   confirmation order
//! - **Proposal pipeline** - side-band [`ProposalContext`] bits (sync-log,
//!   split, prepare-merge) reconciled at apply time
//! - **Conf-change safety** - quorum health checks before any membership
//!   change is proposed
//! - **Lifecycle** - create, activate, destroy with a tombstone that
//!   survives crashes between the two engine writes
//!
//! ## What this crate does not provide
//!
//! The consensus algorithm, durable storage, the apply executor and the
//! transport are **your responsibility**: the controller drives them through
//! the [`RaftNode`], [`PeerStorage`], [`KvEngine`]/[`RaftEngine`] and
//! [`Transport`] traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   Store (router, workers, PD)             │
//! ├───────────────────────────────────────────┤
//! │   multiraft::Peer                         │  ← You are here
//! ├───────────────────────────────────────────┤
//! │   Consensus │ PeerStorage │ Transport     │  ← You implement
//! └───────────────────────────────────────────┘
//! ```
//!
//! The peer is single-threaded: one store executor drives `step`,
//! `handle_raft_ready_*`, `propose` and `post_apply` in strict serial order.
//! Only the [`LeaderChecker`] crosses threads, and it is nothing but atomics
//! and atomically republished `Arc`s.

pub mod apply;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod lease;
pub mod metadata;
pub mod metrics;
pub mod pd;
pub mod peer;
pub mod raft;
pub mod read;
pub mod storage;
pub mod transport;

pub use apply::*;
pub use cmd::*;
pub use config::*;
pub use errors::*;
pub use lease::*;
pub use metadata::*;
pub use pd::*;
pub use peer::*;
pub use raft::*;
pub use read::*;
pub use storage::*;
pub use transport::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod lease_test;
#[cfg(test)]
mod peer_test;
