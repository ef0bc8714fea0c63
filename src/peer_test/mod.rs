mod queue_test;
mod ready_test;

use std::sync::Arc;

use crate::config::RaftStoreConfig;
use crate::metadata::PeerMeta;
use crate::metadata::Region;
use crate::peer::Peer;
use crate::raft::Progress;
use crate::test_utils::new_region;
use crate::test_utils::FakeRaftNode;
use crate::test_utils::MemPeerStorage;
use crate::test_utils::MemStorageCore;

pub(crate) const TERM: u64 = 5;
pub(crate) const APPLIED: u64 = 10;
pub(crate) const TRUNCATED: u64 = 5;

pub(crate) fn three_peer_region() -> Region {
    new_region(
        1,
        vec![PeerMeta::new(1, 1), PeerMeta::new(2, 2), PeerMeta::new(3, 3)],
    )
}

pub(crate) fn seed_storage(core: &MemStorageCore) {
    use std::sync::atomic::Ordering::SeqCst;
    core.applied_index.store(APPLIED, SeqCst);
    core.applied_index_term.store(TERM, SeqCst);
    core.truncated_index.store(TRUNCATED, SeqCst);
    core.last_index.store(APPLIED, SeqCst);
}

/// A three-voter region led by peer 1, everyone fully replicated.
pub(crate) fn leader_peer() -> (Peer, FakeRaftNode, Arc<MemStorageCore>) {
    let cfg = RaftStoreConfig::default();
    leader_peer_with_cfg(&cfg)
}

pub(crate) fn leader_peer_with_cfg(
    cfg: &RaftStoreConfig,
) -> (Peer, FakeRaftNode, Arc<MemStorageCore>) {
    let raft = FakeRaftNode::leader(1, TERM);
    {
        let mut core = raft.core();
        core.last_index = APPLIED;
        for id in 1..=3 {
            core.progress.insert(
                id,
                Progress {
                    matched: APPLIED,
                    ..Default::default()
                },
            );
        }
    }
    let storage = MemPeerStorage::new(three_peer_region());
    seed_storage(&storage.core);
    let storage_core = storage.handle();
    let peer = Peer::new(
        1,
        cfg,
        Box::new(storage),
        Box::new(raft.clone()),
        PeerMeta::new(1, 1),
    )
    .unwrap();
    (peer, raft, storage_core)
}

pub(crate) fn follower_peer() -> (Peer, FakeRaftNode, Arc<MemStorageCore>) {
    let cfg = RaftStoreConfig::default();
    let raft = FakeRaftNode::follower(1, 2, TERM);
    let storage = MemPeerStorage::new(three_peer_region());
    seed_storage(&storage.core);
    let storage_core = storage.handle();
    let peer = Peer::new(
        1,
        &cfg,
        Box::new(storage),
        Box::new(raft.clone()),
        PeerMeta::new(1, 1),
    )
    .unwrap();
    (peer, raft, storage_core)
}
