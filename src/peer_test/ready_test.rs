use std::sync::atomic::Ordering::SeqCst;
use std::time::Instant;

use super::follower_peer;
use super::leader_peer;
use super::seed_storage;
use super::APPLIED;
use super::TERM;
use crate::apply::ApplyMetrics;
use crate::apply::ApplyMsg;
use crate::apply::ApplyMsgs;
use crate::cmd::Callback;
use crate::config::RaftStoreConfig;
use crate::errors::CmdError;
use crate::lease::LeaseState;
use crate::metadata::ApplyState;
use crate::metadata::PeerMeta;
use crate::metadata::TruncatedState;
use crate::peer::Peer;
use crate::peer::ProposalContext;
use crate::peer::ReadIndexRequest;
use crate::raft::Entry;
use crate::raft::EntryType;
use crate::raft::Message;
use crate::raft::MessageType;
use crate::raft::ReadState;
use crate::raft::Ready;
use crate::raft::SoftState;
use crate::raft::StateRole;
use crate::storage::GenSnapTask;
use crate::storage::WriteBatch;
use crate::test_utils::new_get_cmd;
use crate::test_utils::new_region;
use crate::test_utils::new_snap_cmd;
use crate::test_utils::FakeRaftNode;
use crate::test_utils::MemKvEngine;
use crate::test_utils::MemPeerStorage;
use crate::test_utils::RecordingObserver;
use crate::test_utils::VecTransport;
use crate::transport::MockTransport;

fn committed_entry(index: u64, term: u64, context: Vec<u8>) -> Entry {
    Entry {
        entry_type: EntryType::Normal,
        term,
        index,
        data: b"payload".to_vec(),
        context,
    }
}

fn drive_ready(peer: &mut Peer, raft: &FakeRaftNode, ready: Ready) -> ApplyMsgs {
    raft.push_ready(ready);
    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    let (mut ready, invoke_ctx) = peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .expect("ready");
    peer.post_raft_ready_persistent(&mut trans, &mut apply_msgs, &mut ready, invoke_ctx);
    let kv = MemKvEngine::default();
    peer.handle_raft_ready_apply(&kv, &mut apply_msgs, ready);
    apply_msgs
}

#[test]
fn test_single_peer_region_campaigns_and_serves_local_reads() {
    let cfg = RaftStoreConfig::default();
    let region = new_region(1, vec![PeerMeta::new(1, 1)]);
    let raft = FakeRaftNode::follower(1, 0, 0);
    let storage = MemPeerStorage::new(region);
    seed_storage(&storage.core);
    // After the self-election the current term is 1 and it is applied.
    storage.core.applied_index_term.store(1, SeqCst);
    let storage_core = storage.handle();

    let mut peer = Peer::new(
        1,
        &cfg,
        Box::new(storage),
        Box::new(raft.clone()),
        PeerMeta::new(1, 1),
    )
    .unwrap();

    // The peer elected itself at creation.
    assert_eq!(raft.core().campaign_calls, 1);
    assert!(peer.is_leader());
    assert_eq!(peer.term(), 1);

    // The first ready confirms leadership and renews the lease.
    let ready = Ready {
        soft_state: Some(SoftState {
            leader_id: 1,
            raft_state: StateRole::Leader,
        }),
        ..Default::default()
    };
    raft.push_ready(ready);
    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    let (mut ready, invoke_ctx) = peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .expect("ready");
    peer.post_raft_ready_persistent(&mut trans, &mut apply_msgs, &mut ready, invoke_ctx);
    let kv = MemKvEngine::default();
    peer.handle_raft_ready_apply(&kv, &mut apply_msgs, ready);

    assert_eq!(observer.events.lock().as_slice(), &[(1, StateRole::Leader)]);
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Valid);

    // A Get with a matching epoch is answered without any quorum round.
    kv.put(b"k", b"v");
    let cmd = new_get_cmd(&peer.region().clone(), &peer.meta.clone(), b"k");
    let (cb, mut rx) = Callback::pair();
    assert!(!peer.propose(&kv, &cfg, cmd, cb));
    let resp = rx.try_recv().unwrap();
    assert!(resp.header.error.is_none());
    assert!(raft.core().read_index_requests.is_empty());
    drop(storage_core);
}

#[test]
fn test_leader_sends_messages_before_persisting() {
    let (mut peer, raft, _) = leader_peer();
    raft.push_ready(Ready {
        messages: vec![Message::new(MessageType::Append, 1, 2)],
        ..Default::default()
    });

    let mut trans = MockTransport::new();
    trans
        .expect_send()
        .times(1)
        .withf(|msg| msg.to_peer.id == 2 && msg.message.msg_type == MessageType::Append)
        .returning(|_| Ok(()));

    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    let (ready, _invoke_ctx) = peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .expect("ready");
    // The messages were taken out and sent before the persist hand-off.
    assert!(ready.messages.is_empty());
}

#[test]
fn test_follower_buffers_messages_while_applying_snapshot() {
    let (mut peer, raft, storage) = follower_peer();
    raft.push_ready(Ready {
        messages: vec![Message::new(MessageType::AppendResponse, 1, 2)],
        ..Default::default()
    });

    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    let (mut ready, invoke_ctx) = peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .expect("ready");

    // The snapshot application starts after the durable write.
    storage.applying_snapshot.store(true, SeqCst);
    peer.post_raft_ready_persistent(&mut trans, &mut apply_msgs, &mut ready, invoke_ctx);

    assert!(trans.sent.is_empty());
    assert_eq!(peer.pending_messages.len(), 1);

    // Once the snapshot finished, the next append cycle flushes the buffer.
    storage.applying_snapshot.store(false, SeqCst);
    raft.push_ready(Ready::default());
    peer.handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer);
    assert_eq!(trans.sent.len(), 1);
    assert!(peer.pending_messages.is_empty());
}

#[test]
fn test_committed_entries_are_forwarded_once_in_order() {
    let (mut peer, raft, _) = leader_peer();
    let entries = vec![
        committed_entry(APPLIED + 1, TERM, vec![]),
        committed_entry(APPLIED + 2, TERM, vec![]),
    ];
    let apply_msgs = drive_ready(
        &mut peer,
        &raft,
        Ready {
            committed_entries: entries,
            ..Default::default()
        },
    );

    assert_eq!(peer.last_applying_idx, APPLIED + 2);
    let apply = apply_msgs
        .msgs
        .iter()
        .find_map(|m| match m {
            ApplyMsg::Apply(apply) => Some(apply),
            _ => None,
        })
        .expect("apply batch");
    assert_eq!(apply.region_id, 1);
    assert_eq!(apply.term, TERM);
    let indexes: Vec<u64> = apply.entries.iter().map(|e| e.index).collect();
    assert_eq!(indexes, vec![APPLIED + 1, APPLIED + 2]);
    assert_eq!(raft.core().advance_calls, 1);
}

#[test]
fn test_lease_renewed_when_own_proposal_commits() {
    let (mut peer, raft, _) = leader_peer();
    let kv = MemKvEngine::default();
    let cfg = RaftStoreConfig::default();

    // Propose a write, then forget the lease before the commit arrives.
    let cmd = crate::test_utils::new_put_cmd(&peer.region().clone(), &peer.meta.clone(), b"k", b"v");
    assert!(peer.propose(&kv, &cfg, cmd, Callback::none()));
    peer.leader_lease.expire();
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Expired);

    drive_ready(
        &mut peer,
        &raft,
        Ready {
            committed_entries: vec![committed_entry(APPLIED + 1, TERM, vec![])],
            ..Default::default()
        },
    );
    // The recorded propose time of the committed proposal renewed the lease.
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Valid);
}

#[test]
fn test_prepare_merge_commit_suspects_lease_and_forces_read_index() {
    let (mut peer, raft, storage) = leader_peer();
    peer.maybe_renew_leader_lease(Instant::now());
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Valid);

    let merge_idx = APPLIED + 1;
    let mut ctx = ProposalContext::SYNC_LOG;
    ctx.insert(ProposalContext::PREPARE_MERGE);
    drive_ready(
        &mut peer,
        &raft,
        Ready {
            committed_entries: vec![committed_entry(merge_idx, TERM, ctx.to_vec())],
            ..Default::default()
        },
    );

    // The committed prepare-merge parked the lease in suspect.
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Suspect);
    assert_eq!(peer.last_committed_prepare_merge_idx, merge_idx);
    assert!(peer.is_merging());

    // While between commit and apply, even quorum reads are refused.
    let kv = MemKvEngine::default();
    let cfg = RaftStoreConfig::default();
    let (cb, mut rx) = Callback::pair();
    let cmd = new_snap_cmd(&peer.region().clone(), &peer.meta.clone());
    assert!(!peer.propose(&kv, &cfg, cmd.clone(), cb));
    match rx.try_recv().unwrap().header.error {
        Some(CmdError::ProposalRefused(msg)) => assert!(msg.contains("merge")),
        other => panic!("unexpected error: {other:?}"),
    }

    // After the merge entry is applied the read goes through read-index, not
    // the local path: the lease stays suspect.
    peer.post_apply(
        &kv,
        ApplyState {
            applied_index: merge_idx,
            truncated_state: TruncatedState {
                index: super::TRUNCATED,
                term: TERM,
            },
        },
        TERM,
        false,
        &ApplyMetrics::default(),
    );
    assert!(!peer.is_merging());
    let (cb, _rx) = Callback::pair();
    assert!(peer.propose(&kv, &cfg, cmd, cb));
    assert_eq!(raft.core().read_index_requests.len(), 1);
    drop(storage);
}

#[test]
fn test_split_commit_blocks_reads_until_applied() {
    let (mut peer, raft, _) = leader_peer();
    peer.maybe_renew_leader_lease(Instant::now());

    let split_idx = APPLIED + 1;
    let mut ctx = ProposalContext::SYNC_LOG;
    ctx.insert(ProposalContext::SPLIT);
    drive_ready(
        &mut peer,
        &raft,
        Ready {
            committed_entries: vec![committed_entry(split_idx, TERM, ctx.to_vec())],
            ..Default::default()
        },
    );

    assert_eq!(peer.last_committed_split_idx, split_idx);
    assert!(peer.is_splitting());
    // The lease itself is not suspected by a split.
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Valid);

    // But no read is served locally while the split is unapplied.
    let kv = MemKvEngine::default();
    let cfg = RaftStoreConfig::default();
    let (cb, mut rx) = Callback::pair();
    let cmd = new_snap_cmd(&peer.region().clone(), &peer.meta.clone());
    assert!(!peer.propose(&kv, &cfg, cmd, cb));
    match rx.try_recv().unwrap().header.error {
        Some(CmdError::ProposalRefused(msg)) => assert!(msg.contains("split")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_stale_proposal_context_of_old_term_is_ignored() {
    let (mut peer, raft, _) = leader_peer();
    let mut ctx = ProposalContext::SYNC_LOG;
    ctx.insert(ProposalContext::PREPARE_MERGE);
    drive_ready(
        &mut peer,
        &raft,
        Ready {
            // Committed entry of a previous term.
            committed_entries: vec![committed_entry(APPLIED + 1, TERM - 1, ctx.to_vec())],
            ..Default::default()
        },
    );
    assert_eq!(peer.last_committed_prepare_merge_idx, 0);
    assert!(!peer.is_merging());
}

#[test]
fn test_urgent_proposal_restores_lazy_broadcast_after_apply() {
    let (mut peer, raft, _) = leader_peer();
    let kv = MemKvEngine::default();
    let cfg = RaftStoreConfig::default();

    let cmd = crate::test_utils::new_admin_cmd(
        &peer.region().clone(),
        &peer.meta.clone(),
        crate::cmd::AdminRequest::Split {
            split_key: b"m".to_vec(),
            new_region_id: 2,
        },
    );
    assert!(peer.propose(&kv, &cfg, cmd, Callback::none()));
    assert_eq!(raft.core().skip_bcast_commit_calls, vec![false]);

    let mut ctx = ProposalContext::SYNC_LOG;
    ctx.insert(ProposalContext::SPLIT);
    drive_ready(
        &mut peer,
        &raft,
        Ready {
            committed_entries: vec![committed_entry(APPLIED + 1, TERM, ctx.to_vec())],
            ..Default::default()
        },
    );
    assert_eq!(raft.core().skip_bcast_commit_calls, vec![false, true]);
}

#[test]
fn test_apply_reads_defers_until_term_is_applied() {
    let (mut peer, raft, storage) = leader_peer();
    // The tail of the previous leader is not applied yet.
    storage.applied_index_term.store(TERM - 1, SeqCst);

    let kv = MemKvEngine::default();
    let cfg = RaftStoreConfig::default();
    let cmd = new_snap_cmd(&peer.region().clone(), &peer.meta.clone());
    let (cb, mut rx) = Callback::pair();
    assert!(peer.propose(&kv, &cfg, cmd, cb));

    drive_ready(
        &mut peer,
        &raft,
        Ready {
            read_states: vec![ReadState {
                index: APPLIED,
                request_ctx: 1u64.to_be_bytes().to_vec(),
            }],
            ..Default::default()
        },
    );

    // Confirmed but not answered: the reply waits for the apply pipeline.
    assert_eq!(peer.pending_reads.ready_cnt, 1);
    assert!(rx.try_recv().is_err());

    // Applying an entry of the current term releases the queued read.
    peer.post_apply(
        &kv,
        ApplyState {
            applied_index: APPLIED + 1,
            truncated_state: TruncatedState {
                index: super::TRUNCATED,
                term: TERM,
            },
        },
        TERM,
        false,
        &ApplyMetrics::default(),
    );
    assert_eq!(peer.pending_reads.ready_cnt, 0);
    let resp = rx.try_recv().unwrap();
    assert!(resp.header.error.is_none());
}

#[test]
fn test_role_change_drops_uncommitted_reads() {
    let (mut peer, raft, _) = leader_peer();

    let (cb, mut rx) = Callback::pair();
    peer.pending_reads.reads.push_back(ReadIndexRequest::new(
        1,
        vec![(Default::default(), cb)],
        Some(Instant::now()),
    ));

    // Stepping down: raft reports a soft state change.
    raft.core().state = StateRole::Follower;
    drive_ready(
        &mut peer,
        &raft,
        Ready {
            soft_state: Some(SoftState {
                leader_id: 2,
                raft_state: StateRole::Follower,
            }),
            ..Default::default()
        },
    );

    let resp = rx.try_recv().unwrap();
    assert_eq!(resp.header.error, Some(CmdError::StaleCommand));
    assert!(peer.pending_reads.reads.is_empty());
    // Stale proposals die with the leadership.
    assert!(peer.proposals.is_empty());
}

#[test]
fn test_stepping_down_expires_lease() {
    let (mut peer, raft, _) = leader_peer();
    peer.maybe_renew_leader_lease(Instant::now());
    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Valid);

    raft.core().state = StateRole::Follower;
    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    raft.push_ready(Ready {
        soft_state: Some(SoftState {
            leader_id: 2,
            raft_state: StateRole::Follower,
        }),
        ..Default::default()
    });
    let (mut ready, invoke_ctx) = peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .expect("ready");
    peer.post_raft_ready_persistent(&mut trans, &mut apply_msgs, &mut ready, invoke_ctx);

    assert_eq!(peer.leader_lease.inspect(None), LeaseState::Expired);
    assert_eq!(observer.events.lock().as_slice(), &[(1, StateRole::Follower)]);
}

#[test]
fn test_snapshot_apply_fast_forwards_applying_index() {
    let (mut peer, raft, storage) = follower_peer();
    storage.applying_snapshot.store(true, SeqCst);
    storage.truncated_index.store(APPLIED + 10, SeqCst);

    let kv = MemKvEngine::default();
    let mut apply_msgs = ApplyMsgs::default();
    peer.handle_raft_ready_apply(&kv, &mut apply_msgs, Ready::default());

    assert_eq!(peer.last_applying_idx, APPLIED + 10);
    // The apply cursor is advanced to the snapshot index as well.
    assert_eq!(raft.core().advance_apply_calls, vec![APPLIED + 10]);
    assert!(apply_msgs.msgs.is_empty());
}

#[test]
fn test_ready_skipped_while_applying_snapshot() {
    let (mut peer, raft, storage) = follower_peer();
    storage.applying_snapshot.store(true, SeqCst);
    raft.push_ready(Ready::default());

    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    assert!(peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .is_none());
}

#[test]
fn test_pending_snapshot_waits_for_apply_pipeline() {
    let (mut peer, raft, storage) = follower_peer();
    raft.core().pending_snapshot = Some(Default::default());
    // The apply pipeline still owes two entries.
    peer.last_applying_idx = APPLIED + 2;

    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    raft.push_ready(Ready::default());
    assert!(peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .is_none());

    // Draining the pipeline makes the snapshot installable; post_apply asks
    // for another ready cycle.
    let kv = MemKvEngine::default();
    let need_ready = peer.post_apply(
        &kv,
        ApplyState {
            applied_index: APPLIED + 2,
            truncated_state: TruncatedState {
                index: super::TRUNCATED,
                term: TERM,
            },
        },
        TERM,
        false,
        &ApplyMetrics::default(),
    );
    assert!(need_ready);
    drop(storage);
}

#[test]
fn test_gen_snap_task_is_handed_to_apply_worker() {
    let cfg = RaftStoreConfig::default();
    let raft = FakeRaftNode::leader(1, TERM);
    let mut storage = MemPeerStorage::new(super::three_peer_region());
    seed_storage(&storage.core);
    storage.gen_snap_task = Some(GenSnapTask { region_id: 1 });

    let mut peer = Peer::new(
        1,
        &cfg,
        Box::new(storage),
        Box::new(raft.clone()),
        PeerMeta::new(1, 1),
    )
    .unwrap();

    let mut trans = VecTransport::default();
    let mut apply_msgs = ApplyMsgs::default();
    let mut kv_wb = WriteBatch::new();
    let mut raft_wb = WriteBatch::new();
    let observer = RecordingObserver::default();
    // No ready queued: the call returns nothing but still forwards the task.
    assert!(peer
        .handle_raft_ready_append(&mut trans, &mut apply_msgs, &mut kv_wb, &mut raft_wb, &observer)
        .is_none());
    assert!(matches!(apply_msgs.msgs[0], ApplyMsg::Snapshot(_)));
}

#[test]
fn test_post_apply_updates_statistics_and_checker() {
    let (mut peer, _raft, storage) = leader_peer();
    let kv = MemKvEngine::default();

    let metrics = ApplyMetrics {
        written_bytes: 100,
        written_keys: 3,
        delete_keys_hint: 1,
        size_diff_hint: 42,
    };
    peer.post_apply(
        &kv,
        ApplyState {
            applied_index: APPLIED + 1,
            truncated_state: TruncatedState {
                index: super::TRUNCATED,
                term: TERM,
            },
        },
        TERM,
        false,
        &metrics,
    );

    assert_eq!(peer.peer_stat.written_bytes, 100);
    assert_eq!(peer.peer_stat.written_keys, 3);
    assert_eq!(peer.size_diff_hint, 42);
    assert_eq!(storage.applied_index.load(SeqCst), APPLIED + 1);

    // A negative size delta saturates at zero.
    let metrics = ApplyMetrics {
        size_diff_hint: -100,
        ..Default::default()
    };
    peer.post_apply(
        &kv,
        ApplyState {
            applied_index: APPLIED + 2,
            truncated_state: TruncatedState {
                index: super::TRUNCATED,
                term: TERM,
            },
        },
        TERM,
        false,
        &metrics,
    );
    assert_eq!(peer.size_diff_hint, 0);
}
