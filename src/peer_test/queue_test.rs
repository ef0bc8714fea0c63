use std::time::Duration;
use std::time::Instant;

use crate::cmd::Callback;
use crate::errors::CmdError;
use crate::peer::quorum;
use crate::peer::ProposalContext;
use crate::peer::ProposalMeta;
use crate::peer::ProposalQueue;
use crate::peer::ReadIndexQueue;
use crate::peer::ReadIndexRequest;
use crate::peer::RecentAddedPeer;

fn meta(index: u64, term: u64) -> ProposalMeta {
    ProposalMeta {
        index,
        term,
        renew_lease_time: None,
    }
}

#[test]
fn test_proposal_queue_pop_front_respects_term() {
    let mut queue = ProposalQueue::default();
    queue.push(meta(4, 1));
    queue.push(meta(5, 1));
    queue.push(meta(6, 2));

    // Heads of a future term are never popped.
    assert_eq!(queue.pop_front(1), Some(meta(4, 1)));
    assert_eq!(queue.pop_front(1), Some(meta(5, 1)));
    assert_eq!(queue.pop_front(1), None);

    assert_eq!(queue.pop_front(2), Some(meta(6, 2)));
    assert_eq!(queue.pop_front(2), None);
}

#[test]
fn test_proposal_queue_clear() {
    let mut queue = ProposalQueue::default();
    queue.push(meta(4, 1));
    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(queue.pop_front(9), None);
}

#[test]
fn test_read_index_queue_id_allocation() {
    let mut queue = ReadIndexQueue::default();
    assert_eq!(queue.next_id(), 1);
    assert_eq!(queue.next_id(), 2);
    assert_eq!(queue.next_id(), 3);
}

#[test]
fn test_read_index_request_binary_id() {
    let read = ReadIndexRequest::new(0x0102, vec![], None);
    assert_eq!(read.binary_id(), vec![0, 0, 0, 0, 0, 0, 0x01, 0x02]);
}

#[test]
fn test_clear_uncommitted_notifies_stale_and_keeps_ready_prefix() {
    let mut queue = ReadIndexQueue::default();

    let (ready_cb, mut ready_rx) = Callback::pair();
    let (stale_cb1, mut stale_rx1) = Callback::pair();
    let (stale_cb2, mut stale_rx2) = Callback::pair();

    queue
        .reads
        .push_back(ReadIndexRequest::new(1, vec![(Default::default(), ready_cb)], None));
    queue
        .reads
        .push_back(ReadIndexRequest::new(2, vec![(Default::default(), stale_cb1)], None));
    queue
        .reads
        .push_back(ReadIndexRequest::new(3, vec![(Default::default(), stale_cb2)], None));
    queue.ready_cnt = 1;

    queue.clear_uncommitted(7);

    // The confirmed head stays queued and unanswered.
    assert_eq!(queue.reads.len(), 1);
    assert_eq!(queue.reads[0].id, 1);
    assert!(ready_rx.try_recv().is_err());

    for rx in [&mut stale_rx1, &mut stale_rx2] {
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.header.error, Some(CmdError::StaleCommand));
        assert_eq!(resp.header.current_term, 7);
    }
}

#[test]
fn test_proposal_context_round_trip() {
    let flags = [
        ProposalContext::SYNC_LOG,
        ProposalContext::SPLIT,
        ProposalContext::PREPARE_MERGE,
    ];
    // Every legal combination survives encode/decode.
    for bits in 1u8..8 {
        let mut ctx = ProposalContext::default();
        for (i, flag) in flags.iter().enumerate() {
            if bits & (1 << i) != 0 {
                ctx.insert(*flag);
            }
        }
        let bytes = ctx.to_vec();
        assert_eq!(bytes.len(), 1);
        assert_eq!(ProposalContext::from_bytes(&bytes), Some(ctx));
    }
}

#[test]
fn test_proposal_context_empty_encodes_to_nothing() {
    let ctx = ProposalContext::default();
    assert!(ctx.is_empty());
    assert!(ctx.to_vec().is_empty());
    assert_eq!(ProposalContext::from_bytes(&[]), None);
}

#[test]
fn test_proposal_context_contains() {
    let mut ctx = ProposalContext::default();
    ctx.insert(ProposalContext::SYNC_LOG);
    ctx.insert(ProposalContext::PREPARE_MERGE);
    assert!(ctx.contains(ProposalContext::SYNC_LOG));
    assert!(ctx.contains(ProposalContext::PREPARE_MERGE));
    assert!(!ctx.contains(ProposalContext::SPLIT));
}

#[test]
#[should_panic(expected = "invalid proposal context")]
fn test_proposal_context_rejects_long_input() {
    ProposalContext::from_bytes(&[1, 2]);
}

#[test]
fn test_recent_added_peer_window() {
    let mut recent = RecentAddedPeer::new(Duration::from_secs(60));
    assert!(!recent.contains(2));

    recent.update(2, Instant::now());
    assert!(recent.contains(2));
    assert!(!recent.contains(3));

    // Outside the window the veto is lifted.
    recent.added_time = Instant::now() - Duration::from_secs(61);
    assert!(!recent.contains(2));
}

#[test]
fn test_quorum_table() {
    let expected = [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)];
    for (total, want) in expected {
        assert_eq!(quorum(total), want, "quorum({total})");
    }
}
