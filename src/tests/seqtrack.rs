use super::*;

use crate::reliability::{Coverage, ReliabilityState, SeqTracker};

#[test]
fn adjacent_records_merge() {
    let mut t = SeqTracker::new();
    assert!(t.record(1));
    assert!(t.record(3));
    assert_eq!(t.num_ranges(), 2);
    assert_eq!(t.largest_in_order(), 1);

    assert!(t.record(2));
    assert_eq!(t.num_ranges(), 1);
    assert_eq!(t.largest_in_order(), 3);

    assert!(t.record_range(5, 9));
    assert!(t.record_range(4, 4));
    assert_eq!(t.num_ranges(), 1);
    assert_eq!(t.largest_in_order(), 9);
}

#[test]
fn zero_is_never_recorded() {
    let mut t = SeqTracker::new();
    assert!(!t.record(0));
    assert!(!t.record_range(7, 3));
    assert_eq!(t.num_ranges(), 0);
    assert_eq!(t.largest_in_order(), 0);
}

#[test]
fn erase_splits_ranges() {
    let mut t = SeqTracker::new();
    t.record_range(1, 10);
    assert!(t.erase(5));
    assert_eq!(t.num_ranges(), 2);
    assert_eq!(t.largest_in_order(), 4);
    assert!(!t.is_recorded(5));
    assert!(t.is_recorded(6));

    assert!(t.erase_range(1, 2));
    assert_eq!(t.largest_in_order(), 0);
    assert_eq!(t.coverage(3, 10), Coverage::Partial);
    assert_eq!(t.coverage(6, 10), Coverage::Complete);
    assert_eq!(t.coverage(11, 20), Coverage::None);

    assert!(!t.erase(42));
}

#[test]
fn overlapping_records_coalesce() {
    let mut t = SeqTracker::new();
    t.record_range(10, 20);
    t.record_range(30, 40);
    t.record_range(15, 35);
    assert_eq!(t.num_ranges(), 1);
    assert_eq!(t.coverage(10, 40), Coverage::Complete);
    assert_eq!(t.coverage(9, 40), Coverage::Partial);
}

#[test]
fn record_if_not_recorded_reports_duplicates() {
    let mut t = SeqTracker::new();
    assert!(!t.record_if_not_recorded(4));
    assert!(t.record_if_not_recorded(4));
    assert!(!t.record_if_not_recorded(5));
    assert_eq!(t.num_ranges(), 1);
}

#[test]
fn peer_state_is_independent() {
    let rel = ReliabilityState::new(3, true);
    assert_eq!(rel.next_frag_seq(1), 1);
    assert_eq!(rel.next_frag_seq(1), 2);
    assert_eq!(rel.next_frag_seq(2), 1);

    rel.update_ack_info(1, 5, 7);
    rel.update_ack_info(1, 3, 4);
    let info = rel.ack_info(1);
    assert_eq!(info.delivered_largest_inorder, 5);
    assert_eq!(info.received_largest_inorder, 7);
    assert_eq!(rel.ack_info(2).delivered_largest_inorder, 0);

    rel.with_recv_seqs(0, |s| s.received.record(1));
    assert!(rel.with_recv_seqs(0, |s| s.received.is_recorded(1)));
    assert!(!rel.with_recv_seqs(2, |s| s.received.is_recorded(1)));
}
