//! Fragment sequencing for reliable delivery.
//!
//! Every sequenced fragment a process sends to a peer carries a number from
//! that peer's counter, starting at 1. Receivers track which numbers they
//! have received and delivered as sets of disjoint ranges and report the
//! largest in-order value of each in every ACK; senders keep the latest
//! report per peer to prune their retransmission window.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::type_alias::*;
use crate::util::lock::SpinLock;

/// Set of sequence numbers, stored as disjoint, non-adjacent inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqTracker {
    /// Lower bound -> upper bound.
    ranges: BTreeMap<FragSeq, FragSeq>,
}

/// Coverage of a range by a [`SeqTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    None,
    Partial,
    Complete,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored ranges.
    #[inline]
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Record a single sequence number. Zero is never recorded.
    #[inline]
    pub fn record(&mut self, seq: FragSeq) -> bool {
        self.record_range(seq, seq)
    }

    /// Record `[lower, upper]`, merging with overlapping or adjacent ranges.
    pub fn record_range(&mut self, lower: FragSeq, upper: FragSeq) -> bool {
        if lower == 0 || lower > upper {
            return false;
        }
        let (mut lo, mut hi) = (lower, upper);
        let touching = self
            .ranges
            .range(..=upper.saturating_add(1))
            .rev()
            .take_while(|&(_, &h)| h.saturating_add(1) >= lower)
            .map(|(&l, &h)| (l, h))
            .collect::<Vec<_>>();
        for (l, h) in touching {
            self.ranges.remove(&l);
            lo = lo.min(l);
            hi = hi.max(h);
        }
        self.ranges.insert(lo, hi);
        true
    }

    /// How much of `[lower, upper]` is recorded.
    pub fn coverage(&self, lower: FragSeq, upper: FragSeq) -> Coverage {
        if lower > upper {
            return Coverage::None;
        }
        let covered = self
            .ranges
            .range(..=upper)
            .rev()
            .take_while(|&(_, &h)| h >= lower)
            .map(|(&l, &h)| h.min(upper) - l.max(lower) + 1)
            .sum::<u64>();
        match covered {
            0 => Coverage::None,
            n if n == upper - lower + 1 => Coverage::Complete,
            _ => Coverage::Partial,
        }
    }

    #[inline]
    pub fn is_recorded(&self, seq: FragSeq) -> bool {
        self.coverage(seq, seq) == Coverage::Complete
    }

    /// Record `seq` unless already present. Return whether it was present.
    pub fn record_if_not_recorded(&mut self, seq: FragSeq) -> bool {
        if self.is_recorded(seq) {
            return true;
        }
        self.record(seq);
        false
    }

    /// Remove a single sequence number.
    #[inline]
    pub fn erase(&mut self, seq: FragSeq) -> bool {
        self.erase_range(seq, seq)
    }

    /// Remove `[lower, upper]`, splitting ranges that straddle it. Return
    /// whether anything was removed.
    pub fn erase_range(&mut self, lower: FragSeq, upper: FragSeq) -> bool {
        if lower > upper {
            return false;
        }
        let hit = self
            .ranges
            .range(..=upper)
            .rev()
            .take_while(|&(_, &h)| h >= lower)
            .map(|(&l, &h)| (l, h))
            .collect::<Vec<_>>();
        for &(l, h) in &hit {
            self.ranges.remove(&l);
            if l < lower {
                self.ranges.insert(l, lower - 1);
            }
            if h > upper {
                self.ranges.insert(upper + 1, h);
            }
        }
        !hit.is_empty()
    }

    /// Largest `n` such that `1..=n` are all recorded, or 0.
    pub fn largest_in_order(&self) -> FragSeq {
        match self.ranges.first_key_value() {
            Some((&1, &hi)) => hi,
            _ => 0,
        }
    }
}

/// Sender-side view of a peer, as last reported by its ACKs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerAckInfo {
    pub delivered_largest_inorder: FragSeq,
    pub received_largest_inorder: FragSeq,
}

/// Receiver-side record of traffic from one peer.
#[derive(Debug, Default)]
pub struct PeerRecvSeqs {
    pub received: SeqTracker,
    pub delivered: SeqTracker,
}

/// Per-peer reliability state of a process.
pub struct ReliabilityState {
    next_frag_seq: Vec<AtomicU64>,
    ack_info: Vec<SpinLock<PeerAckInfo>>,
    recv_seqs: Vec<SpinLock<PeerRecvSeqs>>,
}

impl ReliabilityState {
    pub fn new(nprocs: usize, threaded: bool) -> Self {
        Self {
            next_frag_seq: (0..nprocs).map(|_| AtomicU64::new(1)).collect(),
            ack_info: (0..nprocs)
                .map(|_| SpinLock::new(PeerAckInfo::default(), threaded))
                .collect(),
            recv_seqs: (0..nprocs)
                .map(|_| SpinLock::new(PeerRecvSeqs::default(), threaded))
                .collect(),
        }
    }

    /// Assign the next sequence number for traffic to `dest`.
    #[inline]
    pub fn next_frag_seq(&self, dest: ProcId) -> FragSeq {
        self.next_frag_seq[dest as usize].fetch_add(1, Ordering::Relaxed)
    }

    /// Record the aggregate counters carried by an ACK from `peer`.
    pub fn update_ack_info(&self, peer: ProcId, delivered: FragSeq, received: FragSeq) {
        let mut info = self.ack_info[peer as usize].lock();
        info.delivered_largest_inorder = info.delivered_largest_inorder.max(delivered);
        info.received_largest_inorder = info.received_largest_inorder.max(received);
    }

    #[inline]
    pub fn ack_info(&self, peer: ProcId) -> PeerAckInfo {
        *self.ack_info[peer as usize].lock()
    }

    /// Run `f` on the receive record of traffic from `src`.
    pub fn with_recv_seqs<R>(&self, src: ProcId, f: impl FnOnce(&mut PeerRecvSeqs) -> R) -> R {
        f(&mut self.recv_seqs[src as usize].lock())
    }
}
