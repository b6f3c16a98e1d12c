use std::time::Duration;

use quanta::Instant;

use super::FragState;
use crate::datatype;
use crate::error::{Error, Result};
use crate::message::{SendDescRef, SendMode, SendState};
use crate::msgbuf::MsgBuf;
use crate::nexus::ProcCtx;
use crate::path::Lane;
use crate::pkthdr::{AckHeader, DataHeader};
use crate::type_alias::*;
use crate::util::pool::ElemRef;

/// What a send fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragKind {
    Data,
    Ack,
}

/// One wire-sized piece of a send, or an acknowledgment.
///
/// `R` is the fabric's resolved route to the destination.
pub(crate) struct SendFrag<R> {
    pub state: FragState,
    pub kind: FragKind,
    pub parent: Option<SendDescRef>,
    /// Global destination.
    pub dest: ProcId,
    pub lane: Lane,
    pub route: Option<R>,
    /// Packed offset of the payload within the message.
    pub seq_offset: usize,
    pub frag_seq: FragSeq,
    /// Time of the latest post.
    pub time_sent: Option<Instant>,
    pub num_transmits: u32,
    pub buf: MsgBuf,
}

impl<R> SendFrag<R> {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: FragState::empty(),
            kind: FragKind::Data,
            parent: None,
            dest: 0,
            lane: Lane::default(),
            route: None,
            seq_offset: 0,
            frag_seq: 0,
            time_sent: None,
            num_transmits: 0,
            buf: MsgBuf::new(max_payload),
        }
    }

    /// `EMPTY -> BASICINFO`.
    pub fn basic_info(
        &mut self,
        kind: FragKind,
        parent: Option<SendDescRef>,
        dest: ProcId,
        lane: Lane,
    ) {
        debug_assert!(self.state.is_empty(), "send fragment reused without reset");
        self.kind = kind;
        self.parent = parent;
        self.dest = dest;
        self.lane = lane;
        self.state = FragState::BASICINFO;
    }

    /// `BASICINFO -> INITCOMPLETE` for a data fragment: carve the next byte
    /// range out of the parent message, sequence it if required, pack it
    /// with the checksum fused into the copy, and stamp the header.
    ///
    /// `me` is this descriptor's own pool reference, echoed back by ACKs.
    pub fn init_data(
        &mut self,
        me: ElemRef,
        ctx: &ProcCtx,
        st: &mut SendState,
        route: R,
        eager: usize,
        frag_payload: usize,
    ) -> Result<()> {
        debug_assert!(self.state.contains(FragState::BASICINFO));
        let msg = self
            .parent
            .clone()
            .ok_or_else(|| Error::Protocol("data fragment without a message".into()))?;

        let offset = st.allocated_offset;
        let first = st.frags_allocated == 0;
        let max = if first { eager } else { frag_payload };
        let len = max.min(msg.len() - offset);
        let cfg = ctx.config();

        let sequenced = cfg.ack || (msg.mode() == SendMode::Synchronous && first);
        self.frag_seq = if sequenced {
            ctx.reliability().next_frag_seq(self.dest)
        } else {
            0
        };
        self.seq_offset = offset;

        self.buf.set_len(len);
        let data_ck = datatype::pack(
            msg.data(),
            msg.datatype(),
            offset,
            self.buf.payload_mut(),
            cfg.checksum,
        )?;

        let mut hdr = DataHeader::new(msg.msg_type(), msg.ctx(), msg.tag(), ctx.myproc(), self.dest);
        hdr.set_data_len(len as u32);
        hdr.set_msg_len(msg.len() as u64);
        hdr.set_data_offset(offset as u64);
        hdr.set_isend_seq(msg.isend_seq());
        hdr.set_frag_seq(self.frag_seq);
        hdr.set_desc_idx(me.index());
        hdr.set_desc_gen(me.generation());
        hdr.set_data_checksum(data_ck);
        hdr.seal(cfg.checksum);
        self.buf.header_mut().copy_from_slice(hdr.as_bytes());

        st.allocated_offset += len;
        self.route = Some(route);
        self.state |= FragState::INITCOMPLETE;
        Ok(())
    }

    /// `BASICINFO -> INITCOMPLETE` for an acknowledgment.
    pub fn init_ack(&mut self, hdr: &AckHeader, route: R) {
        debug_assert!(self.state.contains(FragState::BASICINFO));
        self.buf.set_len(0);
        self.buf.header_mut().copy_from_slice(hdr.as_bytes());
        self.route = Some(route);
        self.state |= FragState::INITCOMPLETE;
    }

    /// Whether the fabric may be handed this fragment now: initialized, and
    /// not still owned by the fabric from an earlier post.
    #[inline]
    pub fn is_postable(&self) -> bool {
        self.state.contains(FragState::INITCOMPLETE)
            && (!self.state.contains(FragState::POSTED) || self.state.contains(FragState::LOCALACKED))
    }

    /// Record a successful post.
    pub fn mark_posted(&mut self, now: Instant) {
        self.state.remove(FragState::LOCALACKED);
        self.state.insert(FragState::POSTED);
        self.time_sent = Some(now);
        self.num_transmits += 1;
    }

    /// Whether an unacknowledged fragment has waited out its backoff.
    pub fn retransmit_due(&self, now: Instant, base: Duration, max_pow2: u32) -> bool {
        let Some(sent) = self.time_sent else {
            return false;
        };
        let pow = self.num_transmits.min(max_pow2);
        now.saturating_duration_since(sent) >= base * (1u32 << pow)
    }

    /// Clear everything before going back to the pool.
    pub fn reset(&mut self) {
        self.state = FragState::empty();
        self.parent = None;
        self.route = None;
        self.frag_seq = 0;
        self.seq_offset = 0;
        self.time_sent = None;
        self.num_transmits = 0;
    }
}
