//! The fragment engine shared by every fabric.
//!
//! A [`Fabric`] is a device backend: it knows how to reach peers, post a
//! frame on one of its (device, port) lanes, and report completions and
//! arrivals. [`FragPath`] turns any fabric into a [`Path`] by running the
//! send and receive fragment state machines and the acknowledgment protocol
//! on top of it.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use quanta::Instant;

use super::{Lane, Path, PathType, SendStatus};
use crate::error::{Error, Result};
use crate::frag::{FragKind, FragState, RecvFrag, SendFrag};
use crate::message::{numfrags, SendDesc, SendDescRef, SendMode, SendState};
use crate::msgbuf::MsgBuf;
use crate::nexus::{FragSink, ProcCtx};
use crate::pkthdr::{self, AckHeader, AckStatus, DataHeader, FrameType};
use crate::type_alias::*;
use crate::util::lock::SpinLock;
use crate::util::pool::{ElemRef, FreeList};

/// A received frame handed up by a fabric.
#[derive(Debug)]
pub struct RecvBuf {
    pub lane: Lane,
    pub buf: MsgBuf,
}

/// Fate of a frame on its way to the wire, decided by a [`FaultHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Lose the frame after the fabric reports it sent.
    Drop,
    /// Flip the last byte of the frame.
    Corrupt,
}

/// Fault injection on the send side of a path.
pub trait FaultHook: Send + Sync {
    fn on_post(&self, dest: ProcId, frame: &[u8]) -> Verdict;
}

/// A device backend driven by [`FragPath`].
///
/// Posting consumes the fabric's send and completion tokens for the lane;
/// they come back when the completion is polled. Every posted `wr_id` is
/// reported back exactly once, by [`Self::poll_send_completions`] or, if
/// the frame can never be sent, by [`Self::poll_send_failures`].
pub trait Fabric: Send + 'static {
    /// Resolved addressing of a destination on a lane.
    type Route: Clone + Send + 'static;

    fn path_type(&self) -> PathType;

    /// Max payload of the first fragment of a message.
    fn eager_payload(&self) -> usize;

    /// Max payload of every later fragment.
    fn frag_payload(&self) -> usize;

    fn can_reach(&self, dest: ProcId) -> bool;

    /// Next lane in round-robin order over every active (device, port).
    fn next_lane(&mut self) -> Lane;

    fn resolve(&mut self, dest: ProcId, lane: Lane) -> Result<Self::Route>;

    /// Post `frame`. `Ok(false)` means no tokens are available right now.
    fn post(&mut self, lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool>;

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()>;

    /// Work ids of posted frames that were lost with their connection.
    fn poll_send_failures(&mut self, _failed: &mut Vec<u64>) {}

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()>;

    /// Give a receive buffer back to the device.
    fn repost(&mut self, buf: RecvBuf) -> Result<()>;

    /// Push out internally buffered bytes. Return whether any moved.
    fn flush(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Whether internally buffered bytes are waiting for [`Self::flush`].
    fn has_pending(&self) -> bool {
        false
    }

    /// See [`Path::update`].
    fn update(&mut self) -> bool {
        false
    }

    fn finalize(&mut self) {}
}

struct Engine<F: Fabric> {
    fabric: F,
    send_frags: FreeList<SendFrag<F::Route>>,
    recv_frags: FreeList<RecvFrag>,
    /// Acknowledgments waiting for tokens.
    ctl_to_send: VecDeque<ElemRef>,
    /// Arrivals waiting for a receive descriptor.
    rx_backlog: VecDeque<RecvBuf>,
    /// Completions of frames a fault hook dropped.
    dropped: Vec<u64>,
    done_scratch: Vec<u64>,
    rx_scratch: Vec<RecvBuf>,
}

impl<F: Fabric> Engine<F> {
    fn release(&mut self, r: ElemRef) {
        if let Some(frag) = self.send_frags.get_mut(r) {
            frag.reset();
        }
        self.send_frags.return_element_no_lock(r);
    }
}

const NO_HANDLE: usize = usize::MAX;

/// A [`Path`] over any [`Fabric`].
pub struct FragPath<F: Fabric> {
    ctx: Arc<ProcCtx>,
    path_type: PathType,
    eager: usize,
    frag_payload: usize,
    handle: AtomicUsize,
    active: AtomicBool,
    hook: Option<Arc<dyn FaultHook>>,
    engine: SpinLock<Engine<F>>,
}

impl<F: Fabric> FragPath<F> {
    pub fn new(ctx: Arc<ProcCtx>, fabric: F) -> Result<Self> {
        let cfg = ctx.config();
        let eager = fabric.eager_payload();
        let frag_payload = fabric.frag_payload();
        if eager == 0 || frag_payload == 0 {
            return Err(Error::Setup(format!(
                "{} fabric with zero fragment size (eager {}, frag {})",
                fabric.path_type(),
                eager,
                frag_payload
            )));
        }
        let max_payload = eager.max(frag_payload);

        let send_frags = FreeList::new(cfg.send_frag_pool.clone(), move |_| {
            SendFrag::new(max_payload)
        })?;
        let recv_frags = FreeList::new(cfg.recv_frag_pool.clone(), |_| RecvFrag::new())?;
        let engine = Engine {
            fabric,
            send_frags,
            recv_frags,
            ctl_to_send: VecDeque::new(),
            rx_backlog: VecDeque::new(),
            dropped: Vec::new(),
            done_scratch: Vec::new(),
            rx_scratch: Vec::new(),
        };

        Ok(Self {
            path_type: engine.fabric.path_type(),
            eager,
            frag_payload,
            handle: AtomicUsize::new(NO_HANDLE),
            active: AtomicBool::new(false),
            hook: None,
            engine: SpinLock::new(engine, cfg.use_threads),
            ctx,
        })
    }

    /// Install a fault hook consulted on every post.
    pub fn with_fault_hook(mut self, hook: Arc<dyn FaultHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    fn init_locked(&self, msg: &SendDesc, st: &mut SendState) {
        if st.init_done {
            return;
        }
        st.numfrags = numfrags(msg.len(), self.eager, self.frag_payload);
        st.num_sent = 0;
        st.num_acked = 0;
        st.frags_allocated = 0;
        st.allocated_offset = 0;
        st.clear_to_send = msg.mode() == SendMode::Standard;
        st.init_done = true;
    }

    /// `INITCOMPLETE -> POSTED`. Return `false` if the fabric is out of
    /// tokens or still owns the fragment from an earlier post.
    fn post(&self, eng: &mut Engine<F>, r: ElemRef, now: Instant) -> Result<bool> {
        let Engine {
            fabric,
            send_frags,
            dropped,
            ..
        } = eng;
        let frag = send_frags
            .get_mut(r)
            .ok_or_else(|| Error::Protocol("posting a released fragment".into()))?;
        if !frag.is_postable() {
            return Ok(false);
        }
        let route = frag
            .route
            .as_ref()
            .ok_or_else(|| Error::Protocol("posting an unresolved fragment".into()))?;

        let wr_id = r.to_wr_id();
        let verdict = match &self.hook {
            Some(hook) => hook.on_post(frag.dest, frag.buf.frame()),
            None => Verdict::Deliver,
        };
        let posted = match verdict {
            Verdict::Deliver => fabric.post(frag.lane, route, frag.buf.frame(), wr_id)?,
            Verdict::Drop => {
                dropped.push(wr_id);
                true
            }
            Verdict::Corrupt => {
                let mut frame = frag.buf.frame().to_vec();
                if let Some(b) = frame.last_mut() {
                    *b ^= 0xff;
                }
                fabric.post(frag.lane, route, &frame, wr_id)?
            }
        };
        if posted {
            frag.mark_posted(now);
            log::trace!(
                "{} path: posted {:?} fragment to {} (seq {}, transmission {})",
                self.path_type,
                frag.kind,
                frag.dest,
                frag.frag_seq,
                frag.num_transmits
            );
        }
        Ok(posted)
    }

    fn post_ctl(&self, eng: &mut Engine<F>, now: Instant) -> Result<bool> {
        let mut progressed = false;
        while let Some(&r) = eng.ctl_to_send.front() {
            if !self.post(eng, r, now)? {
                break;
            }
            eng.ctl_to_send.pop_front();
            progressed = true;
        }
        Ok(progressed)
    }

    /// Local completion of a post.
    fn complete_local(&self, eng: &mut Engine<F>, r: ElemRef) {
        let Some(frag) = eng.send_frags.get_mut(r) else {
            log::warn!("{} path: completion for a released fragment {:?}", self.path_type, r);
            return;
        };
        frag.state.insert(FragState::LOCALACKED);
        let release = match frag.kind {
            FragKind::Ack => true,
            FragKind::Data if frag.state.contains(FragState::REMOTEACKED) => true,
            FragKind::Data if frag.frag_seq == 0 => {
                // Unsequenced: local completion is all the acknowledgment it gets.
                if let Some(msg) = frag.parent.take() {
                    msg.state.lock().num_acked += 1;
                }
                true
            }
            FragKind::Data => false,
        };
        if release {
            eng.release(r);
        }
    }

    /// A post that never left: fail its message.
    fn fail_local(&self, eng: &mut Engine<F>, r: ElemRef) {
        let Some(frag) = eng.send_frags.get_mut(r) else {
            return;
        };
        if let Some(msg) = frag.parent.take() {
            log::warn!(
                "{} path: send {} to {} lost with its connection",
                self.path_type,
                msg.isend_seq(),
                frag.dest
            );
            msg.state.lock().failed = true;
        }
        eng.release(r);
    }

    /// Receive one data frame. Hand the buffer back if no receive
    /// descriptor is available.
    fn handle_data(
        &self,
        eng: &mut Engine<F>,
        rb: RecvBuf,
        now: Instant,
        sink: &dyn FragSink,
    ) -> Result<Option<RecvBuf>> {
        let r = match eng.recv_frags.get_element_no_lock(rb.lane.dev as usize) {
            Ok(r) => r,
            Err(e) if e.is_resource() => return Ok(Some(rb)),
            Err(e) => return Err(e),
        };
        let frag = eng
            .recv_frags
            .get_mut(r)
            .ok_or_else(|| Error::Protocol("fresh receive descriptor is stale".into()))?;
        frag.bind(rb.buf, rb.lane, self.ctx.config().checksum);

        let outcome = self.process_data(frag, now, sink);

        // The buffer goes straight back to the device, data consumed or not.
        let lane = frag.lane();
        if let Some(buf) = frag.take_buf() {
            eng.fabric.repost(RecvBuf { lane, buf })?;
        }
        eng.recv_frags.return_element_no_lock(r);

        if let Some((dest, ack)) = outcome? {
            self.queue_ack(eng, dest, ack, now)?;
        }
        Ok(None)
    }

    /// Parse, deduplicate, deliver and verify a data fragment. Return the
    /// acknowledgment to send, if any.
    fn process_data(
        &self,
        frag: &mut RecvFrag,
        now: Instant,
        sink: &dyn FragSink,
    ) -> Result<Option<(ProcId, AckHeader)>> {
        let cfg = self.ctx.config();
        if let Err(e) = frag.parse(self.ctx.comms()) {
            return match e {
                Error::CorruptData { .. } if cfg.ack => {
                    log::warn!("{} path: dropping fragment: {}", self.path_type, e);
                    Ok(None)
                }
                e => Err(self.ctx.fatal(e)),
            };
        }
        let hdr = *frag.header();
        let src = hdr.sender();
        let seq = hdr.frag_seq();
        let reliability = self.ctx.reliability();

        if seq != 0 && reliability.with_recv_seqs(src, |s| s.received.record_if_not_recorded(seq)) {
            log::trace!("{} path: duplicate fragment {} from {}", self.path_type, seq, src);
            frag.set_duplicate();
        } else if let Err(e) = sink.handle_received_frag(frag, now) {
            if seq != 0 {
                // Not delivered: the retransmission must not count as a duplicate.
                reliability.with_recv_seqs(src, |s| s.received.erase(seq));
            }
            return Err(self.ctx.fatal(e));
        }

        let ok = frag.is_duplicate() || frag.verify();
        if !ok {
            if !cfg.ack {
                return Err(self.ctx.fatal(Error::CorruptData {
                    what: "fragment payload",
                    expected: hdr.data_checksum(),
                    computed: frag.computed_checksum(),
                }));
            }
            log::warn!(
                "{} path: corrupt fragment {} from {}, requesting retransmission",
                self.path_type,
                seq,
                src
            );
        }

        let wants_ack = cfg.ack || (frag.msg_type().is_sync() && frag.seq_offset() == 0);
        if !wants_ack || seq == 0 {
            return Ok(None);
        }
        Ok(Some((src, self.build_ack(&hdr, frag.is_duplicate(), ok))))
    }

    fn build_ack(&self, hdr: &DataHeader, duplicate: bool, ok: bool) -> AckHeader {
        let src = hdr.sender();
        let seq = hdr.frag_seq();
        let (status, received, delivered) = self.ctx.reliability().with_recv_seqs(src, |s| {
            let status = if duplicate {
                if s.delivered.is_recorded(seq) {
                    AckStatus::DataGood
                } else {
                    AckStatus::AggInfoOnly
                }
            } else if ok {
                s.delivered.record(seq);
                AckStatus::DataGood
            } else {
                // Forget it so that the retransmission is not a duplicate.
                s.received.erase(seq);
                s.delivered.erase(seq);
                AckStatus::DataBad
            };
            (
                status,
                s.received.largest_in_order(),
                s.delivered.largest_in_order(),
            )
        });

        let mut ack = AckHeader::new(hdr.ctx(), src, self.ctx.myproc(), status);
        ack.set_desc_idx(hdr.desc_idx());
        ack.set_desc_gen(hdr.desc_gen());
        ack.set_this_frag_seq(seq);
        ack.set_received_seq(received);
        ack.set_delivered_seq(delivered);
        ack.seal(self.ctx.config().checksum);
        ack
    }

    fn queue_ack(&self, eng: &mut Engine<F>, dest: ProcId, ack: AckHeader, now: Instant) -> Result<()> {
        let r = match eng.send_frags.get_element_no_lock(0) {
            Ok(r) => r,
            Err(e) if e.is_resource() => {
                log::warn!(
                    "{} path: no descriptor for ack to {}, leaving it to retransmission",
                    self.path_type,
                    dest
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let lane = eng.fabric.next_lane();
        let route = match eng.fabric.resolve(dest, lane) {
            Ok(route) => route,
            Err(e) => {
                log::warn!("{} path: cannot route ack to {}: {}", self.path_type, dest, e);
                eng.release(r);
                return Ok(());
            }
        };
        if let Some(frag) = eng.send_frags.get_mut(r) {
            frag.basic_info(FragKind::Ack, None, dest, lane);
            frag.init_ack(&ack, route);
        }
        eng.ctl_to_send.push_back(r);
        self.post_ctl(eng, now)?;
        Ok(())
    }

    fn handle_ack(&self, eng: &mut Engine<F>, rb: RecvBuf) -> Result<()> {
        let parsed = AckHeader::parse(rb.buf.frame());
        eng.fabric.repost(rb)?;
        let ack = parsed.map_err(|e| self.ctx.fatal(e))?;
        if let Err(e) = ack.verify(self.ctx.config().checksum) {
            log::warn!("{} path: dropping ack: {}", self.path_type, e);
            return Ok(());
        }
        let status = ack.ack_status().map_err(|e| self.ctx.fatal(e))?;
        let peer = ack.src();
        if peer as usize >= self.ctx.nprocs() {
            return Err(self.ctx.fatal(Error::Protocol(format!("ack from unknown process {}", peer))));
        }

        self.ctx
            .reliability()
            .update_ack_info(peer, ack.delivered_seq(), ack.received_seq());
        if status == AckStatus::AggInfoOnly {
            return Ok(());
        }

        let r = ElemRef::from_raw(ack.desc_idx(), ack.desc_gen());
        let seq = ack.this_frag_seq();
        let Some(frag) = eng
            .send_frags
            .get_mut(r)
            .filter(|f| f.kind == FragKind::Data && f.dest == peer && f.frag_seq == seq && seq != 0)
        else {
            log::warn!(
                "{} path: dropping stale ack from {} for seq {}",
                self.path_type,
                peer,
                seq
            );
            return Ok(());
        };
        let Some(msg) = frag.parent.clone() else {
            return Ok(());
        };

        let mut st = msg.state.lock();
        match status {
            AckStatus::DataGood => {
                if let Some(pos) = st.frags_to_ack.iter().position(|&x| x == r) {
                    st.frags_to_ack.swap_remove(pos);
                } else if let Some(pos) = st.frags_to_send.iter().position(|&x| x == r) {
                    // Acknowledged while waiting to be resent.
                    st.frags_to_send.remove(pos);
                    st.num_sent += 1;
                }
                st.num_acked += 1;
                st.clear_to_send = true;
                drop(st);

                frag.state.insert(FragState::REMOTEACKED);
                frag.frag_seq = 0;
                frag.parent = None;
                log::trace!("{} path: seq {} acknowledged by {}", self.path_type, seq, peer);
                if frag.state.contains(FragState::LOCALACKED) {
                    eng.release(r);
                }
            }
            AckStatus::DataBad => {
                if let Some(pos) = st.frags_to_ack.iter().position(|&x| x == r) {
                    st.frags_to_ack.swap_remove(pos);
                    st.frags_to_send.push_back(r);
                    st.num_sent = st.num_sent.saturating_sub(1);
                    log::warn!(
                        "{} path: seq {} arrived corrupt at {}, retransmitting",
                        self.path_type,
                        seq,
                        peer
                    );
                }
            }
            AckStatus::AggInfoOnly => {}
        }
        Ok(())
    }

    fn handle_frame(
        &self,
        eng: &mut Engine<F>,
        rb: RecvBuf,
        now: Instant,
        sink: &dyn FragSink,
    ) -> Result<Option<RecvBuf>> {
        match pkthdr::frame_type(rb.buf.frame()) {
            Ok(FrameType::Data) => self.handle_data(eng, rb, now, sink),
            Ok(FrameType::Ack) => self.handle_ack(eng, rb).map(|_| None),
            Err(e) => {
                eng.fabric.repost(rb)?;
                if self.ctx.config().ack {
                    log::warn!("{} path: dropping frame: {}", self.path_type, e);
                    Ok(None)
                } else {
                    Err(self.ctx.fatal(e))
                }
            }
        }
    }
}

impl<F: Fabric> Path for FragPath<F> {
    fn path_type(&self) -> PathType {
        self.path_type
    }

    fn bind_to_container(&self, handle: PathHandle) {
        self.handle.store(handle, Ordering::Release);
    }

    fn handle(&self) -> Option<PathHandle> {
        match self.handle.load(Ordering::Acquire) {
            NO_HANDLE => None,
            h => Some(h),
        }
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        self.engine.lock().fabric.can_reach(dest)
    }

    fn bind(&self, msg: &SendDesc) -> Result<()> {
        let h = self.handle().filter(|_| self.is_active()).ok_or(Error::BadPath)?;
        let dest = msg.global_dest();
        if !self.can_reach(dest) {
            return Err(Error::Unreachable(dest));
        }
        msg.state.lock().path = Some(h);
        Ok(())
    }

    fn init(&self, msg: &SendDesc) -> Result<()> {
        self.init_locked(msg, &mut msg.state.lock());
        Ok(())
    }

    fn send(&self, msg: &SendDescRef) -> Result<SendStatus> {
        if !self.is_active() {
            return Err(Error::BadPath);
        }
        let now = self.ctx.now();
        let mut guard = self.engine.lock();
        let eng = &mut *guard;
        let mut st = msg.state.lock();
        self.init_locked(msg, &mut st);

        let dest = st.global_dest;
        let allowed = if st.clear_to_send { st.numfrags } else { 1 };
        while st.frags_allocated < allowed {
            let r = match eng.send_frags.get_element_no_lock(0) {
                Ok(r) => r,
                Err(e) if e.is_resource() => break,
                Err(e) => return Err(e),
            };
            let lane = eng.fabric.next_lane();
            let route = match eng.fabric.resolve(dest, lane) {
                Ok(route) => route,
                Err(e) => {
                    eng.release(r);
                    return Err(e);
                }
            };
            let frag = eng
                .send_frags
                .get_mut(r)
                .ok_or_else(|| Error::Protocol("fresh send descriptor is stale".into()))?;
            frag.basic_info(FragKind::Data, Some(msg.clone()), dest, lane);
            let res = frag.init_data(r, &self.ctx, &mut st, route, self.eager, self.frag_payload);
            if let Err(e) = res {
                eng.release(r);
                return Err(e);
            }
            st.frags_allocated += 1;
            st.frags_to_send.push_back(r);
        }

        while let Some(&r) = st.frags_to_send.front() {
            if !self.post(eng, r, now)? {
                break;
            }
            st.frags_to_send.pop_front();
            st.num_sent += 1;
            if eng.send_frags.get(r).is_some_and(|f| f.frag_seq != 0) {
                st.frags_to_ack.push(r);
            }
        }

        Ok(if st.num_sent >= st.numfrags {
            SendStatus::Complete
        } else {
            SendStatus::Incomplete
        })
    }

    fn abort(&self, msg: &SendDescRef) {
        let mut guard = self.engine.lock();
        let eng = &mut *guard;
        let mut st = msg.state.lock();
        st.failed = true;
        let mut queued: Vec<ElemRef> = st.frags_to_send.drain(..).collect();
        queued.append(&mut st.frags_to_ack);
        drop(st);

        for r in queued {
            let Some(frag) = eng.send_frags.get_mut(r) else {
                continue;
            };
            frag.parent = None;
            frag.frag_seq = 0;
            if frag.state.contains(FragState::POSTED) && !frag.state.contains(FragState::LOCALACKED) {
                // The fabric still owns it; the completion releases it.
                frag.state.insert(FragState::REMOTEACKED);
            } else {
                eng.release(r);
            }
        }
    }

    fn receive(&self, now: Instant, sink: &dyn FragSink) -> Result<bool> {
        let mut guard = self.engine.lock();
        let eng = &mut *guard;

        let mut polled = mem::take(&mut eng.rx_scratch);
        eng.fabric.poll_recv(&mut polled)?;
        let mut pending = mem::take(&mut eng.rx_backlog);
        pending.extend(polled.drain(..));
        eng.rx_scratch = polled;

        let mut progressed = false;
        while let Some(rb) = pending.pop_front() {
            match self.handle_frame(eng, rb, now, sink) {
                Ok(None) => progressed = true,
                Ok(Some(rb)) => {
                    pending.push_front(rb);
                    break;
                }
                Err(e) => {
                    eng.rx_backlog = pending;
                    return Err(e);
                }
            }
        }
        eng.rx_backlog = pending;
        Ok(progressed)
    }

    fn needs_push(&self) -> bool {
        let eng = self.engine.lock();
        !eng.ctl_to_send.is_empty()
            || !eng.dropped.is_empty()
            || eng.fabric.has_pending()
            || eng.send_frags.num_free() < eng.send_frags.capacity()
    }

    fn push(&self, now: Instant) -> Result<bool> {
        let mut guard = self.engine.lock();
        let eng = &mut *guard;
        let mut progressed = eng.fabric.flush()?;

        let mut done = mem::take(&mut eng.done_scratch);
        eng.fabric.poll_send_completions(&mut done)?;
        done.append(&mut eng.dropped);
        for &wr_id in &done {
            self.complete_local(eng, ElemRef::from_wr_id(wr_id));
        }
        progressed |= !done.is_empty();
        done.clear();

        eng.fabric.poll_send_failures(&mut done);
        for &wr_id in &done {
            self.fail_local(eng, ElemRef::from_wr_id(wr_id));
        }
        progressed |= !done.is_empty();
        done.clear();
        eng.done_scratch = done;

        progressed |= self.post_ctl(eng, now)?;
        Ok(progressed)
    }

    fn resend(&self, msg: &SendDescRef, now: Instant) -> Result<bool> {
        let cfg = self.ctx.config();
        let mut guard = self.engine.lock();
        let eng = &mut *guard;
        let mut st = msg.state.lock();
        if st.frags_to_ack.is_empty() {
            return Ok(false);
        }
        let info = self.ctx.reliability().ack_info(st.global_dest);

        let mut requeued = false;
        let mut freed = Vec::new();
        let mut i = 0;
        while i < st.frags_to_ack.len() {
            let r = st.frags_to_ack[i];
            let Some(frag) = eng.send_frags.get_mut(r) else {
                st.frags_to_ack.swap_remove(i);
                continue;
            };
            if frag.frag_seq <= info.delivered_largest_inorder {
                // The peer has it; only the acknowledgment was lost.
                st.frags_to_ack.swap_remove(i);
                st.num_acked += 1;
                st.clear_to_send = true;
                frag.state.insert(FragState::REMOTEACKED);
                frag.frag_seq = 0;
                frag.parent = None;
                if frag.state.contains(FragState::LOCALACKED) {
                    freed.push(r);
                }
                continue;
            }
            if frag.retransmit_due(now, cfg.retrans_time, cfg.max_retrans_pow2) {
                log::warn!(
                    "{} path: seq {} to {} unacknowledged after {} transmissions, resending",
                    self.path_type,
                    frag.frag_seq,
                    frag.dest,
                    frag.num_transmits
                );
                st.frags_to_ack.swap_remove(i);
                st.frags_to_send.push_back(r);
                st.num_sent = st.num_sent.saturating_sub(1);
                requeued = true;
                continue;
            }
            i += 1;
        }
        drop(st);

        for r in freed {
            eng.release(r);
        }
        Ok(requeued)
    }

    fn update(&self) -> bool {
        self.engine.lock().fabric.update()
    }

    fn activate(&self) {
        self.active.store(true, Ordering::Release);
        log::debug!("{} path: active on rank {}", self.path_type, self.ctx.myproc());
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        log::debug!("{} path: inactive on rank {}", self.path_type, self.ctx.myproc());
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn finalize(&self) {
        const MAX_DRAIN_ROUNDS: usize = 1 << 16;
        for _ in 0..MAX_DRAIN_ROUNDS {
            match self.push(self.ctx.now()) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    log::warn!("{} path: error while draining: {}", self.path_type, e);
                    break;
                }
            }
        }
        self.engine.lock().fabric.finalize();
    }
}
