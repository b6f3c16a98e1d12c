use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::pkthdr::MsgType;
use crate::type_alias::*;
use crate::util::lock::SpinLock;
use crate::util::pool::ElemRef;

/// Completion semantics of a send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendMode {
    #[default]
    Standard,

    /// The first fragment is acknowledged by the receiver, and the remaining
    /// fragments wait for that acknowledgment.
    Synchronous,
}

/// Progress of a send, guarded by the descriptor's lock.
#[derive(Debug, Default)]
pub(crate) struct SendState {
    /// Bound path.
    pub path: Option<PathHandle>,
    /// Destination as a global process id, set at bind time.
    pub global_dest: ProcId,
    pub init_done: bool,
    pub numfrags: usize,
    /// Fragments posted and not since queued for retransmission.
    pub num_sent: usize,
    /// Fragments acknowledged, or locally complete if unsequenced.
    pub num_acked: usize,
    /// Fragment descriptors created so far.
    pub frags_allocated: usize,
    /// Packed offset up to which fragments have been created.
    pub allocated_offset: usize,
    /// Set by the receiver's acknowledgment of a synchronous send.
    pub clear_to_send: bool,
    /// Fragments waiting to be (re)posted.
    pub frags_to_send: VecDeque<ElemRef>,
    /// Posted sequenced fragments awaiting acknowledgment.
    pub frags_to_ack: Vec<ElemRef>,
    /// Set when a fragment can never reach the destination.
    pub failed: bool,
}

/// An application message being sent.
pub struct SendDesc {
    ctx: CtxId,
    peer: ProcId,
    tag: Tag,
    data: Arc<[u8]>,
    datatype: Option<Arc<Datatype>>,
    len: usize,
    mode: SendMode,
    multicast: bool,
    isend_seq: IsendSeq,
    pub(crate) state: SpinLock<SendState>,
}

/// Shared handle of a send; fragments point back to their message.
pub type SendDescRef = Arc<SendDesc>;

impl SendDesc {
    /// A contiguous send of `data` to group rank `peer` of communicator `ctx`.
    pub fn new(ctx: CtxId, peer: ProcId, tag: Tag, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            ctx,
            peer,
            tag,
            len: data.len(),
            data,
            datatype: None,
            mode: SendMode::Standard,
            multicast: false,
            isend_seq: 0,
            state: SpinLock::new(SendState::default(), true),
        }
    }

    /// Send `count` elements of `dtype` laid out in the user buffer.
    pub fn with_datatype(mut self, dtype: Arc<Datatype>, count: usize) -> Result<Self> {
        let span = dtype.span(count);
        if span > self.data.len() {
            return Err(Error::Protocol(format!(
                "{} elements span {} bytes, buffer holds {}",
                count,
                span,
                self.data.len()
            )));
        }
        self.len = dtype.packed_size() * count;
        self.datatype = Some(dtype);
        Ok(self)
    }

    pub fn with_mode(mut self, mode: SendMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_isend_seq(mut self, seq: IsendSeq) -> Self {
        self.isend_seq = seq;
        self
    }

    pub fn with_multicast(mut self, multicast: bool) -> Self {
        self.multicast = multicast;
        self
    }

    /// Select whether the state lock may spin.
    pub(crate) fn with_threads(mut self, threaded: bool) -> Self {
        self.state = SpinLock::new(SendState::default(), threaded);
        self
    }

    #[inline]
    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    /// Destination rank in the communicator's remote group.
    #[inline]
    pub fn peer(&self) -> ProcId {
        self.peer
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// User buffer.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn datatype(&self) -> Option<&Datatype> {
        self.datatype.as_deref()
    }

    /// Packed message length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn mode(&self) -> SendMode {
        self.mode
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    #[inline]
    pub fn isend_seq(&self) -> IsendSeq {
        self.isend_seq
    }

    /// Wire message type of the fragments.
    pub fn msg_type(&self) -> MsgType {
        match self.mode {
            SendMode::Standard => MsgType::Pt2Pt,
            SendMode::Synchronous => MsgType::Pt2PtSync,
        }
    }

    /// Path this message is bound to.
    pub fn path(&self) -> Option<PathHandle> {
        self.state.lock().path
    }

    pub fn global_dest(&self) -> ProcId {
        self.state.lock().global_dest
    }

    pub fn numfrags(&self) -> usize {
        self.state.lock().numfrags
    }

    pub fn num_sent(&self) -> usize {
        self.state.lock().num_sent
    }

    pub fn num_acked(&self) -> usize {
        self.state.lock().num_acked
    }

    /// Whether every fragment has been posted.
    pub fn all_sent(&self) -> bool {
        let st = self.state.lock();
        st.init_done && st.num_sent >= st.numfrags
    }

    /// Whether every fragment has been posted and acknowledged.
    pub fn is_done(&self) -> bool {
        let st = self.state.lock();
        !st.failed && st.init_done && st.num_sent >= st.numfrags && st.num_acked >= st.numfrags
    }

    /// Whether the send was lost with a broken connection.
    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }
}

impl fmt::Debug for SendDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendDesc")
            .field("ctx", &self.ctx)
            .field("peer", &self.peer)
            .field("tag", &self.tag)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .field("isend_seq", &self.isend_seq)
            .finish()
    }
}

/// Number of fragments of a `len`-byte message whose first fragment carries
/// up to `eager` bytes and the others up to `frag` bytes.
#[inline]
pub fn numfrags(len: usize, eager: usize, frag: usize) -> usize {
    if len <= eager {
        1
    } else {
        1 + (len - eager).div_ceil(frag)
    }
}
