use std::fmt;

use crate::checksum::{copy_with_checksum, ChecksumMode, Checksummer};
use crate::datatype::{self, Datatype};
use crate::error::{Error, Result};
use crate::msgbuf::MsgBuf;
use crate::nexus::Communicators;
use crate::path::Lane;
use crate::pkthdr::{DataHeader, MsgType};
use crate::type_alias::*;

/// A received data fragment, bound to the fabric buffer it arrived in.
///
/// Handed to the [`FragSink`](crate::nexus::FragSink) once parsed, with
/// sender and destination already translated to group ranks.
pub struct RecvFrag {
    buf: Option<MsgBuf>,
    lane: Lane,
    hdr: DataHeader,
    msg_type: MsgType,
    src: ProcId,
    dst: ProcId,
    mode: ChecksumMode,
    data_ok: Option<bool>,
    computed: u32,
    duplicate: bool,
}

impl RecvFrag {
    pub(crate) fn new() -> Self {
        Self {
            buf: None,
            lane: Lane::default(),
            hdr: DataHeader::default(),
            msg_type: MsgType::Pt2Pt,
            src: 0,
            dst: 0,
            mode: ChecksumMode::None,
            data_ok: None,
            computed: 0,
            duplicate: false,
        }
    }

    /// Take ownership of a completed receive buffer.
    pub(crate) fn bind(&mut self, buf: MsgBuf, lane: Lane, mode: ChecksumMode) {
        debug_assert!(self.buf.is_none(), "receive fragment bound twice");
        self.buf = Some(buf);
        self.lane = lane;
        self.mode = mode;
        self.data_ok = None;
        self.duplicate = false;
    }

    /// Parse and check the header, then translate the global sender and
    /// destination into ranks of the fragment's communicator.
    pub(crate) fn parse(&mut self, comms: &Communicators) -> Result<()> {
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| Error::Protocol("parsing an unbound receive fragment".into()))?;
        let hdr = DataHeader::parse(buf.frame())?;
        hdr.verify(self.mode)?;

        let msg_type = hdr.msg_type()?;
        if msg_type == MsgType::DataAck {
            return Err(Error::Protocol("data frame with ack message type".into()));
        }
        let data_len = hdr.data_len() as usize;
        if data_len > buf.len() {
            return Err(Error::Protocol(format!(
                "fragment claims {} bytes, frame holds {}",
                data_len,
                buf.len()
            )));
        }
        buf.set_len(data_len);

        let comm = comms
            .get(hdr.ctx())
            .ok_or_else(|| Error::Protocol(format!("unknown context {}", hdr.ctx())))?;
        self.src = comm.remote().to_rank(hdr.sender()).ok_or_else(|| {
            Error::Protocol(format!("process {} not in context {}", hdr.sender(), hdr.ctx()))
        })?;
        self.dst = comm.local().to_rank(hdr.dest()).ok_or_else(|| {
            Error::Protocol(format!("process {} not in context {}", hdr.dest(), hdr.ctx()))
        })?;
        self.msg_type = msg_type;
        self.hdr = hdr;
        Ok(())
    }

    /// Give the buffer back for reposting.
    pub(crate) fn take_buf(&mut self) -> Option<MsgBuf> {
        self.buf.take()
    }

    pub(crate) fn set_duplicate(&mut self) {
        self.duplicate = true;
    }

    pub(crate) fn header(&self) -> &DataHeader {
        &self.hdr
    }

    #[inline]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Sender rank in the communicator's remote group.
    #[inline]
    pub fn src(&self) -> ProcId {
        self.src
    }

    /// Destination rank in the communicator's local group.
    #[inline]
    pub fn dst(&self) -> ProcId {
        self.dst
    }

    #[inline]
    pub fn global_src(&self) -> ProcId {
        self.hdr.sender()
    }

    #[inline]
    pub fn ctx(&self) -> CtxId {
        self.hdr.ctx()
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.hdr.tag()
    }

    #[inline]
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    #[inline]
    pub fn isend_seq(&self) -> IsendSeq {
        self.hdr.isend_seq()
    }

    #[inline]
    pub fn frag_seq(&self) -> FragSeq {
        self.hdr.frag_seq()
    }

    /// Packed offset of this fragment within its message.
    #[inline]
    pub fn seq_offset(&self) -> usize {
        self.hdr.data_offset() as usize
    }

    #[inline]
    pub fn msg_len(&self) -> usize {
        self.hdr.msg_len() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hdr.data_len() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this fragment was already received earlier.
    #[inline]
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Result of the data checksum, if it has been checked.
    #[inline]
    pub fn data_ok(&self) -> Option<bool> {
        self.data_ok
    }

    /// Raw payload, unverified.
    pub fn payload(&self) -> &[u8] {
        self.buf.as_ref().map(MsgBuf::payload).unwrap_or(&[])
    }

    /// Checksum computed over the payload by the last copy or verify.
    pub(crate) fn computed_checksum(&self) -> u32 {
        self.computed
    }

    fn check(&mut self, computed: u32) -> bool {
        self.computed = computed;
        let ok = self.mode == ChecksumMode::None || computed == self.hdr.data_checksum();
        self.data_ok = Some(ok);
        ok
    }

    /// Copy the payload into `dst` (exactly [`Self::len`] bytes), verifying
    /// the checksum during the copy. Return whether the data is intact.
    ///
    /// # Panics
    ///
    /// Panic if `dst` is not exactly as long as the payload.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> bool {
        let mut ck = Checksummer::new(self.mode);
        copy_with_checksum(self.payload(), dst, &mut ck);
        self.check(ck.finish())
    }

    /// Scatter the payload into `user`, laid out as elements of `dtype`
    /// starting at element 0, verifying the checksum during the copy.
    pub fn unpack(&mut self, dtype: Option<&Datatype>, user: &mut [u8]) -> Result<bool> {
        let computed = datatype::unpack(self.payload(), dtype, self.seq_offset(), user, self.mode)?;
        Ok(self.check(computed))
    }

    /// Verify the checksum without copying.
    pub fn verify(&mut self) -> bool {
        if let Some(ok) = self.data_ok {
            return ok;
        }
        let mut ck = Checksummer::new(self.mode);
        ck.update(self.payload());
        self.check(ck.finish())
    }
}

impl fmt::Debug for RecvFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvFrag")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("hdr", &self.hdr)
            .field("data_ok", &self.data_ok)
            .field("duplicate", &self.duplicate)
            .finish()
    }
}
