use std::fmt;

use bitvec::{array::BitArray, field::BitField, order::Lsb0};
use paste::paste;

use crate::checksum::{checksum, ChecksumMode};
use crate::error::{Error, Result};
use crate::type_alias::*;

/// Length of every fragment header on the wire.
pub const HDR_LEN: usize = 64;

/// Largest context id a header can carry.
pub const MAX_CTX: CtxId = (1 << 24) - 1;

/// Bytes of a header covered by its own checksum.
const HDR_CHECKED_LEN: usize = HDR_LEN - 4;

type HdrBits = BitArray<[u8; HDR_LEN], Lsb0>;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            debug_assert!(
                (val as u64).checked_shr($msb - $lsb + 1).map_or(true, |hi| hi == 0),
                "{} {} does not fit in {} bits",
                stringify!($field),
                val,
                $msb - $lsb + 1
            );
            self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_le::<$integral_ty>() as $field_ty
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

/// Kind of frame, the first byte of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Ack = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        match val {
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            _ => Err(Error::Protocol(format!("unknown frame type {}", val))),
        }
    }
}

/// Message type carried next to the communicator context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Standard point-to-point data.
    Pt2Pt = 0,

    /// Synchronous point-to-point data; the first fragment is acknowledged.
    Pt2PtSync = 1,

    /// Collective data.
    Coll = 2,

    /// Synchronous collective data.
    CollSync = 3,

    /// Data acknowledgment.
    DataAck = 4,
}

impl MsgType {
    #[inline]
    pub fn is_sync(self) -> bool {
        matches!(self, Self::Pt2PtSync | Self::CollSync)
    }
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::Pt2Pt),
            1 => Ok(Self::Pt2PtSync),
            2 => Ok(Self::Coll),
            3 => Ok(Self::CollSync),
            4 => Ok(Self::DataAck),
            _ => Err(Error::Protocol(format!("unknown message type {}", val))),
        }
    }
}

/// Status reported by an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    /// The fragment arrived intact.
    DataGood = 0,

    /// The fragment arrived corrupt; retransmit it.
    DataBad = 1,

    /// Only the aggregate sequence information is meaningful.
    AggInfoOnly = 2,
}

impl TryFrom<u8> for AckStatus {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        match val {
            0 => Ok(Self::DataGood),
            1 => Ok(Self::DataBad),
            2 => Ok(Self::AggInfoOnly),
            _ => Err(Error::Protocol(format!("unknown ack status {}", val))),
        }
    }
}

/// Read the frame type of a raw frame.
pub fn frame_type(frame: &[u8]) -> Result<FrameType> {
    match frame.first() {
        Some(&b) if frame.len() >= HDR_LEN => FrameType::try_from(b),
        _ => Err(Error::Protocol(format!("runt frame of {} bytes", frame.len()))),
    }
}

fn header_bits(frame: &[u8]) -> Result<HdrBits> {
    let bytes: [u8; HDR_LEN] = frame
        .get(..HDR_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Protocol(format!("runt frame of {} bytes", frame.len())))?;
    Ok(BitArray::new(bytes))
}

/// Data fragment header, 64 bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name      |
/// | --: | --: | ------------- |
/// |   0 |   7 | frame_type    |
/// |   8 |  11 | msg_type      |
/// |  12 |  35 | ctx           |
/// |  36 |  63 | (reserved)    |
/// |  64 |  95 | tag           |
/// |  96 | 127 | sender        |
/// | 128 | 159 | dest          |
/// | 160 | 191 | data_len      |
/// | 192 | 239 | msg_len       |
/// | 240 | 287 | data_offset   |
/// | 288 | 335 | isend_seq     |
/// | 336 | 383 | frag_seq      |
/// | 384 | 415 | desc_idx      |
/// | 416 | 447 | desc_gen      |
/// | 448 | 479 | data_checksum |
/// | 480 | 511 | hdr_checksum  |
///
/// `sender` and `dest` are global process ids. `desc_idx` and `desc_gen`
/// identify the sender's fragment descriptor and are echoed in the ACK.
/// `hdr_checksum` covers bytes 0..60.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DataHeader {
    bits: HdrBits,
}

impl DataHeader {
    impl_accessor!(frame_type_raw, u8, 0, 7);
    impl_accessor!(msg_type_raw, u8, 8, 11);
    impl_accessor!(ctx, CtxId, 12, 35);
    impl_accessor!(tag, Tag, 64, 95);
    impl_accessor!(sender, ProcId, 96, 127);
    impl_accessor!(dest, ProcId, 128, 159);
    impl_accessor!(data_len, u32, 160, 191);
    impl_accessor!(msg_len, u64, 192, 239);
    impl_accessor!(data_offset, u64, 240, 287);
    impl_accessor!(isend_seq, IsendSeq, 288, 335);
    impl_accessor!(frag_seq, FragSeq, 336, 383);
    impl_accessor!(desc_idx, u32, 384, 415);
    impl_accessor!(desc_gen, u32, 416, 447);
    impl_accessor!(data_checksum, u32, 448, 479);
    impl_accessor!(hdr_checksum, u32, 480, 511);

    pub fn new(msg_type: MsgType, ctx: CtxId, tag: Tag, sender: ProcId, dest: ProcId) -> Self {
        let mut this = Self::default();
        this.set_frame_type_raw(FrameType::Data as u8);
        this.set_msg_type_raw(msg_type as u8);
        this.set_ctx(ctx);
        this.set_tag(tag);
        this.set_sender(sender);
        this.set_dest(dest);
        this
    }

    #[inline]
    pub fn msg_type(&self) -> Result<MsgType> {
        MsgType::try_from(self.msg_type_raw())
    }

    /// Parse the header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let this = Self {
            bits: header_bits(frame)?,
        };
        match FrameType::try_from(this.frame_type_raw())? {
            FrameType::Data => Ok(this),
            other => Err(Error::Protocol(format!("expected data frame, got {:?}", other))),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    /// Compute and store the header checksum.
    pub fn seal(&mut self, mode: ChecksumMode) {
        let ck = checksum(mode, &self.as_bytes()[..HDR_CHECKED_LEN]);
        self.set_hdr_checksum(ck);
    }

    /// Verify the header checksum.
    pub fn verify(&self, mode: ChecksumMode) -> Result<()> {
        if mode == ChecksumMode::None {
            return Ok(());
        }
        let computed = checksum(mode, &self.as_bytes()[..HDR_CHECKED_LEN]);
        if computed != self.hdr_checksum() {
            return Err(Error::CorruptData {
                what: "data header",
                expected: self.hdr_checksum(),
                computed,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHeader")
            .field("msg_type", &self.msg_type())
            .field("ctx", &self.ctx())
            .field("tag", &self.tag())
            .field("sender", &self.sender())
            .field("dest", &self.dest())
            .field("data_len", &self.data_len())
            .field("msg_len", &self.msg_len())
            .field("data_offset", &self.data_offset())
            .field("isend_seq", &self.isend_seq())
            .field("frag_seq", &self.frag_seq())
            .finish()
    }
}

impl Default for DataHeader {
    fn default() -> Self {
        Self {
            bits: BitArray::ZERO,
        }
    }
}

/// Acknowledgment header, 64 bytes, with no payload.
///
/// # Layout
///
/// | Lsb | Msb |     Name       |
/// | --: | --: | -------------- |
/// |   0 |   7 | frame_type     |
/// |   8 |  11 | msg_type       |
/// |  12 |  35 | ctx            |
/// |  36 |  43 | ack_status     |
/// |  44 |  63 | (reserved)     |
/// |  64 |  95 | dest           |
/// |  96 | 127 | src            |
/// | 128 | 159 | desc_idx       |
/// | 160 | 191 | desc_gen       |
/// | 192 | 239 | this_frag_seq  |
/// | 240 | 287 | received_seq   |
/// | 288 | 335 | delivered_seq  |
/// | 336 | 479 | (reserved)     |
/// | 480 | 511 | checksum       |
///
/// `msg_type` is [`MsgType::DataAck`]; `ctx` is echoed from the acknowledged
/// fragment. `received_seq` and `delivered_seq` are the receiver's largest
/// in-order sequence numbers for traffic from `dest`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AckHeader {
    bits: HdrBits,
}

impl AckHeader {
    impl_accessor!(frame_type_raw, u8, 0, 7);
    impl_accessor!(msg_type_raw, u8, 8, 11);
    impl_accessor!(ctx, CtxId, 12, 35);
    impl_accessor!(ack_status_raw, u8, 36, 43);
    impl_accessor!(dest, ProcId, 64, 95);
    impl_accessor!(src, ProcId, 96, 127);
    impl_accessor!(desc_idx, u32, 128, 159);
    impl_accessor!(desc_gen, u32, 160, 191);
    impl_accessor!(this_frag_seq, FragSeq, 192, 239);
    impl_accessor!(received_seq, FragSeq, 240, 287);
    impl_accessor!(delivered_seq, FragSeq, 288, 335);
    impl_accessor!(checksum, u32, 480, 511);

    pub fn new(ctx: CtxId, dest: ProcId, src: ProcId, status: AckStatus) -> Self {
        let mut this = Self::default();
        this.set_frame_type_raw(FrameType::Ack as u8);
        this.set_msg_type_raw(MsgType::DataAck as u8);
        this.set_ctx(ctx);
        this.set_ack_status_raw(status as u8);
        this.set_dest(dest);
        this.set_src(src);
        this
    }

    #[inline]
    pub fn ack_status(&self) -> Result<AckStatus> {
        AckStatus::try_from(self.ack_status_raw())
    }

    pub fn parse(frame: &[u8]) -> Result<Self> {
        let this = Self {
            bits: header_bits(frame)?,
        };
        match FrameType::try_from(this.frame_type_raw())? {
            FrameType::Ack => Ok(this),
            other => Err(Error::Protocol(format!("expected ack frame, got {:?}", other))),
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn seal(&mut self, mode: ChecksumMode) {
        let ck = checksum(mode, &self.as_bytes()[..HDR_CHECKED_LEN]);
        self.set_checksum(ck);
    }

    pub fn verify(&self, mode: ChecksumMode) -> Result<()> {
        if mode == ChecksumMode::None {
            return Ok(());
        }
        let computed = checksum(mode, &self.as_bytes()[..HDR_CHECKED_LEN]);
        if computed != self.checksum() {
            return Err(Error::CorruptData {
                what: "ack header",
                expected: self.checksum(),
                computed,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for AckHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHeader")
            .field("ctx", &self.ctx())
            .field("status", &self.ack_status())
            .field("dest", &self.dest())
            .field("src", &self.src())
            .field("desc", &(self.desc_idx(), self.desc_gen()))
            .field("this_frag_seq", &self.this_frag_seq())
            .field("received_seq", &self.received_seq())
            .field("delivered_seq", &self.delivered_seq())
            .finish()
    }
}

impl Default for AckHeader {
    fn default() -> Self {
        Self {
            bits: BitArray::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_pkthdr_layout() {
        assert_eq!(mem::size_of::<DataHeader>(), HDR_LEN);
        assert_eq!(mem::size_of::<AckHeader>(), HDR_LEN);
    }

    #[test]
    fn data_header_fields() {
        let mut hdr = DataHeader::new(MsgType::Pt2PtSync, 0xab_cdef, 77, 3, 9);
        hdr.set_msg_len(1 << 40);
        hdr.set_data_offset(4096);
        hdr.set_frag_seq((1 << 48) - 1);
        hdr.set_desc_gen(u32::MAX);
        hdr.seal(ChecksumMode::Crc);

        let parsed = DataHeader::parse(hdr.as_bytes()).unwrap();
        assert_eq!(parsed.msg_type().unwrap(), MsgType::Pt2PtSync);
        assert_eq!(parsed.ctx(), 0xab_cdef);
        assert_eq!(parsed.tag(), 77);
        assert_eq!((parsed.sender(), parsed.dest()), (3, 9));
        assert_eq!(parsed.msg_len(), 1 << 40);
        assert_eq!(parsed.data_offset(), 4096);
        assert_eq!(parsed.frag_seq(), (1 << 48) - 1);
        assert_eq!(parsed.desc_gen(), u32::MAX);
        parsed.verify(ChecksumMode::Crc).unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "ctx 16777216 does not fit in 24 bits")]
    fn oversized_context_is_caught() {
        DataHeader::new(MsgType::Pt2Pt, MAX_CTX + 1, 0, 0, 1);
    }

    #[test]
    fn largest_context_fits() {
        let hdr = DataHeader::new(MsgType::Pt2Pt, MAX_CTX, 0, 0, 1);
        assert_eq!(hdr.ctx(), MAX_CTX);
    }

    #[test]
    fn corrupt_header_detected() {
        let mut hdr = DataHeader::new(MsgType::Pt2Pt, 1, 2, 3, 4);
        hdr.seal(ChecksumMode::Sum);
        let mut bytes = hdr.as_bytes().to_vec();
        bytes[20] ^= 0x10;
        let parsed = DataHeader::parse(&bytes).unwrap();
        assert!(matches!(
            parsed.verify(ChecksumMode::Sum),
            Err(Error::CorruptData { .. })
        ));
    }

    #[test]
    fn frame_kinds_are_distinguished() {
        let ack = AckHeader::new(5, 1, 2, AckStatus::DataBad);
        assert_eq!(frame_type(ack.as_bytes()).unwrap(), FrameType::Ack);
        assert!(DataHeader::parse(ack.as_bytes()).is_err());
        assert_eq!(
            AckHeader::parse(ack.as_bytes()).unwrap().ack_status().unwrap(),
            AckStatus::DataBad
        );
        assert!(frame_type(&[0u8; HDR_LEN]).is_err());
        assert!(frame_type(&[1u8; 10]).is_err());
    }
}
