use std::fmt;

use crate::error::{Error, Result};
use crate::pkthdr::HDR_LEN;

/// A wire frame: a fragment header followed by up to `max_len` payload bytes.
///
/// Send descriptors own one each for the lifetime of the descriptor; fabrics
/// hand received frames over in one and get it back on repost.
pub struct MsgBuf {
    /// Backing storage, header included.
    buf: Vec<u8>,

    /// Max payload bytes.
    max_len: usize,

    /// Valid payload bytes.
    len: usize,
}

impl MsgBuf {
    /// Create a zeroed frame able to carry `max_len` payload bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: vec![0; HDR_LEN + max_len],
            max_len,
            len: 0,
        }
    }

    /// Wrap a received frame.
    pub fn from_frame(frame: Vec<u8>) -> Result<Self> {
        if frame.len() < HDR_LEN {
            return Err(Error::Protocol(format!("runt frame of {} bytes", frame.len())));
        }
        let len = frame.len() - HDR_LEN;
        Ok(Self {
            buf: frame,
            max_len: len,
            len,
        })
    }

    /// Valid payload bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Set the payload length.
    ///
    /// # Panics
    ///
    /// Panic if `len` exceeds the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.max_len, "payload {} > {}", len, self.max_len);
        self.len = len;
    }

    #[inline(always)]
    pub fn header(&self) -> &[u8] {
        &self.buf[..HDR_LEN]
    }

    #[inline(always)]
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..HDR_LEN]
    }

    /// Valid payload.
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.buf[HDR_LEN..HDR_LEN + self.len]
    }

    /// Valid payload, mutably.
    #[inline(always)]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HDR_LEN..HDR_LEN + self.len]
    }

    /// The frame to put on the wire: header plus valid payload.
    #[inline(always)]
    pub fn frame(&self) -> &[u8] {
        &self.buf[..HDR_LEN + self.len]
    }
}

impl fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgBuf")
            .field("len", &self.len)
            .field("max_len", &self.max_len)
            .finish()
    }
}
