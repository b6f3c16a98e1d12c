//! Flattened datatype descriptions and typemap-driven packing.
//!
//! A [`Datatype`] describes one element of a possibly non-contiguous user
//! layout as a list of `(offset, size)` runs within an extent. A message of
//! `count` elements repeats the typemap every `extent` bytes. The packed
//! (wire) stream is the concatenation of all runs in order.

use crate::checksum::{copy_with_checksum, ChecksumMode, Checksummer};
use crate::error::{Error, Result};

/// One run of the typemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypePair {
    /// Byte offset within the element.
    pub offset: usize,
    pub size: usize,
    /// Packed offset of this run within one element.
    pub seq_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    extent: usize,
    packed_size: usize,
    pairs: Vec<TypePair>,
}

impl Datatype {
    /// A contiguous type of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panic if `size` is zero.
    pub fn contiguous(size: usize) -> Self {
        assert!(size > 0, "zero-sized datatype");
        Self {
            extent: size,
            packed_size: size,
            pairs: vec![TypePair {
                offset: 0,
                size,
                seq_offset: 0,
            }],
        }
    }

    /// A type whose elements span `extent` bytes and carry data in `runs`,
    /// given as `(offset, size)` in packing order.
    pub fn new(extent: usize, runs: &[(usize, usize)]) -> Result<Self> {
        if runs.is_empty() {
            return Err(Error::Protocol("datatype without runs".into()));
        }
        let mut pairs = Vec::with_capacity(runs.len());
        let mut packed = 0;
        for &(offset, size) in runs {
            if size == 0 || offset + size > extent {
                return Err(Error::Protocol(format!(
                    "datatype run ({}, {}) does not fit extent {}",
                    offset, size, extent
                )));
            }
            pairs.push(TypePair {
                offset,
                size,
                seq_offset: packed,
            });
            packed += size;
        }
        Ok(Self {
            extent,
            packed_size: packed,
            pairs,
        })
    }

    /// A strided vector: `blocks` blocks of `block_len` bytes, `stride` apart.
    pub fn vector(blocks: usize, block_len: usize, stride: usize) -> Result<Self> {
        let runs = (0..blocks).map(|i| (i * stride, block_len)).collect::<Vec<_>>();
        let extent = stride * blocks.saturating_sub(1) + block_len;
        Self::new(extent.max(stride), &runs)
    }

    #[inline]
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Bytes of data in one element.
    #[inline]
    pub fn packed_size(&self) -> usize {
        self.packed_size
    }

    #[inline]
    pub fn pairs(&self) -> &[TypePair] {
        &self.pairs
    }

    /// Whether packing is a plain copy.
    pub fn is_contiguous(&self) -> bool {
        self.pairs.len() == 1 && self.pairs[0].offset == 0 && self.pairs[0].size == self.extent
    }

    /// User buffer length needed to hold `count` elements.
    pub fn span(&self, count: usize) -> usize {
        match count {
            0 => 0,
            n => {
                let last = self.pairs.iter().map(|p| p.offset + p.size).max().unwrap_or(0);
                (n - 1) * self.extent + last
            }
        }
    }

    /// Iterate the user-buffer runs `(offset, len)` covering packed bytes
    /// `[seq_offset, seq_offset + len)`.
    pub fn runs(&self, seq_offset: usize, len: usize) -> Runs<'_> {
        let within = seq_offset % self.packed_size;
        // Last pair starting at or before `within`.
        let pair = self.pairs.partition_point(|p| p.seq_offset <= within) - 1;
        Runs {
            dt: self,
            elem: seq_offset / self.packed_size,
            pair,
            skip: within - self.pairs[pair].seq_offset,
            remaining: len,
        }
    }

    /// Pack `count` elements of `src` into a fresh contiguous buffer.
    pub fn pack_all(&self, src: &[u8], count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; self.packed_size * count];
        pack(src, Some(self), 0, &mut out, ChecksumMode::None)?;
        Ok(out)
    }
}

/// Iterator returned by [`Datatype::runs`].
pub struct Runs<'a> {
    dt: &'a Datatype,
    elem: usize,
    pair: usize,
    skip: usize,
    remaining: usize,
}

impl Iterator for Runs<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let p = &self.dt.pairs[self.pair];
        let start = self.elem * self.dt.extent + p.offset + self.skip;
        let n = (p.size - self.skip).min(self.remaining);

        self.remaining -= n;
        self.skip = 0;
        self.pair += 1;
        if self.pair == self.dt.pairs.len() {
            self.pair = 0;
            self.elem += 1;
        }
        Some((start, n))
    }
}

fn out_of_bounds(off: usize, len: usize, avail: usize) -> Error {
    Error::Protocol(format!(
        "range {}..{} exceeds user buffer of {} bytes",
        off,
        off + len,
        avail
    ))
}

/// Gather `dst.len()` packed bytes starting at packed offset `seq_offset`
/// from the user buffer `src`, returning the checksum of the packed bytes.
pub fn pack(
    src: &[u8],
    dtype: Option<&Datatype>,
    seq_offset: usize,
    dst: &mut [u8],
    mode: ChecksumMode,
) -> Result<u32> {
    let mut ck = Checksummer::new(mode);
    match dtype.filter(|dt| !dt.is_contiguous()) {
        None => {
            let s = src
                .get(seq_offset..seq_offset + dst.len())
                .ok_or_else(|| out_of_bounds(seq_offset, dst.len(), src.len()))?;
            copy_with_checksum(s, dst, &mut ck);
        }
        Some(dt) => {
            let mut at = 0;
            for (off, n) in dt.runs(seq_offset, dst.len()) {
                let s = src
                    .get(off..off + n)
                    .ok_or_else(|| out_of_bounds(off, n, src.len()))?;
                copy_with_checksum(s, &mut dst[at..at + n], &mut ck);
                at += n;
            }
        }
    }
    Ok(ck.finish())
}

/// Scatter packed bytes `src` (starting at packed offset `seq_offset`) into
/// the user buffer `dst`, returning the checksum of the packed bytes.
pub fn unpack(
    src: &[u8],
    dtype: Option<&Datatype>,
    seq_offset: usize,
    dst: &mut [u8],
    mode: ChecksumMode,
) -> Result<u32> {
    let mut ck = Checksummer::new(mode);
    match dtype.filter(|dt| !dt.is_contiguous()) {
        None => {
            let avail = dst.len();
            let d = dst
                .get_mut(seq_offset..seq_offset + src.len())
                .ok_or_else(|| out_of_bounds(seq_offset, src.len(), avail))?;
            copy_with_checksum(src, d, &mut ck);
        }
        Some(dt) => {
            let avail = dst.len();
            let mut at = 0;
            for (off, n) in dt.runs(seq_offset, src.len()) {
                let d = dst
                    .get_mut(off..off + n)
                    .ok_or_else(|| out_of_bounds(off, n, avail))?;
                copy_with_checksum(&src[at..at + n], d, &mut ck);
                at += n;
            }
        }
    }
    Ok(ck.finish())
}
