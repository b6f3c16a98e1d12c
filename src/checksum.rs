//! Fragment checksums and fused copy-with-checksum.

use crc32fast::Hasher;

/// Checksum algorithm applied to fragment payloads and headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChecksumMode {
    /// No checksums; the checksum fields are zero.
    #[default]
    None,

    /// Wrapping sum of little-endian 32-bit words, the trailing partial
    /// word zero-padded.
    Sum,

    /// CRC-32 (IEEE) with a zero initial register.
    Crc,
}

/// Initial register of the CRC.
pub const CRC_INITIAL: u32 = 0;

/// Copy block size of [`copy_with_checksum`].
const COPY_BLOCK: usize = 512;

/// Incremental checksum over a byte stream.
///
/// Feeding the stream in pieces gives the same result as feeding it at once,
/// whatever the split points.
#[derive(Clone)]
pub struct Checksummer {
    state: State,
}

#[derive(Clone)]
enum State {
    None,
    Sum {
        acc: u32,
        tail: [u8; 4],
        tail_len: usize,
    },
    Crc(Hasher),
}

impl Checksummer {
    pub fn new(mode: ChecksumMode) -> Self {
        let state = match mode {
            ChecksumMode::None => State::None,
            ChecksumMode::Sum => State::Sum {
                acc: 0,
                tail: [0; 4],
                tail_len: 0,
            },
            ChecksumMode::Crc => State::Crc(Hasher::new_with_initial(CRC_INITIAL)),
        };
        Self { state }
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        match &mut self.state {
            State::None => {}
            State::Crc(h) => h.update(bytes),
            State::Sum {
                acc,
                tail,
                tail_len,
            } => {
                if *tail_len > 0 {
                    let take = (4 - *tail_len).min(bytes.len());
                    tail[*tail_len..*tail_len + take].copy_from_slice(&bytes[..take]);
                    *tail_len += take;
                    bytes = &bytes[take..];
                    if *tail_len < 4 {
                        return;
                    }
                    *acc = acc.wrapping_add(u32::from_le_bytes(*tail));
                    *tail_len = 0;
                }

                let words = bytes.chunks_exact(4);
                let rest = words.remainder();
                for w in words {
                    *acc = acc.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                }
                tail[..rest.len()].copy_from_slice(rest);
                *tail_len = rest.len();
            }
        }
    }

    pub fn finish(self) -> u32 {
        match self.state {
            State::None => 0,
            State::Crc(h) => h.finalize(),
            State::Sum {
                acc,
                tail,
                tail_len,
            } => {
                let mut last = [0u8; 4];
                last[..tail_len].copy_from_slice(&tail[..tail_len]);
                acc.wrapping_add(u32::from_le_bytes(last))
            }
        }
    }
}

/// One-shot checksum of `bytes`.
pub fn checksum(mode: ChecksumMode, bytes: &[u8]) -> u32 {
    let mut ck = Checksummer::new(mode);
    ck.update(bytes);
    ck.finish()
}

/// Copy `src` into `dst` and feed the copied bytes to `ck`, block by block,
/// so each block is summed while still in cache.
///
/// # Panics
///
/// Panic if `src` and `dst` differ in length.
pub fn copy_with_checksum(src: &[u8], dst: &mut [u8], ck: &mut Checksummer) {
    assert_eq!(src.len(), dst.len(), "copy_with_checksum: length mismatch");
    if matches!(ck.state, State::None) {
        dst.copy_from_slice(src);
        return;
    }
    for (s, d) in src.chunks(COPY_BLOCK).zip(dst.chunks_mut(COPY_BLOCK)) {
        d.copy_from_slice(s);
        ck.update(d);
    }
}
