//! A [`FragSink`] that reassembles whole messages.

use std::collections::HashSet;
use std::sync::Arc;

use ahash::RandomState;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use quanta::Instant;

use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::frag::RecvFrag;
use crate::nexus::FragSink;
use crate::type_alias::*;

/// A message whose every byte has arrived intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub ctx: CtxId,
    /// Sender rank in the communicator.
    pub src: ProcId,
    pub tag: Tag,
    pub isend_seq: IsendSeq,
    pub data: Vec<u8>,
}

struct Partial {
    src: ProcId,
    tag: Tag,
    msg_len: usize,
    buf: Vec<u8>,
    offsets: HashSet<usize, RandomState>,
    bytes: usize,
}

/// Messages are keyed by context, global sender and isend sequence.
type MsgKey = (CtxId, ProcId, IsendSeq);

/// Reassembles fragments into messages, in arrival order of their last
/// fragment.
///
/// With a receive datatype, each message is scattered into a buffer laid
/// out as `msg_len / packed_size` elements of that type.
pub struct Reassembly {
    recv_type: Option<Arc<Datatype>>,
    partial: DashMap<MsgKey, Partial, RandomState>,
    done: SegQueue<Delivered>,
}

impl Reassembly {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_datatype(dtype: Arc<Datatype>) -> Arc<Self> {
        Arc::new(Self::build(Some(dtype)))
    }

    fn build(recv_type: Option<Arc<Datatype>>) -> Self {
        Self {
            recv_type,
            partial: DashMap::with_hasher(RandomState::new()),
            done: SegQueue::new(),
        }
    }

    /// Next complete message, if any.
    pub fn try_recv(&self) -> Option<Delivered> {
        self.done.pop()
    }

    /// Messages with some but not all bytes in.
    pub fn num_partial(&self) -> usize {
        self.partial.len()
    }

    fn user_len(&self, msg_len: usize) -> Result<usize> {
        let Some(dtype) = &self.recv_type else {
            return Ok(msg_len);
        };
        let packed = dtype.packed_size();
        if packed == 0 || msg_len % packed != 0 {
            return Err(Error::Protocol(format!(
                "{}-byte message is not whole elements of {} bytes",
                msg_len, packed
            )));
        }
        Ok(dtype.span(msg_len / packed))
    }
}

impl FragSink for Reassembly {
    fn handle_received_frag(&self, frag: &mut RecvFrag, _now: Instant) -> Result<()> {
        let key = (frag.ctx(), frag.global_src(), frag.isend_seq());
        let (off, len, msg_len) = (frag.seq_offset(), frag.len(), frag.msg_len());
        if off + len > msg_len {
            return Err(Error::Protocol(format!(
                "fragment [{}, {}) past the end of a {}-byte message",
                off,
                off + len,
                msg_len
            )));
        }

        let user_len = self.user_len(msg_len)?;
        let mut entry = self.partial.entry(key).or_insert_with(|| Partial {
            src: frag.src(),
            tag: frag.tag(),
            msg_len,
            buf: vec![0; user_len],
            offsets: HashSet::default(),
            bytes: 0,
        });
        if entry.offsets.contains(&off) {
            return Ok(());
        }

        let intact = match &self.recv_type {
            Some(dtype) => frag.unpack(Some(dtype.as_ref()), &mut entry.buf)?,
            None => frag.copy_out(&mut entry.buf[off..off + len]),
        };
        if !intact {
            log::warn!(
                "reassembly: corrupt fragment at offset {} of message {} from {}",
                off,
                key.2,
                key.1
            );
            return Ok(());
        }
        entry.offsets.insert(off);
        entry.bytes += len;

        if entry.bytes < entry.msg_len {
            return Ok(());
        }
        drop(entry);
        if let Some((_, p)) = self.partial.remove(&key) {
            self.done.push(Delivered {
                ctx: key.0,
                src: p.src,
                tag: p.tag,
                isend_seq: key.2,
                data: p.buf,
            });
        }
        Ok(())
    }
}
