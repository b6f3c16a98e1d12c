use std::sync::Arc;

use ahash::RandomState;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;

use super::{Fabric, Lane, PathType, RecvBuf};
use crate::error::{Error, Result};
use crate::msgbuf::MsgBuf;
use crate::type_alias::*;

#[derive(Debug, Clone)]
pub struct SharedMemConfig {
    /// Frames a mailbox holds before senders see backpressure.
    pub mailbox_depth: usize,
    pub eager_payload: usize,
    pub frag_payload: usize,
    /// Max frames handed up per poll.
    pub recv_batch: usize,
}

impl Default for SharedMemConfig {
    fn default() -> Self {
        Self {
            mailbox_depth: 64,
            eager_payload: 8192,
            frag_payload: 8192,
            recv_batch: 32,
        }
    }
}

/// The shared-memory segment of one host: a bounded mailbox per process.
#[derive(Default)]
pub struct SharedMemSegment {
    mailboxes: DashMap<ProcId, Arc<ArrayQueue<Vec<u8>>>, RandomState>,
}

impl SharedMemSegment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, proc: ProcId, depth: usize) -> Arc<ArrayQueue<Vec<u8>>> {
        self.mailboxes
            .entry(proc)
            .or_insert_with(|| Arc::new(ArrayQueue::new(depth)))
            .clone()
    }

    fn mailbox(&self, proc: ProcId) -> Option<Arc<ArrayQueue<Vec<u8>>>> {
        self.mailboxes.get(&proc).map(|m| m.clone())
    }
}

/// Fabric between the processes of one host.
///
/// A post copies the frame into the destination's mailbox and completes at
/// once; a full mailbox means no tokens.
pub struct SharedMemFabric {
    myproc: ProcId,
    cfg: SharedMemConfig,
    segment: Arc<SharedMemSegment>,
    inbox: Arc<ArrayQueue<Vec<u8>>>,
    done: Vec<u64>,
}

impl SharedMemFabric {
    pub fn new(myproc: ProcId, segment: Arc<SharedMemSegment>, cfg: SharedMemConfig) -> Result<Self> {
        if cfg.mailbox_depth == 0 {
            return Err(Error::Setup("shared memory mailbox of depth 0".into()));
        }
        let inbox = segment.register(myproc, cfg.mailbox_depth);
        Ok(Self {
            myproc,
            cfg,
            segment,
            inbox,
            done: Vec::new(),
        })
    }
}

impl Fabric for SharedMemFabric {
    type Route = Arc<ArrayQueue<Vec<u8>>>;

    fn path_type(&self) -> PathType {
        PathType::SharedMem
    }

    fn eager_payload(&self) -> usize {
        self.cfg.eager_payload
    }

    fn frag_payload(&self) -> usize {
        self.cfg.frag_payload
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        self.segment.mailboxes.contains_key(&dest)
    }

    fn next_lane(&mut self) -> Lane {
        Lane::default()
    }

    fn resolve(&mut self, dest: ProcId, _lane: Lane) -> Result<Self::Route> {
        self.segment.mailbox(dest).ok_or(Error::Unreachable(dest))
    }

    fn post(&mut self, _lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool> {
        if route.push(frame.to_vec()).is_err() {
            return Ok(false);
        }
        self.done.push(wr_id);
        Ok(true)
    }

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()> {
        done.append(&mut self.done);
        Ok(())
    }

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()> {
        for _ in 0..self.cfg.recv_batch {
            let Some(frame) = self.inbox.pop() else {
                break;
            };
            match MsgBuf::from_frame(frame) {
                Ok(buf) => received.push(RecvBuf {
                    lane: Lane::default(),
                    buf,
                }),
                Err(e) => log::warn!("shared memory path: rank {} dropping frame: {}", self.myproc, e),
            }
        }
        Ok(())
    }

    fn repost(&mut self, _buf: RecvBuf) -> Result<()> {
        Ok(())
    }
}
