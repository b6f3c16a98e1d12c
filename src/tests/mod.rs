#![allow(unused_imports)]

use super::{type_alias::*, *};
use std::{
    sync::{atomic::*, *},
    thread,
    time::Duration,
};

use futures::executor::block_on;
use quanta::Clock;
use simple_logger::SimpleLogger;

use crate::checksum::ChecksumMode;
use crate::nexus::{AdminChannel, AdminHub, Communicator, FragSink, Group, LocalAdmin, WORLD_CTX};
use crate::path::*;
use crate::pkthdr::{AckHeader, AckStatus, DataHeader, FrameType};
use crate::reassembly::{Delivered, Reassembly};

mod pool;
mod seqtrack;
mod transfer;

static LOGGER: Once = Once::new();

/// Turn on logging once per test binary.
fn init_logger() {
    LOGGER.call_once(|| {
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    });
}

/// Give up on a transfer after this long.
const DEADLINE: Duration = Duration::from_secs(20);

/// Build one value per process of an `n`-process job, each on its own
/// thread so that the admin exchanges can meet.
fn per_proc<T: Send + 'static>(
    n: usize,
    f: impl Fn(LocalAdmin) -> T + Send + Sync + 'static,
) -> Vec<T> {
    let hub = AdminHub::new(n);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..n as ProcId)
        .map(|p| {
            let admin = hub.endpoint(p);
            let f = f.clone();
            thread::spawn(move || f(admin))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Config for tests: fatal errors are returned, never exit.
fn test_config(ack: bool) -> Config {
    Config {
        ack,
        checksum: if ack { ChecksumMode::Crc } else { ChecksumMode::None },
        ..Config::default()
    }
}

/// A process with a reassembling sink.
fn node(me: ProcId, host_of: &[HostId], cfg: Config, clock: Option<Clock>) -> (Nexus, Arc<Reassembly>) {
    let mut ctx = ProcCtx::new(me, host_of.to_vec(), cfg).unwrap();
    if let Some(clock) = clock {
        ctx = ctx.with_clock(clock);
    }
    let sink = Reassembly::new();
    (Nexus::new(ctx, sink.clone()), sink)
}

/// Progress every node until `done` holds.
fn drive(nodes: &[&Nexus], mut done: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !done() {
        for n in nodes {
            n.progress().unwrap();
        }
        assert!(start.elapsed() < DEADLINE, "transfer stalled");
    }
}

/// Progress every node until `sink` has a message.
fn recv_one(nodes: &[&Nexus], sink: &Reassembly) -> Delivered {
    let mut got = None;
    drive(nodes, || {
        got = got.take().or_else(|| sink.try_recv());
        got.is_some()
    });
    got.unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// One frame seen by a [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Posted {
    kind: FrameType,
    dest: ProcId,
    frag_seq: FragSeq,
    data_len: u32,
    status: Option<AckStatus>,
}

/// Fault hook that logs every post and applies planned faults to data
/// frames (by sequence) or ack frames (by acknowledged sequence), once each.
#[derive(Default)]
struct Recorder {
    posts: Mutex<Vec<Posted>>,
    data_faults: Mutex<Vec<(FragSeq, Verdict)>>,
    ack_faults: Mutex<Vec<(FragSeq, Verdict)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fault_data(self: &Arc<Self>, seq: FragSeq, v: Verdict) -> Arc<Self> {
        self.data_faults.lock().unwrap().push((seq, v));
        self.clone()
    }

    fn fault_ack(self: &Arc<Self>, seq: FragSeq, v: Verdict) -> Arc<Self> {
        self.ack_faults.lock().unwrap().push((seq, v));
        self.clone()
    }

    fn posts(&self) -> Vec<Posted> {
        self.posts.lock().unwrap().clone()
    }

    fn data_seqs(&self) -> Vec<FragSeq> {
        self.posts()
            .iter()
            .filter(|p| p.kind == FrameType::Data)
            .map(|p| p.frag_seq)
            .collect()
    }

    fn num_acks(&self) -> usize {
        self.posts().iter().filter(|p| p.kind == FrameType::Ack).count()
    }

    /// Statuses of the acks posted for `seq`, in order.
    fn acks_for(&self, seq: FragSeq) -> Vec<AckStatus> {
        self.posts()
            .iter()
            .filter(|p| p.kind == FrameType::Ack && p.frag_seq == seq)
            .filter_map(|p| p.status)
            .collect()
    }
}

fn take_fault(faults: &Mutex<Vec<(FragSeq, Verdict)>>, seq: FragSeq) -> Verdict {
    let mut faults = faults.lock().unwrap();
    match faults.iter().position(|&(s, _)| s == seq) {
        Some(i) => faults.remove(i).1,
        None => Verdict::Deliver,
    }
}

impl FaultHook for Recorder {
    fn on_post(&self, dest: ProcId, frame: &[u8]) -> Verdict {
        let posted = match pkthdr::frame_type(frame).unwrap() {
            FrameType::Data => {
                let hdr = DataHeader::parse(frame).unwrap();
                Posted {
                    kind: FrameType::Data,
                    dest,
                    frag_seq: hdr.frag_seq(),
                    data_len: hdr.data_len(),
                    status: None,
                }
            }
            FrameType::Ack => {
                let hdr = AckHeader::parse(frame).unwrap();
                Posted {
                    kind: FrameType::Ack,
                    dest,
                    frag_seq: hdr.this_frag_seq(),
                    data_len: 0,
                    status: hdr.ack_status().ok(),
                }
            }
        };
        self.posts.lock().unwrap().push(posted);
        match posted.kind {
            FrameType::Data => take_fault(&self.data_faults, posted.frag_seq),
            FrameType::Ack => take_fault(&self.ack_faults, posted.frag_seq),
        }
    }
}

/// Wrap `fabric` in a fragment path and add it to `nexus`.
fn add_fabric<F: Fabric>(nexus: &Nexus, fabric: F) -> PathHandle {
    let path = FragPath::new(nexus.ctx().clone(), fabric).unwrap();
    nexus.add_path(Box::new(path)).unwrap()
}

/// Like [`add_fabric`], with a fault hook on the path's posts.
fn add_hooked<F: Fabric>(nexus: &Nexus, fabric: F, hook: Arc<Recorder>) -> PathHandle {
    let path = FragPath::new(nexus.ctx().clone(), fabric)
        .unwrap()
        .with_fault_hook(hook);
    nexus.add_path(Box::new(path)).unwrap()
}

/// Whether the path in slot `h` holds no descriptors and no queued work.
fn quiescent(nexus: &Nexus, h: PathHandle) -> bool {
    !nexus.paths().get(h).unwrap().needs_push()
}
