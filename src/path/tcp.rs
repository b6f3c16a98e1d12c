use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use super::{Fabric, Lane, PathType, RecvBuf};
use crate::error::{Error, Result};
use crate::msgbuf::MsgBuf;
use crate::nexus::{allgather_as, AdminChannel};
use crate::type_alias::*;

/// Length prefix of a frame on a stream.
const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind_addr: SocketAddr,
    pub eager_payload: usize,
    pub frag_payload: usize,
    /// Outbound bytes buffered per connection before posts are refused.
    pub max_pending_bytes: usize,
    /// Max frames handed up per poll.
    pub recv_batch: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            eager_payload: 16 * 1024,
            frag_payload: 16 * 1024,
            max_pending_bytes: 256 * 1024,
            recv_batch: 64,
        }
    }
}

/// Outbound connection to one peer.
struct OutConn {
    stream: TcpStream,
    out: Vec<u8>,
    /// Bytes of `out` already written.
    written: usize,
    /// Stream offsets at which posted frames end, with their work ids.
    inflight: VecDeque<(u64, u64)>,
    queued_total: u64,
    written_total: u64,
}

impl OutConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            out: Vec::new(),
            written: 0,
            inflight: VecDeque::new(),
            queued_total: 0,
            written_total: 0,
        }
    }

    fn pending(&self) -> usize {
        self.out.len() - self.written
    }

    fn queue(&mut self, frame: &[u8], wr_id: u64) {
        self.out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        self.out.extend_from_slice(frame);
        self.queued_total += (LEN_PREFIX + frame.len()) as u64;
        self.inflight.push_back((self.queued_total, wr_id));
    }

    /// Write what the socket takes. Completed work ids go to `done`.
    fn flush(&mut self, done: &mut Vec<u64>) -> io::Result<bool> {
        let mut progressed = false;
        while self.written < self.out.len() {
            match self.stream.write(&self.out[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    self.written_total += n as u64;
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        while let Some(&(end, wr_id)) = self.inflight.front() {
            if end > self.written_total {
                break;
            }
            done.push(wr_id);
            self.inflight.pop_front();
        }
        if self.written == self.out.len() {
            self.out.clear();
            self.written = 0;
        }
        Ok(progressed)
    }
}

/// Inbound connection from some peer. Senders are named by frame headers.
struct InConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connected,
    Failed,
}

/// Fabric over TCP streams.
///
/// Every peer is connected at setup. Frames are length-prefixed and
/// complete once fully written to the socket. A peer whose connection
/// breaks becomes unreachable, [`Fabric::update`] reports the change, and
/// the frames still queued for it are reported as failed.
pub struct TcpFabric {
    myproc: ProcId,
    cfg: TcpConfig,
    listener: TcpListener,
    states: Vec<PeerState>,
    out: Vec<Option<OutConn>>,
    inbound: Vec<InConn>,
    done: Vec<u64>,
    failed: Vec<u64>,
    changed: bool,
}

impl TcpFabric {
    /// Listen, exchange listener addresses with every process and connect
    /// to each of them.
    pub fn new(admin: &dyn AdminChannel, cfg: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(cfg.bind_addr)
            .map_err(|e| Error::Setup(format!("TCP listen {}: {}", cfg.bind_addr, e)))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let addrs: Vec<SocketAddr> = allgather_as(admin, "tcp-addr", &local)?;
        let myproc = admin.myproc();
        log::debug!("TCP path: rank {} listening on {}", myproc, local);

        let mut states = Vec::with_capacity(addrs.len());
        let mut out = Vec::with_capacity(addrs.len());
        for (dest, &addr) in addrs.iter().enumerate() {
            match connect(addr) {
                Ok(stream) => {
                    log::debug!("TCP path: rank {} connected to {} at {}", myproc, dest, addr);
                    states.push(PeerState::Connected);
                    out.push(Some(OutConn::new(stream)));
                }
                Err(e) => {
                    log::warn!("TCP path: rank {} cannot connect to {} at {}: {}", myproc, dest, addr, e);
                    states.push(PeerState::Failed);
                    out.push(None);
                }
            }
        }

        Ok(Self {
            myproc,
            cfg,
            listener,
            states,
            out,
            inbound: Vec::new(),
            done: Vec::new(),
            failed: Vec::new(),
            changed: false,
        })
    }

    fn fail(&mut self, dest: ProcId, err: &io::Error) {
        log::warn!("TCP path: rank {} lost connection to {}: {}", self.myproc, dest, err);
        let d = dest as usize;
        self.states[d] = PeerState::Failed;
        if let Some(conn) = self.out[d].take() {
            // Nothing more will be written.
            self.failed.extend(conn.inflight.iter().map(|&(_, wr_id)| wr_id));
        }
        self.changed = true;
    }

    fn accept(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    self.inbound.push(InConn {
                        stream,
                        buf: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Split complete frames off the front of `buf`.
fn take_frames(buf: &mut Vec<u8>, max_frames: usize, out: &mut Vec<Vec<u8>>) {
    let mut pos = 0;
    while out.len() < max_frames && buf.len() - pos >= LEN_PREFIX {
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(&buf[pos..pos + LEN_PREFIX]);
        let len = u32::from_le_bytes(len) as usize;
        if buf.len() - pos - LEN_PREFIX < len {
            break;
        }
        pos += LEN_PREFIX;
        out.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    buf.drain(..pos);
}

impl Fabric for TcpFabric {
    type Route = ProcId;

    fn path_type(&self) -> PathType {
        PathType::Tcp
    }

    fn eager_payload(&self) -> usize {
        self.cfg.eager_payload
    }

    fn frag_payload(&self) -> usize {
        self.cfg.frag_payload
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        self.states.get(dest as usize) == Some(&PeerState::Connected)
    }

    fn next_lane(&mut self) -> Lane {
        Lane::default()
    }

    fn resolve(&mut self, dest: ProcId, _lane: Lane) -> Result<Self::Route> {
        if self.can_reach(dest) {
            Ok(dest)
        } else {
            Err(Error::Unreachable(dest))
        }
    }

    fn post(&mut self, _lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool> {
        let dest = *route;
        let max_pending = self.cfg.max_pending_bytes;
        let Some(conn) = self.out.get_mut(dest as usize).and_then(Option::as_mut) else {
            return Err(Error::Unreachable(dest));
        };
        if conn.pending() > 0 && conn.pending() + LEN_PREFIX + frame.len() > max_pending {
            return Ok(false);
        }
        conn.queue(frame, wr_id);
        let res = conn.flush(&mut self.done);
        if let Err(e) = res {
            self.fail(dest, &e);
        }
        Ok(true)
    }

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()> {
        done.append(&mut self.done);
        Ok(())
    }

    fn poll_send_failures(&mut self, failed: &mut Vec<u64>) {
        failed.append(&mut self.failed);
    }

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()> {
        self.accept()?;

        let mut frames = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        let mut i = 0;
        while i < self.inbound.len() {
            let conn = &mut self.inbound[i];
            let mut closed = false;
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("TCP path: rank {} inbound read failed: {}", self.myproc, e);
                        closed = true;
                        break;
                    }
                }
            }
            take_frames(&mut conn.buf, self.cfg.recv_batch, &mut frames);
            if closed && frames.len() < self.cfg.recv_batch {
                self.inbound.swap_remove(i);
            } else {
                i += 1;
            }
        }

        for frame in frames {
            match MsgBuf::from_frame(frame) {
                Ok(buf) => received.push(RecvBuf {
                    lane: Lane::default(),
                    buf,
                }),
                Err(e) => log::warn!("TCP path: rank {} dropping frame: {}", self.myproc, e),
            }
        }
        Ok(())
    }

    fn repost(&mut self, _buf: RecvBuf) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        let mut progressed = false;
        let mut failed = Vec::new();
        for (dest, conn) in self.out.iter_mut().enumerate() {
            let Some(conn) = conn else {
                continue;
            };
            match conn.flush(&mut self.done) {
                Ok(p) => progressed |= p,
                Err(e) => failed.push((dest as ProcId, e)),
            }
        }
        for (dest, e) in failed {
            self.fail(dest, &e);
            progressed = true;
        }
        Ok(progressed)
    }

    fn has_pending(&self) -> bool {
        self.out.iter().flatten().any(|c| c.pending() > 0)
    }

    fn update(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn finalize(&mut self) {
        for conn in self.out.iter_mut().flatten() {
            let _ = conn.stream.shutdown(std::net::Shutdown::Write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_reads() {
        let mut stream = Vec::new();
        for payload in [&b"abc"[..], &b""[..], &b"defgh"[..]] {
            stream.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            stream.extend_from_slice(payload);
        }

        let mut buf = stream[..5].to_vec();
        let mut frames = Vec::new();
        take_frames(&mut buf, 16, &mut frames);
        assert!(frames.is_empty());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&stream[5..]);
        take_frames(&mut buf, 16, &mut frames);
        assert_eq!(frames, vec![b"abc".to_vec(), Vec::new(), b"defgh".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_batch_is_bounded() {
        let mut buf = Vec::new();
        for _ in 0..3 {
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.push(7);
        }
        let mut frames = Vec::new();
        take_frames(&mut buf, 2, &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(buf.len(), LEN_PREFIX + 1);
    }
}
