use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::{Fabric, Lane, PathType, RecvBuf};
use crate::error::{Error, Result};
use crate::msgbuf::MsgBuf;
use crate::nexus::{allgather_as, AdminChannel};
use crate::pkthdr::HDR_LEN;
use crate::type_alias::*;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to bind; port 0 picks one.
    pub bind_addr: SocketAddr,
    pub eager_payload: usize,
    pub frag_payload: usize,
    /// Max datagrams read per poll.
    pub recv_batch: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            eager_payload: 2048,
            frag_payload: 2048,
            recv_batch: 64,
        }
    }
}

/// Fabric over one nonblocking UDP socket per process.
///
/// Datagrams complete as soon as the kernel takes them; loss is left to the
/// acknowledgment protocol.
pub struct UdpFabric {
    myproc: ProcId,
    cfg: UdpConfig,
    socket: UdpSocket,
    peers: Vec<Option<SocketAddr>>,
    /// One byte longer than the largest frame, so that truncation shows.
    rx_buf: Vec<u8>,
    done: Vec<u64>,
}

impl UdpFabric {
    /// Bind the socket and exchange addresses with every process.
    pub fn new(admin: &dyn AdminChannel, cfg: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(cfg.bind_addr)
            .map_err(|e| Error::Setup(format!("UDP bind {}: {}", cfg.bind_addr, e)))?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let peers = allgather_as(admin, "udp-addr", &local)?
            .into_iter()
            .map(Some)
            .collect();
        log::debug!("UDP path: rank {} listening on {}", admin.myproc(), local);

        Ok(Self {
            myproc: admin.myproc(),
            rx_buf: vec![0; max_frame(&cfg) + 1],
            cfg,
            socket,
            peers,
            done: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

fn max_frame(cfg: &UdpConfig) -> usize {
    HDR_LEN + cfg.eager_payload.max(cfg.frag_payload)
}

impl Fabric for UdpFabric {
    type Route = SocketAddr;

    fn path_type(&self) -> PathType {
        PathType::Udp
    }

    fn eager_payload(&self) -> usize {
        self.cfg.eager_payload
    }

    fn frag_payload(&self) -> usize {
        self.cfg.frag_payload
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        matches!(self.peers.get(dest as usize), Some(Some(_)))
    }

    fn next_lane(&mut self) -> Lane {
        Lane::default()
    }

    fn resolve(&mut self, dest: ProcId, _lane: Lane) -> Result<Self::Route> {
        self.peers
            .get(dest as usize)
            .copied()
            .flatten()
            .ok_or(Error::Unreachable(dest))
    }

    fn post(&mut self, _lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool> {
        match self.socket.send_to(frame, route) {
            Ok(_) => {
                self.done.push(wr_id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()> {
        done.append(&mut self.done);
        Ok(())
    }

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()> {
        for _ in 0..self.cfg.recv_batch {
            let (n, from) = match self.socket.recv_from(&mut self.rx_buf) {
                Ok(got) => got,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            if n > max_frame(&self.cfg) {
                log::warn!(
                    "UDP path: rank {} dropping oversized datagram from {} (over {} bytes)",
                    self.myproc,
                    from,
                    max_frame(&self.cfg)
                );
                continue;
            }
            match MsgBuf::from_frame(self.rx_buf[..n].to_vec()) {
                Ok(buf) => received.push(RecvBuf {
                    lane: Lane::default(),
                    buf,
                }),
                Err(e) => log::warn!("UDP path: rank {} dropping datagram: {}", self.myproc, e),
            }
        }
        Ok(())
    }

    fn repost(&mut self, _buf: RecvBuf) -> Result<()> {
        Ok(())
    }
}
