use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use super::switch::{PortQueue, Switch, Tokens};
use super::{Fabric, Lane, PathType, RecvBuf};
use crate::error::{Error, Result};
use crate::msgbuf::MsgBuf;
use crate::nexus::{allgather_as, AdminChannel};
use crate::type_alias::*;

/// Mellanox's OUI in the top bytes of a port GUID.
const MELLANOX_OUI: u64 = 0x0002_c900_0000_0000;

#[derive(Debug, Clone)]
pub struct IbConfig {
    pub num_hcas: usize,
    pub ports_per_hca: usize,
    /// Send queue depth per HCA.
    pub sq_tokens: usize,
    /// Completion queue depth per HCA.
    pub cq_tokens: usize,
    /// Receive buffers posted per HCA.
    pub rq_tokens: usize,
    pub eager_payload: usize,
    pub frag_payload: usize,
}

impl Default for IbConfig {
    fn default() -> Self {
        Self {
            num_hcas: 1,
            ports_per_hca: 2,
            sq_tokens: 64,
            cq_tokens: 128,
            rq_tokens: 128,
            eager_payload: 2048 - 64,
            frag_payload: 2048 - 64,
        }
    }
}

struct IbPort {
    lid: u64,
    queue: PortQueue,
}

struct Hca {
    ports: Vec<IbPort>,
    sq: Tokens,
    cq: Tokens,
    rq: Tokens,
    done: Vec<u64>,
}

/// LIDs of every port of every HCA of a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IbPeerInfo {
    lids: Vec<Vec<u64>>,
}

/// Destination of an unreliable datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressHandle {
    pub dlid: u64,
    /// Local port the handle was created on.
    pub port: u8,
}

/// InfiniBand unreliable-datagram fabric on a [`Switch`].
///
/// Sends rotate over every local (HCA, port) pair, and for each destination
/// over the peer's ports. A post needs a send queue slot and a completion
/// queue slot on the HCA. Address handles are cached per local lane and
/// remote LID.
pub struct IbFabric {
    myproc: ProcId,
    cfg: IbConfig,
    switch: Arc<Switch>,
    hcas: Vec<Hca>,
    lanes: Vec<Lane>,
    next_lane: usize,
    peers: Vec<Vec<u64>>,
    remote_rr: Vec<usize>,
    ah_cache: HashMap<(Lane, u64), AddressHandle, RandomState>,
}

impl IbFabric {
    /// Open the HCAs and exchange port LIDs with every process.
    pub fn new(admin: &dyn AdminChannel, switch: Arc<Switch>, cfg: IbConfig) -> Result<Self> {
        if cfg.num_hcas == 0 || cfg.ports_per_hca == 0 {
            return Err(Error::Setup(format!(
                "IB with {} HCAs of {} ports",
                cfg.num_hcas, cfg.ports_per_hca
            )));
        }
        if cfg.num_hcas > u8::MAX as usize || cfg.ports_per_hca > u8::MAX as usize {
            return Err(Error::Setup("too many IB HCAs or ports".into()));
        }
        let myproc = admin.myproc();

        let mut hcas = Vec::with_capacity(cfg.num_hcas);
        let mut lanes = Vec::new();
        for h in 0..cfg.num_hcas {
            let ports = (0..cfg.ports_per_hca)
                .map(|p| {
                    let guid = MELLANOX_OUI | (myproc as u64) << 16 | (h as u64) << 8 | p as u64;
                    let (lid, queue) = switch.attach(guid);
                    lanes.push(Lane::new(h as u8, p as u8));
                    IbPort { lid, queue }
                })
                .collect();
            hcas.push(Hca {
                ports,
                sq: Tokens::new(cfg.sq_tokens),
                cq: Tokens::new(cfg.cq_tokens),
                rq: Tokens::new(cfg.rq_tokens),
                done: Vec::new(),
            });
        }

        let info = IbPeerInfo {
            lids: hcas
                .iter()
                .map(|hca| hca.ports.iter().map(|p| p.lid).collect())
                .collect(),
        };
        let peers: Vec<Vec<u64>> = allgather_as(admin, "ib-lids", &info)?
            .into_iter()
            .map(|info| info.lids.into_iter().flatten().collect())
            .collect();
        log::debug!(
            "IB path: rank {} opened {} HCAs with {} active ports",
            myproc,
            hcas.len(),
            lanes.len()
        );

        Ok(Self {
            myproc,
            remote_rr: vec![0; peers.len()],
            cfg,
            switch,
            hcas,
            lanes,
            next_lane: 0,
            peers,
            ah_cache: HashMap::default(),
        })
    }

    /// Every active local (HCA, port).
    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Address handles created so far.
    pub fn num_address_handles(&self) -> usize {
        self.ah_cache.len()
    }
}

impl Fabric for IbFabric {
    type Route = AddressHandle;

    fn path_type(&self) -> PathType {
        PathType::Ib
    }

    fn eager_payload(&self) -> usize {
        self.cfg.eager_payload
    }

    fn frag_payload(&self) -> usize {
        self.cfg.frag_payload
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        self.peers.get(dest as usize).is_some_and(|lids| !lids.is_empty())
    }

    fn next_lane(&mut self) -> Lane {
        let lane = self.lanes[self.next_lane];
        self.next_lane = (self.next_lane + 1) % self.lanes.len();
        lane
    }

    fn resolve(&mut self, dest: ProcId, lane: Lane) -> Result<Self::Route> {
        let d = dest as usize;
        let lids = self
            .peers
            .get(d)
            .filter(|lids| !lids.is_empty())
            .ok_or(Error::Unreachable(dest))?;
        let dlid = lids[self.remote_rr[d] % lids.len()];
        self.remote_rr[d] = self.remote_rr[d].wrapping_add(1);

        if let Some(ah) = self.ah_cache.get(&(lane, dlid)) {
            return Ok(*ah);
        }
        let ah = AddressHandle {
            dlid,
            port: lane.port,
        };
        log::debug!(
            "IB path: rank {} created address handle for LID {} on {:?}",
            self.myproc,
            dlid,
            lane
        );
        self.ah_cache.insert((lane, dlid), ah);
        Ok(ah)
    }

    fn post(&mut self, lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool> {
        let hca = self
            .hcas
            .get_mut(lane.dev as usize)
            .ok_or_else(|| Error::Protocol(format!("IB HCA {} does not exist", lane.dev)))?;
        if hca.sq.available() == 0 || hca.cq.available() == 0 {
            return Ok(false);
        }
        hca.sq.try_take();
        hca.cq.try_take();
        if !self.switch.deliver(route.dlid, frame.to_vec()) {
            log::trace!("IB path: LID {} is gone, datagram lost", route.dlid);
        }
        hca.done.push(wr_id);
        Ok(true)
    }

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()> {
        for hca in &mut self.hcas {
            for wr_id in hca.done.drain(..) {
                hca.sq.give();
                hca.cq.give();
                done.push(wr_id);
            }
        }
        Ok(())
    }

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()> {
        for (h, hca) in self.hcas.iter_mut().enumerate() {
            for (p, port) in hca.ports.iter().enumerate() {
                while hca.rq.available() > 0 {
                    let Some(frame) = port.queue.pop() else {
                        break;
                    };
                    match MsgBuf::from_frame(frame) {
                        Ok(buf) => {
                            hca.rq.try_take();
                            received.push(RecvBuf {
                                lane: Lane::new(h as u8, p as u8),
                                buf,
                            });
                        }
                        Err(e) => log::warn!("IB path: rank {} dropping datagram: {}", self.myproc, e),
                    }
                }
            }
        }
        Ok(())
    }

    fn repost(&mut self, buf: RecvBuf) -> Result<()> {
        if let Some(hca) = self.hcas.get_mut(buf.lane.dev as usize) {
            hca.rq.give();
        }
        Ok(())
    }

    fn finalize(&mut self) {
        for port in self.hcas.iter().flat_map(|h| &h.ports) {
            self.switch.detach(port.lid);
        }
    }
}
