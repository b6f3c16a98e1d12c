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

/// Myricom's OUI in the top bytes of a unique id.
const MYRICOM_OUI: u64 = 0x0060_dd00_0000_0000;

#[derive(Debug, Clone)]
pub struct GmConfig {
    pub num_devices: usize,
    /// Send tokens per device.
    pub send_tokens: usize,
    /// Receive buffers provided to each device.
    pub recv_tokens: usize,
    pub eager_payload: usize,
    pub frag_payload: usize,
}

impl Default for GmConfig {
    fn default() -> Self {
        Self {
            num_devices: 1,
            send_tokens: 32,
            recv_tokens: 64,
            eager_payload: 4096,
            frag_payload: 4096,
        }
    }
}

struct GmDevice {
    node_id: u64,
    queue: PortQueue,
    send_tokens: Tokens,
    recv_tokens: Tokens,
    done: Vec<u64>,
}

/// What a process publishes about its devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GmPeerInfo {
    unique_ids: Vec<u64>,
}

/// Myrinet GM fabric on a [`Switch`].
///
/// Peers are known by the unique ids of their devices; node ids are looked
/// up on first use and cached. Sends rotate over the local devices and go
/// to the peer's device of the same index, wrapping if it has fewer.
pub struct GmFabric {
    myproc: ProcId,
    cfg: GmConfig,
    switch: Arc<Switch>,
    devices: Vec<GmDevice>,
    peers: Vec<Vec<u64>>,
    node_ids: HashMap<u64, u64, RandomState>,
    next_dev: usize,
}

impl GmFabric {
    /// Open the devices and exchange unique ids with every process.
    pub fn new(admin: &dyn AdminChannel, switch: Arc<Switch>, cfg: GmConfig) -> Result<Self> {
        if cfg.num_devices == 0 || cfg.num_devices > u8::MAX as usize {
            return Err(Error::Setup(format!("GM with {} devices", cfg.num_devices)));
        }
        let myproc = admin.myproc();
        let mut unique_ids = Vec::with_capacity(cfg.num_devices);
        let devices = (0..cfg.num_devices)
            .map(|dev| {
                let unique_id = MYRICOM_OUI | (myproc as u64) << 8 | dev as u64;
                let (node_id, queue) = switch.attach(unique_id);
                unique_ids.push(unique_id);
                GmDevice {
                    node_id,
                    queue,
                    send_tokens: Tokens::new(cfg.send_tokens),
                    recv_tokens: Tokens::new(cfg.recv_tokens),
                    done: Vec::new(),
                }
            })
            .collect::<Vec<_>>();

        let peers = allgather_as(admin, "gm-unique-ids", &GmPeerInfo { unique_ids })?
            .into_iter()
            .map(|info| info.unique_ids)
            .collect();
        log::debug!(
            "GM path: rank {} opened {} devices on {}",
            myproc,
            devices.len(),
            switch.name()
        );

        Ok(Self {
            myproc,
            cfg,
            switch,
            devices,
            peers,
            node_ids: HashMap::default(),
            next_dev: 0,
        })
    }

    /// Node id of local device `dev`.
    pub fn node_id(&self, dev: usize) -> Option<u64> {
        self.devices.get(dev).map(|d| d.node_id)
    }

    fn remote_unique_id(&self, dest: ProcId, lane: Lane) -> Option<u64> {
        let ids = self.peers.get(dest as usize)?;
        if ids.is_empty() {
            return None;
        }
        Some(ids[lane.dev as usize % ids.len()])
    }
}

impl Fabric for GmFabric {
    type Route = u64;

    fn path_type(&self) -> PathType {
        PathType::Gm
    }

    fn eager_payload(&self) -> usize {
        self.cfg.eager_payload
    }

    fn frag_payload(&self) -> usize {
        self.cfg.frag_payload
    }

    fn can_reach(&self, dest: ProcId) -> bool {
        self.remote_unique_id(dest, Lane::default())
            .is_some_and(|uid| self.node_ids.contains_key(&uid) || self.switch.lookup(uid).is_some())
    }

    fn next_lane(&mut self) -> Lane {
        let dev = self.next_dev;
        self.next_dev = (self.next_dev + 1) % self.devices.len();
        Lane::new(dev as u8, 0)
    }

    fn resolve(&mut self, dest: ProcId, lane: Lane) -> Result<Self::Route> {
        let uid = self
            .remote_unique_id(dest, lane)
            .ok_or(Error::Unreachable(dest))?;
        if let Some(&node_id) = self.node_ids.get(&uid) {
            return Ok(node_id);
        }
        let node_id = self.switch.lookup(uid).ok_or(Error::Unreachable(dest))?;
        log::debug!("GM path: rank {} mapped unique id {:#x} to node {}", self.myproc, uid, node_id);
        self.node_ids.insert(uid, node_id);
        Ok(node_id)
    }

    fn post(&mut self, lane: Lane, route: &Self::Route, frame: &[u8], wr_id: u64) -> Result<bool> {
        let dev = self
            .devices
            .get_mut(lane.dev as usize)
            .ok_or_else(|| Error::Protocol(format!("GM device {} does not exist", lane.dev)))?;
        if !dev.send_tokens.try_take() {
            return Ok(false);
        }
        if !self.switch.deliver(*route, frame.to_vec()) {
            log::trace!("GM path: node {} is gone, frame lost", route);
        }
        dev.done.push(wr_id);
        Ok(true)
    }

    fn poll_send_completions(&mut self, done: &mut Vec<u64>) -> Result<()> {
        for dev in &mut self.devices {
            for wr_id in dev.done.drain(..) {
                dev.send_tokens.give();
                done.push(wr_id);
            }
        }
        Ok(())
    }

    fn poll_recv(&mut self, received: &mut Vec<RecvBuf>) -> Result<()> {
        for (idx, dev) in self.devices.iter_mut().enumerate() {
            while dev.recv_tokens.available() > 0 {
                let Some(frame) = dev.queue.pop() else {
                    break;
                };
                match MsgBuf::from_frame(frame) {
                    Ok(buf) => {
                        dev.recv_tokens.try_take();
                        received.push(RecvBuf {
                            lane: Lane::new(idx as u8, 0),
                            buf,
                        });
                    }
                    Err(e) => log::warn!("GM path: rank {} dropping frame: {}", self.myproc, e),
                }
            }
        }
        Ok(())
    }

    fn repost(&mut self, buf: RecvBuf) -> Result<()> {
        if let Some(dev) = self.devices.get_mut(buf.lane.dev as usize) {
            dev.recv_tokens.give();
        }
        Ok(())
    }

    fn finalize(&mut self) {
        for dev in &self.devices {
            self.switch.detach(dev.node_id);
        }
    }
}
