//! Out-of-band administrative channel.
//!
//! Fabrics use it at setup time to exchange addressing information (socket
//! addresses, node ids, LIDs) with every other process of the job.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;
use dashmap::DashMap;
use rmp_serde as rmps;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::type_alias::*;

/// Point-to-point and collective exchange between the processes of a job.
pub trait AdminChannel: Send + Sync {
    /// Global id of the calling process.
    fn myproc(&self) -> ProcId;

    /// Number of processes in the job.
    fn nprocs(&self) -> usize;

    /// Send `payload` to `dest` under `tag`.
    fn send(&self, dest: ProcId, tag: &str, payload: Vec<u8>) -> Result<()>;

    /// Block until a message from `src` under `tag` arrives.
    fn receive(&self, src: ProcId, tag: &str) -> Result<Vec<u8>>;

    /// Contribute `payload` and collect every process's contribution,
    /// indexed by process id.
    fn allgather(&self, tag: &str, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        for dest in 0..self.nprocs() as ProcId {
            if dest != self.myproc() {
                self.send(dest, tag, payload.clone())?;
            }
        }
        (0..self.nprocs() as ProcId)
            .map(|src| {
                if src == self.myproc() {
                    Ok(payload.clone())
                } else {
                    self.receive(src, tag)
                }
            })
            .collect()
    }
}

/// [`AdminChannel::allgather`] of a serializable value.
pub fn allgather_as<T: Serialize + DeserializeOwned>(
    admin: &dyn AdminChannel,
    tag: &str,
    value: &T,
) -> Result<Vec<T>> {
    let payload = rmps::to_vec(value)?;
    admin
        .allgather(tag, payload)?
        .iter()
        .map(|bytes| rmps::from_slice(bytes).map_err(Error::from))
        .collect()
}

/// A message in flight on the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdminEvent {
    src: ProcId,
    tag: String,
    payload: Vec<u8>,
}

/// Mailbox key: destination and source.
type MailboxKey = (ProcId, ProcId);

/// In-process admin hub shared by the processes of a job that all live in
/// one OS process.
pub struct AdminHub {
    nprocs: usize,
    mailboxes: DashMap<MailboxKey, Arc<SegQueue<Vec<u8>>>, RandomState>,
    timeout: Duration,
}

impl AdminHub {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(nprocs: usize) -> Arc<Self> {
        Arc::new(Self {
            nprocs,
            mailboxes: DashMap::with_capacity_and_hasher(nprocs * nprocs, RandomState::new()),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Endpoint of process `proc`.
    ///
    /// # Panics
    ///
    /// Panic if `proc` is out of range.
    pub fn endpoint(self: &Arc<Self>, proc: ProcId) -> LocalAdmin {
        assert!((proc as usize) < self.nprocs, "process {} out of range", proc);
        LocalAdmin {
            hub: self.clone(),
            me: proc,
            stash: DashMap::with_hasher(RandomState::new()),
        }
    }

    fn mailbox(&self, dest: ProcId, src: ProcId) -> Arc<SegQueue<Vec<u8>>> {
        self.mailboxes
            .entry((dest, src))
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .clone()
    }
}

/// A process's endpoint on an [`AdminHub`].
pub struct LocalAdmin {
    hub: Arc<AdminHub>,
    me: ProcId,
    /// Events popped while looking for another tag.
    stash: DashMap<(ProcId, String), SegQueue<Vec<u8>>, RandomState>,
}

impl AdminChannel for LocalAdmin {
    fn myproc(&self) -> ProcId {
        self.me
    }

    fn nprocs(&self) -> usize {
        self.hub.nprocs
    }

    fn send(&self, dest: ProcId, tag: &str, payload: Vec<u8>) -> Result<()> {
        if dest as usize >= self.hub.nprocs {
            return Err(Error::Setup(format!("admin send to unknown process {}", dest)));
        }
        let evt = AdminEvent {
            src: self.me,
            tag: tag.to_owned(),
            payload,
        };
        self.hub.mailbox(dest, self.me).push(rmps::to_vec(&evt)?);
        Ok(())
    }

    fn receive(&self, src: ProcId, tag: &str) -> Result<Vec<u8>> {
        let key = (src, tag.to_owned());
        if let Some(payload) = self.stash.get(&key).and_then(|q| q.pop()) {
            return Ok(payload);
        }

        let mailbox = self.hub.mailbox(self.me, src);
        let start = Instant::now();
        let backoff = Backoff::new();
        loop {
            while let Some(bytes) = mailbox.pop() {
                let Ok(evt) = rmps::from_slice::<AdminEvent>(&bytes) else {
                    log::debug!("admin {}: ignoring malformed event from {}", self.me, src);
                    continue;
                };
                if evt.tag == tag {
                    return Ok(evt.payload);
                }
                self.stash
                    .entry((evt.src, evt.tag))
                    .or_default()
                    .push(evt.payload);
            }

            if start.elapsed() > self.hub.timeout {
                return Err(Error::Setup(format!(
                    "admin {}: timed out waiting for `{}` from {}",
                    self.me, tag, src
                )));
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}
