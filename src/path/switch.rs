use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;

/// Receive side of a switch port.
pub type PortQueue = Arc<SegQueue<Vec<u8>>>;

/// An in-process switched network.
///
/// Stands in for the Myrinet and InfiniBand fabrics: every attached port
/// gets a fabric-local address (a GM node id or an IB LID) and a queue that
/// frames sent to that address land in. Ports register under a unique
/// hardware id so that peers can map it to the address, as GM does with
/// `unique id -> node id`.
pub struct Switch {
    name: String,
    ports: DashMap<u64, PortQueue, RandomState>,
    by_unique_id: DashMap<u64, u64, RandomState>,
    next_addr: AtomicU64,
}

impl Switch {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ports: DashMap::with_hasher(RandomState::new()),
            by_unique_id: DashMap::with_hasher(RandomState::new()),
            next_addr: AtomicU64::new(1),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a port with hardware id `unique_id`; return its address and
    /// receive queue.
    pub fn attach(&self, unique_id: u64) -> (u64, PortQueue) {
        let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let queue = PortQueue::default();
        self.ports.insert(addr, queue.clone());
        self.by_unique_id.insert(unique_id, addr);
        log::debug!("{} switch: port {:#x} attached at {}", self.name, unique_id, addr);
        (addr, queue)
    }

    /// Take a port off the network. Frames sent to it are dropped.
    pub fn detach(&self, addr: u64) {
        self.ports.remove(&addr);
        self.by_unique_id.retain(|_, a| *a != addr);
    }

    /// Address of the port with hardware id `unique_id`.
    pub fn lookup(&self, unique_id: u64) -> Option<u64> {
        self.by_unique_id.get(&unique_id).map(|a| *a)
    }

    /// Put a frame on the wire. Return whether the address exists.
    pub fn deliver(&self, addr: u64, frame: Vec<u8>) -> bool {
        match self.ports.get(&addr) {
            Some(queue) => {
                queue.push(frame);
                true
            }
            None => false,
        }
    }
}

/// Finite hardware tokens, e.g. send queue or completion queue slots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tokens {
    avail: usize,
    total: usize,
}

impl Tokens {
    pub fn new(total: usize) -> Self {
        Self {
            avail: total,
            total,
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.avail
    }

    #[inline]
    pub fn try_take(&mut self) -> bool {
        if self.avail == 0 {
            return false;
        }
        self.avail -= 1;
        true
    }

    #[inline]
    pub fn give(&mut self) {
        debug_assert!(self.avail < self.total, "token returned twice");
        self.avail = (self.avail + 1).min(self.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_to_attached_port() {
        let sw = Switch::new("test");
        let (a, qa) = sw.attach(0xaa);
        let (b, _) = sw.attach(0xbb);
        assert_ne!(a, b);
        assert_eq!(sw.lookup(0xaa), Some(a));

        assert!(sw.deliver(a, vec![1, 2, 3]));
        assert_eq!(qa.pop(), Some(vec![1, 2, 3]));

        sw.detach(a);
        assert!(!sw.deliver(a, vec![4]));
        assert_eq!(sw.lookup(0xaa), None);
    }

    #[test]
    fn tokens_run_out() {
        let mut t = Tokens::new(2);
        assert!(t.try_take());
        assert!(t.try_take());
        assert!(!t.try_take());
        t.give();
        assert_eq!(t.available(), 1);
    }
}
