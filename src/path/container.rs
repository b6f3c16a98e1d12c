use std::array;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use super::Path;
use crate::error::{Error, Result};
use crate::nexus::ProcCtx;
use crate::type_alias::*;
use crate::util::lock::SpinLock;

/// Number of path slots.
pub const MAX_PATHS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotStatus {
    Unallocated = 0,
    Inactive = 1,
    Active = 2,
}

impl From<u8> for SlotStatus {
    fn from(val: u8) -> Self {
        match val {
            1 => Self::Inactive,
            2 => Self::Active,
            _ => Self::Unallocated,
        }
    }
}

/// A set of path handles, iterated in ascending order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathSet(u64);

impl PathSet {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn contains(&self, h: PathHandle) -> bool {
        h < MAX_PATHS && self.0 & (1 << h) != 0
    }

    #[inline]
    pub fn first(&self) -> Option<PathHandle> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as PathHandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = PathHandle> {
        let bits = self.0;
        (0..MAX_PATHS).filter(move |h| bits & (1 << h) != 0)
    }
}

/// Registry of the paths of a process.
///
/// Slots are handed out once and never reused. For every host, a bitmap
/// records which paths reach at least one process on it. Readers never
/// lock; a path deactivated between a query and its use refuses the message
/// itself.
pub struct PathContainer {
    ctx: Arc<ProcCtx>,
    slots: [OnceLock<Box<dyn Path>>; MAX_PATHS],
    status: [AtomicU8; MAX_PATHS],
    host_maps: Vec<AtomicU64>,
    num_allocated: AtomicUsize,
    lock: SpinLock<()>,
}

impl PathContainer {
    pub fn new(ctx: Arc<ProcCtx>) -> Self {
        let threaded = ctx.config().use_threads;
        Self {
            host_maps: (0..ctx.nhosts()).map(|_| AtomicU64::new(0)).collect(),
            ctx,
            slots: array::from_fn(|_| OnceLock::new()),
            status: array::from_fn(|_| AtomicU8::new(SlotStatus::Unallocated as u8)),
            num_allocated: AtomicUsize::new(0),
            lock: SpinLock::new((), threaded),
        }
    }

    #[inline]
    pub const fn max_paths(&self) -> usize {
        MAX_PATHS
    }

    /// Slots handed out so far.
    #[inline]
    pub fn num_allocated(&self) -> usize {
        self.num_allocated.load(Ordering::Acquire)
    }

    #[inline]
    fn status(&self, h: PathHandle) -> SlotStatus {
        SlotStatus::from(self.status[h].load(Ordering::Acquire))
    }

    /// Place `path` in a free slot, inactive.
    pub fn add(&self, path: Box<dyn Path>) -> Result<PathHandle> {
        let _guard = self.lock.lock();
        let h = (0..MAX_PATHS)
            .find(|&h| self.status(h) == SlotStatus::Unallocated)
            .ok_or(Error::NoPathSlots)?;
        if self.slots[h].set(path).is_err() {
            return Err(Error::NoPathSlots);
        }
        self.status[h].store(SlotStatus::Inactive as u8, Ordering::Release);
        self.num_allocated.fetch_add(1, Ordering::AcqRel);
        Ok(h)
    }

    /// Bind the path to its slot, map its reachability, and make it
    /// eligible for dispatch.
    pub fn activate(&self, h: PathHandle) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.slot(h)?;
        path.bind_to_container(h);
        path.activate();
        self.remap(h, path);
        self.status[h].store(SlotStatus::Active as u8, Ordering::Release);
        log::debug!(
            "path container: {} path activated in slot {}",
            path.path_type(),
            h
        );
        Ok(())
    }

    /// Rescan the reachability of a path whose peer set changed.
    pub fn update(&self, h: PathHandle) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.slot(h)?;
        self.remap(h, path);
        log::debug!("path container: reachability of slot {} rescanned", h);
        Ok(())
    }

    /// Withdraw a path from dispatch. The slot stays allocated.
    pub fn deactivate(&self, h: PathHandle) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.slot(h)?;
        self.status[h].store(SlotStatus::Inactive as u8, Ordering::Release);
        for map in &self.host_maps {
            map.fetch_and(!(1 << h), Ordering::AcqRel);
        }
        path.deactivate();
        Ok(())
    }

    fn slot(&self, h: PathHandle) -> Result<&dyn Path> {
        self.slots
            .get(h)
            .and_then(OnceLock::get)
            .map(|p| &**p)
            .ok_or(Error::BadPath)
    }

    /// Set the bit of `h` for every host with a reachable process, and
    /// clear it for the others.
    fn remap(&self, h: PathHandle, path: &dyn Path) {
        let mut reach = vec![false; self.host_maps.len()];
        for proc in 0..self.ctx.nprocs() as ProcId {
            if path.can_reach(proc) {
                reach[self.ctx.host_of(proc) as usize] = true;
            }
        }
        for (map, reachable) in self.host_maps.iter().zip(reach) {
            if reachable {
                map.fetch_or(1 << h, Ordering::AcqRel);
            } else {
                map.fetch_and(!(1 << h), Ordering::AcqRel);
            }
        }
    }

    /// The path in slot `h`, if allocated.
    #[inline]
    pub fn get(&self, h: PathHandle) -> Option<&dyn Path> {
        self.slot(h).ok()
    }

    fn active_set(&self) -> u64 {
        (0..MAX_PATHS)
            .filter(|&h| self.status(h) == SlotStatus::Active)
            .fold(0, |acc, h| acc | (1 << h))
    }

    /// Active paths reaching the hosts of every process in `dests`. None if
    /// any of them is not a process of the job.
    pub fn paths(&self, dests: &[ProcId]) -> PathSet {
        if dests.is_empty() {
            return PathSet::default();
        }
        let mut bits = self.active_set();
        for &d in dests {
            if d as usize >= self.ctx.nprocs() {
                return PathSet::default();
            }
            let Some(map) = self.host_maps.get(self.ctx.host_of(d) as usize) else {
                return PathSet::default();
            };
            bits &= map.load(Ordering::Acquire);
        }
        PathSet(bits)
    }

    /// Every active path.
    #[inline]
    pub fn all_paths(&self) -> PathSet {
        PathSet(self.active_set())
    }

    /// Whether slot `h` is active and reaches the host of `remote`.
    pub fn can_use_path(&self, remote: ProcId, h: PathHandle) -> bool {
        h < MAX_PATHS && self.paths(&[remote]).contains(h)
    }

    /// Iterate `(handle, path)` over a set.
    pub fn iter(&self, set: PathSet) -> impl Iterator<Item = (PathHandle, &dyn Path)> + '_ {
        set.iter().filter_map(move |h| self.get(h).map(|p| (h, p)))
    }
}
