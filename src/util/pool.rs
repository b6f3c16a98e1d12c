//! Growable freelist of fixed-size descriptors.
//!
//! Elements live in an arena and are handed out as [`ElemRef`]s, i.e.
//! `(index, generation)` pairs. Returning an element bumps its generation,
//! so any reference kept past that point (e.g. one echoed back in an ACK)
//! no longer resolves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::util::lock::SpinLock;

/// A reference to a pool element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElemRef {
    idx: u32,
    gen: u32,
}

impl ElemRef {
    /// Build a reference from raw parts, e.g. as echoed back by a peer.
    #[inline]
    pub const fn from_raw(idx: u32, gen: u32) -> Self {
        Self { idx, gen }
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.idx
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.gen
    }

    /// Pack into a 64-bit work request identifier.
    #[inline]
    pub const fn to_wr_id(self) -> u64 {
        ((self.gen as u64) << 32) | self.idx as u64
    }

    #[inline]
    pub const fn from_wr_id(wr_id: u64) -> Self {
        Self {
            idx: wr_id as u32,
            gen: (wr_id >> 32) as u32,
        }
    }
}

/// Page budget shared by several pools.
///
/// Each chunk a pool allocates is charged against the budget; a pool whose
/// parent budget is spent cannot grow even below its own page limit.
#[derive(Debug)]
pub struct PageBudget {
    limit: usize,
    used: AtomicUsize,
}

impl PageBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    /// Try to charge `pages` against the budget.
    pub fn try_take(&self, pages: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + pages <= self.limit).then_some(used + pages)
            })
            .is_ok()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

struct Slot<T> {
    gen: u32,
    live: bool,
    /// List the slot was allocated for.
    home: usize,
    value: T,
}

/// A freelist pool of `T`, optionally split into per-affinity lists.
pub struct FreeList<T> {
    config: PoolConfig,
    slots: Vec<Slot<T>>,
    lists: Vec<Vec<u32>>,
    pages_per_chunk: usize,
    elems_per_chunk: usize,
    pages: Vec<usize>,
    consec_failures: usize,
    ctor: Box<dyn FnMut(usize) -> T + Send>,
}

impl<T> FreeList<T> {
    /// Create a pool and pre-populate every list with its initial pages.
    /// `ctor` builds a fresh element for the given list index.
    pub fn new(config: PoolConfig, ctor: impl FnMut(usize) -> T + Send + 'static) -> Result<Self> {
        config.validate()?;
        let pages_per_chunk = config.chunk_size / config.page_size;
        let elems_per_chunk = config.chunk_size / config.element_size;
        let nlists = config.num_lists;

        let mut pool = Self {
            slots: Vec::new(),
            lists: vec![Vec::new(); nlists],
            pages_per_chunk,
            elems_per_chunk,
            pages: vec![0; nlists],
            consec_failures: 0,
            ctor: Box::new(ctor),
            config,
        };
        for list in 0..nlists {
            let chunks = pool.config.pages_per_list.div_ceil(pages_per_chunk);
            for _ in 0..chunks {
                if !pool.grow(list) {
                    return Err(Error::OutOfResource(pool.config.label.clone()));
                }
            }
        }
        // Top up round-robin until the floor is met.
        let mut list = 0;
        while pool.pages.iter().sum::<usize>() < pool.config.min_pages {
            if !pool.grow(list) {
                return Err(Error::OutOfResource(pool.config.label.clone()));
            }
            list = (list + 1) % nlists;
        }
        Ok(pool)
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Number of elements ever created.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of elements currently free across all lists.
    pub fn num_free(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    /// Pages currently held by `list`.
    #[inline]
    pub fn pages(&self, list: usize) -> usize {
        self.pages[list]
    }

    /// Allocate one more chunk for `list`. Return `false` if a page limit
    /// (own or parent) forbids it.
    fn grow(&mut self, list: usize) -> bool {
        let total_pages = self.pages.iter().sum::<usize>();
        if let Some(max) = self.config.max_pages {
            if total_pages + self.pages_per_chunk > max {
                return false;
            }
        }
        if let Some(parent) = &self.config.parent {
            if !parent.try_take(self.pages_per_chunk) {
                return false;
            }
        }

        let base = self.slots.len() as u32;
        for i in 0..self.elems_per_chunk {
            let value = (self.ctor)(list);
            self.slots.push(Slot {
                gen: 0,
                live: false,
                home: list,
                value,
            });
            // Hand out low indices first.
            self.lists[list].push(base + (self.elems_per_chunk - 1 - i) as u32);
        }
        self.pages[list] += self.pages_per_chunk;
        log::trace!(
            "pool {}: list {} grew to {} pages",
            self.config.label,
            list,
            self.pages[list]
        );
        true
    }

    /// Pick the list serving locality domain `hint`.
    #[inline]
    fn list_for(&self, hint: usize) -> usize {
        self.config
            .affinity
            .iter()
            .position(|&d| d == hint)
            .unwrap_or(hint % self.lists.len())
    }

    /// Pop an element from any list that has one, preferring `list`.
    fn pop(&mut self, list: usize) -> Option<u32> {
        if let Some(idx) = self.lists[list].pop() {
            return Some(idx);
        }
        if self.config.enforce_affinity {
            return None;
        }
        self.lists.iter_mut().find_map(Vec::pop)
    }

    /// Take an element without any locking. The caller must hold whatever
    /// lock guards this pool. This makes a single attempt; retrying is left
    /// to callers that can release the lock in between.
    pub fn get_element_no_lock(&mut self, hint: usize) -> Result<ElemRef> {
        let list = self.list_for(hint);
        // At or below: the default threshold of 0 grows only an empty list.
        if self.lists[list].len() <= self.config.grow_threshold {
            // Growth failure is fine as long as something is still free.
            let _ = self.grow(list);
        }
        if let Some(idx) = self.pop(list) {
            self.consec_failures = 0;
            let slot = &mut self.slots[idx as usize];
            debug_assert!(!slot.live, "pool element handed out twice");
            slot.live = true;
            return Ok(ElemRef {
                idx,
                gen: slot.gen,
            });
        }

        self.consec_failures += 1;
        if self.consec_failures > self.config.max_retries {
            return Err(self.exhausted());
        }
        Err(Error::TempOutOfResource(self.config.label.clone()))
    }

    #[cold]
    fn exhausted(&self) -> Error {
        let err = Error::OutOfResource(self.config.label.clone());
        if self.config.abort_on_exhaustion {
            log::error!("pool {}: {}", self.config.label, err);
            std::process::exit(1);
        }
        err
    }

    /// Return an element without any locking. Stale references are ignored
    /// and reported as `false`.
    pub fn return_element_no_lock(&mut self, r: ElemRef) -> bool {
        let Some(slot) = self.slots.get_mut(r.idx as usize) else {
            return false;
        };
        if !slot.live || slot.gen != r.gen {
            log::warn!(
                "pool {}: ignoring return of stale element {:?}",
                self.config.label,
                r
            );
            return false;
        }
        slot.live = false;
        slot.gen = slot.gen.wrapping_add(1);
        let home = slot.home;
        self.lists[home].push(r.idx);
        true
    }

    /// Resolve a live reference.
    #[inline]
    pub fn get(&self, r: ElemRef) -> Option<&T> {
        self.slots
            .get(r.idx as usize)
            .filter(|s| s.live && s.gen == r.gen)
            .map(|s| &s.value)
    }

    /// Resolve a live reference mutably.
    #[inline]
    pub fn get_mut(&mut self, r: ElemRef) -> Option<&mut T> {
        self.slots
            .get_mut(r.idx as usize)
            .filter(|s| s.live && s.gen == r.gen)
            .map(|s| &mut s.value)
    }
}

/// A [`FreeList`] behind its own lock.
pub struct LockedFreeList<T> {
    inner: SpinLock<FreeList<T>>,
}

impl<T> LockedFreeList<T> {
    pub fn new(list: FreeList<T>, threaded: bool) -> Self {
        Self {
            inner: SpinLock::new(list, threaded),
        }
    }

    /// Take an element. If the pool retries on exhaustion, the lock is
    /// dropped between attempts so that other threads can return elements.
    pub fn get_element(&self, hint: usize) -> Result<ElemRef> {
        let backoff = Backoff::new();
        let mut tries = 0;
        loop {
            let mut pool = self.inner.lock();
            match pool.get_element_no_lock(hint) {
                Err(Error::TempOutOfResource(_))
                    if pool.config.retry_on_exhaustion && tries < pool.config.max_retries =>
                {
                    drop(pool);
                    tries += 1;
                    backoff.snooze();
                }
                res => return res,
            }
        }
    }

    pub fn return_element(&self, r: ElemRef) -> bool {
        self.inner.lock().return_element_no_lock(r)
    }

    /// Run `f` on a live element under the pool lock.
    pub fn with<R>(&self, r: ElemRef, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.lock().get_mut(r).map(f)
    }

    pub fn num_free(&self) -> usize {
        self.inner.lock().num_free()
    }
}
