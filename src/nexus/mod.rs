mod admin;
mod group;

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use quanta::{Clock, Instant};

pub use self::admin::*;
pub use self::group::*;
use crate::config::Config;
use crate::error::{self, Error, Result};
use crate::message::{SendDesc, SendDescRef};
use crate::path::{self, Path, PathContainer, SendStatus};
use crate::reliability::ReliabilityState;
use crate::type_alias::*;
use crate::util::lock::SpinLock;

/// Everything a process knows about itself and the job, shared by the
/// paths and the send layer.
pub struct ProcCtx {
    myproc: ProcId,
    host_of: Vec<HostId>,
    nhosts: usize,
    config: Config,
    comms: Communicators,
    reliability: ReliabilityState,
    clock: Clock,
}

impl ProcCtx {
    /// Context of process `myproc` in a job whose process `p` runs on host
    /// `host_of[p]`. Host ids must be dense from 0.
    pub fn new(myproc: ProcId, host_of: Vec<HostId>, config: Config) -> Result<Self> {
        let nprocs = host_of.len();
        if myproc as usize >= nprocs {
            return Err(Error::Setup(format!(
                "process {} out of a job of {}",
                myproc, nprocs
            )));
        }
        let nhosts = host_of.iter().map(|&h| h as usize + 1).max().unwrap_or(0);
        let threaded = config.use_threads;
        Ok(Self {
            myproc,
            host_of,
            nhosts,
            comms: Communicators::new(nprocs),
            reliability: ReliabilityState::new(nprocs, threaded),
            config,
            clock: Clock::new(),
        })
    }

    /// Replace the clock, e.g. with a mock one.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[inline]
    pub fn myproc(&self) -> ProcId {
        self.myproc
    }

    #[inline]
    pub fn nprocs(&self) -> usize {
        self.host_of.len()
    }

    #[inline]
    pub fn myhost(&self) -> HostId {
        self.host_of[self.myproc as usize]
    }

    #[inline]
    pub fn nhosts(&self) -> usize {
        self.nhosts
    }

    /// Host of process `p`.
    ///
    /// # Panics
    ///
    /// Panic if `p` is out of range.
    #[inline]
    pub fn host_of(&self, p: ProcId) -> HostId {
        self.host_of[p as usize]
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn comms(&self) -> &Communicators {
        &self.comms
    }

    #[inline]
    pub fn reliability(&self) -> &ReliabilityState {
        &self.reliability
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Report a fatal condition of this process.
    pub(crate) fn fatal(&self, err: Error) -> Error {
        error::fatal(self.myproc, self.config.abort_on_fatal, err)
    }
}

/// The per-process owner of the paths and of the sends in flight.
///
/// Sends that could not post every fragment wait in an incomplete list;
/// fully posted sends wait for their acknowledgments in an unacked list.
/// [`Nexus::progress`] drives both, plus every path's completions and
/// arrivals.
pub struct Nexus {
    ctx: Arc<ProcCtx>,
    paths: PathContainer,
    sink: Arc<dyn FragSink>,
    next_isend: AtomicU64,
    incomplete: SpinLock<Vec<SendDescRef>>,
    unacked: SpinLock<Vec<SendDescRef>>,
}

impl Nexus {
    pub fn new(ctx: ProcCtx, sink: Arc<dyn FragSink>) -> Self {
        let threaded = ctx.config().use_threads;
        let ctx = Arc::new(ctx);
        Self {
            paths: PathContainer::new(ctx.clone()),
            ctx,
            sink,
            next_isend: AtomicU64::new(1),
            incomplete: SpinLock::new(Vec::new(), threaded),
            unacked: SpinLock::new(Vec::new(), threaded),
        }
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<ProcCtx> {
        &self.ctx
    }

    #[inline]
    pub fn paths(&self) -> &PathContainer {
        &self.paths
    }

    /// Add a path and make it eligible for dispatch.
    pub fn add_path(&self, path: Box<dyn Path>) -> Result<PathHandle> {
        let h = self.paths.add(path)?;
        self.paths.activate(h)?;
        Ok(h)
    }

    /// A standard send of `data` to rank `peer` of communicator `ctx`,
    /// numbered for this process.
    pub fn message(&self, ctx: CtxId, peer: ProcId, tag: Tag, data: impl Into<Arc<[u8]>>) -> SendDesc {
        SendDesc::new(ctx, peer, tag, data)
            .with_isend_seq(self.next_isend.fetch_add(1, Ordering::Relaxed))
            .with_threads(self.ctx.config().use_threads)
    }

    /// Bind `msg` to a path and post what resources allow. The rest is
    /// posted by [`Self::progress`].
    pub fn isend(&self, msg: SendDesc) -> Result<SendDescRef> {
        let msg = Arc::new(msg);
        let h = path::bind(&self.ctx, &self.paths, &msg)?;
        let path = self.paths.get(h).ok_or(Error::BadPath)?;
        path.init(&msg)?;
        match path.send(&msg) {
            Ok(SendStatus::Complete) => self.unacked.lock().push(msg.clone()),
            Ok(SendStatus::Incomplete) => self.incomplete.lock().push(msg.clone()),
            Err(e) => return Err(self.give_up(path, &msg, e)),
        }
        Ok(msg)
    }

    /// Drop a send that can no longer complete.
    fn give_up(&self, path: &dyn Path, msg: &SendDescRef, err: Error) -> Error {
        log::warn!("nexus {}: send of {:?} failed: {}", self.ctx.myproc(), msg, err);
        path.abort(msg);
        err
    }

    /// Whether every fragment of `msg` has been posted and acknowledged.
    pub fn send_done(&self, msg: &SendDesc) -> bool {
        msg.path()
            .and_then(|h| self.paths.get(h))
            .is_some_and(|p| p.send_done(msg))
    }

    /// Sends not yet done.
    pub fn num_pending(&self) -> usize {
        self.incomplete.lock().len() + self.unacked.lock().len()
    }

    pub fn progress(&self) -> Result<bool> {
        self.progress_at(self.ctx.now())
    }

    /// One round of the progress engine at time `now`. Return whether
    /// anything happened.
    pub fn progress_at(&self, now: Instant) -> Result<bool> {
        let mut progressed = false;
        for (h, path) in self.paths.iter(self.paths.all_paths()) {
            if path.needs_push() {
                progressed |= path.push(now)?;
            }
            progressed |= path.receive(now, &*self.sink)?;
            if path.update() {
                self.paths.update(h)?;
            }
        }

        let mut first_err = None;
        let mut incomplete = Vec::new();
        let mut unacked = Vec::new();

        let pending = mem::take(&mut *self.incomplete.lock());
        for msg in pending {
            let Some(path) = msg.path().and_then(|h| self.paths.get(h)) else {
                first_err.get_or_insert(Error::BadPath);
                continue;
            };
            if msg.has_failed() {
                first_err.get_or_insert(self.give_up(path, &msg, Error::Unreachable(msg.global_dest())));
                continue;
            }
            match path.send(&msg) {
                Ok(SendStatus::Complete) => {
                    progressed = true;
                    unacked.push(msg);
                }
                Ok(SendStatus::Incomplete) => incomplete.push(msg),
                Err(e) => {
                    first_err.get_or_insert(self.give_up(path, &msg, e));
                }
            }
        }

        let posted = mem::take(&mut *self.unacked.lock());
        for msg in posted {
            let Some(path) = msg.path().and_then(|h| self.paths.get(h)) else {
                first_err.get_or_insert(Error::BadPath);
                continue;
            };
            if msg.has_failed() {
                first_err.get_or_insert(self.give_up(path, &msg, Error::Unreachable(msg.global_dest())));
                continue;
            }
            if path.send_done(&msg) {
                log::trace!("nexus {}: send {} done", self.ctx.myproc(), msg.isend_seq());
                progressed = true;
                continue;
            }
            match path.resend(&msg, now) {
                Ok(requeued) if requeued || !msg.all_sent() => {
                    progressed |= requeued;
                    incomplete.push(msg);
                }
                Ok(_) => unacked.push(msg),
                Err(e) => {
                    unacked.push(msg);
                    first_err.get_or_insert(e);
                }
            }
        }

        self.incomplete.lock().append(&mut incomplete);
        self.unacked.lock().append(&mut unacked);
        match first_err {
            Some(e) => Err(e),
            None => Ok(progressed),
        }
    }

    /// A future resolving once `msg` is done, driving progress while polled.
    pub fn wait(&self, msg: SendDescRef) -> SendCompletion<'_> {
        SendCompletion { nexus: self, msg }
    }

    /// Drain and deactivate every path.
    pub fn finalize(&self) {
        let all = self.paths.all_paths();
        for (h, path) in self.paths.iter(all) {
            path.finalize();
            if let Err(e) = self.paths.deactivate(h) {
                log::warn!("nexus {}: cannot deactivate slot {}: {}", self.ctx.myproc(), h, e);
            }
        }
    }
}

/// Completion of a send. See [`Nexus::wait`].
pub struct SendCompletion<'a> {
    nexus: &'a Nexus,
    msg: SendDescRef,
}

impl Future for SendCompletion<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.nexus.send_done(&self.msg) {
            return Poll::Ready(Ok(()));
        }
        if let Err(e) = self.nexus.progress() {
            return Poll::Ready(Err(e));
        }
        if self.nexus.send_done(&self.msg) {
            Poll::Ready(Ok(()))
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
