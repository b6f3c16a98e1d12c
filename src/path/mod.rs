//! Paths: the transports a message can be bound to.

mod container;
mod dispatch;
mod fabric;
mod gm;
mod ib;
mod sharedmem;
mod switch;
mod tcp;
mod udp;

use std::fmt;

use quanta::Instant;
use serde::{Deserialize, Serialize};

pub use self::container::*;
pub use self::dispatch::*;
pub use self::fabric::*;
pub use self::gm::*;
pub use self::ib::*;
pub use self::sharedmem::*;
pub use self::switch::*;
pub use self::tcp::*;
pub use self::udp::*;
use crate::error::Result;
use crate::message::{SendDesc, SendDescRef};
use crate::nexus::FragSink;
use crate::type_alias::*;

/// Kind of fabric behind a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    SharedMem,
    Tcp,
    Udp,
    Gm,
    /// Legacy fabric; only ranked by dispatch.
    Quadrics,
    Ib,
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PathType::SharedMem => "shared memory",
            PathType::Tcp => "TCP",
            PathType::Udp => "UDP",
            PathType::Gm => "GM",
            PathType::Quadrics => "Quadrics",
            PathType::Ib => "IB",
        };
        f.write_str(name)
    }
}

/// A (device, port) pair of a fabric, the unit of send load spreading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lane {
    pub dev: u8,
    pub port: u8,
}

impl Lane {
    pub const fn new(dev: u8, port: u8) -> Self {
        Self { dev, port }
    }
}

/// Outcome of [`Path::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every fragment of the message has been posted.
    Complete,

    /// Fragments remain queued for lack of descriptors or tokens; call
    /// `send` again after making progress.
    Incomplete,
}

/// A transport a message can be bound to.
///
/// Paths are shared between threads and guard their own state; every
/// operation takes `&self`.
pub trait Path: Send + Sync {
    fn path_type(&self) -> PathType;

    /// Whether the path can send one message to several processes at once.
    fn uses_multicast(&self) -> bool {
        false
    }

    /// Record the container slot this path lives in.
    fn bind_to_container(&self, handle: PathHandle);

    /// Container slot, once bound.
    fn handle(&self) -> Option<PathHandle>;

    /// Whether `dest` (a global process id) is reachable given the peer
    /// information currently known. Never mutates state.
    fn can_reach(&self, dest: ProcId) -> bool;

    /// Bind `msg` to this path.
    fn bind(&self, msg: &SendDesc) -> Result<()>;

    /// Prepare `msg` for sending. Idempotent.
    fn init(&self, msg: &SendDesc) -> Result<()>;

    /// Post as many fragments of `msg` as resources allow.
    fn send(&self, msg: &SendDescRef) -> Result<SendStatus>;

    /// Whether every fragment of `msg` has been posted and acknowledged.
    fn send_done(&self, msg: &SendDesc) -> bool {
        msg.is_done()
    }

    /// Poll for received fragments and hand data to `sink`. Return whether
    /// anything arrived.
    fn receive(&self, now: Instant, sink: &dyn FragSink) -> Result<bool>;

    /// Whether [`Self::push`] has work to do.
    fn needs_push(&self) -> bool;

    /// Process local completions and retry blocked control traffic. Return
    /// whether progress was made.
    fn push(&self, now: Instant) -> Result<bool>;

    /// Requeue fragments of `msg` whose acknowledgment is overdue. Return
    /// whether any were requeued.
    fn resend(&self, _msg: &SendDescRef, _now: Instant) -> Result<bool> {
        Ok(false)
    }

    /// Give up on `msg` after a send failure: release its queued fragments
    /// and mark it failed, so that it never reports done.
    fn abort(&self, msg: &SendDescRef) {
        msg.state.lock().failed = true;
    }

    /// Refresh peer information. Return whether reachability may have
    /// changed, so that the container rescans it.
    fn update(&self) -> bool {
        false
    }

    fn activate(&self);

    fn deactivate(&self);

    fn is_active(&self) -> bool;

    /// Drain and release resources at shutdown.
    fn finalize(&self) {}
}
