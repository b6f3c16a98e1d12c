//! Point-to-point messaging core of a message-passing runtime.
//!
//! Messages are cut into fragments, bound to one of several paths (shared
//! memory, TCP, UDP, Myrinet GM, InfiniBand) by a static priority, and
//! reassembled on the receiver. Optional acknowledgments with checksums
//! give reliable delivery over lossy fabrics.

pub mod checksum;
pub mod config;
pub mod datatype;
pub mod error;
mod frag;
pub mod message;
pub mod msgbuf;
pub mod nexus;
pub mod path;
pub mod pkthdr;
pub mod reassembly;
pub mod reliability;
pub mod type_alias;
mod util;

#[cfg(test)]
mod tests;

pub use self::config::{Config, PoolConfig};
pub use self::error::{Error, Result};
pub use self::frag::RecvFrag;
pub use self::message::{SendDesc, SendDescRef, SendMode};
pub use self::nexus::{Nexus, ProcCtx};
pub use self::util::pool::{ElemRef, FreeList, LockedFreeList, PageBudget};
