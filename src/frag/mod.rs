//! Send and receive fragment descriptors.

mod recv;
mod send;

use bitflags::bitflags;

pub use self::recv::RecvFrag;
pub(crate) use self::send::*;

bitflags! {
    /// Lifecycle of a send fragment. Flags accumulate; an empty set is a
    /// descriptor sitting in its pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FragState: u8 {
        /// Destination, parent and lane are set.
        const BASICINFO = 1 << 0;
        /// Addressing resolved, payload packed, header stamped.
        const INITCOMPLETE = 1 << 1;
        /// Handed to the fabric at least once.
        const POSTED = 1 << 2;
        /// The fabric reported local completion of the latest post.
        const LOCALACKED = 1 << 3;
        /// The receiver acknowledged the fragment.
        const REMOTEACKED = 1 << 4;
    }
}
