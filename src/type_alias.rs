//! Type aliases used in this library.

/// [`u32`]: Global process identifier, unique in the whole job.
pub type ProcId = u32;

/// [`u32`]: Host identifier. Processes on one host share memory.
pub type HostId = u32;

/// [`u32`] (24 bits valid): Communicator context identifier.
pub type CtxId = u32;

/// [`u32`]: User message tag.
pub type Tag = u32;

/// [`u64`] (48 bits valid): Reliability sequence number of a fragment.
/// Zero means the fragment is unsequenced.
pub type FragSeq = u64;

/// [`u64`] (48 bits valid): Per-process sequence number of a send.
pub type IsendSeq = u64;

/// [`usize`]: Slot index of a path in the path container.
pub type PathHandle = usize;
