//! Communicators, their group translation tables, and the upward interface
//! through which received fragments are delivered.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;
use quanta::Instant;

use crate::error::Result;
use crate::frag::RecvFrag;
use crate::type_alias::*;

/// An ordered set of processes; a process's position is its group rank.
#[derive(Debug, Clone)]
pub struct Group {
    to_global: Vec<ProcId>,
    to_rank: HashMap<ProcId, ProcId, RandomState>,
}

impl Group {
    pub fn new(members: Vec<ProcId>) -> Self {
        let to_rank = members
            .iter()
            .enumerate()
            .map(|(rank, &g)| (g, rank as ProcId))
            .collect();
        Self {
            to_global: members,
            to_rank,
        }
    }

    /// The group `0..nprocs` with ranks equal to global ids.
    pub fn world(nprocs: usize) -> Self {
        Self::new((0..nprocs as ProcId).collect())
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.to_global.len()
    }

    #[inline]
    pub fn to_global(&self, rank: ProcId) -> Option<ProcId> {
        self.to_global.get(rank as usize).copied()
    }

    #[inline]
    pub fn to_rank(&self, global: ProcId) -> Option<ProcId> {
        self.to_rank.get(&global).copied()
    }
}

/// A communication context. Intra-communicators have the same local and
/// remote group.
#[derive(Debug)]
pub struct Communicator {
    ctx: CtxId,
    local: Arc<Group>,
    remote: Arc<Group>,
}

impl Communicator {
    pub fn intra(ctx: CtxId, group: Group) -> Self {
        let group = Arc::new(group);
        Self {
            ctx,
            local: group.clone(),
            remote: group,
        }
    }

    pub fn inter(ctx: CtxId, local: Group, remote: Group) -> Self {
        Self {
            ctx,
            local: Arc::new(local),
            remote: Arc::new(remote),
        }
    }

    #[inline]
    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    /// The group the calling process belongs to.
    #[inline]
    pub fn local(&self) -> &Group {
        &self.local
    }

    /// The group peers are addressed in.
    #[inline]
    pub fn remote(&self) -> &Group {
        &self.remote
    }
}

/// Context id of the communicator spanning every process.
pub const WORLD_CTX: CtxId = 0;

/// Communicator table of a process.
pub struct Communicators {
    map: DashMap<CtxId, Arc<Communicator>, RandomState>,
}

impl Communicators {
    pub(crate) fn new(nprocs: usize) -> Self {
        let map = DashMap::with_hasher(RandomState::new());
        map.insert(
            WORLD_CTX,
            Arc::new(Communicator::intra(WORLD_CTX, Group::world(nprocs))),
        );
        Self { map }
    }

    /// Register a communicator, replacing any with the same context id.
    pub fn insert(&self, comm: Communicator) {
        self.map.insert(comm.ctx(), Arc::new(comm));
    }

    pub fn get(&self, ctx: CtxId) -> Option<Arc<Communicator>> {
        self.map.get(&ctx).map(|c| c.clone())
    }
}

/// Receiver of parsed data fragments, i.e. the matching and reassembly
/// layer above the paths.
///
/// Implementations copy the payload out with [`RecvFrag::copy_out`] or
/// [`RecvFrag::unpack`], which verify the data checksum during the copy.
/// A copy that reports corrupt data must not count toward the message: the
/// fragment is retransmitted with acknowledgments on, and fatal otherwise.
/// Fragments whose payload is never copied are verified by the path after
/// this call returns.
pub trait FragSink: Send + Sync {
    fn handle_received_frag(&self, frag: &mut RecvFrag, now: Instant) -> Result<()>;
}
