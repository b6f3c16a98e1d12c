use super::{PathContainer, PathSet, PathType};
use crate::error::{Error, Result};
use crate::message::SendDesc;
use crate::nexus::ProcCtx;
use crate::pkthdr::MAX_CTX;
use crate::type_alias::*;

/// Pick a path among `candidates` by the static `priority` order, falling
/// back to the lowest slot.
pub fn select_path(
    priority: &[PathType],
    container: &PathContainer,
    candidates: PathSet,
) -> Option<PathHandle> {
    if candidates.len() <= 1 {
        return candidates.first();
    }
    priority
        .iter()
        .find_map(|ty| {
            container
                .iter(candidates)
                .find(|(_, p)| p.path_type() == *ty)
                .map(|(h, _)| h)
        })
        .or_else(|| candidates.first())
}

/// Bind `msg` to a path reaching its destination and return the handle.
///
/// Multicast sends go to the first active path that supports multicast.
/// Otherwise the destination rank is translated to a global id and the
/// reaching paths are ranked by the configured priority.
pub fn bind(ctx: &ProcCtx, container: &PathContainer, msg: &SendDesc) -> Result<PathHandle> {
    if msg.ctx() > MAX_CTX {
        return Err(Error::Protocol(format!("context {} exceeds {}", msg.ctx(), MAX_CTX)));
    }
    if msg.is_multicast() {
        let (h, path) = container
            .iter(container.all_paths())
            .find(|(_, p)| p.uses_multicast())
            .ok_or_else(|| Error::Protocol("no multicast-capable path".into()))?;
        path.bind(msg)?;
        return Ok(h);
    }

    let comm = ctx
        .comms()
        .get(msg.ctx())
        .ok_or_else(|| Error::Protocol(format!("unknown context {}", msg.ctx())))?;
    let dest = comm.remote().to_global(msg.peer()).ok_or_else(|| {
        Error::Protocol(format!("rank {} not in context {}", msg.peer(), msg.ctx()))
    })?;
    msg.state.lock().global_dest = dest;

    let candidates = container.paths(&[dest]);
    let h = select_path(&ctx.config().path_priority, container, candidates)
        .ok_or(Error::NoPath(dest))?;
    container.get(h).ok_or(Error::BadPath)?.bind(msg)?;
    log::trace!("dispatch: message to {} bound to slot {}", dest, h);
    Ok(h)
}
