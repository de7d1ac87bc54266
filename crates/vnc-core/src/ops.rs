//! Callback seams implemented by filesystem-specific code.

use crate::vnode::VnodeLock;
use vnc_buf::BufferWriter;
use vnc_error::Result;
use vnc_types::{LogicalBlock, MountId, UpperEvent, VnodeId};

/// What `on_inactive` wants done with the vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactiveOutcome {
    /// Keep the vnode cached.
    Keep,
    /// Doom it now (e.g. the file was unlinked while open).
    Doom,
}

/// Per-mount filesystem operations consumed by the engine.
///
/// `on_inactive` and `on_reclaim` run with the vnode's exclusive lock held;
/// they must not call back into reference operations on the same vnode that
/// would need that lock.
pub trait VnodeOps: Send + Sync {
    /// The last use reference went away (or was owed and is now completed).
    fn on_inactive(&self, _lock: &mut VnodeLock<'_>) -> Result<InactiveOutcome> {
        Ok(InactiveOutcome::Keep)
    }

    /// Release all filesystem-private state. Called exactly once per
    /// incarnation; an error here is fatal.
    fn on_reclaim(&self, lock: &mut VnodeLock<'_>) -> Result<()> {
        drop(lock.take_private());
        Ok(())
    }

    /// Called before inactive processing when the vnode was use-active.
    fn on_close(&self, _vnode: VnodeId, _last_use: bool) {}

    /// Persist one dirty block.
    fn write_buffer(&self, vnode: VnodeId, block: LogicalBlock, data: &[u8]) -> Result<()>;

    /// Drop `refs` name-cache entries pointing at `vnode`.
    fn purge_namecache(&self, _vnode: VnodeId, _refs: u32) {}
}

/// Stacked filesystem listening to a lower mount's vnode events.
pub trait UpperLayer: Send + Sync {
    fn notify(&self, mount: MountId, vnode: VnodeId, event: UpperEvent);
}

/// Adapts a mount's [`VnodeOps`] to the buffer layer's writer seam.
pub(crate) struct OpsWriter<'a>(pub(crate) &'a dyn VnodeOps);

impl BufferWriter for OpsWriter<'_> {
    fn write_buffer(&self, owner: VnodeId, block: LogicalBlock, data: &[u8]) -> Result<()> {
        self.0.write_buffer(owner, block, data)
    }
}
