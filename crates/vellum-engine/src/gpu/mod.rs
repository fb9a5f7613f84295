//! GPU context and resource lifecycle.
//!
//! - [`GpuContext`] owns the active backend and is the entry point for every
//!   GPU-touching call. It enforces the affinity thread and is the safe point
//!   for deferred disposal, registry pruning, and backend switches.
//! - [`GpuResourceRegistry`] tracks every texture and render target by a
//!   stable [`ResourceHandle`] and carries their content across a switch.
//! - [`DeferredDisposalQueue`] moves releases triggered on other threads onto
//!   the affinity thread.

mod affinity;
pub(crate) mod context;
mod disposal;
pub(crate) mod registry;
mod switch;
mod texture;

pub use affinity::ThreadAffinityGuard;
pub use context::{ContextConfig, GpuContext, TickReport};
pub use disposal::{DeferredDisposalQueue, DisposalRequest, DisposalSender};
pub use registry::{
    GpuResourceRegistry, ResourceHandle, ResourceInfo, ResourceKind, ResourceStatus, RestoreReport,
    SnapshotReport,
};
pub use switch::{BackendSwitchCoordinator, PendingSwitch, SwitchHandle, SwitchReport, SwitchState};
pub use texture::{RenderTarget, Texture, TextureParams, TextureSource};
