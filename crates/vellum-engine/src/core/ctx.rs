use winit::window::Window;

use crate::backend::BackendKind;
use crate::batch::Renderer;
use crate::gpu::{GpuContext, TickReport};
use crate::time::FrameTime;
use crate::window::RuntimeCtx;

/// Per-frame context passed to [`App`](super::App) callbacks.
pub struct FrameCtx<'a> {
    pub window: &'a Window,
    pub gpu: &'a mut GpuContext,
    pub renderer: &'a mut Renderer,
    pub time: FrameTime,
    /// What the safe point did at the start of this frame.
    pub tick: &'a TickReport,
    pub runtime: &'a mut RuntimeCtx,
}

impl FrameCtx<'_> {
    /// Framebuffer size in physical pixels (the drawing coordinate space).
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Asks the runtime to move to another graphics backend.
    ///
    /// The switch runs at the start of a later frame, never mid-draw.
    pub fn request_backend(&mut self, kind: BackendKind) {
        self.runtime.switch_backend(kind);
    }

    pub fn exit(&mut self) {
        self.runtime.exit();
    }
}
