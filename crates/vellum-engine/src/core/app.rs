use winit::event::WindowEvent;

use crate::gpu::GpuContext;
use crate::paint::Color;
use crate::window::RuntimeCtx;

use super::ctx::FrameCtx;

/// Control directive returned by app callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AppControl {
    Continue,
    Exit,
}

/// Application contract implemented by higher layers.
///
/// Per redraw the runtime calls, in order: the context safe point
/// ([`GpuContext::tick`]), [`on_update`](Self::on_update), `begin_scene`, a
/// clear with [`clear_color`](Self::clear_color), [`on_draw`](Self::on_draw)
/// with the renderer open, `end_scene`, `present`.
pub trait App {
    /// Called once after the window and GPU context exist.
    fn on_start(&mut self, gpu: &mut GpuContext) -> anyhow::Result<()> {
        let _ = gpu;
        Ok(())
    }

    /// Called for window events before the runtime handles them.
    fn on_window_event(&mut self, event: &WindowEvent, runtime: &mut RuntimeCtx) -> AppControl {
        let _ = (event, runtime);
        AppControl::Continue
    }

    /// Simulation step. No batch is open.
    fn on_update(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl {
        let _ = ctx;
        AppControl::Continue
    }

    /// Drawing step. `ctx.renderer` is open.
    fn on_draw(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl;

    fn clear_color(&self) -> Color {
        Color::CORNFLOWER_BLUE
    }

    /// Called before the GPU context is torn down. Dispose resources here.
    fn on_exit(&mut self, gpu: &mut GpuContext) {
        let _ = gpu;
    }
}
