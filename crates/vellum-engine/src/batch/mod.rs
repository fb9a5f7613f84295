//! Primitive batching.
//!
//! Batches accumulate primitives in CPU memory between `begin` and `end` and
//! turn them into as few backend draw calls as possible.
//!
//! - [`LineBatch`]: thick solid lines, one draw call per thickness run.
//! - [`QuadBatch`]: textured quads, one draw call per texture-slot epoch.
//!
//! A batch flushes implicitly when its buffer is full, when a line changes
//! thickness, or when a quad needs a texture and every slot is taken.
//! While any batch is open the context refuses to end the scene or switch
//! backends.

mod buffer;
mod line;
mod quad;
mod slots;
mod vertex;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use line::LineBatch;
pub use quad::{MappedQuads, QuadBatch, QuadDraw, TextureFlip};
pub use slots::{SlotLookup, TextureSlotAllocator};
pub use vertex::{LineVertex, QUAD_INDICES, QUAD_VERTEX_COUNT, QuadVertex};

use crate::coords::Vec2;
use crate::error::Result;
use crate::gpu::{GpuContext, TextureSource};
use crate::paint::Color;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BatchState {
    Closed,
    Open,
}

/// Number of batches between `begin` and `end`, shared with the context.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenBatches(Arc<AtomicUsize>);

impl OpenBatches {
    pub fn opened(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn closed(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// One quad batch and one line batch sized from the context configuration.
///
/// `begin` opens both, `end` flushes quads before lines so lines draw on top.
#[derive(Debug)]
pub struct Renderer {
    pub quads: QuadBatch,
    pub lines: LineBatch,
}

impl Renderer {
    pub(crate) fn new(ctx: &mut GpuContext) -> Result<Self> {
        let config = ctx.config().clone();
        Ok(Self {
            quads: QuadBatch::new(ctx, config.quad_capacity)?,
            lines: LineBatch::new(ctx, config.line_capacity)?,
        })
    }

    pub fn begin(&mut self, ctx: &mut GpuContext) -> Result<()> {
        self.quads.begin(ctx)?;
        if let Err(e) = self.lines.begin(ctx) {
            // Keep the pair consistent.
            let _ = self.quads.end(ctx);
            return Err(e);
        }
        Ok(())
    }

    /// Closes both batches. Both are closed even when a flush fails.
    pub fn end(&mut self, ctx: &mut GpuContext) -> Result<()> {
        let quads = self.quads.end(ctx);
        let lines = self.lines.end(ctx);
        quads.and(lines)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.quads.is_open() || self.lines.is_open()
    }

    pub fn draw_line(
        &mut self,
        ctx: &mut GpuContext,
        start: Vec2,
        end: Vec2,
        thickness: f32,
        color: Color,
    ) -> Result<()> {
        self.lines.draw(ctx, start, end, thickness, color)
    }

    pub fn draw_quad<T>(&mut self, ctx: &mut GpuContext, texture: &T, quad: &QuadDraw) -> Result<()>
    where
        T: TextureSource + ?Sized,
    {
        self.quads.draw(ctx, texture, quad)
    }

    pub fn dispose(self, ctx: &mut GpuContext) -> Result<()> {
        let Self { quads, lines } = self;
        let quads = quads.dispose(ctx);
        let lines = lines.dispose(ctx);
        quads.and(lines)
    }
}
