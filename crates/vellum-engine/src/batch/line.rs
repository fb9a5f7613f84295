use crate::backend::{DrawCall, GeometryKind, GpuBufferId};
use crate::coords::{Region, Vec2};
use crate::error::{Result, UsageError};
use crate::gpu::{DisposalRequest, DisposalSender, GpuContext};
use crate::paint::Color;

use super::buffer::BatchBuffer;
use super::vertex::LineVertex;
use super::{BatchState, OpenBatches};

/// Batches thick lines into as few draw calls as possible.
///
/// Thickness and scissor are per-draw-call parameters: a line whose thickness
/// or scissor differs from the buffered ones forces a flush.
#[derive(Debug)]
pub struct LineBatch {
    state: BatchState,
    buffer: BatchBuffer<LineVertex>,
    /// `None` between flushes.
    thickness: Option<f32>,
    /// Scissor the buffered lines were drawn under.
    scissor: Option<Region>,
    /// GPU buffer and the backend generation it was created under.
    geometry: Option<(GpuBufferId, u64)>,
    open_batches: OpenBatches,
    disposal: DisposalSender,
}

impl LineBatch {
    /// Creates a batch holding up to `capacity` lines per flush.
    pub fn new(ctx: &GpuContext, capacity: usize) -> Result<Self> {
        ctx.check_thread()?;
        let capacity = capacity.max(1);
        Ok(Self {
            state: BatchState::Closed,
            buffer: BatchBuffer::new(capacity * 2, 0),
            thickness: None,
            scissor: None,
            geometry: None,
            open_batches: ctx.open_batch_counter(),
            disposal: ctx.disposal_sender(),
        })
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == BatchState::Open
    }

    /// Lines that fit before an implicit flush.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.max_vertices() / 2
    }

    #[inline]
    pub fn used_vertices(&self) -> usize {
        self.buffer.used_vertices()
    }

    /// Thickness shared by the buffered lines, if any.
    #[inline]
    pub fn thickness(&self) -> Option<f32> {
        self.thickness
    }

    pub fn begin(&mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if self.is_open() {
            return Err(UsageError::BeginWhileOpen.into());
        }
        self.state = BatchState::Open;
        self.open_batches.opened();
        Ok(())
    }

    /// Buffers a line from `start` to `end`.
    ///
    /// Invisible lines (non-positive thickness, zero alpha) are dropped.
    pub fn draw(
        &mut self,
        ctx: &mut GpuContext,
        start: Vec2,
        end: Vec2,
        thickness: f32,
        color: Color,
    ) -> Result<()> {
        ctx.check_thread()?;
        if !self.is_open() {
            return Err(UsageError::DrawWhileClosed.into());
        }
        if !(thickness > 0.0) || color.is_invisible() {
            return Ok(());
        }

        let scissor = ctx.scissor();
        let thickness_changed = self.thickness.is_some_and(|t| t != thickness);
        let scissor_changed = !self.buffer.is_empty() && self.scissor != scissor;
        if thickness_changed || scissor_changed || !self.buffer.fits(2, 0) {
            self.flush(ctx)?;
        }

        self.thickness = Some(thickness);
        self.scissor = scissor;
        self.buffer.push_vertices(&[
            LineVertex::new(start, color),
            LineVertex::new(end, color),
        ]);
        Ok(())
    }

    /// Uploads the buffered lines and issues one draw call.
    pub fn flush(&mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if self.buffer.is_empty() {
            return Ok(());
        }

        let result = self.submit(ctx);
        self.buffer.reset();
        self.thickness = None;
        result
    }

    fn submit(&mut self, ctx: &mut GpuContext) -> Result<()> {
        let geometry = self.ensure_geometry(ctx)?;
        let vertex_count = self.buffer.used_vertices() as u32;
        let thickness = self.thickness.unwrap_or(1.0);

        let backend = ctx.backend_mut()?;
        backend.write_geometry(geometry, self.buffer.vertex_bytes(), &[])?;
        backend.set_scissor(self.scissor);
        backend.draw(&DrawCall::Lines {
            geometry,
            vertex_count,
            thickness,
        })?;

        log::trace!("line flush: {} line(s) at {thickness}px", vertex_count / 2);
        Ok(())
    }

    pub fn end(&mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if !self.is_open() {
            return Err(UsageError::EndWhileClosed.into());
        }
        let result = self.flush(ctx);
        self.state = BatchState::Closed;
        self.open_batches.closed();
        result
    }

    fn ensure_geometry(&mut self, ctx: &mut GpuContext) -> Result<GpuBufferId> {
        let generation = ctx.generation();
        if let Some((id, owner)) = self.geometry {
            if owner == generation {
                return Ok(id);
            }
            log::debug!("line geometry is from backend generation {owner}; recreating");
        }

        let layout = self.buffer.layout(GeometryKind::Lines);
        let id = ctx.backend_mut()?.create_geometry(&layout)?;
        self.geometry = Some((id, generation));
        Ok(id)
    }

    /// Releases the GPU buffer now. Unflushed lines are discarded.
    pub fn dispose(mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if let Some((id, owner)) = self.geometry.take() {
            if owner == ctx.generation() {
                ctx.backend_mut()?.destroy_geometry(id);
            }
        }
        Ok(())
    }
}

impl Drop for LineBatch {
    fn drop(&mut self) {
        if self.is_open() {
            log::warn!("line batch dropped while open; {} vertices discarded", self.buffer.used_vertices());
            self.open_batches.closed();
        }
        if let Some((buffer, generation)) = self.geometry.take() {
            self.disposal
                .enqueue(DisposalRequest::ReleaseGeometry { buffer, generation });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{GeometryKind, HeadlessConfig};
    use crate::error::VellumError;
    use crate::gpu::ContextConfig;
    use crate::gpu::context::testing::{fixture, fixture_with};

    const A: Vec2 = Vec2::new(0.0, 0.0);
    const B: Vec2 = Vec2::new(100.0, 50.0);
    const C: Vec2 = Vec2::new(10.0, 10.0);
    const D: Vec2 = Vec2::new(20.0, 90.0);

    fn line_draws(probe: &crate::backend::HeadlessProbe) -> Vec<(u32, Option<f32>)> {
        probe
            .draws()
            .into_iter()
            .filter(|d| d.kind == GeometryKind::Lines)
            .map(|d| (d.element_count, d.thickness))
            .collect()
    }

    // ── state machine ────────────────────────────────────────────────────

    #[test]
    fn draw_requires_begin() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        assert!(matches!(
            lines.draw(&mut f.ctx, A, B, 1.0, Color::WHITE),
            Err(VellumError::Usage(UsageError::DrawWhileClosed))
        ));
        assert!(matches!(
            lines.end(&mut f.ctx),
            Err(VellumError::Usage(UsageError::EndWhileClosed))
        ));
    }

    #[test]
    fn double_begin_is_rejected() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        assert!(matches!(
            lines.begin(&mut f.ctx),
            Err(VellumError::Usage(UsageError::BeginWhileOpen))
        ));
        assert_eq!(f.ctx.open_batches(), 1);
        lines.end(&mut f.ctx).unwrap();
        assert_eq!(f.ctx.open_batches(), 0);
    }

    #[test]
    fn draw_after_end_is_rejected() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        lines.end(&mut f.ctx).unwrap();
        assert!(lines.draw(&mut f.ctx, A, B, 1.0, Color::WHITE).is_err());
    }

    // ── flushing ─────────────────────────────────────────────────────────

    #[test]
    fn same_thickness_lines_share_one_flush() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();

        lines.begin(&mut f.ctx).unwrap();
        lines.draw(&mut f.ctx, A, B, 4.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, C, D, 4.0, Color::WHITE).unwrap();
        assert!(f.probe.draws().is_empty());
        lines.end(&mut f.ctx).unwrap();

        assert_eq!(line_draws(&f.probe), vec![(4, Some(4.0))]);
        let vertex_bytes = 4 * std::mem::size_of::<LineVertex>();
        assert_eq!(f.probe.uploads(), vec![(vertex_bytes, 0)]);
    }

    #[test]
    fn thickness_change_forces_flush() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();

        lines.begin(&mut f.ctx).unwrap();
        lines.draw(&mut f.ctx, A, B, 4.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, C, D, 2.0, Color::WHITE).unwrap();
        lines.end(&mut f.ctx).unwrap();

        assert_eq!(line_draws(&f.probe), vec![(2, Some(4.0)), (2, Some(2.0))]);
    }

    #[test]
    fn scissor_change_forces_flush() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        let clip = Region::new(0, 0, 32, 32);

        lines.begin(&mut f.ctx).unwrap();
        lines.draw(&mut f.ctx, A, B, 1.0, Color::WHITE).unwrap();
        f.ctx.set_scissor(Some(clip)).unwrap();
        assert!(f.probe.draws().is_empty());
        lines.draw(&mut f.ctx, C, D, 1.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, A, D, 1.0, Color::WHITE).unwrap();
        f.ctx.set_scissor(None).unwrap();
        lines.end(&mut f.ctx).unwrap();

        let draws: Vec<_> = f.probe.draws().into_iter().map(|d| (d.element_count, d.scissor)).collect();
        assert_eq!(draws, vec![(2, None), (4, Some(clip))]);
    }

    #[test]
    fn invisible_lines_are_dropped() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        lines.begin(&mut f.ctx).unwrap();

        lines.draw(&mut f.ctx, A, B, 0.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, A, B, -3.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, A, B, f32::NAN, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, A, B, 2.0, Color::RED.with_alpha(0.0)).unwrap();
        assert_eq!(lines.used_vertices(), 0);
        assert_eq!(lines.thickness(), None);

        lines.end(&mut f.ctx).unwrap();
        assert!(f.probe.draws().is_empty());
        assert!(f.probe.uploads().is_empty());
    }

    #[test]
    fn invisible_line_does_not_break_thickness_run() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        lines.draw(&mut f.ctx, A, B, 3.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, A, B, 0.0, Color::WHITE).unwrap();
        lines.draw(&mut f.ctx, C, D, 3.0, Color::WHITE).unwrap();
        lines.end(&mut f.ctx).unwrap();
        assert_eq!(line_draws(&f.probe), vec![(4, Some(3.0))]);
    }

    #[test]
    fn overflow_splits_into_two_draws() {
        let mut f = fixture_with(
            HeadlessConfig::default(),
            ContextConfig {
                line_capacity: 8,
                ..ContextConfig::default()
            },
        );
        let mut lines = LineBatch::new(&f.ctx, f.ctx.config().line_capacity).unwrap();
        assert_eq!(lines.capacity(), 8);

        lines.begin(&mut f.ctx).unwrap();
        for _ in 0..9 {
            lines.draw(&mut f.ctx, A, B, 1.0, Color::WHITE).unwrap();
        }
        lines.end(&mut f.ctx).unwrap();

        assert_eq!(line_draws(&f.probe), vec![(16, Some(1.0)), (2, Some(1.0))]);
        let stride = std::mem::size_of::<LineVertex>();
        assert_eq!(f.probe.uploads(), vec![(16 * stride, 0), (2 * stride, 0)]);
    }

    #[test]
    fn empty_flush_touches_nothing() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 64).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        lines.flush(&mut f.ctx).unwrap();
        lines.end(&mut f.ctx).unwrap();
        assert!(f.probe.events().is_empty());
        assert_eq!(f.probe.live_geometry(), 0);
    }

    #[test]
    fn flush_from_other_thread_is_rejected() {
        let f = fixture();
        let crate::gpu::context::testing::Fixture { ctx, .. } = f;
        let mut lines = LineBatch::new(&ctx, 64).unwrap();
        let ctx = std::sync::Arc::new(parking_lot::Mutex::new(ctx));

        let remote = std::sync::Arc::clone(&ctx);
        let (result, lines) = std::thread::spawn(move || {
            let r = lines.flush(&mut remote.lock());
            (r, lines)
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(VellumError::ThreadAffinity { .. })));
        lines.dispose(&mut ctx.lock()).unwrap();
    }

    // ── geometry lifetime ────────────────────────────────────────────────

    #[test]
    fn dropped_batch_releases_geometry_on_tick() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 4).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        lines.draw(&mut f.ctx, A, B, 1.0, Color::WHITE).unwrap();
        lines.end(&mut f.ctx).unwrap();
        assert_eq!(f.probe.live_geometry(), 1);

        drop(lines);
        assert_eq!(f.probe.live_geometry(), 1);
        f.ctx.tick(Duration::ZERO).unwrap();
        assert_eq!(f.probe.live_geometry(), 0);
    }

    #[test]
    fn dropping_open_batch_unblocks_context() {
        let mut f = fixture();
        let mut lines = LineBatch::new(&f.ctx, 4).unwrap();
        lines.begin(&mut f.ctx).unwrap();
        assert_eq!(f.ctx.open_batches(), 1);
        drop(lines);
        assert_eq!(f.ctx.open_batches(), 0);
        f.ctx.end_scene().unwrap();
    }
}
