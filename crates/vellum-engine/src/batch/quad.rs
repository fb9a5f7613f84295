use smallvec::SmallVec;

use crate::backend::{BoundTexture, DrawCall, GeometryKind, GpuBufferId};
use crate::coords::{Region, Vec2};
use crate::error::{Result, UsageError};
use crate::gpu::{DisposalRequest, DisposalSender, GpuContext, ResourceHandle, TextureSource};
use crate::paint::Color;

use super::buffer::BatchBuffer;
use super::slots::{SlotLookup, TextureSlotAllocator};
use super::vertex::{QUAD_INDICES, QUAD_VERTEX_COUNT, QuadVertex};
use super::{BatchState, OpenBatches};

/// Texture-coordinate mirroring applied to a quad.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct TextureFlip {
    pub horizontal: bool,
    pub vertical: bool,
}

impl TextureFlip {
    pub const NONE: Self = Self {
        horizontal: false,
        vertical: false,
    };
    pub const HORIZONTAL: Self = Self {
        horizontal: true,
        vertical: false,
    };
    pub const VERTICAL: Self = Self {
        horizontal: false,
        vertical: true,
    };
    pub const BOTH: Self = Self {
        horizontal: true,
        vertical: true,
    };
}

/// Placement and styling of one textured quad.
///
/// The quad covers `source` (the whole texture by default) scaled by `scale`,
/// with `origin` (in unscaled source pixels) placed at `position` and used as
/// the rotation pivot.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct QuadDraw {
    pub position: Vec2,
    pub scale: Vec2,
    /// Radians, clockwise on screen.
    pub rotation: f32,
    pub origin: Vec2,
    pub color: Color,
    pub flip: TextureFlip,
    pub source: Option<Region>,
}

impl Default for QuadDraw {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            scale: Vec2::ONE,
            rotation: 0.0,
            origin: Vec2::ZERO,
            color: Color::WHITE,
            flip: TextureFlip::NONE,
            source: None,
        }
    }
}

impl QuadDraw {
    pub fn at(position: Vec2) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn scale(mut self, scale: Vec2) -> Self {
        self.scale = scale;
        self
    }

    pub fn rotation(mut self, radians: f32) -> Self {
        self.rotation = radians;
        self
    }

    pub fn origin(mut self, origin: Vec2) -> Self {
        self.origin = origin;
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn flip(mut self, flip: TextureFlip) -> Self {
        self.flip = flip;
        self
    }

    pub fn source(mut self, source: Region) -> Self {
        self.source = Some(source);
        self
    }

    /// The four corners in TL, TR, BL, BR order.
    fn corners(&self, size: Vec2) -> [Vec2; QUAD_VERTEX_COUNT] {
        [
            Vec2::ZERO,
            Vec2::new(size.x, 0.0),
            Vec2::new(0.0, size.y),
            size,
        ]
        .map(|c| self.position + (c - self.origin).scale(self.scale).rotated(self.rotation))
    }
}

/// Raw space handed out by [`QuadBatch::reserve`].
///
/// `indices` are absolute: add `base_vertex` to each local index. Every
/// vertex comes pre-filled with `tex_slot`.
#[derive(Debug)]
pub struct MappedQuads<'a> {
    pub vertices: &'a mut [QuadVertex],
    pub indices: &'a mut [u16],
    pub base_vertex: u16,
    pub tex_slot: u32,
}

/// Batches textured quads, virtualizing textures onto the backend's
/// physical texture units.
///
/// A scissor change between quads forces a flush.
#[derive(Debug)]
pub struct QuadBatch {
    state: BatchState,
    buffer: BatchBuffer<QuadVertex>,
    slots: TextureSlotAllocator,
    /// Scissor the buffered quads were drawn under.
    scissor: Option<Region>,
    geometry: Option<(GpuBufferId, u64)>,
    open_batches: OpenBatches,
    disposal: DisposalSender,
}

impl QuadBatch {
    /// Largest quad capacity addressable with 16-bit indices.
    pub const MAX_CAPACITY: usize = (u16::MAX as usize + 1) / QUAD_VERTEX_COUNT;

    /// Creates a batch holding up to `capacity` quads per flush.
    pub fn new(ctx: &GpuContext, capacity: usize) -> Result<Self> {
        ctx.check_thread()?;
        let units = ctx.max_texture_units()?;
        let capacity = capacity.clamp(1, Self::MAX_CAPACITY);
        Ok(Self {
            state: BatchState::Closed,
            buffer: BatchBuffer::new(
                capacity * QUAD_VERTEX_COUNT,
                capacity * QUAD_INDICES.len(),
            ),
            slots: TextureSlotAllocator::new(units),
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

    /// Quads that fit before an implicit flush.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.max_vertices() / QUAD_VERTEX_COUNT
    }

    #[inline]
    pub fn used_vertices(&self) -> usize {
        self.buffer.used_vertices()
    }

    #[inline]
    pub fn used_indices(&self) -> usize {
        self.buffer.used_indices()
    }

    /// Textures bound in the current epoch, in slot order.
    pub fn bound_textures(&self) -> &[ResourceHandle] {
        self.slots.bound()
    }

    pub fn begin(&mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if self.is_open() {
            return Err(UsageError::BeginWhileOpen.into());
        }
        // The unit budget can change with the backend.
        self.slots.set_max_units(ctx.max_texture_units()?);
        self.state = BatchState::Open;
        self.open_batches.opened();
        Ok(())
    }

    /// Buffers one textured quad.
    ///
    /// Fully transparent or zero-area quads are dropped.
    pub fn draw<T>(&mut self, ctx: &mut GpuContext, texture: &T, quad: &QuadDraw) -> Result<()>
    where
        T: TextureSource + ?Sized,
    {
        ctx.check_thread()?;
        if !self.is_open() {
            return Err(UsageError::DrawWhileClosed.into());
        }

        let (tex_w, tex_h) = texture.size();
        let source = quad.source.unwrap_or(Region::full(tex_w, tex_h));
        if !source.fits_within(tex_w, tex_h) {
            return Err(UsageError::RegionOutOfBounds {
                x: source.x,
                y: source.y,
                width: source.width,
                height: source.height,
                tex_width: tex_w,
                tex_height: tex_h,
            }
            .into());
        }
        if quad.color.is_invisible() || source.is_empty() || quad.scale.x == 0.0 || quad.scale.y == 0.0 {
            return Ok(());
        }

        let slot = self.prepare(ctx, texture.handle(), QUAD_VERTEX_COUNT, QUAD_INDICES.len())?;

        let (mut u0, mut u1) = (
            source.x as f32 / tex_w as f32,
            (source.x + source.width) as f32 / tex_w as f32,
        );
        let (mut v0, mut v1) = (
            source.y as f32 / tex_h as f32,
            (source.y + source.height) as f32 / tex_h as f32,
        );
        if quad.flip.horizontal {
            std::mem::swap(&mut u0, &mut u1);
        }
        if quad.flip.vertical {
            std::mem::swap(&mut v0, &mut v1);
        }

        let size = Vec2::new(source.width as f32, source.height as f32);
        let [tl, tr, bl, br] = quad.corners(size);
        let base = self.buffer.used_vertices() as u16;
        self.buffer.push_vertices(&[
            QuadVertex::new(tl, Vec2::new(u0, v0), quad.color, slot),
            QuadVertex::new(tr, Vec2::new(u1, v0), quad.color, slot),
            QuadVertex::new(bl, Vec2::new(u0, v1), quad.color, slot),
            QuadVertex::new(br, Vec2::new(u1, v1), quad.color, slot),
        ]);
        self.buffer.push_indices(base, &QUAD_INDICES);
        Ok(())
    }

    /// Reserves raw vertex and index space textured by `texture`.
    ///
    /// Flushes first when the request does not fit in what is left. Requests
    /// larger than the whole batch are rejected.
    pub fn reserve<T>(
        &mut self,
        ctx: &mut GpuContext,
        texture: &T,
        vertices: usize,
        indices: usize,
    ) -> Result<MappedQuads<'_>>
    where
        T: TextureSource + ?Sized,
    {
        ctx.check_thread()?;
        if !self.is_open() {
            return Err(UsageError::DrawWhileClosed.into());
        }
        if vertices > self.buffer.max_vertices() || indices > self.buffer.max_indices() {
            return Err(UsageError::ReservationTooLarge { vertices, indices }.into());
        }

        let tex_slot = self.prepare(ctx, texture.handle(), vertices, indices)?;
        let (vertex_space, index_space, base_vertex) = self.buffer.reserve(vertices, indices);
        for v in vertex_space.iter_mut() {
            v.tex_slot = tex_slot;
        }
        Ok(MappedQuads {
            vertices: vertex_space,
            indices: index_space,
            base_vertex,
            tex_slot,
        })
    }

    /// Makes room for a primitive and returns the texture's slot.
    fn prepare(
        &mut self,
        ctx: &mut GpuContext,
        texture: ResourceHandle,
        vertices: usize,
        indices: usize,
    ) -> Result<u32> {
        if ctx.bound_target() == Some(texture) {
            return Err(UsageError::SampledWhileBound(texture).into());
        }
        let scissor = ctx.scissor();
        let scissor_changed = !self.buffer.is_empty() && self.scissor != scissor;
        if scissor_changed || !self.buffer.fits(vertices, indices) {
            self.flush(ctx)?;
        }
        self.scissor = scissor;

        match self.slots.get_or_assign(texture) {
            SlotLookup::Hit(slot) => Ok(slot),
            SlotLookup::Assigned(slot) => {
                if let Err(e) = ctx.resolve(texture) {
                    self.slots.revoke(slot);
                    return Err(e);
                }
                Ok(slot)
            }
            SlotLookup::Exhausted => {
                self.flush(ctx)?;
                ctx.resolve(texture)?;
                match self.slots.get_or_assign(texture) {
                    SlotLookup::Assigned(slot) | SlotLookup::Hit(slot) => Ok(slot),
                    SlotLookup::Exhausted => unreachable!("fresh epoch has free slots"),
                }
            }
        }
    }

    /// Uploads the buffered quads and issues one draw call.
    pub fn flush(&mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.check_thread()?;
        if self.buffer.is_empty() {
            self.slots.reset_epoch();
            return Ok(());
        }

        let result = self.submit(ctx);
        self.buffer.reset();
        self.slots.reset_epoch();
        result
    }

    fn submit(&mut self, ctx: &mut GpuContext) -> Result<()> {
        let mut textures: SmallVec<[BoundTexture; 16]> = SmallVec::new();
        for handle in self.slots.bound() {
            let (id, desc) = ctx.resolve(*handle)?;
            textures.push(BoundTexture {
                id,
                filter: desc.filter,
            });
        }

        let geometry = self.ensure_geometry(ctx)?;
        let index_count = self.buffer.used_indices() as u32;

        let backend = ctx.backend_mut()?;
        backend.write_geometry(geometry, self.buffer.vertex_bytes(), self.buffer.index_bytes())?;
        backend.set_scissor(self.scissor);
        backend.draw(&DrawCall::Quads {
            geometry,
            index_count,
            textures: &textures,
        })?;

        log::trace!(
            "quad flush: {} quad(s), {} texture(s)",
            index_count as usize / QUAD_INDICES.len(),
            textures.len()
        );
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
            log::debug!("quad geometry is from backend generation {owner}; recreating");
        }

        let layout = self.buffer.layout(GeometryKind::Quads);
        let id = ctx.backend_mut()?.create_geometry(&layout)?;
        self.geometry = Some((id, generation));
        Ok(id)
    }

    /// Releases the GPU buffers now. Unflushed quads are discarded.
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

impl Drop for QuadBatch {
    fn drop(&mut self) {
        if self.is_open() {
            log::warn!("quad batch dropped while open; {} vertices discarded", self.buffer.used_vertices());
            self.open_batches.closed();
        }
        if let Some((buffer, generation)) = self.geometry.take() {
            self.disposal
                .enqueue(DisposalRequest::ReleaseGeometry { buffer, generation });
        }
    }
}
