//! wgpu implementation of [`GraphicsBackend`].
//!
//! One [`WgpuBackend`] drives exactly one graphics API, chosen through
//! [`BackendKind`]. Every flush records its own command encoder and submits
//! it immediately, so queue writes and draws stay in call order.
//!
//! Textures and render targets are `Rgba8Unorm`. Mip chains are built on the
//! CPU from a shadow copy of level 0; render targets never carry mips.

mod init;
mod pipeline;
mod surface;
mod texels;

use std::sync::Arc;

use slotmap::SlotMap;
use winit::window::Window;

use crate::coords::Region;
use crate::error::{Result, UsageError, VellumError};
use crate::paint::Color;

use super::{
    BackendInfo, BackendKind, DrawCall, FilterMode, GeometryLayout, GpuBufferId, GpuTextureId,
    GraphicsBackend, Screenshot, TextureDesc,
};

pub use init::GpuInit;

use pipeline::{Globals, Layouts, Pipelines, QUAD_TEXTURE_UNITS, TEXTURE_FORMAT};
use surface::{SurfaceErrorAction, SurfaceState};

struct NativeTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDesc,
    /// Level-0 pixels, kept only for mipmapped textures.
    shadow: Option<Vec<u8>>,
    bytes: u64,
}

struct NativeGeometry {
    vertices: wgpu::Buffer,
    indices: Option<wgpu::Buffer>,
    bytes: u64,
}

/// The frame being drawn into.
enum Frame {
    Surface {
        texture: wgpu::SurfaceTexture,
        view: wgpu::TextureView,
    },
    Offscreen,
}

/// Color attachment of the next pass.
struct Attachment<'a> {
    view: &'a wgpu::TextureView,
    format: wgpu::TextureFormat,
    size: (u32, u32),
}

/// Graphics backend over wgpu.
pub struct WgpuBackend {
    kind: BackendKind,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    /// Present when rendering to a window.
    surface: Option<SurfaceState>,
    /// Frame color target when rendering without a window.
    offscreen: Option<NativeTexture>,
    size: (u32, u32),
    frame: Option<Frame>,
    target: Option<GpuTextureId>,
    scissor: Option<Region>,

    textures: SlotMap<GpuTextureId, NativeTexture>,
    geometry: SlotMap<GpuBufferId, NativeGeometry>,

    layouts: Layouts,
    pipelines: Vec<Pipelines>,
    globals: wgpu::Buffer,
    line_bind_group: wgpu::BindGroup,
    smooth_sampler: wgpu::Sampler,
    pixel_sampler: wgpu::Sampler,
    /// Bound to quad slots no texture occupies.
    fallback: wgpu::TextureView,

    allocated: u64,
    warned_no_frame: bool,

    /// Declared last so every GPU object above is released first.
    _instance: wgpu::Instance,
}

impl WgpuBackend {
    /// Opens `kind` and binds it to `window`.
    ///
    /// Adapter and device acquisition block on the calling thread.
    pub fn for_window(kind: BackendKind, window: Arc<Window>, init: &GpuInit) -> Result<Self> {
        let backends = init::backends_for(kind).map_err(init_error)?;
        let instance = init::create_instance(backends, init);
        let size = window.inner_size();

        let surface = instance
            .create_surface(window)
            .map_err(|e| VellumError::BackendInit(format!("failed to create {kind} surface: {e}")))?;
        let (adapter, device, queue) =
            pollster::block_on(init::request_device(&instance, Some(&surface), init))
                .map_err(init_error)?;

        let surface = SurfaceState::new(surface, &adapter, &device, (size.width, size.height), init)
            .ok_or_else(|| VellumError::BackendInit("no supported surface formats".to_string()))?;

        Ok(Self::assemble(
            kind,
            instance,
            adapter,
            device,
            queue,
            Some(surface),
            (size.width, size.height),
        ))
    }

    /// Opens `kind` without a window. Frames render into an internal texture.
    pub fn offscreen(kind: BackendKind, width: u32, height: u32, init: &GpuInit) -> Result<Self> {
        let backends = init::backends_for(kind).map_err(init_error)?;
        let instance = init::create_instance(backends, init);
        let (adapter, device, queue) =
            pollster::block_on(init::request_device(&instance, None, init)).map_err(init_error)?;

        let mut backend = Self::assemble(kind, instance, adapter, device, queue, None, (width, height));
        backend.offscreen = Some(backend.allocate_texture(&TextureDesc {
            width: width.max(1),
            height: height.max(1),
            filter: FilterMode::Smooth,
            mipmaps: false,
            render_target: true,
        })?);
        Ok(backend)
    }

    fn assemble(
        kind: BackendKind,
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        surface: Option<SurfaceState>,
        size: (u32, u32),
    ) -> Self {
        let layouts = Layouts::new(&device);

        let mut pipelines = vec![Pipelines::new(&device, &layouts, TEXTURE_FORMAT)];
        if let Some(format) = surface.as_ref().map(SurfaceState::format) {
            if format != TEXTURE_FORMAT {
                pipelines.push(Pipelines::new(&device, &layouts, format));
            }
        }

        let globals = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vellum globals"),
            size: std::mem::size_of::<Globals>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let line_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("vellum line bind group"),
            layout: &layouts.lines,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: globals.as_entire_binding(),
            }],
        });

        let fallback = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vellum fallback texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        texels::upload(&queue, &fallback, 0, Region::full(1, 1), &[255; 4]);
        let fallback = fallback.create_view(&wgpu::TextureViewDescriptor::default());

        let info = adapter.get_info();
        log::info!("wgpu {kind} backend on {} ({:?})", info.name, info.device_type);

        Self {
            kind,
            smooth_sampler: pipeline::sampler(&device, FilterMode::Smooth),
            pixel_sampler: pipeline::sampler(&device, FilterMode::Pixelated),
            adapter,
            device,
            queue,
            surface,
            offscreen: None,
            size,
            frame: None,
            target: None,
            scissor: None,
            textures: SlotMap::with_key(),
            geometry: SlotMap::with_key(),
            layouts,
            pipelines,
            globals,
            line_bind_group,
            fallback,
            allocated: 0,
            warned_no_frame: false,
            _instance: instance,
        }
    }

    /// Returns the current frame size in physical pixels.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    fn allocate_texture(&mut self, desc: &TextureDesc) -> Result<NativeTexture> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width > max || desc.height > max {
            return Err(VellumError::ResourceCreation {
                what: "texture",
                reason: format!("{}x{} exceeds the {max}px device limit", desc.width, desc.height),
            });
        }

        let mip_level_count = if desc.render_target { 1 } else { desc.mip_level_count() };
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if desc.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(if desc.render_target {
                "vellum render target"
            } else {
                "vellum texture"
            }),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bytes = (0..mip_level_count)
            .map(|mip| {
                let w = u64::from((desc.width >> mip).max(1));
                let h = u64::from((desc.height >> mip).max(1));
                w * h * 4
            })
            .sum();
        self.allocated += bytes;

        Ok(NativeTexture {
            texture,
            view,
            desc: *desc,
            shadow: (mip_level_count > 1).then(|| vec![0; desc.rgba_len()]),
            bytes,
        })
    }

    fn texture(&self, id: GpuTextureId) -> Result<&NativeTexture> {
        self.textures
            .get(id)
            .ok_or_else(|| VellumError::Device(format!("unknown texture {id:?}")))
    }

    /// Where the next pass draws, or `None` when no frame is available.
    fn attachment(&self) -> Result<Option<Attachment<'_>>> {
        if let Some(id) = self.target {
            let t = self.texture(id)?;
            return Ok(Some(Attachment {
                view: &t.view,
                format: TEXTURE_FORMAT,
                size: (t.desc.width, t.desc.height),
            }));
        }

        Ok(match (&self.frame, &self.surface, &self.offscreen) {
            (Some(Frame::Surface { view, .. }), Some(s), _) => Some(Attachment {
                view,
                format: s.format(),
                size: (s.config.width, s.config.height),
            }),
            (Some(Frame::Offscreen), _, Some(t)) => Some(Attachment {
                view: &t.view,
                format: TEXTURE_FORMAT,
                size: (t.desc.width, t.desc.height),
            }),
            _ => None,
        })
    }

    fn pipelines(&self, format: wgpu::TextureFormat) -> Result<&Pipelines> {
        self.pipelines
            .iter()
            .find(|p| p.format == format)
            .ok_or_else(|| VellumError::Device(format!("no pipeline for {format:?}")))
    }

    fn warn_no_frame(&mut self, what: &str) {
        if !self.warned_no_frame {
            log::debug!("{what} outside an acquired frame; skipped");
            self.warned_no_frame = true;
        }
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

/// Scissor rectangle for a pass into a `size` target. `Err(())` when the
/// scissor leaves nothing to draw.
fn scissor_rect(scissor: Option<Region>, size: (u32, u32)) -> std::result::Result<Option<Region>, ()> {
    match scissor.map(|r| r.clamped_to(size.0, size.1)) {
        Some(r) if r.is_empty() => Err(()),
        clamped => Ok(clamped),
    }
}

fn init_error(e: anyhow::Error) -> VellumError {
    VellumError::BackendInit(format!("{e:#}"))
}

fn begin_pass<'e>(
    encoder: &'e mut wgpu::CommandEncoder,
    view: &wgpu::TextureView,
    load: wgpu::LoadOp<wgpu::Color>,
) -> wgpu::RenderPass<'e> {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("vellum pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load,
                store: wgpu::StoreOp::Store,
            },
            depth_slice: None,
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
        multiview_mask: None,
    })
}

/// `queue.write_buffer` needs 4-byte multiples; 16-bit index runs may be odd.
fn padded_to_copy_alignment(bytes: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if bytes.len() % align == 0 {
        std::borrow::Cow::Borrowed(bytes)
    } else {
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len().next_multiple_of(align), 0);
        std::borrow::Cow::Owned(padded)
    }
}

fn buffer_size(bytes: usize) -> u64 {
    (bytes.max(4) as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl GraphicsBackend for WgpuBackend {
    fn info(&self) -> BackendInfo {
        let info = self.adapter.get_info();
        BackendInfo {
            kind: self.kind,
            adapter: info.name,
            driver: if info.driver_info.is_empty() {
                info.driver
            } else {
                format!("{} ({})", info.driver, info.driver_info)
            },
        }
    }

    fn max_texture_units(&self) -> u32 {
        let limit = self.device.limits().max_sampled_textures_per_shader_stage as usize;
        QUAD_TEXTURE_UNITS.min(limit) as u32
    }

    fn create_texture(&mut self, desc: &TextureDesc, pixels: Option<&[u8]>) -> Result<GpuTextureId> {
        if let Some(p) = pixels {
            if p.len() != desc.rgba_len() {
                return Err(UsageError::PixelLengthMismatch {
                    expected: desc.rgba_len(),
                    actual: p.len(),
                }
                .into());
            }
        }

        let mut tex = self.allocate_texture(desc)?;
        match pixels {
            Some(p) => {
                let full = Region::full(desc.width, desc.height);
                texels::upload(&self.queue, &tex.texture, 0, full, p);
                if let Some(shadow) = tex.shadow.as_mut() {
                    shadow.copy_from_slice(p);
                    texels::upload_mip_chain(
                        &self.queue,
                        &tex.texture,
                        p,
                        desc.width,
                        desc.height,
                        tex.texture.mip_level_count(),
                    );
                }
            }
            None => {
                // Fresh textures start transparent black.
                let zeros = vec![0u8; desc.rgba_len()];
                texels::upload(&self.queue, &tex.texture, 0, Region::full(desc.width, desc.height), &zeros);
                if tex.shadow.is_some() {
                    texels::upload_mip_chain(
                        &self.queue,
                        &tex.texture,
                        &zeros,
                        desc.width,
                        desc.height,
                        tex.texture.mip_level_count(),
                    );
                }
            }
        }
        tex.desc = *desc;
        Ok(self.textures.insert(tex))
    }

    fn write_texture(&mut self, id: GpuTextureId, region: Region, pixels: &[u8]) -> Result<()> {
        let tex = self
            .textures
            .get_mut(id)
            .ok_or_else(|| VellumError::Device(format!("unknown texture {id:?}")))?;
        if pixels.len() != region.rgba_len() {
            return Err(UsageError::PixelLengthMismatch {
                expected: region.rgba_len(),
                actual: pixels.len(),
            }
            .into());
        }

        texels::upload(&self.queue, &tex.texture, 0, region, pixels);

        if let Some(shadow) = tex.shadow.as_mut() {
            let row_len = region.width as usize * 4;
            let stride = tex.desc.width as usize * 4;
            for (row, src) in pixels.chunks_exact(row_len).enumerate() {
                let start = (region.y as usize + row) * stride + region.x as usize * 4;
                shadow[start..start + row_len].copy_from_slice(src);
            }
            texels::upload_mip_chain(
                &self.queue,
                &tex.texture,
                shadow,
                tex.desc.width,
                tex.desc.height,
                tex.texture.mip_level_count(),
            );
        }
        Ok(())
    }

    fn read_texture(&mut self, id: GpuTextureId) -> Result<Vec<u8>> {
        let tex = self.texture(id)?;
        texels::read_back(&self.device, &self.queue, &tex.texture, tex.desc.width, tex.desc.height)
    }

    fn set_texture_filter(&mut self, id: GpuTextureId, filter: FilterMode) {
        if let Some(tex) = self.textures.get_mut(id) {
            tex.desc.filter = filter;
        }
    }

    fn destroy_texture(&mut self, id: GpuTextureId) {
        if let Some(tex) = self.textures.remove(id) {
            self.allocated = self.allocated.saturating_sub(tex.bytes);
            tex.texture.destroy();
        }
        if self.target == Some(id) {
            self.target = None;
        }
    }

    fn create_geometry(&mut self, layout: &GeometryLayout) -> Result<GpuBufferId> {
        let vertex_bytes = buffer_size(layout.vertex_stride * layout.max_vertices);
        let vertices = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vellum vertices"),
            size: vertex_bytes,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut bytes = vertex_bytes;
        let indices = (layout.max_indices > 0).then(|| {
            let size = buffer_size(layout.max_indices * std::mem::size_of::<u16>());
            bytes += size;
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("vellum indices"),
                size,
                usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        self.allocated += bytes;
        log::trace!("geometry for {:?}: {bytes} bytes", layout.kind);
        Ok(self.geometry.insert(NativeGeometry {
            vertices,
            indices,
            bytes,
        }))
    }

    fn write_geometry(&mut self, id: GpuBufferId, vertices: &[u8], indices: &[u8]) -> Result<()> {
        let geo = self
            .geometry
            .get(id)
            .ok_or_else(|| VellumError::Device(format!("unknown geometry buffer {id:?}")))?;

        let vertices = padded_to_copy_alignment(vertices);
        if vertices.len() as u64 > geo.vertices.size() {
            return Err(VellumError::Device(format!("vertex upload exceeds buffer {id:?}")));
        }
        if !vertices.is_empty() {
            self.queue.write_buffer(&geo.vertices, 0, &vertices);
        }

        if !indices.is_empty() {
            let buffer = geo
                .indices
                .as_ref()
                .ok_or_else(|| VellumError::Device(format!("geometry {id:?} has no index buffer")))?;
            let indices = padded_to_copy_alignment(indices);
            if indices.len() as u64 > buffer.size() {
                return Err(VellumError::Device(format!("index upload exceeds buffer {id:?}")));
            }
            self.queue.write_buffer(buffer, 0, &indices);
        }
        Ok(())
    }

    fn destroy_geometry(&mut self, id: GpuBufferId) {
        if let Some(geo) = self.geometry.remove(id) {
            self.allocated = self.allocated.saturating_sub(geo.bytes);
            geo.vertices.destroy();
            if let Some(i) = geo.indices {
                i.destroy();
            }
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()> {
        let Some(target) = self.attachment()? else {
            self.warn_no_frame("draw");
            return Ok(());
        };
        let Ok(scissor) = scissor_rect(self.scissor, target.size) else {
            log::trace!("draw fully outside the scissor; skipped");
            return Ok(());
        };
        let pipelines = self.pipelines(target.format)?;
        let mut encoder = self.encoder("vellum draw encoder");

        match *call {
            DrawCall::Lines {
                geometry,
                vertex_count,
                thickness,
            } => {
                let geo = self
                    .geometry
                    .get(geometry)
                    .ok_or_else(|| VellumError::Device(format!("unknown geometry buffer {geometry:?}")))?;
                let globals = Globals::new(target.size).with_thickness(thickness);
                self.queue
                    .write_buffer(&self.globals, 0, bytemuck::bytes_of(&globals));

                let mut pass = begin_pass(&mut encoder, target.view, wgpu::LoadOp::Load);
                if let Some(r) = scissor {
                    pass.set_scissor_rect(r.x, r.y, r.width, r.height);
                }
                pass.set_pipeline(&pipelines.lines);
                pass.set_bind_group(0, &self.line_bind_group, &[]);
                pass.set_vertex_buffer(0, geo.vertices.slice(..));
                pass.draw(0..6, 0..vertex_count / 2);
            }
            DrawCall::Quads {
                geometry,
                index_count,
                textures,
            } => {
                let geo = self
                    .geometry
                    .get(geometry)
                    .ok_or_else(|| VellumError::Device(format!("unknown geometry buffer {geometry:?}")))?;
                let index_buffer = geo
                    .indices
                    .as_ref()
                    .ok_or_else(|| VellumError::Device(format!("geometry {geometry:?} has no index buffer")))?;
                if textures.len() > QUAD_TEXTURE_UNITS {
                    return Err(VellumError::Device(format!(
                        "{} textures bound, {QUAD_TEXTURE_UNITS} units available",
                        textures.len()
                    )));
                }

                let mut views = [&self.fallback; QUAD_TEXTURE_UNITS];
                for (slot, bound) in textures.iter().enumerate() {
                    views[slot] = &self.texture(bound.id)?.view;
                }

                let globals = Globals::new(target.size).with_filters(textures.iter().map(|t| t.filter));
                self.queue
                    .write_buffer(&self.globals, 0, bytemuck::bytes_of(&globals));

                let mut entries = vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.globals.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.smooth_sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Sampler(&self.pixel_sampler),
                    },
                ];
                for (slot, view) in views.into_iter().enumerate() {
                    entries.push(wgpu::BindGroupEntry {
                        binding: 3 + slot as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                }
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("vellum quad bind group"),
                    layout: &self.layouts.quads,
                    entries: &entries,
                });

                let mut pass = begin_pass(&mut encoder, target.view, wgpu::LoadOp::Load);
                if let Some(r) = scissor {
                    pass.set_scissor_rect(r.x, r.y, r.width, r.height);
                }
                pass.set_pipeline(&pipelines.quads);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, geo.vertices.slice(..));
                pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                pass.draw_indexed(0..index_count, 0, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn set_render_target(&mut self, target: Option<GpuTextureId>) -> Result<()> {
        if let Some(id) = target {
            if !self.texture(id)?.desc.render_target {
                return Err(VellumError::Device(format!("{id:?} is not a render target")));
            }
        }
        self.target = target;
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Option<Region>) {
        self.scissor = scissor;
    }

    fn clear(&mut self, color: Color) -> Result<()> {
        let Some(target) = self.attachment()? else {
            self.warn_no_frame("clear");
            return Ok(());
        };

        let mut encoder = self.encoder("vellum clear encoder");
        {
            let [r, g, b, a] = color.to_array().map(f64::from);
            let _pass = begin_pass(
                &mut encoder,
                target.view,
                wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn begin_scene(&mut self) -> Result<()> {
        self.scissor = None;
        if self.frame.is_some() {
            return Ok(());
        }
        let Some(surface) = self.surface.as_ref() else {
            self.frame = Some(Frame::Offscreen);
            return Ok(());
        };

        match surface.surface.get_current_texture() {
            Ok(texture) => {
                let view = texture
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                self.frame = Some(Frame::Surface { texture, view });
                self.warned_no_frame = false;
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                match surface.handle_error(&self.device, e) {
                    SurfaceErrorAction::Reconfigured | SurfaceErrorAction::SkipFrame => {
                        log::debug!("frame skipped: {reason}");
                        Ok(())
                    }
                    SurfaceErrorAction::Fatal => Err(VellumError::Device(format!("surface lost: {reason}"))),
                }
            }
        }
    }

    fn end_scene(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Screenshot> {
        let (texture, format) = match (&self.frame, &self.surface, &self.offscreen) {
            (Some(Frame::Surface { texture, .. }), Some(s), _) => {
                if !s.config.usage.contains(wgpu::TextureUsages::COPY_SRC) {
                    return Err(VellumError::Device("the surface cannot be read back".to_string()));
                }
                (&texture.texture, s.format())
            }
            (Some(Frame::Offscreen), _, Some(t)) => (&t.texture, TEXTURE_FORMAT),
            _ => return Err(VellumError::Device("no frame to read back".to_string())),
        };
        let order = texels::ChannelOrder::of(format)
            .ok_or_else(|| VellumError::Device(format!("cannot read back {format:?} frames")))?;

        let (width, height) = (texture.width(), texture.height());
        let mut pixels = texels::read_back(&self.device, &self.queue, texture, width, height)?;
        if order == texels::ChannelOrder::Bgra {
            texels::swap_red_blue(&mut pixels);
        }
        Ok(Screenshot { width, height, pixels })
    }

    fn present(&mut self) -> Result<()> {
        match self.frame.take() {
            Some(Frame::Surface { texture, view }) => {
                drop(view);
                texture.present();
            }
            Some(Frame::Offscreen) | None => {}
        }
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        if let Some(s) = self.surface.as_mut() {
            s.resize(&self.device, width, height);
        }
        if self.offscreen.is_some() && width > 0 && height > 0 {
            let desc = TextureDesc {
                width,
                height,
                filter: FilterMode::Smooth,
                mipmaps: false,
                render_target: true,
            };
            match self.allocate_texture(&desc) {
                Ok(tex) => {
                    if let Some(old) = self.offscreen.replace(tex) {
                        self.allocated = self.allocated.saturating_sub(old.bytes);
                        old.texture.destroy();
                    }
                }
                Err(e) => log::warn!("offscreen frame not resized: {e}"),
            }
        }
    }

    fn wait_idle(&mut self) {
        if let Err(e) = self.device.poll(wgpu::PollType::wait_indefinitely()) {
            log::warn!("wait for GPU idle failed: {e}");
        }
    }

    fn vram_usage(&self) -> u64 {
        self.allocated
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        if let Some(Frame::Surface { texture, .. }) = self.frame.take() {
            // An acquired frame must not outlive its surface.
            drop(texture);
        }
        log::debug!(
            "wgpu {} backend released ({} textures, {} geometry buffers)",
            self.kind,
            self.textures.len(),
            self.geometry.len()
        );
    }
}
