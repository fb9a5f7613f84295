use std::collections::HashSet;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::coords::Region;
use crate::error::{Result, UsageError, VellumError};
use crate::paint::Color;

use super::{
    BackendInfo, BackendKind, DrawCall, FilterMode, GeometryKind, GeometryLayout, GpuBufferId,
    GpuTextureId, GraphicsBackend, Screenshot, TextureDesc,
};

/// Headless backend configuration.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub max_texture_units: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            max_texture_units: 4,
            width: 1280,
            height: 720,
        }
    }
}

/// Something the headless backend was asked to do, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessEvent {
    Upload {
        geometry: GpuBufferId,
        vertex_bytes: usize,
        index_bytes: usize,
    },
    Draw(RecordedDraw),
    Clear {
        target: Option<GpuTextureId>,
        color: Color,
    },
    BeginScene,
    EndScene,
    Present,
    Resize {
        width: u32,
        height: u32,
    },
}

/// A recorded draw call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub kind: GeometryKind,
    /// Vertices for line draws, indices for quad draws.
    pub element_count: u32,
    pub thickness: Option<f32>,
    pub textures: Vec<GpuTextureId>,
    pub target: Option<GpuTextureId>,
    pub scissor: Option<Region>,
}

struct CpuTexture {
    desc: TextureDesc,
    pixels: Vec<u8>,
}

struct CpuGeometry {
    layout: GeometryLayout,
    vertices: Vec<u8>,
    indices: Vec<u8>,
}

#[derive(Default)]
struct HeadlessState {
    textures: SlotMap<GpuTextureId, CpuTexture>,
    geometry: SlotMap<GpuBufferId, CpuGeometry>,
    events: Vec<HeadlessEvent>,
    texture_releases: Vec<(GpuTextureId, ThreadId)>,
    geometry_releases: Vec<(GpuBufferId, ThreadId)>,
    failing_reads: HashSet<GpuTextureId>,
    failing_creations: usize,
    failing_frame_reads: bool,
    target: Option<GpuTextureId>,
    scissor: Option<Region>,
    size: (u32, u32),
    /// Frame color, RGBA8. Only clears reach it.
    frame: Vec<u8>,
}

/// CPU-only backend.
///
/// Textures and the frame live in memory as RGBA8. Clears fill the bound
/// render target or the frame, and every upload and draw is recorded for
/// inspection through a [`HeadlessProbe`]. Draws are not rasterized.
pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
    max_texture_units: u32,
}

impl HeadlessBackend {
    /// Creates the backend together with a probe sharing its state.
    pub fn new(config: HeadlessConfig) -> (Self, HeadlessProbe) {
        let state = Arc::new(Mutex::new(HeadlessState {
            size: (config.width, config.height),
            frame: vec![0; Region::full(config.width, config.height).rgba_len()],
            ..HeadlessState::default()
        }));
        let probe = HeadlessProbe {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                max_texture_units: config.max_texture_units.max(1),
            },
            probe,
        )
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Headless,
            adapter: "cpu".to_string(),
            driver: "vellum headless".to_string(),
        }
    }

    fn max_texture_units(&self) -> u32 {
        self.max_texture_units
    }

    fn create_texture(&mut self, desc: &TextureDesc, pixels: Option<&[u8]>) -> Result<GpuTextureId> {
        let mut s = self.state.lock();
        if s.failing_creations > 0 {
            s.failing_creations -= 1;
            return Err(VellumError::ResourceCreation {
                what: "texture",
                reason: "injected allocation failure".to_string(),
            });
        }

        let pixels = match pixels {
            Some(p) => {
                check_len(desc.rgba_len(), p.len())?;
                p.to_vec()
            }
            None => vec![0; desc.rgba_len()],
        };

        Ok(s.textures.insert(CpuTexture { desc: *desc, pixels }))
    }

    fn write_texture(&mut self, id: GpuTextureId, region: Region, pixels: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let tex = s
            .textures
            .get_mut(id)
            .ok_or_else(|| VellumError::Device(format!("unknown texture {id:?}")))?;
        check_len(region.rgba_len(), pixels.len())?;

        let row_len = region.width as usize * 4;
        let stride = tex.desc.width as usize * 4;
        for (row, src) in pixels.chunks_exact(row_len).enumerate() {
            let start = (region.y as usize + row) * stride + region.x as usize * 4;
            tex.pixels[start..start + row_len].copy_from_slice(src);
        }
        Ok(())
    }

    fn read_texture(&mut self, id: GpuTextureId) -> Result<Vec<u8>> {
        let s = self.state.lock();
        if s.failing_reads.contains(&id) {
            return Err(VellumError::Device(format!("injected read-back failure for {id:?}")));
        }
        s.textures
            .get(id)
            .map(|t| t.pixels.clone())
            .ok_or_else(|| VellumError::Device(format!("unknown texture {id:?}")))
    }

    fn set_texture_filter(&mut self, id: GpuTextureId, filter: FilterMode) {
        if let Some(tex) = self.state.lock().textures.get_mut(id) {
            tex.desc.filter = filter;
        }
    }

    fn destroy_texture(&mut self, id: GpuTextureId) {
        let mut s = self.state.lock();
        if s.textures.remove(id).is_some() {
            s.texture_releases.push((id, std::thread::current().id()));
        }
        if s.target == Some(id) {
            s.target = None;
        }
    }

    fn create_geometry(&mut self, layout: &GeometryLayout) -> Result<GpuBufferId> {
        let mut s = self.state.lock();
        Ok(s.geometry.insert(CpuGeometry {
            layout: *layout,
            vertices: vec![0; layout.vertex_stride * layout.max_vertices],
            indices: vec![0; layout.max_indices * std::mem::size_of::<u16>()],
        }))
    }

    fn write_geometry(&mut self, id: GpuBufferId, vertices: &[u8], indices: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let geo = s
            .geometry
            .get_mut(id)
            .ok_or_else(|| VellumError::Device(format!("unknown geometry buffer {id:?}")))?;
        if vertices.len() > geo.vertices.len() || indices.len() > geo.indices.len() {
            return Err(VellumError::Device(format!(
                "geometry upload exceeds buffer {id:?} ({:?})",
                geo.layout.kind
            )));
        }
        geo.vertices[..vertices.len()].copy_from_slice(vertices);
        geo.indices[..indices.len()].copy_from_slice(indices);
        s.events.push(HeadlessEvent::Upload {
            geometry: id,
            vertex_bytes: vertices.len(),
            index_bytes: indices.len(),
        });
        Ok(())
    }

    fn destroy_geometry(&mut self, id: GpuBufferId) {
        let mut s = self.state.lock();
        if s.geometry.remove(id).is_some() {
            s.geometry_releases.push((id, std::thread::current().id()));
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()> {
        let mut s = self.state.lock();
        let (target, scissor) = (s.target, s.scissor);
        let recorded = match *call {
            DrawCall::Lines {
                vertex_count,
                thickness,
                ..
            } => RecordedDraw {
                kind: GeometryKind::Lines,
                element_count: vertex_count,
                thickness: Some(thickness),
                textures: Vec::new(),
                target,
                scissor,
            },
            DrawCall::Quads {
                index_count,
                textures,
                ..
            } => {
                if let Some(missing) = textures.iter().find(|t| !s.textures.contains_key(t.id)) {
                    return Err(VellumError::Device(format!(
                        "draw references destroyed texture {:?}",
                        missing.id
                    )));
                }
                RecordedDraw {
                    kind: GeometryKind::Quads,
                    element_count: index_count,
                    thickness: None,
                    textures: textures.iter().map(|t| t.id).collect(),
                    target,
                    scissor,
                }
            }
        };
        s.events.push(HeadlessEvent::Draw(recorded));
        Ok(())
    }

    fn set_render_target(&mut self, target: Option<GpuTextureId>) -> Result<()> {
        let mut s = self.state.lock();
        if let Some(id) = target {
            match s.textures.get(id) {
                Some(t) if t.desc.render_target => {}
                Some(_) => return Err(VellumError::Device(format!("{id:?} is not a render target"))),
                None => return Err(VellumError::Device(format!("unknown texture {id:?}"))),
            }
        }
        s.target = target;
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Option<Region>) {
        self.state.lock().scissor = scissor;
    }

    fn clear(&mut self, color: Color) -> Result<()> {
        let mut s = self.state.lock();
        let target = s.target;
        let px = color.to_rgba8();
        let pixels = match target {
            Some(id) => s.textures.get_mut(id).map(|t| &mut t.pixels),
            None => Some(&mut s.frame),
        };
        if let Some(pixels) = pixels {
            for chunk in pixels.chunks_exact_mut(4) {
                chunk.copy_from_slice(&px);
            }
        }
        s.events.push(HeadlessEvent::Clear { target, color });
        Ok(())
    }

    fn begin_scene(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        s.scissor = None;
        s.events.push(HeadlessEvent::BeginScene);
        Ok(())
    }

    fn end_scene(&mut self) -> Result<()> {
        self.state.lock().events.push(HeadlessEvent::EndScene);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Screenshot> {
        let s = self.state.lock();
        if s.failing_frame_reads {
            return Err(VellumError::Device("injected frame read-back failure".to_string()));
        }
        Ok(Screenshot {
            width: s.size.0,
            height: s.size.1,
            pixels: s.frame.clone(),
        })
    }

    fn present(&mut self) -> Result<()> {
        self.state.lock().events.push(HeadlessEvent::Present);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        let mut s = self.state.lock();
        s.size = (width, height);
        s.frame = vec![0; Region::full(width, height).rgba_len()];
        s.events.push(HeadlessEvent::Resize { width, height });
    }

    fn wait_idle(&mut self) {}

    fn vram_usage(&self) -> u64 {
        let s = self.state.lock();
        let textures: usize = s.textures.values().map(|t| t.pixels.len()).sum();
        let geometry: usize = s
            .geometry
            .values()
            .map(|g| g.vertices.len() + g.indices.len())
            .sum();
        (textures + geometry) as u64
    }
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(UsageError::PixelLengthMismatch { expected, actual }.into());
    }
    Ok(())
}

/// Shared view into a [`HeadlessBackend`]'s state.
///
/// Stays valid after the backend itself has been dropped.
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn draws(&self) -> Vec<RecordedDraw> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                HeadlessEvent::Draw(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(vertex_bytes, index_bytes)` of every geometry upload, in order.
    pub fn uploads(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                HeadlessEvent::Upload {
                    vertex_bytes,
                    index_bytes,
                    ..
                } => Some((*vertex_bytes, *index_bytes)),
                _ => None,
            })
            .collect()
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_geometry(&self) -> usize {
        self.state.lock().geometry.len()
    }

    pub fn texture_pixels(&self, id: GpuTextureId) -> Option<Vec<u8>> {
        self.state.lock().textures.get(id).map(|t| t.pixels.clone())
    }

    pub fn texture_desc(&self, id: GpuTextureId) -> Option<TextureDesc> {
        self.state.lock().textures.get(id).map(|t| t.desc)
    }

    /// Every texture release, with the thread that issued it.
    pub fn texture_releases(&self) -> Vec<(GpuTextureId, ThreadId)> {
        self.state.lock().texture_releases.clone()
    }

    pub fn geometry_releases(&self) -> Vec<(GpuBufferId, ThreadId)> {
        self.state.lock().geometry_releases.clone()
    }

    /// Makes every later read-back of `id` fail.
    pub fn fail_reads_of(&self, id: GpuTextureId) {
        self.state.lock().failing_reads.insert(id);
    }

    /// Makes the next `count` texture creations fail.
    pub fn fail_next_creations(&self, count: usize) {
        self.state.lock().failing_creations = count;
    }

    /// Makes every later frame read-back fail.
    pub fn fail_frame_reads(&self) {
        self.state.lock().failing_frame_reads = true;
    }

    pub fn framebuffer_size(&self) -> (u32, u32) {
        self.state.lock().size
    }

    pub fn frame_pixels(&self) -> Vec<u8> {
        self.state.lock().frame.clone()
    }
}
