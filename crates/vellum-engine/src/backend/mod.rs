//! Graphics backends.
//!
//! A backend is one concrete graphics-API implementation of the
//! [`GraphicsBackend`] capability set. Exactly one implementation exists per
//! supported API; which one runs is decided by configuration ([`BackendKind`]),
//! never by probing objects at runtime.
//!
//! - [`native::WgpuBackend`] drives Vulkan / Metal / DX12 / GL through wgpu.
//! - [`HeadlessBackend`] keeps everything in CPU memory and records what it
//!   was asked to do. It runs without a window and backs the test suite.
//!
//! Backend object ids ([`GpuTextureId`], [`GpuBufferId`]) are only meaningful
//! to the backend instance that issued them. Everything above this layer holds
//! registry handles instead, which survive a backend switch.

mod headless;
pub mod native;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use slotmap::new_key_type;

use crate::coords::Region;
use crate::error::Result;
use crate::paint::Color;

pub use headless::{HeadlessBackend, HeadlessConfig, HeadlessEvent, HeadlessProbe, RecordedDraw};

new_key_type! {
    /// Backend-local texture object.
    pub struct GpuTextureId;
    /// Backend-local geometry (vertex + index) buffer pair.
    pub struct GpuBufferId;
}

/// Which graphics API to run on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BackendKind {
    Vulkan,
    Metal,
    Dx12,
    Gl,
    Headless,
}

impl BackendKind {
    /// Environment variable consulted by [`BackendKind::from_env`].
    pub const ENV_VAR: &'static str = "VELLUM_BACKEND";

    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "vulkan",
            BackendKind::Metal => "metal",
            BackendKind::Dx12 => "dx12",
            BackendKind::Gl => "gl",
            BackendKind::Headless => "headless",
        }
    }

    /// Recommended native API for the current platform.
    pub const fn platform_default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "ios")) {
            BackendKind::Metal
        } else if cfg!(target_os = "windows") {
            BackendKind::Dx12
        } else {
            BackendKind::Vulkan
        }
    }

    /// Reads `VELLUM_BACKEND`. Unset or unparsable values yield `None`.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(Self::ENV_VAR).ok()?;
        match raw.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                log::warn!("ignoring {}: {e}", Self::ENV_VAR);
                None
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(BackendKind::Vulkan),
            "metal" | "mtl" => Ok(BackendKind::Metal),
            "dx12" | "d3d12" | "directx12" => Ok(BackendKind::Dx12),
            "gl" | "opengl" | "gles" => Ok(BackendKind::Gl),
            "headless" | "dummy" | "none" => Ok(BackendKind::Headless),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// Descriptive information reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub adapter: String,
    pub driver: String,
}

/// Sampling filter of a texture.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum FilterMode {
    /// Linear filtering.
    #[default]
    Smooth,
    /// Nearest-neighbour filtering.
    Pixelated,
}

/// Everything a backend needs to (re)create a texture.
///
/// Pixel format is always tightly packed RGBA8.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub filter: FilterMode,
    pub mipmaps: bool,
    /// Texture may be bound as a draw destination.
    pub render_target: bool,
}

impl TextureDesc {
    #[inline]
    pub fn rgba_len(&self) -> usize {
        Region::full(self.width, self.height).rgba_len()
    }

    /// Full mip chain length when mipmaps are requested, otherwise 1.
    pub fn mip_level_count(&self) -> u32 {
        if self.mipmaps {
            32 - self.width.max(self.height).max(1).leading_zeros()
        } else {
            1
        }
    }
}

/// Primitive class a geometry buffer is laid out for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GeometryKind {
    /// Two vertices per line, no indices.
    Lines,
    /// Four vertices and six `u16` indices per quad.
    Quads,
}

/// Size of a geometry buffer pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GeometryLayout {
    pub kind: GeometryKind,
    pub vertex_stride: usize,
    pub max_vertices: usize,
    pub max_indices: usize,
}

/// A texture bound to a physical slot for one draw call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BoundTexture {
    pub id: GpuTextureId,
    pub filter: FilterMode,
}

/// One GPU draw call covering the uploaded prefix of a geometry buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall<'a> {
    Lines {
        geometry: GpuBufferId,
        vertex_count: u32,
        thickness: f32,
    },
    Quads {
        geometry: GpuBufferId,
        index_count: u32,
        /// Index in this slice is the physical slot referenced by vertices.
        textures: &'a [BoundTexture],
    },
}

/// Pixels of one rendered frame, tightly packed RGBA8, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Screenshot {
    /// Writes the frame as a PNG file.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        image::save_buffer_with_format(
            path,
            &self.pixels,
            self.width,
            self.height,
            image::ColorType::Rgba8,
            image::ImageFormat::Png,
        )?;
        Ok(())
    }
}

/// Capability set every graphics backend implements.
///
/// All methods are called from the context's affinity thread only.
pub trait GraphicsBackend: Send {
    fn info(&self) -> BackendInfo;

    /// Number of textures one draw call may reference simultaneously.
    fn max_texture_units(&self) -> u32;

    /// Creates a texture, optionally uploading RGBA8 content for mip level 0.
    fn create_texture(&mut self, desc: &TextureDesc, pixels: Option<&[u8]>) -> Result<GpuTextureId>;

    /// Overwrites `region` with tightly packed RGBA8 `pixels`.
    fn write_texture(&mut self, id: GpuTextureId, region: Region, pixels: &[u8]) -> Result<()>;

    /// Reads mip level 0 back as tightly packed RGBA8.
    fn read_texture(&mut self, id: GpuTextureId) -> Result<Vec<u8>>;

    fn set_texture_filter(&mut self, id: GpuTextureId, filter: FilterMode);

    fn destroy_texture(&mut self, id: GpuTextureId);

    fn create_geometry(&mut self, layout: &GeometryLayout) -> Result<GpuBufferId>;

    /// Writes the used prefix of the staging data, starting at offset zero.
    fn write_geometry(&mut self, id: GpuBufferId, vertices: &[u8], indices: &[u8]) -> Result<()>;

    fn destroy_geometry(&mut self, id: GpuBufferId);

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()>;

    /// Redirects subsequent clears and draws to a render-target texture, or
    /// back to the frame when `None`.
    fn set_render_target(&mut self, target: Option<GpuTextureId>) -> Result<()>;

    /// Restricts subsequent draws to `scissor`, in pixels of the current
    /// target. `None` draws to the whole target. Clears ignore the scissor.
    fn set_scissor(&mut self, scissor: Option<Region>);

    fn clear(&mut self, color: Color) -> Result<()>;

    /// Starts a frame. The scissor is reset to the whole target.
    fn begin_scene(&mut self) -> Result<()>;

    fn end_scene(&mut self) -> Result<()>;

    /// Reads back the frame drawn since `begin_scene`. Must run before
    /// `present`; render-target binding does not affect what is read.
    fn read_frame(&mut self) -> Result<Screenshot>;

    fn present(&mut self) -> Result<()>;

    fn resize(&mut self, width: u32, height: u32);

    /// Blocks until every submitted GPU command has finished.
    fn wait_idle(&mut self);

    /// Bytes of GPU memory in use, or 0 when the API cannot tell.
    fn vram_usage(&self) -> u64 {
        0
    }

    /// Total GPU memory, or 0 when the API cannot tell.
    fn total_vram(&self) -> u64 {
        0
    }
}

/// Deferred constructor for the next backend, run while a switch is Initializing.
pub type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn GraphicsBackend>> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_aliases() {
        assert_eq!("Vulkan".parse::<BackendKind>(), Ok(BackendKind::Vulkan));
        assert_eq!(" d3d12 ".parse::<BackendKind>(), Ok(BackendKind::Dx12));
        assert_eq!("opengl".parse::<BackendKind>(), Ok(BackendKind::Gl));
        assert_eq!("dummy".parse::<BackendKind>(), Ok(BackendKind::Headless));
        assert!("glide".parse::<BackendKind>().is_err());
    }

    #[test]
    fn display_matches_parse() {
        for kind in [
            BackendKind::Vulkan,
            BackendKind::Metal,
            BackendKind::Dx12,
            BackendKind::Gl,
            BackendKind::Headless,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
    }

    #[test]
    fn mip_chain_length() {
        let mut desc = TextureDesc {
            width: 256,
            height: 64,
            filter: FilterMode::Smooth,
            mipmaps: true,
            render_target: false,
        };
        assert_eq!(desc.mip_level_count(), 9);
        desc.mipmaps = false;
        assert_eq!(desc.mip_level_count(), 1);
    }
}
