use std::io::Read;

use crate::backend::{FilterMode, TextureDesc};
use crate::coords::Region;
use crate::error::Result;

use super::context::GpuContext;
use super::disposal::{DisposalRequest, DisposalSender};
use super::registry::{ResourceHandle, ResourceKind};

/// Creation parameters shared by textures and render targets.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TextureParams {
    pub filter: FilterMode,
    pub mipmaps: bool,
}

impl TextureParams {
    pub const fn smooth() -> Self {
        Self {
            filter: FilterMode::Smooth,
            mipmaps: false,
        }
    }

    pub const fn pixelated() -> Self {
        Self {
            filter: FilterMode::Pixelated,
            mipmaps: false,
        }
    }

    pub const fn with_mipmaps(mut self, mipmaps: bool) -> Self {
        self.mipmaps = mipmaps;
        self
    }
}

/// Anything a quad can be textured with.
pub trait TextureSource {
    fn handle(&self) -> ResourceHandle;

    /// Pixel size as `(width, height)`.
    fn size(&self) -> (u32, u32);
}

/// An owned, registry-tracked RGBA8 texture.
///
/// Release it with [`dispose`](Self::dispose) on the affinity thread. A
/// texture dropped without `dispose` (on any thread) is reported as a leak and
/// released at the context's next tick instead.
#[derive(Debug)]
pub struct Texture {
    handle: ResourceHandle,
    width: u32,
    height: u32,
    params: TextureParams,
    disposal: DisposalSender,
    released: bool,
}

impl Texture {
    fn create(
        ctx: &mut GpuContext,
        kind: ResourceKind,
        width: u32,
        height: u32,
        params: TextureParams,
        pixels: Option<&[u8]>,
    ) -> Result<Self> {
        let desc = TextureDesc {
            width,
            height,
            filter: params.filter,
            mipmaps: params.mipmaps,
            render_target: kind == ResourceKind::RenderTarget,
        };
        let handle = ctx.create_resource(kind, desc, pixels)?;
        Ok(Self {
            handle,
            width,
            height,
            params,
            disposal: ctx.disposal_sender(),
            released: false,
        })
    }

    /// Decodes an encoded image (PNG, QOI).
    pub fn from_bytes(ctx: &mut GpuContext, data: &[u8], params: TextureParams) -> Result<Self> {
        ctx.check_thread()?;
        let image = image::load_from_memory(data)?.to_rgba8();
        let (width, height) = image.dimensions();
        Self::from_rgba(ctx, width, height, image.as_raw(), params)
    }

    /// Reads `reader` to the end and decodes it like [`from_bytes`](Self::from_bytes).
    pub fn from_stream<R: Read>(ctx: &mut GpuContext, mut reader: R, params: TextureParams) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(ctx, &data, params)
    }

    /// Creates a texture from tightly packed RGBA8 pixels.
    pub fn from_rgba(
        ctx: &mut GpuContext,
        width: u32,
        height: u32,
        pixels: &[u8],
        params: TextureParams,
    ) -> Result<Self> {
        Self::create(ctx, ResourceKind::Texture, width, height, params, Some(pixels))
    }

    /// Creates a transparent black texture.
    pub fn empty(ctx: &mut GpuContext, width: u32, height: u32, params: TextureParams) -> Result<Self> {
        Self::create(ctx, ResourceKind::Texture, width, height, params, None)
    }

    /// A 1x1 opaque white texture, for untextured quads.
    pub fn white_pixel(ctx: &mut GpuContext) -> Result<Self> {
        Self::from_rgba(ctx, 1, 1, &[255; 4], TextureParams::pixelated())
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn params(&self) -> TextureParams {
        self.params
    }

    /// Overwrites `region` with tightly packed RGBA8 `pixels`.
    pub fn set_data(&self, ctx: &mut GpuContext, region: Region, pixels: &[u8]) -> Result<()> {
        ctx.write_resource(self.handle, region, pixels)
    }

    /// Overwrites the whole texture.
    pub fn set_pixels(&self, ctx: &mut GpuContext, pixels: &[u8]) -> Result<()> {
        self.set_data(ctx, Region::full(self.width, self.height), pixels)
    }

    /// Reads the texture back as tightly packed RGBA8.
    pub fn get_data(&self, ctx: &mut GpuContext) -> Result<Vec<u8>> {
        ctx.read_resource(self.handle)
    }

    pub fn set_filter(&mut self, ctx: &mut GpuContext, filter: FilterMode) -> Result<()> {
        ctx.set_resource_filter(self.handle, filter)?;
        self.params.filter = filter;
        Ok(())
    }

    /// Releases the GPU texture now.
    ///
    /// On failure (wrong thread) the release falls back to the disposal queue.
    pub fn dispose(mut self, ctx: &mut GpuContext) -> Result<()> {
        ctx.release_resource(self.handle)?;
        self.released = true;
        Ok(())
    }
}

impl TextureSource for Texture {
    #[inline]
    fn handle(&self) -> ResourceHandle {
        self.handle
    }

    #[inline]
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "texture {:?} ({}x{}) dropped without dispose; deferring release",
            self.handle,
            self.width,
            self.height
        );
        self.disposal
            .enqueue(DisposalRequest::ReleaseResource(self.handle));
    }
}

/// A texture that can also be drawn into.
#[derive(Debug)]
pub struct RenderTarget {
    texture: Texture,
}

impl RenderTarget {
    pub fn new(ctx: &mut GpuContext, width: u32, height: u32) -> Result<Self> {
        Self::with_params(ctx, width, height, TextureParams::smooth())
    }

    /// Render targets never carry mipmaps; `params.mipmaps` is ignored.
    pub fn with_params(ctx: &mut GpuContext, width: u32, height: u32, params: TextureParams) -> Result<Self> {
        let texture = Texture::create(
            ctx,
            ResourceKind::RenderTarget,
            width,
            height,
            params.with_mipmaps(false),
            None,
        )?;
        Ok(Self { texture })
    }

    /// Makes this target the destination of clears and draws.
    ///
    /// Fails while any batch is open.
    pub fn bind(&self, ctx: &mut GpuContext) -> Result<()> {
        ctx.bind_target(Some(self.texture.handle))
    }

    /// Returns drawing to the frame.
    pub fn unbind(&self, ctx: &mut GpuContext) -> Result<()> {
        ctx.bind_target(None)
    }

    pub fn is_bound(&self, ctx: &GpuContext) -> bool {
        ctx.bound_target() == Some(self.texture.handle)
    }

    #[inline]
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    #[inline]
    pub fn texture_mut(&mut self) -> &mut Texture {
        &mut self.texture
    }

    pub fn dispose(self, ctx: &mut GpuContext) -> Result<()> {
        self.texture.dispose(ctx)
    }
}

impl TextureSource for RenderTarget {
    #[inline]
    fn handle(&self) -> ResourceHandle {
        self.texture.handle
    }

    #[inline]
    fn size(&self) -> (u32, u32) {
        self.texture.size()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::error::{UsageError, VellumError};
    use crate::gpu::context::testing::fixture;
    use crate::paint::Color;

    fn encode_png(width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
        let image = image::RgbaImage::from_raw(width, height, pixels.to_vec()).unwrap();
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    // ── creation ─────────────────────────────────────────────────────────

    #[test]
    fn decodes_png_bytes_and_streams() {
        let mut f = fixture();
        let pixels: Vec<u8> = (0..2 * 3 * 4).map(|i| i as u8 * 10).collect();
        let png = encode_png(2, 3, &pixels);

        let a = Texture::from_bytes(&mut f.ctx, &png, TextureParams::default()).unwrap();
        assert_eq!((a.width(), a.height()), (2, 3));
        assert_eq!(a.get_data(&mut f.ctx).unwrap(), pixels);

        let b = Texture::from_stream(&mut f.ctx, Cursor::new(png), TextureParams::pixelated()).unwrap();
        assert_eq!(b.get_data(&mut f.ctx).unwrap(), pixels);
        assert_eq!(b.params().filter, FilterMode::Pixelated);

        a.dispose(&mut f.ctx).unwrap();
        b.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let mut f = fixture();
        let err = Texture::from_bytes(&mut f.ctx, b"not an image", TextureParams::default()).unwrap_err();
        assert!(matches!(err, VellumError::ImageDecode(_)));
        assert_eq!(f.probe.live_textures(), 0);
    }

    #[test]
    fn zero_sized_texture_is_rejected() {
        let mut f = fixture();
        let err = Texture::empty(&mut f.ctx, 0, 4, TextureParams::default()).unwrap_err();
        assert!(matches!(
            err,
            VellumError::Usage(UsageError::ZeroSizedTexture { width: 0, height: 4 })
        ));
    }

    #[test]
    fn allocation_failure_surfaces() {
        let mut f = fixture();
        f.probe.fail_next_creations(1);
        let err = Texture::empty(&mut f.ctx, 8, 8, TextureParams::default()).unwrap_err();
        assert!(matches!(err, VellumError::ResourceCreation { .. }));
        assert!(f.ctx.registry().is_empty());
    }

    #[test]
    fn white_pixel_is_opaque_white() {
        let mut f = fixture();
        let t = Texture::white_pixel(&mut f.ctx).unwrap();
        assert_eq!(t.get_data(&mut f.ctx).unwrap(), vec![255; 4]);
        t.dispose(&mut f.ctx).unwrap();
    }

    // ── data ─────────────────────────────────────────────────────────────

    #[test]
    fn set_data_writes_sub_region() {
        let mut f = fixture();
        let t = Texture::empty(&mut f.ctx, 2, 2, TextureParams::default()).unwrap();
        t.set_data(&mut f.ctx, Region::new(1, 0, 1, 2), &[7; 8]).unwrap();

        let px = t.get_data(&mut f.ctx).unwrap();
        assert_eq!(&px[0..4], &[0; 4]);
        assert_eq!(&px[4..8], &[7; 4]);
        assert_eq!(&px[8..12], &[0; 4]);
        assert_eq!(&px[12..16], &[7; 4]);
        t.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn set_data_checks_bounds_and_length() {
        let mut f = fixture();
        let t = Texture::empty(&mut f.ctx, 2, 2, TextureParams::default()).unwrap();

        assert!(matches!(
            t.set_data(&mut f.ctx, Region::new(1, 1, 2, 1), &[0; 8]),
            Err(VellumError::Usage(UsageError::RegionOutOfBounds { .. }))
        ));
        assert!(matches!(
            t.set_pixels(&mut f.ctx, &[0; 15]),
            Err(VellumError::Usage(UsageError::PixelLengthMismatch {
                expected: 16,
                actual: 15
            }))
        ));
        t.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn filter_change_reaches_backend() {
        let mut f = fixture();
        let mut t = Texture::white_pixel(&mut f.ctx).unwrap();
        t.set_filter(&mut f.ctx, FilterMode::Smooth).unwrap();

        let (id, desc) = f.ctx.resolve(t.handle()).unwrap();
        assert_eq!(desc.filter, FilterMode::Smooth);
        assert_eq!(f.probe.texture_desc(id).unwrap().filter, FilterMode::Smooth);
        t.dispose(&mut f.ctx).unwrap();
    }

    // ── lifetime ─────────────────────────────────────────────────────────

    #[test]
    fn dispose_releases_immediately() {
        let mut f = fixture();
        let t = Texture::white_pixel(&mut f.ctx).unwrap();
        let handle = t.handle();
        t.dispose(&mut f.ctx).unwrap();

        assert_eq!(f.probe.live_textures(), 0);
        assert_eq!(f.ctx.tick(std::time::Duration::ZERO).unwrap().disposed, 0);
        assert!(matches!(
            f.ctx.resolve(handle),
            Err(VellumError::Usage(UsageError::ResourceReleased(_)))
        ));
    }

    #[test]
    fn drop_without_dispose_defers_release() {
        let mut f = fixture();
        drop(Texture::white_pixel(&mut f.ctx).unwrap());
        assert_eq!(f.probe.live_textures(), 1);

        assert_eq!(f.ctx.tick(std::time::Duration::ZERO).unwrap().disposed, 1);
        assert_eq!(f.probe.live_textures(), 0);
    }

    // ── render targets ───────────────────────────────────────────────────

    #[test]
    fn render_target_receives_clears_while_bound() {
        let mut f = fixture();
        let rt = RenderTarget::new(&mut f.ctx, 1, 1).unwrap();

        rt.bind(&mut f.ctx).unwrap();
        assert!(rt.is_bound(&f.ctx));
        f.ctx.clear(Color::GREEN).unwrap();
        rt.unbind(&mut f.ctx).unwrap();
        f.ctx.clear(Color::RED).unwrap();

        assert_eq!(rt.texture().get_data(&mut f.ctx).unwrap(), vec![0, 255, 0, 255]);
        rt.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn plain_texture_cannot_be_bound_as_target() {
        let mut f = fixture();
        let t = Texture::white_pixel(&mut f.ctx).unwrap();
        assert!(matches!(
            f.ctx.bind_target(Some(t.handle())),
            Err(VellumError::Usage(UsageError::NotARenderTarget(_)))
        ));
        t.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn disposing_bound_target_returns_to_frame() {
        let mut f = fixture();
        let rt = RenderTarget::new(&mut f.ctx, 4, 4).unwrap();
        rt.bind(&mut f.ctx).unwrap();
        rt.dispose(&mut f.ctx).unwrap();

        assert_eq!(f.ctx.bound_target(), None);
        f.ctx.clear(Color::BLACK).unwrap();
    }
}
