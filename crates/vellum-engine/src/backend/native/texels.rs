//! Texel uploads, read-back and CPU mip generation.

use crate::coords::Region;
use crate::error::{Result, VellumError};

const BYTES_PER_PIXEL: u32 = 4;

/// Uploads tightly packed RGBA8 `pixels` into `region` of `mip_level`.
pub(super) fn upload(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    mip_level: u32,
    region: Region,
    pixels: &[u8],
) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level,
            origin: wgpu::Origin3d {
                x: region.x,
                y: region.y,
                z: 0,
            },
            aspect: wgpu::TextureAspect::All,
        },
        pixels,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(region.width * BYTES_PER_PIXEL),
            rows_per_image: Some(region.height),
        },
        wgpu::Extent3d {
            width: region.width,
            height: region.height,
            depth_or_array_layers: 1,
        },
    );
}

/// Uploads mip levels `1..level_count` derived from `base` by box filtering.
pub(super) fn upload_mip_chain(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    base: &[u8],
    width: u32,
    height: u32,
    level_count: u32,
) {
    let mut level = (base.to_vec(), width, height);
    for mip in 1..level_count {
        level = downsample(&level.0, level.1, level.2);
        upload(queue, texture, mip, Region::full(level.1, level.2), &level.0);
    }
}

/// Halves an RGBA8 image, averaging each 2x2 block. Odd edges repeat the
/// last row or column.
pub(super) fn downsample(src: &[u8], width: u32, height: u32) -> (Vec<u8>, u32, u32) {
    let (w, h) = (width as usize, height as usize);
    let (dw, dh) = ((w / 2).max(1), (h / 2).max(1));
    let mut out = Vec::with_capacity(dw * dh * 4);

    for y in 0..dh {
        let (y0, y1) = ((y * 2).min(h - 1), (y * 2 + 1).min(h - 1));
        for x in 0..dw {
            let (x0, x1) = ((x * 2).min(w - 1), (x * 2 + 1).min(w - 1));
            for c in 0..4 {
                let sum: u32 = [(x0, y0), (x1, y0), (x0, y1), (x1, y1)]
                    .iter()
                    .map(|&(sx, sy)| u32::from(src[(sy * w + sx) * 4 + c]))
                    .sum();
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    (out, dw as u32, dh as u32)
}

/// Byte order of an 8-bit four-channel color format.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum ChannelOrder {
    Rgba,
    Bgra,
}

impl ChannelOrder {
    /// `None` for formats that are not 8 bits per channel.
    pub fn of(format: wgpu::TextureFormat) -> Option<Self> {
        use wgpu::TextureFormat as F;
        match format {
            F::Rgba8Unorm | F::Rgba8UnormSrgb => Some(Self::Rgba),
            F::Bgra8Unorm | F::Bgra8UnormSrgb => Some(Self::Bgra),
            _ => None,
        }
    }
}

/// Converts BGRA8 pixels to RGBA8 in place.
pub(super) fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}

/// Row pitch of a texture-to-buffer copy.
fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Copies mip level 0 to a staging buffer and returns it tightly packed.
///
/// Blocks until the GPU has finished every command submitted so far.
pub(super) fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let padded = padded_bytes_per_row(width);
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("vellum readback staging"),
        size: u64::from(padded) * u64::from(height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("vellum readback encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = flume::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });

    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| VellumError::Snapshot {
            reason: format!("device poll failed: {e}"),
        })?;

    match rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(VellumError::Snapshot {
                reason: format!("buffer map failed: {e}"),
            });
        }
        Err(_) => {
            return Err(VellumError::Snapshot {
                reason: "buffer map callback never ran".to_string(),
            });
        }
    }

    let row = (width * BYTES_PER_PIXEL) as usize;
    let mut pixels = Vec::with_capacity(row * height as usize);
    {
        let mapped = slice.get_mapped_range();
        for chunk in mapped.chunks_exact(padded as usize) {
            pixels.extend_from_slice(&chunk[..row]);
        }
    }
    staging.unmap();
    Ok(pixels)
}
