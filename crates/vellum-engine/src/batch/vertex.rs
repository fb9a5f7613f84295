use bytemuck::{Pod, Zeroable};

use crate::coords::Vec2;
use crate::paint::Color;

// ── line vertex ───────────────────────────────────────────────────────────

/// One end of a line. Lines are stored as consecutive start/end pairs.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct LineVertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
}

impl LineVertex {
    #[inline]
    pub fn new(position: Vec2, color: Color) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
        }
    }
}

// ── quad vertex ───────────────────────────────────────────────────────────

/// Textured, tinted vertex.
///
/// `tex_slot` is the physical texture unit assigned for the current batch
/// epoch; the flush binds the matching textures in slot order.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coord: [f32; 2],
    pub color: [f32; 4],
    pub tex_slot: u32,
}

impl QuadVertex {
    #[inline]
    pub fn new(position: Vec2, tex_coord: Vec2, color: Color, tex_slot: u32) -> Self {
        Self {
            position: position.to_array(),
            tex_coord: tex_coord.to_array(),
            color: color.to_array(),
            tex_slot,
        }
    }
}

/// Vertex order of a quad: top-left, top-right, bottom-left, bottom-right.
pub const QUAD_VERTEX_COUNT: usize = 4;

/// Two counter-clockwise triangles over [`QUAD_VERTEX_COUNT`] vertices.
///
/// Winding depends only on this table, never on flips or rotation.
pub const QUAD_INDICES: [u16; 6] = [0, 2, 1, 2, 3, 1];
