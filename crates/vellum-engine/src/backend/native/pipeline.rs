//! Render pipelines, bind group layouts and the shared uniform block.

use bytemuck::{Pod, Zeroable};

use crate::backend::FilterMode;
use crate::batch::{LineVertex, QuadVertex};

/// Texture units the quad shader declares.
pub(super) const QUAD_TEXTURE_UNITS: usize = 8;

/// Format of every texture and render target the backend creates.
pub(super) const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

// ── blend ─────────────────────────────────────────────────────────────────

fn premul_alpha_blend() -> wgpu::BlendState {
    wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
            operation: wgpu::BlendOperation::Add,
        },
        alpha: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
            operation: wgpu::BlendOperation::Add,
        },
    }
}

// ── uniform block ─────────────────────────────────────────────────────────

/// Mirrors `Globals` in both shaders.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub(super) struct Globals {
    pub viewport: [f32; 2],
    pub thickness: f32,
    pub _pad: f32,
    /// Non-zero when the texture in that slot samples nearest-neighbour.
    pub pixelated: [[u32; 4]; 2],
}

impl Globals {
    pub fn new(target_size: (u32, u32)) -> Self {
        Self {
            viewport: [target_size.0.max(1) as f32, target_size.1.max(1) as f32],
            ..Self::default()
        }
    }

    pub fn with_thickness(mut self, thickness: f32) -> Self {
        self.thickness = thickness;
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = FilterMode>) -> Self {
        for (slot, filter) in filters.into_iter().take(QUAD_TEXTURE_UNITS).enumerate() {
            self.pixelated[slot / 4][slot % 4] = u32::from(filter == FilterMode::Pixelated);
        }
        self
    }
}

fn globals_min_binding_size() -> Option<std::num::NonZeroU64> {
    std::num::NonZeroU64::new(std::mem::size_of::<Globals>() as u64)
}

// ── vertex layouts ────────────────────────────────────────────────────────

/// One instance per line: a start/end vertex pair read as a single element.
const LINE_ATTRS: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x2,
    1 => Float32x4,
    2 => Float32x2,
    3 => Float32x4,
];

fn line_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: 2 * std::mem::size_of::<LineVertex>() as u64,
        step_mode: wgpu::VertexStepMode::Instance,
        attributes: &LINE_ATTRS,
    }
}

const QUAD_ATTRS: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x2,
    1 => Float32x2,
    2 => Float32x4,
    3 => Uint32,
];

fn quad_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<QuadVertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &QUAD_ATTRS,
    }
}

// ── layouts ───────────────────────────────────────────────────────────────

/// Bind group layouts shared by every pipeline format.
pub(super) struct Layouts {
    pub lines: wgpu::BindGroupLayout,
    pub quads: wgpu::BindGroupLayout,
}

impl Layouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let globals = |visibility| wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: globals_min_binding_size(),
            },
            count: None,
        };

        let lines = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("vellum line bgl"),
            entries: &[globals(wgpu::ShaderStages::VERTEX)],
        });

        let mut entries = vec![globals(wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT)];
        for binding in [1, 2] {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        for slot in 0..QUAD_TEXTURE_UNITS as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 3 + slot,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
        let quads = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("vellum quad bgl"),
            entries: &entries,
        });

        Self { lines, quads }
    }
}

// ── pipelines ─────────────────────────────────────────────────────────────

/// Line and quad pipelines for one color target format.
pub(super) struct Pipelines {
    pub format: wgpu::TextureFormat,
    pub lines: wgpu::RenderPipeline,
    pub quads: wgpu::RenderPipeline,
}

impl Pipelines {
    pub fn new(device: &wgpu::Device, layouts: &Layouts, format: wgpu::TextureFormat) -> Self {
        let lines = build(
            device,
            "line",
            include_str!("shaders/line.wgsl"),
            &layouts.lines,
            line_layout(),
            format,
        );
        let quads = build(
            device,
            "quad",
            include_str!("shaders/quad.wgsl"),
            &layouts.quads,
            quad_layout(),
            format,
        );
        Self { format, lines, quads }
    }
}

fn build(
    device: &wgpu::Device,
    name: &str,
    source: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
    vertex_layout: wgpu::VertexBufferLayout<'static>,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("vellum {name} shader")),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("vellum {name} pipeline layout")),
        bind_group_layouts: &[bind_group_layout],
        immediate_size: 0,
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&format!("vellum {name} pipeline ({format:?})")),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[vertex_layout],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(premul_alpha_blend()),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

// ── samplers ──────────────────────────────────────────────────────────────

pub(super) fn sampler(device: &wgpu::Device, filter: FilterMode) -> wgpu::Sampler {
    let (filter, mipmap_filter, label) = match filter {
        FilterMode::Smooth => (
            wgpu::FilterMode::Linear,
            wgpu::MipmapFilterMode::Linear,
            "vellum smooth sampler",
        ),
        FilterMode::Pixelated => (
            wgpu::FilterMode::Nearest,
            wgpu::MipmapFilterMode::Nearest,
            "vellum pixelated sampler",
        ),
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_match_shader_block_size() {
        assert_eq!(std::mem::size_of::<Globals>(), 48);
    }

    #[test]
    fn filters_pack_four_slots_per_row() {
        let g = Globals::new((640, 0)).with_filters([
            FilterMode::Smooth,
            FilterMode::Pixelated,
            FilterMode::Smooth,
            FilterMode::Smooth,
            FilterMode::Pixelated,
        ]);
        assert_eq!(g.viewport, [640.0, 1.0]);
        assert_eq!(g.pixelated, [[0, 1, 0, 0], [1, 0, 0, 0]]);
    }

    #[test]
    fn line_instance_spans_two_vertices() {
        let layout = line_layout();
        assert_eq!(layout.array_stride, 48);
        assert_eq!(layout.attributes[2].offset, 24);
    }
}
