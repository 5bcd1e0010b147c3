//! Bound pipeline state
//!
//! A [`Context`] is the resolved description of everything a draw reads:
//! shaders, vertex streams, fixed-function rasterization and blend state, and
//! the current render targets. The renderer distills it into the three stage
//! state keys; the context itself is never stored by the core beyond the
//! draws that reference it.

use crate::api::{Buffer, DescriptorSet, ImageView, PipelineLayout};
use crate::pipeline::constants::{
    MAX_COLOR_ATTACHMENTS, MAX_VERTEX_INPUTS, PUSH_CONSTANT_BYTES,
};
use crate::pipeline::shader::ShaderModule;
use ash::vk;
use std::sync::Arc;

/// One bound vertex input stream
#[derive(Debug, Clone, Copy)]
pub struct Stream {
    /// Element pointer (null when unbound)
    pub buffer: *const u8,
    /// Bytes between consecutive elements
    pub stride: u32,
    /// Bytes to advance per instance for instance-rate streams (0 = vertex rate)
    pub instance_stride: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Elements addressable through the stream
    pub count: u32,
}

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Default for Stream {
    fn default() -> Self {
        Self {
            buffer: std::ptr::null(),
            stride: 0,
            instance_stride: 0,
            format: vk::Format::UNDEFINED,
            count: 0,
        }
    }
}

/// Per-face stencil configuration
#[derive(Debug, Clone, Copy)]
pub struct StencilOpState {
    /// Operation on stencil fail
    pub fail_op: vk::StencilOp,
    /// Operation on stencil and depth pass
    pub pass_op: vk::StencilOp,
    /// Operation on stencil pass, depth fail
    pub depth_fail_op: vk::StencilOp,
    /// Stencil compare operator
    pub compare_op: vk::CompareOp,
    /// Compare mask
    pub compare_mask: u32,
    /// Write mask
    pub write_mask: u32,
    /// Reference value
    pub reference: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0,
        }
    }
}

/// Per-attachment blend configuration
#[derive(Debug, Clone, Copy)]
pub struct BlendState {
    /// Whether blending is enabled for the attachment
    pub enable: bool,
    /// Source color factor
    pub src_factor: vk::BlendFactor,
    /// Destination color factor
    pub dst_factor: vk::BlendFactor,
    /// Color blend operation
    pub op: vk::BlendOp,
    /// Source alpha factor
    pub src_alpha_factor: vk::BlendFactor,
    /// Destination alpha factor
    pub dst_alpha_factor: vk::BlendFactor,
    /// Alpha blend operation
    pub alpha_op: vk::BlendOp,
    /// Component write mask (bit 0 = r .. bit 3 = a)
    pub write_mask: u32,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            src_factor: vk::BlendFactor::ONE,
            dst_factor: vk::BlendFactor::ZERO,
            op: vk::BlendOp::ADD,
            src_alpha_factor: vk::BlendFactor::ONE,
            dst_alpha_factor: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: 0xF,
        }
    }
}

/// The resolved pipeline state a draw executes against
#[derive(Clone)]
pub struct Context {
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Vertex stage shader
    pub vertex_shader: Arc<ShaderModule>,
    /// Pixel stage shader (required unless the rasterizer discards)
    pub pixel_shader: Option<Arc<ShaderModule>>,
    /// Pipeline layout identity
    pub pipeline_layout: PipelineLayout,
    /// Bound descriptor set (set 0)
    pub descriptor_set: DescriptorSet,
    /// Push-constant bytes
    pub push_constants: [u8; PUSH_CONSTANT_BYTES],
    /// Vertex input streams
    pub input: [Stream; MAX_VERTEX_INPUTS],
    /// Bound index buffer, if the draw is indexed
    pub index_buffer: Option<Buffer>,
    /// Robust out-of-range vertex fetches clamp instead of trapping
    pub robust_buffer_access: bool,

    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Which winding is front-facing
    pub front_face: vk::FrontFace,
    /// Skip rasterization and pixel work entirely
    pub rasterizer_discard: bool,
    /// Line width in pixels
    pub line_width: f32,
    /// Constant depth bias added to minDepth for triangle draws
    pub depth_bias: f32,
    /// Slope-scaled depth bias factor
    pub slope_depth_bias: f32,
    /// Rasterization samples (1 or 4)
    pub sample_count: u32,
    /// Sample mask; an all-zero mask skips the draw
    pub multi_sample_mask: u32,

    /// Depth test enable
    pub depth_test_enable: bool,
    /// Depth write enable
    pub depth_write_enable: bool,
    /// Depth compare operator
    pub depth_compare_op: vk::CompareOp,
    /// Stencil test enable
    pub stencil_test_enable: bool,
    /// Front-face stencil state
    pub front_stencil: StencilOpState,
    /// Back-face stencil state
    pub back_stencil: StencilOpState,
    /// Alpha-to-coverage enable (requires 4× sampling)
    pub alpha_to_coverage: bool,

    /// Bound color attachments
    pub color_targets: [Option<Arc<ImageView>>; MAX_COLOR_ATTACHMENTS],
    /// Per-attachment blend state
    pub blend: [BlendState; MAX_COLOR_ATTACHMENTS],
    /// Bound depth attachment
    pub depth_target: Option<Arc<ImageView>>,
    /// Bound stencil attachment
    pub stencil_target: Option<Arc<ImageView>>,

    /// Instance index for the current draw
    pub instance_id: i32,
}

impl Context {
    /// A context with nothing bound; callers fill in what the draw needs
    pub fn new(vertex_shader: Arc<ShaderModule>) -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            vertex_shader,
            pixel_shader: None,
            pipeline_layout: PipelineLayout::new(),
            descriptor_set: DescriptorSet::new(),
            push_constants: [0; PUSH_CONSTANT_BYTES],
            input: [Stream::default(); MAX_VERTEX_INPUTS],
            index_buffer: None,
            robust_buffer_access: false,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            rasterizer_discard: false,
            line_width: 1.0,
            depth_bias: 0.0,
            slope_depth_bias: 0.0,
            sample_count: 1,
            multi_sample_mask: 1,
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: vk::CompareOp::LESS,
            stencil_test_enable: false,
            front_stencil: StencilOpState::default(),
            back_stencil: StencilOpState::default(),
            alpha_to_coverage: false,
            color_targets: Default::default(),
            blend: [BlendState::default(); MAX_COLOR_ATTACHMENTS],
            depth_target: None,
            stencil_target: None,
            instance_id: 0,
        }
    }

    /// Whether the topology rasterizes triangles
    pub fn is_draw_triangle(&self) -> bool {
        matches!(
            self.topology,
            vk::PrimitiveTopology::TRIANGLE_LIST
                | vk::PrimitiveTopology::TRIANGLE_STRIP
                | vk::PrimitiveTopology::TRIANGLE_FAN
        )
    }

    /// Whether the topology rasterizes lines
    pub fn is_draw_line(&self) -> bool {
        matches!(
            self.topology,
            vk::PrimitiveTopology::LINE_LIST | vk::PrimitiveTopology::LINE_STRIP
        )
    }

    /// Whether the topology rasterizes points
    pub fn is_draw_point(&self) -> bool {
        self.topology == vk::PrimitiveTopology::POINT_LIST
    }

    /// Primitives described by `count` vertices under the bound topology
    pub fn primitive_count(&self, vertex_count: u32) -> u32 {
        match self.topology {
            vk::PrimitiveTopology::POINT_LIST => vertex_count,
            vk::PrimitiveTopology::LINE_LIST => vertex_count / 2,
            vk::PrimitiveTopology::LINE_STRIP => vertex_count.saturating_sub(1),
            vk::PrimitiveTopology::TRIANGLE_LIST => vertex_count / 3,
            vk::PrimitiveTopology::TRIANGLE_STRIP | vk::PrimitiveTopology::TRIANGLE_FAN => {
                vertex_count.saturating_sub(2)
            }
            _ => 0,
        }
    }
}
