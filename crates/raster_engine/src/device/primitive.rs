//! Plain-old-data records shared with generated code
//!
//! Every struct here is `#[repr(C)]`: generated routines address fields by
//! compile-time offset. Host code owns construction and lifetime; routines
//! only read and write through pointers passed per call.

use crate::api::image::SampledImageDescriptor;
use crate::pipeline::constants::{
    CLUSTER_COUNT, MAX_CLIPPED_VERTICES, MAX_COLOR_ATTACHMENTS, MAX_IMAGE_BINDINGS, MAX_VARYINGS,
    MAX_VERTEX_INPUTS, PUSH_CONSTANT_BYTES, VERTEX_CACHE_SIZE,
};
use bitflags::bitflags;

bitflags! {
    /// Per-vertex frustum summary: which half-spaces the vertex violates,
    /// plus a finite-coordinates bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClipFlags: u32 {
        /// x < -w
        const MIN_X = 0x01;
        /// x > w
        const MAX_X = 0x02;
        /// y < -w
        const MIN_Y = 0x04;
        /// y > w
        const MAX_Y = 0x08;
        /// z < 0
        const MIN_Z = 0x10;
        /// z > w
        const MAX_Z = 0x20;
        /// All four coordinates are finite
        const FINITE = 0x80;
    }
}

/// Output record of the vertex routine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TransformedVertex {
    /// Clip-space position
    pub position: [f32; 4],
    /// [`ClipFlags`] bits
    pub clip_flags: u32,
    /// Point size written by the shader (1.0 when not written)
    pub point_size: f32,
    /// Window x in 12.4 fixed point
    pub projected_x: i32,
    /// Window y in 12.4 fixed point
    pub projected_y: i32,
    /// Shader varyings
    pub varyings: [[f32; 4]; MAX_VARYINGS],
}

impl Default for TransformedVertex {
    fn default() -> Self {
        Self {
            position: [0.0; 4],
            clip_flags: 0,
            point_size: 1.0,
            projected_x: 0,
            projected_y: 0,
            varyings: [[0.0; 4]; MAX_VARYINGS],
        }
    }
}

/// Three consecutive transformed vertices forming one primitive record.
/// Lines use v0/v1, points use v0; the vertex routine always writes three.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Triangle {
    /// First vertex
    pub v0: TransformedVertex,
    /// Second vertex
    pub v1: TransformedVertex,
    /// Third vertex
    pub v2: TransformedVertex,
}

/// Screen-space interpolation plane: `value(x, y) = a·x + b·y + c`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Plane {
    /// x gradient
    pub a: f32,
    /// y gradient
    pub b: f32,
    /// constant term
    pub c: f32,
}

/// Rasterizer-ready primitive produced by the setup routine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Primitive {
    /// Inclusive pixel bounds, clamped to the scissor
    pub min_x: i32,
    /// Exclusive pixel bounds
    pub max_x: i32,
    /// Inclusive pixel bounds
    pub min_y: i32,
    /// Exclusive pixel bounds
    pub max_y: i32,
    /// Number of live edge equations
    pub edge_count: i32,
    /// 1 when front-facing (always 1 for lines and points)
    pub facing: i32,
    /// Edge half-space equations; a pixel center is covered when every live
    /// edge evaluates non-negative (top-left bias folded into `c`)
    pub edges: [Plane; MAX_CLIPPED_VERTICES],
    /// Interpolates 1/w
    pub w_plane: Plane,
    /// Interpolates window z (bias already applied)
    pub z_plane: Plane,
    /// Interpolates varying · (1/w) per component
    pub varying_planes: [[Plane; 4]; MAX_VARYINGS],
}

impl Default for Primitive {
    fn default() -> Self {
        Self {
            min_x: 0,
            max_x: 0,
            min_y: 0,
            max_y: 0,
            edge_count: 0,
            facing: 1,
            edges: [Plane::default(); MAX_CLIPPED_VERTICES],
            w_plane: Plane::default(),
            z_plane: Plane::default(),
            varying_planes: [[Plane::default(); 4]; MAX_VARYINGS],
        }
    }
}

/// A possibly-clipped convex polygon in homogeneous clip space
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Polygon {
    /// Vertex positions
    pub vertices: [[f32; 4]; MAX_CLIPPED_VERTICES],
    /// Live vertex count (0 or 3..=MAX_CLIPPED_VERTICES for rasterizable)
    pub count: i32,
}

impl Default for Polygon {
    fn default() -> Self {
        Self {
            vertices: [[0.0; 4]; MAX_CLIPPED_VERTICES],
            count: 0,
        }
    }
}

impl Polygon {
    /// Builds a polygon from a vertex slice
    pub fn from_slice(vertices: &[[f32; 4]]) -> Self {
        assert!(vertices.len() <= MAX_CLIPPED_VERTICES);
        let mut polygon = Self::default();
        polygon.vertices[..vertices.len()].copy_from_slice(vertices);
        polygon.count = vertices.len() as i32;
        polygon
    }

    /// The live vertices
    pub fn vertices(&self) -> &[[f32; 4]] {
        &self.vertices[..self.count as usize]
    }
}

/// Direct-mapped cache from vertex index to transformed vertex, valid only
/// within the draw identified by `draw_call`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VertexCache {
    /// Owning draw id; a mismatch invalidates the whole cache
    pub draw_call: u64,
    /// Index tags (`u32::MAX` = empty)
    pub tags: [u32; VERTEX_CACHE_SIZE],
    /// Cached records
    pub vertices: [TransformedVertex; VERTEX_CACHE_SIZE],
}

impl Default for VertexCache {
    fn default() -> Self {
        Self {
            draw_call: u64::MAX,
            tags: [u32::MAX; VERTEX_CACHE_SIZE],
            vertices: [TransformedVertex::default(); VERTEX_CACHE_SIZE],
        }
    }
}

impl VertexCache {
    /// Empties the cache
    pub fn clear(&mut self) {
        self.tags = [u32::MAX; VERTEX_CACHE_SIZE];
    }
}

/// Per-batch input block of the vertex routine
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VertexTask {
    /// First primitive of the batch within the draw
    pub primitive_start: u32,
    /// Vertices to process (three per primitive record)
    pub vertex_count: u32,
    /// The batch's vertex cache
    pub vertex_cache: VertexCache,
}

impl Default for VertexTask {
    fn default() -> Self {
        Self {
            primitive_start: 0,
            vertex_count: 0,
            vertex_cache: VertexCache::default(),
        }
    }
}

/// One bound vertex input stream as generated code sees it
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VertexInputStream {
    /// Element pointer (null when the stream is unbound)
    pub buffer: *const u8,
    /// Bytes between consecutive elements
    pub stride: i32,
    /// Elements addressable through the stream (for robust clamping)
    pub count: i32,
}

impl Default for VertexInputStream {
    fn default() -> Self {
        Self {
            buffer: std::ptr::null(),
            stride: 0,
            count: 0,
        }
    }
}

/// Front or back stencil runtime values
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StencilData {
    /// Reference value
    pub reference: i32,
    /// Compare mask
    pub compare_mask: i32,
    /// Write mask
    pub write_mask: i32,
    /// Padding for even i32 count
    pub reserved: i32,
}

/// The per-draw block read by all three emitted routines.
///
/// Produced freshly for each draw and read-only during execution, except the
/// per-cluster occlusion counters, which the owning cluster task increments.
#[repr(C)]
pub struct DrawData {
    /// Bound vertex streams
    pub input: [VertexInputStream; MAX_VERTEX_INPUTS],
    /// Index buffer (already widened to u32 per batch by the host)
    pub indices: *const u8,
    /// Instance index visible to shaders
    pub instance_id: i32,
    /// Base vertex added to indices by the host
    pub base_vertex: i32,

    /// Push-constant bytes
    pub push_constants: [u8; PUSH_CONSTANT_BYTES],
    /// Image descriptors resolved from the bound descriptor set
    pub image_descriptors: [SampledImageDescriptor; MAX_IMAGE_BINDINGS],

    /// Window transform: x_window = x_ndc · viewport_scale[0] + viewport_offset[0]
    pub viewport_scale: [f32; 2],
    /// See `viewport_scale`
    pub viewport_offset: [f32; 2],
    /// Half-pixel in NDC units, used by point expansion
    pub half_pixel: [f32; 2],
    /// minDepth, plus the constant depth bias for triangle draws
    pub depth_near: f32,
    /// maxDepth − minDepth
    pub depth_range: f32,
    /// Slope-scaled depth bias factor
    pub slope_depth_bias: f32,
    /// Line width in pixels
    pub line_width: f32,

    /// Front-facing stencil values
    pub stencil_front: StencilData,
    /// Back-facing stencil values
    pub stencil_back: StencilData,

    /// Alpha-to-coverage thresholds (4× only)
    pub a2c: [f32; 4],

    /// Color attachment base pointers
    pub color_buffer: [*mut u8; MAX_COLOR_ATTACHMENTS],
    /// Color attachment row pitches in bytes
    pub color_pitch_b: [i32; MAX_COLOR_ATTACHMENTS],
    /// Depth attachment base pointer
    pub depth_buffer: *mut u8,
    /// Depth row pitch in bytes
    pub depth_pitch_b: i32,
    /// Stencil attachment base pointer
    pub stencil_buffer: *mut u8,
    /// Stencil row pitch in bytes
    pub stencil_pitch_b: i32,

    /// Scissor bounds: x ∈ [x0, x1), y ∈ [y0, y1)
    pub scissor_x0: i32,
    /// See `scissor_x0`
    pub scissor_x1: i32,
    /// See `scissor_x0`
    pub scissor_y0: i32,
    /// See `scissor_x0`
    pub scissor_y1: i32,

    /// Per-cluster occlusion sample counters
    pub occlusion: [u32; CLUSTER_COUNT],
}

// DrawData is written once by the submitting thread and then only read by
// workers (apart from the per-cluster counters, which are exclusively owned).
unsafe impl Send for DrawData {}
unsafe impl Sync for DrawData {}

impl Default for DrawData {
    fn default() -> Self {
        Self {
            input: [VertexInputStream::default(); MAX_VERTEX_INPUTS],
            indices: std::ptr::null(),
            instance_id: 0,
            base_vertex: 0,
            push_constants: [0; PUSH_CONSTANT_BYTES],
            image_descriptors: [EMPTY_DESCRIPTOR; MAX_IMAGE_BINDINGS],
            viewport_scale: [0.0; 2],
            viewport_offset: [0.0; 2],
            half_pixel: [0.0; 2],
            depth_near: 0.0,
            depth_range: 1.0,
            slope_depth_bias: 0.0,
            line_width: 1.0,
            stencil_front: StencilData::default(),
            stencil_back: StencilData::default(),
            a2c: [0.0; 4],
            color_buffer: [std::ptr::null_mut(); MAX_COLOR_ATTACHMENTS],
            color_pitch_b: [0; MAX_COLOR_ATTACHMENTS],
            depth_buffer: std::ptr::null_mut(),
            depth_pitch_b: 0,
            stencil_buffer: std::ptr::null_mut(),
            stencil_pitch_b: 0,
            scissor_x0: 0,
            scissor_x1: 0,
            scissor_y0: 0,
            scissor_y1: 0,
            occlusion: [0; CLUSTER_COUNT],
        }
    }
}

const EMPTY_DESCRIPTOR: SampledImageDescriptor = SampledImageDescriptor {
    base: std::ptr::null(),
    width: 0,
    height: 0,
    depth: 0,
    mip_levels: 0,
    array_layers: 0,
    layer_pitch: 0,
    level_offset: [0; crate::pipeline::constants::MAX_MIP_LEVELS],
    row_pitch: [0; crate::pipeline::constants::MAX_MIP_LEVELS],
    slice_pitch: [0; crate::pipeline::constants::MAX_MIP_LEVELS],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_cache_clear_invalidates_tags() {
        let mut cache = VertexCache::default();
        cache.tags[3] = 17;
        cache.clear();
        assert!(cache.tags.iter().all(|&t| t == u32::MAX));
    }

    #[test]
    fn test_polygon_from_slice() {
        let p = Polygon::from_slice(&[[0.0, 0.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0], [
            0.0, 1.0, 0.0, 1.0,
        ]]);
        assert_eq!(p.vertices().len(), 3);
    }
}
