//! Fixed pipeline limits
//!
//! Build-time constants sizing batches, staging buffers, and interface
//! registers. These feed both host-side records and generated code, so they
//! live in one place.

/// Primitives per batch at single-sample rendering
pub const BATCH_SIZE: usize = 128;

/// Horizontal pixel-work stripes per batch
pub const CLUSTER_COUNT: usize = 4;

/// Maximum `BatchData` records concurrently borrowed by one draw
pub const MAX_BATCH_INSTANCES: usize = 16;

/// Vertex input streams addressable by a shader
pub const MAX_VERTEX_INPUTS: usize = 16;

/// vec4 interpolants carried from vertex to pixel shading
pub const MAX_VARYINGS: usize = 8;

/// Color attachments addressable by one draw
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Upper bound on vertices a clipped polygon can reach
pub const MAX_CLIPPED_VERTICES: usize = 16;

/// Point size clamp upper bound
pub const MAX_POINT_SIZE: f32 = 1023.0;

/// Draws beyond this primitive count are rejected in debug builds
pub const MAX_PRIMITIVES: u32 = 1 << 21;

/// Slots in the per-batch direct-mapped vertex cache
pub const VERTEX_CACHE_SIZE: usize = 64;

/// Push-constant block size in bytes
pub const PUSH_CONSTANT_BYTES: usize = 128;

/// Mip levels a sampled image descriptor can describe
pub const MAX_MIP_LEVELS: usize = 16;

/// Combined image samplers addressable by one shader
pub const MAX_IMAGE_BINDINGS: usize = 4;

/// Default per-stage routine-cache capacity
pub const ROUTINE_CACHE_CAPACITY: usize = 1024;
