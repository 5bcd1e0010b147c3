//! Pipeline code generation
//!
//! The three stage-program generators (vertex, setup, pixel) consume a
//! distilled state key plus a [`shader::ShaderModule`] and emit a reactor
//! function with a fixed ABI. The texel codec and sampler generator are
//! shared between the pixel stage and standalone image operations.

pub mod constants;
pub mod pixel_program;
pub mod sampler;
pub mod setup_program;
pub mod shader;
pub mod texel;
pub mod vertex_program;
