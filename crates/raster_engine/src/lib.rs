//! # Raster Engine
//!
//! A software implementation of a Vulkan-style graphics pipeline. Draw calls
//! referencing shader programs, vertex data, and render targets are executed
//! entirely on the CPU: pipeline state is lowered to native SIMD machine code
//! by a reactive IR layer, compiled routines are cached per state key, and a
//! parallel scheduler batches primitives across worker threads.
//!
//! ## Architecture
//!
//! - **Reactor**: typed expression IR with SIMD vector types, two JIT
//!   backends, and coroutine support for staged code emission
//! - **Pipeline**: vertex / setup / pixel program generators plus the
//!   texel codec and sampler generator they share
//! - **Device**: the draw-call scheduler, clipper, and routine caches
//! - **Api**: the narrow contracts external collaborators must satisfy
//!   (buffers, image views, descriptor sets, queries, fences)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use raster_engine::prelude::*;
//!
//! fn main() -> Result<(), EngineError> {
//!     let config = RendererConfig::default();
//!     let renderer = Renderer::new(&config)?;
//!     // Bind a context, then renderer.draw(...) and renderer.synchronize().
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod foundation;
pub mod task;
pub mod reactor;
pub mod pipeline;
pub mod device;
pub mod api;

mod config;

pub use config::{BackendKind, ConfigError, RendererConfig};
pub use device::renderer::Renderer;

use thiserror::Error;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Renderer construction failed
    #[error("renderer initialization failed: {0}")]
    InitializationFailed(String),
    /// Configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        api::{Buffer, DescriptorSet, Fence, ImageView, Query, TaskEvents},
        config::{BackendKind, RendererConfig},
        device::context::Context,
        device::renderer::Renderer,
        pipeline::shader::ShaderModule,
        EngineError,
    };
}
