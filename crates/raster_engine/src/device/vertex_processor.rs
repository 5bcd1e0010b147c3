//! Vertex stage: state distillation and routine cache
//!
//! `update` packs every pipeline-state bit that affects generated vertex code
//! into a [`VertexState`]; `routine` resolves it through the per-stage LRU
//! cache, generating on miss. Equal states are guaranteed to produce
//! observationally identical routines, so sharing is purely an optimization.

use super::context::Context;
use super::state_hash;
use crate::foundation::cache::{CacheStats, SyncCache};
use crate::pipeline::constants::MAX_VERTEX_INPUTS;
use crate::pipeline::shader::ShaderModule;
use crate::pipeline::vertex_program;
use crate::reactor::backend::{BuildError, BuildOptions};
use crate::reactor::Routine;
use ash::vk;
use bytemuck::Zeroable;
use std::sync::Arc;

/// The hashed portion of the vertex state key. Unused fields stay zero so
/// equal configurations pack identically.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VertexStates {
    /// Shader identity
    pub shader_id: u64,
    /// Pipeline layout identity
    pub pipeline_layout_id: u32,
    /// Robust vertex fetch clamping
    pub robust_buffer_access: u32,
    /// Point-list topology (affects point-size plumbing)
    pub is_point: u32,
    /// Keeps the record padding-free
    pub reserved: u32,
    /// Attribute format per input stream (raw `vk::Format`)
    pub input_format: [i32; MAX_VERTEX_INPUTS],
}

/// Vertex state key with its precomputed hash
#[derive(Debug, Clone, Copy)]
pub struct VertexState {
    /// The hashed record
    pub states: VertexStates,
    /// XOR hash of `states`, kept in sync by construction
    pub hash: u32,
}

impl PartialEq for VertexState {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.states == other.states
    }
}

impl Eq for VertexState {}

impl std::hash::Hash for VertexState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// Vertex processor: distillation plus the stage routine cache
pub struct VertexProcessor {
    cache: SyncCache<VertexState, Arc<Routine>>,
}

impl VertexProcessor {
    /// Creates the processor with an LRU cache of `cache_size` routines,
    /// clamped to a sane range.
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: SyncCache::lru(cache_size.clamp(1, 65536)),
        }
    }

    /// Distills the context into the vertex state key
    pub fn update(context: &Context) -> VertexState {
        let mut states = VertexStates::zeroed();
        states.shader_id = context.vertex_shader.identifier();
        states.pipeline_layout_id = context.pipeline_layout.identifier();
        states.robust_buffer_access = u32::from(context.robust_buffer_access);
        states.is_point = u32::from(context.topology == vk::PrimitiveTopology::POINT_LIST);

        for (index, stream) in context.input.iter().enumerate() {
            if (index as u8) < context.vertex_shader.input_count {
                states.input_format[index] = stream.format.as_raw();
            }
        }

        VertexState {
            hash: state_hash(&states),
            states,
        }
    }

    /// Resolves the routine for `state`, building it at most once
    pub fn routine(
        &self,
        state: &VertexState,
        shader: &ShaderModule,
        options: &BuildOptions,
    ) -> Result<Arc<Routine>, BuildError> {
        self.cache
            .get_or_create(state, || vertex_program::generate(state, shader, options))
    }

    /// Cache hit/miss counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::shader::ShaderModule;

    fn test_context() -> Context {
        let shader = Arc::new(ShaderModule::new(vec![], 0, 0, 0));
        Context::new(shader)
    }

    #[test]
    fn test_update_is_idempotent() {
        let context = test_context();
        let a = VertexProcessor::update(&context);
        let b = VertexProcessor::update(&context);
        assert_eq!(a, b);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_different_shaders_produce_different_keys() {
        let a = VertexProcessor::update(&test_context());
        let b = VertexProcessor::update(&test_context());
        assert_ne!(a, b); // fresh shader identity per context
    }

    #[test]
    fn test_hash_mismatch_implies_key_mismatch() {
        let a = VertexProcessor::update(&test_context());
        let b = VertexProcessor::update(&test_context());
        if a.hash != b.hash {
            assert_ne!(a, b);
        }
    }
}
