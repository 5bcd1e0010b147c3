//! Setup stage: state distillation and routine cache

use super::context::Context;
use super::state_hash;
use crate::foundation::cache::{CacheStats, SyncCache};
use crate::pipeline::setup_program;
use crate::reactor::backend::{BuildError, BuildOptions};
use crate::reactor::Routine;
use ash::vk;
use bytemuck::Zeroable;
use std::sync::Arc;

/// Primitive class the setup routine is specialized for
pub const KIND_TRIANGLE: u32 = 0;
/// See [`KIND_TRIANGLE`]
pub const KIND_LINE: u32 = 1;
/// See [`KIND_TRIANGLE`]
pub const KIND_POINT: u32 = 2;

/// The hashed portion of the setup state key
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SetupStates {
    /// Primitive class (`KIND_*`)
    pub kind: u32,
    /// Face culling (raw `vk::CullModeFlags` bits; triangles only)
    pub cull_mode: u32,
    /// Whether counter-clockwise winding is front-facing
    pub front_ccw: u32,
    /// Rasterization sample count
    pub multisample: u32,
    /// Whether rasterization is discarded after setup
    pub rasterizer_discard: u32,
    /// Whether slope-scaled depth bias is applied
    pub slope_depth_bias_used: u32,
    /// Varyings whose gradients the routine must produce
    pub varying_count: u32,
    /// Keeps the record padding-free
    pub reserved: u32,
}

/// Setup state key with its precomputed hash
#[derive(Debug, Clone, Copy)]
pub struct SetupState {
    /// The hashed record
    pub states: SetupStates,
    /// XOR hash of `states`
    pub hash: u32,
}

impl PartialEq for SetupState {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.states == other.states
    }
}

impl Eq for SetupState {}

impl std::hash::Hash for SetupState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl SetupState {
    /// Whether pixel work is skipped for draws in this state
    pub fn rasterizer_discard(&self) -> bool {
        self.states.rasterizer_discard != 0
    }
}

/// Setup processor: distillation plus the stage routine cache
pub struct SetupProcessor {
    cache: SyncCache<SetupState, Arc<Routine>>,
}

impl SetupProcessor {
    /// Creates the processor with an LRU cache of `cache_size` routines
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: SyncCache::lru(cache_size.clamp(1, 65536)),
        }
    }

    /// Distills the context into the setup state key
    pub fn update(context: &Context) -> SetupState {
        let mut states = SetupStates::zeroed();
        states.kind = if context.is_draw_triangle() {
            KIND_TRIANGLE
        } else if context.is_draw_line() {
            KIND_LINE
        } else {
            KIND_POINT
        };
        if context.is_draw_triangle() {
            states.cull_mode = context.cull_mode.as_raw();
        }
        states.front_ccw = u32::from(context.front_face == vk::FrontFace::COUNTER_CLOCKWISE);
        states.multisample = context.sample_count;
        states.rasterizer_discard = u32::from(context.rasterizer_discard);
        // The constant bias folds into the viewport constants; only the
        // slope term changes generated code.
        states.slope_depth_bias_used = u32::from(context.slope_depth_bias != 0.0);
        states.varying_count = u32::from(context.vertex_shader.varying_count);

        SetupState {
            hash: state_hash(&states),
            states,
        }
    }

    /// Resolves the routine for `state`, building it at most once
    pub fn routine(
        &self,
        state: &SetupState,
        options: &BuildOptions,
    ) -> Result<Arc<Routine>, BuildError> {
        self.cache
            .get_or_create(state, || setup_program::generate(state, options))
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

    #[test]
    fn test_update_classifies_topology() {
        let shader = Arc::new(ShaderModule::new(vec![], 0, 0, 0));
        let mut context = Context::new(shader);
        assert_eq!(SetupProcessor::update(&context).states.kind, KIND_TRIANGLE);
        context.topology = vk::PrimitiveTopology::LINE_STRIP;
        assert_eq!(SetupProcessor::update(&context).states.kind, KIND_LINE);
        context.topology = vk::PrimitiveTopology::POINT_LIST;
        assert_eq!(SetupProcessor::update(&context).states.kind, KIND_POINT);
    }

    #[test]
    fn test_cull_mode_ignored_for_points() {
        let shader = Arc::new(ShaderModule::new(vec![], 0, 0, 0));
        let mut context = Context::new(shader);
        context.topology = vk::PrimitiveTopology::POINT_LIST;
        context.cull_mode = vk::CullModeFlags::BACK;
        let state = SetupProcessor::update(&context);
        assert_eq!(state.states.cull_mode, 0);
    }
}
