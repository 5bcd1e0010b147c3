//! Pixel stage: state distillation, routine cache, and the device-level
//! sampling-routine cache
//!
//! The pixel state key is the largest of the three: attachment formats,
//! blend and depth/stencil state, and the identity of every sampled
//! image/sampler pair all select generated code. Sampling sub-routines are
//! cached per `(instruction, sampler, image view)` in an unbounded device
//! cache so distinct pixel shaders share them.

use super::context::Context;
use super::state_hash;
use crate::api::{DescriptorSet, ImageViewKey, SamplerKey};
use crate::foundation::cache::{CacheStats, SyncCache};
use crate::pipeline::constants::{MAX_COLOR_ATTACHMENTS, MAX_IMAGE_BINDINGS};
use crate::pipeline::pixel_program;
use crate::pipeline::sampler::{
    emit_sampler_routine, update_sampler_state, ImageInstruction, SamplerMethod,
};
use crate::pipeline::shader::ShaderModule;
use crate::reactor::backend::{BuildError, BuildOptions};
use crate::reactor::Routine;
use ash::vk;
use bytemuck::Zeroable;
use slotmap::Key;
use std::sync::Arc;

/// Per-attachment blend key
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlendKey {
    /// Blend enable
    pub enable: u32,
    /// Raw `vk::BlendFactor`
    pub src_factor: u32,
    /// Raw `vk::BlendFactor`
    pub dst_factor: u32,
    /// Raw `vk::BlendOp`
    pub op: u32,
    /// Raw `vk::BlendFactor`
    pub src_alpha_factor: u32,
    /// Raw `vk::BlendFactor`
    pub dst_alpha_factor: u32,
    /// Raw `vk::BlendOp`
    pub alpha_op: u32,
    /// Component write mask
    pub write_mask: u32,
}

/// Per-face stencil key
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StencilKey {
    /// Raw `vk::StencilOp`
    pub fail_op: u32,
    /// Raw `vk::StencilOp`
    pub pass_op: u32,
    /// Raw `vk::StencilOp`
    pub depth_fail_op: u32,
    /// Raw `vk::CompareOp`
    pub compare_op: u32,
}

/// The hashed portion of the pixel state key
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PixelStates {
    /// Shader identity
    pub shader_id: u64,
    /// Pipeline layout identity
    pub pipeline_layout_id: u32,
    /// Varyings interpolated for the shader
    pub varying_count: u32,
    /// Attachment formats (raw `vk::Format`, `UNDEFINED` when absent)
    pub color_format: [i32; MAX_COLOR_ATTACHMENTS],
    /// Per-attachment blend state
    pub blend: [BlendKey; MAX_COLOR_ATTACHMENTS],
    /// Depth attachment format (`UNDEFINED` when absent)
    pub depth_format: i32,
    /// Depth test enable
    pub depth_test: u32,
    /// Depth write enable
    pub depth_write: u32,
    /// Raw `vk::CompareOp` for depth
    pub depth_compare: u32,
    /// Stencil test enable
    pub stencil_enable: u32,
    /// Stencil attachment format
    pub stencil_format: i32,
    /// Front-face stencil ops
    pub front_stencil: StencilKey,
    /// Back-face stencil ops
    pub back_stencil: StencilKey,
    /// Occlusion counting enabled for this draw
    pub occlusion: u32,
    /// Alpha-to-coverage enabled
    pub alpha_to_coverage: u32,
    /// Rasterization sample count
    pub sample_count: u32,
    /// Keeps the record padding-free
    pub reserved: u32,
    /// Versioned identity of each sampled binding's image view
    pub binding_views: [u64; MAX_IMAGE_BINDINGS],
    /// Versioned identity of each sampled binding's sampler
    pub binding_samplers: [u64; MAX_IMAGE_BINDINGS],
}

/// Pixel state key with its precomputed hash
#[derive(Debug, Clone, Copy)]
pub struct PixelState {
    /// The hashed record
    pub states: PixelStates,
    /// XOR hash of `states`
    pub hash: u32,
}

impl PartialEq for PixelState {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.states == other.states
    }
}

impl Eq for PixelState {}

impl std::hash::Hash for PixelState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl PixelState {
    /// Whether any stencil work is generated
    pub fn stencil_active(&self) -> bool {
        self.states.stencil_enable != 0
    }

    /// Whether occlusion counters are updated
    pub fn occlusion_enabled(&self) -> bool {
        self.states.occlusion != 0
    }
}

/// Key of the device-level sampling-routine cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplingKey {
    /// Call-site identity
    pub instruction: ImageInstruction,
    /// Sampler identity
    pub sampler: SamplerKey,
    /// Image-view identity
    pub image_view: ImageViewKey,
}

/// Unbounded `(instruction, sampler, view) → routine` cache shared by every
/// pixel program of the device
pub struct SamplingRoutineCache {
    cache: SyncCache<SamplingKey, Arc<Routine>>,
}

impl Default for SamplingRoutineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingRoutineCache {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self {
            cache: SyncCache::unbounded(),
        }
    }

    /// Resolves a sampling routine, building it at most once per key
    pub fn get_or_create(
        &self,
        key: SamplingKey,
        descriptor_set: &DescriptorSet,
        binding: u32,
        options: &BuildOptions,
    ) -> Result<Arc<Routine>, BuildError> {
        self.cache.get_or_create(&key, || {
            let (view, sampler) = descriptor_set.image_at(binding).ok_or_else(|| {
                BuildError::InvalidState(format!(
                    "binding {binding} is not a combined image sampler"
                ))
            })?;
            let state = update_sampler_state(key.instruction, view.identifier(), Some(sampler));
            emit_sampler_routine(key.instruction, &state, options)
        })
    }

    /// Drops every cached routine; safe once `synchronize()` has drained
    /// outstanding draws.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Cache hit/miss counters
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Pixel processor: distillation plus the stage routine cache
pub struct PixelProcessor {
    cache: SyncCache<PixelState, Arc<Routine>>,
}

impl PixelProcessor {
    /// Creates the processor with an LRU cache of `cache_size` routines
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: SyncCache::lru(cache_size.clamp(1, 65536)),
        }
    }

    /// Distills the context into the pixel state key. `occlusion` reflects
    /// whether any occlusion query is attached to the renderer.
    pub fn update(context: &Context, occlusion: bool) -> PixelState {
        let mut states = PixelStates::zeroed();
        if let Some(shader) = &context.pixel_shader {
            states.shader_id = shader.identifier();
            states.varying_count = u32::from(shader.varying_count);

            for (slot, binding) in shader.sampled_bindings().into_iter().enumerate() {
                if slot >= MAX_IMAGE_BINDINGS {
                    break;
                }
                if let Some((view, sampler)) = context.descriptor_set.image_at(u32::from(binding))
                {
                    states.binding_views[slot] = view.id().data().as_ffi();
                    states.binding_samplers[slot] = sampler.id().data().as_ffi();
                }
            }
        }
        states.pipeline_layout_id = context.pipeline_layout.identifier();

        for (index, target) in context.color_targets.iter().enumerate() {
            states.color_format[index] = target
                .as_ref()
                .map_or(vk::Format::UNDEFINED.as_raw(), |t| t.desc().format.as_raw());
            let blend = &context.blend[index];
            states.blend[index] = BlendKey {
                enable: u32::from(blend.enable),
                src_factor: blend.src_factor.as_raw() as u32,
                dst_factor: blend.dst_factor.as_raw() as u32,
                op: blend.op.as_raw() as u32,
                src_alpha_factor: blend.src_alpha_factor.as_raw() as u32,
                dst_alpha_factor: blend.dst_alpha_factor.as_raw() as u32,
                alpha_op: blend.alpha_op.as_raw() as u32,
                write_mask: blend.write_mask,
            };
        }

        states.depth_format = context
            .depth_target
            .as_ref()
            .map_or(vk::Format::UNDEFINED.as_raw(), |t| t.desc().format.as_raw());
        let depth_usable = context.depth_target.is_some();
        states.depth_test = u32::from(context.depth_test_enable && depth_usable);
        states.depth_write =
            u32::from(context.depth_write_enable && context.depth_test_enable && depth_usable);
        states.depth_compare = context.depth_compare_op.as_raw() as u32;

        let stencil_usable = context.stencil_target.is_some();
        states.stencil_enable = u32::from(context.stencil_test_enable && stencil_usable);
        states.stencil_format = context
            .stencil_target
            .as_ref()
            .map_or(vk::Format::UNDEFINED.as_raw(), |t| t.desc().format.as_raw());
        states.front_stencil = StencilKey {
            fail_op: context.front_stencil.fail_op.as_raw() as u32,
            pass_op: context.front_stencil.pass_op.as_raw() as u32,
            depth_fail_op: context.front_stencil.depth_fail_op.as_raw() as u32,
            compare_op: context.front_stencil.compare_op.as_raw() as u32,
        };
        states.back_stencil = StencilKey {
            fail_op: context.back_stencil.fail_op.as_raw() as u32,
            pass_op: context.back_stencil.pass_op.as_raw() as u32,
            depth_fail_op: context.back_stencil.depth_fail_op.as_raw() as u32,
            compare_op: context.back_stencil.compare_op.as_raw() as u32,
        };

        states.occlusion = u32::from(occlusion);
        states.alpha_to_coverage = u32::from(context.alpha_to_coverage);
        states.sample_count = context.sample_count;

        PixelState {
            hash: state_hash(&states),
            states,
        }
    }

    /// Resolves the routine for `state`, building it at most once. Sampling
    /// sub-routines are resolved through `sampling_cache` and captured by the
    /// pixel routine for its lifetime.
    pub fn routine(
        &self,
        state: &PixelState,
        shader: &ShaderModule,
        descriptor_set: &DescriptorSet,
        sampling_cache: &SamplingRoutineCache,
        options: &BuildOptions,
    ) -> Result<Arc<Routine>, BuildError> {
        self.cache.get_or_create(state, || {
            let mut samplers = Vec::new();
            for binding in shader.sampled_bindings() {
                if usize::from(binding) >= MAX_IMAGE_BINDINGS {
                    return Err(BuildError::InvalidState(format!(
                        "sampled binding {binding} exceeds the image binding limit"
                    )));
                }
                let (view, sampler) =
                    descriptor_set.image_at(u32::from(binding)).ok_or_else(|| {
                        BuildError::InvalidState(format!(
                            "pixel shader samples unbound binding {binding}"
                        ))
                    })?;
                let key = SamplingKey {
                    instruction: ImageInstruction {
                        method: SamplerMethod::Implicit,
                        out_of_bounds: crate::pipeline::sampler::OutOfBoundsBehavior::Nullify,
                        gather_component: 0,
                    },
                    sampler: sampler.id(),
                    image_view: view.id(),
                };
                let routine =
                    sampling_cache.get_or_create(key, descriptor_set, u32::from(binding), options)?;
                samplers.push((binding, routine));
            }
            pixel_program::generate(state, shader, &samplers, options)
        })
    }

    /// Cache hit/miss counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
