//! Descriptor-set contract

use super::buffer::Buffer;
use super::identity::{self, SamplerKey};
use super::image::ImageView;
use ash::vk;
use std::sync::Arc;

/// Shared ownership of a sampler's registry slot; the identity is released
/// when the last clone of the owning description drops.
#[derive(Debug)]
struct SamplerIdentity {
    key: SamplerKey,
}

impl SamplerIdentity {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            key: identity::allocate_sampler(),
        })
    }
}

impl Drop for SamplerIdentity {
    fn drop(&mut self) {
        identity::release_sampler(self.key);
    }
}

/// Distilled sampler create-info, the fields that select generated code
#[derive(Debug, Clone)]
pub struct SamplerDesc {
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Mip selection mode
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Addressing for coordinate u
    pub address_mode_u: vk::SamplerAddressMode,
    /// Addressing for coordinate v
    pub address_mode_v: vk::SamplerAddressMode,
    /// Addressing for coordinate w
    pub address_mode_w: vk::SamplerAddressMode,
    /// LOD bias added to the computed level of detail
    pub mip_lod_bias: f32,
    /// Whether anisotropic filtering is requested
    pub anisotropy_enable: bool,
    /// Requested anisotropy ceiling
    pub max_anisotropy: f32,
    /// Whether depth-compare sampling is enabled
    pub compare_enable: bool,
    /// Depth-compare operator
    pub compare_op: vk::CompareOp,
    /// Level-of-detail clamp, lower bound
    pub min_lod: f32,
    /// Level-of-detail clamp, upper bound
    pub max_lod: f32,
    /// Border color for `CLAMP_TO_BORDER` addressing
    pub border_color: vk::BorderColor,
    /// Whether the sampler's YCbCr conversion is plain RGB identity
    pub ycbcr_rgb_identity: bool,
    identity: Arc<SamplerIdentity>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            compare_enable: false,
            compare_op: vk::CompareOp::ALWAYS,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            ycbcr_rgb_identity: true,
            identity: SamplerIdentity::new(),
        }
    }
}

impl SamplerDesc {
    /// Unique identity for sampling-routine cache keys, shared by clones
    pub fn id(&self) -> SamplerKey {
        self.identity.key
    }
}

/// One bound resource
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// A buffer resource with an element stride
    Buffer {
        /// The bound buffer
        buffer: Buffer,
        /// Element stride in bytes
        stride: u32,
    },
    /// A combined image sampler
    Image {
        /// The sampled view
        view: Arc<ImageView>,
        /// The sampler state
        sampler: SamplerDesc,
    },
}

/// An array of opaque handles indexable by binding
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    bindings: Vec<Option<Descriptor>>,
}

impl DescriptorSet {
    /// Creates an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a descriptor at `binding`
    pub fn bind(&mut self, binding: u32, descriptor: Descriptor) {
        let index = binding as usize;
        if index >= self.bindings.len() {
            self.bindings.resize(index + 1, None);
        }
        self.bindings[index] = Some(descriptor);
    }

    /// Resolves a binding
    pub fn get(&self, binding: u32) -> Option<&Descriptor> {
        self.bindings.get(binding as usize)?.as_ref()
    }

    /// Resolves a binding expecting a combined image sampler
    pub fn image_at(&self, binding: u32) -> Option<(&Arc<ImageView>, &SamplerDesc)> {
        match self.get(binding)? {
            Descriptor::Image { view, sampler } => Some((view, sampler)),
            Descriptor::Buffer { .. } => None,
        }
    }
}
