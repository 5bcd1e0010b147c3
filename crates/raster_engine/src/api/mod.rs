//! External collaborator contracts
//!
//! The renderer core deliberately does not model the full Vulkan object
//! lattice. These types are the narrow surface it requires of its
//! collaborators: buffers resolve to pointers, image views resolve to offset
//! pointers plus pitches and a compact identifier, descriptor sets index
//! opaque handles, queries count, and task events notify fences. Lifetime of
//! the underlying storage is the caller's responsibility and must exceed any
//! draw that references it.

pub mod buffer;
pub mod descriptor;
pub mod events;
pub mod fence;
pub mod identity;
pub mod image;
pub mod pipeline_cache;
pub mod query;

pub use buffer::Buffer;
pub use descriptor::{Descriptor, DescriptorSet, SamplerDesc};
pub use events::TaskEvents;
pub use fence::Fence;
pub use identity::{ImageViewKey, SamplerKey};
pub use image::{ImageView, SampledImageDescriptor};
pub use pipeline_cache::PipelineCacheHeader;
pub use query::{Query, QueryType};

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_LAYOUT_ID: AtomicU32 = AtomicU32::new(1);

/// Opaque pipeline-layout identity; factors into state keys without the core
/// interpreting its internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayout {
    id: u32,
}

impl PipelineLayout {
    /// Creates a layout with a fresh identity
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: NEXT_LAYOUT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identity used in state keys
    pub fn identifier(&self) -> u32 {
        self.id
    }
}
