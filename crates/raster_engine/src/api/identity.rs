//! Identity registries for sampled resources
//!
//! Sampling-routine cache keys and pixel state keys carry the identity of
//! the image view and sampler they were generated against. Identities are
//! versioned slot-map keys allocated at resource creation and released on
//! drop, so a key can never alias a later resource that happens to reuse
//! the same slot — the version bump keeps stale cache entries distinct.

use slotmap::{new_key_type, SlotMap};
use std::sync::{Mutex, OnceLock};

new_key_type! {
    /// Identity of a live image view
    pub struct ImageViewKey;
    /// Identity of a live sampler description
    pub struct SamplerKey;
}

fn image_views() -> &'static Mutex<SlotMap<ImageViewKey, ()>> {
    static REGISTRY: OnceLock<Mutex<SlotMap<ImageViewKey, ()>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(SlotMap::with_key()))
}

fn samplers() -> &'static Mutex<SlotMap<SamplerKey, ()>> {
    static REGISTRY: OnceLock<Mutex<SlotMap<SamplerKey, ()>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(SlotMap::with_key()))
}

pub(crate) fn allocate_image_view() -> ImageViewKey {
    image_views().lock().unwrap().insert(())
}

pub(crate) fn release_image_view(key: ImageViewKey) {
    image_views().lock().unwrap().remove(key);
}

pub(crate) fn allocate_sampler() -> SamplerKey {
    samplers().lock().unwrap().insert(())
}

pub(crate) fn release_sampler(key: SamplerKey) {
    samplers().lock().unwrap().remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_slots_never_alias() {
        let first = allocate_image_view();
        release_image_view(first);
        let second = allocate_image_view();
        // Even if the slot is reused, the version differs.
        assert_ne!(first, second);
        release_image_view(second);
    }
}
