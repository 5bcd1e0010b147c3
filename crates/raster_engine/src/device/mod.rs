//! Device layer: draw execution
//!
//! Hosts the draw-call scheduler, the clipper and primitive assembly, the
//! per-stage processors with their routine caches, and the plain-old-data
//! records shared between host code and generated routines.

pub mod clipper;
pub mod context;
pub mod pixel_processor;
pub mod primitive;
pub mod renderer;
pub mod setup_processor;
pub mod vertex_processor;

/// XOR-folds a POD state record into its 32-bit hash word.
/// Collisions are resolved by full equality comparison at lookup.
pub(crate) fn state_hash<T: bytemuck::Pod>(states: &T) -> u32 {
    bytemuck::bytes_of(states)
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .fold(0, |hash, word| hash ^ word)
}
