//! Foundation utilities shared across the engine
//!
//! Small, dependency-free building blocks: bounded caches, executable memory
//! pages for the JIT, math aliases, and logging setup.

pub mod cache;
pub mod logging;
pub mod math;
pub mod memory;
