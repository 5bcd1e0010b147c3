//! Reactor: the JIT code-generation layer
//!
//! Stage programs and the sampler generator describe their work as a typed
//! expression graph over scalar and 4-wide SIMD values, then lower it to
//! native x86-64 machine code. Two backends share one instruction encoder:
//! the optimizing backend runs a pass pipeline before lowering, the direct
//! backend trades code quality for build latency. Both produce ABI-identical
//! entry points.
//!
//! Values are opaque handles into the function's instruction arena; type
//! mismatches while building are programmer errors and panic at construction
//! time. Backend failures (page allocation, unresolved symbols, unsupported
//! configurations) surface as [`BuildError`].

pub mod backend;
pub mod builder;
pub mod coroutine;
pub mod ir;
pub mod passes;
pub mod routine;

mod x86;

pub use backend::{build, BuildError, BuildOptions, OptLevel};
pub use builder::{FunctionBuilder, Var};
pub use ir::{CmpOp, FCmpOp, Function, MemType, Type, Value};
pub use routine::Routine;
