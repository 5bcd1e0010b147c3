//! Shader intermediate form
//!
//! Draws reference shaders in a small typed op list over vec4 registers —
//! the already-parsed equivalent of a SPIR-V module. Each op reads up to
//! three swizzled sources and writes a masked destination. The vertex and
//! pixel program generators walk this list to emit reactor IR; there is no
//! textual front end.

use crate::pipeline::constants::{MAX_VARYINGS, MAX_VERTEX_INPUTS};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity swizzle `.xyzw`
pub const XYZW: [u8; 4] = [0, 1, 2, 3];

/// Write mask covering all four components
pub const WRITE_ALL: u8 = 0b1111;

/// Values a source operand can read
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Src {
    /// Temporary register
    Temp(u8),
    /// Stage input: vertex attribute or interpolated varying
    Input(u8),
    /// Inline literal
    Constant([f32; 4]),
    /// vec4 slot of the push-constant block
    PushConstant(u8),
    /// Stage builtin
    Builtin(Builtin),
}

/// Builtin inputs available to shaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Instance index of the current draw, replicated to all components
    InstanceIndex,
    /// Window-space fragment coordinate (pixel stage only)
    FragCoord,
}

/// A swizzled source operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    /// Where the value comes from
    pub src: Src,
    /// Component selection applied on read
    pub swizzle: [u8; 4],
}

impl Operand {
    /// Reads a source with the identity swizzle
    pub fn new(src: Src) -> Self {
        Self { src, swizzle: XYZW }
    }

    /// Reads a source with an explicit swizzle
    pub fn swizzled(src: Src, swizzle: [u8; 4]) -> Self {
        Self { src, swizzle }
    }
}

/// Where an op writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst {
    /// Temporary register
    Temp(u8),
    /// Stage output slot
    Output(OutputSlot),
}

/// Stage output slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    /// Clip-space position (vertex stage)
    Position,
    /// Point size (vertex stage, component x)
    PointSize,
    /// Interpolated varying `n`
    Varying(u8),
    /// Color attachment `n` (pixel stage)
    Color(u8),
}

/// Shader operations; all are componentwise over vec4 registers unless noted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// `dst = a`
    Mov,
    /// `dst = a + b`
    Add,
    /// `dst = a - b`
    Sub,
    /// `dst = a * b`
    Mul,
    /// `dst = a / b`
    Div,
    /// `dst = min(a, b)`
    Min,
    /// `dst = max(a, b)`
    Max,
    /// `dst = a * b + c`
    Mad,
    /// `dst = sqrt(a)`
    Sqrt,
    /// `dst = 1 / a`
    Rcp,
    /// `dst = 1 / sqrt(a)`
    Rsq,
    /// 3-component dot product, replicated to all written components
    Dot3,
    /// 4-component dot product, replicated to all written components
    Dot4,
    /// Sample the combined image sampler at descriptor binding `binding`
    /// using components xy(z) of source `a` as coordinates (pixel stage)
    Sample {
        /// Descriptor binding index within set 0
        binding: u8,
    },
}

/// One instruction of the op list
#[derive(Debug, Clone)]
pub struct ShaderOp {
    /// Operation
    pub op: OpCode,
    /// Destination register
    pub dst: Dst,
    /// Component write mask (bit `c` enables component `c`)
    pub mask: u8,
    /// Source operands; arity fixed by `op`
    pub srcs: Vec<Operand>,
}

static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

/// A complete shader for one stage
#[derive(Debug, Clone)]
pub struct ShaderModule {
    id: u64,
    /// Instruction list, executed in order
    pub ops: Vec<ShaderOp>,
    /// Number of temporary registers used
    pub temp_count: u8,
    /// Number of inputs read (attributes or varyings)
    pub input_count: u8,
    /// Number of varyings the stage writes (vertex) or expects (pixel)
    pub varying_count: u8,
}

impl ShaderModule {
    /// Creates a shader from an op list. Register indices are validated
    /// eagerly; out-of-range indices are programmer errors.
    pub fn new(ops: Vec<ShaderOp>, temp_count: u8, input_count: u8, varying_count: u8) -> Self {
        assert!(input_count as usize <= MAX_VERTEX_INPUTS);
        assert!(varying_count as usize <= MAX_VARYINGS);
        for op in &ops {
            let arity = match op.op {
                OpCode::Mov
                | OpCode::Sqrt
                | OpCode::Rcp
                | OpCode::Rsq
                | OpCode::Sample { .. } => 1,
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Min
                | OpCode::Max
                | OpCode::Dot3
                | OpCode::Dot4 => 2,
                OpCode::Mad => 3,
            };
            assert_eq!(op.srcs.len(), arity, "wrong operand count for {:?}", op.op);
            for operand in &op.srcs {
                match operand.src {
                    Src::Temp(r) => assert!(r < temp_count),
                    Src::Input(i) => assert!(i < input_count),
                    Src::PushConstant(slot) => assert!((slot as usize) < 8),
                    Src::Constant(_) | Src::Builtin(_) => {}
                }
                assert!(operand.swizzle.iter().all(|&c| c < 4));
            }
            match op.dst {
                Dst::Temp(r) => assert!(r < temp_count),
                Dst::Output(OutputSlot::Varying(v)) => assert!(v < varying_count),
                Dst::Output(_) => {}
            }
        }
        Self {
            id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
            ops,
            temp_count,
            input_count,
            varying_count,
        }
    }

    /// Stable identity used in state keys; two modules compare equal only if
    /// they are the same object.
    pub fn identifier(&self) -> u64 {
        self.id
    }

    /// Descriptor bindings sampled by this shader, deduplicated
    pub fn sampled_bindings(&self) -> Vec<u8> {
        let mut bindings: Vec<u8> = self
            .ops
            .iter()
            .filter_map(|op| match op.op {
                OpCode::Sample { binding } => Some(binding),
                _ => None,
            })
            .collect();
        bindings.sort_unstable();
        bindings.dedup();
        bindings
    }

    /// Whether any op samples a texture
    pub fn samples_images(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op.op, OpCode::Sample { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_unique() {
        let a = ShaderModule::new(vec![], 0, 0, 0);
        let b = ShaderModule::new(vec![], 0, 0, 0);
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn test_sampled_bindings_deduplicate() {
        let op = |binding| ShaderOp {
            op: OpCode::Sample { binding },
            dst: Dst::Temp(0),
            mask: WRITE_ALL,
            srcs: vec![Operand::new(Src::Input(0))],
        };
        let shader = ShaderModule::new(vec![op(2), op(1), op(2)], 1, 1, 1);
        assert_eq!(shader.sampled_bindings(), vec![1, 2]);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_register_panics() {
        let op = ShaderOp {
            op: OpCode::Mov,
            dst: Dst::Temp(3),
            mask: WRITE_ALL,
            srcs: vec![Operand::new(Src::Temp(0))],
        };
        let _ = ShaderModule::new(vec![op], 1, 0, 0);
    }
}
